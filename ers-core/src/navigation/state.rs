use std::fmt;

use serde::Serialize;

/// Portal navigation steps, in the only order they may be visited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NavState {
    Start,
    Authenticating,
    Authenticated,
    LocatingMeter,
    MeterLocated,
    SelectingPeriod,
    ExportTriggered,
    DownloadComplete,
    Done,
    Failed,
}

impl NavState {
    pub fn as_str(&self) -> &'static str {
        match self {
            NavState::Start => "start",
            NavState::Authenticating => "authenticating",
            NavState::Authenticated => "authenticated",
            NavState::LocatingMeter => "locating_meter",
            NavState::MeterLocated => "meter_located",
            NavState::SelectingPeriod => "selecting_period",
            NavState::ExportTriggered => "export_triggered",
            NavState::DownloadComplete => "download_complete",
            NavState::Done => "done",
            NavState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, NavState::Done | NavState::Failed)
    }

    fn rank(&self) -> u8 {
        match self {
            NavState::Start => 0,
            NavState::Authenticating => 1,
            NavState::Authenticated => 2,
            NavState::LocatingMeter => 3,
            NavState::MeterLocated => 4,
            NavState::SelectingPeriod => 5,
            NavState::ExportTriggered => 6,
            NavState::DownloadComplete => 7,
            NavState::Done => 8,
            NavState::Failed => u8::MAX,
        }
    }

    /// Forward moves only. `SelectingPeriod` may be skipped and any live
    /// state may fail.
    pub fn can_advance_to(&self, next: NavState) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            NavState::Failed => true,
            NavState::ExportTriggered => {
                matches!(self, NavState::MeterLocated | NavState::SelectingPeriod)
            }
            _ => next.rank() == self.rank() + 1,
        }
    }
}

impl fmt::Display for NavState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
