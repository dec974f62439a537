use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Why a report was created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorReportKind {
    BlockProbeFail,
    DiskProbeFail,
    InstallFail,
    Ui,
    Unknown,
}

impl ErrorReportKind {
    pub const ALL: [ErrorReportKind; 5] = [
        ErrorReportKind::BlockProbeFail,
        ErrorReportKind::DiskProbeFail,
        ErrorReportKind::InstallFail,
        ErrorReportKind::Ui,
        ErrorReportKind::Unknown,
    ];

    /// Name stored under `kind` in the metadata file.
    pub fn name(&self) -> &'static str {
        match self {
            ErrorReportKind::BlockProbeFail => "BLOCK_PROBE_FAIL",
            ErrorReportKind::DiskProbeFail => "DISK_PROBE_FAIL",
            ErrorReportKind::InstallFail => "INSTALL_FAIL",
            ErrorReportKind::Ui => "UI",
            ErrorReportKind::Unknown => "UNKNOWN",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            ErrorReportKind::BlockProbeFail => "Block device probe failure",
            ErrorReportKind::DiskProbeFail => "Disk probe failure",
            ErrorReportKind::InstallFail => "Install failure",
            ErrorReportKind::Ui => "Installer crash",
            ErrorReportKind::Unknown => "Unknown error",
        }
    }

    /// Resolve a stored name exactly as written; anything else is `Unknown`.
    pub fn from_meta(value: Option<&serde_json::Value>) -> Self {
        value
            .and_then(serde_json::Value::as_str)
            .and_then(|name| Self::ALL.into_iter().find(|kind| kind.name() == name))
            .unwrap_or(ErrorReportKind::Unknown)
    }
}

impl fmt::Display for ErrorReportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownKind(pub String);

impl fmt::Display for UnknownKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown report kind `{}`", self.0)
    }
}

impl std::error::Error for UnknownKind {}

impl FromStr for ErrorReportKind {
    type Err = UnknownKind;

    /// Accepts the stored name and its lower-case or dashed spellings.
    /// Only used for command line input; stored names go through `from_meta`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase().replace('-', "_");
        ErrorReportKind::ALL
            .into_iter()
            .find(|kind| kind.name() == normalized)
            .ok_or_else(|| UnknownKind(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorReportState {
    /// Created, not yet populated.
    Incomplete,
    /// Recovered from disk and waiting for (or in the middle of) its load.
    Loading,
    Done,
    ErrorGenerating,
    ErrorLoading,
}

impl ErrorReportState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorReportState::Incomplete => "INCOMPLETE",
            ErrorReportState::Loading => "LOADING",
            ErrorReportState::Done => "DONE",
            ErrorReportState::ErrorGenerating => "ERROR_GENERATING",
            ErrorReportState::ErrorLoading => "ERROR_LOADING",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ErrorReportState::Done
                | ErrorReportState::ErrorGenerating
                | ErrorReportState::ErrorLoading
        )
    }
}

impl fmt::Display for ErrorReportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
