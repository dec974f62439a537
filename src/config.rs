use std::env;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub const ROOT_ENV: &str = "CRASHSTORE_ROOT";
pub const DRY_RUN_ENV: &str = "CRASHSTORE_DRY_RUN";
pub const REVISION_ENV: &str = "SNAP_REVISION";

/// Location of the report store below the installer state root.
pub const CRASH_SUBDIR: &str = "var/crash";

/// Settings fixed for the lifetime of a `ReportManager`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Installer state root; reports live under `<root>/var/crash`.
    pub root: PathBuf,
    pub dry_run: bool,
    /// Package name stamped into every populated artifact.
    pub installer_name: String,
    /// Revision stamped next to the package name.
    pub revision: String,
    pub crash_db: String,
    pub project: String,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/"),
            dry_run: false,
            installer_name: "subiquity".into(),
            revision: REVISION_ENV.into(),
            crash_db: "launchpad".into(),
            project: "subiquity".into(),
        }
    }
}

impl ManagerConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    /// Defaults overridden by `CRASHSTORE_ROOT`, `CRASHSTORE_DRY_RUN` and `SNAP_REVISION`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(root) = env::var_os(ROOT_ENV).filter(|value| !value.is_empty()) {
            config.root = PathBuf::from(root);
        }
        if let Ok(value) = env::var(DRY_RUN_ENV) {
            config.dry_run = parse_flag(&value);
        }
        if let Ok(revision) = env::var(REVISION_ENV) {
            if !revision.trim().is_empty() {
                config.revision = revision;
            }
        }
        config
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn crash_directory(&self) -> PathBuf {
        self.root.join(CRASH_SUBDIR)
    }

    /// Value written to the artifact's `Package` field.
    pub fn package_field(&self) -> String {
        format!("{} {}", self.installer_name, self.revision)
    }

    pub fn submission_target(&self) -> SubmissionTarget {
        SubmissionTarget {
            crash_db: self.crash_db.clone(),
            project: self.project.clone(),
            launchpad_instance: self.dry_run.then(|| "staging".to_string()),
        }
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Where a report would be filed; recorded verbatim in the artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionTarget {
    #[serde(rename = "impl")]
    pub crash_db: String,
    pub project: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub launchpad_instance: Option<String>,
}

impl SubmissionTarget {
    pub fn to_field(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| format!("{self:?}"))
    }
}
