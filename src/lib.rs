//! Crash report store for the installer.
//!
//! A [`ReportManager`] owns the `<root>/var/crash` directory: it creates new
//! reports when something fails, recovers existing ones at startup and keeps
//! every report's lifecycle state and metadata up to date.

pub mod artifact;
pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod manager;
pub mod mounts;
pub mod report;
pub mod runner;
pub mod util;

pub use artifact::ProblemReport;
pub use config::{ManagerConfig, SubmissionTarget};
pub use error::{AppError, AppResult};
pub use events::{
    ChangeSink, ChannelChangeSink, RecordingChangeSink, ReportChanged, SilentChangeSink,
};
pub use logging::{flush_file_logs, init_file_logging, init_logging};
pub use manager::{ReportContext, ReportManager, ReportManagerBuilder};
pub use report::{ErrorReport, ErrorReportKind, ErrorReportState};
pub use runner::Operation;
