//! One crash report and its lifecycle.
//!
//! A fresh report (`ErrorReport::new`) starts `INCOMPLETE` and is populated
//! once with [`ErrorReport::add_info`]. A report recovered from the store
//! (`ErrorReport::from_file`) starts `LOADING` and is parsed once with
//! [`ErrorReport::load`]. Both end in `DONE` or one of the error states, after
//! which the crash file handle is gone and a "changed" notification has fired.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{json, Value};
use tracing::{debug, error, info};

use crate::artifact::{
    ProblemReport, CRASH_DB, EXECUTABLE_TIMESTAMP, PACKAGE, PROC_MAPS, SOURCE_PACKAGE,
};
use crate::error::codes;
use crate::events::ReportChanged;
use crate::manager::ReportContext;
use crate::mounts::persistent_location;
use crate::runner::{Completion, Operation, Work};
use crate::{AppError, AppResult};

mod kind;
pub mod meta;

pub use kind::{ErrorReportKind, ErrorReportState, UnknownKind};
use meta::{read_meta, write_meta, Meta};

pub const CRASH_EXT: &str = "crash";
pub const META_EXT: &str = "meta";

const KIND_KEY: &str = "kind";
const SEEN_KEY: &str = "seen";

const DRY_RUN_LABEL: &str = "casper-rw";
const DRY_RUN_DIR: &str = "install-logs/2019-11-06.0/crash";

pub struct ErrorReport {
    ctx: Arc<ReportContext>,
    base: String,
    artifact: ProblemReport,
    state: ErrorReportState,
    file: Option<File>,
    in_flight: Option<Operation>,
    meta: Meta,
}

impl fmt::Debug for ErrorReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorReport")
            .field("base", &self.base)
            .field("state", &self.state)
            .field("in_flight", &self.in_flight)
            .field("meta", &self.meta)
            .finish()
    }
}

impl ErrorReport {
    /// Create `<base>.crash` and `<base>.meta` for a new failure of `kind`.
    pub fn new(ctx: &Arc<ReportContext>, kind: ErrorReportKind) -> AppResult<Self> {
        let (base, file) = create_crash_file(&ctx.crash_directory, kind)?;

        let mut artifact = ProblemReport::new_bug();
        artifact.insert(CRASH_DB, ctx.target.to_field())?;

        let mut report = Self {
            ctx: Arc::clone(ctx),
            base,
            artifact,
            state: ErrorReportState::Incomplete,
            file: Some(file),
            in_flight: None,
            meta: Meta::new(),
        };
        report.set_meta(KIND_KEY, kind.name())?;

        info!(
            target: "crashstore",
            event = "report_created",
            base = %report.base,
            kind = kind.name()
        );
        Ok(report)
    }

    /// Recover a report from an existing artifact. The load is not started.
    pub fn from_file(ctx: &Arc<ReportContext>, path: &Path) -> AppResult<Self> {
        let base = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .ok_or_else(|| {
                AppError::new("REPORT/BAD_PATH", "Crash file path has no file name")
                    .with_context("path", path.display().to_string())
            })?;
        let file = File::open(path).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "open_crash_file")
                .with_context("path", path.display().to_string())
        })?;

        let mut report = Self {
            ctx: Arc::clone(ctx),
            base,
            artifact: ProblemReport::unloaded(),
            state: ErrorReportState::Loading,
            file: Some(file),
            in_flight: None,
            meta: Meta::new(),
        };
        if let Some(meta) = read_meta(&report.meta_path())? {
            report.meta = meta;
        }
        Ok(report)
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn state(&self) -> ErrorReportState {
        self.state
    }

    pub fn artifact(&self) -> &ProblemReport {
        &self.artifact
    }

    pub fn meta(&self) -> &Meta {
        &self.meta
    }

    pub fn kind(&self) -> ErrorReportKind {
        ErrorReportKind::from_meta(self.meta.get(KIND_KEY))
    }

    pub fn seen(&self) -> bool {
        self.meta
            .get(SEEN_KEY)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Operation currently running in the background, if any.
    pub fn in_flight(&self) -> Option<Operation> {
        self.in_flight
    }

    /// True until the populate/load operation has completed.
    pub fn holds_file(&self) -> bool {
        self.file.is_some() || self.in_flight.is_some()
    }

    pub fn path(&self) -> PathBuf {
        self.path_with_ext(CRASH_EXT)
    }

    pub fn meta_path(&self) -> PathBuf {
        self.path_with_ext(META_EXT)
    }

    fn path_with_ext(&self, ext: &str) -> PathBuf {
        self.ctx
            .crash_directory
            .join(format!("{}.{}", self.base, ext))
    }

    /// Populate a fresh report: run `hook`, add the standard fields, apply the
    /// fixups for reading the report on another machine, and write it out.
    ///
    /// With `wait` the work runs on the calling thread and the report is in
    /// its final state when this returns. Failures of the work itself are
    /// reflected as `ERROR_GENERATING`; only misuse is returned as an error.
    pub fn add_info<H>(&mut self, hook: H, wait: bool) -> AppResult<()>
    where
        H: FnOnce(&mut ProblemReport) -> AppResult<()> + Send + 'static,
    {
        if self.state != ErrorReportState::Incomplete || self.in_flight.is_some() {
            return Err(self.rejected(codes::POPULATE_REJECTED, "Report cannot be populated"));
        }
        let Some(file) = self.file.take() else {
            return Err(self.rejected(codes::POPULATE_REJECTED, "Report has no open crash file"));
        };
        let artifact = std::mem::take(&mut self.artifact);
        let package = self.ctx.config.package_field();
        let source_package = self.ctx.config.installer_name.clone();

        let work: Work = Box::new(move |artifact: &mut ProblemReport, file: &mut File| {
            hook(artifact)?;
            artifact.add_standard_info()?;
            apply_portability_fixups(artifact, &package, &source_package)?;
            artifact.write_to(&mut *file)?;
            file.sync_all()?;
            Ok(())
        });

        debug!(
            target: "crashstore",
            event = "report_populate_started",
            base = %self.base,
            wait
        );
        if wait {
            let completion = self.ctx.runner.run_inline(
                self.base.clone(),
                Operation::Populate,
                artifact,
                file,
                work,
            );
            self.complete(completion);
        } else {
            self.in_flight = Some(Operation::Populate);
            self.ctx
                .runner
                .run(self.base.clone(), Operation::Populate, artifact, file, work);
        }
        Ok(())
    }

    /// Parse a recovered report in the background. Allowed exactly once.
    pub fn load(&mut self) -> AppResult<()> {
        if self.state != ErrorReportState::Loading || self.in_flight.is_some() {
            return Err(self.rejected(codes::LOAD_REJECTED, "Report cannot be loaded"));
        }
        let Some(file) = self.file.take() else {
            return Err(self.rejected(codes::LOAD_REJECTED, "Report has no open crash file"));
        };
        let artifact = std::mem::take(&mut self.artifact);

        debug!(target: "crashstore", event = "report_load_started", base = %self.base);
        self.in_flight = Some(Operation::Load);
        self.ctx.runner.run(
            self.base.clone(),
            Operation::Load,
            artifact,
            file,
            Box::new(|artifact: &mut ProblemReport, file: &mut File| {
                artifact.load_from(&mut *file)
            }),
        );
        Ok(())
    }

    /// Apply the outcome of a populate/load; always notifies once.
    pub(crate) fn complete(&mut self, completion: Completion) {
        let Completion {
            operation,
            artifact,
            result,
            ..
        } = completion;
        self.artifact = artifact;
        self.in_flight = None;
        self.file = None;

        self.state = match (operation, result) {
            (_, Ok(())) => ErrorReportState::Done,
            (Operation::Populate, Err(err)) => {
                error!(
                    target: "crashstore",
                    event = "report_populate_failed",
                    base = %self.base,
                    code = %err.code(),
                    error = %err
                );
                ErrorReportState::ErrorGenerating
            }
            (Operation::Load, Err(err)) => {
                error!(
                    target: "crashstore",
                    event = "report_load_failed",
                    base = %self.base,
                    code = %err.code(),
                    error = %err
                );
                ErrorReportState::ErrorLoading
            }
        };
        debug!(
            target: "crashstore",
            event = "report_operation_finished",
            base = %self.base,
            operation = operation.as_str(),
            state = self.state.as_str()
        );
        self.notify();
    }

    /// Update one metadata key and rewrite the metadata file.
    ///
    /// The in-memory copy only changes once the file has been written.
    pub fn set_meta(&mut self, key: &str, value: impl Into<Value>) -> AppResult<()> {
        if key == KIND_KEY && self.meta.contains_key(KIND_KEY) {
            return Err(
                AppError::new(codes::KIND_IMMUTABLE, "Report kind is already set")
                    .with_context("base", self.base.clone()),
            );
        }
        let mut updated = self.meta.clone();
        updated.insert(key.to_string(), value.into());
        write_meta(&self.meta_path(), &updated).map_err(|err| {
            AppError::new(codes::META_WRITE, "Report metadata could not be saved")
                .with_context("base", self.base.clone())
                .with_context("key", key)
                .with_cause(err)
        })?;
        self.meta = updated;
        Ok(())
    }

    pub fn mark_seen(&mut self) -> AppResult<()> {
        self.set_meta(SEEN_KEY, json!(true))?;
        self.notify();
        Ok(())
    }

    /// `(filesystem label, path on that filesystem)` of the crash file, when
    /// the store is its own mount of a labelled device.
    pub fn persistent_details(&self) -> (Option<String>, Option<String>) {
        let file_name = format!("{}.{}", self.base, CRASH_EXT);
        let directory = fs::canonicalize(&self.ctx.crash_directory)
            .unwrap_or_else(|_| self.ctx.crash_directory.clone());
        let found = fs::read_to_string(&self.ctx.mountinfo_path)
            .ok()
            .and_then(|mountinfo| {
                persistent_location(&mountinfo, &directory, &file_name, self.ctx.labels.as_ref())
            });
        match found {
            Some((label, path)) => (Some(label), Some(path)),
            None if self.ctx.config.dry_run => (
                Some(DRY_RUN_LABEL.to_string()),
                Some(format!("{DRY_RUN_DIR}/{file_name}")),
            ),
            None => (None, None),
        }
    }

    fn notify(&self) {
        self.ctx.subscribers.emit(&ReportChanged {
            base: self.base.clone(),
            state: self.state,
            seen: self.seen(),
        });
    }

    fn rejected(&self, code: &str, message: &str) -> AppError {
        AppError::new(code, message)
            .with_context("base", self.base.clone())
            .with_context("state", self.state.as_str())
    }
}

/// Make the report readable by tools running on a different machine.
fn apply_portability_fixups(
    artifact: &mut ProblemReport,
    package: &str,
    source_package: &str,
) -> AppResult<()> {
    artifact.insert(PACKAGE, package)?;
    artifact.insert(SOURCE_PACKAGE, source_package)?;
    // Both refer to this machine's executable and memory layout.
    artifact.remove(EXECUTABLE_TIMESTAMP);
    artifact.remove(PROC_MAPS);
    Ok(())
}

fn create_crash_file(directory: &Path, kind: ErrorReportKind) -> AppResult<(String, File)> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let (mut secs, mut nanos) = (now.as_secs(), now.subsec_nanos());
    let suffix = kind.name().to_ascii_lowercase();

    loop {
        let base = format!("{secs}.{nanos:09}.{suffix}");
        let path = directory.join(format!("{base}.{CRASH_EXT}"));
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => return Ok((base, file)),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                nanos += 1;
                if nanos >= 1_000_000_000 {
                    secs += 1;
                    nanos = 0;
                }
            }
            Err(err) => {
                return Err(AppError::from(err)
                    .with_context("operation", "create_crash_file")
                    .with_context("path", path.display().to_string()))
            }
        }
    }
}
