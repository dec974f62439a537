use std::collections::VecDeque;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::{ManagerConfig, SubmissionTarget};
use crate::error::codes;
use crate::events::{ChangeSink, Subscribers};
use crate::mounts::{ByLabelDirectory, DeviceLabels, MOUNTINFO_PATH};
use crate::report::{ErrorReport, ErrorReportKind, CRASH_EXT};
use crate::runner::{Completion, Operation, TaskRunner};
use crate::{AppError, AppResult};

/// State every report shares with the manager that created it.
pub struct ReportContext {
    pub(crate) config: ManagerConfig,
    pub(crate) crash_directory: PathBuf,
    pub(crate) target: SubmissionTarget,
    pub(crate) runner: TaskRunner,
    pub(crate) subscribers: Subscribers,
    pub(crate) labels: Arc<dyn DeviceLabels>,
    pub(crate) mountinfo_path: PathBuf,
}

impl ReportContext {
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn crash_directory(&self) -> &PathBuf {
        &self.crash_directory
    }

    pub fn target(&self) -> &SubmissionTarget {
        &self.target
    }
}

pub struct ReportManagerBuilder {
    config: ManagerConfig,
    labels: Arc<dyn DeviceLabels>,
    mountinfo_path: PathBuf,
    sinks: Vec<Arc<dyn ChangeSink>>,
}

impl ReportManagerBuilder {
    pub fn device_labels(mut self, labels: Arc<dyn DeviceLabels>) -> Self {
        self.labels = labels;
        self
    }

    pub fn mountinfo_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.mountinfo_path = path.into();
        self
    }

    pub fn subscribe(mut self, sink: Arc<dyn ChangeSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn build(self, handle: Handle) -> ReportManager {
        let (runner, completions) = TaskRunner::new(handle);
        let subscribers = Subscribers::default();
        for sink in self.sinks {
            subscribers.subscribe(sink);
        }
        let ctx = ReportContext {
            crash_directory: self.config.crash_directory(),
            target: self.config.submission_target(),
            config: self.config,
            runner,
            subscribers,
            labels: self.labels,
            mountinfo_path: self.mountinfo_path,
        };
        ReportManager {
            ctx: Arc::new(ctx),
            completions,
            reports: Vec::new(),
            load_queue: VecDeque::new(),
            loading: None,
        }
    }
}

/// Owns the report store and every report in it, newest first.
///
/// All state transitions are applied on the thread that calls
/// [`next_completion`](Self::next_completion) or
/// [`process_completions`](Self::process_completions).
pub struct ReportManager {
    ctx: Arc<ReportContext>,
    completions: mpsc::UnboundedReceiver<Completion>,
    reports: Vec<ErrorReport>,
    load_queue: VecDeque<String>,
    loading: Option<String>,
}

impl ReportManager {
    pub fn builder(config: ManagerConfig) -> ReportManagerBuilder {
        ReportManagerBuilder {
            config,
            labels: Arc::new(ByLabelDirectory::default()),
            mountinfo_path: PathBuf::from(MOUNTINFO_PATH),
            sinks: Vec::new(),
        }
    }

    /// Manager bound to the tokio runtime the caller is running in.
    pub fn new(config: ManagerConfig) -> AppResult<Self> {
        let handle = Handle::try_current().map_err(|err| {
            AppError::new("RUNTIME/NO_REACTOR", "No tokio runtime is running")
                .with_context("error", err.to_string())
        })?;
        Ok(Self::builder(config).build(handle))
    }

    pub fn context(&self) -> &Arc<ReportContext> {
        &self.ctx
    }

    pub fn crash_directory(&self) -> &PathBuf {
        &self.ctx.crash_directory
    }

    pub fn subscribe(&self, sink: Arc<dyn ChangeSink>) {
        self.ctx.subscribers.subscribe(sink);
    }

    /// Create the store if needed and start loading what it already holds.
    pub fn start(&mut self) -> AppResult<()> {
        let dir = &self.ctx.crash_directory;
        fs::create_dir_all(dir).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "create_crash_dir")
                .with_context("path", dir.display().to_string())
        })?;
        self.scan_crash_dir()
    }

    /// Register every `*.crash` file newest first and chain their loads.
    ///
    /// Files whose base is already known to the manager are left alone, so
    /// scanning again only picks up reports that appeared since.
    pub fn scan_crash_dir(&mut self) -> AppResult<()> {
        let dir = self.ctx.crash_directory.clone();
        let entries = fs::read_dir(&dir).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "list_crash_dir")
                .with_context("path", dir.display().to_string())
        })?;

        let mut paths: Vec<PathBuf> = entries
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == CRASH_EXT))
            .collect();
        paths.sort_by(|a, b| b.file_name().cmp(&a.file_name()));

        let mut registered = 0usize;
        let mut skipped = 0usize;
        let mut known = 0usize;
        for path in paths {
            let already_known = path
                .file_stem()
                .is_some_and(|stem| self.get(&stem.to_string_lossy()).is_some());
            if already_known {
                known += 1;
                continue;
            }
            match ErrorReport::from_file(&self.ctx, &path) {
                Ok(report) => {
                    self.load_queue.push_back(report.base().to_string());
                    self.reports.push(report);
                    registered += 1;
                }
                Err(err) => {
                    skipped += 1;
                    warn!(
                        target: "crashstore",
                        event = "report_recovery_skipped",
                        path = %path.display(),
                        code = %err.code(),
                        error = %err
                    );
                }
            }
        }

        info!(
            target: "crashstore",
            event = "crash_dir_scanned",
            path = %dir.display(),
            registered,
            skipped,
            known
        );
        self.start_next_load();
        Ok(())
    }

    /// Create a report for a new failure; the caller populates it next.
    pub fn create_report(&mut self, kind: ErrorReportKind) -> AppResult<&mut ErrorReport> {
        let report = ErrorReport::new(&self.ctx, kind)?;
        self.reports.insert(0, report);
        Ok(&mut self.reports[0])
    }

    pub fn reports(&self) -> &[ErrorReport] {
        &self.reports
    }

    pub fn len(&self) -> usize {
        self.reports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reports.is_empty()
    }

    pub fn get(&self, base: &str) -> Option<&ErrorReport> {
        self.reports.iter().find(|report| report.base() == base)
    }

    pub fn get_mut(&mut self, base: &str) -> Option<&mut ErrorReport> {
        self.reports.iter_mut().find(|report| report.base() == base)
    }

    /// Mark a report as seen by base name.
    pub fn mark_seen(&mut self, base: &str) -> AppResult<()> {
        self.get_mut(base)
            .ok_or_else(|| {
                AppError::new(codes::NOT_FOUND, "No such report").with_context("base", base)
            })?
            .mark_seen()
    }

    /// Base of the recovered report whose load is running.
    pub fn loading(&self) -> Option<&str> {
        self.loading.as_deref()
    }

    /// Recovered reports still waiting for their turn to load.
    pub fn queued_loads(&self) -> usize {
        self.load_queue.len()
    }

    /// Background tasks whose completion has not been applied yet.
    pub fn pending(&self) -> usize {
        self.ctx.runner.in_flight()
    }

    /// Apply completions that have already arrived, without waiting.
    pub fn process_completions(&mut self) -> usize {
        let mut applied = 0;
        while let Ok(completion) = self.completions.try_recv() {
            self.apply(completion);
            applied += 1;
        }
        applied
    }

    /// Wait for and apply the next completion. `None` when nothing is running.
    pub async fn next_completion(&mut self) -> Option<String> {
        if self.pending() == 0 {
            return None;
        }
        let completion = self.completions.recv().await?;
        let base = completion.base.clone();
        self.apply(completion);
        Some(base)
    }

    /// Drive every running and queued operation to its end.
    pub async fn run_until_idle(&mut self) {
        while self.next_completion().await.is_some() {}
    }

    fn apply(&mut self, completion: Completion) {
        self.ctx.runner.mark_applied();
        let base = completion.base.clone();
        let operation = completion.operation;

        match self.get_mut(&base) {
            Some(report) => report.complete(completion),
            None => warn!(
                target: "crashstore",
                event = "completion_for_unknown_report",
                base = %base,
                operation = operation.as_str()
            ),
        }

        if operation == Operation::Load && self.loading.as_deref() == Some(base.as_str()) {
            self.loading = None;
            self.start_next_load();
        }
    }

    /// Start the next queued load, keeping at most one in flight.
    fn start_next_load(&mut self) {
        if self.loading.is_some() {
            return;
        }
        while let Some(base) = self.load_queue.pop_front() {
            let Some(report) = self.get_mut(&base) else {
                continue;
            };
            match report.load() {
                Ok(()) => {
                    debug!(
                        target: "crashstore",
                        event = "report_load_chained",
                        base = %base
                    );
                    self.loading = Some(base);
                    return;
                }
                Err(err) => warn!(
                    target: "crashstore",
                    event = "report_load_not_started",
                    base = %base,
                    code = %err.code()
                ),
            }
        }
    }
}
