//! Off-thread execution of populate/load work.
//!
//! Work runs on the tokio blocking pool. Each task hands its artifact back in
//! exactly one [`Completion`], sent to the queue drained by the
//! [`ReportManager`](crate::manager::ReportManager) on its own thread.

use std::fs::File;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::mpsc;

use crate::artifact::ProblemReport;
use crate::util::dispatch_app_result;
use crate::AppResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Populate,
    Load,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Populate => "populate",
            Operation::Load => "load",
        }
    }
}

/// Outcome of one background operation on one report.
#[derive(Debug)]
pub struct Completion {
    pub base: String,
    pub operation: Operation,
    pub artifact: ProblemReport,
    pub result: AppResult<()>,
}

pub(crate) type Work = Box<dyn FnOnce(&mut ProblemReport, &mut File) -> AppResult<()> + Send>;

#[derive(Clone)]
pub struct TaskRunner {
    handle: Handle,
    tx: mpsc::UnboundedSender<Completion>,
    in_flight: Arc<AtomicUsize>,
}

impl TaskRunner {
    pub fn new(handle: Handle) -> (Self, mpsc::UnboundedReceiver<Completion>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let runner = Self {
            handle,
            tx,
            in_flight: Arc::new(AtomicUsize::new(0)),
        };
        (runner, rx)
    }

    /// Tasks started but whose completion has not been applied yet.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_applied(&self) {
        let _ = self
            .in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    /// Run `work` on the blocking pool; `file` is closed when the task ends.
    pub(crate) fn run(
        &self,
        base: String,
        operation: Operation,
        artifact: ProblemReport,
        file: File,
        work: Work,
    ) {
        let tx = self.tx.clone();
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        self.handle.spawn_blocking(move || {
            let completion = execute(base, operation, artifact, file, work);
            if let Err(err) = tx.send(completion) {
                tracing::warn!(
                    target: "crashstore",
                    event = "completion_dropped",
                    base = %err.0.base,
                    operation = err.0.operation.as_str()
                );
            }
        });
    }

    /// Same work, same fence, on the caller's thread.
    pub(crate) fn run_inline(
        &self,
        base: String,
        operation: Operation,
        artifact: ProblemReport,
        file: File,
        work: Work,
    ) -> Completion {
        execute(base, operation, artifact, file, work)
    }
}

fn execute(
    base: String,
    operation: Operation,
    mut artifact: ProblemReport,
    mut file: File,
    work: Work,
) -> Completion {
    tracing::debug!(
        target: "crashstore",
        event = "task_started",
        base = %base,
        operation = operation.as_str()
    );
    let result = dispatch_app_result(|| work(&mut artifact, &mut file));
    drop(file);
    Completion {
        base,
        operation,
        artifact,
        result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AppError;
    use std::io::Write;

    fn scratch_file() -> (tempfile::TempDir, File) {
        let dir = tempfile::tempdir().unwrap();
        let file = File::create(dir.path().join("x.crash")).unwrap();
        (dir, file)
    }

    #[tokio::test]
    async fn delivers_exactly_one_completion() {
        let (runner, mut rx) = TaskRunner::new(Handle::current());
        let (_dir, file) = scratch_file();
        runner.run(
            "r1".into(),
            Operation::Populate,
            ProblemReport::default(),
            file,
            Box::new(|artifact: &mut ProblemReport, file: &mut File| {
                artifact.insert("Touched", "yes")?;
                file.write_all(b"Touched: yes\n")?;
                Ok(())
            }),
        );
        assert_eq!(runner.in_flight(), 1);

        let completion = rx.recv().await.unwrap();
        assert_eq!(completion.base, "r1");
        assert!(completion.result.is_ok());
        assert_eq!(completion.artifact.get("Touched"), Some("yes"));
        assert!(rx.try_recv().is_err());

        runner.mark_applied();
        assert_eq!(runner.in_flight(), 0);
        runner.mark_applied();
        assert_eq!(runner.in_flight(), 0);
    }

    #[tokio::test]
    async fn panics_become_failed_completions() {
        let (runner, _rx) = TaskRunner::new(Handle::current());
        let (_dir, file) = scratch_file();
        let completion = runner.run_inline(
            "r2".into(),
            Operation::Load,
            ProblemReport::unloaded(),
            file,
            Box::new(|_: &mut ProblemReport, _: &mut File| -> AppResult<()> {
                panic!("parser blew up")
            }),
        );
        let err = completion.result.unwrap_err();
        assert_eq!(err.code(), crate::error::codes::PANIC);
        assert_eq!(completion.artifact, ProblemReport::unloaded());
    }

    #[tokio::test]
    async fn errors_are_carried_not_raised() {
        let (runner, _rx) = TaskRunner::new(Handle::current());
        let (_dir, file) = scratch_file();
        let completion = runner.run_inline(
            "r3".into(),
            Operation::Populate,
            ProblemReport::default(),
            file,
            Box::new(|_: &mut ProblemReport, _: &mut File| {
                Err(AppError::new("HOOK/FAILED", "no output"))
            }),
        );
        assert_eq!(completion.result.unwrap_err().code(), "HOOK/FAILED");
    }
}
