use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use once_cell::sync::Lazy;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::fmt::{self, MakeWriter};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::{AppError, AppResult};

pub const LOG_FILE_NAME: &str = "crashstore.log";
pub const LOG_ENV: &str = "CRASHSTORE_LOG";
const DEFAULT_FILTER: &str = "crashstore=info";

struct FileSinkState {
    writer: NonBlocking,
    _guard: WorkerGuard,
}

static FILE_SINK: Lazy<Mutex<Option<FileSinkState>>> = Lazy::new(|| Mutex::new(None));

/// Routes JSON log lines to the file sink once one is attached.
#[derive(Clone, Copy, Default)]
struct FileSink;

struct FileSinkWriter(Option<NonBlocking>);

impl<'a> MakeWriter<'a> for FileSink {
    type Writer = FileSinkWriter;

    fn make_writer(&'a self) -> Self::Writer {
        let guard = FILE_SINK.lock().unwrap_or_else(|e| e.into_inner());
        FileSinkWriter(guard.as_ref().map(|state| state.writer.clone()))
    }
}

impl Write for FileSinkWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.0.as_mut() {
            Some(writer) => writer.write(buf),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.0.as_mut() {
            Some(writer) => writer.flush(),
            None => Ok(()),
        }
    }
}

fn env_filter() -> EnvFilter {
    std::env::var("RUST_LOG")
        .ok()
        .or_else(|| std::env::var(LOG_ENV).ok())
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_FILTER))
}

/// Install the global subscriber: human readable on stderr plus a JSON layer
/// that stays silent until [`init_file_logging`] attaches a file.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init_logging() {
    let stderr = fmt::layer().with_writer(io::stderr).with_target(true);
    let file = fmt::layer().json().flatten_event(true).with_writer(FileSink);
    let _ = tracing_subscriber::registry()
        .with(env_filter())
        .with(stderr)
        .with(file)
        .try_init();
}

/// Attach `<dir>/crashstore.log` as the JSON sink and return its path.
pub fn init_file_logging(dir: &Path) -> AppResult<PathBuf> {
    std::fs::create_dir_all(dir).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "create_logs_dir")
            .with_context("path", dir.display().to_string())
    })?;
    let appender = tracing_appender::rolling::never(dir, LOG_FILE_NAME);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let mut sink = FILE_SINK.lock().unwrap_or_else(|e| e.into_inner());
    *sink = Some(FileSinkState {
        writer,
        _guard: guard,
    });
    Ok(dir.join(LOG_FILE_NAME))
}

/// Detach the file sink, flushing everything buffered so far.
pub fn flush_file_logs() {
    let state = FILE_SINK.lock().unwrap_or_else(|e| e.into_inner()).take();
    drop(state);
}
