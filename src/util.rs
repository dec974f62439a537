use std::any::Any;
use std::fs;
use std::io::Write;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;

use crate::error::codes;
use crate::{AppError, AppResult};

fn panic_payload(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}

fn app_error_from_panic(payload: Box<dyn Any + Send>) -> AppError {
    let message = panic_payload(payload.as_ref());
    tracing::error!(
        target: "crashstore",
        event = "panic_caught",
        message = %message
    );
    AppError::new(codes::PANIC, message)
}

/// Run `f`, turning a panic into an `AppError` instead of unwinding further.
#[allow(clippy::result_large_err)]
pub fn dispatch_with_fence<T, F>(f: F) -> AppResult<T>
where
    F: FnOnce() -> T,
{
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => Ok(result),
        Err(payload) => Err(app_error_from_panic(payload)),
    }
}

#[allow(clippy::result_large_err)]
pub fn dispatch_app_result<T, F>(f: F) -> AppResult<T>
where
    F: FnOnce() -> AppResult<T>,
{
    dispatch_with_fence(f)?
}

/// Replace `path` with `bytes` through a synced sibling temp file and a rename.
///
/// The parent directory must already exist; it is never created here.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let file_name = path
        .file_name()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "path has no file name"))?;
    let mut tmp_name = file_name.to_os_string();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);

    let result = (|| {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}
