//! Reading and rewriting `<base>.meta`.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use serde::Serialize;
use serde_json::ser::PrettyFormatter;
use serde_json::{Map, Value};

use crate::error::codes;
use crate::util::write_atomic;
use crate::{AppError, AppResult};

pub type Meta = Map<String, Value>;

/// `Ok(None)` when the file does not exist; an error when it is not a JSON object.
pub fn read_meta(path: &Path) -> AppResult<Option<Meta>> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(AppError::from(err)
                .with_context("operation", "read_meta")
                .with_context("path", path.display().to_string()))
        }
    };
    let value: Value = serde_json::from_str(&text).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "parse_meta")
            .with_context("path", path.display().to_string())
    })?;
    match value {
        Value::Object(map) => Ok(Some(map)),
        _ => Err(
            AppError::new(codes::META_NOT_OBJECT, "Report metadata is not a JSON object")
                .with_context("path", path.display().to_string()),
        ),
    }
}

/// Replace the whole file with `meta`, indented by four spaces.
pub fn write_meta(path: &Path, meta: &Meta) -> AppResult<()> {
    let mut payload = Vec::new();
    let formatter = PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut payload, formatter);
    meta.serialize(&mut serializer)?;
    write_atomic(path, &payload).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "write_meta")
            .with_context("path", path.display().to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn missing_file_is_not_an_error() {
        let dir = tempdir().unwrap();
        assert_eq!(read_meta(&dir.path().join("x.meta")).unwrap(), None);
    }

    #[test]
    fn writes_pretty_json_with_four_space_indent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("x.meta");
        let mut meta = Meta::new();
        meta.insert("kind".into(), json!("UI"));
        write_meta(&path, &meta).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "{\n    \"kind\": \"UI\"\n}");
        assert_eq!(read_meta(&path).unwrap(), Some(meta));
    }

    #[test]
    fn corrupt_json_reports_position() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("x.meta");
        fs::write(&path, "{\"kind\": ").unwrap();
        let err = read_meta(&path).unwrap_err();
        assert!(err.code().starts_with("JSON/"));
        assert_eq!(err.context().get("operation"), Some(&"parse_meta".to_string()));
    }

    #[test]
    fn non_object_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("x.meta");
        fs::write(&path, "[1, 2]").unwrap();
        assert_eq!(read_meta(&path).unwrap_err().code(), codes::META_NOT_OBJECT);
    }

    #[test]
    fn write_into_missing_directory_fails() {
        let dir = tempdir().unwrap();
        let err = write_meta(&dir.path().join("gone").join("x.meta"), &Meta::new()).unwrap_err();
        assert_eq!(err.code(), "IO/NotFound");
    }
}
