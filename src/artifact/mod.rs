//! The diagnostic artifact written to `<base>.crash`.
//!
//! A report is an ordered set of `Key: value` fields. Values spanning several
//! lines are written as `Key:` followed by every line indented by one space.
//!
//! Multi-line values are stored line by line: a trailing newline and any
//! `\r` before a newline do not survive a write and reload. Hooks that need
//! exact bytes must encode them before inserting.

use std::collections::BTreeMap;
use std::io::{Read, Write};

use chrono::Local;

use crate::error::codes;
use crate::{AppError, AppResult};

mod standard;

pub const PROBLEM_TYPE: &str = "ProblemType";
pub const DATE: &str = "Date";
pub const CRASH_DB: &str = "CrashDB";
pub const PACKAGE: &str = "Package";
pub const SOURCE_PACKAGE: &str = "SourcePackage";
pub const EXECUTABLE_TIMESTAMP: &str = "ExecutableTimestamp";
pub const PROC_MAPS: &str = "ProcMaps";

const UNKNOWN_DATE: &str = "???";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProblemReport {
    fields: BTreeMap<String, String>,
}

impl ProblemReport {
    /// A fresh bug report stamped with the current local time.
    pub fn new_bug() -> Self {
        let mut report = Self::default();
        report
            .fields
            .insert(PROBLEM_TYPE.to_string(), "Bug".to_string());
        report.fields.insert(
            DATE.to_string(),
            Local::now().format("%a %b %e %H:%M:%S %Y").to_string(),
        );
        report
    }

    /// Placeholder used for reports recovered from disk until they are loaded.
    pub fn unloaded() -> Self {
        let mut report = Self::default();
        report
            .fields
            .insert(DATE.to_string(), UNKNOWN_DATE.to_string());
        report
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Set a field, rejecting keys that could not be read back.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> AppResult<()> {
        let key = key.into();
        if !valid_key(&key) {
            return Err(
                AppError::new(codes::ARTIFACT_KEY, "Invalid problem report field name")
                    .with_context("key", key),
            );
        }
        self.fields.insert(key, value.into());
        Ok(())
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.fields.remove(key)
    }

    /// Serialize every field, `ProblemType` first.
    pub fn write_to<W: Write>(&self, mut out: W) -> AppResult<()> {
        let ordered = self
            .fields
            .get_key_value(PROBLEM_TYPE)
            .into_iter()
            .chain(self.fields.iter().filter(|(key, _)| key.as_str() != PROBLEM_TYPE));
        for (key, value) in ordered {
            if value.contains('\n') {
                writeln!(out, "{key}:")?;
                for line in value.lines() {
                    writeln!(out, " {line}")?;
                }
            } else {
                writeln!(out, "{key}: {value}")?;
            }
        }
        out.flush()?;
        Ok(())
    }

    /// Replace the current fields with the ones parsed from `input`.
    pub fn load_from<R: Read>(&mut self, mut input: R) -> AppResult<()> {
        let mut text = String::new();
        input.read_to_string(&mut text)?;
        self.fields = parse_fields(&text)?;
        Ok(())
    }
}

fn valid_key(key: &str) -> bool {
    !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

fn parse_error(line_no: usize, message: &str) -> AppError {
    AppError::new(codes::ARTIFACT_PARSE, message).with_context("line", line_no.to_string())
}

fn parse_fields(text: &str) -> AppResult<BTreeMap<String, String>> {
    let mut fields = BTreeMap::new();
    let mut current: Option<(String, Vec<&str>)> = None;

    for (index, line) in text.lines().enumerate() {
        let line_no = index + 1;
        if let Some(continuation) = line.strip_prefix(' ') {
            match current.as_mut() {
                Some((_, lines)) => lines.push(continuation),
                None => return Err(parse_error(line_no, "Continuation line without a field")),
            }
            continue;
        }
        if line.is_empty() {
            continue;
        }

        if let Some((key, lines)) = current.take() {
            fields.insert(key, lines.join("\n"));
        }

        let (key, rest) = line
            .split_once(':')
            .ok_or_else(|| parse_error(line_no, "Expected `Key: value`"))?;
        if !valid_key(key) {
            return Err(parse_error(line_no, "Invalid field name").with_context("key", key));
        }
        let value = rest.strip_prefix(' ').unwrap_or(rest);
        let lines = if value.is_empty() { Vec::new() } else { vec![value] };
        current = Some((key.to_string(), lines));
    }

    if let Some((key, lines)) = current {
        fields.insert(key, lines.join("\n"));
    }
    Ok(fields)
}
