//! Where on persistent storage a directory physically lives.

use std::fs;
use std::path::{Component, Path, PathBuf};

pub const MOUNTINFO_PATH: &str = "/proc/self/mountinfo";
pub const BY_LABEL_DIR: &str = "/dev/disk/by-label";

/// Resolves a block device to its filesystem label.
pub trait DeviceLabels: Send + Sync {
    fn lookup_label(&self, device: &Path) -> Option<String>;
}

/// Looks the device up among the udev `/dev/disk/by-label` symlinks.
pub struct ByLabelDirectory {
    dir: PathBuf,
}

impl ByLabelDirectory {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl Default for ByLabelDirectory {
    fn default() -> Self {
        Self::new(BY_LABEL_DIR)
    }
}

impl DeviceLabels for ByLabelDirectory {
    fn lookup_label(&self, device: &Path) -> Option<String> {
        let wanted = fs::canonicalize(device).unwrap_or_else(|_| device.to_path_buf());
        let entries = fs::read_dir(&self.dir).ok()?;
        for entry in entries.flatten() {
            let Ok(target) = fs::canonicalize(entry.path()) else {
                continue;
            };
            if target == wanted {
                return Some(unescape(&entry.file_name().to_string_lossy()));
            }
        }
        None
    }
}

/// One line of `/proc/self/mountinfo`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    /// Path inside the filesystem that is mounted at `mount_point`.
    pub root: String,
    pub mount_point: PathBuf,
    pub fs_type: String,
    pub source: String,
}

pub fn parse_mountinfo(text: &str) -> Vec<MountEntry> {
    text.lines().filter_map(parse_mountinfo_line).collect()
}

fn parse_mountinfo_line(line: &str) -> Option<MountEntry> {
    let (head, tail) = line.split_once(" - ")?;
    let head: Vec<&str> = head.split_whitespace().collect();
    let mut tail = tail.split_whitespace();
    if head.len() < 5 {
        return None;
    }
    let fs_type = tail.next()?;
    let source = tail.next()?;
    Some(MountEntry {
        root: unescape(head[3]),
        mount_point: PathBuf::from(unescape(head[4])),
        fs_type: unescape(fs_type),
        source: unescape(source),
    })
}

/// Decode the `\NNN` octal and `\xNN` hex escapes used by the kernel and udev.
fn unescape(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' {
            let octal = bytes.get(i + 1..i + 4).and_then(|digits| {
                std::str::from_utf8(digits)
                    .ok()
                    .and_then(|s| u8::from_str_radix(s, 8).ok())
            });
            if let Some(value) = octal {
                out.push(value);
                i += 4;
                continue;
            }
            let hex = (bytes.get(i + 1) == Some(&b'x'))
                .then(|| bytes.get(i + 2..i + 4))
                .flatten()
                .and_then(|digits| {
                    std::str::from_utf8(digits)
                        .ok()
                        .and_then(|s| u8::from_str_radix(s, 16).ok())
                });
            if let Some(value) = hex {
                out.push(value);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Absolute, `.`/`..`-free form of `path` without touching symlinks.
pub fn normalize(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("/"))
            .join(path)
    };
    let mut out = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// The mount whose mount point is exactly `directory`; the last one wins when
/// mounts are stacked.
pub fn find_mount<'a>(entries: &'a [MountEntry], directory: &Path) -> Option<&'a MountEntry> {
    let wanted = normalize(directory);
    entries
        .iter()
        .rev()
        .find(|entry| normalize(&entry.mount_point) == wanted)
}

/// `(label, path-on-that-filesystem)` for `file_name` stored in `directory`.
pub fn persistent_location(
    mountinfo: &str,
    directory: &Path,
    file_name: &str,
    labels: &dyn DeviceLabels,
) -> Option<(String, String)> {
    let entries = parse_mountinfo(mountinfo);
    let mount = find_mount(&entries, directory)?;
    let device = fs::canonicalize(&mount.source).unwrap_or_else(|_| PathBuf::from(&mount.source));
    let label = labels.lookup_label(&device)?;
    let root = mount.root.trim_start_matches('/');
    let path = if root.is_empty() {
        file_name.to_string()
    } else {
        format!("{root}/{file_name}")
    };
    Some((label, path))
}
