#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crashstore_lib::error::codes;
use crashstore_lib::mounts::DeviceLabels;
use crashstore_lib::{
    ErrorReportKind, ErrorReportState, ManagerConfig, RecordingChangeSink, ReportManager,
};
use tempfile::TempDir;
use tokio::runtime::Handle;

const VALID_REPORT: &str = "ProblemType: Bug\nDate: Wed Nov  6 10:00:00 2019\nProcStatus:\n Name: subiquity\n State: R (running)\n";

fn crash_dir(root: &Path) -> PathBuf {
    let dir = root.join("var/crash");
    fs::create_dir_all(&dir).unwrap();
    dir
}

fn seed(dir: &Path, base: &str, crash: &str, meta: Option<&str>) {
    fs::write(dir.join(format!("{base}.crash")), crash).unwrap();
    if let Some(meta) = meta {
        fs::write(dir.join(format!("{base}.meta")), meta).unwrap();
    }
}

fn manager_for(root: &Path, changes: &Arc<RecordingChangeSink>) -> ReportManager {
    ReportManager::builder(ManagerConfig::new(root))
        .mountinfo_path(root.join("mountinfo"))
        .subscribe(changes.clone())
        .build(Handle::current())
}

#[tokio::test]
async fn loads_run_one_at_a_time_newest_first() {
    let root = TempDir::new().unwrap();
    let dir = crash_dir(root.path());
    let older = "1573034400.000000001.install_fail";
    let newer = "1573034500.000000002.ui";
    seed(&dir, older, VALID_REPORT, Some(r#"{"kind": "INSTALL_FAIL"}"#));
    seed(&dir, newer, VALID_REPORT, Some(r#"{"kind": "UI", "seen": true}"#));
    fs::write(dir.join("notes.txt"), "ignored").unwrap();

    let changes = RecordingChangeSink::new();
    let mut manager = manager_for(root.path(), &changes);
    manager.start().unwrap();

    let order: Vec<&str> = manager.reports().iter().map(|r| r.base()).collect();
    assert_eq!(order, vec![newer, older]);
    assert_eq!(manager.loading(), Some(newer));
    assert_eq!(manager.queued_loads(), 1);
    assert_eq!(manager.pending(), 1);
    assert_eq!(manager.get(older).unwrap().state(), ErrorReportState::Loading);

    assert_eq!(manager.next_completion().await.as_deref(), Some(newer));
    assert_eq!(manager.loading(), Some(older));
    assert_eq!(manager.queued_loads(), 0);

    assert_eq!(manager.next_completion().await.as_deref(), Some(older));
    assert_eq!(manager.loading(), None);
    assert_eq!(manager.next_completion().await, None);

    let newest = manager.get(newer).unwrap();
    assert_eq!(newest.state(), ErrorReportState::Done);
    assert_eq!(newest.kind(), ErrorReportKind::Ui);
    assert!(newest.seen());
    assert!(!newest.holds_file());
    assert_eq!(
        newest.artifact().get("ProcStatus"),
        Some("Name: subiquity\nState: R (running)")
    );
    assert_eq!(
        manager.get(older).unwrap().kind(),
        ErrorReportKind::InstallFail
    );

    let notified: Vec<String> = changes.changes().into_iter().map(|c| c.base).collect();
    assert_eq!(notified, vec![newer.to_string(), older.to_string()]);
}

#[tokio::test]
async fn missing_or_odd_metadata_still_loads() {
    let root = TempDir::new().unwrap();
    let dir = crash_dir(root.path());
    seed(&dir, "1.000000000.ui", VALID_REPORT, None);
    seed(&dir, "2.000000000.ui", VALID_REPORT, Some(r#"{"kind": "SOMETHING_NEW"}"#));

    let changes = RecordingChangeSink::new();
    let mut manager = manager_for(root.path(), &changes);
    manager.start().unwrap();
    manager.run_until_idle().await;

    for report in manager.reports() {
        assert_eq!(report.state(), ErrorReportState::Done);
        assert_eq!(report.kind(), ErrorReportKind::Unknown);
        assert!(!report.seen());
    }
}

#[tokio::test]
async fn corrupt_metadata_skips_the_report() {
    let root = TempDir::new().unwrap();
    let dir = crash_dir(root.path());
    seed(&dir, "1.000000000.ui", VALID_REPORT, Some("{\"kind\": "));
    seed(&dir, "2.000000000.ui", VALID_REPORT, Some("[\"UI\"]"));
    seed(&dir, "3.000000000.ui", VALID_REPORT, Some(r#"{"kind": "UI"}"#));

    let changes = RecordingChangeSink::new();
    let mut manager = manager_for(root.path(), &changes);
    manager.start().unwrap();
    manager.run_until_idle().await;

    assert_eq!(manager.len(), 1);
    assert_eq!(manager.reports()[0].base(), "3.000000000.ui");
    assert_eq!(manager.reports()[0].state(), ErrorReportState::Done);
}

#[tokio::test]
async fn unparseable_artifact_ends_in_error_loading() {
    let root = TempDir::new().unwrap();
    let dir = crash_dir(root.path());
    seed(&dir, "5.000000000.ui", "this is not a problem report\n", None);
    seed(&dir, "4.000000000.ui", VALID_REPORT, None);

    let changes = RecordingChangeSink::new();
    let mut manager = manager_for(root.path(), &changes);
    manager.start().unwrap();
    manager.run_until_idle().await;

    let broken = manager.get("5.000000000.ui").unwrap();
    assert_eq!(broken.state(), ErrorReportState::ErrorLoading);
    assert!(!broken.holds_file());
    assert_eq!(changes.count_for("5.000000000.ui"), 1);
    // The chain carries on past the failure.
    assert_eq!(
        manager.get("4.000000000.ui").unwrap().state(),
        ErrorReportState::Done
    );
}

#[tokio::test]
async fn recovered_report_loads_once() {
    let root = TempDir::new().unwrap();
    let dir = crash_dir(root.path());
    seed(&dir, "1.000000000.ui", VALID_REPORT, None);

    let changes = RecordingChangeSink::new();
    let mut manager = manager_for(root.path(), &changes);
    manager.start().unwrap();

    let report = manager.get_mut("1.000000000.ui").unwrap();
    assert_eq!(report.load().unwrap_err().code(), codes::LOAD_REJECTED);
    assert_eq!(
        report.add_info(|_| Ok(()), true).unwrap_err().code(),
        codes::POPULATE_REJECTED
    );

    manager.run_until_idle().await;
    let report = manager.get_mut("1.000000000.ui").unwrap();
    assert_eq!(report.state(), ErrorReportState::Done);
    assert_eq!(report.load().unwrap_err().code(), codes::LOAD_REJECTED);
    assert_eq!(changes.count_for("1.000000000.ui"), 1);
}

#[tokio::test]
async fn rescanning_only_registers_new_files() {
    let root = TempDir::new().unwrap();
    let dir = crash_dir(root.path());
    seed(&dir, "1.000000000.ui", VALID_REPORT, None);

    let changes = RecordingChangeSink::new();
    let mut manager = manager_for(root.path(), &changes);
    manager.start().unwrap();
    manager.run_until_idle().await;
    let created = manager
        .create_report(ErrorReportKind::InstallFail)
        .unwrap()
        .base()
        .to_string();

    seed(&dir, "2.000000000.ui", VALID_REPORT, None);
    manager.scan_crash_dir().unwrap();
    manager.start().unwrap();
    assert_eq!(manager.queued_loads(), 0);
    manager.run_until_idle().await;

    let mut bases: Vec<&str> = manager.reports().iter().map(|r| r.base()).collect();
    assert_eq!(bases.len(), 3);
    bases.sort_unstable();
    bases.dedup();
    assert_eq!(bases.len(), 3);

    for base in ["1.000000000.ui", "2.000000000.ui"] {
        let report = manager.get(base).unwrap();
        assert_eq!(report.state(), ErrorReportState::Done, "{base}");
        assert!(!report.holds_file(), "{base}");
        assert_eq!(changes.count_for(base), 1, "{base}");
    }
    assert_eq!(
        manager.get(&created).unwrap().state(),
        ErrorReportState::Incomplete
    );
}

#[tokio::test]
async fn stored_kind_must_match_exactly() {
    let root = TempDir::new().unwrap();
    let dir = crash_dir(root.path());
    seed(&dir, "1.000000000.ui", VALID_REPORT, Some(r#"{"kind": "install-fail"}"#));
    seed(&dir, "2.000000000.ui", VALID_REPORT, Some(r#"{"kind": "ui"}"#));
    seed(&dir, "3.000000000.ui", VALID_REPORT, Some(r#"{"kind": "DISK_PROBE_FAIL"}"#));

    let changes = RecordingChangeSink::new();
    let mut manager = manager_for(root.path(), &changes);
    manager.start().unwrap();
    manager.run_until_idle().await;

    assert_eq!(
        manager.get("1.000000000.ui").unwrap().kind(),
        ErrorReportKind::Unknown
    );
    assert_eq!(
        manager.get("2.000000000.ui").unwrap().kind(),
        ErrorReportKind::Unknown
    );
    assert_eq!(
        manager.get("3.000000000.ui").unwrap().kind(),
        ErrorReportKind::DiskProbeFail
    );
}

#[tokio::test]
async fn start_creates_missing_store() {
    let root = TempDir::new().unwrap();
    let changes = RecordingChangeSink::new();
    let mut manager = manager_for(root.path(), &changes);
    manager.start().unwrap();
    assert!(root.path().join("var/crash").is_dir());
    assert!(manager.is_empty());
    assert_eq!(manager.loading(), None);
}

struct FixedLabel;

impl DeviceLabels for FixedLabel {
    fn lookup_label(&self, device: &Path) -> Option<String> {
        (device == Path::new("/dev/fake-sdb1")).then(|| "casper-rw".to_string())
    }
}

#[tokio::test]
async fn persistent_details_follow_mountinfo() {
    let root = TempDir::new().unwrap();
    let dir = crash_dir(root.path());
    let mountinfo = root.path().join("mountinfo");
    fs::write(
        &mountinfo,
        format!(
            "22 1 8:2 / / rw,relatime shared:1 - ext4 /dev/fake-sda2 rw\n\
             36 22 8:17 /install-logs/2019-11-06.0/crash {} rw,relatime shared:30 - ext4 /dev/fake-sdb1 rw\n",
            fs::canonicalize(&dir).unwrap().display()
        ),
    )
    .unwrap();

    let mut manager = ReportManager::builder(ManagerConfig::new(root.path()))
        .mountinfo_path(&mountinfo)
        .device_labels(Arc::new(FixedLabel))
        .build(Handle::current());
    manager.start().unwrap();

    let report = manager.create_report(ErrorReportKind::Ui).unwrap();
    let (label, path) = report.persistent_details();
    assert_eq!(label.as_deref(), Some("casper-rw"));
    assert_eq!(
        path,
        Some(format!(
            "install-logs/2019-11-06.0/crash/{}.crash",
            report.base()
        ))
    );
}

#[tokio::test]
async fn persistent_details_absent_without_mount() {
    let root = TempDir::new().unwrap();
    let changes = RecordingChangeSink::new();
    let mut manager = manager_for(root.path(), &changes);
    manager.start().unwrap();

    let report = manager.create_report(ErrorReportKind::Ui).unwrap();
    assert_eq!(report.persistent_details(), (None, None));
}

#[tokio::test]
async fn dry_run_reports_fixed_persistent_location() {
    let root = TempDir::new().unwrap();
    let mut manager = ReportManager::builder(ManagerConfig::new(root.path()).with_dry_run(true))
        .mountinfo_path(root.path().join("mountinfo"))
        .build(Handle::current());
    manager.start().unwrap();

    let report = manager.create_report(ErrorReportKind::InstallFail).unwrap();
    let (label, path) = report.persistent_details();
    assert_eq!(label.as_deref(), Some("casper-rw"));
    assert_eq!(
        path,
        Some(format!(
            "install-logs/2019-11-06.0/crash/{}.crash",
            report.base()
        ))
    );
}
