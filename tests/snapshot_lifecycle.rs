mod common;

use anyhow::Result;

use bootclone::{MigrateError, Snapshot, SnapshotState};
use common::FakeSnapshots;

#[test]
fn release_happens_exactly_once() -> Result<()> {
    let provider = FakeSnapshots::new("dev0");
    let mut snap = Snapshot::create(&provider, "C:\\")?;
    assert_eq!(snap.state(), SnapshotState::Active);
    assert_eq!(snap.device_path(), "dev0");

    snap.release()?;
    snap.release()?;
    drop(snap);

    assert_eq!(provider.count("complete"), 1);
    assert_eq!(provider.count("delete"), 1);
    Ok(())
}

#[test]
fn body_failure_still_releases() -> Result<()> {
    let provider = FakeSnapshots::new("dev0");

    let body = |snap: &Snapshot<'_>| -> bootclone::Result<()> {
        assert!(!snap.device_path().is_empty());
        Err(MigrateError::Unsupported("clone failed".into()))
    };

    let res = {
        let snap = Snapshot::create(&provider, "C:\\")?;
        body(&snap)
        // dropped here while still active
    };

    assert!(res.is_err());
    assert_eq!(provider.count("delete"), 1);
    Ok(())
}

#[test]
fn failed_creation_removes_partial_snapshot() -> Result<()> {
    let mut provider = FakeSnapshots::new("dev0");
    provider.fail_commit = true;

    let err = Snapshot::create(&provider, "C:\\").err().map(|e| e.to_string());
    assert!(err.unwrap_or_default().contains("refused"));
    assert_eq!(provider.count("begin"), 1);
    assert_eq!(provider.count("delete"), 1);
    assert_eq!(provider.count("complete"), 0);
    Ok(())
}

#[test]
fn already_terminal_snapshot_releases_cleanly() -> Result<()> {
    let mut provider = FakeSnapshots::new("dev0");
    provider.already_gone_on_complete = true;

    let mut snap = Snapshot::create(&provider, "C:\\")?;
    snap.release()?;
    assert_eq!(snap.state(), SnapshotState::Released);
    assert_eq!(provider.count("delete"), 1);
    Ok(())
}

#[test]
fn unsupported_volume_is_a_snapshot_error() -> Result<()> {
    let mut provider = FakeSnapshots::new("dev0");
    provider.supported = false;

    match Snapshot::create(&provider, "Z:\\") {
        Err(MigrateError::Snapshot(_)) => {}
        Err(other) => panic!("unexpected error {other}"),
        Ok(_) => panic!("snapshot of an unsupported volume"),
    }
    assert_eq!(provider.count("begin"), 0);
    Ok(())
}
