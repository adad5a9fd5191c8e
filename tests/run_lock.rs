mod common;

use anyhow::Result;
use std::fs;

use bootclone::lock::{lock_file_path, try_acquire_run_lock};
use common::unique_root;

#[test]
fn second_run_fails_fast_until_the_first_ends() -> Result<()> {
    let dir = unique_root("lock");
    fs::create_dir_all(&dir)?;

    let first = try_acquire_run_lock(&dir)?;
    assert_eq!(first.path(), lock_file_path(&dir).as_path());
    assert!(try_acquire_run_lock(&dir).is_err());

    drop(first);
    let again = try_acquire_run_lock(&dir)?;
    drop(again);

    let _ = fs::remove_dir_all(&dir);
    Ok(())
}
