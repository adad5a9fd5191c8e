//! Scoped point-in-time snapshot of a live volume.
//!
//! States: Uninitialized -> Creating -> Active -> Released
//! (Creating -> Uninitialized when creation fails).
//!
//! - `create` begins and commits through the provider. If creation fails after an id became
//!   known, that partial snapshot is deleted before the error is returned.
//! - `release` is idempotent: `complete` (an "already terminal" answer is fine), then `delete`
//!   is always attempted.
//! - Drop releases a snapshot that is still active; errors on that path are only logged.

use log::{debug, info, warn};

use crate::access::VolumeSnapshotProvider;
use crate::error::{MigrateError, Result};
use crate::metrics::{record_snapshot_created, record_snapshot_released};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotState {
    Uninitialized,
    Creating,
    Active,
    Released,
}

pub struct Snapshot<'p> {
    provider: &'p dyn VolumeSnapshotProvider,
    volume: String,
    id: Option<String>,
    device_path: String,
    state: SnapshotState,
}

impl<'p> Snapshot<'p> {
    pub fn create(provider: &'p dyn VolumeSnapshotProvider, volume: &str) -> Result<Self> {
        let mut snap = Snapshot {
            provider,
            volume: volume.to_string(),
            id: None,
            device_path: String::new(),
            state: SnapshotState::Uninitialized,
        };

        info!("snapshot: creating for volume {}", volume);
        snap.state = SnapshotState::Creating;
        match snap.try_create() {
            Ok(()) => {
                snap.state = SnapshotState::Active;
                record_snapshot_created();
                debug!(
                    "snapshot: active id={}, device={}",
                    snap.id.as_deref().unwrap_or_default(),
                    snap.device_path
                );
                Ok(snap)
            }
            Err(e) => {
                warn!("snapshot: creation failed for {}: {}", volume, e);
                if let Some(id) = snap.id.take() {
                    if let Err(del) = provider.delete(&id) {
                        warn!("snapshot: cleanup of partial snapshot {} failed: {}", id, del);
                    }
                }
                snap.state = SnapshotState::Uninitialized;
                Err(match e {
                    MigrateError::Snapshot(_) => e,
                    other => MigrateError::Snapshot(other.to_string()),
                })
            }
        }
    }

    fn try_create(&mut self) -> Result<()> {
        if !self.provider.supports_volume(&self.volume)? {
            return Err(MigrateError::Snapshot(format!(
                "volume {} does not support snapshots",
                self.volume
            )));
        }
        let id = self.provider.begin(&self.volume)?;
        self.id = Some(id.clone());
        self.provider.commit(&id)?;
        self.device_path = self.provider.device_path(&id)?;
        Ok(())
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn volume(&self) -> &str {
        &self.volume
    }

    pub fn device_path(&self) -> &str {
        &self.device_path
    }

    pub fn state(&self) -> SnapshotState {
        self.state
    }

    /// Release the snapshot. Later calls are no-ops.
    pub fn release(&mut self) -> Result<()> {
        if self.state != SnapshotState::Active {
            return Ok(());
        }
        self.state = SnapshotState::Released;
        record_snapshot_released();

        let Some(id) = self.id.take() else {
            return Ok(());
        };

        let completed = match self.provider.complete(&id) {
            Ok(()) | Err(MigrateError::SnapshotBadState(_)) => Ok(()),
            Err(e) => {
                warn!("snapshot: completing {} failed: {}", id, e);
                Err(e)
            }
        };

        debug!("snapshot: removing {}", self.device_path);
        self.provider.delete(&id)?;
        completed
    }
}

impl Drop for Snapshot<'_> {
    fn drop(&mut self) {
        if self.state == SnapshotState::Active {
            if let Err(e) = self.release() {
                warn!("snapshot: release on drop failed: {}", e);
            }
        }
    }
}
