use log::{info, warn};

use crate::access::Collaborators;
use crate::config::MigrationContext;
use crate::error::Result;
use crate::snapshot::Snapshot;

use super::{clone_into_new_partition, MigrationStep, StepCheck};

/// Snapshot the running system volume and clone it into the temporary image.
pub struct CloneOperatingSystem<'a> {
    ctx: &'a MigrationContext,
    co: Collaborators<'a>,
}

impl<'a> CloneOperatingSystem<'a> {
    pub fn new(ctx: &'a MigrationContext, co: Collaborators<'a>) -> Self {
        Self { ctx, co }
    }

    fn system_volume(&self) -> String {
        format!("{}:\\", self.ctx.system_drive)
    }

    fn clone_from(&self, device: &str) -> Result<()> {
        let mut source = self.co.filesystem.open_volume(device)?;
        let image = self.ctx.temp_image_path()?;
        let mut container = self.co.containers.open(&image)?;
        let result = clone_into_new_partition(&mut *container, self.co.filesystem, &mut *source)?;
        info!(
            "clone-os: {} -> {} ({} bytes written)",
            device,
            image.display(),
            result.bytes_written
        );
        Ok(())
    }
}

impl MigrationStep for CloneOperatingSystem<'_> {
    fn name(&self) -> &'static str {
        "clone-os"
    }

    fn check_prerequisites(&self) -> StepCheck {
        match self.co.snapshots.supports_volume(&self.system_volume()) {
            Ok(true) => StepCheck::pass(),
            Ok(false) => StepCheck::from_messages(vec![
                "System volume does not support snapshots".to_string(),
            ]),
            Err(e) => StepCheck::from_messages(vec![format!(
                "Cannot query snapshot support of the system volume: {}",
                e
            )]),
        }
    }

    fn perform(&mut self) -> Result<()> {
        let mut snapshot = Snapshot::create(self.co.snapshots, &self.system_volume())?;
        let cloned = self.clone_from(snapshot.device_path());
        let released = snapshot.release();
        match (cloned, released) {
            (Ok(()), released) => released,
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(r)) => {
                warn!("clone-os: snapshot release after failure also failed: {}", r);
                Err(e)
            }
        }
    }
}
