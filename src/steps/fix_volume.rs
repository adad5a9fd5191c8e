use std::path::{Path, PathBuf};

use log::{debug, info, warn};

use crate::access::{drive_letter_of, Collaborators};
use crate::config::MigrationContext;
use crate::consts::{
    HIBERNATION_FILE, MOUNT_DIR_NAME, PAGE_FILE, SNAPSHOT_STORE_DIR, SNAPSHOT_STORE_SUFFIX,
    SYSTEM_HIVE,
};
use crate::error::{MigrateError, Result};

use super::{MigrationStep, StepCheck};

/// Make the cloned volume bootable on its own:
/// - drop the shadow-copy store, page file and hibernation file;
/// - move the system drive letter out of the way in the cloned `MountedDevices`, so the image
///   picks up whatever letter it gets at boot.
pub struct FixClonedVolume<'a> {
    ctx: &'a MigrationContext,
    co: Collaborators<'a>,
}

impl<'a> FixClonedVolume<'a> {
    pub fn new(ctx: &'a MigrationContext, co: Collaborators<'a>) -> Self {
        Self { ctx, co }
    }

    fn mount_dir(&self) -> Result<PathBuf> {
        self.ctx
            .temp_folder
            .as_ref()
            .map(|d| d.join(MOUNT_DIR_NAME))
            .ok_or_else(|| MigrateError::Configuration("no temporary folder configured".into()))
    }

    fn fix_mounted(&self, root: &Path) -> Result<()> {
        let fs = self.co.filesystem;

        let store = root.join(SNAPSHOT_STORE_DIR);
        let suffix = SNAPSHOT_STORE_SUFFIX.to_ascii_lowercase();
        for file in fs.list_dir(&store)? {
            let is_store = file
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.to_ascii_lowercase().ends_with(&suffix));
            if is_store && fs.remove_file(&file)? {
                debug!("fix-volume: removed {}", file.display());
            }
        }

        for name in [PAGE_FILE, HIBERNATION_FILE] {
            let path = root.join(name);
            if fs.remove_file(&path)? {
                info!("fix-volume: removed {}", path.display());
            }
        }

        let hive = SYSTEM_HIVE.iter().fold(root.to_path_buf(), |p, part| p.join(part));
        let free = self.co.host.first_free_letter()?;
        if self
            .co
            .registry
            .remap_drive_letter(&hive, self.ctx.system_drive, free)?
        {
            info!(
                "fix-volume: {}: mapping moved to {}",
                self.ctx.system_drive,
                free.map(|c| format!("{}:", c))
                    .unwrap_or_else(|| "<removed>".to_string())
            );
        } else {
            debug!(
                "fix-volume: no {}: mapping in the cloned registry",
                self.ctx.system_drive
            );
        }
        Ok(())
    }

    /// The final image lives next to the running system: warn when the drive cannot hold it at
    /// full size.
    fn warn_if_drive_too_small(&self, image: &Path) -> Result<()> {
        let Some(letter) = self.ctx.temp_folder.as_deref().and_then(drive_letter_of) else {
            return Ok(());
        };
        let drive = self.co.host.drive(letter)?;
        let capacity = self.co.containers.open(image)?.capacity();
        if drive.available_free <= capacity {
            warn!(
                "fix-volume: drive {}: has {} bytes free, the image can grow to {} bytes; \
                 a fully expanded image will not fit",
                letter, drive.available_free, capacity
            );
        }
        Ok(())
    }
}

impl MigrationStep for FixClonedVolume<'_> {
    fn name(&self) -> &'static str {
        "fix-volume"
    }

    fn check_prerequisites(&self) -> StepCheck {
        StepCheck::pass()
    }

    fn perform(&mut self) -> Result<()> {
        let image = self.ctx.temp_image_path()?;
        let mount = self.mount_dir()?;
        let fs = self.co.filesystem;

        fs.mount(&image, &mount)?;
        let fixed = self.fix_mounted(&mount);
        let unmounted = fs.unmount(&image, &mount);
        match (fixed, unmounted) {
            (Ok(()), Ok(())) => {}
            (Ok(()), Err(e)) | (Err(e), Ok(())) => return Err(e),
            (Err(e), Err(u)) => {
                warn!("fix-volume: unmount after failure also failed: {}", u);
                return Err(e);
            }
        }

        if self.ctx.temp_is_final() {
            self.warn_if_drive_too_small(&image)?;
        }
        Ok(())
    }
}
