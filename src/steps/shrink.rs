use std::io::{Seek, SeekFrom};

use log::{info, warn};

use crate::access::{Collaborators, DiskpartScript};
use crate::config::MigrationContext;
use crate::consts::{ONE_MIB, SHRINK_RETRIES};
use crate::error::{IoContext, MigrateError, Result};

use super::{MigrationStep, StepCheck};

/// Shrink the cloned volume so it fits the final image, then verify the result.
///
/// A failed diskpart run is retried `SHRINK_RETRIES` times; the retry script skips
/// `attach vdisk` because a failed first run may have left the image attached.
pub struct ShrinkTemporaryVolume<'a> {
    ctx: &'a MigrationContext,
    co: Collaborators<'a>,
    retries: u32,
}

impl<'a> ShrinkTemporaryVolume<'a> {
    pub fn new(ctx: &'a MigrationContext, co: Collaborators<'a>) -> Self {
        Self { ctx, co, retries: 0 }
    }

    /// Retries used by the last `perform`.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    fn shrink(&mut self) -> Result<()> {
        let image = self.ctx.temp_image_path()?;
        let folder = super::parent_dir(&image).to_path_buf();
        info!(
            "shrink: {} by {} MiB",
            image.display(),
            self.ctx.shrink_size / ONE_MIB
        );

        loop {
            let script =
                DiskpartScript::shrink_volume(&image, self.ctx.shrink_size, self.retries == 0);
            match script.run(self.co.tools, &folder) {
                Ok(_) => return Ok(()),
                Err(e) if self.retries < SHRINK_RETRIES => {
                    self.retries += 1;
                    warn!("shrink: attempt {} failed: {}", self.retries, e);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn validate_size(&self) -> Result<()> {
        let image = self.ctx.temp_image_path()?;
        let mut container = self.co.containers.open(&image)?;
        let mut volume = container.open_partition(0)?;
        let len = volume.seek(SeekFrom::End(0)).op("measure shrunk volume")?;
        if len > self.ctx.dest_max_size {
            return Err(MigrateError::SizeConstraint {
                actual: len,
                limit: self.ctx.dest_max_size,
            });
        }
        info!("shrink: volume is now {} bytes", len);
        Ok(())
    }
}

impl MigrationStep for ShrinkTemporaryVolume<'_> {
    fn name(&self) -> &'static str {
        "shrink"
    }

    fn check_prerequisites(&self) -> StepCheck {
        StepCheck::pass()
    }

    fn perform(&mut self) -> Result<()> {
        self.retries = 0;
        if self.ctx.temp_is_final() {
            return Ok(());
        }
        self.shrink()?;
        self.validate_size()
    }
}
