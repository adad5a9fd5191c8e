use std::fs;

use log::info;

use crate::access::Collaborators;
use crate::config::MigrationContext;
use crate::error::{IoContext, Result};

use super::{clone_into_new_partition, MigrationStep, StepCheck};

/// Copy the shrunk volume of the temporary image into the final image.
pub struct CloneToFinalImage<'a> {
    ctx: &'a MigrationContext,
    co: Collaborators<'a>,
}

impl<'a> CloneToFinalImage<'a> {
    pub fn new(ctx: &'a MigrationContext, co: Collaborators<'a>) -> Self {
        Self { ctx, co }
    }
}

impl MigrationStep for CloneToFinalImage<'_> {
    fn name(&self) -> &'static str {
        "clone-to-final"
    }

    fn check_prerequisites(&self) -> StepCheck {
        StepCheck::pass()
    }

    fn perform(&mut self) -> Result<()> {
        if self.ctx.temp_is_final() {
            return Ok(());
        }
        let temp_image = self.ctx.temp_image_path()?;
        let final_image = self.ctx.final_image_path()?;

        {
            let mut temp = self.co.containers.open(&temp_image)?;
            let mut source = temp.open_partition(0)?;
            let mut dest = self.co.containers.open(&final_image)?;
            let result = clone_into_new_partition(&mut *dest, self.co.filesystem, &mut *source)?;
            info!(
                "clone-to-final: {} -> {} ({} bytes written)",
                temp_image.display(),
                final_image.display(),
                result.bytes_written
            );
        }

        if self.ctx.delete_temp {
            fs::remove_file(&temp_image).op("delete temporary image")?;
            info!("clone-to-final: deleted {}", temp_image.display());
        }
        Ok(())
    }
}
