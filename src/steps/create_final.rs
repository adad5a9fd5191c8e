use std::fs;

use log::info;

use crate::access::{Collaborators, DiskpartScript};
use crate::config::MigrationContext;
use crate::consts::DISKPART;
use crate::error::{IoContext, Result};

use super::{MigrationStep, StepCheck};

pub struct CreateFinalImage<'a> {
    ctx: &'a MigrationContext,
    co: Collaborators<'a>,
}

impl<'a> CreateFinalImage<'a> {
    pub fn new(ctx: &'a MigrationContext, co: Collaborators<'a>) -> Self {
        Self { ctx, co }
    }
}

impl MigrationStep for CreateFinalImage<'_> {
    fn name(&self) -> &'static str {
        "create-final-image"
    }

    fn check_prerequisites(&self) -> StepCheck {
        if self.ctx.temp_is_final() {
            return StepCheck::pass();
        }
        let mut messages = Vec::new();
        if let Ok(image) = self.ctx.final_image_path() {
            if self.co.host.file_exists(&image) {
                messages.push(format!("Destination image {} already exists", image.display()));
            }
        }
        if !self.co.host.tool_available(DISKPART) {
            messages.push(format!("{} not found", DISKPART));
        }
        StepCheck::from_messages(messages)
    }

    fn perform(&mut self) -> Result<()> {
        if self.ctx.temp_is_final() {
            return Ok(());
        }
        let folder = self.ctx.final_folder()?;
        let image = self.ctx.final_image_path()?;
        info!(
            "create-final-image: {} ({}, max {} bytes)",
            image.display(),
            self.ctx.container_type,
            self.ctx.dest_max_size
        );

        fs::create_dir_all(&folder).op("create destination folder")?;
        DiskpartScript::create_image(&image, self.ctx.dest_max_size, self.ctx.container_type)
            .run(self.co.tools, &folder)?;
        Ok(())
    }
}
