use std::fs;

use log::info;

use crate::access::{Collaborators, DiskpartScript};
use crate::config::MigrationContext;
use crate::consts::DISKPART;
use crate::error::{IoContext, MigrateError, Result};

use super::{MigrationStep, StepCheck};

pub struct CreateTemporaryImage<'a> {
    ctx: &'a MigrationContext,
    co: Collaborators<'a>,
}

impl<'a> CreateTemporaryImage<'a> {
    pub fn new(ctx: &'a MigrationContext, co: Collaborators<'a>) -> Self {
        Self { ctx, co }
    }
}

impl MigrationStep for CreateTemporaryImage<'_> {
    fn name(&self) -> &'static str {
        "create-temp-image"
    }

    fn check_prerequisites(&self) -> StepCheck {
        let mut messages = Vec::new();
        if let Ok(image) = self.ctx.temp_image_path() {
            if self.co.host.file_exists(&image) {
                messages.push(format!(
                    "Temporary image {} already exists",
                    image.display()
                ));
            }
        }
        if !self.co.host.tool_available(DISKPART) {
            messages.push(format!("{} not found", DISKPART));
        }
        StepCheck::from_messages(messages)
    }

    fn perform(&mut self) -> Result<()> {
        let image = self.ctx.temp_image_path()?;
        let folder = self
            .ctx
            .temp_folder
            .as_deref()
            .ok_or_else(|| MigrateError::Configuration("no temporary folder configured".into()))?;
        info!(
            "create-temp-image: {} ({}, max {} bytes)",
            image.display(),
            self.ctx.container_type,
            self.ctx.temp_max_size
        );

        fs::create_dir_all(folder).op("create temporary folder")?;
        DiskpartScript::create_image(&image, self.ctx.temp_max_size, self.ctx.container_type)
            .run(self.co.tools, folder)?;
        Ok(())
    }
}
