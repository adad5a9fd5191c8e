use log::{info, warn};

use crate::access::Collaborators;
use crate::config::MigrationContext;
use crate::error::Result;

use super::{MigrationStep, StepCheck};

/// Host checks: OS support, BitLocker, a place for the temporary image, free space.
pub struct PrepareMigration<'a> {
    ctx: &'a MigrationContext,
    co: Collaborators<'a>,
}

impl<'a> PrepareMigration<'a> {
    pub fn new(ctx: &'a MigrationContext, co: Collaborators<'a>) -> Self {
        Self { ctx, co }
    }
}

impl MigrationStep for PrepareMigration<'_> {
    fn name(&self) -> &'static str {
        "prepare"
    }

    fn check_prerequisites(&self) -> StepCheck {
        let mut messages = Vec::new();

        match self.co.host.os_version() {
            Ok(v) if !v.supports_native_vhd_boot() => messages.push(format!(
                "Operating system {}.{} does not support native boot from a virtual disk",
                v.major, v.minor
            )),
            Ok(_) => {}
            Err(e) => messages.push(format!("Cannot determine the operating system version: {}", e)),
        }

        match self.co.host.bitlocker_status(self.ctx.system_drive) {
            Ok(s) if s.blocks_migration() => {
                messages.push("BitLocker is enabled on the system drive".to_string())
            }
            Ok(_) => {}
            Err(e) => warn!("prepare: BitLocker status unknown: {}", e),
        }

        let temp_known = self
            .ctx
            .temp_folder
            .as_ref()
            .is_some_and(|p| !p.as_os_str().is_empty());
        if !temp_known {
            messages.push("No drive has enough free space for the temporary image".to_string());
        }

        if !self.ctx.temp_is_final() {
            match self.co.host.system_drive() {
                Ok(d) if d.available_free < d.total_size / 2 => messages.push(
                    "The system drive has less than 50% free space, the image cannot be moved onto it"
                        .to_string(),
                ),
                Ok(_) => {}
                Err(e) => messages.push(format!("Cannot inspect the system drive: {}", e)),
            }
        }

        StepCheck::from_messages(messages)
    }

    fn perform(&mut self) -> Result<()> {
        info!("prepare: migration plan\n{}", self.ctx);
        Ok(())
    }
}
