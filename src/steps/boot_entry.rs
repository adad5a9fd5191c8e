use log::{debug, info};

use crate::access::{drive_letter_of, Collaborators};
use crate::config::MigrationContext;
use crate::consts::{BCDEDIT, BOOT_ENTRY_DESCRIPTION};
use crate::error::{MigrateError, Result};

use super::{MigrationStep, StepCheck};

/// Id of the entry created by `bcdedit /copy`: the last `{...}` in its output.
pub fn parse_boot_entry_id(output: &str) -> Option<&str> {
    let open = output.rfind('{')?;
    let close = open + output[open..].find('}')?;
    (close > open + 1).then(|| &output[open..=close])
}

/// Strip `X:` from a Windows path: `C:\VHD_Boot\a.vhdx` -> `\VHD_Boot\a.vhdx`.
fn without_drive(path: &str) -> &str {
    let b = path.as_bytes();
    if b.len() >= 2 && b[0].is_ascii_alphabetic() && b[1] == b':' {
        &path[2..]
    } else {
        path
    }
}

/// Copy the current boot entry and point it at the final image.
pub struct RegisterBootEntry<'a> {
    ctx: &'a MigrationContext,
    co: Collaborators<'a>,
}

impl<'a> RegisterBootEntry<'a> {
    pub fn new(ctx: &'a MigrationContext, co: Collaborators<'a>) -> Self {
        Self { ctx, co }
    }

    /// `vhd=[L:]\folder\image`
    fn device_value(&self) -> Result<String> {
        let folder = self.ctx.final_folder()?;
        let image = self.ctx.final_image_path()?;
        let letter = drive_letter_of(&folder).unwrap_or(self.ctx.system_drive);
        let image = image.to_string_lossy();
        Ok(format!("vhd=[{}:]{}", letter, without_drive(&image)))
    }
}

impl MigrationStep for RegisterBootEntry<'_> {
    fn name(&self) -> &'static str {
        "boot-entry"
    }

    fn check_prerequisites(&self) -> StepCheck {
        if self.ctx.add_to_boot && !self.co.host.tool_available(BCDEDIT) {
            return StepCheck::from_messages(vec![format!("{} not found", BCDEDIT)]);
        }
        StepCheck::pass()
    }

    fn perform(&mut self) -> Result<()> {
        if !self.ctx.add_to_boot {
            return Ok(());
        }
        let device = self.device_value()?;
        info!("boot-entry: adding {}", device);

        let out = self.co.tools.run_checked(
            BCDEDIT,
            &["/copy", "{current}", "/d", BOOT_ENTRY_DESCRIPTION],
        )?;
        let id = parse_boot_entry_id(&out).ok_or_else(|| {
            MigrateError::Unsupported(
                "bcdedit did not report the new boot entry; check that bcdedit works on this system"
                    .into(),
            )
        })?;
        debug!("boot-entry: new entry {}", id);

        self.co
            .tools
            .run_checked(BCDEDIT, &["/set", id, "osdevice", &device])?;
        self.co
            .tools
            .run_checked(BCDEDIT, &["/set", id, "device", &device])?;
        info!("boot-entry: {} boots {}", id, device);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_id_is_last_braced_token() {
        let out = "The entry was successfully copied to {6a2b5c1d-0000-11ee-9f3a-00155d010203}.";
        assert_eq!(
            parse_boot_entry_id(out),
            Some("{6a2b5c1d-0000-11ee-9f3a-00155d010203}")
        );
        assert_eq!(parse_boot_entry_id("failed"), None);
        assert_eq!(parse_boot_entry_id("{}"), None);
    }

    #[test]
    fn drive_prefix_is_stripped() {
        assert_eq!(without_drive(r"C:\VHD_Boot\a.vhdx"), r"\VHD_Boot\a.vhdx");
        assert_eq!(without_drive("/tmp/a.vhdx"), "/tmp/a.vhdx");
    }
}
