//! Offline registry hive edits through `reg.exe`.
//!
//! The hive is loaded under a private HKLM key, edited, and always unloaded again.

use std::path::Path;

use log::{debug, warn};

use crate::access::{ExternalToolRunner, RegistryEditor};
use crate::consts::{HIVE_MOUNT_KEY, MOUNTED_DEVICES_KEY, REG};
use crate::error::Result;

/// Hex data of a REG_BINARY value in `reg query` output.
fn binary_value(output: &str, name: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let line = line.trim();
        let rest = line.get(..name.len())?;
        if !rest.eq_ignore_ascii_case(name) {
            return None;
        }
        let mut tokens = line[name.len()..].split_whitespace();
        if tokens.next()? != "REG_BINARY" {
            return None;
        }
        Some(tokens.next().unwrap_or_default().to_string())
    })
}

pub struct RegToolEditor<'a> {
    tools: &'a dyn ExternalToolRunner,
}

impl<'a> RegToolEditor<'a> {
    pub fn new(tools: &'a dyn ExternalToolRunner) -> Self {
        Self { tools }
    }

    fn remap_loaded(&self, from: char, to: Option<char>) -> Result<bool> {
        let key = format!(r"{}\{}", HIVE_MOUNT_KEY, MOUNTED_DEVICES_KEY);
        let from_value = format!(r"\DosDevices\{}:", from.to_ascii_uppercase());

        let out = self.tools.run(REG, &["query", &key, "/v", &from_value])?;
        let data = match out.success().then(|| binary_value(&out.stdout, &from_value)) {
            Some(Some(d)) => d,
            _ => return Ok(false),
        };

        self.tools
            .run_checked(REG, &["delete", &key, "/v", &from_value, "/f"])?;
        if let Some(to) = to {
            let to_value = format!(r"\DosDevices\{}:", to.to_ascii_uppercase());
            self.tools.run_checked(
                REG,
                &["add", &key, "/v", &to_value, "/t", "REG_BINARY", "/d", &data, "/f"],
            )?;
            debug!("registry: moved {} to {}", from_value, to_value);
        } else {
            debug!("registry: removed {}", from_value);
        }
        Ok(true)
    }
}

impl RegistryEditor for RegToolEditor<'_> {
    fn remap_drive_letter(&self, hive: &Path, from: char, to: Option<char>) -> Result<bool> {
        let hive = hive.to_string_lossy().into_owned();
        self.tools
            .run_checked(REG, &["load", HIVE_MOUNT_KEY, &hive])?;

        let res = self.remap_loaded(from, to);
        let unloaded = self.tools.run_checked(REG, &["unload", HIVE_MOUNT_KEY]);
        match (res, unloaded) {
            (Ok(changed), Ok(_)) => Ok(changed),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), unloaded) => {
                if let Err(u) = unloaded {
                    warn!("registry: unload after failure also failed: {}", u);
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_binary_value() {
        let out = "\r\nHKEY_LOCAL_MACHINE\\BOOTCLONE_SYSTEM\\MountedDevices\r\n    \\DosDevices\\C:    REG_BINARY    4B6F0A2E00001000\r\n\r\n";
        assert_eq!(
            binary_value(out, r"\DosDevices\C:").as_deref(),
            Some("4B6F0A2E00001000")
        );
        assert_eq!(binary_value(out, r"\DosDevices\D:"), None);
    }
}
