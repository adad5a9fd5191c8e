//! Shadow-copy snapshots driven by the command-line tools.
//!
//! - probe:  `vssadmin list volumes`
//! - create: `wmic shadowcopy call create Volume=<v>` (prints ShadowID and ReturnValue)
//! - query:  `vssadmin list shadows /shadow=<id>` (prints the shadow copy device)
//! - delete: `vssadmin delete shadows /shadow=<id> /quiet`
//!
//! The tools create and commit in one go, so `commit` and `complete` only verify that the
//! shadow still exists.

use log::debug;

use crate::access::{ExternalToolRunner, VolumeSnapshotProvider};
use crate::consts::{VSSADMIN, WMIC};
use crate::error::{MigrateError, Result};

/// Value of `Key = "value";` / `Key = value;` in wmic method output.
fn wmic_field<'o>(output: &'o str, key: &str) -> Option<&'o str> {
    output.lines().find_map(|line| {
        let (k, v) = line.split_once('=')?;
        if !k.trim().eq_ignore_ascii_case(key) {
            return None;
        }
        Some(v.trim().trim_end_matches(';').trim().trim_matches('"'))
    })
}

fn shadow_device(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let (k, v) = line.split_once(':')?;
        k.trim()
            .eq_ignore_ascii_case("Shadow Copy Volume")
            .then(|| v.trim().to_string())
    })
}

pub struct VssSnapshots<'a> {
    tools: &'a dyn ExternalToolRunner,
}

impl<'a> VssSnapshots<'a> {
    pub fn new(tools: &'a dyn ExternalToolRunner) -> Self {
        Self { tools }
    }

    fn query(&self, id: &str) -> Result<Option<String>> {
        let shadow = format!("/shadow={}", id);
        let out = self.tools.run(VSSADMIN, &["list", "shadows", &shadow])?;
        if !out.success() {
            return Ok(None);
        }
        Ok(shadow_device(&out.stdout))
    }
}

impl VolumeSnapshotProvider for VssSnapshots<'_> {
    fn supports_volume(&self, volume: &str) -> Result<bool> {
        let out = self.tools.run_checked(VSSADMIN, &["list", "volumes"])?;
        let wanted = volume.trim_end_matches('\\').to_ascii_lowercase();
        Ok(out.lines().any(|line| {
            line.split_once(':').is_some_and(|(k, v)| {
                k.trim().eq_ignore_ascii_case("Volume path")
                    && v.trim().trim_end_matches('\\').to_ascii_lowercase() == wanted
            })
        }))
    }

    fn begin(&self, volume: &str) -> Result<String> {
        let arg = format!("Volume={}", volume);
        let out = self
            .tools
            .run_checked(WMIC, &["shadowcopy", "call", "create", &arg])?;
        let rv = wmic_field(&out, "ReturnValue").unwrap_or("?");
        if rv != "0" {
            return Err(MigrateError::Snapshot(format!(
                "shadow copy creation returned {}",
                rv
            )));
        }
        let id = wmic_field(&out, "ShadowID")
            .filter(|s| s.starts_with('{'))
            .ok_or_else(|| MigrateError::Snapshot("no shadow id in tool output".into()))?;
        debug!("vss: created shadow {}", id);
        Ok(id.to_string())
    }

    fn commit(&self, id: &str) -> Result<()> {
        match self.query(id)? {
            Some(_) => Ok(()),
            None => Err(MigrateError::Snapshot(format!("shadow {} vanished", id))),
        }
    }

    fn complete(&self, id: &str) -> Result<()> {
        match self.query(id)? {
            Some(_) => Ok(()),
            None => Err(MigrateError::SnapshotBadState(id.to_string())),
        }
    }

    fn delete(&self, id: &str) -> Result<()> {
        let shadow = format!("/shadow={}", id);
        self.tools
            .run_checked(VSSADMIN, &["delete", "shadows", &shadow, "/quiet"])
            .map(|_| ())
            .map_err(|e| MigrateError::Snapshot(format!("delete {}: {}", id, e)))
    }

    fn device_path(&self, id: &str) -> Result<String> {
        self.query(id)?
            .ok_or_else(|| MigrateError::Snapshot(format!("no device for shadow {}", id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wmic_create_output() {
        let out = "Executing (Win32_ShadowCopy)->create()\r\n\
                   Method execution successful.\r\n\
                   Out Parameters:\r\n\
                   instance of __PARAMETERS\r\n\
                   {\r\n\
                   \tReturnValue = 0;\r\n\
                   \tShadowID = \"{5F8A3C2E-1111-2222-3333-444455556666}\";\r\n\
                   };\r\n";
        assert_eq!(wmic_field(out, "ReturnValue"), Some("0"));
        assert_eq!(
            wmic_field(out, "ShadowID"),
            Some("{5F8A3C2E-1111-2222-3333-444455556666}")
        );
    }

    #[test]
    fn shadow_listing_device() {
        let out = "Contents of shadow copy set ID: {aaa}\n   Contained 1 shadow copies at creation time: 1/1/2024\n      Shadow Copy ID: {bbb}\n         Original Volume: (C:)\\\\?\\Volume{ccc}\\\n         Shadow Copy Volume: \\\\?\\GLOBALROOT\\Device\\HarddiskVolumeShadowCopy7\n";
        assert_eq!(
            shadow_device(out).as_deref(),
            Some(r"\\?\GLOBALROOT\Device\HarddiskVolumeShadowCopy7")
        );
    }
}
