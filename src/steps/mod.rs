//! Migration steps.
//!
//! Every step answers two questions:
//! - `check_prerequisites`: can it run on this host? (reasons travel as data)
//! - `perform`: do the work; any error aborts the pipeline.
//!
//! Order used by `MigrationPipeline::new`:
//! 1. `PrepareMigration`
//! 2. `CreateTemporaryImage`
//! 3. `CloneOperatingSystem`
//! 4. `FixClonedVolume`
//! 5. `ShrinkTemporaryVolume` (skipped when the temporary image is final)
//! 6. `CreateFinalImage` (skipped when the temporary image is final)
//! 7. `CloneToFinalImage` (skipped when the temporary image is final)
//! 8. `RegisterBootEntry` (only when `add_to_boot`)

use std::io::{Seek, SeekFrom};
use std::path::Path;

use log::info;

use crate::access::{Container, PartitionKind, VolumeIo};
use crate::cloning::clone_volume;
use crate::error::{IoContext, MigrateError, Result};
use crate::pump::{CopyResult, SparsePump};

mod boot_entry;
mod clone_os;
mod clone_to_final;
mod create_final;
mod create_temp;
mod fix_volume;
mod prepare;
mod shrink;

pub use boot_entry::{parse_boot_entry_id, RegisterBootEntry};
pub use clone_os::CloneOperatingSystem;
pub use clone_to_final::CloneToFinalImage;
pub use create_final::CreateFinalImage;
pub use create_temp::CreateTemporaryImage;
pub use fix_volume::FixClonedVolume;
pub use prepare::PrepareMigration;
pub use shrink::ShrinkTemporaryVolume;

/// Outcome of a prerequisite check. `ok` is false exactly when `messages` is non-empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepCheck {
    pub ok: bool,
    pub messages: Vec<String>,
}

impl StepCheck {
    pub fn pass() -> Self {
        Self {
            ok: true,
            messages: Vec::new(),
        }
    }

    pub fn from_messages(messages: Vec<String>) -> Self {
        Self {
            ok: messages.is_empty(),
            messages,
        }
    }
}

impl Default for StepCheck {
    fn default() -> Self {
        Self::pass()
    }
}

pub trait MigrationStep {
    /// Short label for logs and metrics.
    fn name(&self) -> &'static str;

    fn check_prerequisites(&self) -> StepCheck;

    fn perform(&mut self) -> Result<()>;
}

/// Create a primary NTFS partition from sector 1 big enough for `volume_len` bytes, then clone
/// `source` into it.
pub(crate) fn clone_into_new_partition(
    container: &mut dyn Container,
    fs: &dyn crate::access::FilesystemAccess,
    source: &mut dyn VolumeIo,
) -> Result<CopyResult> {
    let volume_len = source.seek(SeekFrom::End(0)).op("measure source volume")?;
    let bps = container.bytes_per_sector();
    if bps == 0 {
        return Err(MigrateError::Unsupported(
            "container reports no sector size".into(),
        ));
    }
    let sectors = volume_len.div_ceil(bps);
    let index = container.create_primary_partition(1, sectors, PartitionKind::Ntfs, false)?;
    info!(
        "steps: created partition {} ({} sectors of {} bytes)",
        index, sectors, bps
    );

    let mut dest = container.open_partition(index)?;
    clone_volume(fs, source, &mut *dest, &SparsePump::default())
}

/// Folder of `path`, for diskpart's script file.
pub(crate) fn parent_dir(path: &Path) -> &Path {
    path.parent().unwrap_or_else(|| Path::new("."))
}
