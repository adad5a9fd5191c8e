use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::access::{
    Collaborators, HostEnvironment, LocalHost, NtfsVolumes, ProcessToolRunner, RegToolEditor,
    VirtualDiskAccess, VssSnapshots,
};
use crate::config::{ContainerType, MigrationMode};
use crate::consts::{DEFAULT_BUFFER_SIZE, DEFAULT_CHUNK_SIZE};

mod inspect;
mod migrate;

#[derive(Parser, Debug)]
#[command(
    name = "bootclone",
    version,
    about = "Clone the running system volume into a natively bootable virtual disk",
    arg_required_else_help = true
)]
pub struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
}

/// Flags shared by `check` and `migrate`. Unset flags fall back to BOOTCLONE_* env, then to the
/// plan derived from the system drive.
#[derive(Args, Debug, Clone)]
pub struct PlanArgs {
    /// migrate | image-only
    #[arg(long, default_value = "migrate")]
    mode: MigrationMode,
    /// Folder of the temporary image (default: roomiest non-system drive)
    #[arg(long)]
    temp_dir: Option<PathBuf>,
    /// Folder of the final image (default: <system>:\VHD_Boot in migrate mode)
    #[arg(long)]
    dest_dir: Option<PathBuf>,
    #[arg(long)]
    image_name: Option<String>,
    /// vhd-dynamic | vhd-fixed | vhdx-dynamic | vhdx-fixed
    #[arg(long)]
    container_type: Option<ContainerType>,
    /// Register the final image in the boot manager
    #[arg(long)]
    add_to_boot: bool,
    /// Keep the temporary image after it was copied into the final one
    #[arg(long)]
    keep_temp: bool,
}

#[derive(Subcommand, Debug)]
pub enum Cmd {
    /// Run the prerequisite checks only
    Check {
        #[command(flatten)]
        plan: PlanArgs,
        #[arg(long)]
        json: bool,
    },
    /// Run the whole migration
    Migrate {
        #[command(flatten)]
        plan: PlanArgs,
        /// Do not ask for confirmation
        #[arg(long)]
        yes: bool,
        /// Restart the machine when done
        #[arg(long)]
        reboot: bool,
        #[arg(long)]
        json: bool,
    },
    /// Print the allocated extents of a raw cluster bitmap file
    Extents {
        #[arg(long)]
        bitmap: PathBuf,
        #[arg(long, default_value_t = 4096)]
        cluster_size: u64,
        #[arg(long)]
        volume_len: u64,
        #[arg(long)]
        json: bool,
    },
    /// Clone an NTFS volume (device or image file) into a file
    Clone {
        #[arg(long)]
        source: String,
        #[arg(long)]
        dest: PathBuf,
        /// Copy every byte instead of the allocated clusters only
        #[arg(long)]
        full: bool,
        #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
        chunk_size: usize,
        #[arg(long, default_value_t = DEFAULT_BUFFER_SIZE)]
        buffer_size: usize,
        #[arg(long)]
        json: bool,
    },
}

/// Build the real host collaborators and hand them to `f`.
fn with_host<R>(f: impl FnOnce(Collaborators<'_>) -> Result<R>) -> Result<R> {
    let probe = ProcessToolRunner::new();
    let tools = ProcessToolRunner::new().with_tools_dir(LocalHost::new(&probe).tools_directory());
    let host = LocalHost::new(&tools);
    let snapshots = VssSnapshots::new(&tools);
    let containers = VirtualDiskAccess::new(&tools);
    let filesystem = NtfsVolumes::new(&tools);
    let registry = RegToolEditor::new(&tools);
    f(Collaborators {
        host: &host,
        tools: &tools,
        snapshots: &snapshots,
        containers: &containers,
        filesystem: &filesystem,
        registry: &registry,
    })
}

/// Parse the command line and execute it. Returns the process exit code.
pub fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.cmd {
        Cmd::Check { plan, json } => with_host(|co| migrate::cmd_check(&plan, co, json)),
        Cmd::Migrate {
            plan,
            yes,
            reboot,
            json,
        } => with_host(|co| migrate::cmd_migrate(&plan, co, yes, reboot, json)),
        Cmd::Extents {
            bitmap,
            cluster_size,
            volume_len,
            json,
        } => inspect::cmd_extents(bitmap, cluster_size, volume_len, json),
        Cmd::Clone {
            source,
            dest,
            full,
            chunk_size,
            buffer_size,
            json,
        } => inspect::cmd_clone(&source, dest, full, chunk_size, buffer_size, json),
    }
}
