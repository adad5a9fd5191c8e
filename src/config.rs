//! Migration context and builder.
//!
//! One `MigrationContext` per run, shared read-only by every step:
//! - where the temporary image goes and where the final one ends up;
//! - size limits for both images and how much the temporary volume gets shrunk;
//! - container format and the boot / cleanup / reboot switches.
//!
//! Sources, lowest precedence first:
//! - `Default` (or `plan()`, which derives sizes and folders from the system drive)
//! - environment (`BOOTCLONE_*`, see `merge_env`)
//! - builder / CLI overrides
//!
//! "The temporary image is the final one" is derived (`temp_is_final`), never stored.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::access::{DriveInfo, HostEnvironment};
use crate::consts::{
    DEFAULT_IMAGE_NAME, FINAL_FOLDER_NAME, FIVE_GIB, IMAGE_HEADROOM, ONE_GIB, ONE_MIB,
    TEMP_FOLDER_NAME,
};
use crate::error::{MigrateError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationMode {
    /// Clone into a temporary image, shrink it and move it onto the system drive.
    MigrateCurrentOsToVhd,
    /// Clone into the temporary image and stop there.
    CreateCurrentOsVhdOnly,
}

impl FromStr for MigrationMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "migrate" | "migratecurrentostovhd" => Ok(MigrationMode::MigrateCurrentOsToVhd),
            "image-only" | "createcurrentosvhdonly" => Ok(MigrationMode::CreateCurrentOsVhdOnly),
            other => Err(format!(
                "unknown mode '{}', expected migrate|image-only",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerType {
    VhdDynamic,
    VhdFixed,
    VhdxDynamic,
    VhdxFixed,
}

impl ContainerType {
    /// Value of diskpart's `create vdisk ... type=`.
    pub fn diskpart_type(self) -> &'static str {
        match self {
            ContainerType::VhdDynamic | ContainerType::VhdxDynamic => "expandable",
            ContainerType::VhdFixed | ContainerType::VhdxFixed => "fixed",
        }
    }
}

impl FromStr for ContainerType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "vhd-dynamic" | "vhddynamic" => Ok(ContainerType::VhdDynamic),
            "vhd-fixed" | "vhdfixed" => Ok(ContainerType::VhdFixed),
            "vhdx-dynamic" | "vhdxdynamic" => Ok(ContainerType::VhdxDynamic),
            "vhdx-fixed" | "vhdxfixed" => Ok(ContainerType::VhdxFixed),
            other => Err(format!("unknown container type '{}'", other)),
        }
    }
}

impl fmt::Display for ContainerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ContainerType::VhdDynamic => "vhd-dynamic",
            ContainerType::VhdFixed => "vhd-fixed",
            ContainerType::VhdxDynamic => "vhdx-dynamic",
            ContainerType::VhdxFixed => "vhdx-fixed",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug)]
pub struct MigrationContext {
    /// Drive letter of the running system volume.
    pub system_drive: char,

    /// Folder of the temporary image. None when no drive can hold it.
    /// Env: BOOTCLONE_TEMP_DIR
    pub temp_folder: Option<PathBuf>,

    /// Folder of the final image. None (or equal to `temp_folder`) keeps the temporary image.
    /// Env: BOOTCLONE_DEST_DIR
    pub dest_folder: Option<PathBuf>,

    /// Env: BOOTCLONE_IMAGE_NAME
    pub image_name: String,

    pub temp_max_size: u64,
    pub dest_max_size: u64,

    /// Bytes the temporary volume is shrunk by before it is moved to the final image.
    pub shrink_size: u64,

    /// Env: BOOTCLONE_CONTAINER_TYPE
    pub container_type: ContainerType,

    /// Env: BOOTCLONE_ADD_TO_BOOT
    pub add_to_boot: bool,

    /// Env: BOOTCLONE_DELETE_TEMP
    pub delete_temp: bool,

    /// Env: BOOTCLONE_AUTO_REBOOT
    pub auto_reboot: bool,
}

impl Default for MigrationContext {
    fn default() -> Self {
        Self {
            system_drive: 'C',
            temp_folder: None,
            dest_folder: None,
            image_name: DEFAULT_IMAGE_NAME.to_string(),
            temp_max_size: 0,
            dest_max_size: 0,
            shrink_size: 0,
            container_type: ContainerType::VhdxDynamic,
            add_to_boot: false,
            delete_temp: false,
            auto_reboot: false,
        }
    }
}

fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name).ok().map(|v| {
        let s = v.trim().to_ascii_lowercase();
        s == "1" || s == "true" || s == "on" || s == "yes"
    })
}

fn env_path(name: &str) -> Option<PathBuf> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

fn normalized(path: &Path) -> String {
    path.to_string_lossy()
        .trim_end_matches(&['\\', '/'][..])
        .to_lowercase()
}

impl MigrationContext {
    pub fn from_env() -> Self {
        Self::default().merge_env()
    }

    /// Apply `BOOTCLONE_*` variables on top of `self`.
    pub fn merge_env(mut self) -> Self {
        if let Some(p) = env_path("BOOTCLONE_TEMP_DIR") {
            self.temp_folder = Some(p);
        }
        if let Some(p) = env_path("BOOTCLONE_DEST_DIR") {
            self.dest_folder = Some(p);
        }
        if let Ok(v) = std::env::var("BOOTCLONE_IMAGE_NAME") {
            let s = v.trim();
            if !s.is_empty() {
                self.image_name = s.to_string();
            }
        }
        if let Ok(v) = std::env::var("BOOTCLONE_CONTAINER_TYPE") {
            match v.parse::<ContainerType>() {
                Ok(t) => self.container_type = t,
                Err(e) => log::warn!("config: ignoring BOOTCLONE_CONTAINER_TYPE: {}", e),
            }
        }
        if let Some(on) = env_flag("BOOTCLONE_ADD_TO_BOOT") {
            self.add_to_boot = on;
        }
        if let Some(on) = env_flag("BOOTCLONE_DELETE_TEMP") {
            self.delete_temp = on;
        }
        if let Some(on) = env_flag("BOOTCLONE_AUTO_REBOOT") {
            self.auto_reboot = on;
        }
        self
    }

    /// Derive folders and sizes for `mode` from the system drive.
    ///
    /// Migrate mode keeps 5 GiB free on the system drive: the final image may grow to the
    /// remaining free space (+1 GiB +200 MiB headroom) and the temporary volume is shrunk so
    /// that its data fits there.
    pub fn plan(mode: MigrationMode, system: &DriveInfo, temp_folder: Option<PathBuf>) -> Self {
        let mut ctx = Self {
            system_drive: system.letter,
            temp_folder,
            temp_max_size: system.total_size + IMAGE_HEADROOM,
            ..Self::default()
        };

        if mode == MigrationMode::MigrateCurrentOsToVhd {
            let usable = system.available_free.saturating_sub(FIVE_GIB);
            ctx.delete_temp = true;
            ctx.dest_max_size = usable + ONE_GIB + IMAGE_HEADROOM;
            ctx.shrink_size = system.total_size.saturating_sub(usable);
            ctx.dest_folder = Some(PathBuf::from(format!(
                "{}:\\{}",
                system.letter, FINAL_FOLDER_NAME
            )));
        }
        ctx
    }

    // ----- fluent setters -----

    pub fn with_temp_folder<P: Into<PathBuf>>(mut self, dir: Option<P>) -> Self {
        self.temp_folder = dir.map(Into::into);
        self
    }

    pub fn with_dest_folder<P: Into<PathBuf>>(mut self, dir: Option<P>) -> Self {
        self.dest_folder = dir.map(Into::into);
        self
    }

    pub fn with_image_name<S: Into<String>>(mut self, name: S) -> Self {
        self.image_name = name.into();
        self
    }

    pub fn with_container_type(mut self, t: ContainerType) -> Self {
        self.container_type = t;
        self
    }

    pub fn with_add_to_boot(mut self, on: bool) -> Self {
        self.add_to_boot = on;
        self
    }

    pub fn with_delete_temp(mut self, on: bool) -> Self {
        self.delete_temp = on;
        self
    }

    pub fn with_auto_reboot(mut self, on: bool) -> Self {
        self.auto_reboot = on;
        self
    }

    // ----- derived -----

    /// True when the destination folder is absent/empty or equals the temporary folder.
    pub fn temp_is_final(&self) -> bool {
        let dest = match &self.dest_folder {
            Some(d) if !d.as_os_str().is_empty() => d,
            _ => return true,
        };
        match &self.temp_folder {
            Some(t) => normalized(t) == normalized(dest),
            None => false,
        }
    }

    pub fn temp_image_path(&self) -> Result<PathBuf> {
        self.temp_folder
            .as_ref()
            .map(|d| d.join(&self.image_name))
            .ok_or_else(MigrationContext::missing_temp)
    }

    /// Destination image, or the temporary one when it is final.
    pub fn final_image_path(&self) -> Result<PathBuf> {
        match &self.dest_folder {
            Some(d) if !self.temp_is_final() => Ok(d.join(&self.image_name)),
            _ => self.temp_image_path(),
        }
    }

    /// Folder holding the final image.
    pub fn final_folder(&self) -> Result<PathBuf> {
        match &self.dest_folder {
            Some(d) if !self.temp_is_final() => Ok(d.clone()),
            _ => self.temp_folder.clone().ok_or_else(MigrationContext::missing_temp),
        }
    }

    fn missing_temp() -> MigrateError {
        MigrateError::Configuration("no temporary folder configured".into())
    }

    /// Structural checks. Prerequisite checks report environment problems separately.
    pub fn validate(&self) -> Result<()> {
        if self.image_name.trim().is_empty() {
            return Err(MigrateError::Configuration("image name is empty".into()));
        }
        if self.image_name.contains(&['\\', '/'][..]) {
            return Err(MigrateError::Configuration(format!(
                "image name '{}' must not contain a path",
                self.image_name
            )));
        }
        if self.temp_max_size == 0 {
            return Err(MigrateError::Configuration(
                "temporary image size is zero".into(),
            ));
        }
        if !self.temp_is_final() && self.dest_max_size == 0 {
            return Err(MigrateError::Configuration(
                "destination image size is zero".into(),
            ));
        }
        Ok(())
    }
}

impl fmt::Display for MigrationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let show = |p: &Option<PathBuf>| {
            p.as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "<none>".to_string())
        };
        if self.temp_is_final() {
            writeln!(f, "Destination image folder: {}", show(&self.temp_folder))?;
        } else {
            writeln!(f, "Temporary image folder: {}", show(&self.temp_folder))?;
            writeln!(f, "Destination image folder: {}", show(&self.dest_folder))?;
            writeln!(
                f,
                "Temporary image will be deleted after completion: {}",
                self.delete_temp
            )?;
            writeln!(
                f,
                "Shrink by: {} MiB, destination max: {} MiB",
                self.shrink_size / ONE_MIB,
                self.dest_max_size / ONE_MIB
            )?;
        }
        writeln!(f, "Image file name: {}", self.image_name)?;
        writeln!(f, "Image type: {}", self.container_type)?;
        write!(f, "Image will be added to boot manager: {}", self.add_to_boot)
    }
}

/// Lightweight builder producing a `MigrationContext`.
#[derive(Clone, Debug)]
pub struct ContextBuilder {
    ctx: MigrationContext,
}

impl Default for ContextBuilder {
    fn default() -> Self {
        Self {
            ctx: MigrationContext::from_env(),
        }
    }
}

impl ContextBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from a clean default (without reading env).
    pub fn from_default() -> Self {
        Self {
            ctx: MigrationContext::default(),
        }
    }

    /// Start from a derived plan.
    pub fn from_context(ctx: MigrationContext) -> Self {
        Self { ctx }
    }

    pub fn system_drive(mut self, letter: char) -> Self {
        self.ctx.system_drive = letter.to_ascii_uppercase();
        self
    }

    pub fn temp_folder<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.ctx.temp_folder = Some(dir.into());
        self
    }

    pub fn dest_folder<P: Into<PathBuf>>(mut self, dir: Option<P>) -> Self {
        self.ctx.dest_folder = dir.map(Into::into);
        self
    }

    pub fn image_name<S: Into<String>>(mut self, name: S) -> Self {
        self.ctx.image_name = name.into();
        self
    }

    pub fn temp_max_size(mut self, bytes: u64) -> Self {
        self.ctx.temp_max_size = bytes;
        self
    }

    pub fn dest_max_size(mut self, bytes: u64) -> Self {
        self.ctx.dest_max_size = bytes;
        self
    }

    pub fn shrink_size(mut self, bytes: u64) -> Self {
        self.ctx.shrink_size = bytes;
        self
    }

    pub fn container_type(mut self, t: ContainerType) -> Self {
        self.ctx.container_type = t;
        self
    }

    pub fn add_to_boot(mut self, on: bool) -> Self {
        self.ctx.add_to_boot = on;
        self
    }

    pub fn delete_temp(mut self, on: bool) -> Self {
        self.ctx.delete_temp = on;
        self
    }

    pub fn auto_reboot(mut self, on: bool) -> Self {
        self.ctx.auto_reboot = on;
        self
    }

    pub fn build(self) -> MigrationContext {
        self.ctx
    }
}

/// Pick a folder for the temporary image: the ready non-system drive with the most free space,
/// provided it exceeds what the system drive uses plus headroom.
pub fn find_temp_folder(host: &dyn HostEnvironment) -> Result<Option<PathBuf>> {
    let system = host.system_drive()?;
    let needed = system.used() + IMAGE_HEADROOM;

    let best = host
        .drives()?
        .into_iter()
        .filter(|d| d.ready && d.letter != system.letter && d.available_free > needed)
        .max_by_key(|d| d.available_free);

    Ok(best.map(|d| d.root().join(TEMP_FOLDER_NAME)))
}
