//! Shared constants (pump defaults, sizes, image layout, tool names, artifacts).

// -------- Sizes --------
pub const ONE_MIB: u64 = 1 << 20;
pub const ONE_GIB: u64 = 1 << 30;
pub const FIVE_GIB: u64 = 5 * ONE_GIB;
// Headroom added on top of the system volume size for the temporary image.
pub const IMAGE_HEADROOM: u64 = 200 * ONE_MIB;

// -------- Sparse pump --------
pub const DEFAULT_CHUNK_SIZE: usize = 512;
pub const DEFAULT_BUFFER_SIZE: usize = 512 * 1024;

// -------- MBR --------
pub const SECTOR_SIZE: u64 = 512;
pub const MBR_PART_TABLE_OFF: usize = 446;
pub const MBR_PART_ENTRY_SIZE: usize = 16;
pub const MBR_PART_ENTRIES: usize = 4;
pub const MBR_SIGNATURE_OFF: usize = 510;
pub const MBR_SIGNATURE: [u8; 2] = [0x55, 0xAA];
pub const PART_TYPE_NTFS: u8 = 0x07;

// -------- NTFS --------
pub const NTFS_OEM_ID: &[u8; 8] = b"NTFS    ";
pub const NTFS_BITMAP_RECORD: u64 = 6;
pub const NTFS_FILE_MAGIC: &[u8; 4] = b"FILE";
pub const NTFS_ATTR_DATA: u32 = 0x80;
pub const NTFS_ATTR_END: u32 = 0xFFFF_FFFF;
pub const NTFS_MAX_RECORD_SIZE: u64 = 64 * 1024;

// -------- Image defaults --------
pub const DEFAULT_IMAGE_NAME: &str = "BootClone_System_Image.vhdx";
pub const TEMP_FOLDER_NAME: &str = "BootClone_Temp";
pub const FINAL_FOLDER_NAME: &str = "VHD_Boot";
pub const DISKPART_SCRIPT_NAME: &str = "diskpartScriptContent.txt";
pub const MOUNT_DIR_NAME: &str = "mnt";
pub const BOOT_ENTRY_DESCRIPTION: &str = "BootClone OS Image";

// -------- Tools --------
pub const DISKPART: &str = "diskpart.exe";
pub const BCDEDIT: &str = "bcdedit.exe";
pub const VSSADMIN: &str = "vssadmin.exe";
pub const REG: &str = "reg.exe";
pub const MANAGE_BDE: &str = "manage-bde.exe";
pub const WMIC: &str = "wmic.exe";
pub const CMD: &str = "cmd.exe";
pub const SHUTDOWN: &str = "shutdown.exe";

// -------- Shrink --------
pub const SHRINK_RETRIES: u32 = 1;

// -------- Cloned volume fix-ups --------
// Snapshot-store files left by the shadow copy service (can be very large).
pub const SNAPSHOT_STORE_DIR: &str = "System Volume Information";
pub const SNAPSHOT_STORE_SUFFIX: &str = "{3808876B-C176-4e48-B7AE-04046E6CC752}";
pub const PAGE_FILE: &str = "pagefile.sys";
pub const HIBERNATION_FILE: &str = "hiberfil.sys";
pub const SYSTEM_HIVE: [&str; 4] = ["Windows", "System32", "config", "SYSTEM"];
pub const HIVE_MOUNT_KEY: &str = r"HKLM\BOOTCLONE_SYSTEM";
pub const MOUNTED_DEVICES_KEY: &str = "MountedDevices";
pub const REG_EDITION_KEY: &str = r"HKLM\SOFTWARE\Microsoft\Windows NT\CurrentVersion";

// -------- Locking --------
pub const LOCK_FILE: &str = "bootclone.lock";
