//! External tool invocation and diskpart scripts.
//!
//! - `ProcessToolRunner` spawns the tool, waits, and captures stdout (stderr appended).
//! - `DiskpartScript` writes a script next to the image, runs `diskpart /s <file>` and always
//!   removes the script afterwards.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use log::debug;

use crate::access::{ExternalToolRunner, ToolOutput};
use crate::config::ContainerType;
use crate::consts::{DISKPART, DISKPART_SCRIPT_NAME, ONE_MIB};
use crate::error::{IoContext, Result};

#[derive(Debug, Clone, Default)]
pub struct ProcessToolRunner {
    tools_dir: Option<PathBuf>,
}

impl ProcessToolRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve bare tool names inside `dir` instead of through PATH.
    pub fn with_tools_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.tools_dir = Some(dir.into());
        self
    }

    fn program(&self, tool: &str) -> PathBuf {
        match &self.tools_dir {
            Some(dir) if !Path::new(tool).is_absolute() => {
                let candidate = dir.join(tool);
                if candidate.exists() {
                    candidate
                } else {
                    PathBuf::from(tool)
                }
            }
            _ => PathBuf::from(tool),
        }
    }
}

impl ExternalToolRunner for ProcessToolRunner {
    fn run(&self, tool: &str, args: &[&str]) -> Result<ToolOutput> {
        let program = self.program(tool);
        debug!("tool: run {} {}", program.display(), args.join(" "));

        let out = Command::new(&program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .op("spawn external tool")?;

        let mut stdout = String::from_utf8_lossy(&out.stdout).into_owned();
        if !out.stderr.is_empty() {
            stdout.push_str(&String::from_utf8_lossy(&out.stderr));
        }
        Ok(ToolOutput {
            // killed by a signal: no exit code
            code: out.status.code().unwrap_or(-1),
            stdout,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiskpartScript {
    lines: Vec<String>,
}

fn quoted(path: &Path) -> String {
    format!("\"{}\"", path.display())
}

impl DiskpartScript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn line<S: Into<String>>(mut self, line: S) -> Self {
        self.lines.push(line.into());
        self
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn render(&self) -> String {
        let mut s = self.lines.join("\r\n");
        s.push_str("\r\n");
        s
    }

    /// Create an image of `max_size` bytes and give it an empty MBR partition table.
    pub fn create_image(image: &Path, max_size: u64, kind: ContainerType) -> Self {
        Self::new()
            .line(format!(
                "create vdisk file={} maximum={} type={}",
                quoted(image),
                max_size / ONE_MIB,
                kind.diskpart_type()
            ))
            .line(format!("select vdisk file={}", quoted(image)))
            .line("attach vdisk")
            .line("convert mbr")
            .line("detach vdisk")
            .line("exit")
    }

    /// Shrink partition 1 of `image` by `shrink_size` bytes. The retry variant leaves out
    /// `attach vdisk`, since a failed first attempt may leave the image attached.
    pub fn shrink_volume(image: &Path, shrink_size: u64, attach: bool) -> Self {
        let mut s = Self::new().line(format!("select vdisk file={}", quoted(image)));
        if attach {
            s = s.line("attach vdisk");
        }
        s.line("select partition 1")
            .line(format!("shrink desired={}", shrink_size / ONE_MIB))
            .line("detach vdisk")
            .line("exit")
    }

    /// Attach `image` and print its details (the output names the backing disk number).
    pub fn attach_image(image: &Path) -> Self {
        Self::new()
            .line(format!("select vdisk file={}", quoted(image)))
            .line("attach vdisk")
            .line("detail vdisk")
            .line("exit")
    }

    pub fn detach_image(image: &Path) -> Self {
        Self::new()
            .line(format!("select vdisk file={}", quoted(image)))
            .line("detach vdisk")
            .line("exit")
    }

    /// Attach `image` and mount its first partition on the empty folder `dir`.
    pub fn mount_partition(image: &Path, dir: &Path) -> Self {
        Self::new()
            .line(format!("select vdisk file={}", quoted(image)))
            .line("attach vdisk")
            .line("select partition 1")
            .line(format!("assign mount={}", quoted(dir)))
            .line("exit")
    }

    pub fn unmount_partition(image: &Path, dir: &Path) -> Self {
        Self::new()
            .line(format!("select vdisk file={}", quoted(image)))
            .line("select partition 1")
            .line(format!("remove mount={}", quoted(dir)))
            .line("detach vdisk")
            .line("exit")
    }

    /// Write the script into `dir`, run diskpart on it and remove it again.
    pub fn run(&self, tools: &dyn ExternalToolRunner, dir: &Path) -> Result<String> {
        let path = dir.join(DISKPART_SCRIPT_NAME);
        fs::write(&path, self.render()).op("write diskpart script")?;
        debug!("diskpart: script {}\n{}", path.display(), self.lines.join("\n"));

        let script = path.to_string_lossy().into_owned();
        let res = tools.run_checked(DISKPART, &["/s", &script]);

        if let Err(e) = fs::remove_file(&path) {
            debug!("diskpart: could not remove {}: {}", path.display(), e);
        }
        res
    }
}
