//! External collaborators: the disk image converter and the archiver.
//!
//! Both run as synchronous child processes. Success is an exit status
//! contract; anything else becomes [`Error::ExternalTool`] with the command
//! line and exit status attached.

use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use std::process::Command;

/// Converts a disk image between formats.
pub trait DiskConverter {
    /// Convert `src` (in `src_format`) to `dst` (in `dst_format`).
    ///
    /// Must not return before `dst` is completely written.
    fn convert(&self, src_format: &str, src: &Path, dst_format: &str, dst: &Path) -> Result<()>;
}

/// Builds a tar archive from files in one directory.
pub trait Archiver {
    /// Archive `members` (basenames inside `base_dir`) into `output`, in order.
    fn archive(&self, base_dir: &Path, output: &Path, members: &[String]) -> Result<()>;
}

/// Render a command line for error messages and logs.
fn display_command(cmd: &Command) -> String {
    std::iter::once(cmd.get_program())
        .chain(cmd.get_args())
        .map(|s| s.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Run `cmd` to completion and map failure to [`Error::ExternalTool`].
pub fn run_command(cmd: &mut Command) -> Result<()> {
    let command = display_command(cmd);
    tracing::debug!(%command, "running external command");

    let output = cmd
        .output()
        .map_err(|e| Error::external_tool(&command, format!("failed to launch: {}", e), ""))?;

    if !output.status.success() {
        return Err(Error::external_tool(
            command,
            output.status.to_string(),
            String::from_utf8_lossy(&output.stderr),
        ));
    }

    Ok(())
}

/// `qemu-img convert`.
#[derive(Debug, Clone)]
pub struct QemuImg {
    program: PathBuf,
    /// Extra `-o` options for the target format.
    target_options: Option<String>,
}

impl Default for QemuImg {
    fn default() -> Self {
        Self {
            program: PathBuf::from("qemu-img"),
            target_options: Some("subformat=streamOptimized".to_string()),
        }
    }
}

impl QemuImg {
    /// Use a specific `qemu-img` binary.
    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    /// Override the `-o` options passed for the target format.
    pub fn target_options(mut self, options: Option<String>) -> Self {
        self.target_options = options;
        self
    }

    fn command(&self, src_format: &str, src: &Path, dst_format: &str, dst: &Path) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(["convert", "-f", src_format, "-O", dst_format]);
        if let Some(options) = &self.target_options {
            cmd.arg("-o").arg(options);
        }
        // Paths may start with `-`.
        cmd.arg("--").arg(src).arg(dst);
        cmd
    }
}

impl DiskConverter for QemuImg {
    fn convert(&self, src_format: &str, src: &Path, dst_format: &str, dst: &Path) -> Result<()> {
        tracing::info!(
            src = %src.display(),
            dst = %dst.display(),
            src_format,
            dst_format,
            "converting disk image"
        );
        run_command(&mut self.command(src_format, src, dst_format, dst))
    }
}

/// The system `tar`, writing ustar archives as OVA requires.
#[derive(Debug, Clone)]
pub struct TarArchiver {
    program: PathBuf,
}

impl Default for TarArchiver {
    fn default() -> Self {
        Self {
            program: PathBuf::from("tar"),
        }
    }
}

impl TarArchiver {
    /// Use a specific `tar` binary.
    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn command(&self, base_dir: &Path, output: &Path, members: &[String]) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg("-C")
            .arg(base_dir)
            .arg("--format=ustar")
            .arg("-c")
            .arg("-f")
            .arg(output)
            .arg("--")
            .args(members);
        cmd
    }
}

impl Archiver for TarArchiver {
    fn archive(&self, base_dir: &Path, output: &Path, members: &[String]) -> Result<()> {
        tracing::info!(
            output = %output.display(),
            members = ?members,
            "creating OVA archive"
        );
        run_command(&mut self.command(base_dir, output, members))
    }
}

/// Whether `program` can be launched (`<program> --version` succeeds).
pub fn is_available(program: &Path) -> bool {
    Command::new(program)
        .arg("--version")
        .output()
        .is_ok_and(|o| o.status.success())
}
