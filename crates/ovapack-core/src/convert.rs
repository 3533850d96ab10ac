//! Conversion entry point.
//!
//! [`convert_image`] wires the default external tools to a [`Conversion`]
//! running in a fresh temporary working directory, which is removed when the
//! run ends, successfully or not.
//!
//! # Example
//!
//! ```no_run
//! use ovapack_core::{convert_image, ConvertOptions};
//! use std::path::Path;
//!
//! let summary = convert_image(
//!     Path::new("fedora.qcow2"),
//!     Path::new("fedora.ova"),
//!     &ConvertOptions::default(),
//!     None,
//! )
//! .unwrap();
//! println!("wrote {}", summary.output.display());
//! ```

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::manifest::DigestAlgorithm;
use crate::ova::{ensure_output_absent, image_basename, ArtifactNames, Conversion, OvaSummary};
use crate::ovf::BYTES_PER_GIB;
use crate::qcow2::Qcow2Header;
use crate::tools::{QemuImg, TarArchiver};

/// Options for a conversion run.
#[derive(Debug, Clone)]
pub struct ConvertOptions {
    /// Directory the temporary working directory is created in
    /// (system default when `None`).
    pub temp_root: Option<PathBuf>,
    /// Digest used for the manifest.
    pub digest: DigestAlgorithm,
    /// `qemu-img` binary.
    pub qemu_img: PathBuf,
    /// `tar` binary.
    pub tar: PathBuf,
}

impl Default for ConvertOptions {
    fn default() -> Self {
        Self {
            temp_root: None,
            digest: DigestAlgorithm::Sha1,
            qemu_img: PathBuf::from("qemu-img"),
            tar: PathBuf::from("tar"),
        }
    }
}

impl ConvertOptions {
    /// Set the directory temporary files are created in.
    pub fn with_temp_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.temp_root = Some(root.into());
        self
    }

    /// Set the manifest digest.
    pub fn with_digest(mut self, digest: DigestAlgorithm) -> Self {
        self.digest = digest;
        self
    }
}

/// Phase of a conversion run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvertPhase {
    /// Reading the QCOW2 header.
    ReadingHeader,
    /// Writing the OVF descriptor.
    Describing,
    /// Running the external disk converter.
    Converting,
    /// Hashing descriptor and disk.
    Manifesting,
    /// Building and publishing the archive.
    Archiving,
    /// Conversion complete.
    Complete,
}

impl fmt::Display for ConvertPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConvertPhase::ReadingHeader => write!(f, "Reading header"),
            ConvertPhase::Describing => write!(f, "Writing descriptor"),
            ConvertPhase::Converting => write!(f, "Converting disk"),
            ConvertPhase::Manifesting => write!(f, "Writing manifest"),
            ConvertPhase::Archiving => write!(f, "Archiving"),
            ConvertPhase::Complete => write!(f, "Complete"),
        }
    }
}

/// Type alias for the progress callback function.
pub type ProgressCallback = Box<dyn Fn(ConvertPhase) + Send>;

/// Summary of a QCOW2 image and the archive it would produce.
#[derive(Debug, Clone)]
pub struct ImageInfo {
    pub header: Qcow2Header,
    /// Size of the image file on the host.
    pub physical_size: u64,
    /// Capacity as declared in the descriptor (whole GiB, truncated).
    pub capacity_gb: u64,
    pub names: ArtifactNames,
}

/// Inspect an image without converting it.
pub fn image_info(path: &Path) -> Result<ImageInfo> {
    let basename = image_basename(path)?;
    let header = Qcow2Header::read(path)?;
    let physical_size = fs::metadata(path)
        .map_err(|e| Error::io(e, path))?
        .len();

    Ok(ImageInfo {
        capacity_gb: header.size / BYTES_PER_GIB,
        header,
        physical_size,
        names: ArtifactNames::new(&basename),
    })
}

/// Convert a QCOW2 image at `input` into an OVA archive at `output`.
///
/// Fails with [`Error::Precondition`] before doing anything if `output`
/// exists. On any other failure no file is left at `output`.
pub fn convert_image(
    input: &Path,
    output: &Path,
    options: &ConvertOptions,
    progress_callback: Option<ProgressCallback>,
) -> Result<OvaSummary> {
    ensure_output_absent(output)?;

    let mut builder = tempfile::Builder::new();
    builder.prefix("ovapack-");
    let work_dir = match &options.temp_root {
        Some(root) => builder.tempdir_in(root).map_err(|e| Error::io(e, root))?,
        None => builder.tempdir().map_err(Error::io_simple)?,
    };
    tracing::debug!(work_dir = %work_dir.path().display(), "created working directory");

    let report = |phase: ConvertPhase| {
        tracing::debug!(%phase, "conversion phase");
        if let Some(ref callback) = progress_callback {
            callback(phase);
        }
    };

    let converter = QemuImg::with_program(&options.qemu_img);
    let archiver = TarArchiver::with_program(&options.tar);

    let conversion = Conversion::new(input, output, work_dir.path(), options.digest)?;
    let result = conversion.run(&converter, &archiver, &report);

    if let Err(e) = work_dir.close() {
        tracing::warn!(error = %e, "failed to remove working directory");
    }

    result
}
