//! OVA archive assembly.
//!
//! An OVA is a tar archive holding the OVF descriptor, the disk and the
//! manifest, in that order, each stored under its bare file name. All three
//! are produced inside a working directory; the archive is first built there
//! and only moved to the requested destination once it is complete, so a
//! failed run never leaves a partial archive behind.

use crate::convert::ConvertPhase;
use crate::error::{Error, Result};
use crate::manifest::{self, DigestAlgorithm, Manifest};
use crate::ovf;
use crate::qcow2::Qcow2Header;
use crate::tools::{Archiver, DiskConverter};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

/// Format of the input image as understood by the converter.
pub const SOURCE_FORMAT: &str = "qcow2";

/// Disk format stored inside the archive.
pub const TARGET_FORMAT: &str = "vmdk";

/// A QCOW2 source image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskImage {
    path: PathBuf,
    basename: String,
    logical_size: u64,
}

impl DiskImage {
    /// Read the header of `path` and capture the logical size.
    pub fn open(path: &Path) -> Result<Self> {
        let basename = image_basename(path)?;
        let header = Qcow2Header::read(path)?;

        Ok(Self {
            path: path.to_path_buf(),
            basename,
            logical_size: header.size,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File stem every artifact name derives from.
    pub fn basename(&self) -> &str {
        &self.basename
    }

    /// Virtual disk size in bytes.
    pub fn logical_size(&self) -> u64 {
        self.logical_size
    }
}

/// Artifact names derived from an image basename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactNames {
    pub basename: String,
    pub descriptor: String,
    pub disk: String,
    pub manifest: String,
}

impl ArtifactNames {
    pub fn new(basename: &str) -> Self {
        Self {
            basename: basename.to_string(),
            descriptor: ovf::descriptor_file_name(basename),
            disk: format!("{}.{}", basename, TARGET_FORMAT),
            manifest: manifest::manifest_file_name(basename),
        }
    }

    /// Archive members in packaging order.
    pub fn members(&self) -> Vec<String> {
        vec![
            self.descriptor.clone(),
            self.disk.clone(),
            self.manifest.clone(),
        ]
    }
}

/// Outcome of a successful conversion.
#[derive(Debug, Clone)]
pub struct OvaSummary {
    /// Where the archive was published.
    pub output: PathBuf,
    /// Logical size read from the source header.
    pub logical_size: u64,
    /// Names of the archive members.
    pub names: ArtifactNames,
    /// Manifest as written into the archive.
    pub manifest: Manifest,
}

/// File stem of an input image, as UTF-8.
pub fn image_basename(path: &Path) -> Result<String> {
    path.file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| {
            Error::precondition(format!(
                "input path has no usable file name: {}",
                path.display()
            ))
        })
}

/// Fail if anything (including a dangling symlink) exists at `output`.
pub fn ensure_output_absent(output: &Path) -> Result<()> {
    if fs::symlink_metadata(output).is_ok() {
        return Err(output_exists(output));
    }
    Ok(())
}

fn output_exists(output: &Path) -> Error {
    Error::precondition(format!("output path '{}' exists", output.display()))
}

/// A single QCOW2 → OVA conversion bound to a working directory.
#[derive(Debug)]
pub struct Conversion {
    input: PathBuf,
    output: PathBuf,
    work_dir: PathBuf,
    names: ArtifactNames,
    digest: DigestAlgorithm,
}

impl Conversion {
    /// Prepare a conversion.
    ///
    /// Refuses to proceed if `output` already exists; nothing is read,
    /// written or launched in that case.
    pub fn new(
        input: &Path,
        output: &Path,
        work_dir: &Path,
        digest: DigestAlgorithm,
    ) -> Result<Self> {
        ensure_output_absent(output)?;

        let basename = image_basename(input)?;
        // tar resolves member names against -C but the output against the
        // caller's cwd, so keep every path absolute.
        let work_dir = fs::canonicalize(work_dir).map_err(|e| Error::io(e, work_dir))?;

        tracing::info!(image = %basename, work_dir = %work_dir.display(), "prepared conversion");

        Ok(Self {
            input: input.to_path_buf(),
            output: output.to_path_buf(),
            work_dir,
            names: ArtifactNames::new(&basename),
            digest,
        })
    }

    pub fn names(&self) -> &ArtifactNames {
        &self.names
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn descriptor_path(&self) -> PathBuf {
        self.work_dir.join(&self.names.descriptor)
    }

    pub fn disk_path(&self) -> PathBuf {
        self.work_dir.join(&self.names.disk)
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.work_dir.join(&self.names.manifest)
    }

    /// Where the archive is built before being published.
    pub fn staging_path(&self) -> PathBuf {
        self.work_dir.join(".ovapack-staging.ova")
    }

    /// Run the pipeline: header, descriptor, disk conversion, manifest, archive.
    pub fn run(
        &self,
        converter: &dyn DiskConverter,
        archiver: &dyn Archiver,
        report: &dyn Fn(ConvertPhase),
    ) -> Result<OvaSummary> {
        report(ConvertPhase::ReadingHeader);
        let image = DiskImage::open(&self.input)?;
        tracing::info!(
            image = %image.path().display(),
            logical_size = image.logical_size(),
            "read QCOW2 header"
        );

        report(ConvertPhase::Describing);
        ovf::write_descriptor(
            &self.work_dir,
            image.basename(),
            &self.names.disk,
            image.logical_size(),
        )?;

        report(ConvertPhase::Converting);
        converter.convert(SOURCE_FORMAT, image.path(), TARGET_FORMAT, &self.disk_path())?;

        // The disk is complete only now; hashing it any earlier would
        // produce a digest of a partial file.
        report(ConvertPhase::Manifesting);
        let manifest = manifest::generate_manifest(
            &[self.descriptor_path(), self.disk_path()],
            &self.manifest_path(),
            self.digest,
        )?;

        report(ConvertPhase::Archiving);
        let staging = self.staging_path();
        archiver.archive(&self.work_dir, &staging, &self.names.members())?;
        publish(&staging, &self.output)?;

        tracing::info!(output = %self.output.display(), "OVA archive complete");
        report(ConvertPhase::Complete);

        Ok(OvaSummary {
            output: self.output.clone(),
            logical_size: image.logical_size(),
            names: self.names.clone(),
            manifest,
        })
    }
}

/// Move a finished archive to its destination without overwriting anything.
fn publish(staging: &Path, output: &Path) -> Result<()> {
    publish_with(staging, output, |src, dst| fs::hard_link(src, dst))
}

/// Link `staging` to `output`, falling back to an exclusive copy when the
/// link cannot be made (another filesystem, no hard link support). Both
/// paths fail instead of replacing a file that appears at `output`.
fn publish_with<L>(staging: &Path, output: &Path, link: L) -> Result<()>
where
    L: FnOnce(&Path, &Path) -> io::Result<()>,
{
    ensure_output_absent(output)?;

    match link(staging, output) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => return Err(output_exists(output)),
        Err(e) => {
            tracing::debug!(error = %e, "hard link failed, copying archive into place");
            copy_new(staging, output)?;
        }
    }

    if let Err(e) = fs::remove_file(staging) {
        tracing::warn!(path = %staging.display(), error = %e, "failed to remove staged archive");
    }

    Ok(())
}

fn copy_new(src: &Path, dst: &Path) -> Result<()> {
    let mut reader = File::open(src).map_err(|e| Error::io(e, src))?;
    let mut writer = match OpenOptions::new().write(true).create_new(true).open(dst) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => return Err(output_exists(dst)),
        Err(e) => return Err(Error::io(e, dst)),
    };

    let result = io::copy(&mut reader, &mut writer).and_then(|_| writer.sync_all());
    if let Err(e) = result {
        drop(writer);
        let _ = fs::remove_file(dst);
        return Err(Error::io(e, dst));
    }

    Ok(())
}
