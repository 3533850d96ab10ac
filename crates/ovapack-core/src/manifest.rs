//! OVA manifest generation.
//!
//! The manifest binds the archive members together: one line per file with
//! its digest, in the form `SHA1(test.ovf) = <hex>`. Files are hashed in
//! fixed-size chunks so multi-gigabyte disks never have to fit in memory.
//!
//! Digests must only be taken once a file is complete. Hashing a disk while
//! the converter is still writing it yields a wrong digest that nothing
//! downstream would notice until import time.

use crate::error::{Error, Result};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Read size used when hashing files.
pub const MANIFEST_CHUNK_SIZE: usize = 8 * 1024;

/// Digest algorithm used for manifest entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DigestAlgorithm {
    /// SHA-1, understood by every OVF 1.x importer.
    #[default]
    Sha1,
    /// SHA-256 (OVF 2.0).
    Sha256,
}

impl DigestAlgorithm {
    /// Name used in manifest lines.
    pub fn label(&self) -> &'static str {
        match self {
            DigestAlgorithm::Sha1 => "SHA1",
            DigestAlgorithm::Sha256 => "SHA256",
        }
    }

    /// Length of the hex-encoded digest.
    pub fn hex_len(&self) -> usize {
        match self {
            DigestAlgorithm::Sha1 => 40,
            DigestAlgorithm::Sha256 => 64,
        }
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for DigestAlgorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "SHA1" => Ok(DigestAlgorithm::Sha1),
            "SHA256" => Ok(DigestAlgorithm::Sha256),
            other => Err(Error::manifest(format!("unsupported digest: {}", other))),
        }
    }
}

/// One manifest line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub algorithm: DigestAlgorithm,
    /// Archive member name (a basename, never a path).
    pub file_name: String,
    /// Lowercase hex digest.
    pub digest: String,
}

impl fmt::Display for ManifestEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({}) = {}", self.algorithm, self.file_name, self.digest)
    }
}

impl ManifestEntry {
    /// Parse a single manifest line.
    ///
    /// Accepts both `SHA1(a) = x` and the `SHA1(a)= x` spelling some
    /// exporters use.
    pub fn parse(line: &str) -> Result<Self> {
        let malformed = || Error::manifest(format!("malformed manifest line: {:?}", line));

        let open = line.find('(').ok_or_else(malformed)?;
        let close = line.rfind(')').ok_or_else(malformed)?;
        if close < open {
            return Err(malformed());
        }

        let algorithm: DigestAlgorithm = line[..open].trim().parse()?;
        let file_name = &line[open + 1..close];
        let digest = line[close + 1..]
            .trim_start()
            .strip_prefix('=')
            .ok_or_else(malformed)?
            .trim()
            .to_ascii_lowercase();

        if file_name.is_empty()
            || digest.len() != algorithm.hex_len()
            || !digest.bytes().all(|b| b.is_ascii_hexdigit())
        {
            return Err(malformed());
        }

        Ok(Self {
            algorithm,
            file_name: file_name.to_string(),
            digest,
        })
    }
}

/// An ordered list of manifest entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    pub entries: Vec<ManifestEntry>,
}

impl Manifest {
    /// Hash each file in order.
    pub fn from_paths(paths: &[PathBuf], algorithm: DigestAlgorithm) -> Result<Self> {
        let mut entries = Vec::with_capacity(paths.len());

        for path in paths {
            let file_name = path
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| {
                    Error::manifest(format!("path has no usable file name: {}", path.display()))
                })?
                .to_string();
            let digest = digest_file(path, algorithm)?;
            tracing::debug!(file = %file_name, %algorithm, %digest, "hashed manifest member");

            entries.push(ManifestEntry {
                algorithm,
                file_name,
                digest,
            });
        }

        Ok(Self { entries })
    }

    /// Parse manifest text. Blank lines are ignored.
    pub fn parse(text: &str) -> Result<Self> {
        let entries = text
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(ManifestEntry::parse)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { entries })
    }

    /// Render the manifest, one newline-terminated line per entry.
    pub fn render(&self) -> String {
        self.entries
            .iter()
            .map(|entry| format!("{}\n", entry))
            .collect()
    }

    /// Look up the entry for an archive member.
    pub fn get(&self, file_name: &str) -> Option<&ManifestEntry> {
        self.entries.iter().find(|e| e.file_name == file_name)
    }

    /// Re-hash every listed file under `dir` and compare.
    pub fn verify(&self, dir: &Path) -> Result<()> {
        for entry in &self.entries {
            let actual = digest_file(&dir.join(&entry.file_name), entry.algorithm)?;
            if actual != entry.digest {
                return Err(Error::manifest(format!(
                    "digest mismatch for {}: manifest has {}, file has {}",
                    entry.file_name, entry.digest, actual
                )));
            }
        }
        Ok(())
    }
}

fn hash_stream<D: Digest, R: Read>(mut reader: R, chunk_size: usize) -> std::io::Result<String> {
    let mut hasher = D::new();
    let mut buf = vec![0u8; chunk_size.max(1)];

    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buf[..n]);
    }

    Ok(to_hex(&hasher.finalize()))
}

/// Hash everything `reader` yields, reading `chunk_size` bytes at a time.
pub fn digest_reader<R: Read>(
    reader: R,
    algorithm: DigestAlgorithm,
    chunk_size: usize,
) -> std::io::Result<String> {
    match algorithm {
        DigestAlgorithm::Sha1 => hash_stream::<Sha1, R>(reader, chunk_size),
        DigestAlgorithm::Sha256 => hash_stream::<Sha256, R>(reader, chunk_size),
    }
}

/// Hash a file in [`MANIFEST_CHUNK_SIZE`] chunks.
pub fn digest_file(path: &Path, algorithm: DigestAlgorithm) -> Result<String> {
    let file = File::open(path).map_err(|e| Error::io(e, path))?;
    digest_reader(file, algorithm, MANIFEST_CHUNK_SIZE).map_err(|e| Error::io(e, path))
}

/// Hash in-memory data.
pub fn compute_digest(data: &[u8], algorithm: DigestAlgorithm) -> String {
    match algorithm {
        DigestAlgorithm::Sha1 => to_hex(&Sha1::digest(data)),
        DigestAlgorithm::Sha256 => to_hex(&Sha256::digest(data)),
    }
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Manifest file name for an image basename.
pub fn manifest_file_name(basename: &str) -> String {
    format!("{}.mf", basename)
}

/// Hash `paths` in order and write the manifest to `dest`.
pub fn generate_manifest(
    paths: &[PathBuf],
    dest: &Path,
    algorithm: DigestAlgorithm,
) -> Result<Manifest> {
    let manifest = Manifest::from_paths(paths, algorithm)?;

    tracing::info!(path = %dest.display(), entries = manifest.entries.len(), "writing manifest");
    fs::write(dest, manifest.render()).map_err(|e| Error::io(e, dest))?;

    Ok(manifest)
}
