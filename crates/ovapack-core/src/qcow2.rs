//! QCOW2 header reader.
//!
//! Only the fixed big-endian header prefix shared by QCOW2 versions 1 to 3 is
//! parsed. That is enough to recover the virtual (logical) disk size, which is
//! what the OVF descriptor needs. Cluster tables are never touched; the actual
//! data conversion is done by an external tool.

use crate::error::{Error, Result};
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// QCOW2 magic number ("QFI" followed by 0xFB).
pub const QCOW2_MAGIC: u32 = 0x514649FB;

/// Size of the fixed header prefix in bytes.
pub const QCOW2_HEADER_SIZE: usize = 72;

/// Parsed QCOW2 header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Qcow2Header {
    /// Format version (2 or 3 for images written by current tools).
    pub version: u32,
    /// Offset of the backing file name, 0 if there is none.
    pub backing_file_offset: u64,
    /// Length of the backing file name in bytes.
    pub backing_file_size: u32,
    /// log2 of the cluster size.
    pub cluster_bits: u32,
    /// Virtual disk size in bytes.
    pub size: u64,
    /// 0 for plain images, non-zero when encrypted.
    pub crypt_method: u32,
    /// Number of L1 table entries.
    pub l1_size: u32,
    pub l1_table_offset: u64,
    pub refcount_table_offset: u64,
    pub refcount_table_clusters: u32,
    /// Number of internal snapshots.
    pub nb_snapshots: u32,
    pub snapshots_offset: u64,
}

fn be_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

fn be_u64(data: &[u8], offset: usize) -> u64 {
    u64::from_be_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
        data[offset + 4],
        data[offset + 5],
        data[offset + 6],
        data[offset + 7],
    ])
}

impl Qcow2Header {
    /// Parse a header from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Format`] if fewer than [`QCOW2_HEADER_SIZE`] bytes are
    /// given or the magic number does not match.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < QCOW2_HEADER_SIZE {
            return Err(Error::format(format!(
                "header too short: expected {} bytes, got {}",
                QCOW2_HEADER_SIZE,
                data.len()
            )));
        }

        let magic = be_u32(data, 0);
        if magic != QCOW2_MAGIC {
            return Err(Error::format(format!(
                "invalid QCOW2 magic: expected 0x{:X}, got 0x{:X}",
                QCOW2_MAGIC, magic
            )));
        }

        let header = Self {
            version: be_u32(data, 4),
            backing_file_offset: be_u64(data, 8),
            backing_file_size: be_u32(data, 16),
            cluster_bits: be_u32(data, 20),
            size: be_u64(data, 24),
            crypt_method: be_u32(data, 32),
            l1_size: be_u32(data, 36),
            l1_table_offset: be_u64(data, 40),
            refcount_table_offset: be_u64(data, 48),
            refcount_table_clusters: be_u32(data, 56),
            nb_snapshots: be_u32(data, 60),
            snapshots_offset: be_u64(data, 64),
        };

        if !(1..=3).contains(&header.version) {
            tracing::debug!(version = header.version, "unexpected QCOW2 version");
        }

        Ok(header)
    }

    /// Read and parse the header at the start of `path`.
    pub fn read(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| Error::io(e, path))?;

        let mut buf = Vec::with_capacity(QCOW2_HEADER_SIZE);
        file.take(QCOW2_HEADER_SIZE as u64)
            .read_to_end(&mut buf)
            .map_err(|e| Error::io(e, path))?;

        Self::from_bytes(&buf)
    }

    /// Cluster size in bytes, if `cluster_bits` is sane.
    pub fn cluster_size(&self) -> Option<u64> {
        1u64.checked_shl(self.cluster_bits)
    }

    /// Whether the image references a backing file.
    pub fn has_backing_file(&self) -> bool {
        self.backing_file_offset != 0 && self.backing_file_size != 0
    }

    /// Whether the image uses legacy QCOW encryption.
    pub fn is_encrypted(&self) -> bool {
        self.crypt_method != 0
    }
}

/// Read the logical (virtual) disk size of a QCOW2 image in bytes.
///
/// The physical size of the file is irrelevant here: sparse and compressed
/// images are usually much smaller on the host than what the guest sees.
pub fn read_logical_size(path: &Path) -> Result<u64> {
    Qcow2Header::read(path).map(|header| header.size)
}
