//! ovapack Core Library
//!
//! This crate turns QCOW2 disk images into OVA archives.
//!
//! # Overview
//!
//! The logical disk size is read from the QCOW2 header, an OVF descriptor is
//! rendered from it, the disk is converted to a streamOptimized VMDK by
//! `qemu-img`, descriptor and disk are hashed into a manifest, and `tar`
//! packages the three files. The main entry point is [`convert_image`].
//!
//! # Modules
//!
//! - [`error`] - Error types and Result alias
//! - [`qcow2`] - QCOW2 header parsing
//! - [`ovf`] - OVF descriptor generation
//! - [`manifest`] - Manifest digests
//! - [`tools`] - External converter and archiver
//! - [`ova`] - OVA assembly
//! - [`convert`] - Entry point owning the working directory
//!
//! # Quick Start
//!
//! ```no_run
//! use ovapack_core::{convert_image, ConvertOptions};
//! use std::path::Path;
//!
//! let input = Path::new("/path/to/disk.qcow2");
//! let output = Path::new("/path/to/disk.ova");
//!
//! convert_image(input, output, &ConvertOptions::default(), None).unwrap();
//! ```

pub mod convert;
pub mod error;
pub mod manifest;
pub mod ova;
pub mod ovf;
pub mod qcow2;
pub mod tools;

pub use error::{Error, Result};

pub use convert::{
    convert_image, image_info, ConvertOptions, ConvertPhase, ImageInfo, ProgressCallback,
};
pub use manifest::{generate_manifest, DigestAlgorithm, Manifest, ManifestEntry};
pub use ova::{ArtifactNames, Conversion, DiskImage, OvaSummary};
pub use ovf::{render, OvfConfig};
pub use qcow2::{read_logical_size, Qcow2Header};
pub use tools::{Archiver, DiskConverter, QemuImg, TarArchiver};
