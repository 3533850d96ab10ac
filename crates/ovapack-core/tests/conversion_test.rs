//! Integration tests for the QCOW2 → OVA conversion pipeline.
//!
//! `qemu-img` is replaced by in-process converters so these tests run
//! anywhere. Tests that build a real archive need the system `tar` and skip
//! themselves when it is missing.

use ovapack_core::manifest::Manifest;
use ovapack_core::qcow2::{QCOW2_HEADER_SIZE, QCOW2_MAGIC};
use ovapack_core::tools::{is_available, Archiver, DiskConverter, TarArchiver};
use ovapack_core::{convert_image, ConvertOptions, ConvertPhase, Conversion, DigestAlgorithm, Error};
use std::cell::{Cell, RefCell};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

const TEN_GIB: u64 = 10_737_418_240;
const FAKE_VMDK: &[u8] = b"KDMV\x03\x00\x00\x00 stream-optimized payload";

/// Skip test if the system tar is not available.
macro_rules! require_tar {
    () => {
        if !is_available(Path::new("tar")) {
            eprintln!("Skipping test: `tar` not found in PATH");
            return;
        }
    };
}

/// Write `<dir>/<name>` with a QCOW2 header declaring `size` bytes.
fn create_qcow2(dir: &Path, name: &str, magic: u32, size: u64) -> PathBuf {
    let mut data = vec![0u8; QCOW2_HEADER_SIZE + 512];
    data[0..4].copy_from_slice(&magic.to_be_bytes());
    data[4..8].copy_from_slice(&3u32.to_be_bytes());
    data[20..24].copy_from_slice(&16u32.to_be_bytes());
    data[24..32].copy_from_slice(&size.to_be_bytes());

    let path = dir.join(name);
    fs::write(&path, data).expect("Failed to write QCOW2 fixture");
    path
}

/// Writes a fixed payload instead of running qemu-img.
#[derive(Default)]
struct FakeConverter {
    calls: Cell<usize>,
}

impl DiskConverter for FakeConverter {
    fn convert(&self, src_format: &str, src: &Path, dst_format: &str, dst: &Path) -> ovapack_core::Result<()> {
        self.calls.set(self.calls.get() + 1);
        assert_eq!(src_format, "qcow2");
        assert_eq!(dst_format, "vmdk");
        assert!(src.exists());
        fs::write(dst, FAKE_VMDK).map_err(|e| Error::io(e, dst))
    }
}

/// Leaves a partial disk behind and fails like a crashed converter.
struct FailingConverter;

impl DiskConverter for FailingConverter {
    fn convert(&self, _: &str, _: &Path, _: &str, dst: &Path) -> ovapack_core::Result<()> {
        fs::write(dst, b"KDMV partial").map_err(|e| Error::io(e, dst))?;
        Err(Error::external_tool("qemu-img convert", "exit status: 1", "No space left on device"))
    }
}

/// Records its invocation and writes a placeholder archive.
#[derive(Default)]
struct RecordingArchiver {
    calls: RefCell<Vec<(PathBuf, PathBuf, Vec<String>)>>,
}

impl Archiver for RecordingArchiver {
    fn archive(&self, base_dir: &Path, output: &Path, members: &[String]) -> ovapack_core::Result<()> {
        for member in members {
            assert!(base_dir.join(member).is_file(), "{} missing at archive time", member);
        }
        self.calls
            .borrow_mut()
            .push((base_dir.to_path_buf(), output.to_path_buf(), members.to_vec()));
        fs::write(output, b"archive").map_err(|e| Error::io(e, output))
    }
}

/// Always fails, as tar would on a full disk.
struct FailingArchiver;

impl Archiver for FailingArchiver {
    fn archive(&self, _: &Path, output: &Path, _: &[String]) -> ovapack_core::Result<()> {
        fs::write(output, b"trunc").map_err(|e| Error::io(e, output))?;
        Err(Error::external_tool("tar -c", "exit status: 2", ""))
    }
}

fn no_progress(_: ConvertPhase) {}

#[test]
fn test_pipeline_with_fake_tools() {
    let input_dir = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    let out_dir = tempfile::tempdir().unwrap();
    let input = create_qcow2(input_dir.path(), "test.qcow2", QCOW2_MAGIC, TEN_GIB);
    let output = out_dir.path().join("test.ova");

    let converter = FakeConverter::default();
    let archiver = RecordingArchiver::default();
    let conversion = Conversion::new(&input, &output, work.path(), DigestAlgorithm::Sha1).unwrap();
    let summary = conversion.run(&converter, &archiver, &no_progress).unwrap();

    assert_eq!(converter.calls.get(), 1);
    assert_eq!(summary.logical_size, TEN_GIB);
    assert_eq!(summary.output, output);
    assert_eq!(fs::read(&output).unwrap(), b"archive");

    let calls = archiver.calls.borrow();
    assert_eq!(calls.len(), 1);
    let (base_dir, staging, members) = &calls[0];
    assert_eq!(base_dir, conversion.work_dir());
    assert!(staging.starts_with(conversion.work_dir()));
    assert_eq!(members, &vec!["test.ovf", "test.vmdk", "test.mf"]);

    let manifest_text = fs::read_to_string(conversion.manifest_path()).unwrap();
    let lines: Vec<&str> = manifest_text.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].starts_with("SHA1(test.ovf) = "));
    assert!(lines[1].starts_with("SHA1(test.vmdk) = "));
    Manifest::parse(&manifest_text).unwrap().verify(conversion.work_dir()).unwrap();
}

#[test]
fn test_pipeline_phase_order() {
    let dir = tempfile::tempdir().unwrap();
    let input = create_qcow2(dir.path(), "disk.qcow2", QCOW2_MAGIC, 1 << 30);
    let work = tempfile::tempdir().unwrap();
    let phases = RefCell::new(Vec::new());

    Conversion::new(&input, &dir.path().join("disk.ova"), work.path(), DigestAlgorithm::Sha1)
        .unwrap()
        .run(&FakeConverter::default(), &RecordingArchiver::default(), &|p| {
            phases.borrow_mut().push(p)
        })
        .unwrap();

    assert_eq!(
        phases.into_inner(),
        vec![
            ConvertPhase::ReadingHeader,
            ConvertPhase::Describing,
            ConvertPhase::Converting,
            ConvertPhase::Manifesting,
            ConvertPhase::Archiving,
            ConvertPhase::Complete,
        ]
    );
}

#[test]
fn test_existing_output_refused_before_any_work() {
    let dir = tempfile::tempdir().unwrap();
    let input = create_qcow2(dir.path(), "test.qcow2", QCOW2_MAGIC, TEN_GIB);
    let output = dir.path().join("test.ova");
    fs::write(&output, b"precious").unwrap();
    let input_before = fs::read(&input).unwrap();

    // qemu-img pointing nowhere: launching it would surface as ExternalTool.
    let options = ConvertOptions {
        qemu_img: PathBuf::from("/nonexistent/qemu-img"),
        ..ConvertOptions::default()
    };

    for _ in 0..2 {
        let err = convert_image(&input, &output, &options, None).unwrap_err();
        assert!(matches!(err, Error::Precondition { .. }), "got {err}");
        assert_eq!(fs::read(&output).unwrap(), b"precious");
    }
    assert_eq!(fs::read(&input).unwrap(), input_before);

    let work = tempfile::tempdir().unwrap();
    let err = Conversion::new(&input, &output, work.path(), DigestAlgorithm::Sha1).unwrap_err();
    assert!(matches!(err, Error::Precondition { .. }));
    assert_eq!(fs::read_dir(work.path()).unwrap().count(), 0);
}

#[test]
fn test_converter_failure_leaves_no_archive_or_manifest() {
    let dir = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    let input = create_qcow2(dir.path(), "test.qcow2", QCOW2_MAGIC, TEN_GIB);
    let output = dir.path().join("test.ova");
    let archiver = RecordingArchiver::default();

    let conversion = Conversion::new(&input, &output, work.path(), DigestAlgorithm::Sha1).unwrap();
    let err = conversion.run(&FailingConverter, &archiver, &no_progress).unwrap_err();

    assert!(matches!(err, Error::ExternalTool { .. }));
    assert!(err.to_string().contains("qemu-img convert"));
    assert!(!output.exists());
    assert!(!conversion.manifest_path().exists());
    assert!(archiver.calls.borrow().is_empty());
}

#[test]
fn test_archiver_failure_leaves_no_output() {
    let dir = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    let input = create_qcow2(dir.path(), "test.qcow2", QCOW2_MAGIC, TEN_GIB);
    let output = dir.path().join("test.ova");

    let conversion = Conversion::new(&input, &output, work.path(), DigestAlgorithm::Sha1).unwrap();
    let err = conversion
        .run(&FakeConverter::default(), &FailingArchiver, &no_progress)
        .unwrap_err();

    assert!(matches!(err, Error::ExternalTool { .. }));
    assert!(!output.exists());
}

#[test]
fn test_bad_magic_stops_before_conversion() {
    let dir = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    let input = create_qcow2(dir.path(), "test.qcow2", 0xDEAD_BEEF, TEN_GIB);
    let converter = FakeConverter::default();

    let conversion =
        Conversion::new(&input, &dir.path().join("test.ova"), work.path(), DigestAlgorithm::Sha1).unwrap();
    let err = conversion
        .run(&converter, &RecordingArchiver::default(), &no_progress)
        .unwrap_err();

    assert!(matches!(err, Error::Format { .. }));
    assert_eq!(converter.calls.get(), 0);
    assert!(!conversion.descriptor_path().exists());
}

#[cfg(unix)]
#[test]
fn test_non_zero_converter_exit_through_entry_point() {
    let dir = tempfile::tempdir().unwrap();
    let temp_root = tempfile::tempdir().unwrap();
    let input = create_qcow2(dir.path(), "test.qcow2", QCOW2_MAGIC, TEN_GIB);
    let output = dir.path().join("test.ova");

    let options = ConvertOptions {
        qemu_img: PathBuf::from("false"),
        ..ConvertOptions::default().with_temp_root(temp_root.path())
    };
    let err = convert_image(&input, &output, &options, None).unwrap_err();

    match &err {
        Error::ExternalTool { command, status, .. } => {
            assert!(command.starts_with("false convert -f qcow2 -O vmdk"));
            assert!(status.contains('1'));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(!output.exists());
    // Working directory is gone regardless of the failure.
    assert_eq!(fs::read_dir(temp_root.path()).unwrap().count(), 0);
}

#[test]
fn test_real_tar_archive_layout() {
    require_tar!();

    let dir = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    let input = create_qcow2(dir.path(), "test.qcow2", QCOW2_MAGIC, TEN_GIB);
    let output = dir.path().join("test.ova");

    let conversion = Conversion::new(&input, &output, work.path(), DigestAlgorithm::Sha1).unwrap();
    conversion
        .run(&FakeConverter::default(), &TarArchiver::default(), &no_progress)
        .unwrap();

    let listing = Command::new("tar").arg("-tf").arg(&output).output().unwrap();
    assert!(listing.status.success());
    let members: Vec<String> = String::from_utf8_lossy(&listing.stdout)
        .lines()
        .map(str::to_string)
        .collect();
    assert_eq!(members, vec!["test.ovf", "test.vmdk", "test.mf"]);

    let extract = tempfile::tempdir().unwrap();
    let status = Command::new("tar")
        .arg("-xf")
        .arg(&output)
        .arg("-C")
        .arg(extract.path())
        .status()
        .unwrap();
    assert!(status.success());

    let ovf = fs::read_to_string(extract.path().join("test.ovf")).unwrap();
    assert!(ovf.contains("ovf:size=\"10737418240\""));
    assert!(ovf.contains("ovf:capacity=\"10\""));
    assert_eq!(fs::read(extract.path().join("test.vmdk")).unwrap(), FAKE_VMDK);

    let manifest = Manifest::parse(&fs::read_to_string(extract.path().join("test.mf")).unwrap()).unwrap();
    assert_eq!(manifest.entries.len(), 2);
    assert_eq!(manifest.entries[0].file_name, "test.ovf");
    assert_eq!(manifest.entries[1].file_name, "test.vmdk");
    manifest.verify(extract.path()).unwrap();
}

#[test]
fn test_real_tar_with_dash_prefixed_image_name() {
    require_tar!();

    let dir = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    let input = create_qcow2(dir.path(), "-disk.qcow2", QCOW2_MAGIC, TEN_GIB);
    let output = dir.path().join("-disk.ova");

    let conversion = Conversion::new(&input, &output, work.path(), DigestAlgorithm::Sha1).unwrap();
    let summary = conversion
        .run(&FakeConverter::default(), &TarArchiver::default(), &no_progress)
        .unwrap();
    assert_eq!(summary.names.members(), vec!["-disk.ovf", "-disk.vmdk", "-disk.mf"]);

    let listing = Command::new("tar").arg("-tf").arg(&output).output().unwrap();
    assert!(listing.status.success());
    let members: Vec<String> = String::from_utf8_lossy(&listing.stdout)
        .lines()
        .map(str::to_string)
        .collect();
    assert_eq!(members, vec!["-disk.ovf", "-disk.vmdk", "-disk.mf"]);
}
