//! Error types for the ovapack core library.

use std::path::PathBuf;

/// The main error type for ovapack operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error with optional path context.
    #[error("I/O error{}: {source}", path.as_ref().map(|p| format!(" at '{}'", p.display())).unwrap_or_default())]
    Io {
        source: std::io::Error,
        path: Option<PathBuf>,
    },

    /// The input is not a usable QCOW2 image.
    #[error("QCOW2 format error: {message}")]
    Format { message: String },

    /// A precondition of the conversion does not hold.
    #[error("Precondition failed: {message}")]
    Precondition { message: String },

    /// An external program could not be launched or exited unsuccessfully.
    #[error("External tool failed: `{command}` ({status}){}", if stderr.is_empty() { String::new() } else { format!(": {}", stderr.trim()) })]
    ExternalTool {
        command: String,
        status: String,
        stderr: String,
    },

    /// Error generating the OVF descriptor.
    #[error("OVF error: {message}")]
    Ovf { message: String },

    /// Malformed manifest or digest mismatch.
    #[error("Manifest error: {message}")]
    Manifest { message: String },
}

/// A specialized Result type for ovapack operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create an I/O error with path context.
    pub fn io(source: std::io::Error, path: impl Into<PathBuf>) -> Self {
        Self::Io {
            source,
            path: Some(path.into()),
        }
    }

    /// Create an I/O error without path context.
    pub fn io_simple(source: std::io::Error) -> Self {
        Self::Io { source, path: None }
    }

    /// Create a QCOW2 format error.
    pub fn format(message: impl Into<String>) -> Self {
        Self::Format {
            message: message.into(),
        }
    }

    /// Create a precondition error.
    pub fn precondition(message: impl Into<String>) -> Self {
        Self::Precondition {
            message: message.into(),
        }
    }

    /// Create an external tool error.
    pub fn external_tool(
        command: impl Into<String>,
        status: impl Into<String>,
        stderr: impl Into<String>,
    ) -> Self {
        Self::ExternalTool {
            command: command.into(),
            status: status.into(),
            stderr: stderr.into(),
        }
    }

    /// Create an OVF error.
    pub fn ovf(message: impl Into<String>) -> Self {
        Self::Ovf {
            message: message.into(),
        }
    }

    /// Create a manifest error.
    pub fn manifest(message: impl Into<String>) -> Self {
        Self::Manifest {
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(source: std::io::Error) -> Self {
        Self::io_simple(source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_with_path() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err = Error::io(io_err, "/path/to/disk.qcow2");
        let msg = err.to_string();
        assert!(msg.contains("I/O error"));
        assert!(msg.contains("/path/to/disk.qcow2"));
    }

    #[test]
    fn test_io_error_without_path() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err = Error::io_simple(io_err);
        let msg = err.to_string();
        assert!(msg.contains("I/O error"));
        assert!(!msg.contains("at '"));
    }

    #[test]
    fn test_format_error() {
        let err = Error::format("bad magic");
        assert!(err.to_string().contains("QCOW2 format error"));
        assert!(err.to_string().contains("bad magic"));
    }

    #[test]
    fn test_precondition_error() {
        let err = Error::precondition("output exists");
        assert!(err.to_string().contains("Precondition failed"));
    }

    #[test]
    fn test_external_tool_error_includes_command_and_status() {
        let err = Error::external_tool("qemu-img convert a b", "exit status: 1", "boom\n");
        let msg = err.to_string();
        assert!(msg.contains("`qemu-img convert a b`"));
        assert!(msg.contains("exit status: 1"));
        assert!(msg.ends_with(": boom"));
    }

    #[test]
    fn test_external_tool_error_without_stderr() {
        let err = Error::external_tool("tar -c", "exit status: 2", "");
        assert_eq!(err.to_string(), "External tool failed: `tar -c` (exit status: 2)");
    }

    #[test]
    fn test_ovf_error() {
        let err = Error::ovf("invalid XML");
        assert!(err.to_string().contains("OVF error"));
    }

    #[test]
    fn test_manifest_error() {
        let err = Error::manifest("digest mismatch");
        assert!(err.to_string().contains("Manifest error"));
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "access denied");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io { path: None, .. }));
    }
}
