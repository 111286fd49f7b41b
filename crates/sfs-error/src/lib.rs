#![forbid(unsafe_code)]
//! Error types for SFS.
//!
//! # Error Taxonomy
//!
//! | Class | Variants | When |
//! |-------|----------|------|
//! | Validation | `InvalidName`, `NameTooLong`, `NotFound`, `NotDirectory`, `IsDirectory`, `Exists`, `NotEmpty`, `PermissionDenied`, `SystemProtected`, `IndexCollision` | detected before any mutation; the call aborts untouched |
//! | Capacity | `NoSpace`, `TableFull`, `ExtentLimit` | detected before or during allocation; claimed blocks are released |
//! | Persistence | `Io` | a device write failed; the caller rolls back to its snapshot |
//! | Format | `Format`, `InvalidGeometry`, `Corruption`, `Parse` | image or region content cannot be decoded |
//! | Journal | `Journal` | log file malformed or unwritable |
//!
//! `sfs-error` does not depend on `sfs-types`. `ParseError` from `sfs-types`
//! is converted to `SfsError::Parse` or `SfsError::Format` in `sfs-core`.
//!
//! ## errno Mapping
//!
//! Every variant maps to exactly one POSIX errno via [`SfsError::to_errno`].
//! The match is exhaustive so a new variant fails to compile until it is
//! assigned.
//!
//! | Variant | errno |
//! |---------|-------|
//! | `Io` | raw OS error, else `EIO` |
//! | `Corruption` | `EIO` |
//! | `Journal` | `EIO` |
//! | `Format` | `EINVAL` |
//! | `Parse` | `EINVAL` |
//! | `InvalidGeometry` | `EINVAL` |
//! | `InvalidName` | `EINVAL` |
//! | `NoSpace` | `ENOSPC` |
//! | `TableFull` | `ENOSPC` |
//! | `ExtentLimit` | `EFBIG` |
//! | `NotFound` | `ENOENT` |
//! | `PermissionDenied` | `EACCES` |
//! | `SystemProtected` | `EPERM` |
//! | `NotDirectory` | `ENOTDIR` |
//! | `IsDirectory` | `EISDIR` |
//! | `NotEmpty` | `ENOTEMPTY` |
//! | `NameTooLong` | `ENAMETOOLONG` |
//! | `Exists` | `EEXIST` |
//! | `IndexCollision` | `EEXIST` |

use thiserror::Error;

/// Unified error type for all SFS operations.
#[derive(Debug, Error)]
pub enum SfsError {
    /// Operating system I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Region content at a known block could not be decoded.
    #[error("corrupt metadata at block {block}: {detail}")]
    Corruption { block: u64, detail: String },

    /// The image is not an SFS image or violates a structural rule.
    #[error("invalid on-disk format: {0}")]
    Format(String),

    /// Byte-level parse failure surfaced without block context.
    #[error("parse error: {0}")]
    Parse(String),

    /// Format parameters are out of the supported range.
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    /// Entry name fails the character or reserved-name rules.
    #[error("invalid name: {0}")]
    InvalidName(String),

    /// Not enough free data blocks.
    #[error("no space left on device")]
    NoSpace,

    /// Every metadata slot is occupied.
    #[error("metadata table full")]
    TableFull,

    /// The entry would need more extents than a slot can record.
    #[error("extent limit exceeded: need more than {max} extents")]
    ExtentLimit { max: usize },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("permission denied")]
    PermissionDenied,

    /// The entry carries the system attribute.
    #[error("operation not permitted on system entry: {0}")]
    SystemProtected(String),

    #[error("not a directory")]
    NotDirectory,

    #[error("is a directory")]
    IsDirectory,

    #[error("directory not empty")]
    NotEmpty,

    #[error("name too long")]
    NameTooLong,

    #[error("file exists")]
    Exists,

    /// Two distinct names hashed to the same index key.
    #[error("index key collision for {0}")]
    IndexCollision(String),

    /// The write-ahead journal is malformed or could not be updated.
    #[error("journal error: {0}")]
    Journal(String),
}

impl SfsError {
    /// Convert this error into a POSIX errno.
    ///
    /// `ExtentLimit` maps to `EFBIG`: the file cannot grow further in its
    /// current layout even though free blocks may remain.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Corruption { .. } | Self::Journal(_) => libc::EIO,
            Self::Format(_) | Self::Parse(_) | Self::InvalidGeometry(_) | Self::InvalidName(_) => {
                libc::EINVAL
            }
            Self::NoSpace | Self::TableFull => libc::ENOSPC,
            Self::ExtentLimit { .. } => libc::EFBIG,
            Self::NotFound(_) => libc::ENOENT,
            Self::PermissionDenied => libc::EACCES,
            Self::SystemProtected(_) => libc::EPERM,
            Self::NotDirectory => libc::ENOTDIR,
            Self::IsDirectory => libc::EISDIR,
            Self::NotEmpty => libc::ENOTEMPTY,
            Self::NameTooLong => libc::ENAMETOOLONG,
            Self::Exists | Self::IndexCollision(_) => libc::EEXIST,
        }
    }

    /// Whether the error was raised by a precondition check, before any
    /// state was touched.
    #[must_use]
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidName(_)
                | Self::NameTooLong
                | Self::NotFound(_)
                | Self::NotDirectory
                | Self::IsDirectory
                | Self::Exists
                | Self::NotEmpty
                | Self::PermissionDenied
                | Self::SystemProtected(_)
                | Self::IndexCollision(_)
        )
    }
}

/// Result alias using `SfsError`.
pub type Result<T> = std::result::Result<T, SfsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_covers_all_variants() {
        let cases: Vec<(SfsError, libc::c_int)> = vec![
            (SfsError::Io(std::io::Error::other("test")), libc::EIO),
            (
                SfsError::Corruption {
                    block: 0,
                    detail: "test".into(),
                },
                libc::EIO,
            ),
            (SfsError::Format("test".into()), libc::EINVAL),
            (SfsError::Parse("test".into()), libc::EINVAL),
            (SfsError::InvalidGeometry("order=2".into()), libc::EINVAL),
            (SfsError::InvalidName("a b".into()), libc::EINVAL),
            (SfsError::NoSpace, libc::ENOSPC),
            (SfsError::TableFull, libc::ENOSPC),
            (SfsError::ExtentLimit { max: 5 }, libc::EFBIG),
            (SfsError::NotFound("x".into()), libc::ENOENT),
            (SfsError::PermissionDenied, libc::EACCES),
            (SfsError::SystemProtected("x".into()), libc::EPERM),
            (SfsError::NotDirectory, libc::ENOTDIR),
            (SfsError::IsDirectory, libc::EISDIR),
            (SfsError::NotEmpty, libc::ENOTEMPTY),
            (SfsError::NameTooLong, libc::ENAMETOOLONG),
            (SfsError::Exists, libc::EEXIST),
            (SfsError::IndexCollision("a".into()), libc::EEXIST),
            (SfsError::Journal("bad line".into()), libc::EIO),
        ];

        for (error, expected) in &cases {
            assert_eq!(error.to_errno(), *expected, "wrong errno for {error:?}");
        }
    }

    #[test]
    fn io_error_preserves_raw_os_error() {
        let raw = std::io::Error::from_raw_os_error(libc::EPERM);
        assert_eq!(SfsError::Io(raw).to_errno(), libc::EPERM);
    }

    #[test]
    fn display_formatting() {
        let err = SfsError::Corruption {
            block: 42,
            detail: "bad checksum".into(),
        };
        assert_eq!(err.to_string(), "corrupt metadata at block 42: bad checksum");
        assert_eq!(
            SfsError::ExtentLimit { max: 5 }.to_string(),
            "extent limit exceeded: need more than 5 extents"
        );
        assert_eq!(SfsError::NotEmpty.to_string(), "directory not empty");
    }

    #[test]
    fn validation_class() {
        assert!(SfsError::Exists.is_validation());
        assert!(SfsError::NotFound("a".into()).is_validation());
        assert!(!SfsError::NoSpace.is_validation());
        assert!(!SfsError::Io(std::io::Error::other("x")).is_validation());
    }
}
