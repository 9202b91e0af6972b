// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Error types for the memfs engine

use std::io;

/// Core filesystem error type
#[derive(thiserror::Error, Debug)]
pub enum FsError {
    #[error("not found")]
    NotFound,
    #[error("already exists")]
    AlreadyExists,
    #[error("not a directory")]
    NotADirectory,
    #[error("is a directory")]
    IsADirectory,
    #[error("directory not empty")]
    DirectoryNotEmpty,
    #[error("too many levels of symbolic links")]
    TooManyLinks,
    #[error("access denied")]
    AccessDenied,
    #[error("no space left")]
    OutOfSpace,
    #[error("channel is closed")]
    ClosedChannel,
    #[error("directory stream is closed")]
    ClosedDirectoryStream,
    #[error("watch service is closed")]
    ClosedWatcher,
    #[error("overlapping lock held by the same channel")]
    OverlappingLock,
    #[error("not a symbolic link")]
    NotLink,
    #[error("name not allowed")]
    InvalidName,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("invalid pattern: {0}")]
    InvalidPattern(String),
    #[error("channel not opened for reading")]
    NonReadable,
    #[error("channel not opened for writing")]
    NonWritable,
    #[error("view '{0}' not available")]
    ViewNotAvailable(String),
    #[error("attribute '{0}' not recognized")]
    AttributeNotRecognized(String),
    #[error("not synced: {0}")]
    NotSynced(String),
    #[error("unsupported")]
    Unsupported,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("internal invariant violated: {0}")]
    Internal(String),
}

impl FsError {
    /// POSIX errno equivalent, as an adapter would report it.
    pub fn errno(&self) -> i32 {
        match self {
            FsError::NotFound => libc::ENOENT,
            FsError::AlreadyExists => libc::EEXIST,
            FsError::NotADirectory => libc::ENOTDIR,
            FsError::IsADirectory => libc::EISDIR,
            FsError::DirectoryNotEmpty => libc::ENOTEMPTY,
            FsError::TooManyLinks => libc::ELOOP,
            FsError::AccessDenied => libc::EACCES,
            FsError::OutOfSpace => libc::ENOSPC,
            FsError::ClosedChannel | FsError::ClosedDirectoryStream | FsError::ClosedWatcher => {
                libc::EBADF
            }
            FsError::NonReadable | FsError::NonWritable => libc::EBADF,
            FsError::OverlappingLock => libc::EDEADLK,
            FsError::NotLink
            | FsError::InvalidArgument
            | FsError::InvalidPattern(_)
            | FsError::AttributeNotRecognized(_) => libc::EINVAL,
            FsError::InvalidName => libc::EINVAL,
            FsError::ViewNotAvailable(_) | FsError::Unsupported => libc::ENOTSUP,
            FsError::NotSynced(_) => libc::EIO,
            FsError::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            FsError::Internal(_) => libc::EIO,
        }
    }

    /// True for invariant violations inside the engine, as opposed to
    /// ordinary filesystem failures a caller is expected to handle.
    pub fn is_internal(&self) -> bool {
        matches!(self, FsError::Internal(_))
    }
}

pub type FsResult<T> = Result<T, FsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_matches_posix() {
        assert_eq!(FsError::TooManyLinks.errno(), libc::ELOOP);
        assert_eq!(FsError::OutOfSpace.errno(), libc::ENOSPC);
        assert_eq!(FsError::DirectoryNotEmpty.errno(), libc::ENOTEMPTY);
        assert_eq!(
            FsError::Io(io::Error::from_raw_os_error(libc::EIO)).errno(),
            libc::EIO
        );
    }

    #[test]
    fn internal_errors_are_distinct() {
        assert!(FsError::Internal("nlink".into()).is_internal());
        assert!(!FsError::NotFound.is_internal());
    }
}
