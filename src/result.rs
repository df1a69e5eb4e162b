// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The filesystem error taxonomy.
//!
//! Every fallible operation in this crate returns [`Result`].  Each
//! error variant carries a stable negative integer code, matching the
//! convention of classic Unix-style filesystem interfaces where an
//! operation returns either a non-negative resource identifier or a
//! negative errno-like value.  [`Error::code`] and [`Error::from_code`]
//! convert between the two representations, and [`is_fs_error`] is the
//! predicate over raw codes.
//!
//! Host I/O failures are folded into the same taxonomy via
//! `From<std::io::Error>`, so `?` works uniformly across the block
//! layer and the engine.

use core::fmt;

/// Various errors.
#[derive(Clone, Copy, Eq, Ord, PartialEq, PartialOrd)]
pub enum Error {
    /// End of file.
    Eof,
    /// Permission denied.
    Access,
    /// Resource temporarily unavailable.
    Again,
    /// Bad file descriptor.
    BadFd,
    /// Disk quota exceeded.
    DiskQuota,
    /// Bad address.
    Fault,
    /// Interrupted by a signal handler.
    Interrupted,
    /// Invalid argument.
    Invalid,
    /// Input/output error.
    Io,
    /// Is a directory.
    IsDirectory,
    /// Too many levels of symbolic links.
    Loop,
    /// Too many open files.
    TooManyFiles,
    /// Filename too long.
    NameTooLong,
    /// Not enough space on the volume.
    NoMemory,
    /// Value too large to be stored in its field.
    Overflow,
    /// Operation not permitted.
    NotPermitted,
    /// Read-only filesystem.
    ReadOnlyFs,
    /// Invalid seek.
    SeekPipe,
    /// Volume busy.
    Busy,
    /// Unknown error.
    Unknown,
}

impl Error {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Eof => "End of file",
            Self::Access => "Permission denied",
            Self::Again => "Resource temporarily unavailable",
            Self::BadFd => "Bad file descriptor",
            Self::DiskQuota => "Disk quota exceeded",
            Self::Fault => "Bad address",
            Self::Interrupted => "Interrupted by a signal handler",
            Self::Invalid => "Invalid argument",
            Self::Io => "Input/output error",
            Self::IsDirectory => "Is a directory",
            Self::Loop => "Too many levels of symbolic links",
            Self::TooManyFiles => "Too many open files",
            Self::NameTooLong => "Filename too long",
            Self::NoMemory => "Not enough space on the volume",
            Self::Overflow => "Value too large to be stored in datatype",
            Self::NotPermitted => "Operation not permitted",
            Self::ReadOnlyFs => "Read-only filesystem",
            Self::SeekPipe => "Invalid seek",
            Self::Busy => "Volume busy",
            Self::Unknown => "Unknown error",
        }
    }

    /// Returns the stable negative integer code for this error.
    pub fn code(self) -> i32 {
        match self {
            Self::Eof => -1,
            Self::Access => -2,
            Self::Again => -3,
            Self::BadFd => -4,
            Self::DiskQuota => -5,
            Self::Fault => -6,
            Self::Interrupted => -7,
            Self::Invalid => -8,
            Self::Io => -9,
            Self::IsDirectory => -10,
            Self::Loop => -11,
            Self::TooManyFiles => -12,
            Self::NameTooLong => -13,
            Self::NoMemory => -14,
            Self::Overflow => -15,
            Self::NotPermitted => -16,
            Self::ReadOnlyFs => -17,
            Self::SeekPipe => -18,
            Self::Busy => -19,
            Self::Unknown => -128,
        }
    }

    /// Recovers an error variant from its integer code, if the code
    /// names one.
    pub fn from_code(code: i32) -> Option<Error> {
        match code {
            -1 => Some(Self::Eof),
            -2 => Some(Self::Access),
            -3 => Some(Self::Again),
            -4 => Some(Self::BadFd),
            -5 => Some(Self::DiskQuota),
            -6 => Some(Self::Fault),
            -7 => Some(Self::Interrupted),
            -8 => Some(Self::Invalid),
            -9 => Some(Self::Io),
            -10 => Some(Self::IsDirectory),
            -11 => Some(Self::Loop),
            -12 => Some(Self::TooManyFiles),
            -13 => Some(Self::NameTooLong),
            -14 => Some(Self::NoMemory),
            -15 => Some(Self::Overflow),
            -16 => Some(Self::NotPermitted),
            -17 => Some(Self::ReadOnlyFs),
            -18 => Some(Self::SeekPipe),
            -19 => Some(Self::Busy),
            -128 => Some(Self::Unknown),
            _ => None,
        }
    }
}

/// Returns true iff `code` is a filesystem error code: a value in
/// [-19, -1] or the unknown-error sentinel -128.
pub fn is_fs_error(code: i32) -> bool {
    (-19..=-1).contains(&code) || code == -128
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Error {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::PermissionDenied => Error::Access,
            ErrorKind::WouldBlock => Error::Again,
            ErrorKind::QuotaExceeded => Error::DiskQuota,
            ErrorKind::Interrupted => Error::Interrupted,
            ErrorKind::InvalidInput => Error::Invalid,
            ErrorKind::UnexpectedEof => Error::Io,
            ErrorKind::IsADirectory => Error::IsDirectory,
            // `ErrorKind::FilesystemLoop` is gated behind the unstable
            // `io_error_more` feature on this toolchain; match it by its
            // Debug name instead of the variant itself.
            _ if format!("{:?}", err.kind()) == "FilesystemLoop" => Error::Loop,
            ErrorKind::InvalidFilename => Error::NameTooLong,
            ErrorKind::OutOfMemory | ErrorKind::StorageFull => Error::NoMemory,
            ErrorKind::FileTooLarge => Error::Overflow,
            ErrorKind::ReadOnlyFilesystem => Error::ReadOnlyFs,
            ErrorKind::NotSeekable => Error::SeekPipe,
            ErrorKind::ExecutableFileBusy => Error::Busy,
            _ => Error::Unknown,
        }
    }
}

pub type Result<T> = core::result::Result<T, Error>;
