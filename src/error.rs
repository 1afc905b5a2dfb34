//! Error kinds shared by every public entry point.
//!
//! One flat enum, `Display` implemented by hand, and cold
//! `#[inline(never)]` constructor functions at the call sites that
//! actually raise each variant.

use std::fmt::Display;
use std::io;

/// Errors produced by libcapsule's public API.
#[derive(Debug)]
pub enum Error {
    /// The target or a dependency soname could not be resolved under the
    /// configured prefix.
    NotFound { msg: String },
    /// The ELF class or machine of a candidate file didn't match the
    /// caller's.
    WrongAbi { msg: String },
    /// Bad ELF magic, a missing string table, or an unreadable dynamic
    /// section.
    MalformedElf { msg: String },
    /// `/etc/ld.so.cache` is absent, unreadable, or carries an unrecognized
    /// magic.
    CacheUnreadable { msg: String },
    /// More than `DSO_LIMIT` dependencies were required to satisfy a load.
    CapacityExceeded { msg: String },
    /// An `mprotect` call needed to lift RELRO failed.
    ProtectionFailure { msg: String },
    /// A `path-match` pattern resolved outside the provider prefix.
    PathEscape { msg: String },
    /// `dlmopen`/`dlopen` returned NULL while loading a resolved dependency
    /// tree into a namespace.
    LoadFailed { msg: String },
    /// Underlying I/O failure (opening a file, reading procfs, ...).
    Io { err: io::Error },
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::NotFound { msg } => write!(f, "not found: {msg}"),
            Error::WrongAbi { msg } => write!(f, "wrong ABI: {msg}"),
            Error::MalformedElf { msg } => write!(f, "malformed ELF: {msg}"),
            Error::CacheUnreadable { msg } => write!(f, "ld.so.cache unreadable: {msg}"),
            Error::CapacityExceeded { msg } => write!(f, "capacity exceeded: {msg}"),
            Error::ProtectionFailure { msg } => write!(f, "mprotect failed: {msg}"),
            Error::PathEscape { msg } => write!(f, "path escapes prefix: {msg}"),
            Error::LoadFailed { msg } => write!(f, "namespace load failed: {msg}"),
            Error::Io { err } => write!(f, "{err}"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io { err } => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    #[cold]
    fn from(err: io::Error) -> Self {
        Error::Io { err }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cold]
#[inline(never)]
pub(crate) fn not_found_error(msg: impl ToString) -> Error {
    Error::NotFound { msg: msg.to_string() }
}

#[cold]
#[inline(never)]
pub(crate) fn wrong_abi_error(msg: impl ToString) -> Error {
    Error::WrongAbi { msg: msg.to_string() }
}

#[cold]
#[inline(never)]
pub(crate) fn malformed_elf_error(msg: impl ToString) -> Error {
    Error::MalformedElf { msg: msg.to_string() }
}

#[cold]
#[inline(never)]
pub(crate) fn cache_unreadable_error(msg: impl ToString) -> Error {
    Error::CacheUnreadable { msg: msg.to_string() }
}

#[cold]
#[inline(never)]
pub(crate) fn capacity_exceeded_error(msg: impl ToString) -> Error {
    Error::CapacityExceeded { msg: msg.to_string() }
}

#[cold]
#[inline(never)]
pub(crate) fn protection_failure_error(msg: impl ToString) -> Error {
    Error::ProtectionFailure { msg: msg.to_string() }
}

#[cold]
#[inline(never)]
pub(crate) fn path_escape_error(msg: impl ToString) -> Error {
    Error::PathEscape { msg: msg.to_string() }
}

#[cold]
#[inline(never)]
pub(crate) fn load_failed_error(msg: impl ToString) -> Error {
    Error::LoadFailed { msg: msg.to_string() }
}
