//! Error types for the vault engine.
//!
//! Every failure maps onto one of the stable integer codes in [`ErrorCode`],
//! which mirror the codes the surrounding application and sync server have
//! always exchanged. The Rust API itself speaks [`VaultError`]; callers that
//! need the wire code ask for it via [`VaultError::code`].

use std::fmt;

use thiserror::Error;

/// Stable integer error codes shared with the application boundary.
///
/// `Success` is part of the table for wire compatibility; the library never
/// constructs an error carrying it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ErrorCode {
    /// Operation completed.
    Success = 0,
    /// Guarded memory could not be allocated or re-protected.
    Memory = 1,
    /// A caller-supplied argument failed validation.
    Param = 2,
    /// Reading from or writing to the vault file failed.
    Io = 3,
    /// A cryptographic primitive failed or an entry failed verification.
    Crypto = 4,
    /// A vault is already open in this session.
    VaultOpen = 5,
    /// No vault is open in this session.
    VaultClosed = 6,
    /// A system call (lock, rlimit, unexpected open errno) failed.
    Syscall = 7,
    /// The vault file exists when it must not, or is missing when it must exist.
    Exists = 8,
    /// Filesystem permissions forbid the operation.
    Access = 9,
    /// Key-presence precondition failed.
    KeyExists = 10,
    /// The file-wide integrity check failed.
    File = 11,
    /// The slot table has no free entry (internal; resolved by compaction).
    NoSpace = 12,
    /// The password failed to open the master-key envelope.
    WrongPassword = 13,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", *self as i32)
    }
}

/// Errors returned by vault operations.
#[derive(Debug, Error)]
pub enum VaultError {
    /// Guarded memory could not be allocated, locked, or re-protected.
    #[error("guarded memory unavailable: {context}")]
    Memory {
        /// What was being done to the region.
        context: String,
    },

    /// A caller-supplied argument failed validation.
    #[error("invalid parameter '{parameter}': {reason}")]
    InvalidParam {
        /// Name of the offending parameter.
        parameter: &'static str,
        /// Why it was rejected.
        reason: String,
    },

    /// An I/O operation on the vault file failed.
    #[error("I/O error during {context}: {source}")]
    Io {
        /// The operation in flight.
        context: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A cryptographic primitive failed, or a per-record check did not verify.
    #[error("crypto failure: {context}")]
    Crypto {
        /// What was being sealed, opened, hashed, or verified.
        context: String,
    },

    /// A vault is already open in this session.
    #[error("a vault is already open in this session")]
    AlreadyOpen,

    /// No vault is open in this session.
    #[error("no vault is open in this session")]
    NotOpen,

    /// A system call failed (file lock contention, rlimit, unexpected errno).
    #[error("system call failed during {context}")]
    Syscall {
        /// The call in flight.
        context: String,
    },

    /// The vault file already exists where a new one was to be created.
    #[error("vault file already exists: {path}")]
    FileExists {
        /// Path of the existing file.
        path: String,
    },

    /// The vault file to open does not exist.
    #[error("vault file not found: {path}")]
    FileMissing {
        /// Path that was probed.
        path: String,
    },

    /// Filesystem permissions forbid the operation.
    #[error("access denied: {path}")]
    Access {
        /// Path that was refused.
        path: String,
    },

    /// The key is already present in the vault.
    #[error("key already present: {key}")]
    KeyExists {
        /// The duplicate key.
        key: String,
    },

    /// The key is not present in the vault.
    #[error("key not present: {key}")]
    KeyMissing {
        /// The absent key.
        key: String,
    },

    /// `read_value` was called with no key opened into the hot box.
    #[error("no value is currently open")]
    NoOpenValue,

    /// The file-wide MAC (or a server blob's MAC on import) did not verify.
    #[error("vault file integrity check failed: {context}")]
    FileIntegrity {
        /// What failed to verify.
        context: String,
    },

    /// Every slot in the location table is in use.
    #[error("no free slot in the location table")]
    NoSpace,

    /// The password-derived key failed to open the master-key envelope.
    #[error("wrong password")]
    WrongPassword,
}

impl VaultError {
    /// Returns the stable integer code for this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Memory { .. } => ErrorCode::Memory,
            Self::InvalidParam { .. } => ErrorCode::Param,
            Self::Io { .. } => ErrorCode::Io,
            Self::Crypto { .. } => ErrorCode::Crypto,
            Self::AlreadyOpen => ErrorCode::VaultOpen,
            Self::NotOpen => ErrorCode::VaultClosed,
            Self::Syscall { .. } => ErrorCode::Syscall,
            Self::FileExists { .. } | Self::FileMissing { .. } => ErrorCode::Exists,
            Self::Access { .. } => ErrorCode::Access,
            Self::KeyExists { .. } | Self::KeyMissing { .. } | Self::NoOpenValue => {
                ErrorCode::KeyExists
            }
            Self::FileIntegrity { .. } => ErrorCode::File,
            Self::NoSpace => ErrorCode::NoSpace,
            Self::WrongPassword => ErrorCode::WrongPassword,
        }
    }

    /// Creates an I/O error with context.
    pub fn io<S: Into<String>>(context: S, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Creates a crypto error.
    pub fn crypto<S: Into<String>>(context: S) -> Self {
        Self::Crypto {
            context: context.into(),
        }
    }

    /// Creates a parameter-validation error.
    pub fn param<R: Into<String>>(parameter: &'static str, reason: R) -> Self {
        Self::InvalidParam {
            parameter,
            reason: reason.into(),
        }
    }

    /// Creates a file-integrity error.
    pub fn integrity<S: Into<String>>(context: S) -> Self {
        Self::FileIntegrity {
            context: context.into(),
        }
    }

    /// Creates a syscall error.
    pub fn syscall<S: Into<String>>(context: S) -> Self {
        Self::Syscall {
            context: context.into(),
        }
    }

    /// Creates a guarded-memory error.
    pub fn memory<S: Into<String>>(context: S) -> Self {
        Self::Memory {
            context: context.into(),
        }
    }
}

/// Result type for vault operations.
pub type VaultResult<T> = Result<T, VaultError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stable_code_values() {
        assert_eq!(ErrorCode::Success as i32, 0);
        assert_eq!(ErrorCode::Memory as i32, 1);
        assert_eq!(ErrorCode::Param as i32, 2);
        assert_eq!(ErrorCode::Io as i32, 3);
        assert_eq!(ErrorCode::Crypto as i32, 4);
        assert_eq!(ErrorCode::VaultOpen as i32, 5);
        assert_eq!(ErrorCode::VaultClosed as i32, 6);
        assert_eq!(ErrorCode::Syscall as i32, 7);
        assert_eq!(ErrorCode::Exists as i32, 8);
        assert_eq!(ErrorCode::Access as i32, 9);
        assert_eq!(ErrorCode::KeyExists as i32, 10);
        assert_eq!(ErrorCode::File as i32, 11);
        assert_eq!(ErrorCode::NoSpace as i32, 12);
        assert_eq!(ErrorCode::WrongPassword as i32, 13);
    }

    #[test]
    fn test_presence_errors_share_a_code() {
        let exists = VaultError::KeyExists {
            key: "email".to_string(),
        };
        let missing = VaultError::KeyMissing {
            key: "email".to_string(),
        };
        assert_eq!(exists.code(), ErrorCode::KeyExists);
        assert_eq!(missing.code(), ErrorCode::KeyExists);
        assert_eq!(VaultError::NoOpenValue.code(), ErrorCode::KeyExists);
    }

    #[test]
    fn test_error_display() {
        let err = VaultError::param("key", "must not be empty");
        assert!(format!("{err}").contains("invalid parameter 'key'"));
        let err = VaultError::WrongPassword;
        assert_eq!(format!("{err}"), "wrong password");
    }
}
