//! Vault file access: creation, opening, locking, positioned I/O, and the
//! file-wide MAC.
//!
//! A vault lives at `<directory>/<username>.vault`, is created with
//! owner-only permissions, opened with synchronous data writes (`O_DSYNC`)
//! so no explicit flush step exists, and guarded by a non-blocking exclusive
//! advisory lock for the whole session. A second session on the same file
//! fails fast instead of corrupting it.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

use fs2::FileExt as _;

use crate::crypto::KeyedHasher;
use crate::error::{VaultError, VaultResult};

use super::format::{HASH_SIZE, HEADER_SIZE, MASTER_KEY_SIZE, OFF_SLOT_COUNT, SLOT_SIZE};
use super::slots::Slot;

const MAC_CHUNK: usize = 4096;

/// Builds the vault path for a user inside a directory.
#[must_use]
pub fn vault_path(directory: &str, username: &str) -> PathBuf {
    Path::new(directory).join(format!("{username}.vault"))
}

/// An open, exclusively locked vault file.
pub struct VaultFile {
    file: File,
    path: PathBuf,
}

#[allow(clippy::len_without_is_empty)] // a vault file is never empty
impl VaultFile {
    /// Creates a new vault file at `path` and locks it.
    ///
    /// The file is created `0600`, must not already exist, and is opened
    /// with `O_DSYNC` and `O_NOFOLLOW`.
    ///
    /// # Errors
    ///
    /// - [`VaultError::FileExists`] if the path already exists.
    /// - [`VaultError::Access`] if permissions forbid creation.
    /// - [`VaultError::Syscall`] on any other open failure, or if the
    ///   exclusive lock cannot be taken.
    pub fn create(path: &Path) -> VaultResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .mode(0o600)
            .custom_flags(libc::O_DSYNC | libc::O_NOFOLLOW)
            .open(path)
            .map_err(|e| map_open_error(&e, path, true))?;
        Self::lock_and_wrap(file, path)
    }

    /// Opens an existing vault file at `path` and locks it.
    ///
    /// # Errors
    ///
    /// - [`VaultError::FileMissing`] if the path does not exist.
    /// - [`VaultError::Access`] if permissions forbid opening.
    /// - [`VaultError::Syscall`] on any other open failure, or if the
    ///   exclusive lock cannot be taken.
    pub fn open_existing(path: &Path) -> VaultResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_DSYNC | libc::O_NOFOLLOW)
            .open(path)
            .map_err(|e| map_open_error(&e, path, false))?;
        Self::lock_and_wrap(file, path)
    }

    fn lock_and_wrap(file: File, path: &Path) -> VaultResult<Self> {
        file.try_lock_exclusive()
            .map_err(|_| VaultError::syscall(format!("locking {}", path.display())))?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// The path this vault file was opened from.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current file length in bytes.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::Io`] if the metadata cannot be read.
    pub fn len(&self) -> VaultResult<u64> {
        Ok(self
            .file
            .metadata()
            .map_err(|e| VaultError::io("reading vault metadata", e))?
            .len())
    }

    /// Reads exactly `buf.len()` bytes at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::Io`] if the read fails or comes up short.
    pub fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> VaultResult<()> {
        self.file
            .read_exact_at(buf, offset)
            .map_err(|e| VaultError::io(format!("reading {} bytes at {offset}", buf.len()), e))
    }

    /// Writes all of `buf` at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::Io`] if the write fails.
    pub fn write_all_at(&self, buf: &[u8], offset: u64) -> VaultResult<()> {
        self.file
            .write_all_at(buf, offset)
            .map_err(|e| VaultError::io(format!("writing {} bytes at {offset}", buf.len()), e))
    }

    /// Reads a little-endian `u32` at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::Io`] if the read fails.
    pub fn read_u32_at(&self, offset: u64) -> VaultResult<u32> {
        let mut buf = [0u8; 4];
        self.read_exact_at(&mut buf, offset)?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Reads a little-endian `u64` at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::Io`] if the read fails.
    pub fn read_u64_at(&self, offset: u64) -> VaultResult<u64> {
        let mut buf = [0u8; 8];
        self.read_exact_at(&mut buf, offset)?;
        Ok(u64::from_le_bytes(buf))
    }

    /// Truncates or extends the file to `len` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::Io`] if the resize fails.
    pub fn set_len(&self, len: u64) -> VaultResult<()> {
        self.file
            .set_len(len)
            .map_err(|e| VaultError::io(format!("truncating to {len} bytes"), e))
    }

    /// The slot count from the header.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::Io`] if the read fails.
    pub fn slot_count(&self) -> VaultResult<u32> {
        self.read_u32_at(OFF_SLOT_COUNT)
    }

    /// Reads the slot at byte offset `slot_offset`.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::Io`] if the read fails.
    pub fn read_slot(&self, slot_offset: u64) -> VaultResult<Slot> {
        let mut buf = [0u8; SLOT_SIZE];
        self.read_exact_at(&mut buf, slot_offset)?;
        Ok(Slot::decode(&buf))
    }

    /// Writes `slot` at byte offset `slot_offset`.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::Io`] if the write fails.
    pub fn write_slot(&self, slot_offset: u64, slot: &Slot) -> VaultResult<()> {
        self.write_all_at(&slot.encode(), slot_offset)
    }

    /// Computes the keyed hash of `file[0 .. data_end)` in streaming chunks.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::Io`] if a read fails.
    pub fn compute_mac(
        &self,
        master: &[u8; MASTER_KEY_SIZE],
        data_end: u64,
    ) -> VaultResult<[u8; HASH_SIZE]> {
        let mut hasher = KeyedHasher::new(master);
        let mut buf = [0u8; MAC_CHUNK];
        let mut offset = 0u64;
        while offset < data_end {
            let take = usize::try_from((data_end - offset).min(MAC_CHUNK as u64))
                .expect("chunk fits in usize");
            self.read_exact_at(&mut buf[..take], offset)?;
            hasher.update(&buf[..take]);
            offset += take as u64;
        }
        Ok(hasher.finalize())
    }

    /// Verifies the trailing file MAC against a recomputation.
    ///
    /// # Errors
    ///
    /// - [`VaultError::FileIntegrity`] if the file is too short to carry a
    ///   header and MAC, or the MAC does not match.
    /// - [`VaultError::Io`] if a read fails.
    pub fn verify_mac(&self, master: &[u8; MASTER_KEY_SIZE]) -> VaultResult<()> {
        let len = self.len()?;
        if len < (HEADER_SIZE + HASH_SIZE) as u64 {
            return Err(VaultError::integrity("vault file truncated"));
        }
        let data_end = len - HASH_SIZE as u64;
        let computed = self.compute_mac(master, data_end)?;
        let mut stored = [0u8; HASH_SIZE];
        self.read_exact_at(&mut stored, data_end)?;
        if !crate::crypto::ct_eq(&computed, &stored) {
            return Err(VaultError::integrity("file MAC mismatch"));
        }
        Ok(())
    }

    /// Recomputes the MAC over `file[0 .. data_end)`, writes it at
    /// `data_end`, and trims the file to end right after it.
    ///
    /// Every mutation finishes through here, so the trailing 32 bytes are
    /// always the MAC of everything before them.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::Io`] if a read, write, or resize fails.
    pub fn rewrite_mac(
        &self,
        master: &[u8; MASTER_KEY_SIZE],
        data_end: u64,
    ) -> VaultResult<()> {
        let mac = self.compute_mac(master, data_end)?;
        self.write_all_at(&mac, data_end)?;
        self.set_len(data_end + HASH_SIZE as u64)
    }
}

impl Drop for VaultFile {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

impl std::fmt::Debug for VaultFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultFile")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

fn map_open_error(err: &std::io::Error, path: &Path, creating: bool) -> VaultError {
    match err.kind() {
        std::io::ErrorKind::AlreadyExists if creating => VaultError::FileExists {
            path: path.display().to_string(),
        },
        std::io::ErrorKind::NotFound if !creating => VaultError::FileMissing {
            path: path.display().to_string(),
        },
        std::io::ErrorKind::PermissionDenied => VaultError::Access {
            path: path.display().to_string(),
        },
        _ => VaultError::syscall(format!("opening {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn test_create_refuses_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = vault_path(dir.path().to_str().unwrap(), "alice");

        let first = VaultFile::create(&path).unwrap();
        drop(first);
        let err = VaultFile::create(&path).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Exists);
    }

    #[test]
    fn test_open_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = vault_path(dir.path().to_str().unwrap(), "nobody");
        let err = VaultFile::open_existing(&path).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Exists);
    }

    #[test]
    fn test_second_session_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let path = vault_path(dir.path().to_str().unwrap(), "alice");

        let held = VaultFile::create(&path).unwrap();
        let err = VaultFile::open_existing(&path).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Syscall);

        drop(held);
        VaultFile::open_existing(&path).unwrap();
    }

    #[test]
    fn test_owner_only_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = vault_path(dir.path().to_str().unwrap(), "alice");
        let _file = VaultFile::create(&path).unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_mac_rewrite_and_verify() {
        let dir = tempfile::tempdir().unwrap();
        let path = vault_path(dir.path().to_str().unwrap(), "alice");
        let file = VaultFile::create(&path).unwrap();
        let master = [0x33u8; MASTER_KEY_SIZE];

        let payload = vec![0xABu8; HEADER_SIZE + 100];
        file.write_all_at(&payload, 0).unwrap();
        file.rewrite_mac(&master, payload.len() as u64).unwrap();

        assert_eq!(
            file.len().unwrap(),
            (payload.len() + HASH_SIZE) as u64
        );
        file.verify_mac(&master).unwrap();

        // Any flipped bit in the covered region must be detected.
        file.write_all_at(&[0xAC], 50).unwrap();
        let err = file.verify_mac(&master).unwrap_err();
        assert_eq!(err.code(), ErrorCode::File);
    }
}
