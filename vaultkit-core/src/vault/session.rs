//! The vault session: the engine's public API.
//!
//! A [`Session`] holds at most one open vault. Its secret state — the
//! password-derived KEK, the decrypted master key, and the hot box with the
//! one currently decrypted value — lives in a [`Guarded`] memory region
//! that is inaccessible except while a public call is running. The file
//! handle and the key index are not secret and live beside it.
//!
//! All writes are synchronous (`O_DSYNC`), so there is no flush step;
//! `close` only releases the lock and wipes secrets. The session is not
//! safe for concurrent use from multiple threads.

use zeroize::{Zeroize, Zeroizing};

use crate::crypto;
use crate::error::{VaultError, VaultResult};
use crate::secure::{disable_core_dumps, Guarded};

use super::compact::compact;
use super::file::{vault_path, VaultFile};
use super::format::{
    heap_offset, record_len, BOX_KEY_SIZE, DATA_SIZE, ENC_MASTER_SIZE, HASH_SIZE,
    INITIAL_SLOT_COUNT, MAC_SIZE, MASTER_KEY_SIZE, MAX_KEY_LEN, MAX_PATH_LEN, MAX_USER_SIZE,
    OFF_ENC_MASTER, OFF_MASTER_NONCE, OFF_SALT, OFF_SERVER_TIME, OFF_SLOT_COUNT,
    RECORD_HEADER_SIZE, SALT_SIZE, SERVER_HEADER_SIZE, SLOT_SIZE, STATE_DELETED,
};
use super::header::VaultHeader;
use super::index::{KeyEntry, KeyIndex};
use super::records;
use super::recovery::{
    check_secret, double_seal_master, open_double_sealed, RecoveryBundle, RecoveryReset,
    RECOVERY_BLOB_SIZE,
};
use super::slots::Slot;

/// The single decrypted value a session caches.
///
/// `key[0] == 0` means nothing is cached; keys are stored NUL-terminated,
/// which is why they are bounded one byte short of the buffer.
struct HotBox {
    key: [u8; BOX_KEY_SIZE],
    entry_type: u8,
    val_len: u32,
    value: [u8; DATA_SIZE],
}

impl HotBox {
    const fn empty() -> Self {
        Self {
            key: [0u8; BOX_KEY_SIZE],
            entry_type: 0,
            val_len: 0,
            value: [0u8; DATA_SIZE],
        }
    }

    fn clear(&mut self) {
        self.key.zeroize();
        self.value.zeroize();
        self.entry_type = 0;
        self.val_len = 0;
    }

    fn is_empty(&self) -> bool {
        self.key[0] == 0
    }

    fn holds(&self, key: &str) -> bool {
        !self.is_empty()
            && self.key[key.len()..].first() == Some(&0)
            && &self.key[..key.len()] == key.as_bytes()
    }

    fn store(&mut self, key: &str, entry_type: u8, value: &[u8]) {
        self.clear();
        self.key[..key.len()].copy_from_slice(key.as_bytes());
        self.entry_type = entry_type;
        self.val_len = u32::try_from(value.len()).expect("value bounded by DATA_SIZE");
        self.value[..value.len()].copy_from_slice(value);
    }
}

/// Secret session state; everything here lives on guarded pages.
struct SecretState {
    derived_key: [u8; MASTER_KEY_SIZE],
    master: [u8; MASTER_KEY_SIZE],
    hot: HotBox,
}

impl SecretState {
    const fn zeroed() -> Self {
        Self {
            derived_key: [0u8; MASTER_KEY_SIZE],
            master: [0u8; MASTER_KEY_SIZE],
            hot: HotBox::empty(),
        }
    }
}

/// Handle state for the currently open vault file.
struct OpenVault {
    file: VaultFile,
    index: KeyIndex,
}

/// A vault session: at most one open vault, secrets in guarded memory.
///
/// Dropping the session wipes the guarded region and releases the file
/// lock; an explicit [`Session::close`] does the same and leaves the
/// session reusable.
pub struct Session {
    state: Guarded<SecretState>,
    vault: Option<OpenVault>,
}

impl Session {
    /// Creates a session: disables core dumps and allocates the guarded
    /// region.
    ///
    /// # Errors
    ///
    /// - [`VaultError::Syscall`] if core dumps cannot be disabled.
    /// - [`VaultError::Memory`] if the guarded region cannot be set up.
    pub fn new() -> VaultResult<Self> {
        disable_core_dumps()?;
        Ok(Self {
            state: Guarded::new(SecretState::zeroed())?,
            vault: None,
        })
    }

    /// Whether a vault is currently open.
    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.vault.is_some()
    }

    /// Largest value the vault accepts, in bytes.
    #[must_use]
    pub const fn max_value_size() -> usize {
        DATA_SIZE
    }

    /// Creates a new vault file for `username` and opens it.
    ///
    /// Generates a fresh master key, seals it under the password-derived
    /// KEK, and writes an empty vault: header, zeroed slot table, file MAC.
    ///
    /// # Errors
    ///
    /// - [`VaultError::InvalidParam`] on out-of-bounds arguments.
    /// - [`VaultError::AlreadyOpen`] if a vault is open.
    /// - [`VaultError::FileExists`] / [`VaultError::Access`] /
    ///   [`VaultError::Syscall`] from file creation or locking.
    /// - [`VaultError::Memory`], [`VaultError::Crypto`], [`VaultError::Io`]
    ///   from the lower layers.
    pub fn create(&mut self, directory: &str, username: &str, password: &str) -> VaultResult<()> {
        check_path_args(directory, username, password)?;
        if self.vault.is_some() {
            return Err(VaultError::AlreadyOpen);
        }

        let file = VaultFile::create(&vault_path(directory, username))?;
        let mut state = self.state.unlock()?;

        crypto::fill_random(&mut state.master);
        let salt = crypto::random_salt();
        let derived = crypto::derive_key(password.as_bytes(), &salt)?;
        state.derived_key = *derived;

        let master_nonce = crypto::random_nonce();
        let sealed = crypto::seal(&state.derived_key, &master_nonce, &state.master)?;
        let mut enc_master = [0u8; ENC_MASTER_SIZE];
        enc_master.copy_from_slice(&sealed);

        let header = VaultHeader {
            salt,
            enc_master,
            master_nonce,
            last_server_time: 0,
        };
        write_empty_vault(&file, &header.encode(), &state.master)?;

        state.hot.clear();
        drop(state);
        self.vault = Some(OpenVault {
            file,
            index: KeyIndex::with_slot_count(INITIAL_SLOT_COUNT),
        });
        log::debug!("created vault for user");
        Ok(())
    }

    /// Creates an empty local vault from a header downloaded from the
    /// server, after verifying that `password` opens its master envelope.
    ///
    /// The header bytes are written verbatim, so the server's
    /// `last_server_time` survives; encrypted entries are then imported
    /// with [`Session::add_encrypted`].
    ///
    /// # Errors
    ///
    /// As [`Session::create`], plus [`VaultError::WrongPassword`] if the
    /// password does not open the downloaded header, and
    /// [`VaultError::FileIntegrity`] if the header is malformed.
    pub fn create_from_header(
        &mut self,
        directory: &str,
        username: &str,
        password: &str,
        header_bytes: &[u8],
    ) -> VaultResult<()> {
        check_path_args(directory, username, password)?;
        if self.vault.is_some() {
            return Err(VaultError::AlreadyOpen);
        }
        if header_bytes.len() != SERVER_HEADER_SIZE {
            return Err(VaultError::param("header", "wrong length"));
        }
        let header = VaultHeader::decode(header_bytes)?;

        let derived = crypto::derive_key(password.as_bytes(), &header.salt)?;
        let master = open_master(&derived, &header)?;

        let file = VaultFile::create(&vault_path(directory, username))?;
        let mut state = self.state.unlock()?;
        state.derived_key = *derived;
        state.master = *master;

        let mut verbatim = [0u8; SERVER_HEADER_SIZE];
        verbatim.copy_from_slice(header_bytes);
        write_empty_vault(&file, &verbatim, &state.master)?;

        state.hot.clear();
        drop(state);
        self.vault = Some(OpenVault {
            file,
            index: KeyIndex::with_slot_count(INITIAL_SLOT_COUNT),
        });
        log::debug!("created vault from downloaded header");
        Ok(())
    }

    /// Opens an existing vault.
    ///
    /// Derives the KEK from the stored salt, opens the master envelope,
    /// verifies the file MAC, and rebuilds the key index.
    ///
    /// # Errors
    ///
    /// - [`VaultError::WrongPassword`] if the envelope does not open.
    /// - [`VaultError::FileIntegrity`] if the file MAC does not verify.
    /// - [`VaultError::FileMissing`] / [`VaultError::Access`] /
    ///   [`VaultError::Syscall`] from opening or locking the file.
    /// - [`VaultError::InvalidParam`], [`VaultError::AlreadyOpen`],
    ///   [`VaultError::Memory`], [`VaultError::Io`] as usual.
    pub fn open(&mut self, directory: &str, username: &str, password: &str) -> VaultResult<()> {
        check_path_args(directory, username, password)?;
        if self.vault.is_some() {
            return Err(VaultError::AlreadyOpen);
        }

        let file = VaultFile::open_existing(&vault_path(directory, username))?;
        let mut header_bytes = [0u8; SERVER_HEADER_SIZE];
        file.read_exact_at(&mut header_bytes, 0)?;
        let header = VaultHeader::decode(&header_bytes)?;

        let derived = crypto::derive_key(password.as_bytes(), &header.salt)?;
        let master = open_master(&derived, &header)?;

        file.verify_mac(&master)?;
        let index = KeyIndex::build_from_file(&file)?;

        let mut state = self.state.unlock()?;
        state.derived_key = *derived;
        state.master = *master;
        state.hot.clear();
        drop(state);
        self.vault = Some(OpenVault { file, index });
        log::debug!("opened vault with {} keys", self.vault.as_ref().map_or(0, |v| v.index.len()));
        Ok(())
    }

    /// Closes the open vault: releases the file lock, wipes the KEK, the
    /// master key, and the hot box, and drops the index.
    ///
    /// # Errors
    ///
    /// - [`VaultError::NotOpen`] if no vault is open.
    /// - [`VaultError::Memory`] if the guarded region cannot be unlocked.
    pub fn close(&mut self) -> VaultResult<()> {
        let vault = self.vault.take().ok_or(VaultError::NotOpen)?;
        drop(vault);

        let mut state = self.state.unlock()?;
        state.derived_key.zeroize();
        state.master.zeroize();
        state.hot.clear();
        log::debug!("closed vault");
        Ok(())
    }

    /// Re-seals the master key under a KEK derived from `new_password`.
    ///
    /// The master key itself is unchanged, so no entry is re-encrypted;
    /// only the header changes. The old password must both open the stored
    /// envelope and yield the in-memory master key.
    ///
    /// # Errors
    ///
    /// - [`VaultError::WrongPassword`] if `old_password` is wrong.
    /// - [`VaultError::NotOpen`], [`VaultError::InvalidParam`],
    ///   [`VaultError::Memory`], [`VaultError::Crypto`],
    ///   [`VaultError::Io`] as usual.
    pub fn change_password(&mut self, old_password: &str, new_password: &str) -> VaultResult<()> {
        check_secret("old_password", old_password)?;
        check_secret("new_password", new_password)?;
        let vault = self.vault.as_ref().ok_or(VaultError::NotOpen)?;

        let mut header_bytes = [0u8; SERVER_HEADER_SIZE];
        vault.file.read_exact_at(&mut header_bytes, 0)?;
        let header = VaultHeader::decode(&header_bytes)?;

        let mut state = self.state.unlock()?;
        let old_key = crypto::derive_key(old_password.as_bytes(), &header.salt)?;
        let master = open_master(&old_key, &header)?;
        if !crypto::ct_eq(&*master, &state.master) {
            return Err(VaultError::WrongPassword);
        }
        drop(master);
        drop(old_key);

        let salt = crypto::random_salt();
        let derived = crypto::derive_key(new_password.as_bytes(), &salt)?;
        state.derived_key = *derived;

        let master_nonce = crypto::random_nonce();
        let sealed = crypto::seal(&state.derived_key, &master_nonce, &state.master)?;
        vault.file.write_all_at(&salt, OFF_SALT)?;
        vault.file.write_all_at(&sealed, OFF_ENC_MASTER)?;
        vault.file.write_all_at(&master_nonce, OFF_MASTER_NONCE)?;

        let data_end = vault.file.len()? - HASH_SIZE as u64;
        vault.file.rewrite_mac(&state.master, data_end)?;

        state.hot.clear();
        log::debug!("changed vault password");
        Ok(())
    }

    /// Adds a new key-value pair.
    ///
    /// If the slot table is full the vault is compacted once and the
    /// append retried.
    ///
    /// # Errors
    ///
    /// - [`VaultError::KeyExists`] if `key` is already present.
    /// - [`VaultError::InvalidParam`] if the key or value is out of bounds.
    /// - [`VaultError::NotOpen`], [`VaultError::Memory`],
    ///   [`VaultError::Crypto`], [`VaultError::Io`] as usual.
    pub fn add(&mut self, entry_type: u8, key: &str, value: &[u8], mtime: u64) -> VaultResult<()> {
        check_key(key)?;
        check_value(value)?;
        let vault = self.vault.as_mut().ok_or(VaultError::NotOpen)?;
        if vault.index.contains(key) {
            return Err(VaultError::KeyExists {
                key: key.to_string(),
            });
        }

        let state = self.state.unlock()?;
        let record = records::seal_record(&state.master, mtime, entry_type, key, value)?;
        let val_len = u32::try_from(value.len()).expect("value bounded by DATA_SIZE");
        append_with_compaction(vault, &state.master, key, &record, val_len, mtime, entry_type)
    }

    /// Replaces the value of an existing key: delete, then add.
    ///
    /// # Errors
    ///
    /// - [`VaultError::KeyMissing`] if `key` is not present.
    /// - Otherwise as [`Session::delete`] and [`Session::add`].
    pub fn update(
        &mut self,
        entry_type: u8,
        key: &str,
        value: &[u8],
        mtime: u64,
    ) -> VaultResult<()> {
        check_key(key)?;
        check_value(value)?;
        self.delete(key)?;
        self.add(entry_type, key, value, mtime)
    }

    /// Deletes a key: tombstones its slot, wipes the value ciphertext on
    /// disk, and restamps the file MAC.
    ///
    /// The record's key, nonce, and (now stale) MAC stay on disk until the
    /// next compaction; the slot state gates verification, so the stale
    /// MAC is never checked.
    ///
    /// # Errors
    ///
    /// - [`VaultError::KeyMissing`] if `key` is not present.
    /// - [`VaultError::NotOpen`], [`VaultError::InvalidParam`],
    ///   [`VaultError::Memory`], [`VaultError::Io`] as usual.
    pub fn delete(&mut self, key: &str) -> VaultResult<()> {
        check_key(key)?;
        let vault = self.vault.as_mut().ok_or(VaultError::NotOpen)?;
        let entry = *vault.index.get(key).ok_or_else(|| VaultError::KeyMissing {
            key: key.to_string(),
        })?;

        let mut state = self.state.unlock()?;
        let slot = vault.file.read_slot(entry.slot_offset)?;

        vault
            .file
            .write_all_at(&STATE_DELETED.to_le_bytes(), entry.slot_offset)?;
        let wipe = vec![0u8; slot.val_len as usize + MAC_SIZE];
        let value_start =
            u64::from(slot.file_offset) + (RECORD_HEADER_SIZE + slot.key_len as usize) as u64;
        vault.file.write_all_at(&wipe, value_start)?;

        let data_end = vault.file.len()? - HASH_SIZE as u64;
        vault.file.rewrite_mac(&state.master, data_end)?;

        vault.index.remove(key);
        if state.hot.holds(key) {
            state.hot.clear();
        }
        Ok(())
    }

    /// Decrypts a value into the session's hot box.
    ///
    /// If `key` is already the cached value, succeeds without touching the
    /// disk.
    ///
    /// # Errors
    ///
    /// - [`VaultError::KeyMissing`] if `key` is not present.
    /// - [`VaultError::Crypto`] if the record MAC or the value fails to
    ///   verify.
    /// - [`VaultError::NotOpen`], [`VaultError::InvalidParam`],
    ///   [`VaultError::Memory`], [`VaultError::Io`] as usual.
    pub fn open_key(&mut self, key: &str) -> VaultResult<()> {
        check_key(key)?;
        let vault = self.vault.as_ref().ok_or(VaultError::NotOpen)?;
        let entry = *vault.index.get(key).ok_or_else(|| VaultError::KeyMissing {
            key: key.to_string(),
        })?;

        let mut state = self.state.unlock()?;
        if state.hot.holds(key) {
            return Ok(());
        }

        let slot = vault.file.read_slot(entry.slot_offset)?;
        let mut record = vec![0u8; slot.record_len()];
        vault
            .file
            .read_exact_at(&mut record, u64::from(slot.file_offset))?;

        let (_, entry_type, value) = records::open_record(
            &state.master,
            &record,
            slot.key_len as usize,
            slot.val_len as usize,
        )?;
        state.hot.store(key, entry_type, &value);
        Ok(())
    }

    /// Copies the hot-box value out.
    ///
    /// # Errors
    ///
    /// - [`VaultError::NoOpenValue`] if no key has been opened.
    /// - [`VaultError::NotOpen`], [`VaultError::Memory`] as usual.
    pub fn read_value(&mut self) -> VaultResult<(u8, Zeroizing<Vec<u8>>)> {
        if self.vault.is_none() {
            return Err(VaultError::NotOpen);
        }
        let state = self.state.unlock()?;
        if state.hot.is_empty() {
            return Err(VaultError::NoOpenValue);
        }
        let value = Zeroizing::new(state.hot.value[..state.hot.val_len as usize].to_vec());
        Ok((state.hot.entry_type, value))
    }

    /// All live keys, in unspecified order.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::NotOpen`] if no vault is open.
    pub fn list_keys(&self) -> VaultResult<Vec<String>> {
        let vault = self.vault.as_ref().ok_or(VaultError::NotOpen)?;
        Ok(vault.index.keys())
    }

    /// Number of live keys.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::NotOpen`] if no vault is open.
    pub fn num_keys(&self) -> VaultResult<usize> {
        let vault = self.vault.as_ref().ok_or(VaultError::NotOpen)?;
        Ok(vault.index.len())
    }

    /// The modification time stored for `key`.
    ///
    /// # Errors
    ///
    /// - [`VaultError::KeyMissing`] if `key` is not present.
    /// - [`VaultError::NotOpen`], [`VaultError::InvalidParam`] as usual.
    pub fn last_modified(&self, key: &str) -> VaultResult<u64> {
        check_key(key)?;
        let vault = self.vault.as_ref().ok_or(VaultError::NotOpen)?;
        vault
            .index
            .get(key)
            .map(|entry| entry.mtime)
            .ok_or_else(|| VaultError::KeyMissing {
                key: key.to_string(),
            })
    }

    /// Imports an encrypted record blob from the server.
    ///
    /// The blob's MAC is verified under the local master key, its mtime is
    /// overwritten with `mtime`, the MAC restamped, and the record
    /// appended. The server never saw the plaintext; the MAC proves the
    /// blob originated from this vault's master key.
    ///
    /// # Errors
    ///
    /// - [`VaultError::KeyExists`] if `key` is already present.
    /// - [`VaultError::FileIntegrity`] if the blob's MAC does not verify.
    /// - [`VaultError::InvalidParam`] if the blob's framing or embedded key
    ///   is inconsistent with `key`.
    /// - [`VaultError::NotOpen`], [`VaultError::Memory`],
    ///   [`VaultError::Io`] as usual.
    pub fn add_encrypted(
        &mut self,
        key: &str,
        blob: &[u8],
        entry_type: u8,
        mtime: u64,
    ) -> VaultResult<()> {
        check_key(key)?;
        let vault = self.vault.as_mut().ok_or(VaultError::NotOpen)?;
        if vault.index.contains(key) {
            return Err(VaultError::KeyExists {
                key: key.to_string(),
            });
        }

        let overhead = record_len(key.len(), 0);
        if blob.len() < overhead || blob.len() > record_len(key.len(), DATA_SIZE) {
            return Err(VaultError::param("blob", "length inconsistent with key"));
        }
        if records::key_bytes(blob, key.len()) != key.as_bytes() {
            return Err(VaultError::param("blob", "embedded key mismatch"));
        }
        let val_len = u32::try_from(blob.len() - overhead).expect("bounded by DATA_SIZE");

        let state = self.state.unlock()?;
        records::verify_record(&state.master, blob)
            .map_err(|_| VaultError::integrity("server blob MAC mismatch"))?;
        let restamped = records::restamp_record(&state.master, blob, mtime);
        append_with_compaction(
            vault,
            &state.master,
            key,
            &restamped,
            val_len,
            mtime,
            entry_type,
        )
    }

    /// Exports the raw record bytes for `key`, re-verified, for upload.
    ///
    /// # Errors
    ///
    /// - [`VaultError::KeyMissing`] if `key` is not present.
    /// - [`VaultError::Crypto`] if the stored record fails verification.
    /// - [`VaultError::NotOpen`], [`VaultError::InvalidParam`],
    ///   [`VaultError::Memory`], [`VaultError::Io`] as usual.
    pub fn get_encrypted(&mut self, key: &str) -> VaultResult<(u8, Vec<u8>)> {
        check_key(key)?;
        let vault = self.vault.as_ref().ok_or(VaultError::NotOpen)?;
        let entry = *vault.index.get(key).ok_or_else(|| VaultError::KeyMissing {
            key: key.to_string(),
        })?;

        let state = self.state.unlock()?;
        let slot = vault.file.read_slot(entry.slot_offset)?;
        let mut record = vec![0u8; slot.record_len()];
        vault
            .file
            .read_exact_at(&mut record, u64::from(slot.file_offset))?;
        records::verify_record(&state.master, &record)?;
        Ok((entry.entry_type, record))
    }

    /// Copies the server header — bytes `[0, 104)` — for upload.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::NotOpen`] or [`VaultError::Io`].
    pub fn header_for_server(&self) -> VaultResult<[u8; SERVER_HEADER_SIZE]> {
        let vault = self.vault.as_ref().ok_or(VaultError::NotOpen)?;
        let mut header = [0u8; SERVER_HEADER_SIZE];
        vault.file.read_exact_at(&mut header, 0)?;
        Ok(header)
    }

    /// Reads the last-server-exchange timestamp from the header.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::NotOpen`] or [`VaultError::Io`].
    pub fn last_server_time(&self) -> VaultResult<u64> {
        let vault = self.vault.as_ref().ok_or(VaultError::NotOpen)?;
        vault.file.read_u64_at(OFF_SERVER_TIME)
    }

    /// Writes the last-server-exchange timestamp and restamps the file MAC.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::NotOpen`], [`VaultError::Memory`], or
    /// [`VaultError::Io`].
    pub fn set_last_server_time(&mut self, timestamp: u64) -> VaultResult<()> {
        let vault = self.vault.as_ref().ok_or(VaultError::NotOpen)?;
        let state = self.state.unlock()?;
        vault
            .file
            .write_all_at(&timestamp.to_le_bytes(), OFF_SERVER_TIME)?;
        let data_end = vault.file.len()? - HASH_SIZE as u64;
        vault.file.rewrite_mac(&state.master, data_end)
    }

    /// Produces everything the server stores at recovery enrollment.
    ///
    /// See [`RecoveryBundle`] for the pieces. The master key leaves this
    /// call only doubly sealed under the two answer-derived keys.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::NotOpen`], [`VaultError::InvalidParam`],
    /// [`VaultError::Memory`], [`VaultError::Crypto`], or
    /// [`VaultError::Io`].
    pub fn recovery_bundle(&mut self, answer1: &str, answer2: &str) -> VaultResult<RecoveryBundle> {
        check_secret("answer1", answer1)?;
        check_secret("answer2", answer2)?;
        let vault = self.vault.as_ref().ok_or(VaultError::NotOpen)?;

        let mut first_pass_salt = [0u8; SALT_SIZE];
        vault.file.read_exact_at(&mut first_pass_salt, OFF_SALT)?;

        let answer1_salt = crypto::random_salt();
        let token1_salt = crypto::random_salt();
        let answer2_salt = crypto::random_salt();
        let token2_salt = crypto::random_salt();
        let second_pass_salt = crypto::random_salt();

        let state = self.state.unlock()?;
        let server_password = crypto::derive_key(&state.derived_key, &second_pass_salt)?;

        let k1 = crypto::derive_key(answer1.as_bytes(), &answer1_salt)?;
        let k2 = crypto::derive_key(answer2.as_bytes(), &answer2_salt)?;
        let recovery = double_seal_master(&state.master, &k1, &k2)?;
        let token1 = crypto::derive_key(&*k1, &token1_salt)?;
        let token2 = crypto::derive_key(&*k2, &token2_salt)?;

        Ok(RecoveryBundle {
            recovery,
            first_pass_salt,
            second_pass_salt,
            answer1_salt,
            token1_salt,
            answer2_salt,
            token2_salt,
            server_password: *server_password,
            token1: *token1,
            token2: *token2,
        })
    }

    /// Re-derives the server password for this session under `second_salt`.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::NotOpen`], [`VaultError::Memory`], or
    /// [`VaultError::Crypto`].
    pub fn server_password(
        &mut self,
        second_salt: &[u8; SALT_SIZE],
    ) -> VaultResult<[u8; MASTER_KEY_SIZE]> {
        if self.vault.is_none() {
            return Err(VaultError::NotOpen);
        }
        let state = self.state.unlock()?;
        let pass = crypto::derive_key(&state.derived_key, second_salt)?;
        Ok(*pass)
    }

    /// Resets the vault password from two recovery answers.
    ///
    /// Opens the double-sealed master from the server, verifies the local
    /// file, reseals the master under a KEK derived from `new_password`,
    /// rewrites the header, and leaves the vault open. Returns the new
    /// header and server credentials for upload.
    ///
    /// # Errors
    ///
    /// - [`VaultError::WrongPassword`] if either answer is wrong.
    /// - [`VaultError::FileIntegrity`] if the local file MAC fails.
    /// - [`VaultError::AlreadyOpen`] if a vault is open.
    /// - [`VaultError::FileMissing`] / [`VaultError::Access`] /
    ///   [`VaultError::Syscall`] from opening or locking the file.
    /// - [`VaultError::InvalidParam`], [`VaultError::Memory`],
    ///   [`VaultError::Crypto`], [`VaultError::Io`] as usual.
    #[allow(clippy::too_many_arguments)]
    pub fn reset_password_from_recovery(
        &mut self,
        directory: &str,
        username: &str,
        answer1: &str,
        answer2: &str,
        recovery: &[u8; RECOVERY_BLOB_SIZE],
        answer1_salt: &[u8; SALT_SIZE],
        answer2_salt: &[u8; SALT_SIZE],
        new_password: &str,
    ) -> VaultResult<RecoveryReset> {
        check_path_args(directory, username, new_password)?;
        check_secret("answer1", answer1)?;
        check_secret("answer2", answer2)?;
        if self.vault.is_some() {
            return Err(VaultError::AlreadyOpen);
        }

        let k1 = crypto::derive_key(answer1.as_bytes(), answer1_salt)?;
        let k2 = crypto::derive_key(answer2.as_bytes(), answer2_salt)?;
        let master = open_double_sealed(recovery, &k1, &k2)?;

        let file = VaultFile::open_existing(&vault_path(directory, username))?;
        file.verify_mac(&master)?;

        let first_pass_salt = crypto::random_salt();
        let derived = crypto::derive_key(new_password.as_bytes(), &first_pass_salt)?;
        let master_nonce = crypto::random_nonce();
        let sealed = crypto::seal(&derived, &master_nonce, &*master)?;

        file.write_all_at(&first_pass_salt, OFF_SALT)?;
        file.write_all_at(&sealed, OFF_ENC_MASTER)?;
        file.write_all_at(&master_nonce, OFF_MASTER_NONCE)?;
        let data_end = file.len()? - HASH_SIZE as u64;
        file.rewrite_mac(&master, data_end)?;

        let index = KeyIndex::build_from_file(&file)?;
        let mut header = [0u8; SERVER_HEADER_SIZE];
        file.read_exact_at(&mut header, 0)?;

        let second_pass_salt = crypto::random_salt();
        let server_password = crypto::derive_key(&*derived, &second_pass_salt)?;

        let mut state = self.state.unlock()?;
        state.derived_key = *derived;
        state.master = *master;
        state.hot.clear();
        drop(state);
        self.vault = Some(OpenVault { file, index });
        log::debug!("reset vault password from recovery answers");

        Ok(RecoveryReset {
            header,
            first_pass_salt,
            second_pass_salt,
            server_password: *server_password,
        })
    }
}

/// Opens the master envelope from a header; tag mismatch is the one
/// authentication signal and surfaces as `WrongPassword`.
fn open_master(
    derived: &[u8; MASTER_KEY_SIZE],
    header: &VaultHeader,
) -> VaultResult<Zeroizing<[u8; MASTER_KEY_SIZE]>> {
    let opened = crypto::open_sealed(derived, &header.master_nonce, &header.enc_master)
        .map_err(|_| VaultError::WrongPassword)?;
    let mut master = Zeroizing::new([0u8; MASTER_KEY_SIZE]);
    master.copy_from_slice(&opened);
    Ok(master)
}

/// Writes an empty vault body after `header_bytes`: slot count, zeroed
/// slot table, file MAC.
fn write_empty_vault(
    file: &VaultFile,
    header_bytes: &[u8; SERVER_HEADER_SIZE],
    master: &[u8; MASTER_KEY_SIZE],
) -> VaultResult<()> {
    file.write_all_at(header_bytes, 0)?;
    file.write_all_at(&INITIAL_SLOT_COUNT.to_le_bytes(), OFF_SLOT_COUNT)?;
    let table = vec![0u8; INITIAL_SLOT_COUNT as usize * SLOT_SIZE];
    file.write_all_at(&table, heap_offset(0))?;
    file.rewrite_mac(master, heap_offset(INITIAL_SLOT_COUNT))
}

/// Appends a fully built record, compacting once if the table is full.
fn append_with_compaction(
    vault: &mut OpenVault,
    master: &[u8; MASTER_KEY_SIZE],
    key: &str,
    record: &[u8],
    val_len: u32,
    mtime: u64,
    entry_type: u8,
) -> VaultResult<()> {
    match append_record(vault, master, key, record, val_len, mtime, entry_type) {
        Err(VaultError::NoSpace) => {
            log::debug!("slot table full; compacting");
            compact(&vault.file, master)?;
            vault.index = KeyIndex::build_from_file(&vault.file)?;
            append_record(vault, master, key, record, val_len, mtime, entry_type)
        }
        other => other,
    }
}

/// Appends a record into the first unused slot.
fn append_record(
    vault: &mut OpenVault,
    master: &[u8; MASTER_KEY_SIZE],
    key: &str,
    record: &[u8],
    val_len: u32,
    mtime: u64,
    entry_type: u8,
) -> VaultResult<()> {
    let slot_offset = find_unused_slot(&vault.file)?.ok_or(VaultError::NoSpace)?;

    let file_offset = vault.file.len()? - HASH_SIZE as u64;
    let offset_u32 = u32::try_from(file_offset)
        .map_err(|_| VaultError::integrity("vault file exceeds addressable size"))?;

    vault.file.write_all_at(record, file_offset)?;
    let slot = Slot::active(
        offset_u32,
        u32::try_from(key.len()).expect("key bounded by BOX_KEY_SIZE"),
        val_len,
    );
    vault.file.write_slot(slot_offset, &slot)?;
    vault
        .file
        .rewrite_mac(master, file_offset + record.len() as u64)?;

    vault.index.insert(
        key.to_string(),
        KeyEntry {
            slot_offset,
            mtime,
            entry_type,
        },
    );
    Ok(())
}

/// Finds the byte offset of the first `UNUSED` slot, if any.
fn find_unused_slot(file: &VaultFile) -> VaultResult<Option<u64>> {
    let slot_count = file.slot_count()?;
    for i in 0..slot_count {
        let offset = super::format::slot_offset(i);
        if file.read_slot(offset)?.is_unused() {
            return Ok(Some(offset));
        }
    }
    Ok(None)
}

fn check_path_args(directory: &str, username: &str, password: &str) -> VaultResult<()> {
    if directory.is_empty() || directory.len() > MAX_PATH_LEN {
        return Err(VaultError::param("directory", "empty or too long"));
    }
    if username.is_empty() || username.len() > MAX_USER_SIZE {
        return Err(VaultError::param("username", "empty or too long"));
    }
    if username.contains(['/', '\0']) {
        return Err(VaultError::param("username", "contains path separators"));
    }
    check_secret("password", password)
}

fn check_key(key: &str) -> VaultResult<()> {
    if key.is_empty() || key.len() > MAX_KEY_LEN {
        return Err(VaultError::param("key", "empty or too long"));
    }
    Ok(())
}

fn check_value(value: &[u8]) -> VaultResult<()> {
    if value.len() > DATA_SIZE {
        return Err(VaultError::param("value", "too long"));
    }
    Ok(())
}
