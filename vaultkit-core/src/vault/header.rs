//! Vault header encode/decode.
//!
//! The header is the first 104 bytes of the file — everything up to but not
//! including the slot count — and is exactly what gets uploaded to the sync
//! server: with only these bytes and the password, a client can recover the
//! master key on a new machine.
//!
//! # Binary Layout (104 bytes)
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  -----
//! 0       1     version
//! 1       7     reserved (zero)
//! 8       16    password salt
//! 24      48    encrypted master key (32 ct + 16 tag)
//! 72      24    master nonce
//! 96      8     last_server_time (u64 LE)
//! ```

use crate::error::{VaultError, VaultResult};

use super::format::{
    ENC_MASTER_SIZE, NONCE_SIZE, SALT_SIZE, SERVER_HEADER_SIZE, VERSION,
};

/// Decoded form of the server header.
#[derive(Clone, PartialEq, Eq)]
pub struct VaultHeader {
    /// Salt for the password-derived key-encrypting key.
    pub salt: [u8; SALT_SIZE],
    /// The master key sealed under the KEK (ciphertext plus tag).
    pub enc_master: [u8; ENC_MASTER_SIZE],
    /// Nonce the master key was sealed with.
    pub master_nonce: [u8; NONCE_SIZE],
    /// Timestamp of the last successful server exchange.
    pub last_server_time: u64,
}

impl VaultHeader {
    /// Encodes the header to its on-disk form.
    #[must_use]
    pub fn encode(&self) -> [u8; SERVER_HEADER_SIZE] {
        let mut buf = [0u8; SERVER_HEADER_SIZE];
        buf[0] = VERSION;
        // bytes 1..8 stay reserved zeroes
        buf[8..24].copy_from_slice(&self.salt);
        buf[24..72].copy_from_slice(&self.enc_master);
        buf[72..96].copy_from_slice(&self.master_nonce);
        buf[96..104].copy_from_slice(&self.last_server_time.to_le_bytes());
        buf
    }

    /// Decodes a header from bytes.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::FileIntegrity`] if the buffer is too short or
    /// carries an unsupported version byte.
    pub fn decode(bytes: &[u8]) -> VaultResult<Self> {
        if bytes.len() < SERVER_HEADER_SIZE {
            return Err(VaultError::integrity("vault header too short"));
        }
        if bytes[0] != VERSION {
            return Err(VaultError::integrity(format!(
                "unsupported vault version {}",
                bytes[0]
            )));
        }

        let mut salt = [0u8; SALT_SIZE];
        salt.copy_from_slice(&bytes[8..24]);
        let mut enc_master = [0u8; ENC_MASTER_SIZE];
        enc_master.copy_from_slice(&bytes[24..72]);
        let mut master_nonce = [0u8; NONCE_SIZE];
        master_nonce.copy_from_slice(&bytes[72..96]);
        let last_server_time = u64::from_le_bytes(
            bytes[96..104].try_into().expect("slice length is 8"),
        );

        Ok(Self {
            salt,
            enc_master,
            master_nonce,
            last_server_time,
        })
    }
}

impl std::fmt::Debug for VaultHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultHeader")
            .field("enc_master", &"[sealed]")
            .field("last_server_time", &self.last_server_time)
            .finish_non_exhaustive()
    }
}
