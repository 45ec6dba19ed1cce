//! Thin contracts over the cryptographic primitives.
//!
//! The engine needs exactly five things: a memory-hard password hash
//! (Argon2id), an AEAD with a 24-byte nonce and 16-byte tag
//! (XChaCha20-Poly1305), a 32-byte keyed hash (BLAKE2b-MAC) in one-shot and
//! streaming form, OS randomness, and a constant-time compare. Everything
//! here is stateless; keys live with the caller.

use argon2::{Algorithm, Argon2, Params, Version};
use blake2::Blake2bMac;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use digest::{consts::U32, Mac};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::error::{VaultError, VaultResult};
use crate::vault::format::{HASH_SIZE, MASTER_KEY_SIZE, NONCE_SIZE, SALT_SIZE};

/// Argon2id memory cost in KiB (64 MiB).
pub const KDF_MEMORY_KIB: u32 = 65_536;

/// Argon2id pass count.
pub const KDF_PASSES: u32 = 3;

/// Argon2id lane count.
pub const KDF_LANES: u32 = 1;

type KeyedBlake2b = Blake2bMac<U32>;

/// Derives a 32-byte key from a secret and salt with Argon2id v1.3.
///
/// Deterministic for a given `(secret, salt)` pair. The secret may be a
/// password, a recovery answer, or another derived key (the server-password
/// flows re-derive from key material).
///
/// # Errors
///
/// Returns [`VaultError::Crypto`] if the derivation itself fails.
pub fn derive_key(
    secret: &[u8],
    salt: &[u8; SALT_SIZE],
) -> VaultResult<Zeroizing<[u8; MASTER_KEY_SIZE]>> {
    let params = Params::new(KDF_MEMORY_KIB, KDF_PASSES, KDF_LANES, Some(MASTER_KEY_SIZE))
        .map_err(|e| VaultError::crypto(format!("Argon2id parameters: {e}")))?;
    let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut out = Zeroizing::new([0u8; MASTER_KEY_SIZE]);
    argon
        .hash_password_into(secret, salt, &mut *out)
        .map_err(|e| VaultError::crypto(format!("Argon2id derivation: {e}")))?;
    Ok(out)
}

/// Seals `plaintext` under `key` with XChaCha20-Poly1305.
///
/// Returns ciphertext with the 16-byte tag appended.
///
/// # Errors
///
/// Returns [`VaultError::Crypto`] if encryption fails.
///
/// # Panics
///
/// Will not panic: the `expect` guards a key length that is fixed by the
/// parameter type.
pub fn seal(
    key: &[u8; MASTER_KEY_SIZE],
    nonce: &[u8; NONCE_SIZE],
    plaintext: &[u8],
) -> VaultResult<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new_from_slice(key).expect("key length is always 32");
    cipher
        .encrypt(XNonce::from_slice(nonce), plaintext)
        .map_err(|_| VaultError::crypto("XChaCha20-Poly1305 seal failed"))
}

/// Opens a sealed buffer (ciphertext with trailing tag) under `key`.
///
/// # Errors
///
/// Returns [`VaultError::Crypto`] on tag mismatch or malformed input. Call
/// sites that open the master-key envelope translate that into
/// [`VaultError::WrongPassword`].
///
/// # Panics
///
/// Will not panic: the `expect` guards a key length that is fixed by the
/// parameter type.
pub fn open_sealed(
    key: &[u8; MASTER_KEY_SIZE],
    nonce: &[u8; NONCE_SIZE],
    sealed: &[u8],
) -> VaultResult<Zeroizing<Vec<u8>>> {
    let cipher = XChaCha20Poly1305::new_from_slice(key).expect("key length is always 32");
    cipher
        .decrypt(XNonce::from_slice(nonce), sealed)
        .map(Zeroizing::new)
        .map_err(|_| VaultError::crypto("XChaCha20-Poly1305 open failed"))
}

/// Computes the 32-byte keyed BLAKE2b hash of `message` under `key`.
///
/// # Panics
///
/// Will not panic: the `expect` guards a key length that is fixed by the
/// parameter type.
#[must_use]
pub fn keyed_hash(key: &[u8; MASTER_KEY_SIZE], message: &[u8]) -> [u8; HASH_SIZE] {
    let mut mac: KeyedBlake2b = Mac::new_from_slice(key).expect("key length is always 32");
    mac.update(message);
    mac.finalize().into_bytes().into()
}

/// Streaming variant of [`keyed_hash`], used for the file-wide MAC.
pub struct KeyedHasher {
    mac: KeyedBlake2b,
}

impl KeyedHasher {
    /// Starts a keyed hash under `key`.
    ///
    /// # Panics
    ///
    /// Will not panic: the `expect` guards a key length that is fixed by the
    /// parameter type.
    #[must_use]
    pub fn new(key: &[u8; MASTER_KEY_SIZE]) -> Self {
        Self {
            mac: Mac::new_from_slice(key).expect("key length is always 32"),
        }
    }

    /// Absorbs `data`.
    pub fn update(&mut self, data: &[u8]) {
        self.mac.update(data);
    }

    /// Finishes and returns the 32-byte hash.
    #[must_use]
    pub fn finalize(self) -> [u8; HASH_SIZE] {
        self.mac.finalize().into_bytes().into()
    }
}

/// Fills `buf` with OS randomness.
///
/// # Panics
///
/// Panics if the operating system's random number generator fails.
pub fn fill_random(buf: &mut [u8]) {
    getrandom::getrandom(buf).expect("getrandom failed");
}

/// Returns a fresh random salt.
#[must_use]
pub fn random_salt() -> [u8; SALT_SIZE] {
    let mut salt = [0u8; SALT_SIZE];
    fill_random(&mut salt);
    salt
}

/// Returns a fresh random AEAD nonce.
#[must_use]
pub fn random_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    fill_random(&mut nonce);
    nonce
}

/// Constant-time equality of two byte slices.
///
/// Slices of different lengths compare unequal; only the contents are
/// compared in constant time.
#[must_use]
pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::format::MAC_SIZE;

    #[test]
    fn test_derive_key_is_deterministic() {
        let salt = [7u8; SALT_SIZE];
        let a = derive_key(b"hunter2", &salt).unwrap();
        let b = derive_key(b"hunter2", &salt).unwrap();
        assert_eq!(*a, *b);

        let c = derive_key(b"hunter3", &salt).unwrap();
        assert_ne!(*a, *c);

        let other_salt = [8u8; SALT_SIZE];
        let d = derive_key(b"hunter2", &other_salt).unwrap();
        assert_ne!(*a, *d);
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let key = [0x11u8; MASTER_KEY_SIZE];
        let nonce = random_nonce();
        let sealed = seal(&key, &nonce, b"vault value").unwrap();
        assert_eq!(sealed.len(), b"vault value".len() + MAC_SIZE);

        let opened = open_sealed(&key, &nonce, &sealed).unwrap();
        assert_eq!(&opened[..], b"vault value");
    }

    #[test]
    fn test_open_rejects_tampering_and_wrong_key() {
        let key = [0x11u8; MASTER_KEY_SIZE];
        let nonce = random_nonce();
        let mut sealed = seal(&key, &nonce, b"vault value").unwrap();

        sealed[0] ^= 0xFF;
        assert!(open_sealed(&key, &nonce, &sealed).is_err());
        sealed[0] ^= 0xFF;

        let wrong_key = [0x22u8; MASTER_KEY_SIZE];
        assert!(open_sealed(&wrong_key, &nonce, &sealed).is_err());
    }

    #[test]
    fn test_keyed_hash_depends_on_key() {
        let msg = b"record bytes";
        let h1 = keyed_hash(&[1u8; MASTER_KEY_SIZE], msg);
        let h2 = keyed_hash(&[2u8; MASTER_KEY_SIZE], msg);
        assert_ne!(h1, h2);
    }

    #[test]
    fn test_streaming_matches_one_shot() {
        let key = [9u8; MASTER_KEY_SIZE];
        let mut hasher = KeyedHasher::new(&key);
        hasher.update(b"hello, ");
        hasher.update(b"world");
        assert_eq!(hasher.finalize(), keyed_hash(&key, b"hello, world"));
    }

    #[test]
    fn test_ct_eq() {
        assert!(ct_eq(b"abc", b"abc"));
        assert!(!ct_eq(b"abc", b"abd"));
        assert!(!ct_eq(b"abc", b"abcd"));
    }
}
