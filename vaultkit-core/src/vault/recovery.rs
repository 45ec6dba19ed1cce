//! Recovery and server-credential derivations.
//!
//! The sync server must be able to authenticate the user and hold enough
//! material to restore a vault, without ever being able to decrypt one.
//! Everything it stores is either Argon2id output (which it cannot invert)
//! or the master key sealed twice under keys derived from the user's two
//! security answers.
//!
//! Recovery blob layout (112 bytes):
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  -----
//! 0       64    outer ciphertext: seal(seal(master, n1, k1), n2, k2)
//! 64      24    n1 (inner nonce)
//! 88      24    n2 (outer nonce)
//! ```
//!
//! where `k1 = argon2id(answer1, S11)` and `k2 = argon2id(answer2, S21)`.

use zeroize::Zeroizing;

use crate::crypto;
use crate::error::{VaultError, VaultResult};

use super::format::{
    MAC_SIZE, MASTER_KEY_SIZE, NONCE_SIZE, SALT_SIZE, SERVER_HEADER_SIZE,
};

/// Size of the double-sealed recovery blob.
pub const RECOVERY_BLOB_SIZE: usize = MASTER_KEY_SIZE + 2 * MAC_SIZE + 2 * NONCE_SIZE;

const INNER_SEALED_SIZE: usize = MASTER_KEY_SIZE + MAC_SIZE;
const OUTER_SEALED_SIZE: usize = INNER_SEALED_SIZE + MAC_SIZE;

/// Everything the server stores at recovery enrollment.
///
/// `token1`/`token2` let the server check recovery answers without learning
/// them (they are doubly-derived); `recovery` is the sealed master the
/// server cannot open; `server_password` authenticates ordinary syncs.
pub struct RecoveryBundle {
    /// Double-sealed master key plus both nonces.
    pub recovery: [u8; RECOVERY_BLOB_SIZE],
    /// Salt of the vault password derivation, read from the header.
    pub first_pass_salt: [u8; SALT_SIZE],
    /// Fresh salt for the server-password derivation.
    pub second_pass_salt: [u8; SALT_SIZE],
    /// Salt for deriving `k1` from answer 1.
    pub answer1_salt: [u8; SALT_SIZE],
    /// Salt for deriving `token1` from `k1`.
    pub token1_salt: [u8; SALT_SIZE],
    /// Salt for deriving `k2` from answer 2.
    pub answer2_salt: [u8; SALT_SIZE],
    /// Salt for deriving `token2` from `k2`.
    pub token2_salt: [u8; SALT_SIZE],
    /// Doubly-derived password the server authenticates syncs with.
    pub server_password: [u8; MASTER_KEY_SIZE],
    /// Verification token for answer 1.
    pub token1: [u8; MASTER_KEY_SIZE],
    /// Verification token for answer 2.
    pub token2: [u8; MASTER_KEY_SIZE],
}

/// Result of a password reset through recovery answers.
#[derive(Debug)]
pub struct RecoveryReset {
    /// The rewritten vault header, for upload.
    pub header: [u8; SERVER_HEADER_SIZE],
    /// Salt of the new password derivation.
    pub first_pass_salt: [u8; SALT_SIZE],
    /// Fresh salt for the new server password.
    pub second_pass_salt: [u8; SALT_SIZE],
    /// The new server password.
    pub server_password: [u8; MASTER_KEY_SIZE],
}

/// The two server-side verification tokens for a pair of recovery answers.
pub struct ResponseTokens {
    /// Verification token for answer 1.
    pub token1: [u8; MASTER_KEY_SIZE],
    /// Verification token for answer 2.
    pub token2: [u8; MASTER_KEY_SIZE],
}

/// Derives the server password from a vault password and two salts.
///
/// Used when downloading a vault onto a machine that has none: the client
/// proves itself to the server before any local file exists. The double
/// derivation keeps the vault KEK out of the server's hands.
///
/// # Errors
///
/// - [`VaultError::InvalidParam`] if the password exceeds the size bound.
/// - [`VaultError::Crypto`] if a derivation fails.
pub fn make_server_password(
    password: &str,
    first_salt: &[u8; SALT_SIZE],
    second_salt: &[u8; SALT_SIZE],
) -> VaultResult<[u8; MASTER_KEY_SIZE]> {
    check_secret("password", password)?;
    let derived = crypto::derive_key(password.as_bytes(), first_salt)?;
    let server_pass = crypto::derive_key(&*derived, second_salt)?;
    Ok(*server_pass)
}

/// Derives the two verification tokens the server checks recovery answers
/// against.
///
/// Stateless: used when answering a recovery challenge on a machine that
/// has no vault.
///
/// # Errors
///
/// - [`VaultError::InvalidParam`] if an answer exceeds the size bound.
/// - [`VaultError::Crypto`] if a derivation fails.
pub fn response_tokens(
    answer1: &str,
    answer2: &str,
    answer1_salt: &[u8; SALT_SIZE],
    token1_salt: &[u8; SALT_SIZE],
    answer2_salt: &[u8; SALT_SIZE],
    token2_salt: &[u8; SALT_SIZE],
) -> VaultResult<ResponseTokens> {
    check_secret("answer1", answer1)?;
    check_secret("answer2", answer2)?;
    let k1 = crypto::derive_key(answer1.as_bytes(), answer1_salt)?;
    let k2 = crypto::derive_key(answer2.as_bytes(), answer2_salt)?;
    let token1 = crypto::derive_key(&*k1, token1_salt)?;
    let token2 = crypto::derive_key(&*k2, token2_salt)?;
    Ok(ResponseTokens {
        token1: *token1,
        token2: *token2,
    })
}

/// Seals the master key under both answer-derived keys.
pub(crate) fn double_seal_master(
    master: &[u8; MASTER_KEY_SIZE],
    k1: &[u8; MASTER_KEY_SIZE],
    k2: &[u8; MASTER_KEY_SIZE],
) -> VaultResult<[u8; RECOVERY_BLOB_SIZE]> {
    let inner_nonce = crypto::random_nonce();
    let outer_nonce = crypto::random_nonce();

    let inner = Zeroizing::new(crypto::seal(k1, &inner_nonce, master)?);
    let outer = crypto::seal(k2, &outer_nonce, &inner)?;
    debug_assert_eq!(outer.len(), OUTER_SEALED_SIZE);

    let mut blob = [0u8; RECOVERY_BLOB_SIZE];
    blob[..OUTER_SEALED_SIZE].copy_from_slice(&outer);
    blob[OUTER_SEALED_SIZE..OUTER_SEALED_SIZE + NONCE_SIZE].copy_from_slice(&inner_nonce);
    blob[OUTER_SEALED_SIZE + NONCE_SIZE..].copy_from_slice(&outer_nonce);
    Ok(blob)
}

/// Opens a double-sealed recovery blob with both answer-derived keys.
///
/// # Errors
///
/// Returns [`VaultError::WrongPassword`] if either layer fails to open;
/// which layer failed is deliberately not distinguished.
pub(crate) fn open_double_sealed(
    blob: &[u8; RECOVERY_BLOB_SIZE],
    k1: &[u8; MASTER_KEY_SIZE],
    k2: &[u8; MASTER_KEY_SIZE],
) -> VaultResult<Zeroizing<[u8; MASTER_KEY_SIZE]>> {
    let outer_ct = &blob[..OUTER_SEALED_SIZE];
    let inner_nonce: [u8; NONCE_SIZE] = blob[OUTER_SEALED_SIZE..OUTER_SEALED_SIZE + NONCE_SIZE]
        .try_into()
        .expect("slice length is 24");
    let outer_nonce: [u8; NONCE_SIZE] = blob[OUTER_SEALED_SIZE + NONCE_SIZE..]
        .try_into()
        .expect("slice length is 24");

    let inner = crypto::open_sealed(k2, &outer_nonce, outer_ct)
        .map_err(|_| VaultError::WrongPassword)?;
    let master = crypto::open_sealed(k1, &inner_nonce, &inner)
        .map_err(|_| VaultError::WrongPassword)?;

    let mut out = Zeroizing::new([0u8; MASTER_KEY_SIZE]);
    if master.len() != MASTER_KEY_SIZE {
        return Err(VaultError::crypto("recovered master has wrong length"));
    }
    out.copy_from_slice(&master);
    Ok(out)
}

pub(crate) fn check_secret(parameter: &'static str, value: &str) -> VaultResult<()> {
    if value.len() > super::format::MAX_PASS_SIZE {
        return Err(VaultError::param(parameter, "too long"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn test_double_seal_roundtrip() {
        let master = [0x42u8; MASTER_KEY_SIZE];
        let k1 = [1u8; MASTER_KEY_SIZE];
        let k2 = [2u8; MASTER_KEY_SIZE];

        let blob = double_seal_master(&master, &k1, &k2).unwrap();
        let opened = open_double_sealed(&blob, &k1, &k2).unwrap();
        assert_eq!(*opened, master);
    }

    #[test]
    fn test_either_wrong_key_is_wrongpass() {
        let master = [0x42u8; MASTER_KEY_SIZE];
        let k1 = [1u8; MASTER_KEY_SIZE];
        let k2 = [2u8; MASTER_KEY_SIZE];
        let bad = [9u8; MASTER_KEY_SIZE];

        let blob = double_seal_master(&master, &k1, &k2).unwrap();
        for (a, b) in [(&bad, &k2), (&k1, &bad), (&k2, &k1)] {
            let err = open_double_sealed(&blob, a, b).unwrap_err();
            assert_eq!(err.code(), ErrorCode::WrongPassword);
        }
    }

    #[test]
    fn test_tampered_blob_is_wrongpass() {
        let master = [0x42u8; MASTER_KEY_SIZE];
        let k1 = [1u8; MASTER_KEY_SIZE];
        let k2 = [2u8; MASTER_KEY_SIZE];

        let mut blob = double_seal_master(&master, &k1, &k2).unwrap();
        blob[10] ^= 0x01;
        let err = open_double_sealed(&blob, &k1, &k2).unwrap_err();
        assert_eq!(err.code(), ErrorCode::WrongPassword);
    }

    #[test]
    fn test_make_server_password_deterministic() {
        let s1 = [3u8; SALT_SIZE];
        let s2 = [4u8; SALT_SIZE];
        let a = make_server_password("hunter2", &s1, &s2).unwrap();
        let b = make_server_password("hunter2", &s1, &s2).unwrap();
        assert_eq!(a, b);
        let c = make_server_password("hunter3", &s1, &s2).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn test_response_tokens_deterministic() {
        let salts = ([1u8; 16], [2u8; 16], [3u8; 16], [4u8; 16]);
        let a = response_tokens("dog", "42", &salts.0, &salts.1, &salts.2, &salts.3).unwrap();
        let b = response_tokens("dog", "42", &salts.0, &salts.1, &salts.2, &salts.3).unwrap();
        assert_eq!(a.token1, b.token1);
        assert_eq!(a.token2, b.token2);
        assert_ne!(a.token1, a.token2);
    }
}
