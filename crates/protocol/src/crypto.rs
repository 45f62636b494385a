//! Session crypto for IonNet connections.
//!
//! Key agreement is ECDH on P-521 (secp521r1). Public keys travel as the
//! hex encoding of their uncompressed SEC1 form (`0x04 || x || y`, 133 bytes).
//! The shared secret is reduced to a 32-byte AES-256 key and payloads are
//! encrypted with AES-256-CBC and PKCS#7 padding.
//!
//! CBC provides no integrity protection, and in the default configuration the
//! same key pair and IV serve every connection of the process. See
//! [`crate::config::ConnectionConfig::hardened`] for per-connection keys and IVs.

use std::sync::{Arc, PoisonError, RwLock};

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::Engine;
use p521::ecdh::diffie_hellman;
use p521::elliptic_curve::sec1::ToEncodedPoint;
use p521::{PublicKey, SecretKey};
use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::Zeroizing;

use crate::config::KeyDerivation;
use crate::error::{ProtocolError, Result};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Length of the AES-256 session key in bytes.
pub const SESSION_KEY_LENGTH: usize = 32;

/// Length of the CBC initialization vector in bytes.
pub const IV_LENGTH: usize = 16;

/// The constant IV shared by every IonNet session in fixed-IV mode.
pub const FIXED_IV: &str = "a2xhcgAAAAAAAAAA";

/// Length of a key fingerprint in bytes (SHA-256 output truncated to 16 bytes).
pub const FINGERPRINT_LENGTH: usize = 16;

/// A P-521 key pair used for the handshake.
pub struct KeyPair {
    secret_key: SecretKey,
    /// Hex of the uncompressed SEC1 public key, cached.
    public_key_hex: String,
}

impl KeyPair {
    /// Generates a new random key pair using the OS random number generator.
    pub fn generate() -> Self {
        let secret_key = SecretKey::random(&mut OsRng);
        let public_key_hex =
            hex::encode(secret_key.public_key().to_encoded_point(false).as_bytes());

        Self {
            secret_key,
            public_key_hex,
        }
    }

    /// Returns the public key as sent in the handshake.
    pub fn public_key_hex(&self) -> &str {
        &self.public_key_hex
    }

    /// Generates a human-readable fingerprint of the public key.
    ///
    /// Groups of 4 hex characters separated by colons, for example
    /// `a1b2:c3d4:e5f6:7890:1234:5678:9abc:def0`.
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.public_key_hex)
    }

    /// Computes the raw ECDH shared secret with a peer's hex-encoded public key.
    ///
    /// Fails with [`ProtocolError::InvalidPublicKey`] if the key is not valid
    /// hex or is not a point on P-521.
    pub fn derive_secret(&self, peer_public_key: &str) -> Result<Zeroizing<Vec<u8>>> {
        let bytes = hex::decode(peer_public_key)
            .map_err(|e| ProtocolError::InvalidPublicKey(format!("not valid hex: {}", e)))?;
        let peer = PublicKey::from_sec1_bytes(&bytes)
            .map_err(|_| ProtocolError::InvalidPublicKey("not a P-521 point".to_string()))?;

        let shared = diffie_hellman(self.secret_key.to_nonzero_scalar(), peer.as_affine());
        Ok(Zeroizing::new(shared.raw_secret_bytes().to_vec()))
    }

    /// Derives the session cipher for a peer's public key and the agreed IV.
    pub fn build_cipher(
        &self,
        peer_public_key: &str,
        iv: &str,
        derivation: KeyDerivation,
    ) -> Result<SessionCipher> {
        let secret = self.derive_secret(peer_public_key)?;
        let key = session_key(&secret, derivation)?;
        let iv = parse_iv(iv).ok_or_else(|| {
            ProtocolError::Encryption(format!("iv must be exactly {} bytes", IV_LENGTH))
        })?;
        Ok(SessionCipher::new(key, iv))
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("fingerprint", &self.fingerprint())
            .field("secret_key", &"[REDACTED]")
            .finish()
    }
}

/// Holds the key pair used by connections created through it.
///
/// A provider is constructed explicitly and shared with `Arc`. Connections take
/// a snapshot of the current key pair when they are created, so
/// [`CryptoProvider::create_keys`] only affects connections made afterwards.
pub struct CryptoProvider {
    keys: RwLock<Arc<KeyPair>>,
}

impl CryptoProvider {
    /// Creates a provider with a freshly generated key pair.
    pub fn new() -> Self {
        Self {
            keys: RwLock::new(Arc::new(KeyPair::generate())),
        }
    }

    /// Creates a provider around an existing key pair.
    pub fn with_key_pair(keys: KeyPair) -> Self {
        Self {
            keys: RwLock::new(Arc::new(keys)),
        }
    }

    /// Replaces the key pair with a newly generated one.
    pub fn create_keys(&self) {
        let fresh = Arc::new(KeyPair::generate());
        tracing::debug!(fingerprint = %fresh.fingerprint(), "generated new key pair");
        *self.keys.write().unwrap_or_else(PoisonError::into_inner) = fresh;
    }

    /// Returns the current key pair.
    pub fn key_pair(&self) -> Arc<KeyPair> {
        self.keys
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Returns the hex-encoded public key of the current key pair.
    pub fn public_key(&self) -> String {
        self.key_pair().public_key_hex().to_string()
    }

    /// Computes the ECDH shared secret with the current key pair.
    pub fn derive_secret(&self, peer_public_key: &str) -> Result<Zeroizing<Vec<u8>>> {
        self.key_pair().derive_secret(peer_public_key)
    }

    /// Builds a session cipher with the current key pair.
    pub fn build_cipher(
        &self,
        peer_public_key: &str,
        iv: &str,
        derivation: KeyDerivation,
    ) -> Result<SessionCipher> {
        self.key_pair().build_cipher(peer_public_key, iv, derivation)
    }
}

impl Default for CryptoProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CryptoProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoProvider")
            .field("keys", &*self.key_pair())
            .finish()
    }
}

/// Symmetric context for one connection: AES-256-CBC with a fixed key and IV.
#[derive(Clone)]
pub struct SessionCipher {
    key: Zeroizing<[u8; SESSION_KEY_LENGTH]>,
    iv: [u8; IV_LENGTH],
}

impl SessionCipher {
    /// Creates a cipher from raw key and IV bytes.
    pub fn new(key: [u8; SESSION_KEY_LENGTH], iv: [u8; IV_LENGTH]) -> Self {
        Self {
            key: Zeroizing::new(key),
            iv,
        }
    }

    /// Returns the IV bytes.
    pub fn iv(&self) -> &[u8; IV_LENGTH] {
        &self.iv
    }

    /// Encrypts a plaintext with PKCS#7 padding.
    pub fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        Aes256CbcEnc::new((&*self.key).into(), (&self.iv).into())
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext)
    }

    /// Decrypts a ciphertext and strips its padding.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.is_empty() || ciphertext.len() % IV_LENGTH != 0 {
            return Err(ProtocolError::Decryption(format!(
                "ciphertext length {} is not a positive multiple of the block size",
                ciphertext.len()
            )));
        }

        Aes256CbcDec::new((&*self.key).into(), (&self.iv).into())
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| ProtocolError::Decryption("invalid padding".to_string()))
    }

    /// Encrypts a UTF-8 string and returns the ciphertext as lowercase hex.
    pub fn encrypt_to_hex(&self, plaintext: &str) -> String {
        hex::encode(self.encrypt(plaintext.as_bytes()))
    }

    /// Decrypts hex-encoded ciphertext into a UTF-8 string.
    pub fn decrypt_hex(&self, ciphertext: &str) -> Result<String> {
        let bytes = hex::decode(ciphertext.trim())
            .map_err(|e| ProtocolError::Decryption(format!("ciphertext is not hex: {}", e)))?;
        let plaintext = self.decrypt(&bytes)?;
        String::from_utf8(plaintext)
            .map_err(|e| ProtocolError::Decryption(format!("plaintext is not utf-8: {}", e)))
    }
}

impl std::fmt::Debug for SessionCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCipher")
            .field("key", &"[REDACTED]")
            .field("iv", &hex::encode(self.iv))
            .finish()
    }
}

/// Reduces a shared secret to the AES-256 session key.
pub fn session_key(
    secret: &[u8],
    derivation: KeyDerivation,
) -> Result<[u8; SESSION_KEY_LENGTH]> {
    let mut key = [0u8; SESSION_KEY_LENGTH];
    match derivation {
        KeyDerivation::RawPrefix => {
            let prefix = secret.get(..SESSION_KEY_LENGTH).ok_or_else(|| {
                ProtocolError::Encryption(format!(
                    "shared secret too short: {} bytes",
                    secret.len()
                ))
            })?;
            key.copy_from_slice(prefix);
        }
        KeyDerivation::HexPrefix => {
            let encoded = Zeroizing::new(hex::encode(secret));
            let prefix = encoded.as_bytes().get(..SESSION_KEY_LENGTH).ok_or_else(|| {
                ProtocolError::Encryption(format!(
                    "shared secret too short: {} bytes",
                    secret.len()
                ))
            })?;
            key.copy_from_slice(prefix);
        }
    }
    Ok(key)
}

/// Parses an IV string; its UTF-8 bytes must be exactly [`IV_LENGTH`] long.
pub fn parse_iv(iv: &str) -> Option<[u8; IV_LENGTH]> {
    iv.as_bytes().try_into().ok()
}

/// Generates a random 16-character IV string (base64 of 12 random bytes).
pub fn random_iv() -> String {
    let mut bytes = [0u8; 12];
    OsRng.fill_bytes(&mut bytes);
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// Fingerprint of a hex-encoded public key.
pub fn fingerprint(public_key_hex: &str) -> String {
    use sha2::{Digest, Sha256};
    let hash = Sha256::digest(public_key_hex.as_bytes());
    hash[..FINGERPRINT_LENGTH]
        .chunks(2)
        .map(|chunk| format!("{:02x}{:02x}", chunk[0], chunk[1]))
        .collect::<Vec<_>>()
        .join(":")
}
