//! Sync Crypto Module - Operation Envelopes
//!
//! Every operation body leaves the device sealed in an envelope:
//! - XChaCha20-Poly1305 with a 256-bit key and a fresh 192-bit nonce per seal
//! - Detached 128-bit authentication tag
//! - Wire format `base64(ciphertext):base64(nonce):base64(tag)`
//! - PBKDF2-HMAC-SHA256 for password-derived keys, with an enforced iteration floor
//!
//! Security Properties:
//! - The remote store only ever sees envelopes
//! - Nonces come from the system CSPRNG and are never reused for a key
//! - Key material is wiped on drop

use base64::Engine;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use ring::pbkdf2;
use ring::rand::{SecureRandom, SystemRandom};
use std::fmt;
use std::num::NonZeroU32;
use std::str::FromStr;
use std::sync::Mutex;
use zeroize::{Zeroize, ZeroizeOnDrop};

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 24;
pub const TAG_LEN: usize = 16;

/// Lowest PBKDF2 iteration count accepted by [`derive_key_from_password`]
pub const MIN_PBKDF2_ITERATIONS: u32 = 100_000;
/// Iteration count used when the caller has no stored preference
pub const DEFAULT_PBKDF2_ITERATIONS: u32 = 600_000;
pub const MIN_SALT_LEN: usize = 8;
pub const DEFAULT_SALT_LEN: usize = 16;

/// Wire sentinel carried by delete operations instead of an envelope
pub const TOMBSTONE_MARKER: &str = "deleted:nonce:authTag";

const WIRE_SEPARATOR: char = ':';

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    #[error("Authentication failed - wrong key or tampered payload")]
    AuthenticationFailure,

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Weak key derivation parameters: {0}")]
    WeakKdfParameters(String),

    #[error("Random number generator failure")]
    Rng,
}

// ============================================================================
// Keys
// ============================================================================

/// 256-bit symmetric sync key, zeroized on drop
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SyncKey([u8; KEY_LEN]);

impl SyncKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let key: [u8; KEY_LEN] = bytes.try_into().map_err(|_| {
            CryptoError::InvalidKey(format!("expected {} bytes, got {}", KEY_LEN, bytes.len()))
        })?;
        Ok(Self(key))
    }

    /// Fresh random key (tests, first-device bootstrap)
    pub fn generate() -> Result<Self, CryptoError> {
        let mut bytes = [0u8; KEY_LEN];
        fill_random(&mut bytes)?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for SyncKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SyncKey(..)")
    }
}

/// Source of the long-term symmetric key for a user
///
/// Key bootstrap (enrolment, escrow, device linking) lives outside this crate;
/// the sync core only asks for the key when it needs to seal or open.
pub trait KeyProvider: Send + Sync {
    fn sync_key(&self, user_id: &str) -> Result<SyncKey, CryptoError>;
}

/// Key provider holding an already-derived key
pub struct StaticKeyProvider {
    key: SyncKey,
}

impl StaticKeyProvider {
    pub fn new(key: SyncKey) -> Self {
        Self { key }
    }
}

impl KeyProvider for StaticKeyProvider {
    fn sync_key(&self, _user_id: &str) -> Result<SyncKey, CryptoError> {
        Ok(self.key.clone())
    }
}

/// Key provider deriving the key from a password on first use
pub struct PasswordKeyProvider {
    password: String,
    salt: Vec<u8>,
    iterations: u32,
    cached: Mutex<Option<SyncKey>>,
}

impl PasswordKeyProvider {
    /// Parameters are validated eagerly so a weak configuration fails at setup
    pub fn new(password: String, salt: Vec<u8>, iterations: u32) -> Result<Self, CryptoError> {
        validate_kdf_params(&password, &salt, iterations)?;
        Ok(Self {
            password,
            salt,
            iterations,
            cached: Mutex::new(None),
        })
    }
}

impl KeyProvider for PasswordKeyProvider {
    fn sync_key(&self, _user_id: &str) -> Result<SyncKey, CryptoError> {
        let mut cached = self
            .cached
            .lock()
            .map_err(|_| CryptoError::InvalidKey("key cache poisoned".to_string()))?;

        if let Some(key) = cached.as_ref() {
            return Ok(key.clone());
        }

        let key = derive_key_from_password(&self.password, &self.salt, self.iterations)?;
        *cached = Some(key.clone());
        Ok(key)
    }
}

impl Drop for PasswordKeyProvider {
    fn drop(&mut self) {
        self.password.zeroize();
    }
}

// ============================================================================
// Key Derivation
// ============================================================================

fn validate_kdf_params(password: &str, salt: &[u8], iterations: u32) -> Result<(), CryptoError> {
    if password.is_empty() {
        return Err(CryptoError::WeakKdfParameters("password cannot be empty".to_string()));
    }
    if iterations < MIN_PBKDF2_ITERATIONS {
        return Err(CryptoError::WeakKdfParameters(format!(
            "{} iterations is below the minimum of {}",
            iterations, MIN_PBKDF2_ITERATIONS
        )));
    }
    if salt.len() < MIN_SALT_LEN {
        return Err(CryptoError::WeakKdfParameters(format!(
            "salt must be at least {} bytes, got {}",
            MIN_SALT_LEN,
            salt.len()
        )));
    }
    Ok(())
}

/// Derive a sync key from a password using PBKDF2-HMAC-SHA256
///
/// Rejects (never weakens) parameters below the floor: iterations under
/// [`MIN_PBKDF2_ITERATIONS`], salts shorter than [`MIN_SALT_LEN`], empty passwords.
pub fn derive_key_from_password(
    password: &str,
    salt: &[u8],
    iterations: u32,
) -> Result<SyncKey, CryptoError> {
    validate_kdf_params(password, salt, iterations)?;

    let rounds = NonZeroU32::new(iterations)
        .ok_or_else(|| CryptoError::WeakKdfParameters("zero iterations".to_string()))?;

    let mut out = [0u8; KEY_LEN];
    pbkdf2::derive(
        pbkdf2::PBKDF2_HMAC_SHA256,
        rounds,
        salt,
        password.as_bytes(),
        &mut out,
    );

    let key = SyncKey(out);
    out.zeroize();
    Ok(key)
}

/// Generate a per-user random salt ([`DEFAULT_SALT_LEN`] bytes)
pub fn generate_salt() -> Result<Vec<u8>, CryptoError> {
    let mut salt = vec![0u8; DEFAULT_SALT_LEN];
    fill_random(&mut salt)?;
    Ok(salt)
}

fn fill_random(buf: &mut [u8]) -> Result<(), CryptoError> {
    SystemRandom::new().fill(buf).map_err(|_| CryptoError::Rng)
}

// ============================================================================
// Envelope
// ============================================================================

/// Authenticated ciphertext with its nonce and detached tag
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub ciphertext: Vec<u8>,
    pub nonce: [u8; NONCE_LEN],
    pub tag: [u8; TAG_LEN],
}

/// Encrypt `plaintext` under `key` with a freshly generated nonce
pub fn seal(plaintext: &[u8], key: &SyncKey) -> Result<Envelope, CryptoError> {
    let mut nonce = [0u8; NONCE_LEN];
    fill_random(&mut nonce)?;

    let cipher = XChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    let mut sealed = cipher
        .encrypt(XNonce::from_slice(&nonce), plaintext)
        .map_err(|_| CryptoError::InvalidKey("encryption failed".to_string()))?;

    // aead output is ciphertext || tag
    let split_at = sealed.len() - TAG_LEN;
    let mut tag = [0u8; TAG_LEN];
    tag.copy_from_slice(&sealed[split_at..]);
    sealed.truncate(split_at);

    Ok(Envelope {
        ciphertext: sealed,
        nonce,
        tag,
    })
}

/// Verify and decrypt an envelope
pub fn open(envelope: &Envelope, key: &SyncKey) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));

    let mut combined = Vec::with_capacity(envelope.ciphertext.len() + TAG_LEN);
    combined.extend_from_slice(&envelope.ciphertext);
    combined.extend_from_slice(&envelope.tag);

    cipher
        .decrypt(XNonce::from_slice(&envelope.nonce), combined.as_slice())
        .map_err(|_| CryptoError::AuthenticationFailure)
}

impl Envelope {
    /// Serialize to `base64(ciphertext):base64(nonce):base64(tag)`
    pub fn to_wire(&self) -> String {
        format!(
            "{}{sep}{}{sep}{}",
            encode_base64(&self.ciphertext),
            encode_base64(&self.nonce),
            encode_base64(&self.tag),
            sep = WIRE_SEPARATOR
        )
    }

    /// Parse the wire format; anything but exactly three valid fields is rejected
    pub fn from_wire(wire: &str) -> Result<Self, CryptoError> {
        let fields: Vec<&str> = wire.split(WIRE_SEPARATOR).collect();
        if fields.len() != 3 {
            return Err(CryptoError::MalformedPayload(format!(
                "expected 3 fields, found {}",
                fields.len()
            )));
        }

        let ciphertext = decode_base64(fields[0])?;
        let nonce: [u8; NONCE_LEN] = decode_base64(fields[1])?
            .try_into()
            .map_err(|_| CryptoError::MalformedPayload("nonce must be 24 bytes".to_string()))?;
        let tag: [u8; TAG_LEN] = decode_base64(fields[2])?
            .try_into()
            .map_err(|_| CryptoError::MalformedPayload("tag must be 16 bytes".to_string()))?;

        Ok(Self {
            ciphertext,
            nonce,
            tag,
        })
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_wire())
    }
}

impl FromStr for Envelope {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_wire(s)
    }
}

// ============================================================================
// Payload
// ============================================================================

/// Body of a sync operation: sealed data or a deletion tombstone
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Sealed(Envelope),
    Tombstone,
}

impl Payload {
    pub fn is_tombstone(&self) -> bool {
        matches!(self, Payload::Tombstone)
    }

    pub fn to_wire(&self) -> String {
        match self {
            Payload::Sealed(envelope) => envelope.to_wire(),
            Payload::Tombstone => TOMBSTONE_MARKER.to_string(),
        }
    }

    pub fn from_wire(wire: &str) -> Result<Self, CryptoError> {
        if wire == TOMBSTONE_MARKER {
            return Ok(Payload::Tombstone);
        }
        Envelope::from_wire(wire).map(Payload::Sealed)
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_wire())
    }
}

impl FromStr for Payload {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_wire(s)
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Encode bytes to base64 string (for transmission)
pub fn encode_base64(data: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(data)
}

/// Decode base64 string to bytes
pub fn decode_base64(data: &str) -> Result<Vec<u8>, CryptoError> {
    base64::engine::general_purpose::STANDARD
        .decode(data)
        .map_err(|e| CryptoError::MalformedPayload(format!("base64 decode error: {}", e)))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key(byte: u8) -> SyncKey {
        SyncKey::from_bytes([byte; KEY_LEN])
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let key = SyncKey::generate().unwrap();
        let plaintext = br#"{"title":"groceries","done":false}"#;

        let envelope = seal(plaintext, &key).unwrap();
        assert_eq!(envelope.ciphertext.len(), plaintext.len());
        assert_ne!(envelope.ciphertext.as_slice(), plaintext.as_slice());

        let opened = open(&envelope, &key).unwrap();
        assert_eq!(opened, plaintext);
    }

    #[test]
    fn test_seal_empty_plaintext() {
        let key = test_key(3);
        let envelope = seal(b"", &key).unwrap();
        assert!(envelope.ciphertext.is_empty());
        assert_eq!(open(&envelope, &key).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_nonce_regenerated_per_seal() {
        let key = test_key(42);

        let first = seal(b"same body", &key).unwrap();
        let second = seal(b"same body", &key).unwrap();

        assert_ne!(first.nonce, second.nonce);
        assert_ne!(first.ciphertext, second.ciphertext);
    }

    #[test]
    fn test_open_with_wrong_key_fails() {
        let envelope = seal(b"secret", &test_key(1)).unwrap();
        let result = open(&envelope, &test_key(2));
        assert_eq!(result, Err(CryptoError::AuthenticationFailure));
    }

    #[test]
    fn test_every_flipped_ciphertext_bit_is_detected() {
        let key = test_key(9);
        let envelope = seal(b"tamper evident", &key).unwrap();

        for byte in 0..envelope.ciphertext.len() {
            for bit in 0..8 {
                let mut tampered = envelope.clone();
                tampered.ciphertext[byte] ^= 1 << bit;
                assert_eq!(
                    open(&tampered, &key),
                    Err(CryptoError::AuthenticationFailure),
                    "flip of byte {} bit {} went undetected",
                    byte,
                    bit
                );
            }
        }
    }

    #[test]
    fn test_tampered_tag_and_nonce_fail() {
        let key = test_key(9);
        let envelope = seal(b"payload", &key).unwrap();

        let mut bad_tag = envelope.clone();
        bad_tag.tag[0] ^= 0x01;
        assert_eq!(open(&bad_tag, &key), Err(CryptoError::AuthenticationFailure));

        let mut bad_nonce = envelope;
        bad_nonce.nonce[23] ^= 0x80;
        assert_eq!(open(&bad_nonce, &key), Err(CryptoError::AuthenticationFailure));
    }

    #[test]
    fn test_wire_format_roundtrip() {
        let key = test_key(5);
        let envelope = seal(b"wire", &key).unwrap();

        let wire = envelope.to_wire();
        assert_eq!(wire.split(':').count(), 3);

        let parsed: Envelope = wire.parse().unwrap();
        assert_eq!(parsed, envelope);
        assert_eq!(open(&parsed, &key).unwrap(), b"wire");
    }

    #[test]
    fn test_wire_field_count_enforced() {
        for wire in ["", "abc", "a:b", "YQ==:YQ==:YQ==:YQ=="] {
            assert!(
                matches!(Envelope::from_wire(wire), Err(CryptoError::MalformedPayload(_))),
                "accepted {:?}",
                wire
            );
        }
    }

    #[test]
    fn test_wire_rejects_bad_base64_and_lengths() {
        let envelope = seal(b"x", &test_key(1)).unwrap();
        let nonce = encode_base64(&envelope.nonce);
        let tag = encode_base64(&envelope.tag);

        let bad_base64 = format!("!!!:{}:{}", nonce, tag);
        assert!(matches!(
            Envelope::from_wire(&bad_base64),
            Err(CryptoError::MalformedPayload(_))
        ));

        let short_nonce = format!("{}:{}:{}", encode_base64(b"x"), encode_base64(&[0u8; 12]), tag);
        assert!(matches!(
            Envelope::from_wire(&short_nonce),
            Err(CryptoError::MalformedPayload(_))
        ));

        let short_tag = format!("{}:{}:{}", encode_base64(b"x"), nonce, encode_base64(&[0u8; 4]));
        assert!(matches!(
            Envelope::from_wire(&short_tag),
            Err(CryptoError::MalformedPayload(_))
        ));
    }

    #[test]
    fn test_tombstone_payload() {
        let payload = Payload::from_wire(TOMBSTONE_MARKER).unwrap();
        assert!(payload.is_tombstone());
        assert_eq!(payload.to_wire(), "deleted:nonce:authTag");

        let sealed = Payload::Sealed(seal(b"body", &test_key(1)).unwrap());
        let reparsed: Payload = sealed.to_string().parse().unwrap();
        assert_eq!(reparsed, sealed);
    }

    #[test]
    fn test_key_derivation_deterministic() {
        let salt = [7u8; 16];
        let key1 = derive_key_from_password("correct horse", &salt, MIN_PBKDF2_ITERATIONS).unwrap();
        let key2 = derive_key_from_password("correct horse", &salt, MIN_PBKDF2_ITERATIONS).unwrap();
        assert_eq!(key1.as_bytes(), key2.as_bytes());

        let other_salt = [8u8; 16];
        let key3 =
            derive_key_from_password("correct horse", &other_salt, MIN_PBKDF2_ITERATIONS).unwrap();
        assert_ne!(key1.as_bytes(), key3.as_bytes());
    }

    #[test]
    fn test_kdf_floor_enforced() {
        let salt = generate_salt().unwrap();

        let low = derive_key_from_password("pw", &salt, MIN_PBKDF2_ITERATIONS - 1);
        assert!(matches!(low, Err(CryptoError::WeakKdfParameters(_))));

        let short_salt = derive_key_from_password("pw", &[1u8; 7], DEFAULT_PBKDF2_ITERATIONS);
        assert!(matches!(short_salt, Err(CryptoError::WeakKdfParameters(_))));

        let empty = derive_key_from_password("", &salt, DEFAULT_PBKDF2_ITERATIONS);
        assert!(matches!(empty, Err(CryptoError::WeakKdfParameters(_))));
    }

    #[test]
    fn test_random_salt_generation() {
        let salt1 = generate_salt().unwrap();
        let salt2 = generate_salt().unwrap();
        assert_eq!(salt1.len(), DEFAULT_SALT_LEN);
        assert_ne!(salt1, salt2);
    }

    #[test]
    fn test_password_key_provider_caches_key() {
        let provider =
            PasswordKeyProvider::new("hunter2".to_string(), vec![1u8; 16], MIN_PBKDF2_ITERATIONS)
                .unwrap();

        let first = provider.sync_key("user-1").unwrap();
        let second = provider.sync_key("user-1").unwrap();
        assert_eq!(first.as_bytes(), second.as_bytes());

        let weak = PasswordKeyProvider::new("hunter2".to_string(), vec![1u8; 16], 1_000);
        assert!(weak.is_err());
    }

    #[test]
    fn test_key_from_slice_length_checked() {
        assert!(SyncKey::from_slice(&[0u8; 31]).is_err());
        assert!(SyncKey::from_slice(&[0u8; 32]).is_ok());
        assert_eq!(format!("{:?}", test_key(1)), "SyncKey(..)");
    }
}
