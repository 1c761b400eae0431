//! Onion Router Cryptography
//!
//! Implements the primitives every hop of a circuit relies on:
//! - AES-256-CBC (PKCS#7) for relay cell payloads
//! - Hybrid encryption: a fresh AES key/IV protects the payload, and the
//!   `key:iv` pair is wrapped for the relay's long-term X25519 key
//!   (ephemeral X25519 + HKDF-SHA256 + AES-256-GCM)
//! - X25519 Diffie-Hellman for the per-hop circuit key
//! - SHA3-256 key confirmation over `sharedSecret || "handshake"`
//!
//! Security: All symmetric key material is zeroized on drop.

use crate::error::{OnionError, Result};
use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use sha3::{Digest, Sha3_256};
use subtle::ConstantTimeEq;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// AES-256-CBC cipher types
type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Symmetric key length (AES-256)
pub const KEY_LEN: usize = 32;

/// CBC initialisation vector length
pub const IV_LEN: usize = 16;

/// X25519 public value length
pub const PUBLIC_KEY_LEN: usize = 32;

/// Key confirmation hash length (SHA3-256)
pub const CONFIRMATION_LEN: usize = 32;

/// AES-GCM nonce length used by the key wrap
const WRAP_NONCE_LEN: usize = 12;

/// HKDF info string binding wrap keys to this protocol
const WRAP_INFO: &[u8] = b"onion-router:hybrid-key-wrap:v1";

/// Suffix hashed after the shared secret for key confirmation
const HANDSHAKE_LABEL: &[u8] = b"handshake";

/// Separator between key and IV inside the wrapped blob
const KEY_IV_SEPARATOR: char = ':';

/// Initialisation vector for AES-CBC
pub type Iv = [u8; IV_LEN];

/// A 256-bit AES key
///
/// Used both for per-circuit keys (the ECDH shared secret) and for the
/// one-shot keys of hybrid encryption.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey([u8; KEY_LEN]);

impl SymmetricKey {
    /// Wrap raw key bytes
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Build a key from a slice, failing if the length is wrong
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let raw: [u8; KEY_LEN] = bytes.try_into().map_err(|_| {
            OnionError::Crypto(format!("key must be {} bytes, got {}", KEY_LEN, bytes.len()))
        })?;
        Ok(Self(raw))
    }

    /// Generate a fresh random key
    pub fn generate() -> Self {
        let mut raw = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut raw);
        Self(raw)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SymmetricKey(<redacted>)")
    }
}

/// Generate a random IV
pub fn random_iv() -> Iv {
    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);
    iv
}

/// Encrypt a message with AES-256-CBC and PKCS#7 padding
pub fn encrypt_symmetric(message: &[u8], key: &SymmetricKey, iv: &Iv) -> Vec<u8> {
    Aes256CbcEnc::new(key.as_bytes().into(), iv.into()).encrypt_padded_vec_mut::<Pkcs7>(message)
}

/// Decrypt an AES-256-CBC ciphertext produced by [`encrypt_symmetric`]
///
/// Fails on a length that is not a whole number of blocks or on bad padding,
/// which is what a wrong key or IV almost always produces.
pub fn decrypt_cbc(ciphertext: &[u8], key: &SymmetricKey, iv: &Iv) -> Result<Vec<u8>> {
    Aes256CbcDec::new(key.as_bytes().into(), iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| OnionError::Crypto("AES-CBC decryption failed (bad padding)".into()))
}

/// Long-term relay identity
///
/// The public half is distributed in the router pool file; the secret half
/// unwraps the symmetric key of every Create cell sent to this relay.
/// Note: StaticSecret from x25519-dalek already zeroizes on drop.
#[derive(Clone)]
pub struct IdentityKeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl IdentityKeyPair {
    /// Generate a new identity
    pub fn generate() -> Self {
        Self::from_secret(StaticSecret::random_from_rng(OsRng))
    }

    fn from_secret(secret: StaticSecret) -> Self {
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Load an identity from its base64-encoded secret
    pub fn from_secret_b64(encoded: &str) -> Result<Self> {
        let raw = Zeroizing::new(
            STANDARD
                .decode(encoded.trim())
                .map_err(|e| OnionError::Config(format!("Invalid private key encoding: {}", e)))?,
        );
        let bytes: [u8; KEY_LEN] = raw.as_slice().try_into().map_err(|_| {
            OnionError::Config(format!("Private key must be {} bytes", KEY_LEN))
        })?;
        Ok(Self::from_secret(StaticSecret::from(bytes)))
    }

    /// Base64 encoding of the secret, for the relay config file
    pub fn secret_b64(&self) -> String {
        let bytes = Zeroizing::new(self.secret.to_bytes());
        STANDARD.encode(bytes.as_slice())
    }

    /// Base64 encoding of the public key, for the router pool file
    pub fn public_b64(&self) -> String {
        STANDARD.encode(self.public.as_bytes())
    }

    pub fn public(&self) -> &PublicKey {
        &self.public
    }

    pub(crate) fn secret(&self) -> &StaticSecret {
        &self.secret
    }
}

/// Parse a base64 X25519 public key (router pool entries)
pub fn parse_public_key(encoded: &str) -> Result<PublicKey> {
    let raw = STANDARD
        .decode(encoded.trim())
        .map_err(|e| OnionError::Config(format!("Invalid public key encoding: {}", e)))?;
    public_from_slice(&raw)
}

fn public_from_slice(raw: &[u8]) -> Result<PublicKey> {
    let bytes: [u8; PUBLIC_KEY_LEN] = raw.try_into().map_err(|_| {
        OnionError::Crypto(format!(
            "public value must be {} bytes, got {}",
            PUBLIC_KEY_LEN,
            raw.len()
        ))
    })?;
    Ok(PublicKey::from(bytes))
}

/// Short hex fingerprint of a public value, safe to log
pub fn fingerprint(public: &[u8]) -> String {
    hex::encode(&public[..8.min(public.len())])
}

/// Output of hybrid encryption: the wrapped `key:iv` blob and the payload
#[derive(Debug, Clone)]
pub struct HybridCiphertext {
    pub wrapped_key: Vec<u8>,
    pub ciphertext: Vec<u8>,
}

/// Hybrid-encrypt `payload` for the holder of `recipient`'s secret key
///
/// Steps:
/// 1. Fresh AES key + IV, AES-CBC encrypt the payload
/// 2. Wrap `base64(key):base64(iv)` for the recipient's long-term key
pub fn hybrid_encrypt(payload: &[u8], recipient: &PublicKey) -> Result<HybridCiphertext> {
    let key = SymmetricKey::generate();
    let iv = random_iv();
    let ciphertext = encrypt_symmetric(payload, &key, &iv);

    let key_iv = Zeroizing::new(format!(
        "{}{}{}",
        STANDARD.encode(key.as_bytes()),
        KEY_IV_SEPARATOR,
        STANDARD.encode(iv)
    ));
    let wrapped_key = wrap_key(key_iv.as_bytes(), recipient)?;

    Ok(HybridCiphertext {
        wrapped_key,
        ciphertext,
    })
}

/// Reverse of [`hybrid_encrypt`] on the relay side
///
/// Returns `None` on any cryptographic or parsing error; the caller treats
/// that as a failed handshake rather than an exceptional condition.
pub fn decrypt_hybrid(
    wrapped_key: &[u8],
    ciphertext: &[u8],
    identity: &IdentityKeyPair,
) -> Option<Vec<u8>> {
    match try_decrypt_hybrid(wrapped_key, ciphertext, identity) {
        Ok(plaintext) => Some(plaintext),
        Err(e) => {
            log::warn!("Hybrid decryption failed: {}", e);
            None
        }
    }
}

fn try_decrypt_hybrid(
    wrapped_key: &[u8],
    ciphertext: &[u8],
    identity: &IdentityKeyPair,
) -> Result<Vec<u8>> {
    let key_iv = Zeroizing::new(unwrap_key(wrapped_key, identity.secret())?);
    let key_iv = std::str::from_utf8(&key_iv)
        .map_err(|_| OnionError::Crypto("wrapped key is not UTF-8".into()))?;

    let (key_b64, iv_b64) = key_iv
        .split_once(KEY_IV_SEPARATOR)
        .ok_or_else(|| OnionError::Crypto("wrapped key has no key:iv separator".into()))?;

    let key_raw = Zeroizing::new(
        STANDARD
            .decode(key_b64)
            .map_err(|e| OnionError::Crypto(format!("bad key encoding: {}", e)))?,
    );
    let key = SymmetricKey::from_slice(&key_raw)?;
    let iv: Iv = STANDARD
        .decode(iv_b64)
        .map_err(|e| OnionError::Crypto(format!("bad IV encoding: {}", e)))?
        .try_into()
        .map_err(|_| OnionError::Crypto("IV has wrong length".into()))?;

    decrypt_cbc(ciphertext, &key, &iv)
}

/// Derive the AES-GCM wrap key from an X25519 agreement
fn wrap_cipher(shared: &[u8; KEY_LEN], ephemeral: &PublicKey, recipient: &PublicKey) -> Result<Aes256Gcm> {
    // salt = ephemeral public || recipient public
    let mut salt = [0u8; 2 * PUBLIC_KEY_LEN];
    salt[..PUBLIC_KEY_LEN].copy_from_slice(ephemeral.as_bytes());
    salt[PUBLIC_KEY_LEN..].copy_from_slice(recipient.as_bytes());

    let hkdf = Hkdf::<Sha256>::new(Some(&salt), shared);
    let mut okm = Zeroizing::new([0u8; KEY_LEN]);
    hkdf.expand(WRAP_INFO, &mut okm[..])
        .map_err(|_| OnionError::Crypto("Key wrap derivation failed".into()))?;

    Aes256Gcm::new_from_slice(&okm[..])
        .map_err(|_| OnionError::Crypto("Invalid key wrap length".into()))
}

/// Wrap a secret for `recipient`
///
/// Blob layout: ephemeral public (32) | nonce (12) | AES-GCM ciphertext
fn wrap_key(secret: &[u8], recipient: &PublicKey) -> Result<Vec<u8>> {
    let ephemeral = StaticSecret::random_from_rng(OsRng);
    let ephemeral_public = PublicKey::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(recipient);
    if !shared.was_contributory() {
        return Err(OnionError::Crypto("Recipient public key is a low-order point".into()));
    }

    let cipher = wrap_cipher(shared.as_bytes(), &ephemeral_public, recipient)?;
    let mut nonce = [0u8; WRAP_NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    let sealed = cipher
        .encrypt(Nonce::from_slice(&nonce), secret)
        .map_err(|_| OnionError::Crypto("Key wrap encryption failed".into()))?;

    let mut blob = Vec::with_capacity(PUBLIC_KEY_LEN + WRAP_NONCE_LEN + sealed.len());
    blob.extend_from_slice(ephemeral_public.as_bytes());
    blob.extend_from_slice(&nonce);
    blob.extend_from_slice(&sealed);
    Ok(blob)
}

fn unwrap_key(blob: &[u8], secret: &StaticSecret) -> Result<Vec<u8>> {
    if blob.len() <= PUBLIC_KEY_LEN + WRAP_NONCE_LEN {
        return Err(OnionError::Crypto(format!(
            "wrapped key too short: {} bytes",
            blob.len()
        )));
    }
    let (ephemeral_raw, rest) = blob.split_at(PUBLIC_KEY_LEN);
    let (nonce, sealed) = rest.split_at(WRAP_NONCE_LEN);

    let ephemeral = public_from_slice(ephemeral_raw)?;
    let shared = secret.diffie_hellman(&ephemeral);
    if !shared.was_contributory() {
        return Err(OnionError::Crypto("Wrap ephemeral key is a low-order point".into()));
    }

    let recipient = PublicKey::from(secret);
    let cipher = wrap_cipher(shared.as_bytes(), &ephemeral, &recipient)?;
    cipher
        .decrypt(Nonce::from_slice(nonce), sealed)
        .map_err(|_| OnionError::Crypto("Key unwrap failed (authentication)".into()))
}

/// Compute `SHA3-256(sharedSecret || "handshake")`
pub fn confirmation_hash(shared: &SymmetricKey) -> [u8; CONFIRMATION_LEN] {
    let mut hasher = Sha3_256::new();
    hasher.update(shared.as_bytes());
    hasher.update(HANDSHAKE_LABEL);
    hasher.finalize().into()
}

/// Check a received confirmation hash in constant time
pub fn verify_confirmation(shared: &SymmetricKey, k_hash: &[u8]) -> bool {
    let expected = confirmation_hash(shared);
    expected.as_slice().ct_eq(k_hash).into()
}

fn agree(secret: &StaticSecret, peer_public: &[u8]) -> Result<SymmetricKey> {
    let peer = public_from_slice(peer_public)?;
    let shared = secret.diffie_hellman(&peer);
    if !shared.was_contributory() {
        return Err(OnionError::HandshakeFailed(
            "peer public value is a low-order point".into(),
        ));
    }
    Ok(SymmetricKey::from_bytes(*shared.as_bytes()))
}

/// Initiator (client) side of the per-hop ECDH handshake
///
/// Holds the ephemeral secret until the hop's Created cell arrives.
pub struct HandshakeInitiator {
    secret: StaticSecret,
    public: PublicKey,
}

impl HandshakeInitiator {
    pub fn new() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        log::trace!("Generated handshake key {}", fingerprint(public.as_bytes()));
        Self { secret, public }
    }

    /// `gX`, the value sent (hybrid-encrypted) in the Create cell
    pub fn public_bytes(&self) -> [u8; PUBLIC_KEY_LEN] {
        *self.public.as_bytes()
    }

    /// Combine our secret with the responder's `gY`
    pub fn derive(&self, g_y: &[u8]) -> Result<SymmetricKey> {
        agree(&self.secret, g_y)
    }
}

impl Default for HandshakeInitiator {
    fn default() -> Self {
        Self::new()
    }
}

/// Responder (relay) side result of the handshake
pub struct HandshakeReply {
    /// `gY`, returned in the Created cell
    pub g_y: [u8; PUBLIC_KEY_LEN],
    /// Shared secret, stored as the circuit key
    pub shared: SymmetricKey,
    /// `H(K || "handshake")`
    pub k_hash: [u8; CONFIRMATION_LEN],
}

/// Run the responder side of the handshake against the initiator's `gX`
pub fn respond(g_x: &[u8]) -> Result<HandshakeReply> {
    let secret = StaticSecret::random_from_rng(OsRng);
    let g_y = *PublicKey::from(&secret).as_bytes();
    let shared = agree(&secret, g_x)?;
    let k_hash = confirmation_hash(&shared);
    Ok(HandshakeReply { g_y, shared, k_hash })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symmetric_round_trip() {
        let key = SymmetricKey::generate();
        let iv = random_iv();
        for message in [&b""[..], b"a", b"exactly sixteen!", b"{\"type\":\"DATA\",\"child\":{}}"] {
            let ciphertext = encrypt_symmetric(message, &key, &iv);
            assert_eq!(ciphertext.len() % 16, 0);
            assert_eq!(decrypt_cbc(&ciphertext, &key, &iv).unwrap(), message);
        }
    }

    #[test]
    fn test_wrong_key_fails_or_garbles() {
        let key = SymmetricKey::generate();
        let other = SymmetricKey::generate();
        let iv = random_iv();
        let ciphertext = encrypt_symmetric(b"secret relay payload", &key, &iv);

        match decrypt_cbc(&ciphertext, &other, &iv) {
            Ok(garbled) => assert_ne!(garbled, b"secret relay payload"),
            Err(e) => assert!(matches!(e, OnionError::Crypto(_))),
        }
    }

    #[test]
    fn test_truncated_ciphertext_rejected() {
        let key = SymmetricKey::generate();
        let iv = random_iv();
        let ciphertext = encrypt_symmetric(b"some bytes", &key, &iv);
        assert!(decrypt_cbc(&ciphertext[..7], &key, &iv).is_err());
    }

    #[test]
    fn test_hybrid_round_trip() {
        let relay = IdentityKeyPair::generate();
        let payload = HandshakeInitiator::new().public_bytes();

        let sealed = hybrid_encrypt(&payload, relay.public()).unwrap();
        let opened = decrypt_hybrid(&sealed.wrapped_key, &sealed.ciphertext, &relay);
        assert_eq!(opened.as_deref(), Some(&payload[..]));
    }

    #[test]
    fn test_hybrid_wrong_recipient_is_none() {
        let relay = IdentityKeyPair::generate();
        let stranger = IdentityKeyPair::generate();
        let sealed = hybrid_encrypt(b"gX bytes", relay.public()).unwrap();
        assert!(decrypt_hybrid(&sealed.wrapped_key, &sealed.ciphertext, &stranger).is_none());
    }

    #[test]
    fn test_hybrid_corrupted_inputs_are_none() {
        let relay = IdentityKeyPair::generate();
        let sealed = hybrid_encrypt(b"gX bytes", relay.public()).unwrap();

        let mut bad_wrap = sealed.wrapped_key.clone();
        let last = bad_wrap.len() - 1;
        bad_wrap[last] ^= 0x01;
        assert!(decrypt_hybrid(&bad_wrap, &sealed.ciphertext, &relay).is_none());

        assert!(decrypt_hybrid(&[], &sealed.ciphertext, &relay).is_none());
        assert!(decrypt_hybrid(&sealed.wrapped_key, &[1, 2, 3], &relay).is_none());
    }

    #[test]
    fn test_handshake_agreement() {
        let initiator = HandshakeInitiator::new();
        let reply = respond(&initiator.public_bytes()).unwrap();
        let client_key = initiator.derive(&reply.g_y).unwrap();

        assert_eq!(client_key, reply.shared);
        assert_eq!(confirmation_hash(&client_key), reply.k_hash);
        assert!(verify_confirmation(&client_key, &reply.k_hash));
        assert!(!verify_confirmation(&client_key, &[0u8; CONFIRMATION_LEN]));
        assert!(!verify_confirmation(&client_key, &[]));
    }

    #[test]
    fn test_low_order_point_rejected() {
        let initiator = HandshakeInitiator::new();
        assert!(initiator.derive(&[0u8; PUBLIC_KEY_LEN]).is_err());
        assert!(respond(&[0u8; PUBLIC_KEY_LEN]).is_err());
        assert!(respond(&[1u8; 5]).is_err());
    }

    #[test]
    fn test_identity_encoding_round_trip() {
        let identity = IdentityKeyPair::generate();
        let restored = IdentityKeyPair::from_secret_b64(&identity.secret_b64()).unwrap();
        assert_eq!(restored.public_b64(), identity.public_b64());
        assert_eq!(parse_public_key(&identity.public_b64()).unwrap(), *identity.public());
        assert!(IdentityKeyPair::from_secret_b64("not base64!").is_err());
    }

    #[test]
    fn test_debug_redacts_key() {
        let key = SymmetricKey::from_bytes([0xAB; KEY_LEN]);
        assert!(!format!("{:?}", key).contains("ab"));
    }
}
