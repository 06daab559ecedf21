//! The "TRUST" layer - per-identity encryption and signatures.
//!
//! Every participant owns exactly one `SecurityToolBox`:
//! - Ed25519 keypair for signing (provenance of published records)
//! - The same identity mapped to X25519 for authenticated public-key
//!   encryption (static Diffie-Hellman + XChaCha20-Poly1305)
//!
//! Key derivation: Ed25519 → X25519 via the Edwards→Montgomery map,
//! so a single public key both verifies signatures and receives
//! encrypted fields.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use curve25519_dalek::edwards::CompressedEdwardsY;
use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256, Sha512};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret as X25519Secret};

use crate::error::TraceError;

/// HKDF info string for domain separation.
const HKDF_INFO: &[u8] = b"ledgertrace-box-xchacha20poly1305-v1";

/// XChaCha20 extended nonce length.
const NONCE_LEN: usize = 24;

/// A participant's public identity (Ed25519 verifying key bytes).
///
/// Travels in cleartext next to every record as routing metadata.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parses a 64-char hex public key.
    pub fn from_hex(value: &str) -> Result<Self, TraceError> {
        let bytes = hex::decode(value)
            .map_err(|e| TraceError::Identity(format!("public key is not hex: {}", e)))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| TraceError::Identity("public key must be 32 bytes".to_string()))?;
        Ok(Self(arr))
    }
}

impl std::fmt::Display for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.to_hex()[..16])
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({})", self)
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        PublicKey::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Authenticated ciphertext: encrypted `data` plus the nonce used.
///
/// Both fields are kept as raw byte vectors so that a malformed record
/// still decodes; length checks happen at decrypt/verify time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ciphertext {
    #[serde(with = "hex_bytes")]
    pub data: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub nonce: Vec<u8>,
}

/// Detached Ed25519 signature over a ciphertext's `data`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature(#[serde(with = "hex_bytes")] pub Vec<u8>);

/// Per-identity cryptographic toolbox.
///
/// Keys live only in memory for the lifetime of the participant.
#[derive(Clone)]
pub struct SecurityToolBox {
    signing_key: SigningKey,
    exchange_secret: X25519Secret,
    public_key: PublicKey,
}

impl SecurityToolBox {
    /// Generates a fresh identity from OS entropy.
    pub fn new() -> Self {
        Self::from_signing_key(SigningKey::generate(&mut OsRng))
    }

    /// Re-derives an identity from a 64-char hex secret key.
    ///
    /// Fails with `TraceError::Identity` if the key material is malformed.
    pub fn from_secret_key(secret_key: &str) -> Result<Self, TraceError> {
        let bytes = hex::decode(secret_key.trim())
            .map_err(|e| TraceError::Identity(format!("secret key is not hex: {}", e)))?;
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|_| TraceError::Identity("secret key must be 32 bytes".to_string()))?;
        Ok(Self::from_signing_key(SigningKey::from_bytes(&seed)))
    }

    /// Wraps an existing signing key (e.g. one derived by a `TraceContext`).
    pub fn from_signing_key(signing_key: SigningKey) -> Self {
        let exchange_secret = X25519Secret::from(ed25519_to_x25519_secret(&signing_key.to_bytes()));
        let public_key = PublicKey(signing_key.verifying_key().to_bytes());
        Self {
            signing_key,
            exchange_secret,
            public_key,
        }
    }

    /// The identity's public key.
    pub fn public_key(&self) -> PublicKey {
        self.public_key
    }

    /// Exports the secret key as hex (for configuration of fixed authorities).
    pub fn secret_key_hex(&self) -> String {
        hex::encode(self.signing_key.to_bytes())
    }

    /// Encrypts `message` so that only `receiver` can read it.
    ///
    /// A fresh random nonce is drawn for every call.
    pub fn encrypt(&self, message: &[u8], receiver: &PublicKey) -> Result<Ciphertext, TraceError> {
        let cipher = self.cipher_for(&self.public_key, receiver, TraceError::Encryption)?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = XNonce::from(nonce_bytes);

        let data = cipher
            .encrypt(&nonce, message)
            .map_err(|e| TraceError::Encryption(format!("aead failure: {}", e)))?;

        Ok(Ciphertext {
            data,
            nonce: nonce_bytes.to_vec(),
        })
    }

    /// Decrypts a ciphertext produced by `sender` for this identity.
    ///
    /// Fails on MAC or nonce mismatch and when the keypair is wrong.
    pub fn decrypt(&self, ciphertext: &Ciphertext, sender: &PublicKey) -> Result<Vec<u8>, TraceError> {
        let cipher = self.cipher_for(sender, &self.public_key, TraceError::Decryption)?;

        let nonce_bytes: [u8; NONCE_LEN] = ciphertext
            .nonce
            .as_slice()
            .try_into()
            .map_err(|_| TraceError::Decryption(format!("nonce must be {} bytes", NONCE_LEN)))?;

        cipher
            .decrypt(&XNonce::from(nonce_bytes), ciphertext.data.as_ref())
            .map_err(|_| TraceError::Decryption("authentication error".to_string()))
    }

    /// Signs the `data` field of a ciphertext.
    pub fn sign(&self, ciphertext: &Ciphertext) -> Signature {
        Signature(self.signing_key.sign(&ciphertext.data).to_bytes().to_vec())
    }

    /// Checks that `signature` over `ciphertext.data` was made by `sender`.
    ///
    /// Never fails: malformed keys or signatures simply yield `false`.
    pub fn verify(ciphertext: &Ciphertext, signature: &Signature, sender: &PublicKey) -> bool {
        let Ok(key) = VerifyingKey::from_bytes(sender.as_bytes()) else {
            return false;
        };
        let Ok(sig) = ed25519_dalek::Signature::from_slice(&signature.0) else {
            return false;
        };
        key.verify_strict(&ciphertext.data, &sig).is_ok()
    }

    /// Builds the AEAD cipher shared by `sender` and `receiver`.
    ///
    /// One side of the pair is always this identity; the DH output is the
    /// same from both ends and both public keys are bound into the salt.
    fn cipher_for(
        &self,
        sender: &PublicKey,
        receiver: &PublicKey,
        fail: fn(String) -> TraceError,
    ) -> Result<XChaCha20Poly1305, TraceError> {
        let peer = if sender == &self.public_key { receiver } else { sender };
        let peer_x25519 = X25519PublicKey::from(ed25519_to_x25519_public(peer.as_bytes()).map_err(&fail)?);
        let shared = self.exchange_secret.diffie_hellman(&peer_x25519);

        let mut salt = [0u8; 64];
        salt[..32].copy_from_slice(sender.as_bytes());
        salt[32..].copy_from_slice(receiver.as_bytes());

        let hkdf = Hkdf::<Sha256>::new(Some(&salt), shared.as_bytes());
        let mut key = [0u8; 32];
        hkdf.expand(HKDF_INFO, &mut key)
            .map_err(|e| fail(format!("key derivation failed: {}", e)))?;
        Ok(XChaCha20Poly1305::new(&key.into()))
    }
}

impl Default for SecurityToolBox {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SecurityToolBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityToolBox")
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

/// SHA-256 digest, hex encoded.
pub fn content_digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Convert an Ed25519 public key to an X25519 public key.
fn ed25519_to_x25519_public(ed25519_pk: &[u8; 32]) -> Result<[u8; 32], String> {
    let edwards = CompressedEdwardsY(*ed25519_pk)
        .decompress()
        .ok_or_else(|| "invalid public key: decompression failed".to_string())?;
    Ok(edwards.to_montgomery().to_bytes())
}

/// Convert an Ed25519 secret seed to an X25519 secret (SHA-512, clamp).
fn ed25519_to_x25519_secret(ed25519_seed: &[u8; 32]) -> [u8; 32] {
    let hash = Sha512::digest(ed25519_seed);
    let mut secret = [0u8; 32];
    secret.copy_from_slice(&hash[..32]);
    secret[0] &= 248;
    secret[31] &= 127;
    secret[31] |= 64;
    secret
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<T, S>(bytes: T, serializer: S) -> Result<S::Ok, S::Error>
    where
        T: AsRef<[u8]>,
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes.as_ref()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let alice = SecurityToolBox::new();
        let bob = SecurityToolBox::new();

        let ct = alice.encrypt(b"x=12.5;y=40.0", &bob.public_key()).unwrap();
        let pt = bob.decrypt(&ct, &alice.public_key()).unwrap();

        assert_eq!(pt, b"x=12.5;y=40.0");
    }

    #[test]
    fn test_encrypt_to_self() {
        let alice = SecurityToolBox::new();
        let ct = alice.encrypt(b"checksum", &alice.public_key()).unwrap();
        assert_eq!(alice.decrypt(&ct, &alice.public_key()).unwrap(), b"checksum");
    }

    #[test]
    fn test_wrong_receiver_cannot_decrypt() {
        let alice = SecurityToolBox::new();
        let bob = SecurityToolBox::new();
        let eve = SecurityToolBox::new();

        let ct = alice.encrypt(b"secret", &bob.public_key()).unwrap();
        let result = eve.decrypt(&ct, &alice.public_key());
        assert!(matches!(result, Err(TraceError::Decryption(_))));
    }

    #[test]
    fn test_wrong_sender_key_fails() {
        let alice = SecurityToolBox::new();
        let bob = SecurityToolBox::new();
        let eve = SecurityToolBox::new();

        let ct = alice.encrypt(b"secret", &bob.public_key()).unwrap();
        assert!(bob.decrypt(&ct, &eve.public_key()).is_err());
    }

    #[test]
    fn test_tampered_nonce_fails() {
        let alice = SecurityToolBox::new();
        let bob = SecurityToolBox::new();

        let mut ct = alice.encrypt(b"secret", &bob.public_key()).unwrap();
        ct.nonce[0] ^= 0xFF;
        assert!(bob.decrypt(&ct, &alice.public_key()).is_err());

        ct.nonce.truncate(10);
        assert!(bob.decrypt(&ct, &alice.public_key()).is_err());
    }

    #[test]
    fn test_fresh_nonce_per_call() {
        let alice = SecurityToolBox::new();
        let bob = SecurityToolBox::new();

        let c1 = alice.encrypt(b"same", &bob.public_key()).unwrap();
        let c2 = alice.encrypt(b"same", &bob.public_key()).unwrap();

        assert_ne!(c1.nonce, c2.nonce);
        assert_ne!(c1.data, c2.data);
    }

    #[test]
    fn test_sign_verify() {
        let alice = SecurityToolBox::new();
        let carol = SecurityToolBox::new();
        let ct = alice.encrypt(b"checksum", &alice.public_key()).unwrap();
        let sig = alice.sign(&ct);

        assert!(SecurityToolBox::verify(&ct, &sig, &alice.public_key()));
        assert!(!SecurityToolBox::verify(&ct, &sig, &carol.public_key()));
    }

    #[test]
    fn test_flipped_byte_fails_verification() {
        let alice = SecurityToolBox::new();
        let mut ct = alice.encrypt(b"checksum", &alice.public_key()).unwrap();
        let sig = alice.sign(&ct);

        ct.data[0] ^= 0x01;
        assert!(!SecurityToolBox::verify(&ct, &sig, &alice.public_key()));
    }

    #[test]
    fn test_verify_never_panics_on_garbage() {
        let alice = SecurityToolBox::new();
        let ct = Ciphertext { data: vec![], nonce: vec![] };

        assert!(!SecurityToolBox::verify(&ct, &Signature(vec![1, 2, 3]), &alice.public_key()));
        assert!(!SecurityToolBox::verify(&ct, &Signature(vec![0; 64]), &PublicKey::from_bytes([0xFF; 32])));
    }

    #[test]
    fn test_from_secret_key_is_deterministic() {
        let original = SecurityToolBox::new();
        let restored = SecurityToolBox::from_secret_key(&original.secret_key_hex()).unwrap();

        assert_eq!(original.public_key(), restored.public_key());

        let ct = original.encrypt(b"hello", &original.public_key()).unwrap();
        assert_eq!(restored.decrypt(&ct, &original.public_key()).unwrap(), b"hello");
    }

    #[test]
    fn test_malformed_secret_key() {
        assert!(matches!(
            SecurityToolBox::from_secret_key("not-hex"),
            Err(TraceError::Identity(_))
        ));
        assert!(matches!(
            SecurityToolBox::from_secret_key("abcd"),
            Err(TraceError::Identity(_))
        ));
    }

    #[test]
    fn test_public_key_serde_roundtrip() {
        let key = SecurityToolBox::new().public_key();
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, format!("\"{}\"", key.to_hex()));
        let back: PublicKey = serde_json::from_str(&json).unwrap();
        assert_eq!(key, back);

        assert!(serde_json::from_str::<PublicKey>("\"zz\"").is_err());
    }

    #[test]
    fn test_content_digest_stable() {
        assert_eq!(content_digest(b"abc"), content_digest(b"abc"));
        assert_ne!(content_digest(b"abc"), content_digest(b"abd"));
        assert_eq!(content_digest(b"").len(), 64);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_roundtrip(plaintext in proptest::collection::vec(any::<u8>(), 0..256),
                          a in any::<[u8; 32]>(), b in any::<[u8; 32]>()) {
            let alice = SecurityToolBox::from_signing_key(SigningKey::from_bytes(&a));
            let bob = SecurityToolBox::from_signing_key(SigningKey::from_bytes(&b));

            let ct = alice.encrypt(&plaintext, &bob.public_key()).unwrap();
            prop_assert_eq!(bob.decrypt(&ct, &alice.public_key()).unwrap(), plaintext);
        }

        #[test]
        fn prop_signature_binds_author(message in proptest::collection::vec(any::<u8>(), 1..128),
                                       a in any::<[u8; 32]>(), c in any::<[u8; 32]>()) {
            prop_assume!(a != c);
            let alice = SecurityToolBox::from_signing_key(SigningKey::from_bytes(&a));
            let carol = SecurityToolBox::from_signing_key(SigningKey::from_bytes(&c));

            let ct = Ciphertext { data: message, nonce: vec![0; NONCE_LEN] };
            let sig = alice.sign(&ct);
            prop_assert!(SecurityToolBox::verify(&ct, &sig, &alice.public_key()));
            prop_assert!(!SecurityToolBox::verify(&ct, &sig, &carol.public_key()));
        }
    }
}
