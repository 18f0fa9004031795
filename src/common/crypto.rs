//! Mesh cryptography
//!
//! X25519 for the per-connection key exchange, Ed25519 for admission
//! approvals and AES-256-GCM for sealing mesh frames once a peer is admitted.
//! Frame nonces are random since both directions share one key.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;
use x25519_dalek::{EphemeralSecret, PublicKey};

/// Size of the nonce (96 bits for AES-GCM)
pub const NONCE_SIZE: usize = 12;

const PUBLIC_KEY_SIZE: usize = 32;
const MESH_KEY_INFO: &[u8] = b"nestri-mesh-frame-key";

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Invalid public key length: {0}")]
    InvalidPublicKey(usize),

    #[error("Invalid signing key")]
    InvalidSigningKey,

    #[error("Key derivation failed")]
    KeyDerivation,

    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Decryption failed")]
    DecryptionFailed,
}

/// Ephemeral key pair for one mesh handshake
pub struct KeyPair {
    secret: EphemeralSecret,
    public: PublicKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.public.to_bytes()
    }

    /// Consume the secret and derive the shared secret with a peer
    pub fn derive_shared_secret(self, peer_public: &[u8; 32]) -> [u8; 32] {
        let peer_key = PublicKey::from(*peer_public);
        self.secret.diffie_hellman(&peer_key).to_bytes()
    }
}

/// Parse a public key received over the wire
pub fn parse_public_key(bytes: &[u8]) -> Result<[u8; 32], CryptoError> {
    <[u8; PUBLIC_KEY_SIZE]>::try_from(bytes).map_err(|_| CryptoError::InvalidPublicKey(bytes.len()))
}

/// Long-term signing identity of this relay, used to approve candidates
pub struct RelayIdentity {
    signing_key: SigningKey,
}

impl RelayIdentity {
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn verifying_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Sign `sha256(candidate)` as an admission approval
    pub fn sign_approval(&self, candidate: &Uuid) -> Vec<u8> {
        self.signing_key
            .sign(&approval_digest(candidate))
            .to_bytes()
            .to_vec()
    }
}

/// Digest an approval signature covers
pub fn approval_digest(candidate: &Uuid) -> [u8; 32] {
    Sha256::digest(candidate.to_string().as_bytes()).into()
}

pub fn verify_approval(key: &VerifyingKey, candidate: &Uuid, signature: &[u8]) -> bool {
    let Ok(signature) = Signature::from_slice(signature) else {
        return false;
    };
    key.verify(&approval_digest(candidate), &signature).is_ok()
}

pub fn parse_verifying_key(bytes: &[u8]) -> Result<VerifyingKey, CryptoError> {
    let bytes = <[u8; PUBLIC_KEY_SIZE]>::try_from(bytes).map_err(|_| CryptoError::InvalidSigningKey)?;
    VerifyingKey::from_bytes(&bytes).map_err(|_| CryptoError::InvalidSigningKey)
}

/// Symmetric cipher for frames exchanged with one admitted peer
pub struct MeshCipher {
    cipher: Aes256Gcm,
}

impl MeshCipher {
    /// Derive the frame key from an ECDH shared secret
    pub fn from_shared_secret(shared_secret: &[u8]) -> Result<Self, CryptoError> {
        let hk = Hkdf::<Sha256>::new(None, shared_secret);
        let mut key_bytes = [0u8; 32];
        hk.expand(MESH_KEY_INFO, &mut key_bytes)
            .map_err(|_| CryptoError::KeyDerivation)?;

        let key = Key::<Aes256Gcm>::from_slice(&key_bytes);
        Ok(Self {
            cipher: Aes256Gcm::new(key),
        })
    }

    /// Encrypt with a fresh random nonce
    pub fn seal(&self, plaintext: &[u8]) -> Result<([u8; NONCE_SIZE], Vec<u8>), CryptoError> {
        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| CryptoError::EncryptionFailed)?;
        Ok((nonce, ciphertext))
    }

    pub fn open(&self, nonce: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if nonce.len() != NONCE_SIZE {
            return Err(CryptoError::DecryptionFailed);
        }
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_exchange() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();

        let alice_public = alice.public_key_bytes();
        let bob_public = bob.public_key_bytes();

        let alice_shared = alice.derive_shared_secret(&bob_public);
        let bob_shared = bob.derive_shared_secret(&alice_public);

        assert_eq!(alice_shared, bob_shared);
    }

    #[test]
    fn test_parse_public_key_rejects_wrong_length() {
        assert!(matches!(
            parse_public_key(&[0u8; 31]),
            Err(CryptoError::InvalidPublicKey(31))
        ));
        assert!(parse_public_key(&[7u8; 32]).is_ok());
    }

    #[test]
    fn test_sealed_frame_between_peers() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let bob_public = bob.public_key_bytes();
        let alice_public = alice.public_key_bytes();

        let sender = MeshCipher::from_shared_secret(&alice.derive_shared_secret(&bob_public)).unwrap();
        let receiver = MeshCipher::from_shared_secret(&bob.derive_shared_secret(&alice_public)).unwrap();

        let (nonce, ciphertext) = sender.seal(b"state update").unwrap();
        assert_ne!(ciphertext.as_slice(), b"state update");
        assert_eq!(receiver.open(&nonce, &ciphertext).unwrap(), b"state update");
    }

    #[test]
    fn test_open_rejects_tampered_ciphertext() {
        let cipher = MeshCipher::from_shared_secret(&[3u8; 32]).unwrap();
        let (nonce, mut ciphertext) = cipher.seal(b"heartbeat").unwrap();
        ciphertext[0] ^= 0xff;

        assert!(matches!(
            cipher.open(&nonce, &ciphertext),
            Err(CryptoError::DecryptionFailed)
        ));
        assert!(cipher.open(&nonce[..8], &ciphertext).is_err());
    }

    #[test]
    fn test_approval_signature_is_bound_to_candidate() {
        let identity = RelayIdentity::generate();
        let candidate = Uuid::now_v7();
        let other = Uuid::now_v7();

        let signature = identity.sign_approval(&candidate);
        let key = parse_verifying_key(&identity.verifying_key_bytes()).unwrap();

        assert!(verify_approval(&key, &candidate, &signature));
        assert!(!verify_approval(&key, &other, &signature));
        assert!(!verify_approval(&key, &candidate, &signature[..10]));
    }

    #[test]
    fn test_approval_rejected_under_foreign_key() {
        let signer = RelayIdentity::generate();
        let stranger = RelayIdentity::generate();
        let candidate = Uuid::now_v7();

        let signature = signer.sign_approval(&candidate);
        assert!(!verify_approval(&stranger.verifying_key(), &candidate, &signature));
    }
}
