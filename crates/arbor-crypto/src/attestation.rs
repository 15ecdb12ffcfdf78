//! Stage image attestation using SHA-256 and Ed25519

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use tracing::warn;

use arbor_core::{KernelError, KernelResult};

/// SHA-256 digest size
pub const DIGEST_SIZE: usize = 32;

/// Ed25519 signature size
pub const SIGNATURE_SIZE: usize = 64;

/// Signed claim about a stage image: its digest and a signature over it
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Attestation {
    pub digest: [u8; DIGEST_SIZE],
    pub signature: [u8; SIGNATURE_SIZE],
}

/// SHA-256 of a stage image
pub fn image_digest(image: &[u8]) -> [u8; DIGEST_SIZE] {
    let mut hasher = Sha256::new();
    hasher.update(image);
    hasher.finalize().into()
}

fn fingerprint(verifying_key: &VerifyingKey) -> u64 {
    let digest = image_digest(verifying_key.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[0..8]);
    u64::from_le_bytes(bytes)
}

fn digests_match(a: &[u8; DIGEST_SIZE], b: &[u8; DIGEST_SIZE]) -> bool {
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Release key that signs stage images
#[derive(Clone)]
pub struct AttestationKey {
    signing_key: SigningKey,
}

impl AttestationKey {
    /// Generate a new random key
    pub fn generate() -> Self {
        AttestationKey {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Create from existing secret key bytes
    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        AttestationKey {
            signing_key: SigningKey::from_bytes(bytes),
        }
    }

    pub fn secret_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    /// Public anchor matching this key
    pub fn anchor(&self) -> TrustAnchor {
        TrustAnchor {
            verifying_key: self.signing_key.verifying_key(),
        }
    }

    /// Digest `image` and sign the digest
    pub fn attest(&self, image: &[u8]) -> Attestation {
        let digest = image_digest(image);
        let signature = self.signing_key.sign(&digest);
        Attestation {
            digest,
            signature: signature.to_bytes(),
        }
    }
}

impl std::fmt::Debug for AttestationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttestationKey")
            .field("fingerprint", &format_args!("{:016x}", self.anchor().fingerprint()))
            .finish_non_exhaustive()
    }
}

/// Trusted public key the firmware checks stage images against
#[derive(Clone, PartialEq, Eq)]
pub struct TrustAnchor {
    verifying_key: VerifyingKey,
}

impl TrustAnchor {
    /// Create from public key bytes
    pub fn from_bytes(bytes: &[u8; 32]) -> KernelResult<Self> {
        let verifying_key = VerifyingKey::from_bytes(bytes)
            .map_err(|_| KernelError::invalid("malformed trust anchor"))?;
        Ok(TrustAnchor { verifying_key })
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.verifying_key.to_bytes()
    }

    /// First 8 bytes of the SHA-256 of the public key
    pub fn fingerprint(&self) -> u64 {
        fingerprint(&self.verifying_key)
    }

    /// Check that `image` hashes to the attested digest and that the
    /// digest carries a valid signature from this anchor
    pub fn verify(&self, image: &[u8], attestation: &Attestation) -> KernelResult<()> {
        let digest = image_digest(image);
        if !digests_match(&digest, &attestation.digest) {
            warn!(anchor = self.fingerprint(), "image digest mismatch");
            return Err(KernelError::SecurityAttestationFailed(
                "image digest mismatch".into(),
            ));
        }

        let signature = Signature::from_bytes(&attestation.signature);
        self.verifying_key
            .verify(&attestation.digest, &signature)
            .map_err(|_| {
                warn!(anchor = self.fingerprint(), "bad digest signature");
                KernelError::SecurityAttestationFailed("signature rejected".into())
            })
    }
}

impl std::fmt::Debug for TrustAnchor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrustAnchor")
            .field("fingerprint", &format_args!("{:016x}", self.fingerprint()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const IMAGE: &[u8] = b"stage1 hypervisor image";

    #[test]
    fn test_attest_verify() {
        let key = AttestationKey::generate();
        let attestation = key.attest(IMAGE);
        assert!(key.anchor().verify(IMAGE, &attestation).is_ok());
    }

    #[test]
    fn test_tampered_image_rejected() {
        let key = AttestationKey::generate();
        let attestation = key.attest(IMAGE);
        let err = key
            .anchor()
            .verify(b"stage1 hypervisor imagf", &attestation)
            .unwrap_err();
        assert!(matches!(err, KernelError::SecurityAttestationFailed(_)));
    }

    #[test]
    fn test_foreign_key_rejected() {
        let key = AttestationKey::generate();
        let other = AttestationKey::generate();
        let attestation = other.attest(IMAGE);
        assert!(key.anchor().verify(IMAGE, &attestation).is_err());
    }

    #[test]
    fn test_forged_digest_rejected() {
        let key = AttestationKey::generate();
        let mut attestation = key.attest(IMAGE);
        // Matching digest but signature over a different one
        attestation.signature = key.attest(b"other").signature;
        assert!(key.anchor().verify(IMAGE, &attestation).is_err());
    }

    #[test]
    fn test_zeroed_attestation_rejected() {
        let key = AttestationKey::generate();
        let attestation = Attestation {
            digest: [0u8; DIGEST_SIZE],
            signature: [0u8; SIGNATURE_SIZE],
        };
        assert!(key.anchor().verify(IMAGE, &attestation).is_err());
    }

    #[test]
    fn test_anchor_roundtrip() {
        let key = AttestationKey::generate();
        let anchor = TrustAnchor::from_bytes(&key.anchor().to_bytes()).unwrap();
        assert_eq!(anchor, key.anchor());
        assert_eq!(anchor.fingerprint(), key.anchor().fingerprint());

        let restored = AttestationKey::from_bytes(&key.secret_bytes());
        assert_eq!(restored.anchor(), anchor);
    }

    #[test]
    fn test_digest_known_value() {
        let digest = image_digest(b"");
        assert_eq!(digest[0], 0xe3);
        assert_eq!(digest[31], 0x55);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_any_flipped_image_bit_rejected(at in 0..IMAGE.len(), bit in 0u8..8) {
            let key = AttestationKey::generate();
            let attestation = key.attest(IMAGE);
            let mut image = IMAGE.to_vec();
            image[at] ^= 1 << bit;
            prop_assert!(key.anchor().verify(&image, &attestation).is_err());
        }

        #[test]
        fn prop_any_flipped_signature_bit_rejected(at in 0..SIGNATURE_SIZE, bit in 0u8..8) {
            let key = AttestationKey::generate();
            let mut attestation = key.attest(IMAGE);
            attestation.signature[at] ^= 1 << bit;
            prop_assert!(key.anchor().verify(IMAGE, &attestation).is_err());
        }
    }
}
