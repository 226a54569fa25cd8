//! Cryptographic primitives for Embercoin
//!
//! ECDSA over NIST P-256, seed-based key derivation, and the
//! SHA256+RIPEMD160 public key hash used by pay-to-public-key-hash
//! locking scripts.

use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use ripemd::Ripemd160;
use sha2::{Digest, Sha256};
use thiserror::Error;

pub mod address;
pub mod script;

pub use address::{get_address, pub_key_hash_from_address, validate_address};
pub use script::{build_p2pkh_script, check_pk_script_standard, parse_p2pkh_script};

/// Width in bytes of a P-256 coordinate, and of each half of a signature.
pub const CURVE_BYTES: usize = 32;

/// PBKDF2 rounds used when deriving a keypair from a wallet seed.
const SEED_ROUNDS: u32 = 4096;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("invalid private scalar")]
    InvalidKey,

    #[error("invalid public key bytes")]
    InvalidPublicKey,

    #[error("malformed signature")]
    MalformedSignature,

    #[error("invalid address: {0}")]
    AddressInvalid(String),
}

/// An ECDSA P-256 keypair.
///
/// The public key representation used on the wire and inside transaction
/// inputs is the raw concatenation of the big-endian X and Y coordinates
/// (64 bytes, no SEC1 tag byte).
#[derive(Clone)]
pub struct Keypair {
    signing: SigningKey,
}

impl Keypair {
    /// Generate a fresh keypair from the system RNG.
    pub fn random() -> Keypair {
        Keypair {
            signing: SigningKey::random(&mut rand::thread_rng()),
        }
    }

    /// Derive a keypair from a wallet seed (mnemonic plus optional salt).
    ///
    /// PBKDF2-HMAC-SHA256 with 4096 rounds produces the candidate scalar.
    /// Byte strings that fall outside the scalar field are folded through
    /// SHA-256 until a usable non-zero scalar comes out, so every seed maps
    /// to a key.
    pub fn from_seed(mnemonic: &str, salt: &str) -> Keypair {
        let mut scalar = [0u8; CURVE_BYTES];
        pbkdf2::pbkdf2_hmac::<Sha256>(
            mnemonic.as_bytes(),
            salt.as_bytes(),
            SEED_ROUNDS,
            &mut scalar,
        );
        loop {
            match SigningKey::from_bytes(p256::FieldBytes::from_slice(&scalar)) {
                Ok(signing) => return Keypair { signing },
                Err(_) => {
                    let folded = Sha256::digest(scalar);
                    scalar.copy_from_slice(&folded);
                }
            }
        }
    }

    /// Reconstruct a keypair from a raw 32-byte scalar.
    pub fn from_scalar(bytes: &[u8]) -> Result<Keypair, CryptoError> {
        if bytes.len() != CURVE_BYTES {
            return Err(CryptoError::InvalidKey);
        }
        SigningKey::from_bytes(p256::FieldBytes::from_slice(bytes))
            .map(|signing| Keypair { signing })
            .map_err(|_| CryptoError::InvalidKey)
    }

    /// Raw public key bytes: X || Y, 64 bytes.
    pub fn public_key(&self) -> Vec<u8> {
        let point = self.signing.verifying_key().to_encoded_point(false);
        point.as_bytes()[1..].to_vec()
    }

    /// Sign a digest, returning the fixed-width `r || s` concatenation
    /// (two equal halves of [`CURVE_BYTES`] each).
    pub fn sign(&self, digest: &[u8]) -> Vec<u8> {
        let signature: Signature = self.signing.sign(digest);
        signature.to_bytes().to_vec()
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print the private scalar.
        write!(f, "Keypair({})", hex::encode(&self.public_key()[..8]))
    }
}

/// Verify an `r || s` signature made by the key with raw `X || Y` bytes
/// `pub_key` over `digest`. Malformed keys or signatures verify as false.
pub fn verify_signature(pub_key: &[u8], signature: &[u8], digest: &[u8]) -> bool {
    if pub_key.len() != 2 * CURVE_BYTES || signature.len() != 2 * CURVE_BYTES {
        return false;
    }
    let mut sec1 = Vec::with_capacity(1 + pub_key.len());
    sec1.push(0x04);
    sec1.extend_from_slice(pub_key);
    let key = match VerifyingKey::from_sec1_bytes(&sec1) {
        Ok(key) => key,
        Err(_) => return false,
    };
    let signature = match Signature::from_slice(signature) {
        Ok(signature) => signature,
        Err(_) => return false,
    };
    key.verify(digest, &signature).is_ok()
}

/// SHA-256 of arbitrary bytes.
pub fn sha256(data: &[u8]) -> Vec<u8> {
    Sha256::digest(data).to_vec()
}

/// The 20-byte public key hash: RIPEMD160(SHA256(pub)).
pub fn hash_pub_key(pub_key: &[u8]) -> Vec<u8> {
    Ripemd160::digest(Sha256::digest(pub_key)).to_vec()
}
