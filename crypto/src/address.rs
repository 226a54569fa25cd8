//! Base58Check address encoding
//!
//! An address is `Base58Check(0x00 || RIPEMD160(SHA256(pub)))` with the
//! standard 4-byte double-SHA256 checksum.

use crate::{hash_pub_key, CryptoError};

/// Version byte prepended to the public key hash before encoding.
pub const ADDRESS_VERSION: u8 = 0x00;

/// Length of the decoded payload: version byte plus 20-byte hash.
const PAYLOAD_LEN: usize = 21;

/// Encode the address for a raw `X || Y` public key.
pub fn get_address(pub_key: &[u8]) -> String {
    bs58::encode(hash_pub_key(pub_key))
        .with_check_version(ADDRESS_VERSION)
        .into_string()
}

/// Whether `address` decodes with a valid checksum, version byte, and
/// payload length.
pub fn validate_address(address: &str) -> bool {
    pub_key_hash_from_address(address).is_ok()
}

/// Decode an address back to the 20-byte public key hash it commits to.
pub fn pub_key_hash_from_address(address: &str) -> Result<Vec<u8>, CryptoError> {
    let payload = bs58::decode(address)
        .with_check(Some(ADDRESS_VERSION))
        .into_vec()
        .map_err(|err| CryptoError::AddressInvalid(err.to_string()))?;
    if payload.len() != PAYLOAD_LEN {
        return Err(CryptoError::AddressInvalid(format!(
            "payload is {} bytes, expected {}",
            payload.len(),
            PAYLOAD_LEN
        )));
    }
    Ok(payload[1..].to_vec())
}
