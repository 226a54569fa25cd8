//! Locking script construction and inspection
//!
//! Only two script shapes count as standard here: pay-to-public-key-hash,
//! and bare multisig with at most three keys. Everything else is rejected
//! at verification time.

/// Script opcodes used by the standard templates.
pub const OP_DUP: u8 = 0x76;
pub const OP_HASH160: u8 = 0xa9;
pub const OP_EQUALVERIFY: u8 = 0x88;
pub const OP_CHECKSIG: u8 = 0xac;
pub const OP_CHECKMULTISIG: u8 = 0xae;
pub const OP_RETURN: u8 = 0x6a;
const OP_1: u8 = 0x51;
const OP_16: u8 = 0x60;

/// Length of the hash carried by a P2PKH script.
pub const HASH160_LEN: usize = 20;

/// Total length of a P2PKH script.
const P2PKH_LEN: usize = 25;

/// Largest key count accepted in a bare multisig script.
const MAX_MULTISIG_KEYS: u8 = 3;

/// Build the standard P2PKH locking script:
/// `OP_DUP OP_HASH160 <20-byte hash> OP_EQUALVERIFY OP_CHECKSIG`.
pub fn build_p2pkh_script(pub_key_hash: &[u8]) -> Vec<u8> {
    let mut script = Vec::with_capacity(P2PKH_LEN);
    script.push(OP_DUP);
    script.push(OP_HASH160);
    script.push(HASH160_LEN as u8);
    script.extend_from_slice(pub_key_hash);
    script.push(OP_EQUALVERIFY);
    script.push(OP_CHECKSIG);
    script
}

/// A deliberately unspendable script used when an asset is destroyed.
pub fn build_unspendable_script() -> Vec<u8> {
    vec![OP_RETURN]
}

/// Extract the 20-byte hash from a P2PKH script, or `None` for any other
/// script shape.
pub fn parse_p2pkh_script(script: &[u8]) -> Option<&[u8]> {
    if script.len() == P2PKH_LEN
        && script[0] == OP_DUP
        && script[1] == OP_HASH160
        && script[2] == HASH160_LEN as u8
        && script[23] == OP_EQUALVERIFY
        && script[24] == OP_CHECKSIG
    {
        Some(&script[3..23])
    } else {
        None
    }
}

/// Whether a locking script is one of the standard shapes: P2PKH, or bare
/// multisig with at most [`MAX_MULTISIG_KEYS`] keys.
pub fn check_pk_script_standard(script: &[u8]) -> bool {
    parse_p2pkh_script(script).is_some() || parse_multisig(script).is_some()
}

/// Parse `OP_m <key>... OP_n OP_CHECKMULTISIG`, returning `(m, n)` when the
/// layout holds and `n` stays within the standardness limit.
fn parse_multisig(script: &[u8]) -> Option<(u8, u8)> {
    let (&last, rest) = script.split_last()?;
    if last != OP_CHECKMULTISIG {
        return None;
    }
    let (&op_n, rest) = rest.split_last()?;
    let (&op_m, mut keys) = rest.split_first()?;
    if !(OP_1..=OP_16).contains(&op_m) || !(OP_1..=OP_16).contains(&op_n) {
        return None;
    }
    let m = op_m - OP_1 + 1;
    let n = op_n - OP_1 + 1;
    if m > n || n > MAX_MULTISIG_KEYS {
        return None;
    }

    let mut seen = 0u8;
    while !keys.is_empty() {
        let push = keys[0] as usize;
        // Compressed or uncompressed SEC1 key pushes only.
        if push != 33 && push != 65 {
            return None;
        }
        if keys.len() < 1 + push {
            return None;
        }
        keys = &keys[1 + push..];
        seen += 1;
        if seen > n {
            return None;
        }
    }
    if seen != n {
        return None;
    }
    Some((m, n))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn multisig_script(m: u8, keys: &[Vec<u8>]) -> Vec<u8> {
        let mut script = vec![OP_1 + m - 1];
        for key in keys {
            script.push(key.len() as u8);
            script.extend_from_slice(key);
        }
        script.push(OP_1 + keys.len() as u8 - 1);
        script.push(OP_CHECKMULTISIG);
        script
    }

    #[test]
    fn p2pkh_roundtrip() {
        let hash = [7u8; HASH160_LEN];
        let script = build_p2pkh_script(&hash);
        assert_eq!(script.len(), 25);
        assert_eq!(parse_p2pkh_script(&script), Some(&hash[..]));
        assert!(check_pk_script_standard(&script));
    }

    #[test]
    fn mangled_p2pkh_is_rejected() {
        let mut script = build_p2pkh_script(&[7u8; HASH160_LEN]);
        script[0] = OP_HASH160;
        assert_eq!(parse_p2pkh_script(&script), None);
        assert!(!check_pk_script_standard(&script));

        let truncated = &build_p2pkh_script(&[7u8; HASH160_LEN])[..24];
        assert_eq!(parse_p2pkh_script(truncated), None);
    }

    #[test]
    fn small_multisig_is_standard() {
        let keys = vec![vec![2u8; 33], vec![3u8; 33]];
        assert!(check_pk_script_standard(&multisig_script(2, &keys)));

        let keys = vec![vec![2u8; 65], vec![3u8; 65], vec![4u8; 65]];
        assert!(check_pk_script_standard(&multisig_script(2, &keys)));
    }

    #[test]
    fn oversized_multisig_is_not_standard() {
        let keys = vec![vec![2u8; 33], vec![3u8; 33], vec![4u8; 33], vec![5u8; 33]];
        assert!(!check_pk_script_standard(&multisig_script(2, &keys)));
    }

    #[test]
    fn unspendable_script_is_not_standard() {
        let script = build_unspendable_script();
        assert_eq!(parse_p2pkh_script(&script), None);
        assert!(!check_pk_script_standard(&script));
    }
}
