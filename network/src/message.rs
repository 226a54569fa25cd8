//! Wire protocol
//!
//! Every payload travels over a named broadcast topic wrapped in a
//! [`RequestMessage`]. An empty `receiver` addresses everyone on the topic;
//! otherwise only the named host reacts.

use serde::{Deserialize, Serialize};

use embercoin_core::codec::{self, CodecError};

/// Protocol version advertised on the `version` topic.
pub const PROTOCOL_VERSION: u32 = 1;

// General topics every node listens to.
pub const TOPIC_VERSION: &str = "version";
pub const TOPIC_HEIGHT: &str = "height";
pub const TOPIC_GET_BLOCKS: &str = "getblocks";
pub const TOPIC_INV_BLOCK: &str = "inv/block";
pub const TOPIC_GET_DATA_BLOCK: &str = "getdata/block";
pub const TOPIC_BLOCK: &str = "block";

// Full-node topics.
pub const TOPIC_FULLNODES_TX: &str = "fullnodes/tx";
pub const TOPIC_FULLNODES_GET_DATA_TX: &str = "fullnodes/getdata/tx";

// Miner topics.
pub const TOPIC_MINING_INV_TX: &str = "mining/inv/tx";
pub const TOPIC_MINING_TX: &str = "mining/tx";

/// Envelope for every topic payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMessage {
    pub sender: String,
    pub receiver: String,
    pub payload: Vec<u8>,
}

impl RequestMessage {
    pub fn new(sender: &str, receiver: &str, payload: Vec<u8>) -> RequestMessage {
        RequestMessage {
            sender: sender.to_string(),
            receiver: receiver.to_string(),
            payload,
        }
    }

    /// Whether a host should react to this message.
    pub fn is_for(&self, host: &str) -> bool {
        self.receiver.is_empty() || self.receiver == host
    }

    pub fn serialize(&self) -> Result<Vec<u8>, CodecError> {
        codec::encode(self)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<RequestMessage, CodecError> {
        codec::decode(bytes)
    }
}

/// `version` — protocol version announcement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionPayload {
    pub version: u32,
}

/// `height` — the sender's current tip height.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeightPayload {
    pub height: u64,
}

/// `getblocks` — the requester's tip; the responder answers with every
/// hash above it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetBlocksPayload {
    pub height: u64,
}

/// `inv/block` and `mining/inv/tx` — inventory of hashes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvPayload {
    pub items: Vec<Vec<u8>>,
}

/// `getdata/block` — request for one block body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetBlockPayload {
    pub hash: Vec<u8>,
    pub is_miner: bool,
}

/// `fullnodes/getdata/tx` — request for one transaction body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetTxPayload {
    pub id: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_roundtrip() {
        let msg = RequestMessage::new("alpha", "beta", vec![1, 2, 3]);
        let decoded = RequestMessage::deserialize(&msg.serialize().unwrap()).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn receiver_filtering() {
        let broadcast = RequestMessage::new("alpha", "", vec![]);
        assert!(broadcast.is_for("anyone"));

        let addressed = RequestMessage::new("alpha", "beta", vec![]);
        assert!(addressed.is_for("beta"));
        assert!(!addressed.is_for("gamma"));
    }

    #[test]
    fn payload_roundtrips() {
        let inv = InvPayload {
            items: vec![vec![1; 32], vec![2; 32]],
        };
        let bytes = codec::encode(&inv).unwrap();
        assert_eq!(inv, codec::decode::<InvPayload>(&bytes).unwrap());

        let get = GetBlockPayload {
            hash: vec![7; 32],
            is_miner: true,
        };
        let bytes = codec::encode(&get).unwrap();
        assert_eq!(get, codec::decode::<GetBlockPayload>(&bytes).unwrap());
    }
}
