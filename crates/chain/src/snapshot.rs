use basalt_primitives::{DecodeError, Decoder, Encoder, Hash256, Height};

use crate::header_chain::HeaderChain;

pub const SIGNATURE_LEN: usize = 65;

// Lexicographic: importance first, then height. (0, 0) means "no snapshot".
#[derive(Clone, Copy, Debug, Default, Eq, Ord, PartialEq, PartialOrd)]
pub struct SnapshotPriority {
    pub importance: u32,
    pub height: Height,
}

impl SnapshotPriority {
    pub fn is_none(&self) -> bool {
        self.importance == 0 && self.height == 0
    }

    pub fn encode(&self, enc: &mut Encoder) {
        enc.u32(self.importance);
        enc.u32(self.height);
    }

    pub fn decode(dec: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            importance: dec.u32()?,
            height: dec.u32()?,
        })
    }
}

// Externally signed checkpoint. Signature bytes are carried verbatim; the
// chain server owns cryptographic verification.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SignedSnapshot {
    pub priority: SnapshotPriority,
    pub hash: Hash256,
    pub signature: [u8; SIGNATURE_LEN],
}

impl SignedSnapshot {
    pub fn height(&self) -> Height {
        self.priority.height
    }

    // A chain is compatible if it can still contain the pinned hash: either
    // it has the exact hash at the pinned height, or it is too short to
    // contradict it yet.
    pub fn compatible(&self, chain: &HeaderChain) -> bool {
        match chain.hash_at(self.priority.height) {
            Some(hash) => hash == self.hash,
            None => true,
        }
    }

    pub fn encode(&self, enc: &mut Encoder) {
        self.priority.encode(enc);
        enc.bytes(&self.hash);
        enc.bytes(&self.signature);
    }

    pub fn decode(dec: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            priority: SnapshotPriority::decode(dec)?,
            hash: dec.array::<32>()?,
            signature: dec.array::<SIGNATURE_LEN>()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header_chain::testutil::extend;

    fn snapshot_at(chain: &HeaderChain, height: Height) -> SignedSnapshot {
        SignedSnapshot {
            priority: SnapshotPriority {
                importance: 1,
                height,
            },
            hash: chain.hash_at(height).expect("height present"),
            signature: [7u8; SIGNATURE_LEN],
        }
    }

    #[test]
    fn priority_orders_importance_first() {
        let low = SnapshotPriority {
            importance: 1,
            height: 900,
        };
        let high = SnapshotPriority {
            importance: 2,
            height: 1,
        };
        assert!(low < high);
        assert!(SnapshotPriority::default().is_none());
    }

    #[test]
    fn compatible_matches_pinned_hash() {
        let mut chain = HeaderChain::new();
        chain.append(&extend(&chain, 5, 1)).expect("append");
        let snapshot = snapshot_at(&chain, 3);
        assert!(snapshot.compatible(&chain));

        let mut reorged = chain.clone();
        reorged.truncate(2);
        reorged.append(&extend(&reorged, 3, 9)).expect("reorg");
        assert!(!snapshot.compatible(&reorged));

        let mut short = chain.clone();
        short.truncate(2);
        assert!(snapshot.compatible(&short));
    }

    #[test]
    fn codec_round_trip() {
        let mut chain = HeaderChain::new();
        chain.append(&extend(&chain, 2, 1)).expect("append");
        let snapshot = snapshot_at(&chain, 2);
        let mut enc = Encoder::new();
        snapshot.encode(&mut enc);
        let bytes = enc.into_bytes();
        let mut dec = Decoder::new(&bytes);
        assert_eq!(SignedSnapshot::decode(&mut dec).expect("decode"), snapshot);
    }
}
