use crate::encoding::{DecodeError, Decoder, Encoder};
use crate::hash::sha256d;
use crate::Hash256;

pub const HEADER_LEN: usize = 76;

// prev_hash(32) | tx_root(32) | target_bits(4) | time(4) | nonce(4)
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Header {
    pub prev_hash: Hash256,
    pub tx_root: Hash256,
    pub target_bits: u32,
    pub time: u32,
    pub nonce: u32,
}

impl Header {
    pub fn encode(&self, enc: &mut Encoder) {
        enc.bytes(&self.prev_hash);
        enc.bytes(&self.tx_root);
        enc.u32(self.target_bits);
        enc.u32(self.time);
        enc.u32(self.nonce);
    }

    pub fn decode(dec: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            prev_hash: dec.array::<32>()?,
            tx_root: dec.array::<32>()?,
            target_bits: dec.u32()?,
            time: dec.u32()?,
            nonce: dec.u32()?,
        })
    }

    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut enc = Encoder::with_capacity(HEADER_LEN);
        self.encode(&mut enc);
        let bytes = enc.into_bytes();
        let mut out = [0u8; HEADER_LEN];
        out.copy_from_slice(&bytes);
        out
    }

    pub fn hash(&self) -> Hash256 {
        sha256d(&self.to_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Header {
        Header {
            prev_hash: [0x11; 32],
            tx_root: [0x22; 32],
            target_bits: 0x2100ffff,
            time: 1_700_000_000,
            nonce: 42,
        }
    }

    #[test]
    fn encoded_length_is_fixed() {
        assert_eq!(sample().to_bytes().len(), HEADER_LEN);
    }

    #[test]
    fn decode_inverts_encode() {
        let header = sample();
        let bytes = header.to_bytes();
        let mut dec = Decoder::new(&bytes);
        let decoded = Header::decode(&mut dec).expect("decode");
        dec.finish().expect("consumed");
        assert_eq!(decoded, header);
    }

    #[test]
    fn hash_depends_on_nonce() {
        let a = sample();
        let mut b = sample();
        b.nonce += 1;
        assert_ne!(a.hash(), b.hash());
    }
}
