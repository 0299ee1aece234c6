use std::fmt;

use crate::encoding::{DecodeError, Decoder, Encoder};

pub const MAX_BLOCK_SIZE: usize = 2 * 1024 * 1024;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BodyError {
    Oversized(usize),
}

impl fmt::Display for BodyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BodyError::Oversized(len) => {
                write!(f, "block body of {len} bytes exceeds {MAX_BLOCK_SIZE}")
            }
        }
    }
}

impl std::error::Error for BodyError {}

// Opaque serialized block body. Structure parsing happens in the chain
// server; the network layer only enforces the size cap.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BodyContainer {
    bytes: Vec<u8>,
}

impl BodyContainer {
    pub fn new(bytes: Vec<u8>) -> Result<Self, BodyError> {
        if bytes.len() > MAX_BLOCK_SIZE {
            return Err(BodyError::Oversized(bytes.len()));
        }
        Ok(Self { bytes })
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn encode(&self, enc: &mut Encoder) {
        enc.var_bytes(&self.bytes);
    }

    pub fn decode(dec: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let bytes = dec.var_bytes()?;
        if bytes.len() > MAX_BLOCK_SIZE {
            return Err(DecodeError::Oversized("block body"));
        }
        Ok(Self { bytes })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_oversized_body() {
        let err = BodyContainer::new(vec![0u8; MAX_BLOCK_SIZE + 1]);
        assert!(matches!(err, Err(BodyError::Oversized(_))));
    }

    #[test]
    fn codec_round_trip() {
        let body = BodyContainer::new(vec![1, 2, 3]).expect("body");
        let mut enc = Encoder::new();
        body.encode(&mut enc);
        let bytes = enc.into_bytes();
        let mut dec = Decoder::new(&bytes);
        assert_eq!(BodyContainer::decode(&mut dec).expect("decode"), body);
    }
}
