//! Core wire types: hashes, byte-level codec, block headers and bodies.

pub mod body;
pub mod encoding;
pub mod hash;
pub mod header;

pub use body::{BodyContainer, BodyError, MAX_BLOCK_SIZE};
pub use encoding::{DecodeError, Decoder, Encoder};
pub use hash::{checksum4, sha256d};
pub use header::{Header, HEADER_LEN};

pub type Hash256 = [u8; 32];
pub type TxId = [u8; 32];
pub type Height = u32;
