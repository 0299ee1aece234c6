use sha2::{Digest, Sha256};

use crate::Hash256;

pub fn sha256d(data: &[u8]) -> Hash256 {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    let mut out = [0u8; 32];
    out.copy_from_slice(&second);
    out
}

pub fn checksum4(payload: &[u8]) -> [u8; 4] {
    let digest = sha256d(payload);
    let mut out = [0u8; 4];
    out.copy_from_slice(&digest[..4]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_is_prefix_of_double_sha() {
        let payload = b"basalt";
        let digest = sha256d(payload);
        assert_eq!(checksum4(payload), [digest[0], digest[1], digest[2], digest[3]]);
    }

    #[test]
    fn empty_payload_checksum_is_stable() {
        assert_eq!(checksum4(&[]), checksum4(&[]));
        assert_ne!(checksum4(&[]), checksum4(&[0]));
    }
}
