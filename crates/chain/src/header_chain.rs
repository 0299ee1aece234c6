use std::fmt;

use basalt_pow::{header_proof, worksum_to_f64, CompactError, Worksum};
use basalt_primitives::{Hash256, Header, Height};

pub const GENESIS_HASH: Hash256 = [
    0x5b, 0xa1, 0x0c, 0x67, 0x2e, 0x84, 0x31, 0x7f, 0x0d, 0x2a, 0x9e, 0x55, 0x43, 0xbb, 0x61,
    0x0a, 0x78, 0x90, 0x12, 0xcd, 0x4e, 0xf3, 0x27, 0x86, 0x1d, 0xc5, 0x39, 0x74, 0xa2, 0x08,
    0x6b, 0x00,
];

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HeaderChainError {
    BrokenLink(Height),
    Target(CompactError),
}

impl fmt::Display for HeaderChainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeaderChainError::BrokenLink(height) => {
                write!(f, "header at height {height} does not extend its parent")
            }
            HeaderChainError::Target(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for HeaderChainError {}

impl From<CompactError> for HeaderChainError {
    fn from(err: CompactError) -> Self {
        HeaderChainError::Target(err)
    }
}

// Contiguous headers starting at height 1 on top of the fixed genesis hash.
// Hashes and cumulative work are kept alongside so lookups stay cheap.
#[derive(Clone, Debug, Default)]
pub struct HeaderChain {
    headers: Vec<Header>,
    hashes: Vec<Hash256>,
    work: Vec<Worksum>,
}

impl HeaderChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_headers(headers: Vec<Header>) -> Result<Self, HeaderChainError> {
        let mut chain = Self::new();
        chain.append(&headers)?;
        Ok(chain)
    }

    pub fn length(&self) -> Height {
        self.headers.len() as Height
    }

    pub fn total_work(&self) -> Worksum {
        self.work.last().copied().unwrap_or_default()
    }

    pub fn work_at(&self, height: Height) -> Worksum {
        if height == 0 {
            return Worksum::default();
        }
        self.work
            .get(height as usize - 1)
            .copied()
            .unwrap_or_else(|| self.total_work())
    }

    pub fn tip_hash(&self) -> Hash256 {
        self.hashes.last().copied().unwrap_or(GENESIS_HASH)
    }

    pub fn hash_at(&self, height: Height) -> Option<Hash256> {
        if height == 0 {
            return Some(GENESIS_HASH);
        }
        self.hashes.get(height as usize - 1).copied()
    }

    pub fn get_header(&self, height: Height) -> Option<&Header> {
        if height == 0 {
            return None;
        }
        self.headers.get(height as usize - 1)
    }

    pub fn get_headers(&self, start: Height, end: Height) -> Vec<Header> {
        if start == 0 || start > end || start > self.length() {
            return Vec::new();
        }
        let end = end.min(self.length());
        self.headers[start as usize - 1..end as usize].to_vec()
    }

    pub fn append(&mut self, headers: &[Header]) -> Result<(), HeaderChainError> {
        for header in headers {
            if header.prev_hash != self.tip_hash() {
                return Err(HeaderChainError::BrokenLink(self.length() + 1));
            }
            let proof = header_proof(header.target_bits)?;
            let total = self.total_work() + proof;
            self.hashes.push(header.hash());
            self.headers.push(*header);
            self.work.push(total);
        }
        Ok(())
    }

    pub fn truncate(&mut self, new_length: Height) {
        let keep = new_length as usize;
        self.headers.truncate(keep);
        self.hashes.truncate(keep);
        self.work.truncate(keep);
    }

    // First height at which the two chains disagree. If one is a prefix of
    // the other this is min(length)+1.
    pub fn fork_height(&self, other: &HeaderChain) -> Height {
        let shared = self.length().min(other.length());
        for height in 1..=shared {
            if self.hashes[height as usize - 1] != other.hashes[height as usize - 1] {
                return height;
            }
        }
        shared + 1
    }

    pub fn hashrate(&self, n: usize) -> f64 {
        let len = self.length();
        if len < 2 || n < 2 {
            return 0.0;
        }
        let span = (n as Height).min(len);
        let first = &self.headers[(len - span) as usize];
        let last = &self.headers[len as usize - 1];
        let elapsed = last.time.saturating_sub(first.time);
        if elapsed == 0 {
            return 0.0;
        }
        let work = self.total_work() - self.work_at(len - span);
        worksum_to_f64(work) / elapsed as f64
    }

    pub fn hashrate_chart(&self, from: Height, to: Height, window: usize) -> Vec<(Height, f64)> {
        let mut out = Vec::new();
        if window < 2 {
            return out;
        }
        let to = to.min(self.length());
        let mut height = from.max(window as Height);
        while height <= to {
            let first = &self.headers[(height - window as Height) as usize];
            let last = &self.headers[height as usize - 1];
            let elapsed = last.time.saturating_sub(first.time);
            let rate = if elapsed == 0 {
                0.0
            } else {
                let work = self.work_at(height) - self.work_at(height - window as Height);
                worksum_to_f64(work) / elapsed as f64
            };
            out.push((height, rate));
            height += 1;
        }
        out
    }
}

#[cfg(test)]
pub mod testutil {
    use super::*;

    pub const TEST_BITS: u32 = 0x2100ffff;

    pub fn extend(chain: &HeaderChain, count: usize, salt: u32) -> Vec<Header> {
        let mut prev = chain.tip_hash();
        let mut time = chain
            .get_header(chain.length())
            .map(|h| h.time)
            .unwrap_or(1_700_000_000);
        let mut out = Vec::with_capacity(count);
        for i in 0..count {
            time += 30;
            let header = Header {
                prev_hash: prev,
                tx_root: [salt as u8; 32],
                target_bits: TEST_BITS,
                time,
                nonce: salt.wrapping_add(i as u32),
            };
            prev = header.hash();
            out.push(header);
        }
        out
    }
}
