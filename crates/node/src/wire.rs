use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use basalt_chain::{SignedSnapshot, SnapshotPriority};
use basalt_primitives::{checksum4, BodyContainer, Decoder, Encoder, Header, Height, TxId};

use crate::error::ErrorCode;
use crate::transport::Sndbuffer;

pub const MSG_INIT: u8 = 1;
pub const MSG_FORK: u8 = 2;
pub const MSG_APPEND: u8 = 3;
pub const MSG_ROLLBACK: u8 = 4;
pub const MSG_PING: u8 = 5;
pub const MSG_PONG: u8 = 6;
pub const MSG_BATCHREQ: u8 = 7;
pub const MSG_BATCHREP: u8 = 8;
pub const MSG_PROBEREQ: u8 = 9;
pub const MSG_PROBEREP: u8 = 10;
pub const MSG_BLOCKREQ: u8 = 11;
pub const MSG_BLOCKREP: u8 = 12;
pub const MSG_TXNOTIFY: u8 = 13;
pub const MSG_TXREQ: u8 = 14;
pub const MSG_TXREP: u8 = 15;
pub const MSG_LEADER: u8 = 16;

pub const HEADER_BATCH_SIZE: u32 = 400;
pub const MAX_BATCH_HEADERS: u32 = 2000;
pub const MAX_PONG_ADDRESSES: usize = 64;
pub const MAX_TXIDS: usize = 4096;
pub const MAX_BODIES: u32 = 128;

const FRAME_OVERHEAD: usize = 1 + 4 + 4;

pub type Worksum = basalt_pow::Worksum;

fn encode_worksum(enc: &mut Encoder, worksum: &Worksum) {
    let mut buf = [0u8; 32];
    worksum.to_big_endian(&mut buf);
    enc.bytes(&buf);
}

fn decode_worksum(dec: &mut Decoder<'_>) -> Result<Worksum, ErrorCode> {
    let raw = dec.array::<32>()?;
    Ok(Worksum::from_big_endian(&raw))
}

fn encode_addr(enc: &mut Encoder, addr: &SocketAddrV4) {
    enc.bytes(&addr.ip().octets());
    enc.u16(addr.port());
}

fn decode_addr(dec: &mut Decoder<'_>) -> Result<SocketAddrV4, ErrorCode> {
    let octets = dec.array::<4>()?;
    let port = dec.u16()?;
    Ok(SocketAddrV4::new(Ipv4Addr::from(octets), port))
}

fn encode_opt_header(enc: &mut Encoder, header: &Option<Header>) {
    match header {
        Some(h) => {
            enc.u8(1);
            h.encode(enc);
        }
        None => {
            enc.u8(0);
        }
    }
}

fn decode_opt_header(dec: &mut Decoder<'_>) -> Result<Option<Header>, ErrorCode> {
    match dec.u8()? {
        0 => Ok(None),
        1 => Ok(Some(Header::decode(dec)?)),
        _ => Err(ErrorCode::Malformed),
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct InitMsg {
    pub descriptor: u32,
    pub snapshot_priority: SnapshotPriority,
    pub chain_length: Height,
    pub worksum: Worksum,
}

#[derive(Clone, Debug, PartialEq)]
pub struct AppendMsg {
    pub new_length: Height,
    pub worksum: Worksum,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ForkMsg {
    pub fork_height: Height,
    pub new_length: Height,
    pub worksum: Worksum,
    pub descriptor: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SignedPinRollbackMsg {
    pub snapshot: SignedSnapshot,
    pub shrink_length: Height,
    pub worksum: Worksum,
    pub descriptor: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PingMsg {
    pub nonce: u64,
    pub snapshot_priority: SnapshotPriority,
    pub max_addresses: u16,
    pub max_transactions: u16,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PongMsg {
    pub nonce: u64,
    pub addresses: Vec<SocketAddrV4>,
    pub txids: Vec<TxId>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct BatchreqMsg {
    pub nonce: u64,
    pub descriptor: u32,
    pub start_height: Height,
    pub length: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct BatchrepMsg {
    pub nonce: u64,
    pub headers: Vec<Header>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ProbereqMsg {
    pub nonce: u64,
    pub descriptor: u32,
    pub height: Height,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ProberepMsg {
    pub nonce: u64,
    pub current_descriptor: u32,
    pub current: Option<Header>,
    pub requested: Option<Header>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct BlockreqMsg {
    pub nonce: u64,
    pub lower: Height,
    pub upper: Height,
}

#[derive(Clone, Debug, PartialEq)]
pub struct BlockrepMsg {
    pub nonce: u64,
    pub bodies: Vec<BodyContainer>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TxnotifyMsg {
    pub txids: Vec<TxId>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TxreqMsg {
    pub txids: Vec<TxId>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TxrepMsg {
    pub txs: Vec<Option<Vec<u8>>>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct LeaderMsg {
    pub snapshot: SignedSnapshot,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    Init(InitMsg),
    Append(AppendMsg),
    Fork(ForkMsg),
    SignedPinRollback(SignedPinRollbackMsg),
    Ping(PingMsg),
    Pong(PongMsg),
    Batchreq(BatchreqMsg),
    Batchrep(BatchrepMsg),
    Probereq(ProbereqMsg),
    Proberep(ProberepMsg),
    Blockreq(BlockreqMsg),
    Blockrep(BlockrepMsg),
    Txnotify(TxnotifyMsg),
    Txreq(TxreqMsg),
    Txrep(TxrepMsg),
    Leader(LeaderMsg),
}

impl Message {
    pub fn code(&self) -> u8 {
        match self {
            Message::Init(_) => MSG_INIT,
            Message::Append(_) => MSG_APPEND,
            Message::Fork(_) => MSG_FORK,
            Message::SignedPinRollback(_) => MSG_ROLLBACK,
            Message::Ping(_) => MSG_PING,
            Message::Pong(_) => MSG_PONG,
            Message::Batchreq(_) => MSG_BATCHREQ,
            Message::Batchrep(_) => MSG_BATCHREP,
            Message::Probereq(_) => MSG_PROBEREQ,
            Message::Proberep(_) => MSG_PROBEREP,
            Message::Blockreq(_) => MSG_BLOCKREQ,
            Message::Blockrep(_) => MSG_BLOCKREP,
            Message::Txnotify(_) => MSG_TXNOTIFY,
            Message::Txreq(_) => MSG_TXREQ,
            Message::Txrep(_) => MSG_TXREP,
            Message::Leader(_) => MSG_LEADER,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Message::Init(_) => "init",
            Message::Append(_) => "append",
            Message::Fork(_) => "fork",
            Message::SignedPinRollback(_) => "rollback",
            Message::Ping(_) => "ping",
            Message::Pong(_) => "pong",
            Message::Batchreq(_) => "batchreq",
            Message::Batchrep(_) => "batchrep",
            Message::Probereq(_) => "probereq",
            Message::Proberep(_) => "proberep",
            Message::Blockreq(_) => "blockreq",
            Message::Blockrep(_) => "blockrep",
            Message::Txnotify(_) => "txnotify",
            Message::Txreq(_) => "txreq",
            Message::Txrep(_) => "txrep",
            Message::Leader(_) => "leader",
        }
    }

    fn encode_body(&self, enc: &mut Encoder) {
        match self {
            Message::Init(m) => {
                enc.u32(m.descriptor);
                m.snapshot_priority.encode(enc);
                enc.u32(m.chain_length);
                encode_worksum(enc, &m.worksum);
            }
            Message::Append(m) => {
                enc.u32(m.new_length);
                encode_worksum(enc, &m.worksum);
            }
            Message::Fork(m) => {
                enc.u32(m.fork_height);
                enc.u32(m.new_length);
                encode_worksum(enc, &m.worksum);
                enc.u32(m.descriptor);
            }
            Message::SignedPinRollback(m) => {
                m.snapshot.encode(enc);
                enc.u32(m.shrink_length);
                encode_worksum(enc, &m.worksum);
                enc.u32(m.descriptor);
            }
            Message::Ping(m) => {
                enc.u64(m.nonce);
                m.snapshot_priority.encode(enc);
                enc.u16(m.max_addresses);
                enc.u16(m.max_transactions);
            }
            Message::Pong(m) => {
                enc.u64(m.nonce);
                enc.u16(m.addresses.len() as u16);
                for addr in &m.addresses {
                    encode_addr(enc, addr);
                }
                enc.u32(m.txids.len() as u32);
                for txid in &m.txids {
                    enc.bytes(txid);
                }
            }
            Message::Batchreq(m) => {
                enc.u64(m.nonce);
                enc.u32(m.descriptor);
                enc.u32(m.start_height);
                enc.u32(m.length);
            }
            Message::Batchrep(m) => {
                enc.u64(m.nonce);
                enc.u32(m.headers.len() as u32);
                for header in &m.headers {
                    header.encode(enc);
                }
            }
            Message::Probereq(m) => {
                enc.u64(m.nonce);
                enc.u32(m.descriptor);
                enc.u32(m.height);
            }
            Message::Proberep(m) => {
                enc.u64(m.nonce);
                enc.u32(m.current_descriptor);
                encode_opt_header(enc, &m.current);
                encode_opt_header(enc, &m.requested);
            }
            Message::Blockreq(m) => {
                enc.u64(m.nonce);
                enc.u32(m.lower);
                enc.u32(m.upper);
            }
            Message::Blockrep(m) => {
                enc.u64(m.nonce);
                enc.u32(m.bodies.len() as u32);
                for body in &m.bodies {
                    body.encode(enc);
                }
            }
            Message::Txnotify(m) => {
                enc.u32(m.txids.len() as u32);
                for txid in &m.txids {
                    enc.bytes(txid);
                }
            }
            Message::Txreq(m) => {
                enc.u32(m.txids.len() as u32);
                for txid in &m.txids {
                    enc.bytes(txid);
                }
            }
            Message::Txrep(m) => {
                enc.u32(m.txs.len() as u32);
                for tx in &m.txs {
                    match tx {
                        Some(raw) => {
                            enc.u8(1);
                            enc.var_bytes(raw);
                        }
                        None => {
                            enc.u8(0);
                        }
                    }
                }
            }
            Message::Leader(m) => {
                m.snapshot.encode(enc);
            }
        }
    }

    fn decode_body(code: u8, dec: &mut Decoder<'_>) -> Result<Message, ErrorCode> {
        let msg = match code {
            MSG_INIT => Message::Init(InitMsg {
                descriptor: dec.u32()?,
                snapshot_priority: SnapshotPriority::decode(dec)?,
                chain_length: dec.u32()?,
                worksum: decode_worksum(dec)?,
            }),
            MSG_APPEND => Message::Append(AppendMsg {
                new_length: dec.u32()?,
                worksum: decode_worksum(dec)?,
            }),
            MSG_FORK => Message::Fork(ForkMsg {
                fork_height: dec.u32()?,
                new_length: dec.u32()?,
                worksum: decode_worksum(dec)?,
                descriptor: dec.u32()?,
            }),
            MSG_ROLLBACK => Message::SignedPinRollback(SignedPinRollbackMsg {
                snapshot: SignedSnapshot::decode(dec)?,
                shrink_length: dec.u32()?,
                worksum: decode_worksum(dec)?,
                descriptor: dec.u32()?,
            }),
            MSG_PING => Message::Ping(PingMsg {
                nonce: dec.u64()?,
                snapshot_priority: SnapshotPriority::decode(dec)?,
                max_addresses: dec.u16()?,
                max_transactions: dec.u16()?,
            }),
            MSG_PONG => {
                let nonce = dec.u64()?;
                let addr_count = dec.u16()? as usize;
                if addr_count > MAX_PONG_ADDRESSES {
                    return Err(ErrorCode::Malformed);
                }
                let mut addresses = Vec::with_capacity(addr_count);
                for _ in 0..addr_count {
                    addresses.push(decode_addr(dec)?);
                }
                let txid_count = dec.u32()? as usize;
                if txid_count > MAX_TXIDS {
                    return Err(ErrorCode::Malformed);
                }
                let mut txids = Vec::with_capacity(txid_count);
                for _ in 0..txid_count {
                    txids.push(dec.array::<32>()?);
                }
                Message::Pong(PongMsg {
                    nonce,
                    addresses,
                    txids,
                })
            }
            MSG_BATCHREQ => Message::Batchreq(BatchreqMsg {
                nonce: dec.u64()?,
                descriptor: dec.u32()?,
                start_height: dec.u32()?,
                length: dec.u32()?,
            }),
            MSG_BATCHREP => {
                let nonce = dec.u64()?;
                let count = dec.u32()?;
                if count > MAX_BATCH_HEADERS {
                    return Err(ErrorCode::BatchSize);
                }
                let mut headers = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    headers.push(Header::decode(dec)?);
                }
                Message::Batchrep(BatchrepMsg { nonce, headers })
            }
            MSG_PROBEREQ => Message::Probereq(ProbereqMsg {
                nonce: dec.u64()?,
                descriptor: dec.u32()?,
                height: dec.u32()?,
            }),
            MSG_PROBEREP => Message::Proberep(ProberepMsg {
                nonce: dec.u64()?,
                current_descriptor: dec.u32()?,
                current: decode_opt_header(dec)?,
                requested: decode_opt_header(dec)?,
            }),
            MSG_BLOCKREQ => Message::Blockreq(BlockreqMsg {
                nonce: dec.u64()?,
                lower: dec.u32()?,
                upper: dec.u32()?,
            }),
            MSG_BLOCKREP => {
                let nonce = dec.u64()?;
                let count = dec.u32()?;
                if count > MAX_BODIES {
                    return Err(ErrorCode::BlockRange);
                }
                let mut bodies = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    bodies.push(BodyContainer::decode(dec).map_err(|_| ErrorCode::BlockSize)?);
                }
                Message::Blockrep(BlockrepMsg { nonce, bodies })
            }
            MSG_TXNOTIFY | MSG_TXREQ => {
                let count = dec.u32()? as usize;
                if count > MAX_TXIDS {
                    return Err(ErrorCode::Malformed);
                }
                let mut txids = Vec::with_capacity(count);
                for _ in 0..count {
                    txids.push(dec.array::<32>()?);
                }
                if code == MSG_TXNOTIFY {
                    Message::Txnotify(TxnotifyMsg { txids })
                } else {
                    Message::Txreq(TxreqMsg { txids })
                }
            }
            MSG_TXREP => {
                let count = dec.u32()? as usize;
                if count > MAX_TXIDS {
                    return Err(ErrorCode::Malformed);
                }
                let mut txs = Vec::with_capacity(count);
                for _ in 0..count {
                    match dec.u8()? {
                        0 => txs.push(None),
                        1 => txs.push(Some(dec.var_bytes()?)),
                        _ => return Err(ErrorCode::Malformed),
                    }
                }
                Message::Txrep(TxrepMsg { txs })
            }
            MSG_LEADER => Message::Leader(LeaderMsg {
                snapshot: SignedSnapshot::decode(dec)?,
            }),
            _ => return Err(ErrorCode::MsgType),
        };
        dec.finish()?;
        Ok(msg)
    }

    // code(1) | body length(4) | checksum(4) | body
    pub fn frame(&self) -> Sndbuffer {
        let mut body = Encoder::new();
        self.encode_body(&mut body);
        let body = body.into_bytes();
        let mut out = Encoder::with_capacity(FRAME_OVERHEAD + body.len());
        out.u8(self.code());
        out.u32(body.len() as u32);
        out.bytes(&checksum4(&body));
        out.bytes(&body);
        out.into_bytes()
    }
}

// A raw received frame. Integrity is checked before parsing; a checksum
// mismatch is a fatal offense.
#[derive(Clone, Debug)]
pub struct Rcvbuffer {
    bytes: Vec<u8>,
}

impl Rcvbuffer {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn verify(&self) -> bool {
        if self.bytes.len() < FRAME_OVERHEAD {
            return false;
        }
        let len = u32::from_le_bytes([self.bytes[1], self.bytes[2], self.bytes[3], self.bytes[4]])
            as usize;
        if self.bytes.len() != FRAME_OVERHEAD + len {
            return false;
        }
        let checksum = [self.bytes[5], self.bytes[6], self.bytes[7], self.bytes[8]];
        checksum == checksum4(&self.bytes[FRAME_OVERHEAD..])
    }

    pub fn parse(&self) -> Result<Message, ErrorCode> {
        if self.bytes.len() < FRAME_OVERHEAD {
            return Err(ErrorCode::Malformed);
        }
        let code = self.bytes[0];
        let mut dec = Decoder::new(&self.bytes[FRAME_OVERHEAD..]);
        Message::decode_body(code, &mut dec)
    }
}

pub fn sockaddr_v4(addr: SocketAddr) -> Option<SocketAddrV4> {
    match addr {
        SocketAddr::V4(v4) => Some(v4),
        SocketAddr::V6(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(msg: Message) -> Message {
        let frame = msg.frame();
        let rcv = Rcvbuffer::new(frame);
        assert!(rcv.verify());
        rcv.parse().expect("parse")
    }

    #[test]
    fn ping_round_trip() {
        let msg = Message::Ping(PingMsg {
            nonce: 77,
            snapshot_priority: SnapshotPriority {
                importance: 2,
                height: 14,
            },
            max_addresses: 32,
            max_transactions: 256,
        });
        assert_eq!(round_trip(msg.clone()), msg);
    }

    #[test]
    fn pong_carries_addresses_and_txids() {
        let msg = Message::Pong(PongMsg {
            nonce: 5,
            addresses: vec![SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 9186)],
            txids: vec![[3u8; 32], [4u8; 32]],
        });
        assert_eq!(round_trip(msg.clone()), msg);
    }

    #[test]
    fn corrupted_frame_fails_verify() {
        let msg = Message::Txreq(TxreqMsg {
            txids: vec![[9u8; 32]],
        });
        let mut frame = msg.frame();
        let last = frame.len() - 1;
        frame[last] ^= 0xff;
        assert!(!Rcvbuffer::new(frame).verify());
    }

    #[test]
    fn unknown_code_is_an_offense() {
        let mut body = Encoder::new();
        body.u8(0);
        let body = body.into_bytes();
        let mut out = Encoder::new();
        out.u8(99);
        out.u32(body.len() as u32);
        out.bytes(&checksum4(&body));
        out.bytes(&body);
        let rcv = Rcvbuffer::new(out.into_bytes());
        assert!(rcv.verify());
        assert_eq!(rcv.parse(), Err(ErrorCode::MsgType));
    }

    #[test]
    fn trailing_bytes_rejected() {
        let msg = Message::Blockreq(BlockreqMsg {
            nonce: 1,
            lower: 5,
            upper: 9,
        });
        let mut frame = msg.frame();
        frame.push(0xab);
        // length field no longer matches
        assert!(!Rcvbuffer::new(frame.clone()).verify());
        // fix up length + checksum so only the body is oversized
        let body_len = (frame.len() - FRAME_OVERHEAD) as u32;
        frame[1..5].copy_from_slice(&body_len.to_le_bytes());
        let digest = checksum4(&frame[FRAME_OVERHEAD..]);
        frame[5..9].copy_from_slice(&digest);
        let rcv = Rcvbuffer::new(frame);
        assert!(rcv.verify());
        assert_eq!(rcv.parse(), Err(ErrorCode::Malformed));
    }
}
