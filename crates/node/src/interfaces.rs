use std::net::SocketAddr;

use basalt_chain::{ChainstateUpdate, SignedSnapshot, StageAndConsensus};
use basalt_primitives::{BodyContainer, Header, Height};

use crate::error::ErrorCode;
use crate::mempool;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BatchSelector {
    pub descriptor: u32,
    pub start_height: Height,
    pub length: u32,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BlockRange {
    pub lower: Height,
    pub upper: Height,
}

// A contiguous chunk of the stage chain with its bodies, handed to the
// chain server for validation.
#[derive(Clone, Debug)]
pub struct StageRequest {
    pub lower: Height,
    pub headers: Vec<Header>,
    pub bodies: Vec<BodyContainer>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StageResult {
    Applied { until: Height },
    Rejected { height: Height },
}

// Envelope the chain server posts back into the loop after each state
// transition it performs.
pub struct StateUpdate {
    pub mempool_log: mempool::Log,
    pub chainstate: ChainstateUpdate,
}

// The §6 collaborators, injected at construction. The loop never reaches
// into an ambient registry for them.

pub trait ChainServer: Send {
    fn get_chainstate(&self) -> StageAndConsensus;
    fn get_headers(&self, selector: &BatchSelector) -> Vec<Header>;
    fn get_descriptor_header(&self, descriptor: u32, height: Height) -> Option<Header>;
    fn async_get_blocks(
        &self,
        range: BlockRange,
        reply: Box<dyn FnOnce(Vec<BodyContainer>) + Send>,
    );
    fn async_stage_request(&self, request: StageRequest);
    fn async_put_mempool(&self, txs: Vec<Vec<u8>>);
    fn async_set_signed_checkpoint(&self, snapshot: SignedSnapshot);
    fn shutdown_join(&mut self);
}

pub trait PeerDb: Send {
    fn async_set_synced(&self, synced: bool);
    fn report_offense(&self, addr: SocketAddr, code: ErrorCode);
    fn async_get_banned(&self, cb: Box<dyn FnOnce(Vec<SocketAddr>) + Send>);
    fn async_unban(&self, cb: Box<dyn FnOnce(bool) + Send>);
}

pub trait Dialer: Send {
    fn async_connect(&self, addr: SocketAddr);
}
