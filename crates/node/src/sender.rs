use std::time::Instant;

use rand::RngCore;

use crate::config::NodeConfig;
use crate::peer::{BatchRequest, BlockRequest, JobData, ProbeRequest};
use crate::registry::Registry;
use crate::timer::{Timer, TimerEvent};
use crate::wire::{BatchreqMsg, BlockreqMsg, Message, ProbereqMsg};

// Bundles the loop state a downloader needs to hand out work. Every send
// occupies the peer's single job slot and one global active-request slot.
pub struct RequestSender<'a> {
    pub registry: &'a mut Registry,
    pub timer: &'a mut Timer,
    pub active_requests: &'a mut usize,
    pub max_requests: usize,
    pub config: &'a NodeConfig,
    pub log_communication: bool,
}

impl RequestSender<'_> {
    pub fn finished(&self) -> bool {
        *self.active_requests >= self.max_requests
    }

    pub fn peer_idle(&self, conn_id: u64) -> bool {
        self.registry
            .get(conn_id)
            .map(|peer| peer.initialized() && peer.job.is_idle() && !peer.link.erased())
            .unwrap_or(false)
    }

    fn nonce() -> u64 {
        rand::thread_rng().next_u64()
    }

    pub fn send_probe(&mut self, conn_id: u64, descriptor: u32, height: u32) -> bool {
        if self.finished() || !self.peer_idle(conn_id) {
            return false;
        }
        let req = ProbeRequest {
            nonce: Self::nonce(),
            descriptor,
            height,
        };
        let expiry = self.timer.insert(
            Instant::now() + self.config.job_expiry(),
            TimerEvent::Expire { conn_id },
        );
        let peer = self.registry.get_mut(conn_id).expect("checked above");
        peer.job
            .assign(JobData::Probe(req), expiry, self.active_requests);
        if self.log_communication {
            log_info!("[{}] send probereq d:{} h:{}", conn_id, descriptor, height);
        }
        peer.send(
            Message::Probereq(ProbereqMsg {
                nonce: req.nonce,
                descriptor,
                height,
            })
            .frame(),
        );
        true
    }

    pub fn send_batch(
        &mut self,
        conn_id: u64,
        descriptor: u32,
        start_height: u32,
        length: u32,
    ) -> bool {
        if self.finished() || !self.peer_idle(conn_id) || length == 0 {
            return false;
        }
        let req = BatchRequest {
            nonce: Self::nonce(),
            descriptor,
            start_height,
            length,
            min_return: length,
            max_return: length,
        };
        let expiry = self.timer.insert(
            Instant::now() + self.config.job_expiry(),
            TimerEvent::Expire { conn_id },
        );
        let peer = self.registry.get_mut(conn_id).expect("checked above");
        peer.job
            .assign(JobData::Batch(req), expiry, self.active_requests);
        if self.log_communication {
            log_info!(
                "[{}] send batchreq [{},{}]",
                conn_id,
                start_height,
                req.end()
            );
        }
        peer.send(
            Message::Batchreq(BatchreqMsg {
                nonce: req.nonce,
                descriptor,
                start_height,
                length,
            })
            .frame(),
        );
        true
    }

    pub fn send_block(&mut self, conn_id: u64, lower: u32, upper: u32) -> bool {
        if self.finished() || !self.peer_idle(conn_id) || lower == 0 || lower > upper {
            return false;
        }
        let req = BlockRequest {
            nonce: Self::nonce(),
            lower,
            upper,
        };
        let expiry = self.timer.insert(
            Instant::now() + self.config.job_expiry(),
            TimerEvent::Expire { conn_id },
        );
        let peer = self.registry.get_mut(conn_id).expect("checked above");
        peer.job
            .assign(JobData::Block(req), expiry, self.active_requests);
        if self.log_communication {
            log_info!("[{}] send blockreq [{},{}]", conn_id, lower, upper);
        }
        peer.send(
            Message::Blockreq(BlockreqMsg {
                nonce: req.nonce,
                lower,
                upper,
            })
            .frame(),
        );
        true
    }
}
