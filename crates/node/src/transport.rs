use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::wire::Rcvbuffer;

pub type Sndbuffer = Vec<u8>;

// Transport-side connection handle. Framing, TLS and dialing live behind
// this seam; the event loop only sends buffers and asks for received frames.
pub trait Conn: Send + Sync {
    fn id(&self) -> u64;
    fn peer_addr(&self) -> SocketAddr;
    // unix seconds
    fn connected_since(&self) -> u64;
    fn inbound(&self) -> bool;
    fn asyncsend(&self, buffer: Sndbuffer);
    fn async_close(&self, reason: i32);
    fn extract_messages(&self) -> Vec<Rcvbuffer>;
}

// Lifecycle latches shared between transport threads (which enqueue events
// holding this) and the loop thread (the only writer). Both latch exactly
// once.
pub struct Link {
    conn: Arc<dyn Conn>,
    registered: AtomicBool,
    erased: AtomicBool,
}

impl Link {
    pub fn new(conn: Arc<dyn Conn>) -> Arc<Self> {
        Arc::new(Self {
            conn,
            registered: AtomicBool::new(false),
            erased: AtomicBool::new(false),
        })
    }

    pub fn conn(&self) -> &dyn Conn {
        self.conn.as_ref()
    }

    pub fn id(&self) -> u64 {
        self.conn.id()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.conn.peer_addr()
    }

    pub fn registered(&self) -> bool {
        self.registered.load(Ordering::Acquire)
    }

    pub(crate) fn set_registered(&self) {
        self.registered.store(true, Ordering::Release);
    }

    pub fn erased(&self) -> bool {
        self.erased.load(Ordering::Acquire)
    }

    pub(crate) fn set_erased(&self) {
        self.erased.store(true, Ordering::Release);
    }

    // No sends to erased peers, ever.
    pub fn send(&self, buffer: Sndbuffer) {
        if !self.erased() {
            self.conn.asyncsend(buffer);
        }
    }
}
