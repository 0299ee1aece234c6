use basalt_primitives::{Header, Height};

use crate::snapshot::SignedSnapshot;

// Payloads the chain server sends back into the event loop after it
// validated new data. `Append` extends consensus, `Fork` replaces a suffix,
// `RollbackData` shrinks it under the authority of a signed snapshot.

#[derive(Clone, Debug)]
pub struct Append {
    pub headers: Vec<Header>,
}

#[derive(Clone, Debug)]
pub struct Fork {
    pub fork_height: Height,
    pub headers: Vec<Header>,
}

#[derive(Clone, Debug)]
pub struct RollbackData {
    pub snapshot: SignedSnapshot,
    pub shrink_length: Height,
}

#[derive(Clone, Debug)]
pub enum ChainstateUpdate {
    Append(Append),
    Fork(Fork),
    Rollback(RollbackData),
}
