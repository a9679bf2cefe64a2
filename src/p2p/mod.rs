//! P2P message surface - decoding and peer bookkeeping

mod peer;
mod protocol;

pub use peer::*;
pub use protocol::*;
