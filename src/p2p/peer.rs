//! Peer identity as seen by the ledger
//!
//! Connection management belongs to the transport. The ledger only needs to
//! know who sent a message, which network group they are in and whether
//! they keep sending garbage.

use std::net::IpAddr;

use crate::checkpoint::{network_group, NetworkGroup};
use super::protocol::OutboundMessage;

/// Misbehavior score at which a peer should be dropped
pub const BAN_THRESHOLD: u32 = 100;

/// Information about a peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub id: String,
    pub addr: IpAddr,
    /// Misbehavior score (100 = ban)
    pub misbehavior_score: u32,
}

impl PeerInfo {
    pub fn new(id: impl Into<String>, addr: IpAddr) -> Self {
        Self {
            id: id.into(),
            addr,
            misbehavior_score: 0,
        }
    }

    pub fn network_group(&self) -> NetworkGroup {
        network_group(&self.addr)
    }

    /// Add misbehavior points
    pub fn add_misbehavior(&mut self, points: u32) {
        self.misbehavior_score = self.misbehavior_score.saturating_add(points);
    }

    /// Charge the peer for every rejection in a reply batch
    pub fn charge_rejections(&mut self, replies: &[OutboundMessage]) {
        for reply in replies {
            if let OutboundMessage::Reject(reject) = reply {
                self.add_misbehavior(reject.code.misbehavior());
            }
        }
    }

    /// Check if peer should be banned
    pub fn should_ban(&self) -> bool {
        self.misbehavior_score >= BAN_THRESHOLD
    }
}
