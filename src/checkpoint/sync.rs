//! Fetching checkpoints from peers
//!
//! Peers are queried concurrently, each under its own deadline. Nothing
//! here touches the ledger: reports are collected first and handed to
//! [`crate::chain::Ledger::apply_peer_reports`] afterwards.

use async_trait::async_trait;
use futures_util::future::join_all;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use super::CheckpointPayload;

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("peer sent a malformed checkpoint: {0}")]
    Malformed(String),
}

/// A remote node that can serve its latest checkpoint
#[async_trait]
pub trait CheckpointPeer: Send + Sync {
    fn id(&self) -> String;
    fn addr(&self) -> IpAddr;
    async fn latest_checkpoint(&self) -> Result<Option<CheckpointPayload>, PeerError>;
}

/// One peer's answer
#[derive(Debug, Clone)]
pub struct PeerReport {
    pub peer_id: String,
    pub addr: IpAddr,
    pub payload: CheckpointPayload,
}

/// What applying peer reports did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The chain was re-anchored at this height
    Applied { height: u64 },
    /// The local chain is close enough to the agreed checkpoint
    UpToDate { local: u64, offered: u64 },
}

/// Network group used for peer diversity: /16 for IPv4, /32 for IPv6.
/// IPv4-mapped IPv6 addresses count as IPv4.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkGroup {
    V4([u8; 2]),
    V6([u8; 4]),
}

pub fn network_group(addr: &IpAddr) -> NetworkGroup {
    match addr {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            NetworkGroup::V4([o[0], o[1]])
        }
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => network_group(&IpAddr::V4(v4)),
            None => {
                let o = v6.octets();
                NetworkGroup::V6([o[0], o[1], o[2], o[3]])
            }
        },
    }
}

/// Ask every peer for its latest checkpoint. Peers that fail, time out or
/// have nothing are left out.
pub async fn collect_reports(peers: &[Arc<dyn CheckpointPeer>], per_peer: Duration) -> Vec<PeerReport> {
    let fetches = peers.iter().map(|peer| async move {
        match tokio::time::timeout(per_peer, peer.latest_checkpoint()).await {
            Ok(Ok(Some(payload))) => Some(PeerReport {
                peer_id: peer.id(),
                addr: peer.addr(),
                payload,
            }),
            Ok(Ok(None)) => None,
            Ok(Err(e)) => {
                debug!(event = "checkpoint fetch failed", peer = %peer.id(), error = %e);
                None
            }
            Err(_) => {
                debug!(event = "checkpoint fetch timed out", peer = %peer.id());
                None
            }
        }
    });
    join_all(fetches).await.into_iter().flatten().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::tests::payload;
    use std::net::{Ipv4Addr, Ipv6Addr};

    struct FakePeer {
        id: &'static str,
        addr: IpAddr,
        delay: Duration,
        payload: Option<CheckpointPayload>,
    }

    #[async_trait]
    impl CheckpointPeer for FakePeer {
        fn id(&self) -> String {
            self.id.to_string()
        }

        fn addr(&self) -> IpAddr {
            self.addr
        }

        async fn latest_checkpoint(&self) -> Result<Option<CheckpointPayload>, PeerError> {
            tokio::time::sleep(self.delay).await;
            match &self.payload {
                Some(p) => Ok(Some(p.clone())),
                None => Err(PeerError::Transport("connection reset".into())),
            }
        }
    }

    #[test]
    fn test_network_groups() {
        let a = network_group(&IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3)));
        let b = network_group(&IpAddr::V4(Ipv4Addr::new(10, 1, 200, 1)));
        let c = network_group(&IpAddr::V4(Ipv4Addr::new(10, 2, 2, 3)));
        assert_eq!(a, b);
        assert_ne!(a, c);

        let mapped = network_group(&IpAddr::V6(Ipv4Addr::new(10, 1, 9, 9).to_ipv6_mapped()));
        assert_eq!(mapped, a);

        let v6a = network_group(&"2001:db8:1::1".parse().unwrap());
        let v6b = network_group(&"2001:db8:ffff::1".parse().unwrap());
        let v6c = network_group(&IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb9, 0, 0, 0, 0, 0, 1)));
        assert_eq!(v6a, v6b);
        assert_ne!(v6a, v6c);
    }

    #[tokio::test]
    async fn test_slow_and_failing_peers_dropped() {
        let p = payload(10);
        let peers: Vec<Arc<dyn CheckpointPeer>> = vec![
            Arc::new(FakePeer {
                id: "fast",
                addr: "1.1.1.1".parse().unwrap(),
                delay: Duration::from_millis(10),
                payload: Some(p.clone()),
            }),
            Arc::new(FakePeer {
                id: "slow",
                addr: "2.2.2.2".parse().unwrap(),
                delay: Duration::from_secs(30),
                payload: Some(p.clone()),
            }),
            Arc::new(FakePeer {
                id: "broken",
                addr: "3.3.3.3".parse().unwrap(),
                delay: Duration::ZERO,
                payload: None,
            }),
        ];
        let reports = collect_reports(&peers, Duration::from_millis(200)).await;
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].peer_id, "fast");
        assert_eq!(reports[0].payload, p);
    }
}
