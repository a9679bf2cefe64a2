//! Checkpoint persistence and acceptance policy

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::config::CheckpointConfig;
use crate::consensus::ChainWork;
use crate::crypto::{canonical_hash, Hash, PrivateKey, PublicKey};
use super::sync::{network_group, PeerReport};
use super::{CheckpointError, CheckpointMetadata, CheckpointPayload};

const FILE_PREFIX: &str = "checkpoint_";

/// Local checkpoints plus the rules for trusting a peer's
#[derive(Debug)]
pub struct CheckpointManager {
    dir: Option<PathBuf>,
    config: CheckpointConfig,
    trusted: Vec<PublicKey>,
    signing_key: Option<PrivateKey>,
    recorded: BTreeMap<u64, CheckpointMetadata>,
    /// Most recent payload, kept so in-memory ledgers can export it
    latest: Option<CheckpointPayload>,
    /// Latest unsolicited report per peer
    peer_reports: HashMap<String, PeerReport>,
}

impl CheckpointManager {
    /// Load every valid checkpoint in `dir`. `None` keeps checkpoints in
    /// memory only.
    pub fn new(dir: Option<PathBuf>, config: &CheckpointConfig) -> Result<Self, CheckpointError> {
        let mut trusted = config.trusted_keys()?;
        let signing_key = match &config.signing_key {
            Some(hex) => Some(PrivateKey::from_hex(hex)?),
            None => None,
        };
        if let Some(key) = &signing_key {
            let own = key.public_key();
            if !trusted.contains(&own) {
                trusted.push(own);
            }
        }

        let mut manager = Self {
            dir,
            config: config.clone(),
            trusted,
            signing_key,
            recorded: BTreeMap::new(),
            latest: None,
            peer_reports: HashMap::new(),
        };
        manager.scan()?;
        Ok(manager)
    }

    fn scan(&mut self) -> Result<(), CheckpointError> {
        let Some(dir) = self.dir.clone() else {
            return Ok(());
        };
        if !dir.exists() {
            return Ok(());
        }
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if parse_height(&path).is_none() {
                continue;
            }
            match self.read_verified(&path) {
                Ok(payload) => {
                    self.recorded.insert(payload.height, payload.metadata());
                }
                Err(e) => warn!(event = "checkpoint skipped", path = %path.display(), error = %e),
            }
        }
        debug!(event = "checkpoints loaded", count = self.recorded.len());
        Ok(())
    }

    fn read_verified(&self, path: &Path) -> Result<CheckpointPayload, CheckpointError> {
        let payload: CheckpointPayload = serde_json::from_slice(&fs::read(path)?)?;
        payload.verify_integrity()?;
        payload.verify_signature(&self.trusted)?;
        Ok(payload)
    }

    pub fn config(&self) -> &CheckpointConfig {
        &self.config
    }

    pub fn trusted_signers(&self) -> &[PublicKey] {
        &self.trusted
    }

    pub fn path_for(&self, height: u64) -> Option<PathBuf> {
        self.dir
            .as_ref()
            .map(|dir| dir.join(format!("{FILE_PREFIX}{height}.json")))
    }

    /// Whether a checkpoint is due at `height`
    pub fn is_due(&self, height: u64) -> bool {
        height > 0 && height % self.config.interval == 0 && !self.recorded.contains_key(&height)
    }

    /// Sign with the node key, if one is configured
    pub fn sign_if_configured(&self, payload: &mut CheckpointPayload) -> Result<(), CheckpointError> {
        if let Some(key) = &self.signing_key {
            payload.sign(key)?;
        }
        Ok(())
    }

    /// Persist a payload and remember it
    pub fn record(&mut self, payload: CheckpointPayload) -> Result<(), CheckpointError> {
        if let Some(path) = self.path_for(payload.height) {
            let tmp = path.with_extension("json.tmp");
            fs::write(&tmp, serde_json::to_vec_pretty(&payload)?)?;
            fs::rename(&tmp, &path)?;
        }
        info!(
            event = "checkpoint recorded",
            height = payload.height,
            hash = %payload.block_hash,
            signed = payload.is_signed()
        );
        self.recorded.insert(payload.height, payload.metadata());
        if self.latest.as_ref().map_or(true, |l| l.height <= payload.height) {
            self.latest = Some(payload);
        }
        Ok(())
    }

    /// Full payload at `height`, verified
    pub fn load(&self, height: u64) -> Result<Option<CheckpointPayload>, CheckpointError> {
        if let Some(latest) = self.latest.as_ref().filter(|l| l.height == height) {
            return Ok(Some(latest.clone()));
        }
        if !self.recorded.contains_key(&height) {
            return Ok(None);
        }
        match self.path_for(height) {
            Some(path) if path.exists() => self.read_verified(&path).map(Some),
            _ => Ok(None),
        }
    }

    pub fn latest_metadata(&self) -> Option<CheckpointMetadata> {
        self.recorded.values().next_back().copied()
    }

    pub fn metadata_at(&self, height: u64) -> Option<CheckpointMetadata> {
        self.recorded.get(&height).copied()
    }

    /// Height of the newest checkpoint, 0 when there is none
    pub fn highest_height(&self) -> u64 {
        self.recorded.keys().next_back().copied().unwrap_or(0)
    }

    /// Most work any recorded checkpoint declares
    pub fn highest_work(&self) -> ChainWork {
        self.recorded
            .values()
            .filter_map(|m| m.work)
            .max()
            .unwrap_or(ChainWork::ZERO)
    }

    /// Newest checkpoint whose block is on the active chain
    pub fn latest_on_chain<F>(&self, on_chain: F) -> Option<CheckpointPayload>
    where
        F: Fn(u64, &Hash) -> bool,
    {
        for meta in self.recorded.values().rev() {
            if !on_chain(meta.height, &meta.block_hash) {
                continue;
            }
            match self.load(meta.height) {
                Ok(Some(payload)) => return Some(payload),
                Ok(None) => {}
                Err(e) => warn!(event = "checkpoint unreadable", height = meta.height, error = %e),
            }
        }
        None
    }

    /// Forget every checkpoint. Files are removed by the caller.
    pub fn clear(&mut self) {
        self.recorded.clear();
        self.latest = None;
        self.peer_reports.clear();
    }

    /// Remember a checkpoint a peer pushed to us, replacing its previous
    /// one. Returns every report held.
    pub fn note_peer_report(&mut self, report: PeerReport) -> Vec<PeerReport> {
        self.peer_reports.insert(report.peer_id.clone(), report);
        self.peer_reports.values().cloned().collect()
    }

    pub fn clear_peer_reports(&mut self) {
        self.peer_reports.clear();
    }

    /// Verify a single payload against local policy
    pub fn verify_payload(&self, payload: &CheckpointPayload) -> Result<(), CheckpointError> {
        payload.verify_integrity()?;
        let local = self.highest_work();
        if payload.declared_work() < local {
            return Err(CheckpointError::LowerWork {
                offered: payload.declared_work(),
                local,
            });
        }
        payload.verify_signature(&self.trusted)
    }

    /// Pick the payload enough independent peers agree on
    ///
    /// Reports whose payload fails its integrity check are dropped before
    /// counting. The rest are grouped by identical payload; a group
    /// qualifies when it has `min_peers` distinct peers spread over
    /// `min_peer_groups` network groups. Qualifying groups are tried
    /// highest first and the first one that passes local policy wins.
    pub fn select_peer_checkpoint(&self, reports: &[PeerReport]) -> Result<CheckpointPayload, CheckpointError> {
        if reports.is_empty() {
            return Err(CheckpointError::NoReports);
        }

        let mut rejected = None;
        let mut groups: HashMap<Hash, (CheckpointPayload, HashSet<&str>, HashSet<_>)> = HashMap::new();
        for report in reports {
            if let Err(e) = report.payload.verify_integrity() {
                debug!(event = "peer checkpoint dropped", peer = %report.peer_id, height = report.payload.height, error = %e);
                rejected.get_or_insert(e);
                continue;
            }
            let key = canonical_hash(&report.payload)?;
            let entry = groups
                .entry(key)
                .or_insert_with(|| (report.payload.clone(), HashSet::new(), HashSet::new()));
            entry.1.insert(report.peer_id.as_str());
            entry.2.insert(network_group(&report.addr));
        }

        let mut candidates: Vec<_> = groups.into_values().collect();
        candidates.sort_by(|a, b| b.0.height.cmp(&a.0.height).then(b.1.len().cmp(&a.1.len())));

        let mut shortfall = None;
        for (payload, peers, nets) in candidates {
            if peers.len() < self.config.min_peers {
                shortfall.get_or_insert(CheckpointError::InsufficientPeers {
                    agreeing: peers.len(),
                    required: self.config.min_peers,
                });
                continue;
            }
            if nets.len() < self.config.min_peer_groups {
                shortfall.get_or_insert(CheckpointError::InsufficientGroups {
                    groups: nets.len(),
                    required: self.config.min_peer_groups,
                });
                continue;
            }
            match self.verify_payload(&payload) {
                Ok(()) => return Ok(payload),
                Err(e) => {
                    warn!(event = "agreed checkpoint refused", height = payload.height, error = %e);
                    rejected.get_or_insert(e);
                }
            }
        }
        Err(shortfall.or(rejected).unwrap_or(CheckpointError::NoReports))
    }
}

fn parse_height(path: &Path) -> Option<u64> {
    let name = path.file_name()?.to_str()?;
    name.strip_prefix(FILE_PREFIX)?.strip_suffix(".json")?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::tests::payload;
    use std::net::IpAddr;

    fn config(min_peers: usize, min_peer_groups: usize) -> CheckpointConfig {
        CheckpointConfig {
            interval: 10,
            min_peers,
            min_peer_groups,
            ..CheckpointConfig::default()
        }
    }

    fn report(peer: &str, addr: &str, payload: &CheckpointPayload) -> PeerReport {
        PeerReport {
            peer_id: peer.to_string(),
            addr: addr.parse::<IpAddr>().unwrap(),
            payload: payload.clone(),
        }
    }

    #[test]
    fn test_record_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = CheckpointManager::new(Some(dir.path().to_path_buf()), &config(1, 1)).unwrap();
        manager.record(payload(10)).unwrap();
        manager.record(payload(20)).unwrap();
        fs::write(dir.path().join("checkpoint_30.json"), b"not json").unwrap();
        fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();

        let reloaded = CheckpointManager::new(Some(dir.path().to_path_buf()), &config(1, 1)).unwrap();
        assert_eq!(reloaded.highest_height(), 20);
        assert_eq!(reloaded.load(10).unwrap(), Some(payload(10)));
        assert_eq!(reloaded.load(30).unwrap(), None);
        assert!(!reloaded.is_due(20));
        assert!(reloaded.is_due(40));
    }

    #[test]
    fn test_latest_on_chain_skips_foreign_blocks() {
        let mut manager = CheckpointManager::new(None, &config(1, 1)).unwrap();
        manager.record(payload(10)).unwrap();
        manager.record(payload(20)).unwrap();
        let found = manager.latest_on_chain(|height, _| height == 20).unwrap();
        assert_eq!(found.height, 20);
        assert!(manager.latest_on_chain(|_, _| false).is_none());
    }

    #[test]
    fn test_quorum_requires_distinct_groups() {
        let manager = CheckpointManager::new(None, &config(3, 2)).unwrap();
        let p = payload(50);

        let same_subnet = vec![
            report("a", "10.1.0.1", &p),
            report("b", "10.1.0.2", &p),
            report("c", "10.1.9.9", &p),
        ];
        assert!(matches!(
            manager.select_peer_checkpoint(&same_subnet),
            Err(CheckpointError::InsufficientGroups { groups: 1, required: 2 })
        ));

        let spread = vec![
            report("a", "10.1.0.1", &p),
            report("b", "10.1.0.2", &p),
            report("c", "192.168.4.4", &p),
        ];
        assert_eq!(manager.select_peer_checkpoint(&spread).unwrap(), p);
    }

    #[test]
    fn test_repeated_peer_counts_once() {
        let manager = CheckpointManager::new(None, &config(2, 1)).unwrap();
        let p = payload(50);
        let reports = vec![report("a", "10.0.0.1", &p), report("a", "10.0.0.1", &p)];
        assert!(matches!(
            manager.select_peer_checkpoint(&reports),
            Err(CheckpointError::InsufficientPeers { agreeing: 1, required: 2 })
        ));
        assert!(matches!(manager.select_peer_checkpoint(&[]), Err(CheckpointError::NoReports)));
    }

    #[test]
    fn test_lower_work_rejected() {
        let mut manager = CheckpointManager::new(None, &config(1, 1)).unwrap();
        let mut strong = payload(10);
        strong.work = Some(ChainWork(1 << 40));
        manager.record(strong).unwrap();

        let weak = payload(60);
        assert!(matches!(
            manager.select_peer_checkpoint(&[report("a", "1.2.3.4", &weak)]),
            Err(CheckpointError::LowerWork { .. })
        ));
    }

    #[test]
    fn test_tampered_peer_payload_rejected() {
        let manager = CheckpointManager::new(None, &config(1, 1)).unwrap();
        let mut bad = payload(10);
        bad.data.total_supply += 7;
        assert!(matches!(
            manager.select_peer_checkpoint(&[report("a", "1.2.3.4", &bad)]),
            Err(CheckpointError::StateHashMismatch { .. })
        ));
    }

    #[test]
    fn test_corrupt_copy_does_not_count_toward_quorum() {
        let manager = CheckpointManager::new(None, &config(2, 2)).unwrap();
        let honest = payload(10);
        let mut corrupt = honest.clone();
        corrupt.data.nonce ^= 1;
        assert!(corrupt.verify_integrity().is_err());

        assert!(matches!(
            manager.select_peer_checkpoint(&[report("a", "10.0.0.1", &honest), report("b", "192.168.1.1", &corrupt)]),
            Err(CheckpointError::InsufficientPeers { agreeing: 1, required: 2 })
        ));

        // a corrupt copy arriving first does not spoil an honest quorum
        let reports = [
            report("b", "192.168.1.1", &corrupt),
            report("a", "10.0.0.1", &honest),
            report("c", "172.16.0.1", &honest),
        ];
        assert_eq!(manager.select_peer_checkpoint(&reports).unwrap(), honest);
    }

    #[test]
    fn test_refused_candidate_falls_through_to_next() {
        let manager = CheckpointManager::new(None, &config(1, 1)).unwrap();
        let good = payload(10);
        let mut signed = payload(20);
        signed.sign(&PrivateKey::generate()).unwrap();
        let reports = [report("a", "10.0.0.1", &signed), report("b", "10.9.0.1", &good)];
        assert_eq!(manager.select_peer_checkpoint(&reports).unwrap(), good);
    }

    #[test]
    fn test_pushed_reports_reach_quorum() {
        let mut manager = CheckpointManager::new(None, &config(2, 2)).unwrap();
        let p = payload(50);
        let held = manager.note_peer_report(report("a", "10.0.0.1", &p));
        assert!(manager.select_peer_checkpoint(&held).is_err());
        manager.note_peer_report(report("a", "10.0.0.1", &p));
        let held = manager.note_peer_report(report("b", "172.16.0.1", &p));
        assert_eq!(held.len(), 2);
        assert_eq!(manager.select_peer_checkpoint(&held).unwrap(), p);
        manager.clear_peer_reports();
        assert_eq!(manager.note_peer_report(report("c", "1.1.1.1", &p)).len(), 1);
    }

    #[test]
    fn test_own_key_signs_and_is_trusted() {
        let key = PrivateKey::generate();
        let cfg = CheckpointConfig {
            signing_key: Some(hex::encode(key.to_bytes())),
            ..config(1, 1)
        };
        let manager = CheckpointManager::new(None, &cfg).unwrap();
        let mut p = payload(10);
        manager.sign_if_configured(&mut p).unwrap();
        assert!(p.is_signed());
        assert!(manager.verify_payload(&p).is_ok());
    }
}
