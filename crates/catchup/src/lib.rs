//! Per-peer reputation tracking for catchup source selection.
//!
//! Every peer carries a floating-point reputation in [0, 100], starting at
//! 50. Successful requests raise it, failures lower it, and a detected
//! malicious act zeroes it permanently enough that the peer is never trusted
//! again until operators intervene. The registry decides which peers may be
//! asked to supply missing blocks and subtrees.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};

pub const INITIAL_REPUTATION: f64 = 50.0;

const SUCCESS_REWARD: f64 = 10.0;
const FAILURE_PENALTY: f64 = 2.0;
const MAX_REPUTATION: f64 = 100.0;
const TRUSTED_THRESHOLD: f64 = 50.0;
const BAD_THRESHOLD: f64 = 10.0;

#[derive(Clone, Debug)]
pub struct PeerStats {
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub total_requests: u64,
    pub reputation: f64,
    pub malicious_attempts: u64,
    pub consecutive_failures: u32,
    pub average_response_time: Duration,
    pub last_response_time: Duration,
    pub last_success: Option<SystemTime>,
    pub last_failure: Option<SystemTime>,
}

impl Default for PeerStats {
    fn default() -> Self {
        Self {
            successful_requests: 0,
            failed_requests: 0,
            total_requests: 0,
            reputation: INITIAL_REPUTATION,
            malicious_attempts: 0,
            consecutive_failures: 0,
            average_response_time: Duration::ZERO,
            last_response_time: Duration::ZERO,
            last_success: None,
            last_failure: None,
        }
    }
}

pub struct PeerRecord {
    peer_id: String,
    stats: RwLock<PeerStats>,
}

impl PeerRecord {
    fn new(peer_id: String) -> Self {
        Self {
            peer_id,
            stats: RwLock::new(PeerStats::default()),
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn record_success(&self) {
        let mut stats = self.stats.write().expect("peer stats lock");
        apply_success(&mut stats, None);
    }

    /// Records a failed request. This is the only place
    /// `consecutive_failures` is incremented.
    pub fn record_failure(&self) {
        let mut stats = self.stats.write().expect("peer stats lock");
        apply_failure(&mut stats);
    }

    pub fn record_malicious(&self) {
        let mut stats = self.stats.write().expect("peer stats lock");
        stats.malicious_attempts += 1;
        stats.reputation = 0.0;
        drop(stats);
        bsvd_log::log_warn!("peer {} flagged malicious", self.peer_id);
    }

    /// Success/failure bookkeeping plus response-time tracking. Delegates to
    /// the same transitions as `record_success`/`record_failure`, so calling
    /// either entry point counts an event exactly once.
    pub fn update_reputation(&self, success: bool, response_time: Duration) {
        let mut stats = self.stats.write().expect("peer stats lock");
        if success {
            apply_success(&mut stats, Some(response_time));
        } else {
            apply_failure(&mut stats);
        }
    }

    pub fn is_trusted(&self) -> bool {
        let stats = self.stats.read().expect("peer stats lock");
        stats.reputation > TRUSTED_THRESHOLD && stats.malicious_attempts == 0
    }

    pub fn is_malicious(&self) -> bool {
        let stats = self.stats.read().expect("peer stats lock");
        stats.reputation < BAD_THRESHOLD && stats.malicious_attempts > 0
    }

    pub fn is_bad(&self) -> bool {
        let stats = self.stats.read().expect("peer stats lock");
        stats.reputation < BAD_THRESHOLD
    }

    pub fn reputation(&self) -> f64 {
        self.stats.read().expect("peer stats lock").reputation
    }

    pub fn stats(&self) -> PeerStats {
        self.stats.read().expect("peer stats lock").clone()
    }
}

fn apply_success(stats: &mut PeerStats, response_time: Option<Duration>) {
    if let Some(elapsed) = response_time {
        // Weighted rolling average over the successes seen so far.
        let n = stats.successful_requests as u32;
        stats.average_response_time = if n == 0 {
            elapsed
        } else {
            (stats.average_response_time * n + elapsed) / (n + 1)
        };
        stats.last_response_time = elapsed;
    }
    stats.successful_requests += 1;
    stats.total_requests += 1;
    stats.consecutive_failures = 0;
    stats.last_success = Some(SystemTime::now());
    stats.reputation = (stats.reputation + SUCCESS_REWARD).min(MAX_REPUTATION);
}

fn apply_failure(stats: &mut PeerStats) {
    stats.failed_requests += 1;
    stats.total_requests += 1;
    stats.consecutive_failures += 1;
    stats.last_failure = Some(SystemTime::now());
    stats.reputation = (stats.reputation - FAILURE_PENALTY).max(0.0);
}

/// Registry of peer reputation records.
///
/// `get_or_create` is the only mutation of the map itself and takes the
/// write lock; everything else reads. Per-peer state lives behind each
/// record's own lock, so score updates on one peer never block reads of
/// another.
#[derive(Default)]
pub struct PeerRegistry {
    peers: RwLock<HashMap<String, Arc<PeerRecord>>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&self, peer_id: &str) -> Arc<PeerRecord> {
        {
            let peers = self.peers.read().expect("peer registry lock");
            if let Some(record) = peers.get(peer_id) {
                return Arc::clone(record);
            }
        }
        let mut peers = self.peers.write().expect("peer registry lock");
        Arc::clone(
            peers
                .entry(peer_id.to_string())
                .or_insert_with(|| Arc::new(PeerRecord::new(peer_id.to_string()))),
        )
    }

    pub fn get(&self, peer_id: &str) -> Option<Arc<PeerRecord>> {
        let peers = self.peers.read().expect("peer registry lock");
        peers.get(peer_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.peers.read().expect("peer registry lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Peers eligible to serve catchup requests, best reputation first.
    /// Bad peers are excluded entirely.
    pub fn preferred(&self, limit: usize) -> Vec<Arc<PeerRecord>> {
        if limit == 0 {
            return Vec::new();
        }
        let peers = self.peers.read().expect("peer registry lock");
        let mut candidates: Vec<(f64, Arc<PeerRecord>)> = peers
            .values()
            .filter(|record| !record.is_bad())
            .map(|record| (record.reputation(), Arc::clone(record)))
            .collect();
        drop(peers);
        candidates.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        candidates.truncate(limit);
        candidates.into_iter().map(|(_, record)| record).collect()
    }

    pub fn snapshot(&self) -> Vec<(String, PeerStats)> {
        let peers = self.peers.read().expect("peer registry lock");
        peers
            .iter()
            .map(|(peer_id, record)| (peer_id.clone(), record.stats()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_peer_starts_neutral() {
        let registry = PeerRegistry::new();
        let peer = registry.get_or_create("peer-a");
        assert_eq!(peer.reputation(), INITIAL_REPUTATION);
        assert!(!peer.is_trusted());
        assert!(!peer.is_bad());
        assert!(!peer.is_malicious());
    }

    #[test]
    fn get_or_create_returns_same_record() {
        let registry = PeerRegistry::new();
        let first = registry.get_or_create("peer-a");
        first.record_success();
        let second = registry.get_or_create("peer-a");
        assert_eq!(second.stats().successful_requests, 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn success_failure_malicious_sequence() {
        let registry = PeerRegistry::new();
        let peer = registry.get_or_create("peer-a");
        for _ in 0..7 {
            peer.record_success();
        }
        // 50 + 7*10 caps at 100.
        assert_eq!(peer.reputation(), 100.0);
        assert!(peer.is_trusted());

        peer.record_failure();
        peer.record_failure();
        assert_eq!(peer.reputation(), 96.0);
        assert_eq!(peer.stats().consecutive_failures, 2);

        peer.record_malicious();
        assert_eq!(peer.reputation(), 0.0);
        assert!(peer.is_malicious());
        assert!(peer.is_bad());
        assert!(!peer.is_trusted());
    }

    #[test]
    fn reputation_stays_bounded() {
        let registry = PeerRegistry::new();
        let peer = registry.get_or_create("peer-a");
        for _ in 0..100 {
            peer.record_failure();
        }
        assert_eq!(peer.reputation(), 0.0);
        for _ in 0..100 {
            peer.record_success();
        }
        assert_eq!(peer.reputation(), 100.0);
    }

    #[test]
    fn success_resets_consecutive_failures() {
        let registry = PeerRegistry::new();
        let peer = registry.get_or_create("peer-a");
        peer.record_failure();
        peer.record_failure();
        peer.record_failure();
        assert_eq!(peer.stats().consecutive_failures, 3);
        peer.record_success();
        assert_eq!(peer.stats().consecutive_failures, 0);
    }

    #[test]
    fn update_reputation_counts_once_per_event() {
        let registry = PeerRegistry::new();
        let peer = registry.get_or_create("peer-a");
        peer.update_reputation(false, Duration::from_millis(80));
        let stats = peer.stats();
        assert_eq!(stats.failed_requests, 1);
        assert_eq!(stats.consecutive_failures, 1);
        assert_eq!(stats.reputation, 48.0);
    }

    #[test]
    fn rolling_average_response_time() {
        let registry = PeerRegistry::new();
        let peer = registry.get_or_create("peer-a");
        peer.update_reputation(true, Duration::from_millis(100));
        assert_eq!(peer.stats().average_response_time, Duration::from_millis(100));
        peer.update_reputation(true, Duration::from_millis(300));
        assert_eq!(peer.stats().average_response_time, Duration::from_millis(200));
        peer.update_reputation(true, Duration::from_millis(800));
        assert_eq!(peer.stats().average_response_time, Duration::from_millis(400));
        assert_eq!(peer.stats().last_response_time, Duration::from_millis(800));
    }

    #[test]
    fn preferred_orders_by_reputation_and_skips_bad() {
        let registry = PeerRegistry::new();
        let good = registry.get_or_create("good");
        good.record_success();
        good.record_success();
        let neutral = registry.get_or_create("neutral");
        let bad = registry.get_or_create("bad");
        bad.record_malicious();
        let _ = neutral;

        let preferred = registry.preferred(10);
        let ids: Vec<&str> = preferred.iter().map(|record| record.peer_id()).collect();
        assert_eq!(ids, vec!["good", "neutral"]);

        let top_one = registry.preferred(1);
        assert_eq!(top_one.len(), 1);
        assert_eq!(top_one[0].peer_id(), "good");
    }
}
