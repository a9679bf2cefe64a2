//! Metrics sink
//!
//! Components receive a [`MetricsSink`] handle at construction instead of
//! reaching for a global recorder. Tests use [`NoopMetrics`].

use std::sync::Arc;

/// Destination for counters and gauges
pub trait MetricsSink: Send + Sync {
    fn incr_counter(&self, name: &'static str, value: u64);
    fn set_gauge(&self, name: &'static str, value: f64);
}

/// Discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn incr_counter(&self, _name: &'static str, _value: u64) {}
    fn set_gauge(&self, _name: &'static str, _value: f64) {}
}

/// Forwards to whatever recorder is installed for the `metrics` facade
#[derive(Debug, Default, Clone, Copy)]
pub struct RecorderMetrics;

impl MetricsSink for RecorderMetrics {
    fn incr_counter(&self, name: &'static str, value: u64) {
        ::metrics::counter!(name).increment(value);
    }

    fn set_gauge(&self, name: &'static str, value: f64) {
        ::metrics::gauge!(name).set(value);
    }
}

/// Shared handle type
pub type SharedMetrics = Arc<dyn MetricsSink>;

/// The no-op handle
pub fn noop() -> SharedMetrics {
    Arc::new(NoopMetrics)
}

pub const BLOCKS_CONNECTED: &str = "ledger_blocks_connected";
pub const BLOCKS_REJECTED: &str = "ledger_blocks_rejected";
pub const ORPHAN_BLOCKS: &str = "ledger_orphan_blocks";
pub const REORGS: &str = "ledger_reorgs";
pub const REORGS_REJECTED: &str = "ledger_reorgs_rejected";
pub const TXS_ACCEPTED: &str = "ledger_txs_accepted";
pub const TXS_REJECTED: &str = "ledger_txs_rejected";
pub const TXS_EXPIRED: &str = "ledger_txs_expired";
pub const CHECKPOINTS_CREATED: &str = "ledger_checkpoints_created";
pub const CHECKPOINTS_REJECTED: &str = "ledger_checkpoints_rejected";
pub const CHAIN_HEIGHT: &str = "ledger_chain_height";
pub const MEMPOOL_SIZE: &str = "ledger_mempool_size";

#[cfg(test)]
pub(crate) mod testing {
    use super::MetricsSink;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    /// Records counters so tests can assert on them
    #[derive(Debug, Default)]
    pub struct CountingMetrics {
        pub counters: Mutex<HashMap<&'static str, u64>>,
    }

    impl CountingMetrics {
        pub fn get(&self, name: &'static str) -> u64 {
            self.counters.lock().get(name).copied().unwrap_or(0)
        }
    }

    impl MetricsSink for CountingMetrics {
        fn incr_counter(&self, name: &'static str, value: u64) {
            *self.counters.lock().entry(name).or_insert(0) += value;
        }

        fn set_gauge(&self, _name: &'static str, _value: f64) {}
    }
}
