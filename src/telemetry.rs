use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, SyncSender, TrySendError, sync_channel};
use std::sync::Arc;
use std::time::SystemTime;

use log::warn;

// One per-tick record for offline consumers (plotters, analyzers). Produced
// by the control loop, consumed outside of it.
#[derive(Debug, Clone)]
pub struct TickRecord {
    pub timestamp: SystemTime,
    pub loop_index: u64,
    pub theta_n: f64,
    pub omega_n: f64,
    // (firing strength, crisp output) per active rule, in rule order.
    pub rule_outputs: Option<Vec<(f64, f64)>>,
    pub motor_cmd: f64,
}

pub trait TelemetrySink: Send {
    fn record(&self, record: TickRecord);
}

// Bounded, non-blocking sink. When the consumer lags, records are dropped
// and counted; the control loop never waits.
pub struct BoundedSink {
    sender: SyncSender<TickRecord>,
    dropped: Arc<AtomicU64>,
}

impl BoundedSink {
    pub fn new(capacity: usize) -> (BoundedSink, Receiver<TickRecord>) {
        let (sender, receiver) = sync_channel(capacity);
        (BoundedSink{sender, dropped: Arc::new(AtomicU64::new(0))}, receiver)
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl TelemetrySink for BoundedSink {
    fn record(&self, record: TickRecord) {
        match self.sender.try_send(record) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped == 1 || dropped % 1000 == 0 {
                    warn!("Telemetry consumer lagging; {} record(s) dropped",
                          dropped);
                }
            }
        }
    }
}

// mod tests.
