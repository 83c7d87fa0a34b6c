//! C7 — Telemetry Broadcaster: per-second `jcmp-stats` snapshots and the
//! per-5-second operator summary with counter reset (§4.7).

use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use log::info;

use crate::signaling::{ClientStats, LaneCountersSnapshot, ServerMessage};
use crate::server::Relay;

const TELEMETRY_INTERVAL: Duration = Duration::from_secs(1);
const SUMMARY_INTERVAL: Duration = Duration::from_secs(5);
/// `latencyHistory` in each `jcmp-stats` client entry is capped at this many
/// most-recent samples (§4.7).
const LATENCY_HISTORY_LEN: usize = 50;

#[derive(Default)]
pub struct LaneCounters {
    rtc_perf: AtomicU64,
    ws_immediate: AtomicU64,
}

impl LaneCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_rtc_perf(&self) {
        self.rtc_perf.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub fn record_ws_immediate(&self) {
        self.ws_immediate.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub fn snapshot(&self) -> LaneCountersSnapshot {
        LaneCountersSnapshot {
            rtc_perf: self.rtc_perf.load(AtomicOrdering::Relaxed),
            ws_immediate: self.ws_immediate.load(AtomicOrdering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.rtc_perf.store(0, AtomicOrdering::Relaxed);
        self.ws_immediate.store(0, AtomicOrdering::Relaxed);
    }
}

/// Runs the two telemetry timers until `relay` signals shutdown. Per §9,
/// this is a cooperative timer loop, not a task-per-client — one task for
/// the whole process.
pub async fn run(relay: Arc<Relay>) {
    let mut stats_tick = tokio::time::interval(TELEMETRY_INTERVAL);
    let mut summary_tick = tokio::time::interval(SUMMARY_INTERVAL);

    loop {
        tokio::select! {
            _ = stats_tick.tick() => {
                broadcast_stats(&relay).await;
            }
            _ = summary_tick.tick() => {
                log_summary_and_reset(&relay).await;
            }
            _ = relay.shutdown.notified() => {
                break;
            }
        }
    }
}

async fn broadcast_stats(relay: &Arc<Relay>) {
    let server_time = crate::dispatcher::now_ms();
    let queue_length = relay.queue.lock().await.len();
    let lane_counters = relay.lane_counters.snapshot();

    let registry = relay.registry.lock().await;
    let clients: Vec<ClientStats> = registry
        .iter()
        .map(|c| ClientStats {
            id: c.id,
            buffer_size_ms: c.buffer_depth_ms,
            rtt_p95: c.latency_window.p95(),
            rtt_avg: c.latency_window.avg(),
            latency_history: c.latency_window.recent(LATENCY_HISTORY_LEN),
            dc_state: if c.data.is_some() { "open".to_string() } else { "closed".to_string() },
            last_seen: c.last_seen,
        })
        .collect();

    let message = ServerMessage::JcmpStats {
        server_time,
        queue_length,
        lane_counters,
        clients,
    };

    for client in registry.iter() {
        let _ = client.signaling.send(message.clone());
    }
}

async fn log_summary_and_reset(relay: &Arc<Relay>) {
    let snapshot = relay.lane_counters.snapshot();
    let queue_len = relay.queue.lock().await.len();
    let client_count = relay.registry.lock().await.len();
    info!(
        "summary: clients={client_count} queue_len={queue_len} rtc_perf={} ws_immediate={}",
        snapshot.rtc_perf, snapshot.ws_immediate
    );
    relay.lane_counters.reset();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lane_counters_snapshot_and_reset() {
        let counters = LaneCounters::new();
        counters.record_rtc_perf();
        counters.record_rtc_perf();
        counters.record_ws_immediate();
        let snap = counters.snapshot();
        assert_eq!(snap.rtc_perf, 2);
        assert_eq!(snap.ws_immediate, 1);
        counters.reset();
        let snap = counters.snapshot();
        assert_eq!(snap.rtc_perf, 0);
        assert_eq!(snap.ws_immediate, 0);
    }
}
