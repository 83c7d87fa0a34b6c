//! C6 — Dispatcher Loop: the single timer that drains due events from the
//! playback queue into the MIDI sink, enforcing late-drop (§4.5).
//!
//! Per §5, this loop must never `.await` anything other than its own tick —
//! the queue and sink locks here are held only across synchronous work.

use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::debug;

use crate::config::debug_enabled;
use crate::queue::EventKind;
use crate::server::Relay;

const TICK_INTERVAL: Duration = Duration::from_millis(5);
/// §4.5 `LATE_DROP_MS`.
const LATE_DROP_MS: i64 = 50;

/// Current wall-clock in milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as i64
}

static LATE_DROP_COUNT: AtomicU64 = AtomicU64::new(0);

pub fn late_drop_count() -> u64 {
    LATE_DROP_COUNT.load(AtomicOrdering::Relaxed)
}

#[cfg(test)]
pub fn reset_late_drop_count_for_test() {
    LATE_DROP_COUNT.store(0, AtomicOrdering::Relaxed);
}

/// Runs the dispatcher until `relay` signals shutdown.
pub async fn run(relay: Arc<Relay>) {
    let mut tick = tokio::time::interval(TICK_INTERVAL);
    loop {
        tokio::select! {
            _ = tick.tick() => {
                tick_once(&relay).await;
            }
            _ = relay.shutdown.notified() => {
                break;
            }
        }
    }
}

async fn tick_once(relay: &Arc<Relay>) {
    let now = now_ms();
    loop {
        let due = {
            let mut queue = relay.queue.lock().await;
            match queue.peek_min() {
                Some(evt) if evt.play_at <= now => queue.pop_min(),
                _ => None,
            }
        };
        let Some(evt) = due else { break };

        let lateness = now - evt.play_at;
        if lateness > LATE_DROP_MS {
            LATE_DROP_COUNT.fetch_add(1, AtomicOrdering::Relaxed);
            if debug_enabled() {
                debug!("late-drop: play_at={} now={now} lateness={lateness}ms", evt.play_at);
            }
            continue;
        }

        let mut sink = relay.midi_sink.lock().await;
        match evt.kind {
            EventKind::NoteOn { note, velocity } => sink.note_on(evt.channel, note, velocity),
            EventKind::NoteOff { note } => sink.note_off(evt.channel, note, 0),
            EventKind::ControlChange { controller, value } => {
                sink.control_change(evt.channel, controller, value)
            }
            EventKind::ProgramChange { program } => sink.program_change(evt.channel, program),
        }
        drop(sink);

        if debug_enabled() {
            debug!("dispatched {:?} on channel {} err={}ms", evt.kind, evt.channel, lateness);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{PlaybackQueue, ScheduledEvent};

    #[test]
    fn test_on_time_event_is_not_late_dropped() {
        let now = 1_000_000i64;
        let evt = ScheduledEvent::new(now - 10, 1, EventKind::NoteOn { note: 60, velocity: 100 });
        assert!(now - evt.play_at <= LATE_DROP_MS);
    }

    #[test]
    fn test_overdue_event_exceeds_late_drop_threshold() {
        let now = 1_000_000i64;
        let evt = ScheduledEvent::new(now - 200, 1, EventKind::NoteOn { note: 60, velocity: 100 });
        assert!(now - evt.play_at > LATE_DROP_MS);
    }

    #[test]
    fn test_queue_drains_in_deadline_order_up_to_now() {
        let mut q = PlaybackQueue::new();
        q.insert(ScheduledEvent::new(100, 1, EventKind::NoteOn { note: 60, velocity: 100 }));
        q.insert(ScheduledEvent::new(200, 1, EventKind::NoteOn { note: 61, velocity: 100 }));
        q.insert(ScheduledEvent::new(300, 1, EventKind::NoteOn { note: 62, velocity: 100 }));
        let now = 250;
        let mut drained = Vec::new();
        while let Some(evt) = q.peek_min() {
            if evt.play_at > now {
                break;
            }
            drained.push(q.pop_min().unwrap().play_at);
        }
        assert_eq!(drained, vec![100, 200]);
        assert_eq!(q.len(), 1);
    }
}
