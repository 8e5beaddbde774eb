//! Cancellable delayed tasks for the flow controller
//!
//! Each [`TimerKind`] has a single slot. Scheduling a kind replaces (and
//! aborts) whatever was pending in that slot, so no two timers of the same
//! kind are ever live. A fired timer reports back over a channel tagged with
//! its sequence number; the controller claims it through [`Timers::claim`],
//! which rejects fires from timers that were cancelled or replaced after
//! their message was already queued.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// The kinds of delayed action the controller schedules
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Pause after a valid utterance before asking for a response
    Silence,
    /// Cap on an unattended listening span
    MaxListen,
    /// Harmonizing hold or max-listen cooldown before listening resumes
    Transition,
    /// Guard against a response or its playback never completing
    Response,
}

impl TimerKind {
    const ALL: [TimerKind; 4] = [
        TimerKind::Silence,
        TimerKind::MaxListen,
        TimerKind::Transition,
        TimerKind::Response,
    ];

    fn slot(self) -> usize {
        match self {
            TimerKind::Silence => 0,
            TimerKind::MaxListen => 1,
            TimerKind::Transition => 2,
            TimerKind::Response => 3,
        }
    }
}

/// Message sent when a delayed task reaches its deadline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerFired {
    pub kind: TimerKind,
    pub seq: u64,
}

/// Task handle that aborts the task when dropped
#[derive(Debug)]
pub struct AbortOnDrop(JoinHandle<()>);

impl AbortOnDrop {
    pub fn new(handle: JoinHandle<()>) -> Self {
        Self(handle)
    }
}

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[derive(Debug)]
struct DelayedTask {
    seq: u64,
    _task: AbortOnDrop,
}

/// One slot per timer kind, all reporting to the same channel
pub struct Timers {
    fired_tx: mpsc::UnboundedSender<TimerFired>,
    slots: [Option<DelayedTask>; 4],
    next_seq: u64,
}

impl Timers {
    /// Create the timer slots and the receiver their fires arrive on
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TimerFired>) {
        let (fired_tx, fired_rx) = mpsc::unbounded_channel();
        let timers = Self {
            fired_tx,
            slots: [None, None, None, None],
            next_seq: 0,
        };
        (timers, fired_rx)
    }

    /// Schedule `kind` to fire after `delay`, replacing any pending one
    pub fn schedule(&mut self, kind: TimerKind, delay: Duration) -> u64 {
        self.next_seq += 1;
        let seq = self.next_seq;
        let fired_tx = self.fired_tx.clone();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = fired_tx.send(TimerFired { kind, seq });
        });

        let replaced = self.slots[kind.slot()].replace(DelayedTask {
            seq,
            _task: AbortOnDrop::new(handle),
        });
        debug!(
            ?kind,
            seq,
            delay_ms = delay.as_millis() as u64,
            replaced = replaced.is_some(),
            "timer scheduled"
        );
        seq
    }

    /// Cancel the pending timer of `kind`, returning whether one was live
    pub fn cancel(&mut self, kind: TimerKind) -> bool {
        let cancelled = self.slots[kind.slot()].take().is_some();
        if cancelled {
            debug!(?kind, "timer cancelled");
        }
        cancelled
    }

    /// Cancel every pending timer
    pub fn cancel_all(&mut self) {
        for kind in TimerKind::ALL {
            self.cancel(kind);
        }
    }

    /// Accept a fire if it belongs to the live timer of its kind
    ///
    /// On success the slot is cleared. Fires from cancelled or superseded
    /// timers return `false` and leave the slot untouched.
    pub fn claim(&mut self, fired: TimerFired) -> bool {
        let slot = &mut self.slots[fired.kind.slot()];
        match slot {
            Some(task) if task.seq == fired.seq => {
                *slot = None;
                true
            }
            _ => {
                debug!(kind = ?fired.kind, seq = fired.seq, "ignoring stale timer");
                false
            }
        }
    }

    /// Whether a timer of `kind` is pending
    pub fn is_pending(&self, kind: TimerKind) -> bool {
        self.slots[kind.slot()].is_some()
    }

    /// Number of pending timers across all kinds
    pub fn pending_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_after_delay() {
        let (mut timers, mut fired_rx) = Timers::new();
        let seq = timers.schedule(TimerKind::Silence, Duration::from_millis(100));

        let start = tokio::time::Instant::now();
        let fired = fired_rx.recv().await.unwrap();
        assert_eq!(fired, TimerFired { kind: TimerKind::Silence, seq });
        assert!(start.elapsed() >= Duration::from_millis(100));

        assert!(timers.claim(fired));
        assert!(!timers.is_pending(TimerKind::Silence));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reschedule_replaces_pending_timer() {
        let (mut timers, mut fired_rx) = Timers::new();
        timers.schedule(TimerKind::Silence, Duration::from_millis(100));
        let second = timers.schedule(TimerKind::Silence, Duration::from_millis(300));
        assert_eq!(timers.pending_count(), 1);

        let fired = fired_rx.recv().await.unwrap();
        assert_eq!(fired.seq, second);
        assert!(fired_rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_timer_never_fires() {
        let (mut timers, mut fired_rx) = Timers::new();
        timers.schedule(TimerKind::MaxListen, Duration::from_millis(50));
        assert!(timers.cancel(TimerKind::MaxListen));
        assert!(!timers.cancel(TimerKind::MaxListen));

        tokio::time::advance(Duration::from_millis(100)).await;
        tokio::task::yield_now().await;
        assert!(fired_rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_fire_is_rejected() {
        let (mut timers, mut fired_rx) = Timers::new();
        timers.schedule(TimerKind::Transition, Duration::from_millis(10));
        let fired = fired_rx.recv().await.unwrap();

        // Replaced after the fire was already queued
        timers.schedule(TimerKind::Transition, Duration::from_millis(10));
        assert!(!timers.claim(fired));
        assert!(timers.is_pending(TimerKind::Transition));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all_clears_every_slot() {
        let (mut timers, _fired_rx) = Timers::new();
        for kind in TimerKind::ALL {
            timers.schedule(kind, Duration::from_secs(1));
        }
        assert_eq!(timers.pending_count(), 4);

        timers.cancel_all();
        assert_eq!(timers.pending_count(), 0);
    }
}
