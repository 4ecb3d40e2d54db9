//! Two-phase liveness timer: a pong-wait window followed by a ping-wait
//! window, advanced explicitly by [`Heartbeat::update`] rather than a wall
//! clock, so tests can drive it deterministically.

use std::time::Duration;

/// Which window the heartbeat is currently counting down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Waiting for clients to reply with `Pong`. When this window closes,
    /// it is time to send `Ping`s and mark everyone suspect.
    AwaitingPong,
    /// Waiting for clients to reply with `Ping`. When this window closes,
    /// clients that never replied must be evicted.
    AwaitingPing,
}

type Handler = Box<dyn FnMut() + Send>;

/// Two-phase countdown timer. One event fires per window closure; an
/// oversized `dt` passed to [`update`](Self::update) still only fires (and
/// transitions) once — missed ticks are not coalesced into extra events.
pub struct Heartbeat {
    pong_window: Duration,
    ping_window: Duration,
    remaining: Duration,
    phase: Phase,
    on_pong_window_ended: Option<Handler>,
    on_ping_window_ended: Option<Handler>,
}

impl Heartbeat {
    /// Starts in [`Phase::AwaitingPong`] with `remaining = pong_window`.
    pub fn new(pong_window: Duration, ping_window: Duration) -> Self {
        Self {
            pong_window,
            ping_window,
            remaining: pong_window,
            phase: Phase::AwaitingPong,
            on_pong_window_ended: None,
            on_ping_window_ended: None,
        }
    }

    pub fn with_pong_window_ended<F>(mut self, handler: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        self.on_pong_window_ended = Some(Box::new(handler));
        self
    }

    pub fn with_ping_window_ended<F>(mut self, handler: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        self.on_ping_window_ended = Some(Box::new(handler));
        self
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn remaining(&self) -> Duration {
        self.remaining
    }

    /// Advances the countdown by `dt`. If the current window closes, fires
    /// exactly the one event for that closure and transitions phase — the
    /// fired handler runs to completion before `update` returns.
    pub fn update(&mut self, dt: Duration) {
        self.remaining = self.remaining.saturating_sub(dt);
        if !self.remaining.is_zero() {
            return;
        }
        match self.phase {
            Phase::AwaitingPong => {
                self.phase = Phase::AwaitingPing;
                self.remaining = self.ping_window;
                if let Some(handler) = &mut self.on_pong_window_ended {
                    handler();
                }
            }
            Phase::AwaitingPing => {
                self.phase = Phase::AwaitingPong;
                self.remaining = self.pong_window;
                if let Some(handler) = &mut self.on_ping_window_ended {
                    handler();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use super::*;

    #[test]
    fn starts_awaiting_pong_with_pong_window_remaining() {
        let hb = Heartbeat::new(Duration::from_millis(100), Duration::from_millis(50));
        assert_eq!(hb.phase(), Phase::AwaitingPong);
        assert_eq!(hb.remaining(), Duration::from_millis(100));
    }

    #[test]
    fn full_cycle_fires_each_event_exactly_once() {
        let pong_fires = Arc::new(AtomicUsize::new(0));
        let ping_fires = Arc::new(AtomicUsize::new(0));
        let pong_fires2 = pong_fires.clone();
        let ping_fires2 = ping_fires.clone();

        let mut hb = Heartbeat::new(Duration::from_millis(100), Duration::from_millis(50))
            .with_pong_window_ended(move || {
                pong_fires2.fetch_add(1, Ordering::SeqCst);
            })
            .with_ping_window_ended(move || {
                ping_fires2.fetch_add(1, Ordering::SeqCst);
            });

        hb.update(Duration::from_millis(100));
        assert_eq!(pong_fires.load(Ordering::SeqCst), 1);
        assert_eq!(ping_fires.load(Ordering::SeqCst), 0);
        assert_eq!(hb.phase(), Phase::AwaitingPing);
        assert_eq!(hb.remaining(), Duration::from_millis(50));

        hb.update(Duration::from_millis(50));
        assert_eq!(pong_fires.load(Ordering::SeqCst), 1);
        assert_eq!(ping_fires.load(Ordering::SeqCst), 1);
        assert_eq!(hb.phase(), Phase::AwaitingPong);
    }

    #[test]
    fn oversized_dt_does_not_coalesce_across_missed_ticks() {
        let fires = Arc::new(AtomicUsize::new(0));
        let fires2 = fires.clone();
        let mut hb = Heartbeat::new(Duration::from_millis(10), Duration::from_millis(10))
            .with_pong_window_ended(move || {
                fires2.fetch_add(1, Ordering::SeqCst);
            });

        // dt covers several full windows' worth of time in one call.
        hb.update(Duration::from_secs(10));
        assert_eq!(fires.load(Ordering::SeqCst), 1, "only one transition per update call");
        assert_eq!(hb.phase(), Phase::AwaitingPing);
    }
}
