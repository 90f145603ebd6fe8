//! Capture cooldown gate.
//!
//! A timed latch engaged after automatic captures. Closed at `T` for `D`, it
//! rejects on `[T, T+D)` and reopens on its own at `T+D`.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(30);

#[derive(Clone, Debug, Default)]
pub struct CooldownGate {
    closed_until: Arc<Mutex<Option<Instant>>>,
}

impl CooldownGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_open(&self) -> bool {
        self.is_open_at(Instant::now())
    }

    pub fn is_open_at(&self, now: Instant) -> bool {
        match *self.lock() {
            Some(until) => now >= until,
            None => true,
        }
    }

    pub fn close_for(&self, duration: Duration) {
        self.close_for_at(duration, Instant::now());
    }

    pub fn close_for_at(&self, duration: Duration, now: Instant) {
        let until = now + duration;
        *self.lock() = Some(until);
        log::info!("CooldownGate: closed for {}s", duration.as_secs_f32());
    }

    /// Instant at which the gate reopens, if it is closed at `now`.
    pub fn reopens_at(&self, now: Instant) -> Option<Instant> {
        self.lock().filter(|until| now < *until)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Instant>> {
        match self.closed_until.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_starts_open() {
        assert!(CooldownGate::new().is_open());
    }

    #[test]
    fn gate_is_closed_for_half_open_window() {
        let gate = CooldownGate::new();
        let t = Instant::now();
        let d = Duration::from_secs(30);
        gate.close_for_at(d, t);

        assert!(!gate.is_open_at(t));
        assert!(!gate.is_open_at(t + Duration::from_millis(29_999)));
        assert!(gate.is_open_at(t + d));
        assert!(gate.is_open_at(t + d + Duration::from_secs(5)));
        assert_eq!(gate.reopens_at(t), Some(t + d));
        assert_eq!(gate.reopens_at(t + d), None);
    }

    #[tokio::test(start_paused = true)]
    async fn gate_reopens_with_the_clock() {
        let gate = CooldownGate::new();
        gate.close_for(DEFAULT_COOLDOWN);
        assert!(!gate.is_open());
        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(!gate.is_open());
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(gate.is_open());
    }
}
