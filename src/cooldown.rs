//! Per-camera escalation and alert cooldowns.
//!
//! Times are durations since the Unix epoch as reported by a [`Clock`].
//! `None` means "never", so a fresh camera is outside both cooldowns whatever
//! the clock reads.
//!
//! [`Clock`]: crate::clock::Clock

use std::time::Duration;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CooldownState {
    last_detection: Option<Duration>,
    last_alert: Option<Duration>,
}

impl CooldownState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeded timestamps, mostly for tests and restores.
    pub fn with_times(last_detection: Option<Duration>, last_alert: Option<Duration>) -> Self {
        Self {
            last_detection,
            last_alert,
        }
    }

    pub fn last_detection(&self) -> Option<Duration> {
        self.last_detection
    }

    pub fn last_alert(&self) -> Option<Duration> {
        self.last_alert
    }

    /// True while `now - last_detection < cooldown`.
    pub fn in_detection_cooldown(&self, now: Duration, cooldown: Duration) -> bool {
        self.last_detection
            .is_some_and(|last| now.saturating_sub(last) < cooldown)
    }

    /// True once `now - last_alert >= cooldown`, or when no alert was ever sent.
    pub fn alert_ready(&self, now: Duration, cooldown: Duration) -> bool {
        self.last_alert
            .is_none_or(|last| now.saturating_sub(last) >= cooldown)
    }

    /// Never moves backwards.
    pub fn record_detection(&mut self, now: Duration) {
        self.last_detection = Some(self.last_detection.map_or(now, |last| last.max(now)));
    }

    /// Never moves backwards.
    pub fn record_alert(&mut self, now: Duration) {
        self.last_alert = Some(self.last_alert.map_or(now, |last| last.max(now)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[test]
    fn fresh_state_is_outside_both_cooldowns() {
        let state = CooldownState::new();
        assert!(!state.in_detection_cooldown(secs(0), secs(5)));
        assert!(state.alert_ready(secs(0), secs(60)));
    }

    #[test]
    fn detection_cooldown_is_strict() {
        let state = CooldownState::with_times(Some(secs(100)), None);
        assert!(state.in_detection_cooldown(secs(104), secs(5)));
        assert!(!state.in_detection_cooldown(secs(105), secs(5)));
    }

    #[test]
    fn alert_cooldown_is_inclusive() {
        let state = CooldownState::with_times(None, Some(secs(0)));
        assert!(state.alert_ready(secs(100), secs(60)));
        assert!(state.alert_ready(secs(60), secs(60)));

        let state = CooldownState::with_times(None, Some(secs(70)));
        assert!(!state.alert_ready(secs(100), secs(60)));
    }

    #[test]
    fn timestamps_never_move_backwards() {
        let mut state = CooldownState::new();
        state.record_detection(secs(50));
        state.record_detection(secs(40));
        state.record_alert(secs(50));
        state.record_alert(secs(10));
        assert_eq!(state.last_detection(), Some(secs(50)));
        assert_eq!(state.last_alert(), Some(secs(50)));
    }

    #[test]
    fn clock_behind_last_detection_stays_in_cooldown() {
        let state = CooldownState::with_times(Some(secs(100)), None);
        assert!(state.in_detection_cooldown(secs(90), secs(5)));
    }
}
