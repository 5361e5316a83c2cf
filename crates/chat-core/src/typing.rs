use std::time::{Duration, Instant};

/// Minimum spacing between outbound `typing(start)` emissions.
pub const TYPING_THROTTLE: Duration = Duration::from_millis(1_000);
/// Local inactivity window after which a `typing(stop)` emission is due.
pub const TYPING_STOP_AFTER: Duration = Duration::from_millis(1_000);
/// How long a remote entrant stays in the set without a refresh.
pub const REMOTE_TYPING_EXPIRY: Duration = Duration::from_millis(3_000);

/// Tracks who is typing in the active conversation.
///
/// Local keystrokes are throttled to at most one start emission per window;
/// remote entrants expire unless refreshed. The tracker is clock-injected:
/// callers pass `now`, which keeps every path unit-testable without timers.
#[derive(Debug, Default)]
pub struct TypingTracker {
    last_start_emit: Option<Instant>,
    last_keystroke: Option<Instant>,
    stop_pending: bool,
    remote: Vec<(String, Instant)>,
}

impl TypingTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a local keystroke; returns whether a `typing(start)` signal
    /// should be emitted now.
    pub fn notify_local_typing(&mut self, now: Instant) -> bool {
        self.last_keystroke = Some(now);
        self.stop_pending = true;

        let due = match self.last_start_emit {
            None => true,
            Some(last) => now.duration_since(last) >= TYPING_THROTTLE,
        };
        if due {
            self.last_start_emit = Some(now);
        }
        due
    }

    /// Whether a `typing(stop)` signal should be emitted now. Consumes the
    /// pending stop so it fires once per typing burst.
    pub fn local_stop_due(&mut self, now: Instant) -> bool {
        if !self.stop_pending {
            return false;
        }
        let Some(last) = self.last_keystroke else {
            return false;
        };
        if now.duration_since(last) < TYPING_STOP_AFTER {
            return false;
        }
        self.stop_pending = false;
        self.last_start_emit = None;
        true
    }

    /// Replace the remote typing set from a gateway event, refreshing expiry
    /// for every listed name.
    pub fn apply_remote(&mut self, user_names: &[String], now: Instant) -> bool {
        let expiry = now + REMOTE_TYPING_EXPIRY;
        let previous: Vec<String> = self.names();
        self.remote = user_names
            .iter()
            .map(|name| (name.clone(), expiry))
            .collect();
        previous != self.names()
    }

    /// Drop expired entrants; returns whether the set changed.
    pub fn expire(&mut self, now: Instant) -> bool {
        let before = self.remote.len();
        self.remote.retain(|(_, deadline)| *deadline > now);
        self.remote.len() != before
    }

    /// Display names currently typing, in arrival order.
    pub fn names(&self) -> Vec<String> {
        self.remote.iter().map(|(name, _)| name.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.remote.is_empty()
    }

    /// Forget everything; called on conversation switch and teardown.
    pub fn clear(&mut self) {
        self.last_start_emit = None;
        self.last_keystroke = None;
        self.stop_pending = false;
        self.remote.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttles_rapid_local_typing_to_one_emission() {
        let mut tracker = TypingTracker::new();
        let t0 = Instant::now();

        assert!(tracker.notify_local_typing(t0));
        assert!(!tracker.notify_local_typing(t0 + Duration::from_millis(300)));
        assert!(!tracker.notify_local_typing(t0 + Duration::from_millis(900)));
        assert!(tracker.notify_local_typing(t0 + Duration::from_millis(1_100)));
    }

    #[test]
    fn stop_signal_fires_once_after_inactivity() {
        let mut tracker = TypingTracker::new();
        let t0 = Instant::now();
        tracker.notify_local_typing(t0);

        assert!(!tracker.local_stop_due(t0 + Duration::from_millis(500)));
        assert!(tracker.local_stop_due(t0 + Duration::from_millis(1_200)));
        assert!(!tracker.local_stop_due(t0 + Duration::from_millis(2_000)));
    }

    #[test]
    fn typing_again_after_stop_emits_start_again() {
        let mut tracker = TypingTracker::new();
        let t0 = Instant::now();
        tracker.notify_local_typing(t0);
        assert!(tracker.local_stop_due(t0 + Duration::from_millis(1_500)));

        assert!(tracker.notify_local_typing(t0 + Duration::from_millis(1_600)));
    }

    #[test]
    fn remote_entrants_expire_without_refresh() {
        let mut tracker = TypingTracker::new();
        let t0 = Instant::now();
        tracker.apply_remote(&["Dana".into()], t0);
        assert_eq!(tracker.names(), vec!["Dana"]);

        assert!(!tracker.expire(t0 + Duration::from_millis(2_000)));
        assert!(tracker.expire(t0 + Duration::from_millis(3_100)));
        assert!(tracker.is_empty());
    }

    #[test]
    fn remote_event_replaces_the_set() {
        let mut tracker = TypingTracker::new();
        let t0 = Instant::now();
        tracker.apply_remote(&["Dana".into(), "Eli".into()], t0);

        let changed = tracker.apply_remote(&["Eli".into()], t0 + Duration::from_millis(100));
        assert!(changed);
        assert_eq!(tracker.names(), vec!["Eli"]);
    }

    #[test]
    fn clear_resets_local_and_remote_state() {
        let mut tracker = TypingTracker::new();
        let t0 = Instant::now();
        tracker.notify_local_typing(t0);
        tracker.apply_remote(&["Dana".into()], t0);

        tracker.clear();
        assert!(tracker.is_empty());
        assert!(!tracker.local_stop_due(t0 + Duration::from_secs(5)));
        assert!(tracker.notify_local_typing(t0 + Duration::from_millis(10)));
    }
}
