/// Default distance from the bottom edge, in pixels, within which the
/// viewport counts as pinned.
pub const DEFAULT_PIN_THRESHOLD_PX: u32 = 120;

/// Decides whether newly arrived messages should auto-scroll the view.
///
/// The view reports scroll positions; the policy answers "scroll to bottom?"
/// on each list mutation. A user reading history (scrolled up past the
/// threshold) is never yanked down.
#[derive(Debug, Clone, Copy)]
pub struct ScrollPolicy {
    pinned: bool,
    threshold_px: u32,
}

impl Default for ScrollPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_PIN_THRESHOLD_PX)
    }
}

impl ScrollPolicy {
    pub fn new(threshold_px: u32) -> Self {
        Self {
            pinned: true,
            threshold_px,
        }
    }

    /// Record the viewport's distance from the bottom after a user scroll.
    pub fn observe(&mut self, distance_from_bottom_px: u32) {
        self.pinned = distance_from_bottom_px <= self.threshold_px;
    }

    /// Whether a list mutation should scroll the view to the bottom, based
    /// on the position observed immediately before the mutation.
    pub fn should_autoscroll(&self) -> bool {
        self.pinned
    }

    /// Re-pin to the bottom; called whenever the active conversation changes.
    pub fn reset(&mut self) {
        self.pinned = true;
    }
}
