use crate::types::Coordinates;

/// Request lifecycle for an advisor-backed feature instance.
///
/// A single tagged state replaces the loose `isLoading`/`isComplete`
/// flag combinations: the compiler can check exhaustiveness and the
/// contradictory combinations are unrepresentable.
#[derive(Debug, Clone, PartialEq)]
pub enum InsightState<T> {
    Idle,
    Locating,
    Loading,
    Success(T),
    Error,
}

/// State machine for one advisor request slot.
///
/// At most one request is in flight per tracker; `begin` rejects while
/// `Locating` or `Loading`. `Success` and `Error` are terminal until the
/// next user-triggered `begin`.
#[derive(Debug)]
pub struct InsightTracker<T> {
    state: InsightState<T>,
    advisory: Option<String>,
}

impl<T> Default for InsightTracker<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> InsightTracker<T> {
    pub fn new() -> Self {
        Self {
            state: InsightState::Idle,
            advisory: None,
        }
    }

    pub fn state(&self) -> &InsightState<T> {
        &self.state
    }

    pub fn result(&self) -> Option<&T> {
        match &self.state {
            InsightState::Success(value) => Some(value),
            _ => None,
        }
    }

    /// Transient advisory shown alongside `Loading` (e.g. a degraded
    /// location context). Cleared on every terminal transition.
    pub fn advisory(&self) -> Option<&str> {
        self.advisory.as_deref()
    }

    pub fn is_in_flight(&self) -> bool {
        matches!(self.state, InsightState::Locating | InsightState::Loading)
    }

    /// Starts (or retries) the request. Returns false while a request is
    /// already in flight; the caller must treat that as a no-op.
    pub fn begin(&mut self) -> bool {
        if self.is_in_flight() {
            return false;
        }
        self.state = InsightState::Locating;
        self.advisory = None;
        true
    }

    /// The optional geolocation leg resolved. A denied or unavailable
    /// lookup is not fatal: it degrades to no location context, with an
    /// advisory message when the caller supplies one.
    pub fn location_resolved(
        &mut self,
        coordinates: Option<Coordinates>,
        advisory: Option<String>,
    ) -> Option<Coordinates> {
        if !matches!(self.state, InsightState::Locating) {
            return None;
        }
        self.state = InsightState::Loading;
        self.advisory = advisory;
        coordinates
    }

    /// Stores a well-formed result. Only honored from `Loading`.
    pub fn succeed(&mut self, value: T) -> bool {
        if !matches!(self.state, InsightState::Loading) {
            return false;
        }
        self.state = InsightState::Success(value);
        self.advisory = None;
        true
    }

    /// Transport, timeout, or parse failure. Honored from `Loading` and,
    /// for failures during the location leg, from `Locating`.
    pub fn fail(&mut self) -> bool {
        if !self.is_in_flight() {
            return false;
        }
        self.state = InsightState::Error;
        self.advisory = None;
        true
    }

    /// Drops a stored result back to `Idle` (the map-plot banner path).
    pub fn dismiss(&mut self) {
        if !self.is_in_flight() {
            self.state = InsightState::Idle;
            self.advisory = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_cycle_reaches_success() {
        let mut tracker: InsightTracker<u32> = InsightTracker::new();
        assert!(tracker.begin());
        assert_eq!(tracker.state(), &InsightState::Locating);
        tracker.location_resolved(None, None);
        assert_eq!(tracker.state(), &InsightState::Loading);
        assert!(tracker.succeed(7));
        assert_eq!(tracker.result(), Some(&7));
    }

    #[test]
    fn begin_rejected_while_in_flight() {
        let mut tracker: InsightTracker<u32> = InsightTracker::new();
        assert!(tracker.begin());
        assert!(!tracker.begin());
        tracker.location_resolved(None, None);
        assert!(!tracker.begin());
    }

    #[test]
    fn retry_allowed_from_error_and_success() {
        let mut tracker: InsightTracker<u32> = InsightTracker::new();
        tracker.begin();
        tracker.location_resolved(None, None);
        tracker.fail();
        assert_eq!(tracker.state(), &InsightState::Error);
        assert!(tracker.begin());

        tracker.location_resolved(None, None);
        tracker.succeed(1);
        assert!(tracker.begin());
    }

    #[test]
    fn degraded_location_keeps_loading_and_surfaces_advisory() {
        let mut tracker: InsightTracker<u32> = InsightTracker::new();
        tracker.begin();
        let coords = tracker.location_resolved(None, Some("no location context".to_string()));
        assert!(coords.is_none());
        assert_eq!(tracker.state(), &InsightState::Loading);
        assert_eq!(tracker.advisory(), Some("no location context"));

        tracker.succeed(3);
        assert!(tracker.advisory().is_none());
    }

    #[test]
    fn succeed_ignored_outside_loading() {
        let mut tracker: InsightTracker<u32> = InsightTracker::new();
        assert!(!tracker.succeed(1));
        tracker.begin();
        assert!(!tracker.succeed(1));
        assert_eq!(tracker.state(), &InsightState::Locating);
    }

    #[test]
    fn dismiss_returns_terminal_states_to_idle() {
        let mut tracker: InsightTracker<u32> = InsightTracker::new();
        tracker.begin();
        tracker.location_resolved(None, None);
        tracker.succeed(9);
        tracker.dismiss();
        assert_eq!(tracker.state(), &InsightState::Idle);
    }
}
