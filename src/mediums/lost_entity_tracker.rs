//! Round-based lost-entity tracking (§4.7): "the medium records `found` on
//! every scan; `computeLostEntities()` returns the set present in the prior
//! round but not in the current round, then rotates rounds."

use std::collections::HashSet;
use std::hash::Hash;

/// Tracks which entities of type `T` were seen in the previous scan round
/// versus the current one, to report entities that dropped out between
/// rounds.
#[derive(Debug)]
pub struct LostEntityTracker<T> {
    previous_round: HashSet<T>,
    current_round: HashSet<T>,
}

impl<T> Default for LostEntityTracker<T> {
    fn default() -> Self {
        Self { previous_round: HashSet::new(), current_round: HashSet::new() }
    }
}

impl<T: Eq + Hash + Clone> LostEntityTracker<T> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `entity` was found during the current scan round.
    pub fn record_found(&mut self, entity: T) {
        self.current_round.insert(entity);
    }

    /// Computes the set present in the prior round but absent from the
    /// current one, then rotates: the current round becomes the new
    /// "previous round" and is cleared for the next scan.
    pub fn compute_lost(&mut self) -> Vec<T> {
        let lost: Vec<T> = self
            .previous_round
            .iter()
            .filter(|e| !self.current_round.contains(*e))
            .cloned()
            .collect();
        self.previous_round = std::mem::take(&mut self.current_round);
        lost
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_missing_one_round_is_reported_once() {
        let mut tracker: LostEntityTracker<&str> = LostEntityTracker::new();
        tracker.record_found("a");
        tracker.record_found("b");
        assert_eq!(tracker.compute_lost(), Vec::<&str>::new());

        tracker.record_found("a");
        // "b" not re-found this round.
        let mut lost = tracker.compute_lost();
        lost.sort_unstable();
        assert_eq!(lost, vec!["b"]);

        // "b" stays gone; reporting it again would be wrong since it's no
        // longer in the previous round at all.
        tracker.record_found("a");
        assert_eq!(tracker.compute_lost(), Vec::<&str>::new());
    }

    #[test]
    fn rediscovering_an_entity_makes_it_found_again() {
        let mut tracker: LostEntityTracker<&str> = LostEntityTracker::new();
        tracker.record_found("a");
        tracker.compute_lost();

        // round 2: "a" absent -> lost.
        assert_eq!(tracker.compute_lost(), vec!["a"]);

        // round 3: "a" reappears. It was not in the (now empty) previous
        // round, so it is not reported lost again; it simply becomes
        // "found".
        tracker.record_found("a");
        assert_eq!(tracker.compute_lost(), Vec::<&str>::new());
    }
}
