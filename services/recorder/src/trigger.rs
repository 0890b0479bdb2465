//! Consecutive-frame trigger counting.
//!
//! A class "fires" when it has been seen on enough consecutive frames. Any
//! frame without the class breaks its streak. Classes that already fired
//! in the current segment are suppressed by the caller.

use crate::detection::Detection;
use std::collections::{BTreeMap, HashMap, HashSet};

/// Consecutive-frame thresholds, globally and per class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Thresholds {
    default: u32,
    per_class: HashMap<i32, u32>,
}

impl Thresholds {
    /// Create thresholds with a global default. Values below 1 are raised to 1.
    pub fn new(default: u32) -> Self {
        Self {
            default: default.max(1),
            per_class: HashMap::new(),
        }
    }

    /// Override the threshold for one class.
    pub fn with_class(mut self, class_id: i32, frames: u32) -> Self {
        self.per_class.insert(class_id, frames.max(1));
        self
    }

    /// Frames required before `class_id` fires.
    pub fn for_class(&self, class_id: i32) -> u32 {
        self.per_class
            .get(&class_id)
            .copied()
            .unwrap_or(self.default)
    }

    pub fn default_frames(&self) -> u32 {
        self.default
    }

    pub fn per_class(&self) -> &HashMap<i32, u32> {
        &self.per_class
    }
}

impl Default for Thresholds {
    fn default() -> Self {
        Self::new(1)
    }
}

/// Which classes may trigger a recording, and how fast.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TriggerRules {
    /// Trigger class filter; empty means any class
    pub classes: HashSet<i32>,
    pub thresholds: Thresholds,
}

impl TriggerRules {
    pub fn new(classes: impl IntoIterator<Item = i32>, thresholds: Thresholds) -> Self {
        Self {
            classes: classes.into_iter().collect(),
            thresholds,
        }
    }

    /// Rules without a class filter.
    pub fn any(thresholds: Thresholds) -> Self {
        Self {
            classes: HashSet::new(),
            thresholds,
        }
    }

    /// Whether a class participates in triggering.
    pub fn in_scope(&self, class_id: i32) -> bool {
        self.classes.is_empty() || self.classes.contains(&class_id)
    }

    /// Distinct in-scope class ids on a frame, in first-seen order.
    pub fn candidates(&self, detections: &[Detection]) -> Vec<i32> {
        let mut seen = Vec::new();
        for detection in detections {
            if !detection.is_valid() || !self.in_scope(detection.class_id) {
                continue;
            }
            if !seen.contains(&detection.class_id) {
                seen.push(detection.class_id);
            }
        }
        seen
    }
}

/// Per-class streak counters for one channel.
#[derive(Debug, Clone, Default)]
pub struct ConsecutiveCounters {
    counts: HashMap<i32, u32>,
}

impl ConsecutiveCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one frame's candidate classes and return the classes that fired.
    ///
    /// A class fires when its counter crosses its threshold on this frame and
    /// it is not in `suppressed`. Counters keep running after a fire, so a
    /// class that stays in view does not cross again.
    pub fn observe(
        &mut self,
        rules: &TriggerRules,
        candidates: &[i32],
        suppressed: &HashSet<i32>,
    ) -> Vec<i32> {
        if candidates.is_empty() {
            self.reset_in_scope(rules);
            return Vec::new();
        }

        let mut fired = Vec::new();
        for &class_id in candidates {
            let count = self.counts.entry(class_id).or_insert(0);
            let previous = *count;
            *count = count.saturating_add(1);

            let needed = rules.thresholds.for_class(class_id);
            if *count >= needed && previous < needed && !suppressed.contains(&class_id) {
                fired.push(class_id);
            }
        }

        for (class_id, count) in self.counts.iter_mut() {
            if rules.in_scope(*class_id) && !candidates.contains(class_id) {
                *count = 0;
            }
        }

        fired
    }

    fn reset_in_scope(&mut self, rules: &TriggerRules) {
        if rules.classes.is_empty() {
            self.counts.clear();
        } else {
            for &class_id in &rules.classes {
                self.counts.insert(class_id, 0);
            }
        }
    }

    /// Current streak for a class.
    pub fn get(&self, class_id: i32) -> u32 {
        self.counts.get(&class_id).copied().unwrap_or(0)
    }

    /// Ordered copy of all counters, for logging.
    pub fn snapshot(&self) -> BTreeMap<i32, u32> {
        self.counts.iter().map(|(k, v)| (*k, *v)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dets(ids: &[i32]) -> Vec<Detection> {
        ids.iter().copied().map(Detection::new).collect()
    }

    fn feed(
        counters: &mut ConsecutiveCounters,
        rules: &TriggerRules,
        ids: &[i32],
        suppressed: &HashSet<i32>,
    ) -> Vec<i32> {
        let candidates = rules.candidates(&dets(ids));
        counters.observe(rules, &candidates, suppressed)
    }

    #[test]
    fn test_thresholds_clamp_and_override() {
        let thresholds = Thresholds::new(0).with_class(3, 5).with_class(4, 0);
        assert_eq!(thresholds.for_class(1), 1);
        assert_eq!(thresholds.for_class(3), 5);
        assert_eq!(thresholds.for_class(4), 1);
    }

    #[test]
    fn test_candidates_dedup_and_filter() {
        let any = TriggerRules::default();
        assert_eq!(any.candidates(&dets(&[2, -1, 2, 0, 5])), vec![2, 0, 5]);

        let filtered = TriggerRules::new([0, 5], Thresholds::default());
        assert_eq!(filtered.candidates(&dets(&[2, 5, 1, 0])), vec![5, 0]);
        assert!(filtered.candidates(&dets(&[2, 3])).is_empty());
    }

    #[test]
    fn test_fires_on_reaching_threshold_once() {
        let rules = TriggerRules::any(Thresholds::new(3));
        let mut counters = ConsecutiveCounters::new();
        let none = HashSet::new();

        assert!(feed(&mut counters, &rules, &[1], &none).is_empty());
        assert!(feed(&mut counters, &rules, &[1], &none).is_empty());
        assert_eq!(feed(&mut counters, &rules, &[1], &none), vec![1]);
        // Keeps counting past the threshold without firing again
        assert!(feed(&mut counters, &rules, &[1], &none).is_empty());
        assert_eq!(counters.get(1), 4);
    }

    #[test]
    fn test_miss_resets_streak() {
        let rules = TriggerRules::any(Thresholds::new(3));
        let mut counters = ConsecutiveCounters::new();
        let none = HashSet::new();

        feed(&mut counters, &rules, &[1], &none);
        feed(&mut counters, &rules, &[1], &none);
        feed(&mut counters, &rules, &[2], &none);
        assert_eq!(counters.get(1), 0);
        assert_eq!(counters.get(2), 1);

        feed(&mut counters, &rules, &[], &none);
        assert_eq!(counters.get(2), 0);
        assert!(counters.snapshot().is_empty());
    }

    #[test]
    fn test_filtered_reset_keeps_out_of_scope_untouched() {
        let rules = TriggerRules::new([1, 2], Thresholds::new(2));
        let mut counters = ConsecutiveCounters::new();
        let none = HashSet::new();

        feed(&mut counters, &rules, &[1, 9], &none);
        assert_eq!(counters.get(1), 1);
        assert_eq!(counters.get(9), 0);

        feed(&mut counters, &rules, &[], &none);
        assert_eq!(counters.get(1), 0);
        assert_eq!(counters.get(2), 0);
    }

    #[test]
    fn test_suppressed_class_does_not_fire() {
        let rules = TriggerRules::default();
        let mut counters = ConsecutiveCounters::new();
        let suppressed = HashSet::from([1]);

        assert_eq!(feed(&mut counters, &rules, &[1, 2], &suppressed), vec![2]);
    }

    #[test]
    fn test_each_class_has_own_streak() {
        let rules = TriggerRules::any(Thresholds::new(2).with_class(7, 1));
        let mut counters = ConsecutiveCounters::new();
        let none = HashSet::new();

        assert_eq!(feed(&mut counters, &rules, &[3, 7], &none), vec![7]);
        assert_eq!(feed(&mut counters, &rules, &[3, 7], &none), vec![3]);
        assert_eq!(counters.get(3), 2);
        assert_eq!(counters.get(7), 2);
    }
}
