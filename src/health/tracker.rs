//! Health state tracker (C4): per-target fall/rise counters. Separating
//! fall from rise prevents flapping; new targets start `healthy` so a
//! monitor restart does not blackhole traffic — the reconciler's startup
//! probe is what gates first-time insertion into the routing table (see
//! `deploy::DeploymentManager::startup_check`).

use std::collections::HashMap;

use super::{CheckResult, Target};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone)]
struct TargetEntry {
    target: Target,
    state: HealthState,
    consec_fail: u32,
    consec_succ: u32,
}

pub struct HealthTracker {
    fall: u32,
    rise: u32,
    entries: HashMap<String, TargetEntry>,
}

impl HealthTracker {
    pub fn new(fall: u32, rise: u32) -> Self {
        Self {
            fall: fall.max(1),
            rise: rise.max(1),
            entries: HashMap::new(),
        }
    }

    /// Adds new targets as `healthy`, refreshes mutable fields (ip, port)
    /// on existing ids, removes ids absent from `targets`. Returns whether
    /// membership changed.
    pub fn sync_targets(&mut self, targets: &[Target]) -> bool {
        let mut changed = false;
        let incoming_ids: std::collections::HashSet<&str> =
            targets.iter().map(|t| t.id.as_str()).collect();

        self.entries.retain(|id, _| {
            let keep = incoming_ids.contains(id.as_str());
            changed |= !keep;
            keep
        });

        for target in targets {
            match self.entries.get_mut(&target.id) {
                Some(entry) => {
                    entry.target.ip = target.ip.clone();
                    entry.target.port = target.port;
                    entry.target.health_path = target.health_path.clone();
                }
                None => {
                    self.entries.insert(
                        target.id.clone(),
                        TargetEntry {
                            target: target.clone(),
                            state: HealthState::Healthy,
                            consec_fail: 0,
                            consec_succ: 0,
                        },
                    );
                    changed = true;
                }
            }
        }

        changed
    }

    /// Records a check result for `target_id`. Returns whether the state
    /// flipped. A result for an id not in the tracker is a no-op.
    pub fn record(&mut self, target_id: &str, result: &CheckResult) -> bool {
        let Some(entry) = self.entries.get_mut(target_id) else {
            return false;
        };

        if result.healthy {
            entry.consec_fail = 0;
            entry.consec_succ += 1;
            if entry.state == HealthState::Unhealthy && entry.consec_succ >= self.rise {
                entry.state = HealthState::Healthy;
                return true;
            }
        } else {
            entry.consec_succ = 0;
            entry.consec_fail += 1;
            if entry.state == HealthState::Healthy && entry.consec_fail >= self.fall {
                entry.state = HealthState::Unhealthy;
                return true;
            }
        }
        false
    }

    pub fn get_state(&self, target_id: &str) -> Option<HealthState> {
        self.entries.get(target_id).map(|e| e.state)
    }

    pub fn healthy_targets(&self) -> Vec<Target> {
        self.entries
            .values()
            .filter(|e| e.state == HealthState::Healthy)
            .map(|e| e.target.clone())
            .collect()
    }

    pub fn unhealthy_targets(&self) -> Vec<Target> {
        self.entries
            .values()
            .filter(|e| e.state == HealthState::Unhealthy)
            .map(|e| e.target.clone())
            .collect()
    }

    /// `(total, healthy, unhealthy)`.
    pub fn stats(&self) -> (usize, usize, usize) {
        let total = self.entries.len();
        let healthy = self
            .entries
            .values()
            .filter(|e| e.state == HealthState::Healthy)
            .count();
        (total, healthy, total - healthy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(id: &str) -> Target {
        Target {
            id: id.to_string(),
            app: "web".to_string(),
            ip: "10.0.0.1".to_string(),
            port: 8080,
            health_path: "/healthz".to_string(),
        }
    }

    fn ok() -> CheckResult {
        CheckResult {
            healthy: true,
            error: None,
            latency: std::time::Duration::from_millis(1),
        }
    }

    fn fail() -> CheckResult {
        CheckResult {
            healthy: false,
            error: Some("boom".to_string()),
            latency: std::time::Duration::from_millis(1),
        }
    }

    #[test]
    fn new_targets_start_healthy() {
        let mut tracker = HealthTracker::new(3, 2);
        tracker.sync_targets(&[target("a")]);
        assert_eq!(tracker.get_state("a"), Some(HealthState::Healthy));
    }

    #[test]
    fn exactly_fall_consecutive_failures_flip_to_unhealthy() {
        let mut tracker = HealthTracker::new(3, 2);
        tracker.sync_targets(&[target("a")]);
        assert!(!tracker.record("a", &fail()));
        assert!(!tracker.record("a", &fail()));
        assert!(tracker.record("a", &fail()));
        assert_eq!(tracker.get_state("a"), Some(HealthState::Unhealthy));
    }

    #[test]
    fn below_fall_threshold_never_flips() {
        let mut tracker = HealthTracker::new(3, 2);
        tracker.sync_targets(&[target("a")]);
        tracker.record("a", &fail());
        tracker.record("a", &fail());
        assert_eq!(tracker.get_state("a"), Some(HealthState::Healthy));
    }

    #[test]
    fn one_success_resets_fail_counter() {
        let mut tracker = HealthTracker::new(2, 3);
        tracker.sync_targets(&[target("a")]);
        tracker.record("a", &fail());
        tracker.record("a", &ok());
        tracker.record("a", &fail());
        assert_eq!(tracker.get_state("a"), Some(HealthState::Healthy));
    }

    #[test]
    fn rise_threshold_restores_health() {
        let mut tracker = HealthTracker::new(2, 3);
        tracker.sync_targets(&[target("a")]);
        tracker.record("a", &fail());
        tracker.record("a", &fail());
        assert_eq!(tracker.get_state("a"), Some(HealthState::Unhealthy));
        tracker.record("a", &ok());
        tracker.record("a", &ok());
        assert_eq!(tracker.get_state("a"), Some(HealthState::Unhealthy));
        assert!(tracker.record("a", &ok()));
        assert_eq!(tracker.get_state("a"), Some(HealthState::Healthy));
    }

    #[test]
    fn record_for_unknown_target_is_a_no_op() {
        let mut tracker = HealthTracker::new(2, 2);
        assert!(!tracker.record("ghost", &fail()));
    }

    #[test]
    fn sync_targets_removes_vanished_ids() {
        let mut tracker = HealthTracker::new(2, 2);
        tracker.sync_targets(&[target("a"), target("b")]);
        assert_eq!(tracker.stats().0, 2);
        let changed = tracker.sync_targets(&[target("a")]);
        assert!(changed);
        assert_eq!(tracker.stats().0, 1);
        assert!(tracker.get_state("b").is_none());
    }

    #[test]
    fn fall_and_rise_are_clamped_to_at_least_one() {
        let mut tracker = HealthTracker::new(0, 0);
        tracker.sync_targets(&[target("a")]);
        assert!(tracker.record("a", &fail()));
    }
}
