//! Health checking (C3), state tracking (C4), and the monitor loop that
//! drives them (C5).

pub mod checker;
pub mod monitor;
pub mod tracker;

pub use checker::{CheckResult, HealthChecker, RetryConfig};
pub use monitor::{HealthMonitor, SharedTargets, TargetProvider};
pub use tracker::{HealthState, HealthTracker};

use serde::{Deserialize, Serialize};

/// One backend to probe (C4's `Target`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub id: String,
    pub app: String,
    pub ip: String,
    pub port: u16,
    pub health_path: String,
}

impl Target {
    pub fn url(&self) -> String {
        format!("http://{}:{}{}", self.ip, self.port, self.health_path)
    }
}
