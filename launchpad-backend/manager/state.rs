use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Provisioning state of one project's environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentState {
    Absent,
    /// Tearing down the previous environment before creating a new one.
    Replacing,
    Creating,
    Mounting,
    Installing,
    Starting,
    Ready,
    Error,
    Destroyed,
}

impl EnvironmentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvironmentState::Absent => "absent",
            EnvironmentState::Replacing => "replacing",
            EnvironmentState::Creating => "creating",
            EnvironmentState::Mounting => "mounting",
            EnvironmentState::Installing => "installing",
            EnvironmentState::Starting => "starting",
            EnvironmentState::Ready => "ready",
            EnvironmentState::Error => "error",
            EnvironmentState::Destroyed => "destroyed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "absent" => EnvironmentState::Absent,
            "replacing" => EnvironmentState::Replacing,
            "creating" => EnvironmentState::Creating,
            "mounting" => EnvironmentState::Mounting,
            "installing" => EnvironmentState::Installing,
            "starting" => EnvironmentState::Starting,
            "ready" => EnvironmentState::Ready,
            "error" => EnvironmentState::Error,
            "destroyed" => EnvironmentState::Destroyed,
            _ => return None,
        })
    }

    /// Position in the happy path, used to check monotonic progress.
    pub fn rank(&self) -> u8 {
        match self {
            EnvironmentState::Absent | EnvironmentState::Destroyed => 0,
            EnvironmentState::Replacing => 1,
            EnvironmentState::Creating => 2,
            EnvironmentState::Mounting => 3,
            EnvironmentState::Installing => 4,
            EnvironmentState::Starting => 5,
            EnvironmentState::Ready => 6,
            EnvironmentState::Error => u8::MAX,
        }
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition(&self, next: EnvironmentState) -> bool {
        use EnvironmentState::*;
        match (*self, next) {
            (Destroyed, Destroyed) => false,
            (_, Destroyed) => true,
            (Destroyed | Absent, _) => matches!(next, Replacing | Creating),
            (Error, Error) => false,
            (_, Error) => true,
            (Error | Ready, Replacing | Creating) => true,
            (Replacing, Creating) => true,
            (Creating, Mounting)
            | (Mounting, Installing)
            | (Installing, Starting)
            | (Starting, Ready) => true,
            _ => false,
        }
    }
}

impl fmt::Display for EnvironmentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Limits the manager enforces.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Live environments allowed across all projects.
    pub max_environments: usize,
    /// Environments older than this are destroyed by the sweeper.
    pub max_age: Duration,
    pub sweep_interval: Duration,
    /// Pause after a capacity rejection and mass cleanup.
    pub capacity_cooldown: Duration,
    /// Longest a single environment cleanup may take before it is abandoned.
    pub teardown_timeout: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_environments: 2,
            max_age: Duration::from_secs(30 * 60),
            sweep_interval: Duration::from_secs(5 * 60),
            capacity_cooldown: Duration::from_secs(10),
            teardown_timeout: Duration::from_secs(15),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use EnvironmentState::*;

    #[test]
    fn happy_path_is_allowed() {
        let path = [Absent, Creating, Mounting, Installing, Starting, Ready];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn skipping_steps_is_rejected() {
        assert!(!Creating.can_transition(Installing));
        assert!(!Mounting.can_transition(Ready));
        assert!(!Absent.can_transition(Ready));
    }

    #[test]
    fn error_reachable_from_any_live_state() {
        for s in [Replacing, Creating, Mounting, Installing, Starting, Ready] {
            assert!(s.can_transition(Error), "{s}");
        }
        assert!(!Error.can_transition(Error));
    }

    #[test]
    fn destroyed_can_reenter_creating() {
        assert!(Destroyed.can_transition(Creating));
        assert!(Ready.can_transition(Replacing));
        assert!(Replacing.can_transition(Creating));
        assert!(!Destroyed.can_transition(Destroyed));
    }

    #[test]
    fn parse_matches_serde_names() {
        for s in [Absent, Replacing, Creating, Mounting, Installing, Starting, Ready, Error, Destroyed] {
            let json = serde_json::to_value(s).unwrap();
            assert_eq!(json, s.as_str());
            assert_eq!(EnvironmentState::parse(s.as_str()), Some(s));
        }
    }

    #[test]
    fn config_defaults() {
        let c = ManagerConfig::default();
        assert_eq!(c.max_environments, 2);
        assert_eq!(c.max_age, Duration::from_secs(1800));
        assert_eq!(c.sweep_interval, Duration::from_secs(300));
        assert_eq!(c.capacity_cooldown, Duration::from_secs(10));
        assert_eq!(c.teardown_timeout, Duration::from_secs(15));
    }
}
