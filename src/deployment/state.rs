use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of one blue/green cutover. Owned by the rollout controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "phase", content = "greenWeight")]
pub enum RolloutState {
    Idle,
    DeployingGreen,
    HealthCheckingGreen,
    /// Green receives the given percentage of traffic.
    ShiftingTraffic(u8),
    /// Green at 100%, final observation window running.
    Monitoring,
    Complete,
    RollingBack,
    Failed,
}

impl RolloutState {
    pub fn can_transition_to(&self, to: RolloutState) -> bool {
        use RolloutState::*;
        match (*self, to) {
            (ShiftingTraffic(from), ShiftingTraffic(next)) => next > from && next <= 100,
            (ShiftingTraffic(100), Monitoring) => true,
            (HealthCheckingGreen, ShiftingTraffic(w)) => w > 0 && w <= 100,
            (from, to) => matches!(
                (from, to),
                (Idle, DeployingGreen)
                    | (DeployingGreen, HealthCheckingGreen)
                    | (DeployingGreen, Failed)
                    | (DeployingGreen, RollingBack)
                    | (HealthCheckingGreen, Failed)
                    | (HealthCheckingGreen, RollingBack)
                    | (ShiftingTraffic(_), RollingBack)
                    | (Monitoring, Complete)
                    | (Monitoring, RollingBack)
                    | (RollingBack, Failed)
                    | (Complete, Idle)
                    | (Failed, Idle)
            ),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RolloutState::Complete | RolloutState::Failed)
    }

    pub fn is_active(&self) -> bool {
        !matches!(self, RolloutState::Idle) && !self.is_terminal()
    }

    /// Phase name without the weight, as used in alert events.
    pub fn phase_name(&self) -> &'static str {
        match self {
            RolloutState::Idle => "Idle",
            RolloutState::DeployingGreen => "DeployingGreen",
            RolloutState::HealthCheckingGreen => "HealthCheckingGreen",
            RolloutState::ShiftingTraffic(_) => "ShiftingTraffic",
            RolloutState::Monitoring => "Monitoring",
            RolloutState::Complete => "Complete",
            RolloutState::RollingBack => "RollingBack",
            RolloutState::Failed => "Failed",
        }
    }
}

impl fmt::Display for RolloutState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RolloutState::ShiftingTraffic(w) => write!(f, "ShiftingTraffic({})", w),
            other => f.write_str(other.phase_name()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RolloutTransition {
    pub from: RolloutState,
    pub to: RolloutState,
    pub at: DateTime<Utc>,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentEnvironment {
    Blue,
    Green,
}

impl fmt::Display for DeploymentEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeploymentEnvironment::Blue => f.write_str("blue"),
            DeploymentEnvironment::Green => f.write_str("green"),
        }
    }
}
