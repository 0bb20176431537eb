use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use super::traffic_router::{TrafficRouter, TrafficWeights};
use crate::services::alerting::{send_alert, AlertEvent, AlertSeverity, AlertSink};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollbackOutcome {
    /// Blue carries 100% again.
    Restored,
    /// Traffic could not be restored; needs a human.
    Failed { error: String },
}

/// The one rollback path, used for automatic failures and operator aborts
/// alike. Restoring traffic is attempted once, bounded by `timeout`.
pub struct RollbackExecutor {
    router: Arc<dyn TrafficRouter>,
    alerts: Arc<dyn AlertSink>,
    timeout: Duration,
}

impl RollbackExecutor {
    pub fn new(router: Arc<dyn TrafficRouter>, alerts: Arc<dyn AlertSink>, timeout: Duration) -> Self {
        Self {
            router,
            alerts,
            timeout,
        }
    }

    pub async fn execute(&self, domain: &str, rollout_id: &str, reason: &str) -> RollbackOutcome {
        warn!(domain = domain, rollout_id = rollout_id, reason = reason, "⏪ Rolling back to blue");
        send_alert(
            self.alerts.as_ref(),
            AlertEvent::new("RollingBack", "started", reason)
                .with_severity(AlertSeverity::Warning)
                .with_rollout(domain, rollout_id),
        )
        .await;

        let restore = tokio::time::timeout(
            self.timeout,
            self.router.apply_weights(TrafficWeights::all_blue()),
        )
        .await;

        let failure = match restore {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(_) => Some(format!(
                "traffic restore timed out after {} ms",
                self.timeout.as_millis()
            )),
        };

        match failure {
            None => {
                info!(
                    domain = domain,
                    blue_weight = 100,
                    green_weight = 0,
                    "Rollback complete, blue restored"
                );
                send_alert(
                    self.alerts.as_ref(),
                    AlertEvent::new(
                        "Failed",
                        "rolled_back",
                        format!("rollout rolled back: {}", reason),
                    )
                    .with_severity(AlertSeverity::Warning)
                    .with_rollout(domain, rollout_id),
                )
                .await;
                RollbackOutcome::Restored
            }
            Some(error) => {
                error!(
                    domain = domain,
                    rollout_id = rollout_id,
                    error = %error,
                    "🚨 Rollback failed, traffic split unknown; manual intervention required"
                );
                send_alert(
                    self.alerts.as_ref(),
                    AlertEvent::new(
                        "Failed",
                        "rollback_failed",
                        format!("rollback failed ({}) after: {}", error, reason),
                    )
                    .with_severity(AlertSeverity::Critical)
                    .with_rollout(domain, rollout_id),
                )
                .await;
                RollbackOutcome::Failed { error }
            }
        }
    }
}
