#![allow(dead_code)]

// Test utilities and common setup
pub mod fixtures;
pub mod mocks;

pub use fixtures::*;
pub use mocks::*;

use std::time::Duration;

use launch_orchestrator::deployment::{RolloutController, RolloutState};

/// Waits until the controller reports a state matching `predicate`.
pub async fn wait_for_state<F>(controller: &RolloutController, predicate: F)
where
    F: Fn(&RolloutState) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let status = controller.status().await;
        if predicate(&status.state) {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "controller never reached the expected state, last seen {}",
            status.state
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
