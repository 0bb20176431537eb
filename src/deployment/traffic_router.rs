use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::{AppError, Result};

/// Blue/green traffic split. Always sums to 100.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficWeights {
    #[serde(rename = "blueWeight")]
    pub blue: u8,
    #[serde(rename = "greenWeight")]
    pub green: u8,
}

impl TrafficWeights {
    pub fn new(blue: u8, green: u8) -> Result<Self> {
        if u16::from(blue) + u16::from(green) != 100 {
            return Err(AppError::ValidationFailed(format!(
                "Traffic weights must sum to 100, got {}/{}",
                blue, green
            )));
        }
        Ok(Self { blue, green })
    }

    pub fn all_blue() -> Self {
        Self { blue: 100, green: 0 }
    }

    pub fn all_green() -> Self {
        Self { blue: 0, green: 100 }
    }

    /// Split sending `green` percent to green and the rest to blue.
    pub fn green(green: u8) -> Result<Self> {
        if green > 100 {
            return Err(AppError::ValidationFailed(format!(
                "Green weight {} exceeds 100",
                green
            )));
        }
        Self::new(100 - green, green)
    }
}

/// Edge/proxy configuration that decides where live traffic goes.
#[async_trait]
pub trait TrafficRouter: Send + Sync {
    async fn apply_weights(&self, weights: TrafficWeights) -> Result<()>;
    async fn current_weights(&self) -> Result<TrafficWeights>;
}

/// Drives server weights through the HAProxy runtime API on its admin socket.
pub struct HAProxyAdapter {
    admin_socket_path: PathBuf,
    backend: String,
    blue_server: String,
    green_server: String,
}

impl HAProxyAdapter {
    pub fn new(
        admin_socket_path: impl Into<PathBuf>,
        backend: impl Into<String>,
        blue_server: impl Into<String>,
        green_server: impl Into<String>,
    ) -> Self {
        Self {
            admin_socket_path: admin_socket_path.into(),
            backend: backend.into(),
            blue_server: blue_server.into(),
            green_server: green_server.into(),
        }
    }

    async fn send_haproxy_command(&self, command: &str) -> Result<String> {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::UnixStream;

        let mut stream = UnixStream::connect(&self.admin_socket_path).await.map_err(|e| {
            AppError::TrafficRoutingError(format!("Failed to connect to HAProxy admin socket: {}", e))
        })?;

        stream.write_all(command.as_bytes()).await.map_err(|e| {
            AppError::TrafficRoutingError(format!("Failed to send command to HAProxy: {}", e))
        })?;
        stream.shutdown().await.map_err(|e| {
            AppError::TrafficRoutingError(format!("Failed to send command to HAProxy: {}", e))
        })?;

        let mut response = String::new();
        stream.read_to_string(&mut response).await.map_err(|e| {
            AppError::TrafficRoutingError(format!("Failed to read response from HAProxy: {}", e))
        })?;

        debug!(command = command.trim_end(), response = response.trim_end(), "HAProxy command");
        Ok(response)
    }

    async fn set_weight(&self, server: &str, weight: u8) -> Result<()> {
        let command = format!("set weight {}/{} {}\n", self.backend, server, weight);
        let response = self.send_haproxy_command(&command).await?;
        // The runtime API answers a successful `set weight` with an empty line.
        if !response.trim().is_empty() {
            return Err(AppError::TrafficRoutingError(format!(
                "HAProxy rejected weight for {}/{}: {}",
                self.backend,
                server,
                response.trim()
            )));
        }
        Ok(())
    }

    async fn get_weight(&self, server: &str) -> Result<u8> {
        let command = format!("get weight {}/{}\n", self.backend, server);
        let response = self.send_haproxy_command(&command).await?;
        response
            .split_whitespace()
            .next()
            .and_then(|w| w.parse::<u8>().ok())
            .ok_or_else(|| {
                AppError::TrafficRoutingError(format!(
                    "Unexpected HAProxy weight response for {}/{}: {}",
                    self.backend,
                    server,
                    response.trim()
                ))
            })
    }
}

#[async_trait]
impl TrafficRouter for HAProxyAdapter {
    async fn apply_weights(&self, weights: TrafficWeights) -> Result<()> {
        // Raise the receiving side first so the backend never has both at zero.
        if weights.green >= weights.blue {
            self.set_weight(&self.green_server, weights.green).await?;
            self.set_weight(&self.blue_server, weights.blue).await?;
        } else {
            self.set_weight(&self.blue_server, weights.blue).await?;
            self.set_weight(&self.green_server, weights.green).await?;
        }

        info!(
            blue_weight = weights.blue,
            green_weight = weights.green,
            "Applied traffic split via HAProxy"
        );
        Ok(())
    }

    async fn current_weights(&self) -> Result<TrafficWeights> {
        let blue = self.get_weight(&self.blue_server).await?;
        let green = self.get_weight(&self.green_server).await?;
        TrafficWeights::new(blue, green)
    }
}

/// Router that only records what it was asked to do.
pub struct InMemoryTrafficRouter {
    current: Arc<RwLock<TrafficWeights>>,
    history: Arc<RwLock<Vec<TrafficWeights>>>,
}

impl InMemoryTrafficRouter {
    pub fn new() -> Self {
        Self {
            current: Arc::new(RwLock::new(TrafficWeights::all_blue())),
            history: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Every split applied so far, oldest first.
    pub async fn history(&self) -> Vec<TrafficWeights> {
        self.history.read().await.clone()
    }
}

impl Default for InMemoryTrafficRouter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TrafficRouter for InMemoryTrafficRouter {
    async fn apply_weights(&self, weights: TrafficWeights) -> Result<()> {
        *self.current.write().await = weights;
        self.history.write().await.push(weights);
        info!(
            blue_weight = weights.blue,
            green_weight = weights.green,
            "Applied traffic split"
        );
        Ok(())
    }

    async fn current_weights(&self) -> Result<TrafficWeights> {
        Ok(*self.current.read().await)
    }
}
