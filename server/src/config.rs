//! Runtime settings of one server process.

use crate::error::ServerError;
use shared::{ClientConfig, ColorIndex, GridDimensions, PALETTE_SIZE};
use std::time::Duration;

pub const DEFAULT_BATCH_WINDOW: Duration = Duration::from_millis(250);
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_BROADCAST_CONCURRENCY: usize = 64;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub dimensions: GridDimensions,
    /// Color of every cell of a freshly initialized grid. Must be identical
    /// across all processes sharing one store.
    pub fill_color: ColorIndex,
    pub batch_window: Duration,
    /// Deadline for a single send to a single session.
    pub send_timeout: Duration,
    /// A session that sends nothing for this long is closed.
    pub idle_timeout: Duration,
    pub ping_interval: Duration,
    pub handshake_timeout: Duration,
    /// Zero disables the per-session edit cooldown.
    pub pixel_cooldown: Duration,
    pub max_sessions: Option<usize>,
    /// Upper bound on concurrent sends within one broadcast.
    pub broadcast_concurrency: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            dimensions: GridDimensions::default(),
            fill_color: 0,
            batch_window: DEFAULT_BATCH_WINDOW,
            send_timeout: DEFAULT_SEND_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            ping_interval: DEFAULT_PING_INTERVAL,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            pixel_cooldown: Duration::ZERO,
            max_sessions: None,
            broadcast_concurrency: DEFAULT_BROADCAST_CONCURRENCY,
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), ServerError> {
        if self.dimensions.width == 0 || self.dimensions.height == 0 {
            return Err(ServerError::Config(format!(
                "grid must not be empty ({}x{})",
                self.dimensions.width, self.dimensions.height
            )));
        }
        if self.dimensions.width > i64::MAX as usize || self.dimensions.height > i64::MAX as usize
        {
            return Err(ServerError::Config(
                "grid dimensions exceed the wire coordinate range".to_string(),
            ));
        }
        if self.fill_color as usize >= PALETTE_SIZE {
            return Err(ServerError::Config(format!(
                "fill color {} is not a palette index",
                self.fill_color
            )));
        }
        if self.send_timeout.is_zero() || self.idle_timeout.is_zero() {
            return Err(ServerError::Config(
                "send and idle timeouts must be positive".to_string(),
            ));
        }
        if self.ping_interval.is_zero() {
            return Err(ServerError::Config(
                "ping interval must be positive".to_string(),
            ));
        }
        if self.broadcast_concurrency == 0 {
            return Err(ServerError::Config(
                "broadcast concurrency must be at least 1".to_string(),
            ));
        }
        if self.max_sessions == Some(0) {
            return Err(ServerError::Config(
                "max sessions must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Answer to a client `CONFIG` request.
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig::new(self.dimensions, self.pixel_cooldown.as_millis() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = ServerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.batch_window, Duration::from_millis(250));
        assert_eq!(config.send_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_rejects_empty_grid() {
        let config = ServerConfig {
            dimensions: GridDimensions::new(0, 10),
            ..ServerConfig::default()
        };
        assert!(matches!(config.validate(), Err(ServerError::Config(_))));
    }

    #[test]
    fn test_rejects_fill_outside_palette() {
        let config = ServerConfig {
            fill_color: PALETTE_SIZE as ColorIndex,
            ..ServerConfig::default()
        };
        assert!(matches!(config.validate(), Err(ServerError::Config(_))));
    }

    #[test]
    fn test_zero_window_is_allowed() {
        let config = ServerConfig {
            batch_window: Duration::ZERO,
            ..ServerConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_client_config_mirrors_settings() {
        let config = ServerConfig {
            dimensions: GridDimensions::new(64, 32),
            pixel_cooldown: Duration::from_secs(3),
            ..ServerConfig::default()
        };
        let document = config.client_config();
        assert_eq!(document.grid_width, 64);
        assert_eq!(document.grid_height, 32);
        assert_eq!(document.pixel_cooldown, 3000);
    }
}
