//! Bridge configuration: entirely environment-driven.

use bridging_core::{BridgingError, BridgingResult};

const DEFAULT_COMPRESS_LEVEL: u32 = 9;
const DEFAULT_PORT: u16 = 8000;

/// Resolved bridge configuration.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Token matched against the `bridging-token` header of gateway dials.
    pub token: String,
    /// gzip level for tunnel frames sent to the gateway.
    pub compress_level: u32,
    /// Public listen port.
    pub port: u16,
    /// CORS allow-lists applied to non-bridge paths.
    pub cors_allow_origins: Vec<String>,
    pub cors_allow_methods: Vec<String>,
    pub cors_allow_headers: Vec<String>,
}

impl BridgeConfig {
    /// Read configuration from the process environment.
    ///
    /// `BRIDGE_TOKEN` is required; everything else has a default.
    pub fn from_env() -> BridgingResult<Self> {
        let token = std::env::var("BRIDGE_TOKEN")
            .map_err(|_| BridgingError::Config("BRIDGE_TOKEN is not set".into()))?;
        if token.is_empty() {
            return Err(BridgingError::Config("BRIDGE_TOKEN is empty".into()));
        }

        let compress_level = match std::env::var("BRIDGE_COMPRESS_LEVEL") {
            Ok(v) => v.parse::<u32>().map_err(|e| {
                BridgingError::Config(format!("invalid BRIDGE_COMPRESS_LEVEL [{v}]: {e}"))
            })?,
            Err(_) => DEFAULT_COMPRESS_LEVEL,
        };

        let port = match std::env::var("PORT") {
            Ok(v) => v
                .parse::<u16>()
                .map_err(|e| BridgingError::Config(format!("invalid PORT [{v}]: {e}")))?,
            Err(_) => DEFAULT_PORT,
        };

        Ok(Self {
            token,
            compress_level,
            port,
            cors_allow_origins: csv_env("BRIDGE_CORS_ALLOW_ORIGINS"),
            cors_allow_methods: csv_env("BRIDGE_CORS_ALLOW_METHODS"),
            cors_allow_headers: csv_env("BRIDGE_CORS_ALLOW_HEADERS"),
        })
    }
}

fn csv_env(name: &str) -> Vec<String> {
    std::env::var(name)
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
