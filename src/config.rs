use crate::error::LoraNsError;
use anyhow::{Context, Result};
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Largest NetID that fits the 24-bit Join-Accept field
pub const MAX_NETWORK_ID: u32 = 0x00FF_FFFF;

#[derive(Debug, Clone)]
pub struct Config {
    pub gateway: GatewayConfig,
    pub server: ServerConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind_addr: SocketAddr,
    /// Accept traffic from gateways that aren't registered
    pub disable_gateway_checks: bool,
    /// Expected time from handing a frame to the socket until the gateway has it
    pub assumed_latency: Duration,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub network_id: u32,
    /// Time budget from uplink receipt until the downlink must be scheduled
    pub rx_delay: Duration,
    /// Per-subscriber buffer length for event routers
    pub event_channel_length: usize,
    pub provision_file: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub plain: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            gateway: GatewayConfig {
                bind_addr: SocketAddr::from(([0, 0, 0, 0], 8000)),
                disable_gateway_checks: false,
                assumed_latency: Duration::from_millis(200),
            },
            server: ServerConfig {
                network_id: 0,
                rx_delay: Duration::from_millis(200),
                event_channel_length: 16,
                provision_file: None,
            },
            log: LogConfig { plain: false },
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (for development)
        dotenvy::dotenv().ok();

        let defaults = Config::default();

        let gateway = GatewayConfig {
            bind_addr: parse_env("LORANS_GATEWAY_BIND_ADDR", defaults.gateway.bind_addr)?,
            disable_gateway_checks: parse_env("LORANS_DISABLE_GATEWAY_CHECKS", false)?,
            assumed_latency: Duration::from_millis(parse_env(
                "LORANS_ASSUMED_LATENCY_MS",
                200,
            )?),
        };

        let server = ServerConfig {
            network_id: parse_network_id("LORANS_NETWORK_ID")?,
            rx_delay: Duration::from_millis(parse_env("LORANS_RX_DELAY_MS", 200)?),
            event_channel_length: parse_env("LORANS_EVENT_CHANNEL_LENGTH", 16)?,
            provision_file: env::var("LORANS_PROVISION_FILE").ok().map(PathBuf::from),
        };

        let log = LogConfig {
            plain: parse_env("LORANS_LOG_PLAIN", false)?,
        };

        Ok(Config {
            gateway,
            server,
            log,
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.network_id > MAX_NETWORK_ID {
            return Err(LoraNsError::ConfigError(format!(
                "Network ID {:#x} doesn't fit in 24 bits",
                self.server.network_id
            ))
            .into());
        }

        if self.server.event_channel_length == 0 {
            return Err(LoraNsError::ConfigError(
                "LORANS_EVENT_CHANNEL_LENGTH must be at least 1".to_string(),
            )
            .into());
        }

        if let Some(ref path) = self.server.provision_file {
            if !path.exists() {
                return Err(LoraNsError::ConfigError(format!(
                    "Provisioning file not found: {:?}",
                    path
                ))
                .into());
            }
        }

        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    env::var(key)
        .ok()
        .map(|s| {
            s.parse().map_err(|e| {
                anyhow::anyhow!("Failed to parse {}: {}", key, e)
            })
        })
        .transpose()
        .map(|opt| opt.unwrap_or(default))
}

/// Decimal or 0x-prefixed hex
fn parse_network_id(key: &str) -> Result<u32> {
    match env::var(key) {
        Ok(s) => {
            let s = s.trim();
            let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
                Some(hex) => u32::from_str_radix(hex, 16),
                None => s.parse(),
            };
            parsed.with_context(|| format!("Failed to parse {}", key))
        }
        Err(_) => Ok(0),
    }
}
