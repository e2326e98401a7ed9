//! ==============================================================================
//! config.rs - Gateway Configuration Loader
//! ==============================================================================
//!
//! purpose:
//!     defines the schema for `gateway.toml`.
//!     loads configuration from file or falls back to defaults.
//!
//! structure:
//!     - GatewaySection: operating mode and fallback identity.
//!     - MeshConfig: mesh socket, multicast group, resource path, self-publish.
//!     - WifiConfig / CloudConfig: uplink credentials and the http endpoint.
//!     - AlternationConfig: cycle period and per-step settle delays.
//!     - LifecycleConfig: enable/disable bounded waits.
//!     - SensorsConfig, IndicatorConfig, StatusConfig, LoggingConfig.
//!
//! ==============================================================================

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct GatewayConfig {
    #[serde(default)]
    pub gateway: GatewaySection,
    #[serde(default)]
    pub mesh: MeshConfig,
    #[serde(default)]
    pub wifi: WifiConfig,
    #[serde(default)]
    pub cloud: CloudConfig,
    #[serde(default)]
    pub alternation: AlternationConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    #[serde(default)]
    pub sensors: SensorsConfig,
    #[serde(default)]
    pub indicators: IndicatorConfig,
    #[serde(default)]
    pub status: StatusConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum GatewayMode {
    /// mesh most of the time, wifi once per alternation cycle
    #[default]
    Alternating,
    /// no mesh; wifi and the periodic http sender stay up
    WifiOnly,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct GatewaySection {
    pub mode: GatewayMode,
    /// address used in the gateway's own envelope when the mesh has none
    pub fallback_address: String,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            mode: GatewayMode::Alternating,
            fallback_address: "unknown".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MeshConfig {
    pub bind: String,
    pub group: String,
    pub port: u16,
    pub resource: String,
    /// receive buffer; longer payloads are truncated to max_payload - 1 bytes
    pub max_payload: usize,
    pub publish_self: bool,
    pub publish_interval_ms: u64,
    pub network_name: String,
    pub pan_id: u16,
    pub channel: u8,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            bind: "[::]:5683".to_string(),
            group: "ff03::1".to_string(),
            port: 5683,
            resource: "sensor".to_string(),
            max_payload: 256,
            publish_self: true,
            publish_interval_ms: 10_000,
            network_name: "meshlink".to_string(),
            pan_id: 0x7974,
            channel: 15,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct WifiConfig {
    pub ssid: String,
    pub password: String,
    /// association time of the simulated driver
    pub associate_ms: u64,
}

impl Default for WifiConfig {
    fn default() -> Self {
        Self {
            ssid: "gateway-uplink".to_string(),
            password: String::new(),
            associate_ms: 500,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CloudConfig {
    pub host: String,
    pub port: u16,
    pub path: String,
    pub user_agent: String,
    /// header carrying the address of the node that produced the reading
    pub origin_header: String,
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub max_request_bytes: usize,
    /// period of the HttpEgress worker (wifi_only mode)
    pub interval_ms: u64,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 80,
            path: "/data".to_string(),
            user_agent: "meshlink-gateway".to_string(),
            origin_header: "X-Origin-Node".to_string(),
            connect_timeout_ms: 10_000,
            read_timeout_ms: 5_000,
            max_request_bytes: 1024,
            interval_ms: 10_000,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AlternationConfig {
    pub interval_ms: u64,
    pub radio_release_ms: u64,
    pub wifi_associate_ms: u64,
    pub sensor_sample_ms: u64,
    pub wifi_release_ms: u64,
}

impl Default for AlternationConfig {
    fn default() -> Self {
        Self {
            interval_ms: 120_000,
            radio_release_ms: 1_000,
            wifi_associate_ms: 5_000,
            sensor_sample_ms: 2_000,
            wifi_release_ms: 1_000,
        }
    }
}

impl AlternationConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// total time a cycle spends in settle delays
    pub fn settle_total_ms(&self) -> u64 {
        self.radio_release_ms + self.wifi_associate_ms + self.sensor_sample_ms + self.wifi_release_ms
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LifecycleConfig {
    /// how long enable() waits for the worker to report active
    pub enable_timeout_ms: u64,
    /// how long disable() waits for the worker before aborting it
    pub disable_grace_ms: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            enable_timeout_ms: 3_000,
            disable_grace_ms: 1_000,
        }
    }
}

impl LifecycleConfig {
    pub fn enable_timeout(&self) -> Duration {
        Duration::from_millis(self.enable_timeout_ms)
    }

    pub fn disable_grace(&self) -> Duration {
        Duration::from_millis(self.disable_grace_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SensorsConfig {
    pub sample_interval_ms: u64,
    pub ready_attempts: u32,
    pub ready_interval_ms: u64,
}

impl Default for SensorsConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: 2_000,
            ready_attempts: 3,
            ready_interval_ms: 1_000,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct IndicatorConfig {
    pub mesh_pin: u8,
    pub wifi_pin: u8,
    pub http_pin: u8,
    pub sensors_pin: u8,
    pub boot_pin: u8,
}

impl Default for IndicatorConfig {
    fn default() -> Self {
        Self {
            mesh_pin: 15,
            wifi_pin: 19,
            http_pin: 21,
            sensors_pin: 22,
            boot_pin: 18,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StatusConfig {
    pub enabled: bool,
    pub bind: String,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: "127.0.0.1:3000".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub show_sensor_data: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            show_sensor_data: true,
        }
    }
}

impl GatewayConfig {
    /// Load configuration from file
    ///
    /// GATEWAY_WIFI_PASSWORD overrides the wifi password from the file.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| anyhow::anyhow!("Failed to read config file: {}", e))?;

        let mut config: GatewayConfig = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse config: {}", e))?;

        if let Ok(password) = std::env::var("GATEWAY_WIFI_PASSWORD") {
            tracing::info!("Using GATEWAY_WIFI_PASSWORD from environment");
            config.wifi.password = password;
        }

        config.validate()?;
        Ok(config)
    }

    /// Load with default fallback
    pub fn load_or_default() -> Self {
        let paths = [
            std::path::PathBuf::from("config").join("gateway.toml"),
            std::path::PathBuf::from("..").join("config").join("gateway.toml"),
        ];

        for path in &paths {
            if path.exists() {
                match Self::load(path) {
                    Ok(config) => {
                        tracing::info!(path = %path.display(), "configuration loaded");
                        return config;
                    }
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "failed to load configuration");
                    }
                }
            }
        }

        tracing::warn!("no config file found - using defaults");
        Self::default()
    }

    /// Validate configuration values
    pub fn validate(&self) -> anyhow::Result<()> {
        let alt = &self.alternation;
        if alt.interval_ms == 0 {
            anyhow::bail!("alternation.interval_ms must be greater than 0");
        }
        if alt.interval_ms < alt.settle_total_ms() {
            anyhow::bail!(
                "alternation.interval_ms ({}) is shorter than the cycle's settle delays ({})",
                alt.interval_ms,
                alt.settle_total_ms()
            );
        }

        if !(11..=26).contains(&self.mesh.channel) {
            anyhow::bail!("Invalid mesh channel: {} (must be 11-26)", self.mesh.channel);
        }
        if self.mesh.max_payload < 2 {
            anyhow::bail!("mesh.max_payload must be at least 2 bytes");
        }
        if self.mesh.publish_interval_ms == 0
            || self.cloud.interval_ms == 0
            || self.sensors.sample_interval_ms == 0
        {
            anyhow::bail!("periodic intervals (mesh publish, cloud, sensor sampling) must be greater than 0");
        }

        if self.cloud.host.trim().is_empty() {
            anyhow::bail!("cloud.host must not be empty");
        }
        if !self.cloud.path.starts_with('/') {
            anyhow::bail!("Invalid cloud path: {} (must start with /)", self.cloud.path);
        }
        let header = &self.cloud.origin_header;
        if header.is_empty() || !header.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-') {
            anyhow::bail!("Invalid cloud origin_header: {:?}", header);
        }

        if self.lifecycle.enable_timeout_ms == 0 {
            anyhow::bail!("lifecycle.enable_timeout_ms must be greater than 0");
        }

        Ok(())
    }

    /// Log configuration summary
    pub fn print_summary(&self) {
        tracing::info!(
            mode = ?self.gateway.mode,
            mesh = %format!("{} -> {}:{}/{}", self.mesh.bind, self.mesh.group, self.mesh.port, self.mesh.resource),
            cloud = %format!("{}:{}{}", self.cloud.host, self.cloud.port, self.cloud.path),
            alternation_s = self.alternation.interval_ms / 1000,
            log_level = %self.logging.level,
            "gateway configuration"
        );
    }
}
