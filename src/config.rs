use anyhow::{Context, Result};
use serde::Deserialize;
use std::time::Duration;

use crate::audio::CaptureConfig;
use crate::transport::NatsTransportConfig;

/// Prefix for environment overrides, e.g. `LOQA_VOICE__TRANSPORT__NATS_URL`
const ENV_PREFIX: &str = "LOQA_VOICE";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub service: ServiceConfig,
    pub transport: TransportConfig,
    pub audio: AudioConfig,
    pub reconnect: ReconnectConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    pub http: HttpConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    pub bind: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransportConfig {
    pub nats_url: String,
    pub subject_prefix: String,
    pub outbound_capacity: usize,
    pub handshake_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AudioConfig {
    pub input_sample_rate: u32,
    pub output_sample_rate: u32,
    pub block_size: usize,
    pub channel_capacity: usize,
    pub level_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReconnectConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub reconfigure_quiet_ms: u64,
}

impl Config {
    /// Load `path` (extension optional, file optional) over built-in defaults,
    /// then apply environment overrides
    pub fn load(path: &str) -> Result<Self> {
        let settings = Self::builder()?
            .add_source(config::File::with_name(path).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("Failed to load config from {}", path))?;

        settings.try_deserialize().context("Invalid configuration")
    }

    /// Built-in defaults only
    pub fn defaults() -> Result<Self> {
        let settings = Self::builder()?.build()?;
        Ok(settings.try_deserialize()?)
    }

    fn builder() -> Result<config::ConfigBuilder<config::builder::DefaultState>> {
        Ok(config::Config::builder()
            .set_default("service.name", "loqa-voice")?
            .set_default("service.http.bind", "127.0.0.1")?
            .set_default("service.http.port", 3030i64)?
            .set_default("transport.nats_url", "nats://localhost:4222")?
            .set_default("transport.subject_prefix", "voice")?
            .set_default("transport.outbound_capacity", 32i64)?
            .set_default("transport.handshake_timeout_ms", 10_000i64)?
            .set_default("audio.input_sample_rate", 16_000i64)?
            .set_default("audio.output_sample_rate", 24_000i64)?
            .set_default("audio.block_size", 4096i64)?
            .set_default("audio.channel_capacity", 32i64)?
            .set_default("audio.level_interval_ms", 16i64)?
            .set_default("reconnect.max_attempts", 5i64)?
            .set_default("reconnect.base_delay_ms", 1000i64)?
            .set_default("reconnect.max_delay_ms", 30_000i64)?
            .set_default("reconnect.reconfigure_quiet_ms", 1500i64)?)
    }

    pub fn transport_config(&self) -> NatsTransportConfig {
        NatsTransportConfig {
            url: self.transport.nats_url.clone(),
            subject_prefix: self.transport.subject_prefix.clone(),
            outbound_capacity: self.transport.outbound_capacity,
            input_sample_rate: self.audio.input_sample_rate,
            output_sample_rate: self.audio.output_sample_rate,
            handshake_timeout: Duration::from_millis(self.transport.handshake_timeout_ms),
        }
    }

    pub fn capture_config(&self) -> CaptureConfig {
        CaptureConfig {
            block_size: self.audio.block_size,
            channel_capacity: self.audio.channel_capacity,
        }
    }
}
