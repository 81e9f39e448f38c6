use std::time::Duration;

use super::supervisor::RetryPolicy;
use crate::audio::{INPUT_SAMPLE_RATE, OUTPUT_SAMPLE_RATE};
use crate::config::Config;

/// Runtime settings for a `SessionController`
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Reconnect backoff after an unexpected close
    pub policy: RetryPolicy,

    /// Quiet period before persona edits trigger a restart
    /// Default: 1.5 seconds
    pub reconfigure_quiet: Duration,

    /// Rate the voice service expects for microphone audio
    pub input_sample_rate: u32,

    /// Rate of incoming synthesized speech
    pub output_sample_rate: u32,

    /// How often the playback actor refreshes the output level
    pub level_interval: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            policy: RetryPolicy::default(),
            reconfigure_quiet: Duration::from_millis(1500),
            input_sample_rate: INPUT_SAMPLE_RATE,
            output_sample_rate: OUTPUT_SAMPLE_RATE,
            level_interval: Duration::from_millis(16), // ~60 fps
        }
    }
}

impl From<&Config> for SessionSettings {
    fn from(config: &Config) -> Self {
        Self {
            policy: RetryPolicy {
                max_attempts: config.reconnect.max_attempts,
                base_delay: Duration::from_millis(config.reconnect.base_delay_ms),
                max_delay: Duration::from_millis(config.reconnect.max_delay_ms),
            },
            reconfigure_quiet: Duration::from_millis(config.reconnect.reconfigure_quiet_ms),
            input_sample_rate: config.audio.input_sample_rate,
            output_sample_rate: config.audio.output_sample_rate,
            level_interval: Duration::from_millis(config.audio.level_interval_ms.max(1)),
        }
    }
}
