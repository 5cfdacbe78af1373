use std::{path::PathBuf, time::Duration};

use crate::{monitor::MonitorOptions, transfer::TransferOptions};

pub const DEFAULT_SHELLCODE_PATH: &str = "payloads/checkra1n/shellcode.bin";
pub const DEFAULT_IMAGE_PATH: &str = "payloads/checkra1n/Pongo.bin";
pub const DEFAULT_FIND_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything one boot attempt needs, fixed once at start-up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootConfig {
    pub shellcode: PathBuf,
    pub image: PathBuf,
    pub log_level: tracing::Level,
    /// Poll for PongoOS after the handoff.
    pub confirm_boot: bool,
    /// Skip checking that the device is in pwned DFU mode before sending.
    pub force: bool,
    /// How long to wait for the DFU device to show up.
    pub find_timeout: Duration,
    /// How long to wait for the device after the handoff. `None` waits forever.
    pub ready_timeout: Option<Duration>,
    pub transfer: TransferOptions,
    pub monitor: MonitorOptions,
}

impl BootConfig {
    pub fn new(shellcode: impl Into<PathBuf>, image: impl Into<PathBuf>) -> Self {
        Self {
            shellcode: shellcode.into(),
            image: image.into(),
            log_level: tracing::Level::INFO,
            confirm_boot: true,
            force: false,
            find_timeout: DEFAULT_FIND_TIMEOUT,
            ready_timeout: None,
            transfer: TransferOptions::default(),
            monitor: MonitorOptions::default(),
        }
    }
}

impl Default for BootConfig {
    fn default() -> Self {
        Self::new(DEFAULT_SHELLCODE_PATH, DEFAULT_IMAGE_PATH)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Cannot use --log-level together with -v or -d")]
    ConflictingLogLevel,
    #[error("Boot timeout must be greater than zero")]
    ZeroDeadline,
    #[error("Poll interval must be greater than zero")]
    ZeroPollInterval,
    #[error("Poll interval ({poll_interval:?}) must be shorter than the boot timeout ({deadline:?})")]
    PollIntervalTooLong {
        poll_interval: Duration,
        deadline: Duration,
    },
    #[error("Cannot use --max-chunk-retries 0, at least one attempt is needed")]
    ZeroRetryLimit,
    #[error("Cannot use --boot-timeout or --poll-interval with --no-wait")]
    ConfirmationOptionsWithoutConfirmation,
}

/// Checks a configuration for values that cannot work together.
pub fn validate(config: &BootConfig) -> Result<(), ConfigError> {
    if config.transfer.chunk_retry_limit == Some(0) {
        return Err(ConfigError::ZeroRetryLimit);
    }

    let MonitorOptions {
        deadline,
        poll_interval,
    } = config.monitor;

    if deadline.is_zero() {
        return Err(ConfigError::ZeroDeadline);
    }
    if poll_interval.is_zero() {
        return Err(ConfigError::ZeroPollInterval);
    }
    if poll_interval >= deadline {
        return Err(ConfigError::PollIntervalTooLong {
            poll_interval,
            deadline,
        });
    }

    Ok(())
}
