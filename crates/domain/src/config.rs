//! Environment-driven configuration structures shared by the listener core
//! and the binary.

use std::collections::BTreeMap;
use std::env;
use std::time::Duration;

use thiserror::Error;

use crate::model::{ChainId, Position};

pub const DEFAULT_BLOCK_BACKOFF: Duration = Duration::from_secs(1);
pub const DEFAULT_BLOCK_LIMIT: usize = 40;

/// Exponential backoff parameters applied to individual chain client calls.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub initial_interval: Duration,
    pub multiplier: f32,
    /// Acts as a switch: any positive value enables jittered delays, whose
    /// spread is fixed by the backoff implementation. Zero keeps delays exact.
    pub randomization_factor: f32,
    pub max_interval: Duration,
    /// Total time budget across all retries of one call.
    pub max_elapsed_time: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(500),
            multiplier: 1.5,
            randomization_factor: 0.5,
            max_interval: Duration::from_secs(10),
            max_elapsed_time: Duration::from_secs(30),
        }
    }
}

/// Tunables of the listener core. Construct with `Default` or
/// [`ListenerConfig::load_from_env`].
#[derive(Debug, Clone, PartialEq)]
pub struct ListenerConfig {
    /// Interval between polls once the cursor has caught up or failed.
    pub backoff: Duration,
    /// Capacity of the per-session response queue and cap on in-flight
    /// receipt fetches.
    pub buffer_limit: usize,
    /// Blocks behind head considered final. Only the chain tracker reads it;
    /// blocks are emitted regardless.
    pub depth: u64,
    pub return_blocks: bool,
    pub return_errors: bool,
    pub retry: RetryConfig,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            backoff: DEFAULT_BLOCK_BACKOFF,
            buffer_limit: DEFAULT_BLOCK_LIMIT,
            depth: 0,
            return_blocks: false,
            return_errors: false,
            retry: RetryConfig::default(),
        }
    }
}

impl ListenerConfig {
    /// Reads the optional `LISTENER_*` tunables, falling back to defaults for
    /// anything unset.
    pub fn load_from_env() -> Result<Self, ConfigError> {
        hydrate_env_file()?;

        let defaults = Self::default();
        let retry = RetryConfig {
            initial_interval: parse_millis("LISTENER_RETRY_INITIAL_INTERVAL_MS")?
                .unwrap_or(defaults.retry.initial_interval),
            multiplier: parse_float("LISTENER_RETRY_MULTIPLIER")?
                .unwrap_or(defaults.retry.multiplier),
            randomization_factor: parse_float("LISTENER_RETRY_RANDOMIZATION_FACTOR")?
                .unwrap_or(defaults.retry.randomization_factor),
            max_interval: parse_millis("LISTENER_RETRY_MAX_INTERVAL_MS")?
                .unwrap_or(defaults.retry.max_interval),
            max_elapsed_time: parse_millis("LISTENER_RETRY_MAX_ELAPSED_TIME_MS")?
                .unwrap_or(defaults.retry.max_elapsed_time),
        };

        let buffer_limit = match parse_number("LISTENER_BLOCK_LIMIT")? {
            Some(0) => {
                return Err(ConfigError::InvalidEntry {
                    key: "LISTENER_BLOCK_LIMIT",
                    entry: "0".to_string(),
                })
            }
            Some(limit) => limit as usize,
            None => defaults.buffer_limit,
        };

        Ok(Self {
            backoff: parse_millis("LISTENER_BLOCK_BACKOFF_MS")?.unwrap_or(defaults.backoff),
            buffer_limit,
            depth: parse_number("LISTENER_TRACKER_DEPTH")?.unwrap_or(defaults.depth),
            return_blocks: parse_bool("LISTENER_RETURN_BLOCKS")?.unwrap_or(defaults.return_blocks),
            return_errors: parse_bool("LISTENER_RETURN_ERRORS")?.unwrap_or(defaults.return_errors),
            retry,
        })
    }
}

/// Where a session starts when the binary attaches it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPosition {
    /// Highest final block reported by the chain tracker.
    Latest,
    At(Position),
}

/// Everything the `tx-listener` binary needs to boot.
#[derive(Debug, Clone, PartialEq)]
pub struct BootstrapConfig {
    rpc_urls: BTreeMap<ChainId, String>,
    start: BTreeMap<ChainId, StartPosition>,
    listener: ListenerConfig,
}

impl BootstrapConfig {
    /// Loads configuration by hydrating `.env` (if present) and reading the
    /// required process variables. Missing or malformed entries surface as
    /// `ConfigError` so the binary can respond gracefully.
    pub fn load_from_env() -> Result<Self, ConfigError> {
        hydrate_env_file()?;

        let rpc_urls = parse_rpc_urls(&get_required_var("LISTENER_RPC_URLS")?)?;
        let start = match get_optional_var("LISTENER_START") {
            Some(raw) => parse_start_positions(&raw)?,
            None => BTreeMap::new(),
        };

        Ok(Self {
            rpc_urls,
            start,
            listener: ListenerConfig::load_from_env()?,
        })
    }

    pub fn rpc_urls(&self) -> &BTreeMap<ChainId, String> {
        &self.rpc_urls
    }

    /// Chains without an explicit entry start from the latest final block.
    pub fn start_position(&self, chain_id: ChainId) -> StartPosition {
        self.start
            .get(&chain_id)
            .copied()
            .unwrap_or(StartPosition::Latest)
    }

    pub fn listener(&self) -> &ListenerConfig {
        &self.listener
    }
}

/// Parses `<chain>=<url>[,<chain>=<url>...]`.
pub fn parse_rpc_urls(raw: &str) -> Result<BTreeMap<ChainId, String>, ConfigError> {
    let mut urls = BTreeMap::new();
    for entry in split_entries(raw) {
        let invalid = || ConfigError::InvalidEntry {
            key: "LISTENER_RPC_URLS",
            entry: entry.to_string(),
        };
        let (chain, url) = entry.split_once('=').ok_or_else(invalid)?;
        let chain: ChainId = chain.parse().map_err(|_| invalid())?;
        let url = url.trim();
        if url.is_empty() {
            return Err(invalid());
        }
        urls.insert(chain, url.to_string());
    }

    if urls.is_empty() {
        return Err(ConfigError::MissingVar {
            key: "LISTENER_RPC_URLS",
        });
    }
    Ok(urls)
}

/// Parses `<chain>:<block>[-<tx>]` or `<chain>:latest` entries.
pub fn parse_start_positions(
    raw: &str,
) -> Result<BTreeMap<ChainId, StartPosition>, ConfigError> {
    let mut positions = BTreeMap::new();
    for entry in split_entries(raw) {
        let invalid = || ConfigError::InvalidEntry {
            key: "LISTENER_START",
            entry: entry.to_string(),
        };
        let (chain, position) = entry.split_once(':').ok_or_else(invalid)?;
        let chain: ChainId = chain.parse().map_err(|_| invalid())?;
        let position = position.trim();

        let start = if position.eq_ignore_ascii_case("latest") {
            StartPosition::Latest
        } else {
            let (block, tx) = match position.split_once('-') {
                Some((block, tx)) => (block, Some(tx)),
                None => (position, None),
            };
            let block_number = block.trim().parse().map_err(|_| invalid())?;
            let tx_index = match tx {
                Some(tx) => tx.trim().parse().map_err(|_| invalid())?,
                None => 0,
            };
            StartPosition::At(Position::new(block_number, tx_index))
        };
        positions.insert(chain, start);
    }
    Ok(positions)
}

fn split_entries(raw: &str) -> impl Iterator<Item = &str> {
    raw.split(',').map(str::trim).filter(|entry| !entry.is_empty())
}

fn get_required_var(key: &'static str) -> Result<String, ConfigError> {
    get_optional_var(key).ok_or(ConfigError::MissingVar { key })
}

fn get_optional_var(key: &'static str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn parse_number(key: &'static str) -> Result<Option<u64>, ConfigError> {
    get_optional_var(key)
        .map(|value| {
            value
                .parse()
                .map_err(|source| ConfigError::InvalidNumber { key, source })
        })
        .transpose()
}

fn parse_millis(key: &'static str) -> Result<Option<Duration>, ConfigError> {
    Ok(parse_number(key)?.map(Duration::from_millis))
}

fn parse_float(key: &'static str) -> Result<Option<f32>, ConfigError> {
    get_optional_var(key)
        .map(|value| {
            value
                .parse::<f32>()
                .ok()
                .filter(|parsed| parsed.is_finite() && *parsed >= 0.0)
                .ok_or(ConfigError::InvalidEntry { key, entry: value })
        })
        .transpose()
}

fn parse_bool(key: &'static str) -> Result<Option<bool>, ConfigError> {
    get_optional_var(key)
        .map(|value| match value.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidEntry { key, entry: value }),
        })
        .transpose()
}

pub fn hydrate_env_file() -> Result<(), ConfigError> {
    if env::var_os("LISTENER_SKIP_DOTENV").is_some() {
        return Ok(());
    }
    match dotenvy::dotenv() {
        Ok(_) => {}
        Err(dotenvy::Error::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(ConfigError::Dotenv { source: err }),
    }

    Ok(())
}

/// Errors emitted when `.env` hydration or environment parsing fails.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable `{key}`")]
    MissingVar { key: &'static str },
    #[error("invalid integer in `{key}`: {source}")]
    InvalidNumber {
        key: &'static str,
        #[source]
        source: std::num::ParseIntError,
    },
    #[error("invalid entry `{entry}` in `{key}`")]
    InvalidEntry { key: &'static str, entry: String },
    #[error("failed to load .env file: {source}")]
    Dotenv {
        #[from]
        source: dotenvy::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_GUARD: Mutex<()> = Mutex::new(());

    const TUNABLES: &[&str] = &[
        "LISTENER_BLOCK_BACKOFF_MS",
        "LISTENER_BLOCK_LIMIT",
        "LISTENER_TRACKER_DEPTH",
        "LISTENER_RETURN_BLOCKS",
        "LISTENER_RETURN_ERRORS",
        "LISTENER_RETRY_INITIAL_INTERVAL_MS",
        "LISTENER_RETRY_MULTIPLIER",
        "LISTENER_RETRY_RANDOMIZATION_FACTOR",
        "LISTENER_RETRY_MAX_INTERVAL_MS",
        "LISTENER_RETRY_MAX_ELAPSED_TIME_MS",
        "LISTENER_START",
    ];

    fn reset_env() {
        std::env::set_var("LISTENER_SKIP_DOTENV", "1");
        std::env::set_var("LISTENER_RPC_URLS", "1=http://localhost:8545");
        for key in TUNABLES {
            std::env::remove_var(key);
        }
    }

    #[test]
    fn listener_config_defaults_when_unset() {
        let _guard = ENV_GUARD.lock().unwrap();
        reset_env();

        let config = ListenerConfig::load_from_env().expect("config loads");
        assert_eq!(config, ListenerConfig::default());
        assert_eq!(config.backoff, Duration::from_secs(1));
        assert_eq!(config.buffer_limit, 40);
        assert!(!config.return_blocks);
        assert!(!config.return_errors);
    }

    #[test]
    fn listener_config_reads_env() {
        let _guard = ENV_GUARD.lock().unwrap();
        reset_env();
        std::env::set_var("LISTENER_BLOCK_BACKOFF_MS", "250");
        std::env::set_var("LISTENER_BLOCK_LIMIT", " 20 ");
        std::env::set_var("LISTENER_TRACKER_DEPTH", "12");
        std::env::set_var("LISTENER_RETURN_BLOCKS", "true");
        std::env::set_var("LISTENER_RETURN_ERRORS", "1");
        std::env::set_var("LISTENER_RETRY_MULTIPLIER", "2");

        let config = ListenerConfig::load_from_env().expect("config loads");
        assert_eq!(config.backoff, Duration::from_millis(250));
        assert_eq!(config.buffer_limit, 20);
        assert_eq!(config.depth, 12);
        assert!(config.return_blocks);
        assert!(config.return_errors);
        assert_eq!(config.retry.multiplier, 2.0);

        reset_env();
    }

    #[test]
    fn zero_block_limit_is_rejected() {
        let _guard = ENV_GUARD.lock().unwrap();
        reset_env();
        std::env::set_var("LISTENER_BLOCK_LIMIT", "0");

        let err = ListenerConfig::load_from_env().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidEntry {
                key: "LISTENER_BLOCK_LIMIT",
                ..
            }
        ));

        reset_env();
    }

    #[test]
    fn malformed_flag_is_rejected() {
        let _guard = ENV_GUARD.lock().unwrap();
        reset_env();
        std::env::set_var("LISTENER_RETURN_ERRORS", "maybe");

        let err = ListenerConfig::load_from_env().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidEntry {
                key: "LISTENER_RETURN_ERRORS",
                ..
            }
        ));

        reset_env();
    }

    #[test]
    fn bootstrap_requires_rpc_urls() {
        let _guard = ENV_GUARD.lock().unwrap();
        reset_env();
        std::env::set_var("LISTENER_RPC_URLS", "   ");

        let err = BootstrapConfig::load_from_env().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::MissingVar {
                key: "LISTENER_RPC_URLS"
            }
        ));

        reset_env();
    }

    #[test]
    fn bootstrap_reads_start_positions() {
        let _guard = ENV_GUARD.lock().unwrap();
        reset_env();
        std::env::set_var(
            "LISTENER_RPC_URLS",
            "1=http://mainnet:8545, 5=http://goerli:8545",
        );
        std::env::set_var("LISTENER_START", "1:2348721-5");

        let config = BootstrapConfig::load_from_env().expect("config loads");
        assert_eq!(config.rpc_urls().len(), 2);
        assert_eq!(
            config.start_position(ChainId::new(1)),
            StartPosition::At(Position::new(2348721, 5))
        );
        assert_eq!(
            config.start_position(ChainId::new(5)),
            StartPosition::Latest
        );

        reset_env();
    }

    #[test]
    fn start_positions_accept_latest_and_bare_blocks() {
        let positions = parse_start_positions("3:latest,42:100").expect("parses");
        assert_eq!(positions[&ChainId::new(3)], StartPosition::Latest);
        assert_eq!(
            positions[&ChainId::new(42)],
            StartPosition::At(Position::new(100, 0))
        );
    }

    #[test]
    fn malformed_entries_are_reported() {
        assert!(matches!(
            parse_start_positions("42-100"),
            Err(ConfigError::InvalidEntry {
                key: "LISTENER_START",
                ..
            })
        ));
        assert!(matches!(
            parse_rpc_urls("abc=http://node"),
            Err(ConfigError::InvalidEntry {
                key: "LISTENER_RPC_URLS",
                ..
            })
        ));
        assert!(matches!(
            parse_rpc_urls("1="),
            Err(ConfigError::InvalidEntry { .. })
        ));
    }
}
