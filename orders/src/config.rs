//! Configuration management for the campus order workflow.
//!
//! Loads configuration from environment variables (and a `.env` file, if
//! present) with sensible defaults. A malformed value never aborts start-up:
//! it is logged and replaced by its default.

use campus_orders_runtime::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Default stock per menu item
pub const DEFAULT_STOCK: &str = "Pizza=50,Burger=50,Sushi=50,Salad=50,Taco=50,Sandwich=50,Pasta=50,Coffee=100";

/// `tracing` filter used when `RUST_LOG` is unset
pub const DEFAULT_LOG_FILTER: &str = "campus_orders=info";

/// Errors raised while parsing configuration values.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A stock entry is not of the form `Item=count`
    #[error("Invalid stock entry '{0}' (expected Item=count)")]
    InvalidStockEntry(String),

    /// The availability policy is neither `stock` nor `random:<rate>`
    #[error("Invalid availability policy '{0}' (expected 'stock' or 'random:<rate>')")]
    InvalidAvailability(String),
}

/// How Inventory Reservation decides whether an order can be served.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub enum AvailabilityPolicy {
    /// Pure function of the current stock counts
    #[default]
    Stock,
    /// Fail a share of orders at random, regardless of stock.
    ///
    /// The roll happens once per order id and is recorded, so redeliveries
    /// never re-roll.
    Random {
        /// Probability in `[0, 1]` that an order fails
        failure_rate: f64,
    },
}

impl FromStr for AvailabilityPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = s.trim();
        if value.eq_ignore_ascii_case("stock") {
            return Ok(Self::Stock);
        }

        value
            .strip_prefix("random:")
            .and_then(|rate| rate.trim().parse::<f64>().ok())
            .filter(|rate| (0.0..=1.0).contains(rate))
            .map(|failure_rate| Self::Random { failure_rate })
            .ok_or_else(|| ConfigError::InvalidAvailability(s.to_string()))
    }
}

impl fmt::Display for AvailabilityPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stock => write!(f, "stock"),
            Self::Random { failure_rate } => write!(f, "random:{failure_rate}"),
        }
    }
}

/// Parse `Item=count,Item=count` into a stock table.
///
/// # Errors
///
/// Returns [`ConfigError::InvalidStockEntry`] for the first entry that is
/// not `Item=count` with a non-blank item and a non-negative count.
pub fn parse_stock(s: &str) -> Result<BTreeMap<String, u32>, ConfigError> {
    s.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (item, count) = entry
                .split_once('=')
                .ok_or_else(|| ConfigError::InvalidStockEntry(entry.to_string()))?;
            let item = item.trim();
            let count = count
                .trim()
                .parse::<u32>()
                .map_err(|_| ConfigError::InvalidStockEntry(entry.to_string()))?;
            if item.is_empty() {
                return Err(ConfigError::InvalidStockEntry(entry.to_string()));
            }
            Ok((item.to_string(), count))
        })
        .collect()
}

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Name of the topic exchange
    pub exchange: String,
    /// Inventory Reservation settings
    pub inventory: InventoryConfig,
    /// Consumer loop settings
    pub consumer: ConsumerConfig,
    /// Publish retry settings
    pub publish: PublishConfig,
    /// Order Intake settings
    pub intake: IntakeConfig,
    /// Notification Dispatch settings
    pub notification: NotificationConfig,
    /// How long shutdown waits for each consumer
    pub shutdown_timeout: Duration,
    /// `tracing` filter directives (`RUST_LOG`)
    pub log_filter: String,
}

/// Inventory Reservation configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryConfig {
    /// Initial stock per item
    pub stock: BTreeMap<String, u32>,
    /// Availability decision policy
    pub availability: AvailabilityPolicy,
    /// Number of consumers sharing the `order_placed` queue
    pub workers: usize,
}

/// Consumer configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Wait before re-subscribing, and before requeueing a transient failure
    pub retry_delay: Duration,
}

/// Publish retry configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishConfig {
    /// Attempts per publish (including the first)
    pub max_attempts: u32,
    /// Delay before the first retry; doubles per attempt
    pub initial_delay: Duration,
}

/// Order Intake configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntakeConfig {
    /// Upper bound on waiting for the broker to accept `OrderPlaced`
    pub publish_timeout: Duration,
}

/// Notification Dispatch configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationConfig {
    /// Upper bound on a single notification attempt
    pub timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl Config {
    /// Load configuration from the process environment.
    ///
    /// Reads a `.env` file first when one exists.
    #[must_use]
    pub fn from_env() -> Self {
        if let Ok(path) = dotenvy::dotenv() {
            tracing::debug!(path = %path.display(), "Loaded .env file");
        }
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup.
    #[must_use]
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let stock = lookup("INVENTORY_STOCK")
            .and_then(|raw| match parse_stock(&raw) {
                Ok(stock) => Some(stock),
                Err(error) => {
                    tracing::warn!(error = %error, "Ignoring INVENTORY_STOCK, using default stock");
                    None
                },
            })
            .unwrap_or_else(default_stock);

        Self {
            exchange: lookup("CAMPUS_EXCHANGE")
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| "orders_exchange".to_string()),
            inventory: InventoryConfig {
                stock,
                availability: parse_or(&lookup, "INVENTORY_AVAILABILITY", AvailabilityPolicy::Stock),
                workers: parse_or(&lookup, "INVENTORY_WORKERS", 1_usize).max(1),
            },
            consumer: ConsumerConfig {
                retry_delay: Duration::from_millis(parse_or(&lookup, "CONSUMER_RETRY_DELAY_MS", 5000)),
            },
            publish: PublishConfig {
                max_attempts: parse_or(&lookup, "PUBLISH_MAX_ATTEMPTS", 5_u32).max(1),
                initial_delay: Duration::from_millis(parse_or(&lookup, "PUBLISH_INITIAL_DELAY_MS", 1000)),
            },
            intake: IntakeConfig {
                publish_timeout: Duration::from_millis(parse_or(&lookup, "INTAKE_PUBLISH_TIMEOUT_MS", 10_000)),
            },
            notification: NotificationConfig {
                timeout: Duration::from_millis(parse_or(&lookup, "NOTIFICATION_TIMEOUT_MS", 5000)),
            },
            shutdown_timeout: Duration::from_secs(parse_or(&lookup, "SHUTDOWN_TIMEOUT_SECS", 10)),
            log_filter: lookup("RUST_LOG").unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string()),
        }
    }

    /// Retry policy for publishes and topology declaration
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new()
            .with_max_attempts(self.publish.max_attempts)
            .with_initial_delay(self.publish.initial_delay)
    }
}

fn default_stock() -> BTreeMap<String, u32> {
    parse_stock(DEFAULT_STOCK).unwrap_or_default()
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr + fmt::Display,
{
    match lookup(key) {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, default = %default, "Malformed configuration value, using default");
            default
        }),
    }
}
