use std::env;
use std::str::FromStr;

use chrono::Duration;
use dotenvy::dotenv;
use thiserror::Error;

pub const DEFAULT_NOTIFICATION_TOPIC: &str = "orchestration.notification";

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub kafka_url: Option<String>,
    pub notification_topic: String,
    pub settings: Settings,
    pub sweep_interval: std::time::Duration,
}

/// Tunables shared by the orchestration components.
#[derive(Clone, Debug)]
pub struct Settings {
    pub offer_ttl: Duration,
    pub checkout_ttl: Duration,
    pub estimated_delivery: Duration,
    pub conflict_retries: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            offer_ttl: Duration::minutes(30),
            checkout_ttl: Duration::minutes(15),
            estimated_delivery: Duration::minutes(45),
            conflict_retries: 3,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{name} has invalid value {value:?}")]
    Invalid { name: &'static str, value: String },
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv().ok();

        let defaults = Settings::default();
        let database_url =
            env::var("DATABASE_URL").map_err(|_| ConfigError::Missing("DATABASE_URL"))?;

        Ok(Self {
            database_url,
            kafka_url: env::var("KAFKA_URL").ok().filter(|url| !url.is_empty()),
            notification_topic: env::var("NOTIFICATION_TOPIC")
                .unwrap_or_else(|_| DEFAULT_NOTIFICATION_TOPIC.to_string()),
            settings: Settings {
                offer_ttl: parse_var("OFFER_TTL_MINUTES")?
                    .map(Duration::minutes)
                    .unwrap_or(defaults.offer_ttl),
                checkout_ttl: parse_var("CHECKOUT_TTL_MINUTES")?
                    .map(Duration::minutes)
                    .unwrap_or(defaults.checkout_ttl),
                estimated_delivery: parse_var("ESTIMATED_DELIVERY_MINUTES")?
                    .map(Duration::minutes)
                    .unwrap_or(defaults.estimated_delivery),
                conflict_retries: parse_var("CONFLICT_RETRIES")?
                    .unwrap_or(defaults.conflict_retries),
            },
            sweep_interval: std::time::Duration::from_secs(
                parse_var("SWEEP_INTERVAL_SECS")?.unwrap_or(60),
            ),
        })
    }
}

fn parse_var<T: FromStr>(name: &'static str) -> Result<Option<T>, ConfigError> {
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { name, value }),
        Err(_) => Ok(None),
    }
}
