use crate::domain::{Decimal, SettlementPolicy};
use crate::engine::CalibrationConfig;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub database_path: String,
    /// Policy used when a request does not name one.
    pub settlement_policy: SettlementPolicy,
    /// Coverage below this percentage is reported as insufficient.
    pub coverage_floor_pct: Decimal,
    pub calibration_tolerance_pct: Decimal,
    pub calibration_iteration_factor: usize,
    pub fold_workers: usize,
    /// Local feed directory imported at startup.
    pub feed_dir: Option<String>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnv(String),
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn parse_percentage(
    env_map: &HashMap<String, String>,
    key: &str,
    default: &str,
) -> Result<Decimal, ConfigError> {
    let raw = env_map.get(key).map(|s| s.as_str()).unwrap_or(default);
    let value = Decimal::from_str_canonical(raw.trim())
        .map_err(|_| ConfigError::InvalidValue(key.to_string(), "must be a decimal".to_string()))?;
    if value.is_negative() || value > Decimal::hundred() {
        return Err(ConfigError::InvalidValue(
            key.to_string(),
            format!("must be between 0 and 100, got {}", raw),
        ));
    }
    Ok(value)
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_map(std::env::vars().collect())
    }

    pub fn from_env_map(env_map: HashMap<String, String>) -> Result<Self, ConfigError> {
        let port = env_map
            .get("PORT")
            .map(|s| s.as_str())
            .unwrap_or("8080")
            .parse::<u16>()
            .map_err(|_| {
                ConfigError::InvalidValue("PORT".to_string(), "must be a valid u16".to_string())
            })?;

        let database_path = env_map
            .get("DATABASE_PATH")
            .cloned()
            .ok_or_else(|| ConfigError::MissingEnv("DATABASE_PATH".to_string()))?;

        let settlement_policy = env_map
            .get("SETTLEMENT_POLICY")
            .map(|s| s.as_str())
            .unwrap_or("asymmetric")
            .parse::<SettlementPolicy>()
            .map_err(|e| ConfigError::InvalidValue("SETTLEMENT_POLICY".to_string(), e))?;

        let coverage_floor_pct = parse_percentage(&env_map, "COVERAGE_FLOOR_PCT", "2")?;
        let calibration_tolerance_pct =
            parse_percentage(&env_map, "CALIBRATION_TOLERANCE_PCT", "5")?;

        let calibration_iteration_factor = env_map
            .get("CALIBRATION_ITERATION_FACTOR")
            .map(|s| s.as_str())
            .unwrap_or("3")
            .parse::<usize>()
            .map_err(|_| {
                ConfigError::InvalidValue(
                    "CALIBRATION_ITERATION_FACTOR".to_string(),
                    "must be a non-negative integer".to_string(),
                )
            })?;

        let fold_workers = match env_map.get("FOLD_WORKERS") {
            Some(raw) => match raw.parse::<usize>() {
                Ok(n) if n > 0 => n,
                _ => {
                    return Err(ConfigError::InvalidValue(
                        "FOLD_WORKERS".to_string(),
                        "must be a positive integer".to_string(),
                    ))
                }
            },
            None => default_workers(),
        };

        let feed_dir = env_map
            .get("FEED_DIR")
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        Ok(Config {
            port,
            database_path,
            settlement_policy,
            coverage_floor_pct,
            calibration_tolerance_pct,
            calibration_iteration_factor,
            fold_workers,
            feed_dir,
        })
    }

    pub fn calibration(&self) -> CalibrationConfig {
        CalibrationConfig {
            tolerance_pct: self.calibration_tolerance_pct,
            iteration_factor: self.calibration_iteration_factor,
        }
    }
}
