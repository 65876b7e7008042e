//! Storage, scheduler, logging and metrics KDL parsing.

use anyhow::Result;
use std::path::PathBuf;
use tracing::trace;

use crate::{LogFormat, LoggingConfig, MetricsConfig, SchedulerConfig, StorageConfig};

use super::helpers::{get_string_entry, get_u64_entry, get_usize_entry};

/// Parse storage configuration block
pub fn parse_storage_config(node: &kdl::KdlNode) -> Result<StorageConfig> {
    let mut config = StorageConfig::default();
    if let Some(path) = get_string_entry(node, "path") {
        config.path = PathBuf::from(path);
    }

    trace!(path = %config.path.display(), "Parsed storage configuration");
    Ok(config)
}

/// Parse scheduler configuration block
pub fn parse_scheduler_config(node: &kdl::KdlNode) -> Result<SchedulerConfig> {
    trace!("Parsing scheduler configuration block");
    let defaults = SchedulerConfig::default();

    let config = SchedulerConfig {
        tick_interval_secs: get_u64_entry(node, "tick-interval-secs")?
            .unwrap_or(defaults.tick_interval_secs),
        pool_size: get_usize_entry(node, "pool-size")?.unwrap_or(defaults.pool_size),
        horizon_secs: get_u64_entry(node, "horizon-secs")?.unwrap_or(defaults.horizon_secs),
        shutdown_timeout_secs: get_u64_entry(node, "shutdown-timeout-secs")?
            .unwrap_or(defaults.shutdown_timeout_secs),
    };

    trace!(
        tick_interval_secs = config.tick_interval_secs,
        pool_size = config.pool_size,
        horizon_secs = config.horizon_secs,
        "Parsed scheduler configuration"
    );
    Ok(config)
}

/// Parse logging configuration block
pub fn parse_logging_config(node: &kdl::KdlNode) -> Result<LoggingConfig> {
    let mut config = LoggingConfig::default();

    if let Some(level) = get_string_entry(node, "level") {
        config.level = level;
    }

    if let Some(format) = get_string_entry(node, "format") {
        config.format = match format.to_lowercase().as_str() {
            "pretty" | "text" => LogFormat::Pretty,
            "json" => LogFormat::Json,
            other => {
                return Err(anyhow::anyhow!(
                    "Invalid log format '{}'. Valid formats: pretty, json",
                    other
                ));
            }
        };
    }

    Ok(config)
}

/// Parse metrics configuration block
pub fn parse_metrics_config(node: &kdl::KdlNode) -> Result<MetricsConfig> {
    Ok(MetricsConfig {
        textfile: get_string_entry(node, "textfile").map(PathBuf::from),
    })
}
