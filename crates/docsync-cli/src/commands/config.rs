//! Config command handlers

use std::path::PathBuf;

use anyhow::{bail, Context, Result};

use docsync_core::Config;

use crate::output::{Output, OutputFormat};

const VALID_KEYS: &str = "endpoint, resource_extension, log_level, log_file, \
     connection.error_wait_ms, connection.open_timeout_ms, connection.ping_period_ms, \
     connection.idle_timeout_ms, connection.max_recent_errors, \
     sync.update_debounce_ms, sync.request_timeout_ms";

/// Show current configuration
pub fn show(config_path: Option<&PathBuf>, output: &Output) -> Result<()> {
    let config =
        Config::load_with_cli_override(config_path).context("Failed to load configuration")?;

    match output.format {
        OutputFormat::Json => {
            let value = serde_json::to_value(&config).context("Failed to encode configuration")?;
            println!("{}", value);
        }
        OutputFormat::Quiet => {
            if let Some(ref endpoint) = config.endpoint {
                println!("{}", endpoint);
            }
        }
        OutputFormat::Human => {
            let effective_path = config_path
                .cloned()
                .unwrap_or_else(Config::config_file_path);
            println!("Configuration:");
            println!(
                "  endpoint:           {}",
                config.endpoint.as_deref().unwrap_or("(not set)")
            );
            println!("  resource_extension: {}", config.resource_extension);
            println!("  log_level:          {}", config.log_level);
            println!(
                "  log_file:           {}",
                config
                    .log_file
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "(not set)".to_string())
            );
            println!();
            println!("Connection:");
            println!(
                "  error_wait_ms:      {}",
                format_schedule(&config.connection.error_wait_ms)
            );
            println!("  open_timeout_ms:    {}", config.connection.open_timeout_ms);
            println!("  ping_period_ms:     {}", config.connection.ping_period_ms);
            println!("  idle_timeout_ms:    {}", config.connection.idle_timeout_ms);
            println!(
                "  max_recent_errors:  {}",
                config.connection.max_recent_errors
            );
            println!();
            println!("Sync:");
            println!("  update_debounce_ms: {}", config.sync.update_debounce_ms);
            println!("  request_timeout_ms: {}", config.sync.request_timeout_ms);
            println!();
            println!("Config file: {}", effective_path.display());
        }
    }

    Ok(())
}

/// Set a configuration value
pub fn set(
    key: String,
    value: String,
    config_path: Option<&PathBuf>,
    output: &Output,
) -> Result<()> {
    let mut config =
        Config::load_with_cli_override(config_path).context("Failed to load configuration")?;

    apply(&mut config, &key, &value)?;

    // Save to the CLI-specified path or default
    let save_path = config_path
        .cloned()
        .unwrap_or_else(Config::config_file_path);
    config
        .save_to_path(&save_path)
        .context("Failed to save configuration")?;

    output.success(&format!("Set {} = {}", key, value));

    Ok(())
}

fn apply(config: &mut Config, key: &str, value: &str) -> Result<()> {
    match key {
        "endpoint" => {
            config.endpoint = optional(value).map(|endpoint| endpoint.to_string());
        }
        "resource_extension" => {
            if value.is_empty() {
                bail!("resource_extension cannot be empty");
            }
            config.resource_extension = value.to_string();
        }
        "log_level" => {
            config.log_level = value.to_string();
        }
        "log_file" => {
            config.log_file = optional(value).map(PathBuf::from);
        }
        "connection.error_wait_ms" => {
            config.connection.error_wait_ms = parse_schedule(value)?;
        }
        "connection.open_timeout_ms" => {
            config.connection.open_timeout_ms = parse_number(key, value)?;
        }
        "connection.ping_period_ms" => {
            config.connection.ping_period_ms = parse_number(key, value)?;
        }
        "connection.idle_timeout_ms" => {
            config.connection.idle_timeout_ms = parse_number(key, value)?;
        }
        "connection.max_recent_errors" => {
            config.connection.max_recent_errors = parse_number(key, value)?;
        }
        "sync.update_debounce_ms" => {
            config.sync.update_debounce_ms = parse_number(key, value)?;
        }
        "sync.request_timeout_ms" => {
            config.sync.request_timeout_ms = parse_number(key, value)?;
        }
        _ => {
            bail!(
                "Unknown configuration key: '{}'\nValid keys: {}",
                key,
                VALID_KEYS
            );
        }
    }
    Ok(())
}

/// `""` and `"none"` clear an optional value
fn optional(value: &str) -> Option<&str> {
    if value.is_empty() || value == "none" {
        None
    } else {
        Some(value)
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid value for {}: '{}' is not a number", key, value))
}

/// Parse a comma separated list of milliseconds
fn parse_schedule(value: &str) -> Result<Vec<u64>> {
    let schedule = value
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| parse_number("connection.error_wait_ms", part))
        .collect::<Result<Vec<u64>>>()?;
    if schedule.is_empty() {
        bail!("connection.error_wait_ms needs at least one wait time");
    }
    Ok(schedule)
}

fn format_schedule(schedule: &[u64]) -> String {
    schedule
        .iter()
        .map(u64::to_string)
        .collect::<Vec<_>>()
        .join(",")
}
