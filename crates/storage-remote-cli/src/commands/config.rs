//! Config command handlers

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

use storage_remote_core::Config;

use crate::output::{Output, OutputFormat};

fn effective_path(config_path: Option<&Path>) -> PathBuf {
    config_path
        .map(Path::to_path_buf)
        .unwrap_or_else(Config::config_file_path)
}

/// Show current configuration
pub fn show(config_path: Option<&Path>, output: &Output) -> Result<()> {
    let config =
        Config::load_with_cli_override(config_path).context("Failed to load configuration")?;

    match output.format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        OutputFormat::Quiet => {
            println!("{}", config.identifier);
        }
        OutputFormat::Human => {
            println!("Configuration:");
            println!("  identifier:               {}", config.identifier);
            println!(
                "  request_timeout_ms:       {}",
                config
                    .request_timeout_ms
                    .map(|ms| ms.to_string())
                    .unwrap_or_else(|| "(not set)".to_string())
            );
            println!(
                "  recently_closed_capacity: {}",
                config.recently_closed_capacity
            );
            println!("  channel_capacity:         {}", config.channel_capacity);
            println!("  log_level:                {}", config.log_level);
            println!();
            println!("Config file: {}", effective_path(config_path).display());
        }
    }

    Ok(())
}

/// Print the config file path
pub fn path(config_path: Option<&Path>, output: &Output) -> Result<()> {
    let path = effective_path(config_path);
    if output.is_json() {
        println!(
            "{}",
            serde_json::json!({ "path": path, "exists": path.exists() })
        );
    } else {
        println!("{}", path.display());
    }
    Ok(())
}

/// Set a configuration value
pub fn set(key: String, value: String, config_path: Option<&Path>, output: &Output) -> Result<()> {
    let mut config =
        Config::load_with_cli_override(config_path).context("Failed to load configuration")?;

    match key.as_str() {
        "identifier" => {
            if value.is_empty() {
                bail!("identifier must not be empty");
            }
            config.identifier = value.clone();
        }
        "request_timeout_ms" => {
            config.request_timeout_ms = if value.is_empty() || value == "none" {
                None
            } else {
                Some(
                    value
                        .parse()
                        .context("Invalid value for request_timeout_ms. Use milliseconds or 'none'.")?,
                )
            };
        }
        "recently_closed_capacity" => {
            config.recently_closed_capacity = value
                .parse()
                .context("Invalid value for recently_closed_capacity")?;
        }
        "channel_capacity" => {
            let capacity: usize = value
                .parse()
                .context("Invalid value for channel_capacity")?;
            if capacity == 0 {
                bail!("channel_capacity must be at least 1");
            }
            config.channel_capacity = capacity;
        }
        "log_level" => {
            config.log_level = value.clone();
        }
        _ => {
            bail!(
                "Unknown configuration key: '{}'\n\
                 Valid keys: identifier, request_timeout_ms, recently_closed_capacity, \
                 channel_capacity, log_level",
                key
            );
        }
    }

    config
        .save_to_path(&effective_path(config_path))
        .context("Failed to save configuration")?;

    output.success(&format!("Set {} = {}", key, value));

    Ok(())
}
