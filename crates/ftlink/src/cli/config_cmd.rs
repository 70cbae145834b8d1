//! `config` subcommand — show current configuration and file path.

use std::path::Path;

use super::{Config, ConfigOutput, Result, kv, kv_indent, kv_width};

pub(super) fn cmd_config(json: bool, custom_path: Option<&Path>, save: bool) -> Result<()> {
    let config = super::load_config(custom_path);
    let config_path = custom_path.map(|p| p.to_path_buf()).or_else(Config::path);

    if save {
        match custom_path {
            Some(p) => config.save_to(p)?,
            None => config.save()?,
        }
        if !json && let Some(p) = &config_path {
            println!("Saved {}", p.display());
            println!();
        }
    }
    let config_exists = config_path.as_ref().map(|p| p.exists()).unwrap_or(false);

    let warnings = config.link_warnings();
    let errors: Vec<String> = match config.validate() {
        Ok(()) => Vec::new(),
        Err(errors) => errors.iter().map(|e| e.to_string()).collect(),
    };

    if json {
        let output = ConfigOutput {
            config_file: config_path.as_ref().map(|p| p.display().to_string()),
            config_file_exists: config_exists,
            link: config.link(),
            settings: config,
            warnings,
            errors,
        };
        println!("{}", serde_json::to_string_pretty(&output).unwrap());
        return Ok(());
    }

    // Human-readable output
    let w = kv_width(
        &["Config file:", "Link:"],
        &[
            "device_index:",
            "baud_rate:",
            "data_bits:",
            "stop_bits:",
            "parity:",
            "flow_control:",
            "read_timeout_ms:",
            "write_timeout_ms:",
            "buffer_capacity:",
            "channel_capacity:",
            "overflow_policy:",
            "idle_poll_min_ms:",
            "idle_poll_max_ms:",
        ],
    );

    match &config_path {
        Some(p) => {
            if config_exists {
                kv("Config file:", format_args!("{} (loaded)", p.display()), w);
            } else {
                kv(
                    "Config file:",
                    format_args!("{} (not found, using defaults)", p.display()),
                    w,
                );
            }
        }
        None => kv("Config file:", "(no config directory)", w),
    }
    kv("Link:", config.link(), w);
    println!();

    println!("Settings:");
    kv_indent("device_index:", config.device_index, w);
    kv_indent("baud_rate:", config.baud_rate, w);
    kv_indent("data_bits:", config.data_bits, w);
    kv_indent("stop_bits:", config.stop_bits, w);
    kv_indent("parity:", config.parity, w);
    kv_indent("flow_control:", config.flow_control, w);
    kv_indent("read_timeout_ms:", config.read_timeout_ms, w);
    kv_indent("write_timeout_ms:", config.write_timeout_ms, w);
    kv_indent("buffer_capacity:", config.buffer_capacity, w);
    kv_indent("channel_capacity:", config.channel_capacity, w);
    kv_indent("overflow_policy:", &config.overflow_policy, w);
    kv_indent("idle_poll_min_ms:", config.idle_poll_min_ms, w);
    kv_indent("idle_poll_max_ms:", config.idle_poll_max_ms, w);

    if !warnings.is_empty() || !errors.is_empty() {
        println!();
        println!("Problems:");
        for warning in &warnings {
            println!("  warning: {warning}");
        }
        for e in &errors {
            println!("  error:   {e}");
        }
    }
    Ok(())
}
