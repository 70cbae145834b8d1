//! `devices` subcommand — list attached FTDI bridges.

use std::path::Path;

use super::{DevicesOutput, Result};

pub(super) fn cmd_devices(json: bool, config_path: Option<&Path>) -> Result<()> {
    let config = super::load_config(config_path);
    let manager = super::manager(&config);

    // An unreachable USB stack lists as empty rather than failing the command
    let (devices, error) = match manager.devices() {
        Ok(devices) => (devices, None),
        Err(e) => {
            log::warn!("[device] {e}");
            (Vec::new(), Some(e.to_string()))
        }
    };

    if json {
        let output = DevicesOutput {
            count: devices.len(),
            devices,
            error,
        };
        println!("{}", serde_json::to_string_pretty(&output).unwrap());
        return Ok(());
    }

    if devices.is_empty() {
        println!("No FTDI USB-UART bridges found.");
        return Ok(());
    }

    println!(
        "Found {} bridge{}:",
        devices.len(),
        if devices.len() == 1 { "" } else { "s" }
    );
    println!();

    for (i, dev) in devices.iter().enumerate() {
        println!("  [{i}] {}", dev.path);
        if let Some(ref description) = dev.description {
            println!("      Product: {description}");
        }
        if let Some(ref serial) = dev.serial {
            println!("      Serial:  {serial}");
        }
    }

    Ok(())
}
