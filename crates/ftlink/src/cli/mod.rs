//! CLI subcommands — device listing, configuration, monitoring, sending.

mod config_cmd;
mod devices;
mod monitor;
mod send;

use std::path::Path;

use clap::{Args, Subcommand};
use serde::Serialize;

pub(super) use crate::RUNNING;
pub(super) use ftlink_lib::config::Config;
pub(super) use ftlink_lib::device::{DiscoveredDevice, PlatformAccess};
pub(super) use ftlink_lib::error::{FtlinkError, Result};
pub(super) use ftlink_lib::{ConnectionManager, LinkConfiguration};

const PADDING: usize = 2;

/// Compute alignment width for a command's key-value output.
/// Ensures at least PADDING spaces after the longest key in either level,
/// with top-level and indent values aligned to the same column.
pub(super) fn kv_width(top: &[&str], indent: &[&str]) -> usize {
    let top_max = top.iter().map(|k| k.len()).max().unwrap_or(0);
    let indent_max = indent.iter().map(|k| k.len()).max().unwrap_or(0);
    let top_need = if top.is_empty() { 0 } else { top_max + PADDING };
    // Indent keys lose 2 chars of inner width to the "  " prefix
    let indent_need = if indent.is_empty() {
        0
    } else {
        indent_max + PADDING + 2
    };
    top_need.max(indent_need)
}

pub(super) fn format_kv(key: &str, value: impl std::fmt::Display, w: usize) -> String {
    format!("{key:<width$}{value}", width = w)
}

pub(super) fn kv(key: &str, value: impl std::fmt::Display, w: usize) {
    println!("{key:<width$}{value}", width = w);
}

pub(super) fn kv_indent(key: &str, value: impl std::fmt::Display, w: usize) {
    println!("  {key:<width$}{value}", width = w - 2);
}

// ── Config + manager helpers ──

/// Load config from `custom_path` or the default location, logging parse
/// warnings.
pub(super) fn load_config(custom_path: Option<&Path>) -> Config {
    let (config, warnings) = match custom_path {
        Some(p) => Config::load_from(p),
        None => Config::load_with_warnings(),
    };
    for w in &warnings {
        log::warn!("{w}");
    }
    config
}

/// Reject configs that cannot drive a link, listing every problem.
pub(super) fn validated(config: &Config) -> Result<()> {
    if let Err(errors) = config.validate() {
        let msg = errors
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("; ");
        return Err(FtlinkError::Config(msg));
    }
    for w in config.link_warnings() {
        log::warn!("[config] {w}");
    }
    Ok(())
}

pub(super) fn manager(config: &Config) -> ConnectionManager<PlatformAccess> {
    ConnectionManager::with_timeouts(
        PlatformAccess::new(),
        config.read_timeout(),
        config.write_timeout(),
    )
}

// ── Hex helpers ──

/// Space-separated uppercase hex, e.g. `41 54 0D 0A`.
pub(super) fn format_hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Parse hex bytes; whitespace, `:` and `,` separators are ignored and an
/// optional `0x` prefix per byte is accepted.
pub(super) fn parse_hex(s: &str) -> std::result::Result<Vec<u8>, String> {
    let mut digits = String::new();
    for token in s.split(|c: char| c.is_whitespace() || c == ':' || c == ',') {
        let token = token
            .strip_prefix("0x")
            .or_else(|| token.strip_prefix("0X"))
            .unwrap_or(token);
        if let Some(bad) = token.chars().find(|c| !c.is_ascii_hexdigit()) {
            return Err(format!("invalid hex digit '{bad}' in \"{token}\""));
        }
        digits.push_str(token);
    }
    if digits.len() % 2 != 0 {
        return Err(format!("odd number of hex digits in \"{s}\""));
    }
    // All ASCII from here, so byte pairs are char pairs
    digits
        .as_bytes()
        .chunks(2)
        .map(|pair| {
            let pair = std::str::from_utf8(pair).map_err(|e| e.to_string())?;
            u8::from_str_radix(pair, 16).map_err(|_| format!("invalid hex byte \"{pair}\""))
        })
        .collect()
}

// ── Link overrides ──

fn parse_parity(s: &str) -> std::result::Result<i64, String> {
    match s.to_ascii_lowercase().as_str() {
        "none" | "n" => Ok(0),
        "odd" | "o" => Ok(1),
        "even" | "e" => Ok(2),
        "mark" | "m" => Ok(3),
        "space" | "s" => Ok(4),
        other => other
            .parse()
            .map_err(|_| format!("expected none/odd/even/mark/space or a code, got \"{s}\"")),
    }
}

fn parse_flow(s: &str) -> std::result::Result<i64, String> {
    match s.to_ascii_lowercase().as_str() {
        "none" => Ok(0),
        "rts-cts" | "rtscts" | "hw" => Ok(1),
        "dtr-dsr" | "dtrdsr" => Ok(2),
        "xon-xoff" | "xonxoff" | "sw" => Ok(3),
        other => other
            .parse()
            .map_err(|_| format!("expected none/rts-cts/dtr-dsr/xon-xoff or a code, got \"{s}\"")),
    }
}

/// Per-invocation overrides of the config file's link settings.
#[derive(Args, Debug, Clone, Default)]
pub struct LinkArgs {
    /// Device index (see `ftlink devices`)
    #[arg(short, long)]
    device: Option<usize>,
    /// Baud rate
    #[arg(short, long)]
    baud: Option<u32>,
    /// Data bits (7 or 8)
    #[arg(long)]
    data_bits: Option<i64>,
    /// Stop bits (1 or 2)
    #[arg(long)]
    stop_bits: Option<i64>,
    /// Parity: none, odd, even, mark, space
    #[arg(long, value_parser = parse_parity)]
    parity: Option<i64>,
    /// Flow control: none, rts-cts, dtr-dsr, xon-xoff
    #[arg(long, value_parser = parse_flow)]
    flow: Option<i64>,
}

impl LinkArgs {
    pub(super) fn apply_to(&self, config: &mut Config) {
        if let Some(d) = self.device {
            config.device_index = d;
        }
        if let Some(b) = self.baud {
            config.baud_rate = b;
        }
        if let Some(v) = self.data_bits {
            config.data_bits = v;
        }
        if let Some(v) = self.stop_bits {
            config.stop_bits = v;
        }
        if let Some(v) = self.parity {
            config.parity = v;
        }
        if let Some(v) = self.flow {
            config.flow_control = v;
        }
    }
}

// ── JSON output structs ──

#[derive(Serialize)]
pub(super) struct DevicesOutput {
    pub count: usize,
    pub devices: Vec<DiscoveredDevice>,
    /// Set when the device-access layer could not be queried.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Serialize)]
pub(super) struct ConfigOutput {
    pub config_file: Option<String>,
    pub config_file_exists: bool,
    pub settings: Config,
    pub link: LinkConfiguration,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

#[derive(Serialize)]
pub(super) struct SendOutput {
    pub device: String,
    pub link: String,
    pub bytes_written: usize,
}

#[derive(Subcommand)]
pub enum Command {
    /// List attached FTDI USB-UART bridges
    Devices,

    /// Show current configuration and file path
    Config {
        /// Write the effective settings to the config file (creates it with
        /// defaults if missing)
        #[arg(long)]
        save: bool,
    },

    /// Open a device and print received data until Ctrl+C
    Monitor {
        #[command(flatten)]
        link: LinkArgs,
        /// Print received bytes as hex instead of text
        #[arg(long)]
        hex: bool,
        /// Exit on a device fault instead of reconnecting
        #[arg(long)]
        no_reconnect: bool,
    },

    /// Open a device, send DATA, and exit
    Send {
        /// Data to send (text, or hex bytes with --hex)
        data: String,
        #[command(flatten)]
        link: LinkArgs,
        /// Append CR LF
        #[arg(long)]
        crlf: bool,
        /// Interpret DATA as hex bytes, e.g. "41 54 0d 0a"
        #[arg(long)]
        hex: bool,
    },
}

/// Warn if `--json` was passed to a command that doesn't support it.
fn warn_json_unsupported(cmd_name: &str) {
    log::warn!("--json is not supported for `{cmd_name}` (ignored)");
}

pub fn run(cmd: Command, json: bool, config_path: Option<&Path>) -> Result<()> {
    match cmd {
        Command::Devices => devices::cmd_devices(json, config_path),
        Command::Config { save } => config_cmd::cmd_config(json, config_path, save),
        Command::Monitor {
            link,
            hex,
            no_reconnect,
        } => {
            if json {
                warn_json_unsupported("monitor");
            }
            monitor::cmd_monitor(config_path, &link, hex, !no_reconnect)
        }
        Command::Send {
            data,
            link,
            crlf,
            hex,
        } => send::cmd_send(config_path, &link, &data, hex, crlf, json),
    }
}


#[cfg(test)]
mod hex_tests {
    use super::*;

    #[test]
    fn format_hex_spaced_uppercase() {
        assert_eq!(format_hex(b"AT\r\n"), "41 54 0D 0A");
        assert_eq!(format_hex(&[]), "");
    }

    #[test]
    fn parse_hex_accepts_separators_and_prefixes() {
        assert_eq!(parse_hex("41 54 0d 0a").unwrap(), b"AT\r\n");
        assert_eq!(parse_hex("4154").unwrap(), b"AT");
        assert_eq!(parse_hex("0x41,0x54").unwrap(), b"AT");
        assert_eq!(parse_hex("de:ad:BE:ef").unwrap(), vec![0xDE, 0xAD, 0xBE, 0xEF]);
    }

    #[test]
    fn parse_hex_rejects_bad_input() {
        assert!(parse_hex("415").unwrap_err().contains("odd number"));
        assert!(parse_hex("zz").unwrap_err().contains("invalid hex digit 'z'"));
        assert!(parse_hex("4g 41").unwrap_err().contains("\"4g\""));
    }

    #[test]
    fn parse_hex_rejects_non_ascii_without_panicking() {
        assert!(parse_hex("€€").unwrap_err().contains("invalid hex digit '€'"));
        assert!(parse_hex("41 é1").is_err());
    }
}

#[cfg(test)]
mod link_args_tests {
    use super::*;

    #[test]
    fn parity_and_flow_names() {
        assert_eq!(parse_parity("even"), Ok(2));
        assert_eq!(parse_parity("N"), Ok(0));
        assert_eq!(parse_parity("4"), Ok(4));
        assert!(parse_parity("sideways").is_err());
        assert_eq!(parse_flow("rts-cts"), Ok(1));
        assert_eq!(parse_flow("XON-XOFF"), Ok(3));
        assert!(parse_flow("maybe").is_err());
    }

    #[test]
    fn overrides_only_given_fields() {
        let mut config = Config::default();
        let args = LinkArgs {
            device: Some(2),
            baud: Some(115_200),
            parity: Some(1),
            ..LinkArgs::default()
        };
        args.apply_to(&mut config);
        assert_eq!(config.device_index, 2);
        assert_eq!(config.baud_rate, 115_200);
        assert_eq!(config.parity, 1);
        assert_eq!(config.data_bits, 8);
        assert_eq!(config.flow_control, 0);
    }

    #[test]
    fn validated_joins_all_errors() {
        let config = Config {
            baud_rate: 0,
            channel_capacity: 0,
            ..Config::default()
        };
        let err = validated(&config).unwrap_err().to_string();
        assert!(err.contains("baud_rate"));
        assert!(err.contains("channel_capacity"));
    }
}

#[cfg(test)]
mod json_struct_tests {
    use super::*;

    #[test]
    fn devices_output_omits_absent_error() {
        let output = DevicesOutput {
            count: 0,
            devices: vec![],
            error: None,
        };
        let json = serde_json::to_value(&output).unwrap();
        let obj = json.as_object().unwrap();
        assert_eq!(obj.len(), 2);
        assert!(!obj.contains_key("error"));
    }

    #[test]
    fn config_output_has_expected_fields() {
        let config = Config::default();
        let output = ConfigOutput {
            config_file: None,
            config_file_exists: false,
            link: config.link(),
            settings: config,
            warnings: vec![],
            errors: vec![],
        };
        let json = serde_json::to_value(&output).unwrap();
        let obj = json.as_object().unwrap();
        assert_eq!(obj.len(), 6);
        assert_eq!(json["settings"]["baud_rate"], 9600);
        assert_eq!(json["link"]["parity"], "None");
    }

    #[test]
    fn send_output_has_expected_fields() {
        let output = SendOutput {
            device: "usb:001/004 [0403:6001]".into(),
            link: "9600 8N1, no flow control".into(),
            bytes_written: 4,
        };
        let json = serde_json::to_value(&output).unwrap();
        assert_eq!(json["bytes_written"], 4);
        assert_eq!(json.as_object().unwrap().len(), 3);
    }
}
