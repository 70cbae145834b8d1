//! `send` subcommand — write one payload to a bridge and exit.

use std::path::Path;

use super::{FtlinkError, LinkArgs, Result, SendOutput, parse_hex};

/// Build the bytes to send from the command-line argument.
fn payload(data: &str, hex: bool, crlf: bool) -> Result<Vec<u8>> {
    let mut bytes = if hex {
        parse_hex(data).map_err(|e| FtlinkError::Config(format!("--hex: {e}")))?
    } else {
        data.as_bytes().to_vec()
    };
    if crlf {
        bytes.extend_from_slice(b"\r\n");
    }
    Ok(bytes)
}

pub(super) fn cmd_send(
    config_path: Option<&Path>,
    link: &LinkArgs,
    data: &str,
    hex: bool,
    crlf: bool,
    json: bool,
) -> Result<()> {
    let mut config = super::load_config(config_path);
    link.apply_to(&mut config);
    super::validated(&config)?;
    let bytes = payload(data, hex, crlf)?;

    let manager = super::manager(&config);
    let handle = manager.open(config.device_index)?;
    let link = config.link();

    let result = handle
        .configure(&link)
        .map_err(FtlinkError::from)
        .and_then(|()| handle.write(&bytes).map_err(FtlinkError::from));
    let device = handle.info().path.clone();
    handle.close();
    let written = result?;

    if json {
        let output = SendOutput {
            device,
            link: link.to_string(),
            bytes_written: written,
        };
        println!("{}", serde_json::to_string_pretty(&output).unwrap());
        return Ok(());
    }

    println!("Sent {written} byte(s) to {device} ({link})");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_payload_with_crlf() {
        assert_eq!(payload("AT", false, true).unwrap(), b"AT\r\n");
        assert_eq!(payload("AT", false, false).unwrap(), b"AT");
    }

    #[test]
    fn hex_payload() {
        assert_eq!(payload("41 54", true, true).unwrap(), b"AT\r\n");
    }

    #[test]
    fn bad_hex_is_config_error() {
        let err = payload("4", true, false).unwrap_err();
        assert!(matches!(err, FtlinkError::Config(_)));
        assert!(err.to_string().contains("--hex"));
    }

    #[test]
    fn empty_payload_is_allowed() {
        assert!(payload("", false, false).unwrap().is_empty());
    }
}
