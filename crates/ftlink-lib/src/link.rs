//! Link parameters — translation from human-level settings to register codes.
//!
//! Translation is total: codes the bridge would not understand fall back to
//! the conventional 8-N-1 / no-flow-control defaults instead of failing, so
//! a malformed setting yields a best-effort link rather than an error.
//! [`apply`] then pushes the registers to an open device in a fixed order.

use std::fmt;

use serde::Serialize;

use crate::device::{DeviceError, UartDevice};
use crate::protocol::*;

// ── Error type ──

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The handle is closed or was never opened; nothing was sent.
    NotOpen,
    /// A configuration step was refused by the device. The link is left
    /// unconfigured and must be re-applied from the start.
    DeviceRejected { step: ConfigStep, reason: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::NotOpen => write!(f, "Cannot configure: device not open"),
            ConfigError::DeviceRejected { step, reason } => {
                write!(f, "Device rejected {step}: {reason}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// The four register writes, in the order [`apply`] issues them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigStep {
    ResetBitMode,
    BaudRate,
    Characteristics,
    FlowControl,
}

impl fmt::Display for ConfigStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConfigStep::ResetBitMode => "bit-mode reset",
            ConfigStep::BaudRate => "baud rate",
            ConfigStep::Characteristics => "line characteristics",
            ConfigStep::FlowControl => "flow control",
        };
        f.write_str(name)
    }
}

// ── Link parameters ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum DataBits {
    Seven,
    #[default]
    Eight,
}

impl DataBits {
    /// Parse a bit count; `None` for anything but 7 or 8.
    pub fn parse(bits: i64) -> Option<Self> {
        match bits {
            7 => Some(DataBits::Seven),
            8 => Some(DataBits::Eight),
            _ => None,
        }
    }

    /// Like [`parse`](Self::parse), defaulting to eight bits.
    pub fn from_raw(bits: i64) -> Self {
        Self::parse(bits).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum StopBits {
    #[default]
    One,
    Two,
}

impl StopBits {
    pub fn parse(bits: i64) -> Option<Self> {
        match bits {
            1 => Some(StopBits::One),
            2 => Some(StopBits::Two),
            _ => None,
        }
    }

    pub fn from_raw(bits: i64) -> Self {
        Self::parse(bits).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
    Mark,
    Space,
}

impl Parity {
    /// Parse a parity code: 0 none, 1 odd, 2 even, 3 mark, 4 space.
    pub fn parse(code: i64) -> Option<Self> {
        match code {
            0 => Some(Parity::None),
            1 => Some(Parity::Odd),
            2 => Some(Parity::Even),
            3 => Some(Parity::Mark),
            4 => Some(Parity::Space),
            _ => None,
        }
    }

    pub fn from_raw(code: i64) -> Self {
        Self::parse(code).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum FlowControl {
    #[default]
    None,
    RtsCts,
    DtrDsr,
    XonXoff,
}

impl FlowControl {
    /// Parse a flow-control code: 0 none, 1 RTS/CTS, 2 DTR/DSR, 3 XON/XOFF.
    pub fn parse(code: i64) -> Option<Self> {
        match code {
            0 => Some(FlowControl::None),
            1 => Some(FlowControl::RtsCts),
            2 => Some(FlowControl::DtrDsr),
            3 => Some(FlowControl::XonXoff),
            _ => None,
        }
    }

    pub fn from_raw(code: i64) -> Self {
        Self::parse(code).unwrap_or_default()
    }
}

/// Complete link configuration. Immutable; build a new one to change it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LinkConfiguration {
    pub baud_rate: u32,
    pub data_bits: DataBits,
    pub stop_bits: StopBits,
    pub parity: Parity,
    pub flow_control: FlowControl,
}

impl Default for LinkConfiguration {
    fn default() -> Self {
        LinkConfiguration {
            baud_rate: 9600,
            data_bits: DataBits::Eight,
            stop_bits: StopBits::One,
            parity: Parity::None,
            flow_control: FlowControl::None,
        }
    }
}

impl LinkConfiguration {
    pub fn new(
        baud_rate: u32,
        data_bits: DataBits,
        stop_bits: StopBits,
        parity: Parity,
        flow_control: FlowControl,
    ) -> Self {
        LinkConfiguration {
            baud_rate,
            data_bits,
            stop_bits,
            parity,
            flow_control,
        }
    }

    /// Build from integer codes, defaulting anything unrecognised.
    ///
    /// - data bits: 7, 8 (else 8)
    /// - stop bits: 1, 2 (else 1)
    /// - parity: 0 none, 1 odd, 2 even, 3 mark, 4 space (else none)
    /// - flow control: 0 none, 1 RTS/CTS, 2 DTR/DSR, 3 XON/XOFF (else none)
    pub fn from_raw(baud_rate: u32, data_bits: i64, stop_bits: i64, parity: i64, flow: i64) -> Self {
        LinkConfiguration {
            baud_rate,
            data_bits: DataBits::from_raw(data_bits),
            stop_bits: StopBits::from_raw(stop_bits),
            parity: Parity::from_raw(parity),
            flow_control: FlowControl::from_raw(flow),
        }
    }
}

impl fmt::Display for LinkConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bits = match self.data_bits {
            DataBits::Seven => 7,
            DataBits::Eight => 8,
        };
        let parity = match self.parity {
            Parity::None => 'N',
            Parity::Odd => 'O',
            Parity::Even => 'E',
            Parity::Mark => 'M',
            Parity::Space => 'S',
        };
        let stop = match self.stop_bits {
            StopBits::One => 1,
            StopBits::Two => 2,
        };
        let flow = match self.flow_control {
            FlowControl::None => "no flow control",
            FlowControl::RtsCts => "RTS/CTS",
            FlowControl::DtrDsr => "DTR/DSR",
            FlowControl::XonXoff => "XON/XOFF",
        };
        write!(f, "{} {bits}{parity}{stop}, {flow}", self.baud_rate)
    }
}

// ── Registers ──

/// Register payload for one configuration pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterSet {
    pub bit_mode_mask: u8,
    pub bit_mode: u8,
    pub baud_rate: u32,
    pub data_bits: u8,
    pub stop_bits: u8,
    pub parity: u8,
    pub flow_control: u16,
    pub xon: u8,
    pub xoff: u8,
}

/// Map a link configuration onto register codes. Never fails.
pub fn translate(cfg: &LinkConfiguration) -> RegisterSet {
    let data_bits = match cfg.data_bits {
        DataBits::Seven => FT_DATA_BITS_7,
        DataBits::Eight => FT_DATA_BITS_8,
    };
    let stop_bits = match cfg.stop_bits {
        StopBits::One => FT_STOP_BITS_1,
        StopBits::Two => FT_STOP_BITS_2,
    };
    let parity = match cfg.parity {
        Parity::None => FT_PARITY_NONE,
        Parity::Odd => FT_PARITY_ODD,
        Parity::Even => FT_PARITY_EVEN,
        Parity::Mark => FT_PARITY_MARK,
        Parity::Space => FT_PARITY_SPACE,
    };
    let flow_control = match cfg.flow_control {
        FlowControl::None => FT_FLOW_NONE,
        FlowControl::RtsCts => FT_FLOW_RTS_CTS,
        FlowControl::DtrDsr => FT_FLOW_DTR_DSR,
        FlowControl::XonXoff => FT_FLOW_XON_XOFF,
    };
    RegisterSet {
        bit_mode_mask: 0,
        bit_mode: FT_BITMODE_RESET,
        baud_rate: cfg.baud_rate,
        data_bits,
        stop_bits,
        parity,
        flow_control,
        xon: XON_CHAR,
        xoff: XOFF_CHAR,
    }
}

fn rejected(step: ConfigStep, e: DeviceError) -> ConfigError {
    match e {
        DeviceError::Disconnected => ConfigError::NotOpen,
        other => ConfigError::DeviceRejected {
            step,
            reason: other.to_string(),
        },
    }
}

/// Write `regs` to an open device: bit-mode reset, baud rate, line
/// characteristics (one combined write), flow control.
///
/// Stops at the first failing step; a closed device gets no calls at all.
pub fn apply(device: &mut impl UartDevice, regs: &RegisterSet) -> Result<(), ConfigError> {
    if !device.is_open() {
        return Err(ConfigError::NotOpen);
    }

    device
        .set_bit_mode(regs.bit_mode_mask, regs.bit_mode)
        .map_err(|e| rejected(ConfigStep::ResetBitMode, e))?;
    log::debug!("bit mode reset");

    device
        .set_baud_rate(regs.baud_rate)
        .map_err(|e| rejected(ConfigStep::BaudRate, e))?;
    log::debug!("baud rate {}", regs.baud_rate);

    device
        .set_characteristics(regs.data_bits, regs.stop_bits, regs.parity)
        .map_err(|e| rejected(ConfigStep::Characteristics, e))?;
    log::debug!(
        "characteristics bits={} stop={} parity={}",
        regs.data_bits,
        regs.stop_bits,
        regs.parity
    );

    device
        .set_flow_control(regs.flow_control, regs.xon, regs.xoff)
        .map_err(|e| rejected(ConfigStep::FlowControl, e))?;
    log::debug!("flow control 0x{:04X}", regs.flow_control);

    Ok(())
}
