//! Protocol constants for FTDI USB-UART bridges.
//!
//! Request codes follow the FTDI "SIO" vendor requests as used by libftdi and
//! the Linux `ftdi_sio` driver. Register codes for data bits, stop bits,
//! parity and flow control use the D2XX numbering, which is also what the
//! chip expects on the wire:
//!
//! - data bits are sent as-is (7 or 8)
//! - stop bits: `0` = 1 stop bit, `2` = 2 stop bits
//! - parity: `0..=4` = none, odd, even, mark, space
//! - flow control is the high byte of `wIndex` for `SET_FLOW_CTRL`

// ── USB identification ──

/// FTDI vendor ID.
pub const FTDI_VID: u16 = 0x0403;

/// Product IDs of single- and multi-port UART bridges we enumerate.
///
/// FT232R/FT232BM (0x6001), FT2232 (0x6010), FT4232H (0x6011),
/// FT232H (0x6014), FT-X series (0x6015).
pub const FTDI_UART_PIDS: &[u16] = &[0x6001, 0x6010, 0x6011, 0x6014, 0x6015];

/// Chips whose `SET_BAUDRATE` carries the port number in the low byte of
/// `wIndex` (FT2232, FT4232H, FT232H).
pub const PORT_IN_BAUD_INDEX_PIDS: &[u16] = &[0x6010, 0x6011, 0x6014];

/// Interface A: bulk OUT endpoint (host → device).
pub const EP_OUT_A: u8 = 0x02;

/// Interface A: bulk IN endpoint (device → host).
pub const EP_IN_A: u8 = 0x81;

/// `wIndex` port selector for interface A.
pub const USB_INDEX_A: u16 = 1;

/// Every bulk IN packet starts with two modem-status bytes.
pub const MODEM_STATUS_LEN: usize = 2;

/// Max packet size for full-speed chips (R, BM, X series).
pub const FULL_SPEED_PACKET_SIZE: usize = 64;

/// Max packet size for high-speed chips (2232H, 4232H, 232H).
pub const HIGH_SPEED_PACKET_SIZE: usize = 512;

/// Control transfer timeout.
pub const USB_TIMEOUT_MS: u64 = 1000;

// ── SIO vendor requests ──

pub const SIO_RESET_REQUEST: u8 = 0x00;
pub const SIO_SET_FLOW_CTRL_REQUEST: u8 = 0x02;
pub const SIO_SET_BAUDRATE_REQUEST: u8 = 0x03;
pub const SIO_SET_DATA_REQUEST: u8 = 0x04;
pub const SIO_SET_BITMODE_REQUEST: u8 = 0x0B;

/// `wValue` for `SIO_RESET_REQUEST`: reset the SIO state machine.
pub const SIO_RESET_SIO: u16 = 0;

// ── Register codes ──

pub const FT_DATA_BITS_7: u8 = 7;
pub const FT_DATA_BITS_8: u8 = 8;

pub const FT_STOP_BITS_1: u8 = 0;
pub const FT_STOP_BITS_2: u8 = 2;

pub const FT_PARITY_NONE: u8 = 0;
pub const FT_PARITY_ODD: u8 = 1;
pub const FT_PARITY_EVEN: u8 = 2;
pub const FT_PARITY_MARK: u8 = 3;
pub const FT_PARITY_SPACE: u8 = 4;

pub const FT_FLOW_NONE: u16 = 0x0000;
pub const FT_FLOW_RTS_CTS: u16 = 0x0100;
pub const FT_FLOW_DTR_DSR: u16 = 0x0200;
pub const FT_FLOW_XON_XOFF: u16 = 0x0400;

/// Bit-mode reset: returns the interface to plain UART operation.
pub const FT_BITMODE_RESET: u8 = 0x00;

/// XON character sent with every flow-control write.
pub const XON_CHAR: u8 = 0x0B;

/// XOFF character sent with every flow-control write.
pub const XOFF_CHAR: u8 = 0x0D;

// ── Buffers ──

/// Default receive buffer capacity for one poll cycle.
pub const RX_BUFFER_CAPACITY: usize = 4096;

// ── Baud rate divisor ──

/// Base clock of the baud generator on AM/BM/R/X chips (and H chips in
/// compatibility mode).
const BASE_CLOCK: u32 = 3_000_000;

/// Sub-integer divisor encoding: index = eighths, value = wire code.
const FRAC_CODE: [u32; 8] = [0, 3, 2, 4, 1, 5, 6, 7];

/// Encode a baud rate into the `(wValue, wIndex)` pair for
/// `SIO_SET_BAUDRATE_REQUEST`.
///
/// Returns `None` for a zero baud rate. Rates at or above the base clock
/// collapse to divisor 0 (3 Mbaud), 2 Mbaud and 1.5 Mbaud have dedicated
/// codes, everything else uses the 14.3 fixed-point divisor.
pub fn baud_divisor(baud: u32) -> Option<(u16, u16)> {
    if baud == 0 {
        return None;
    }
    let encoded: u32 = if baud >= BASE_CLOCK {
        0
    } else if baud >= BASE_CLOCK * 2 / 3 {
        1
    } else if baud >= BASE_CLOCK / 2 {
        2
    } else {
        // Divisor in eighths, rounded to nearest.
        let div16 = (BASE_CLOCK as u64 * 16) / baud as u64;
        let mut div8 = if div16 & 1 == 1 {
            div16 / 2 + 1
        } else {
            div16 / 2
        };
        if div8 > 0x1_FFFF {
            div8 = 0x1_FFFF;
        }
        let div8 = div8 as u32;
        (div8 >> 3) | (FRAC_CODE[(div8 & 0x7) as usize] << 14)
    };
    Some(((encoded & 0xFFFF) as u16, (encoded >> 16) as u16))
}

/// `wIndex` for `SIO_SET_BAUDRATE_REQUEST` on a given chip.
///
/// `high` is the second half of [`baud_divisor`]. Multi-port and H-series
/// chips move it to the high byte and select the port in the low byte.
pub fn baud_index(product_id: u16, high: u16, port: u16) -> u16 {
    if PORT_IN_BAUD_INDEX_PIDS.contains(&product_id) {
        ((high << 8) & 0xFF00) | port
    } else {
        high
    }
}

/// Approximate baud rate actually produced by a divisor pair.
pub fn effective_baud(value: u16, index: u16) -> u32 {
    let encoded = value as u32 | ((index as u32) << 16);
    match encoded {
        0 => BASE_CLOCK,
        1 => BASE_CLOCK * 2 / 3,
        2 => BASE_CLOCK / 2,
        _ => {
            let int_part = encoded & 0x3FFF;
            let frac_code = (encoded >> 14) & 0x7;
            let eighths = FRAC_CODE
                .iter()
                .position(|&c| c == frac_code)
                .unwrap_or(0) as u32;
            let div8 = (int_part << 3) | eighths;
            if div8 == 0 {
                return BASE_CLOCK;
            }
            ((BASE_CLOCK as u64 * 8) / div8 as u64) as u32
        }
    }
}

/// Strip the modem-status header from each packet of a raw bulk IN result.
///
/// Payload bytes are compacted to the front of `data`; returns the payload
/// length.
pub fn strip_modem_status(data: &mut [u8], packet_size: usize) -> usize {
    let total = data.len();
    if total <= MODEM_STATUS_LEN || packet_size <= MODEM_STATUS_LEN {
        return 0;
    }

    let mut write_pos = 0;
    for pkt_start in (0..total).step_by(packet_size) {
        let pkt_end = (pkt_start + packet_size).min(total);
        if pkt_end - pkt_start <= MODEM_STATUS_LEN {
            continue;
        }
        let payload_start = pkt_start + MODEM_STATUS_LEN;
        let payload_len = pkt_end - payload_start;
        data.copy_within(payload_start..pkt_end, write_pos);
        write_pos += payload_len;
    }
    write_pos
}
