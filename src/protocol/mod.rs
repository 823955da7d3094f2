//! SSGSCP — the Sensor Seal Gateway Server Control Protocol.
//!
//! Shared protocol types: gateway identifiers, packet types and field
//! limits. The wire codec lives in [`codec`], the telemetry payload
//! decoder in [`seal`].

use std::fmt;

pub mod codec;
pub mod seal;

/// 256-bit symmetric gateway key, shared out-of-band.
pub type Key = [u8; 32];

/// Maximum payload carried by a single SSGSCP packet.
pub const PAYLOAD_MAX_LEN: usize = 255;

/// Fixed 4-byte gateway identifier from the unencrypted packet header.
///
/// Displayed as `[ab cd ef 12]` — lowercase hex, space-separated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GatewayUid(pub [u8; 4]);

impl GatewayUid {
    /// Read a UID from the start of a byte slice. `None` if shorter than 4 bytes.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let uid: [u8; 4] = bytes.get(..4)?.try_into().ok()?;
        Some(GatewayUid(uid))
    }

    pub fn as_bytes(&self) -> &[u8; 4] {
        &self.0
    }
}

impl fmt::Display for GatewayUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d] = self.0;
        write!(f, "[{:02x} {:02x} {:02x} {:02x}]", a, b, c, d)
    }
}

/// SSGSCP packet types (1 byte on the wire).
///
/// CONNFAIL is the only type packed under the all-zero key; everything
/// else is encrypted with the gateway key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    /// Connection request, gateway → server.
    Conn = 1,
    /// Connection accepted, server → gateway.
    ConnAcpt = 2,
    /// Connection rejected, server → gateway (unencrypted).
    ConnFail = 3,
    /// Per-packet receipt, both directions.
    RcptOk = 10,
    /// Configuration message, server → gateway.
    MsgConf = 20,
    /// Telemetry status message, gateway → server.
    MsgStatus = 21,
}

impl PacketType {
    /// Map a wire discriminant to a packet type. `None` for values outside
    /// the protocol enum.
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            1 => Some(PacketType::Conn),
            2 => Some(PacketType::ConnAcpt),
            3 => Some(PacketType::ConnFail),
            10 => Some(PacketType::RcptOk),
            20 => Some(PacketType::MsgConf),
            21 => Some(PacketType::MsgStatus),
            _ => None,
        }
    }
}
