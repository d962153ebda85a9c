//! HCI Protocol Definitions
//!
//! H4 framing used on the UART between host and controller:
//! - `[type:1] [type-specific header] [body]`
//! - Command: opcode (2, LE) + parameter length (1)
//! - Event: event code (1) + parameter length (1)
//! - ACL / ISO: handle (2, LE) + data length (2, LE)
//! - SCO: handle (2, LE) + data length (1)

use heapless::Vec;

/// Command buffer large enough for the larger of a command and its event
pub const HCI_BUF_SIZE: usize = 3 + 255 + 2;

/// H4 packet type indicator
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PacketType {
    Command = 0x01,
    Acl = 0x02,
    Sco = 0x03,
    Event = 0x04,
    Iso = 0x05,
}

impl PacketType {
    /// Convert from the raw indicator byte
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Command),
            0x02 => Some(Self::Acl),
            0x03 => Some(Self::Sco),
            0x04 => Some(Self::Event),
            0x05 => Some(Self::Iso),
            _ => None,
        }
    }

    /// Size of the fixed header following the indicator
    pub const fn header_len(self) -> usize {
        match self {
            Self::Command => 3,
            Self::Acl => 4,
            Self::Sco => 3,
            Self::Event => 2,
            Self::Iso => 4,
        }
    }
}

/// Command opcodes used during bring-up
pub mod opcode {
    pub const HCI_RESET: u16 = 0x0C03;
    pub const READ_LOCAL_VERSION: u16 = 0x1001;

    pub const VENDOR_UPDATE_BAUDRATE: u16 = 0xFC17;
    pub const VENDOR_DOWNLOAD_PATCH: u16 = 0xFC20;
    pub const VENDOR_READ_ROM_VERSION: u16 = 0xFC6D;
    pub const VENDOR_RF_CALIBRATION: u16 = 0xFD91;
    pub const VENDOR_SET_CUT_VERSION: u16 = 0xFDA5;
}

/// Event codes
pub mod event {
    pub const COMMAND_COMPLETE: u8 = 0x0E;
    pub const COMMAND_STATUS: u8 = 0x0F;
    pub const LE_META: u8 = 0x3E;
    pub const VENDOR: u8 = 0xFF;

    /// LE meta sub-events
    pub const LE_ADVERTISING_REPORT: u8 = 0x02;
    pub const LE_DIRECTED_ADVERTISING_REPORT: u8 = 0x0B;
    pub const LE_EXTENDED_ADVERTISING_REPORT: u8 = 0x0D;

    /// Sub-events that may be dropped under memory pressure
    pub fn is_discardable_subevent(subevent: u8) -> bool {
        matches!(
            subevent,
            LE_ADVERTISING_REPORT | LE_DIRECTED_ADVERTISING_REPORT | LE_EXTENDED_ADVERTISING_REPORT
        )
    }
}

/// Byte offsets inside a Command Complete event (type byte stripped)
pub mod evt_offset {
    pub const CODE: usize = 0;
    pub const PARAM_LEN: usize = 1;
    pub const NUM_CMDS: usize = 2;
    pub const OPCODE: usize = 3;
    pub const STATUS: usize = 5;
    pub const RETURN_PARAMS: usize = 6;
}

/// Protocol error types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ProtocolError {
    InvalidLength,
    InvalidPacketType(u8),
    BufferFull,
}

/// Fixed header of a controller-to-host packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum HciPacketHeader {
    Event { code: u8, len: u8 },
    Acl { handle: u16, len: u16 },
    Sco { handle: u16, len: u8 },
    Iso { handle: u16, len: u16 },
}

impl HciPacketHeader {
    /// Decode the header bytes that follow `packet_type`.
    pub fn parse(packet_type: PacketType, bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() < packet_type.header_len() {
            return Err(ProtocolError::InvalidLength);
        }
        let handle = || u16::from_le_bytes([bytes[0], bytes[1]]);
        match packet_type {
            PacketType::Event => Ok(Self::Event {
                code: bytes[0],
                len: bytes[1],
            }),
            PacketType::Acl => Ok(Self::Acl {
                handle: handle(),
                len: u16::from_le_bytes([bytes[2], bytes[3]]),
            }),
            PacketType::Sco => Ok(Self::Sco {
                handle: handle(),
                len: bytes[2],
            }),
            PacketType::Iso => Ok(Self::Iso {
                handle: handle(),
                len: u16::from_le_bytes([bytes[2], bytes[3]]),
            }),
            PacketType::Command => Err(ProtocolError::InvalidPacketType(PacketType::Command as u8)),
        }
    }

    pub fn packet_type(&self) -> PacketType {
        match self {
            Self::Event { .. } => PacketType::Event,
            Self::Acl { .. } => PacketType::Acl,
            Self::Sco { .. } => PacketType::Sco,
            Self::Iso { .. } => PacketType::Iso,
        }
    }

    /// Declared body length
    pub fn body_len(&self) -> usize {
        match *self {
            Self::Event { len, .. } => len as usize,
            Self::Acl { len, .. } => len as usize,
            Self::Sco { len, .. } => len as usize,
            Self::Iso { len, .. } => len as usize,
        }
    }

    /// Type byte + header + body
    pub fn frame_len(&self) -> usize {
        1 + self.packet_type().header_len() + self.body_len()
    }

    pub fn event_code(&self) -> Option<u8> {
        match *self {
            Self::Event { code, .. } => Some(code),
            _ => None,
        }
    }
}

/// Builder for HCI command packets (no H4 indicator)
pub struct CommandBuilder {
    buffer: Vec<u8, HCI_BUF_SIZE>,
}

impl CommandBuilder {
    /// Start a command with the given opcode
    pub fn new(opcode: u16) -> Self {
        let mut buffer = Vec::new();
        // Three bytes always fit in an empty buffer
        let _ = buffer.extend_from_slice(&[opcode as u8, (opcode >> 8) as u8, 0]);
        Self { buffer }
    }

    /// Add a u8 parameter
    pub fn add_u8(&mut self, value: u8) -> Result<&mut Self, ProtocolError> {
        serialization::write_u8(&mut self.buffer, value)?;
        Ok(self)
    }

    /// Add a little-endian u16 parameter
    pub fn add_u16(&mut self, value: u16) -> Result<&mut Self, ProtocolError> {
        serialization::write_u16(&mut self.buffer, value)?;
        Ok(self)
    }

    /// Add a little-endian u32 parameter
    pub fn add_u32(&mut self, value: u32) -> Result<&mut Self, ProtocolError> {
        serialization::write_u32(&mut self.buffer, value)?;
        Ok(self)
    }

    /// Add a byte slice
    pub fn add_slice(&mut self, data: &[u8]) -> Result<&mut Self, ProtocolError> {
        serialization::write_slice(&mut self.buffer, data)?;
        Ok(self)
    }

    /// Finish the command, filling in the parameter length
    pub fn build(mut self) -> Result<Vec<u8, HCI_BUF_SIZE>, ProtocolError> {
        let param_len = self.buffer.len() - 3;
        if param_len > u8::MAX as usize {
            return Err(ProtocolError::InvalidLength);
        }
        self.buffer[2] = param_len as u8;
        Ok(self.buffer)
    }
}

/// Helper functions for little-endian serialization
pub mod serialization {
    use super::ProtocolError;
    use heapless::Vec;

    pub fn write_u8<const N: usize>(buffer: &mut Vec<u8, N>, value: u8) -> Result<(), ProtocolError> {
        buffer.push(value).map_err(|_| ProtocolError::BufferFull)
    }

    pub fn write_u16<const N: usize>(buffer: &mut Vec<u8, N>, value: u16) -> Result<(), ProtocolError> {
        buffer
            .extend_from_slice(&value.to_le_bytes())
            .map_err(|_| ProtocolError::BufferFull)
    }

    pub fn write_u32<const N: usize>(buffer: &mut Vec<u8, N>, value: u32) -> Result<(), ProtocolError> {
        buffer
            .extend_from_slice(&value.to_le_bytes())
            .map_err(|_| ProtocolError::BufferFull)
    }

    pub fn write_slice<const N: usize>(buffer: &mut Vec<u8, N>, data: &[u8]) -> Result<(), ProtocolError> {
        buffer.extend_from_slice(data).map_err(|_| ProtocolError::BufferFull)
    }

    pub fn read_u8(data: &[u8], offset: usize) -> Option<u8> {
        data.get(offset).copied()
    }

    pub fn read_u16(data: &[u8], offset: usize) -> Option<u16> {
        let bytes = data.get(offset..offset + 2)?;
        Some(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    pub fn read_u32(data: &[u8], offset: usize) -> Option<u32> {
        let bytes = data.get(offset..offset + 4)?;
        Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}
