//! Controller configuration blob
//!
//! `[magic:4 LE][len:2 LE]` followed by `len` bytes of
//! `{offset:2 LE, len:1, value}` entries. Entries are patched in place from
//! calibration data before the blob is appended to the patch stream; fields
//! without an entry keep their compiled-in default inside the controller.

use heapless::Vec;

use crate::config::CalibrationData;
use crate::core::protocol::serialization::{read_u16, read_u32};
use crate::patch::PatchError;

pub const CONFIG_MAGIC: u32 = 0x8723_AB55;

/// Magic + length
pub const CONFIG_HEADER_LEN: usize = 6;

/// Largest configuration blob accepted
pub const MAX_CONFIG_SIZE: usize = 512;

/// Entry offsets inside the controller's configuration space
pub mod field {
    pub const UART_BAUD: u16 = 0x000C;
    pub const UART_FLOW: u16 = 0x0018;
    pub const BD_ADDR: u16 = 0x0044;
    pub const TX_GAIN: u16 = 0x0190;
    pub const XTAL_TRIM: u16 = 0x01A0;
    pub const TSSI_TRIM: u16 = 0x01A4;
}

/// Flow control enable inside the `UART_FLOW` byte
pub const FLOW_CONTROL_BIT: u8 = 1 << 2;

/// Controller baud code to UART baud rate
pub const BAUD_TABLE: [(u32, u32); 10] = [
    (0x0252_C014, 115_200),
    (0x0252_C00A, 230_400),
    (0x05F7_5004, 921_600),
    (0x0492_8002, 1_000_000),
    (0x052A_8002, 1_500_000),
    (0x0000_5002, 2_000_000),
    (0x0000_B001, 2_500_000),
    (0x0492_8001, 3_000_000),
    (0x052A_6001, 3_500_000),
    (0x0000_5001, 4_000_000),
];

pub fn baud_to_code(baud: u32) -> Option<u32> {
    BAUD_TABLE.iter().find(|(_, rate)| *rate == baud).map(|(code, _)| *code)
}

pub fn code_to_baud(code: u32) -> Option<u32> {
    BAUD_TABLE.iter().find(|(entry, _)| *entry == code).map(|(_, rate)| *rate)
}

/// Compiled-in configuration: 1.5 Mbaud, flow control on, placeholder
/// address and RF trims.
#[rustfmt::skip]
pub const DEFAULT_CONFIG: &[u8] = &[
    0x55, 0xAB, 0x23, 0x87, // magic
    0x20, 0x00,             // entries length
    0x0C, 0x00, 0x04, 0x02, 0x80, 0x2A, 0x05,             // UART baud code
    0x18, 0x00, 0x01, 0x5C,                               // UART flow control
    0x44, 0x00, 0x06, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // BD address
    0x90, 0x01, 0x01, 0x1F,                               // TX gain
    0xA0, 0x01, 0x01, 0x3F,                               // XTAL trim
    0xA4, 0x01, 0x01, 0x00,                               // TSSI trim
];

/// One entry of the blob
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ConfigEntry {
    pub offset: u16,
    /// Position of the value inside the blob
    pub value_start: usize,
    pub value_len: usize,
}

/// Walks the entries of a validated blob
pub struct ConfigEntries<'a> {
    data: &'a [u8],
    pos: usize,
}

impl Iterator for ConfigEntries<'_> {
    type Item = ConfigEntry;

    fn next(&mut self) -> Option<Self::Item> {
        let offset = read_u16(self.data, self.pos)?;
        let value_len = *self.data.get(self.pos + 2)? as usize;
        let value_start = self.pos + 3;
        if value_start + value_len > self.data.len() {
            return None;
        }
        self.pos = value_start + value_len;
        Some(ConfigEntry {
            offset,
            value_start,
            value_len,
        })
    }
}

/// Owned, patchable copy of a configuration blob
#[derive(Debug, Clone)]
pub struct ConfigBlob {
    data: Vec<u8, MAX_CONFIG_SIZE>,
}

impl ConfigBlob {
    /// Copy and validate `blob`: magic, declared length and entry layout.
    pub fn parse(blob: &[u8]) -> Result<Self, PatchError> {
        if read_u32(blob, 0) != Some(CONFIG_MAGIC) {
            return Err(PatchError::ConfigInvalid);
        }
        let declared = read_u16(blob, 4).ok_or(PatchError::ConfigInvalid)? as usize;
        if CONFIG_HEADER_LEN + declared != blob.len() {
            return Err(PatchError::ConfigInvalid);
        }

        let data = Vec::from_slice(blob).map_err(|_| PatchError::ConfigInvalid)?;
        let config = Self { data };

        let consumed = config
            .entries()
            .last()
            .map_or(CONFIG_HEADER_LEN, |entry| entry.value_start + entry.value_len);
        if consumed != blob.len() {
            return Err(PatchError::ConfigInvalid);
        }
        Ok(config)
    }

    pub fn entries(&self) -> ConfigEntries<'_> {
        ConfigEntries {
            data: &self.data,
            pos: CONFIG_HEADER_LEN,
        }
    }

    pub fn entry(&self, offset: u16) -> Option<&[u8]> {
        let entry = self.entries().find(|entry| entry.offset == offset)?;
        Some(&self.data[entry.value_start..entry.value_start + entry.value_len])
    }

    pub fn entry_mut(&mut self, offset: u16) -> Option<&mut [u8]> {
        let entry = self.entries().find(|entry| entry.offset == offset)?;
        Some(&mut self.data[entry.value_start..entry.value_start + entry.value_len])
    }

    /// Raw controller baud code, if the blob carries one
    pub fn baud_code(&self) -> Option<u32> {
        self.entry(field::UART_BAUD).and_then(|value| read_u32(value, 0))
    }

    /// UART baud rate encoded in the blob
    pub fn working_baud(&self) -> Option<u32> {
        self.baud_code().and_then(code_to_baud)
    }

    /// Store `baud` as a controller baud code. No-op without a baud entry.
    pub fn set_working_baud(&mut self, baud: u32) -> Result<(), PatchError> {
        let code = baud_to_code(baud).ok_or(PatchError::UnknownBaudRate(baud))?;
        if let Some(value) = self.entry_mut(field::UART_BAUD) {
            if value.len() >= 4 {
                value[..4].copy_from_slice(&code.to_le_bytes());
            }
        }
        Ok(())
    }

    pub fn set_flow_control(&mut self, enabled: bool) {
        if let Some(value) = self.entry_mut(field::UART_FLOW).and_then(|value| value.first_mut()) {
            if enabled {
                *value |= FLOW_CONTROL_BIT;
            } else {
                *value &= !FLOW_CONTROL_BIT;
            }
        }
    }

    pub fn flow_control(&self) -> Option<bool> {
        self.entry(field::UART_FLOW)
            .and_then(|value| value.first())
            .map(|value| value & FLOW_CONTROL_BIT != 0)
    }

    /// Overwrite address and RF trims with whatever calibration data exists.
    pub fn apply_calibration(&mut self, calibration: &CalibrationData) {
        if let Some(addr) = calibration.bd_addr {
            if let Some(value) = self.entry_mut(field::BD_ADDR) {
                if value.len() >= addr.len() {
                    for (dst, src) in value.iter_mut().zip(addr.iter().rev()) {
                        *dst = *src;
                    }
                }
            }
        }

        let trims = [
            (field::TX_GAIN, calibration.tx_gain),
            (field::XTAL_TRIM, calibration.xtal_trim),
            (field::TSSI_TRIM, calibration.tssi_trim),
        ];
        for (offset, trim) in trims {
            let Some(trim) = trim else { continue };
            if let Some(value) = self.entry_mut(offset).and_then(|value| value.first_mut()) {
                *value = trim;
            }
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
