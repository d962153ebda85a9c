//! Patch image parser
//!
//! ```text
//! [signature:8][date:4][time:4][section count:4]
//! section: [opcode:4][len:4][payload]
//! payload: [count:2][reserved:2] then count x
//!          [chip_rev:1][priority:1][key_id:1][reserved:1][len:4][data]
//! ```
//!
//! All multi-byte fields are little endian. Parsing is zero-copy: records
//! borrow their payload from the image.

use crate::core::protocol::serialization::{read_u16, read_u32};
use crate::patch::{tlv, PatchError};

pub const SIGNATURE_V1: &[u8; 8] = b"Realtech";
pub const SIGNATURE_V2: &[u8; 8] = b"RTBTCore";

/// Signature, date, time and section count
pub const HEADER_LEN: usize = 20;

const SECTION_HEADER_LEN: usize = 8;
const SUBSECTION_HEADER_LEN: usize = 4;
const RECORD_HEADER_LEN: usize = 8;

/// Section opcodes
pub mod section {
    pub const PATCH_SNIPPETS: u32 = 0x01;
    pub const DUMMY_HEADER: u32 = 0x02;
    pub const SECURITY_HEADER: u32 = 0x03;
    pub const OTA_FLAG: u32 = 0x04;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ImageHeader {
    pub date: u32,
    pub time: u32,
    pub section_count: u32,
}

/// Parsed v2 patch image
#[derive(Debug, Clone, Copy)]
pub struct PatchImage<'a> {
    data: &'a [u8],
    header: ImageHeader,
    sections_end: usize,
}

impl<'a> PatchImage<'a> {
    pub fn parse(data: &'a [u8]) -> Result<Self, PatchError> {
        let signature = data.get(..8).ok_or(PatchError::Truncated)?;
        if signature == SIGNATURE_V1 {
            return Err(PatchError::UnsupportedSignature);
        }
        if signature != SIGNATURE_V2 {
            return Err(PatchError::BadSignature);
        }

        let header = ImageHeader {
            date: read_u32(data, 8).ok_or(PatchError::Truncated)?,
            time: read_u32(data, 12).ok_or(PatchError::Truncated)?,
            section_count: read_u32(data, 16).ok_or(PatchError::Truncated)?,
        };

        // Walk the section headers once so later iteration cannot fail on
        // section boundaries.
        let mut pos = HEADER_LEN;
        for _ in 0..header.section_count {
            let len = read_u32(data, pos + 4).ok_or(PatchError::Truncated)? as usize;
            pos = (pos + SECTION_HEADER_LEN)
                .checked_add(len)
                .filter(|end| *end <= data.len())
                .ok_or(PatchError::Truncated)?;
        }

        Ok(Self {
            data,
            header,
            sections_end: pos,
        })
    }

    pub fn header(&self) -> &ImageHeader {
        &self.header
    }

    pub fn sections(&self) -> Sections<'a> {
        Sections {
            data: self.data,
            pos: HEADER_LEN,
            remaining: self.header.section_count,
        }
    }

    /// Project id from the extension trailer behind the last section
    pub fn project_id(&self) -> Option<u8> {
        tlv::project_id(self.data, self.sections_end)
    }
}

/// One typed section
#[derive(Debug, Clone, Copy)]
pub struct Section<'a> {
    pub opcode: u32,
    pub payload: &'a [u8],
}

impl<'a> Section<'a> {
    /// Sub-records of the section. Fails on a truncated sub-section header.
    pub fn records(&self) -> Result<Records<'a>, PatchError> {
        let count = read_u16(self.payload, 0).ok_or(PatchError::Truncated)?;
        if self.payload.len() < SUBSECTION_HEADER_LEN {
            return Err(PatchError::Truncated);
        }
        Ok(Records {
            data: self.payload,
            pos: SUBSECTION_HEADER_LEN,
            remaining: count,
        })
    }
}

pub struct Sections<'a> {
    data: &'a [u8],
    pos: usize,
    remaining: u32,
}

impl<'a> Iterator for Sections<'a> {
    type Item = Section<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let opcode = read_u32(self.data, self.pos)?;
        let len = read_u32(self.data, self.pos + 4)? as usize;
        let start = self.pos + SECTION_HEADER_LEN;
        let payload = self.data.get(start..start + len)?;
        self.pos = start + len;
        self.remaining -= 1;
        Some(Section { opcode, payload })
    }
}

/// Revision / priority tagged chunk of patch code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchRecord<'a> {
    pub chip_revision: u8,
    pub priority: u8,
    pub key_id: u8,
    pub payload: &'a [u8],
}

pub struct Records<'a> {
    data: &'a [u8],
    pos: usize,
    remaining: u16,
}

impl<'a> Iterator for Records<'a> {
    type Item = Result<PatchRecord<'a>, PatchError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;

        let header = match self.data.get(self.pos..self.pos + RECORD_HEADER_LEN) {
            Some(header) => header,
            None => {
                self.remaining = 0;
                return Some(Err(PatchError::PayloadExhausted));
            }
        };
        let len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;
        let start = self.pos + RECORD_HEADER_LEN;
        let Some(payload) = start.checked_add(len).and_then(|end| self.data.get(start..end)) else {
            self.remaining = 0;
            return Some(Err(PatchError::PayloadExhausted));
        };
        self.pos = start + len;

        Some(Ok(PatchRecord {
            chip_revision: header[0],
            priority: header[1],
            key_id: header[2],
            payload,
        }))
    }
}
