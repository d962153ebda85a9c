//! Reverse TLV reader for the image extension trailer.
//!
//! The trailer is read from the end of the image towards its start:
//! `... [value][len][op] [value][len][op] [signature:4]`. Every step is
//! bounds checked against a floor the caller supplies, so a corrupt length
//! can never walk the reader into the image header or past the buffer start.

use crate::core::protocol::serialization::read_u32;

/// Magic closing an image that carries a TLV trailer
pub const EXTENSION_SIGNATURE: u32 = 0x77FD_0451;

pub mod op {
    pub const PROJECT_ID: u8 = 0x00;
    pub const END: u8 = 0xFF;
}

/// One trailer record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlvRecord<'a> {
    pub op: u8,
    pub value: &'a [u8],
}

/// Iterator over trailer records, last record first
pub struct TlvReader<'a> {
    data: &'a [u8],
    floor: usize,
    pos: usize,
    done: bool,
}

impl<'a> TlvReader<'a> {
    /// Reader over `data`, or `None` when it does not end with the
    /// extension signature. Records may not start below `floor`.
    pub fn new(data: &'a [u8], floor: usize) -> Option<Self> {
        let sig_start = data.len().checked_sub(4)?;
        if sig_start < floor || read_u32(data, sig_start)? != EXTENSION_SIGNATURE {
            return None;
        }
        Some(Self {
            data,
            floor,
            pos: sig_start,
            done: false,
        })
    }
}

impl<'a> Iterator for TlvReader<'a> {
    type Item = TlvRecord<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        // op and len bytes
        if self.pos < self.floor + 2 {
            self.done = true;
            return None;
        }
        let op = self.data[self.pos - 1];
        if op == op::END {
            self.done = true;
            return None;
        }
        let len = self.data[self.pos - 2] as usize;
        let Some(value_start) = (self.pos - 2).checked_sub(len).filter(|start| *start >= self.floor) else {
            warn!("patch: trailer record 0x{:02X} runs past the image body", op);
            self.done = true;
            return None;
        };
        let value = &self.data[value_start..self.pos - 2];
        self.pos = value_start;
        Some(TlvRecord { op, value })
    }
}

/// Project id carried in the trailer, if any
pub fn project_id(data: &[u8], floor: usize) -> Option<u8> {
    TlvReader::new(data, floor)?
        .find(|record| record.op == op::PROJECT_ID && record.value.len() == 1)
        .map(|record| record.value[0])
}
