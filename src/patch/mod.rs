//! Patch Loader
//!
//! Builds the download stream for the vendor patch command:
//! 1. Parse and validate the image ([`image`])
//! 2. Keep the records for this chip revision (and security key), ordered
//!    by ascending priority
//! 3. Patch the configuration blob ([`config`]) from calibration data
//! 4. Serve `[index][payload]` fragments of [`PATCH_FRAGMENT_SIZE`] bytes,
//!    firmware first, configuration last

pub mod config;
pub mod image;
pub mod tlv;

use heapless::Vec;

use crate::config::{HciConfig, PATCH_FRAGMENT_SIZE};
use crate::patch::config::ConfigBlob;
use crate::patch::image::{section, PatchImage, PatchRecord};
use crate::state::ControllerState;

/// Retained records per download
pub const MAX_PATCH_NODES: usize = 16;

/// Marks the final fragment in the index byte
pub const LAST_FRAGMENT_FLAG: u8 = 0x80;

/// Patch loader errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PatchError {
    /// No image configured
    MissingImage,
    /// v1 ("Realtech") image
    UnsupportedSignature,
    BadSignature,
    /// Image shorter than its headers claim
    Truncated,
    /// No record matches the chip revision (and key id)
    NoMatchingSections,
    /// Image built for another project
    ProjectIdMismatch { expected: u8, found: u8 },
    /// A record or the stream ended before its declared length
    PayloadExhausted,
    ConfigInvalid,
    TooManyNodes,
    UnknownBaudRate(u32),
}

impl PatchError {
    /// "No usable patch": a different image may succeed.
    pub fn is_ignorable(&self) -> bool {
        !matches!(
            self,
            PatchError::ConfigInvalid | PatchError::TooManyNodes | PatchError::UnknownBaudRate(_)
        )
    }
}

/// Encode the index byte of fragment `index`.
///
/// The first 128 fragments carry their index; after that the value cycles
/// through 1..=127, 0. Streams longer than 255 fragments alias earlier ones.
pub fn encode_fragment_index(index: usize, is_last: bool) -> u8 {
    let wrapped = if index < 0x80 { index } else { (index % 0x80 + 1) % 0x80 };
    let flag = if is_last { LAST_FRAGMENT_FLAG } else { 0 };
    wrapped as u8 | flag
}

/// Inverse of [`encode_fragment_index`]: the index modulo 128 and the last
/// fragment flag. `wrapped` tells whether the first 128 fragments are past.
pub fn decode_fragment_index(byte: u8, wrapped: bool) -> (usize, bool) {
    let value = (byte & !LAST_FRAGMENT_FLAG) as usize;
    let index = if wrapped { (value + 0x7F) % 0x80 } else { value };
    (index, byte & LAST_FRAGMENT_FLAG != 0)
}

/// One retained patch record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchNode<'a> {
    pub chip_revision: u8,
    pub priority: u8,
    pub key_id: u8,
    pub payload: &'a [u8],
    pub sent_payload_length: usize,
}

impl<'a> From<PatchRecord<'a>> for PatchNode<'a> {
    fn from(record: PatchRecord<'a>) -> Self {
        Self {
            chip_revision: record.chip_revision,
            priority: record.priority,
            key_id: record.key_id,
            payload: record.payload,
            sent_payload_length: 0,
        }
    }
}

impl PatchNode<'_> {
    pub fn payload_length(&self) -> usize {
        self.payload.len()
    }

    fn remaining(&self) -> &[u8] {
        &self.payload[self.sent_payload_length..]
    }
}

/// Fragment written by [`PatchInfo::next_fragment`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Fragment {
    /// Position in the stream, starting at 0
    pub index: usize,
    /// Index byte as sent
    pub index_byte: u8,
    /// Payload bytes behind the index byte
    pub len: usize,
    pub is_last: bool,
}

/// Download cursor over the priority-ordered records and the patched
/// configuration blob
pub struct PatchInfo<'a> {
    nodes: Vec<PatchNode<'a>, MAX_PATCH_NODES>,
    node_cursor: usize,
    config: ConfigBlob,
    fw_length: usize,
    sent_fw_length: usize,
    config_length: usize,
    sent_config_length: usize,
    cur_index: usize,
    end_index: usize,
    last_fragment_size: usize,
    project_id: Option<u8>,
    ota_enabled: bool,
}

impl<'a> PatchInfo<'a> {
    /// Prepare the download of `image` for the controller described by
    /// `state`, using the blob and calibration data from `hci`.
    pub fn new(image: &'a [u8], hci: &HciConfig<'_>, state: &ControllerState) -> Result<Self, PatchError> {
        let mut config = ConfigBlob::parse(hci.config_blob)?;
        if let Some(baud) = hci.working_baud {
            config.set_working_baud(baud)?;
        }
        config.set_flow_control(hci.flow_control);
        config.apply_calibration(&hci.calibration);

        Self::with_config(image, config, state.chip_revision, state.key_id, hci.expected_project_id)
    }

    /// Prepare a download from an already patched configuration blob.
    pub fn with_config(
        image: &'a [u8],
        config: ConfigBlob,
        chip_revision: u8,
        key_id: Option<u8>,
        expected_project_id: Option<u8>,
    ) -> Result<Self, PatchError> {
        let image = PatchImage::parse(image)?;

        let project_id = image.project_id();
        if let (Some(expected), Some(found)) = (expected_project_id, project_id) {
            if expected != found {
                return Err(PatchError::ProjectIdMismatch { expected, found });
            }
        }

        let mut nodes = Vec::new();
        let mut ota_enabled = false;
        let mut security_matched = false;

        for section in image.sections() {
            match section.opcode {
                section::PATCH_SNIPPETS => {
                    collect(&mut nodes, section.records()?, |r| r.chip_revision == chip_revision)?;
                }
                section::SECURITY_HEADER => {
                    if let Some(key) = key_id {
                        let matched = collect(&mut nodes, section.records()?, |r| {
                            r.chip_revision == chip_revision && r.key_id == key
                        })?;
                        security_matched |= matched > 0;
                    }
                }
                section::OTA_FLAG => {
                    for record in section.records()? {
                        let record = record?;
                        if record.chip_revision == chip_revision {
                            ota_enabled = record.payload.first().is_some_and(|flag| *flag != 0);
                        }
                    }
                }
                _ => {}
            }
        }

        // Unsigned fallback: dummy headers stand in when no security header
        // matches the provisioned key.
        if !security_matched {
            if key_id.is_some() {
                warn!("patch: no security header for key {:?}, using dummy header", key_id);
            }
            for section in image.sections().filter(|s| s.opcode == section::DUMMY_HEADER) {
                collect(&mut nodes, section.records()?, |r| r.chip_revision == chip_revision)?;
            }
        }

        if nodes.is_empty() {
            return Err(PatchError::NoMatchingSections);
        }

        let fw_length: usize = nodes.iter().map(PatchNode::payload_length).sum();
        let config_length = config.len();
        let total = fw_length + config_length;
        let end_index = total.div_ceil(PATCH_FRAGMENT_SIZE);
        let last_fragment_size = (total - 1) % PATCH_FRAGMENT_SIZE + 1;

        info!(
            "patch: {} nodes, fw {} bytes, config {} bytes, {} fragments",
            nodes.len(),
            fw_length,
            config_length,
            end_index
        );

        Ok(Self {
            nodes,
            node_cursor: 0,
            config,
            fw_length,
            sent_fw_length: 0,
            config_length,
            sent_config_length: 0,
            cur_index: 0,
            end_index,
            last_fragment_size,
            project_id,
            ota_enabled,
        })
    }

    /// Retained records in transmission order
    pub fn nodes(&self) -> &[PatchNode<'a>] {
        &self.nodes
    }

    pub fn config(&self) -> &ConfigBlob {
        &self.config
    }

    pub fn fw_length(&self) -> usize {
        self.fw_length
    }

    pub fn sent_fw_length(&self) -> usize {
        self.sent_fw_length
    }

    pub fn config_length(&self) -> usize {
        self.config_length
    }

    pub fn sent_config_length(&self) -> usize {
        self.sent_config_length
    }

    /// Number of fragments in the stream
    pub fn fragment_count(&self) -> usize {
        self.end_index
    }

    pub fn fragments_sent(&self) -> usize {
        self.cur_index
    }

    pub fn last_fragment_size(&self) -> usize {
        self.last_fragment_size
    }

    pub fn project_id(&self) -> Option<u8> {
        self.project_id
    }

    pub fn ota_enabled(&self) -> bool {
        self.ota_enabled
    }

    pub fn is_complete(&self) -> bool {
        self.cur_index == self.end_index && self.sent_config_length == self.config_length
    }

    /// Write the next `[index][payload]` fragment into `out`, which must hold
    /// at least `1 + PATCH_FRAGMENT_SIZE` bytes. `None` once complete.
    pub fn next_fragment(&mut self, out: &mut [u8]) -> Result<Option<Fragment>, PatchError> {
        if self.cur_index == self.end_index {
            return Ok(None);
        }

        let is_last = self.cur_index + 1 == self.end_index;
        let len = if is_last { self.last_fragment_size } else { PATCH_FRAGMENT_SIZE };
        let payload = out.get_mut(1..1 + len).ok_or(PatchError::PayloadExhausted)?;

        let mut filled = 0;
        while filled < len && self.sent_fw_length < self.fw_length {
            let node = self.nodes.get_mut(self.node_cursor).ok_or(PatchError::PayloadExhausted)?;
            let remaining = node.remaining();
            let count = remaining.len().min(len - filled);
            payload[filled..filled + count].copy_from_slice(&remaining[..count]);
            node.sent_payload_length += count;
            if node.sent_payload_length == node.payload.len() {
                self.node_cursor += 1;
            }
            filled += count;
            self.sent_fw_length += count;
        }

        if filled < len {
            let remaining = &self.config.as_bytes()[self.sent_config_length..];
            let count = len - filled;
            if remaining.len() < count {
                return Err(PatchError::PayloadExhausted);
            }
            payload[filled..].copy_from_slice(&remaining[..count]);
            self.sent_config_length += count;
        }

        let index_byte = encode_fragment_index(self.cur_index, is_last);
        out[0] = index_byte;
        let fragment = Fragment {
            index: self.cur_index,
            index_byte,
            len,
            is_last,
        };
        self.cur_index += 1;
        Ok(Some(fragment))
    }
}

/// Stable insert of every matching record by ascending priority.
/// Returns how many records were retained.
fn collect<'a>(
    nodes: &mut Vec<PatchNode<'a>, MAX_PATCH_NODES>,
    records: impl Iterator<Item = Result<PatchRecord<'a>, PatchError>>,
    mut keep: impl FnMut(&PatchRecord<'a>) -> bool,
) -> Result<usize, PatchError> {
    let mut retained = 0;
    for record in records {
        let record = record?;
        if !keep(&record) {
            continue;
        }
        let at = nodes
            .iter()
            .position(|node| node.priority > record.priority)
            .unwrap_or(nodes.len());
        nodes.insert(at, record.into()).map_err(|_| PatchError::TooManyNodes)?;
        retained += 1;
    }
    Ok(retained)
}
