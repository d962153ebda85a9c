//! Bring-up Process Table
//!
//! The ordered list of vendor HCI commands that identifies the controller,
//! switches the UART to its working baud rate and downloads the patch. The
//! table is assembled once from [`TargetCapabilities`] and walked front to
//! back; the first failing step aborts the walk, ignored steps do not.

use heapless::Vec;

use crate::config::{HciConfig, TargetCapabilities};
use crate::core::h4::H4Error;
use crate::core::protocol::serialization::read_u16;
use crate::core::protocol::{evt_offset, event, opcode, CommandBuilder, ProtocolError, HCI_BUF_SIZE};
use crate::patch::PatchError;
use crate::state::ControllerState;

pub mod baudrate;
pub mod patch;
pub mod system;
pub mod vendor;

/// Upper bound on table entries
pub const MAX_STEPS: usize = 8;

/// Bring-up errors (`HCI_FAIL`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CommandError {
    /// Event echoes a different opcode
    OpcodeMismatch { expected: u16, got: u16 },
    /// Non-zero status byte
    Status(u8),
    /// Reply was not a Command Complete event
    UnexpectedEvent(u8),
    /// Reply too short for its return parameters
    ShortEvent,
    /// Controller is not the expected family
    VersionMismatch { expected: u16, got: u16 },
    /// Final download fragment acknowledged without the last-fragment bit
    LastFragmentNotAcked,
    Patch(PatchError),
    Framer(H4Error),
    Protocol(ProtocolError),
}

impl From<PatchError> for CommandError {
    fn from(err: PatchError) -> Self {
        CommandError::Patch(err)
    }
}

impl From<H4Error> for CommandError {
    fn from(err: H4Error) -> Self {
        CommandError::Framer(err)
    }
}

impl From<ProtocolError> for CommandError {
    fn from(err: ProtocolError) -> Self {
        CommandError::Protocol(err)
    }
}

impl CommandError {
    /// Reporting class of this failure
    pub fn status(&self) -> HciStatus {
        match self {
            CommandError::Patch(err) if err.is_ignorable() => HciStatus::Ignore,
            _ => HciStatus::Fail,
        }
    }
}

/// Successful step result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StepOutcome {
    Done,
    /// Step does not apply to this target; the walk continues
    Ignored,
}

pub type StepResult = Result<StepOutcome, CommandError>;

/// Three-way status as reported to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum HciStatus {
    Success,
    Fail,
    Ignore,
}

impl HciStatus {
    pub fn of(result: &StepResult) -> Self {
        match result {
            Ok(StepOutcome::Done) => HciStatus::Success,
            Ok(StepOutcome::Ignored) => HciStatus::Ignore,
            Err(err) => err.status(),
        }
    }
}

/// Command/event exchange with the controller during bring-up
#[allow(async_fn_in_trait)]
pub trait HciLink {
    /// Send `buf[..len]` as an HCI command and overwrite `buf` with the reply
    /// event (type byte stripped). Returns the event length.
    async fn exchange(&mut self, buf: &mut [u8], len: usize) -> Result<usize, H4Error>;

    /// Reprogram the local UART baud generator
    fn set_baud_rate(&mut self, baud: u32);

    fn baud_rate(&self) -> u32;
}

/// Validated Command Complete event
pub struct CommandComplete {
    buf: [u8; HCI_BUF_SIZE],
    len: usize,
}

impl CommandComplete {
    /// Check event code, echoed opcode and status of a reply to `expected`.
    pub fn parse(expected: u16, buf: [u8; HCI_BUF_SIZE], len: usize) -> Result<Self, CommandError> {
        let event = &buf[..len.min(HCI_BUF_SIZE)];
        let code = *event.get(evt_offset::CODE).ok_or(CommandError::ShortEvent)?;
        if code != event::COMMAND_COMPLETE {
            return Err(CommandError::UnexpectedEvent(code));
        }
        let got = read_u16(event, evt_offset::OPCODE).ok_or(CommandError::ShortEvent)?;
        if got != expected {
            return Err(CommandError::OpcodeMismatch { expected, got });
        }
        let status = *event.get(evt_offset::STATUS).ok_or(CommandError::ShortEvent)?;
        if status != 0 {
            return Err(CommandError::Status(status));
        }
        Ok(Self {
            buf,
            len: event.len(),
        })
    }

    pub fn opcode(&self) -> u16 {
        u16::from_le_bytes([self.buf[evt_offset::OPCODE], self.buf[evt_offset::OPCODE + 1]])
    }

    /// Parameters behind the status byte
    pub fn return_params(&self) -> &[u8] {
        &self.buf[evt_offset::RETURN_PARAMS..self.len]
    }
}

/// Everything a step needs
pub struct BringUp<'c, 'a, L> {
    pub link: &'c mut L,
    pub config: &'c HciConfig<'a>,
    pub state: &'c mut ControllerState,
}

impl<'c, 'a, L: HciLink> BringUp<'c, 'a, L> {
    pub fn new(link: &'c mut L, config: &'c HciConfig<'a>, state: &'c mut ControllerState) -> Self {
        Self { link, config, state }
    }

    /// Send `command` and wait for its Command Complete.
    pub async fn command(&mut self, command: CommandBuilder) -> Result<CommandComplete, CommandError> {
        let packet = command.build()?;
        let expected = u16::from_le_bytes([packet[0], packet[1]]);

        let mut buf = [0u8; HCI_BUF_SIZE];
        buf[..packet.len()].copy_from_slice(&packet);
        let len = self.link.exchange(&mut buf, packet.len()).await?;

        CommandComplete::parse(expected, buf, len)
    }
}

/// One bring-up step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Step {
    ReadLocalVersion,
    ReadRomVersion,
    UpdateBaudRate,
    DownloadPatch,
    RfCalibration,
    CutVersion,
    HciReset,
}

impl Step {
    pub fn opcode(&self) -> u16 {
        match self {
            Step::ReadLocalVersion => opcode::READ_LOCAL_VERSION,
            Step::ReadRomVersion => opcode::VENDOR_READ_ROM_VERSION,
            Step::UpdateBaudRate => opcode::VENDOR_UPDATE_BAUDRATE,
            Step::DownloadPatch => opcode::VENDOR_DOWNLOAD_PATCH,
            Step::RfCalibration => opcode::VENDOR_RF_CALIBRATION,
            Step::CutVersion => opcode::VENDOR_SET_CUT_VERSION,
            Step::HciReset => opcode::HCI_RESET,
        }
    }

    pub async fn run<L: HciLink>(&self, ctx: &mut BringUp<'_, '_, L>) -> StepResult {
        match self {
            Step::ReadLocalVersion => system::handle_read_local_version(ctx).await,
            Step::ReadRomVersion => system::handle_read_rom_version(ctx).await,
            Step::UpdateBaudRate => baudrate::handle_update_baud_rate(ctx).await,
            Step::DownloadPatch => patch::handle_download_patch(ctx).await,
            Step::RfCalibration => vendor::handle_rf_calibration(ctx).await,
            Step::CutVersion => vendor::handle_set_cut_version(ctx).await,
            Step::HciReset => system::handle_reset(ctx).await,
        }
    }
}

/// Ordered bring-up sequence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessTable {
    steps: Vec<Step, MAX_STEPS>,
}

impl ProcessTable {
    /// Assemble the table for a target.
    pub fn new(capabilities: &TargetCapabilities) -> Self {
        let candidates = [
            (Step::ReadLocalVersion, true),
            (Step::ReadRomVersion, true),
            (Step::UpdateBaudRate, capabilities.update_baud),
            (Step::DownloadPatch, capabilities.download_patch),
            (Step::RfCalibration, capabilities.rf_calibration),
            (Step::CutVersion, capabilities.cut_version),
            (Step::HciReset, capabilities.hci_reset),
        ];

        let mut steps = Vec::new();
        for (step, enabled) in candidates {
            if enabled {
                // At most seven candidates
                let _ = steps.push(step);
            }
        }
        Self { steps }
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Walk the table. Stops at the first failing step.
    pub async fn run<L: HciLink>(&self, ctx: &mut BringUp<'_, '_, L>) -> Result<(), CommandError> {
        for step in &self.steps {
            info!("bring-up: {:?} (0x{:04X})", step, step.opcode());
            match step.run(ctx).await {
                Ok(StepOutcome::Done) => debug!("bring-up: {:?} done", step),
                Ok(StepOutcome::Ignored) => info!("bring-up: {:?} ignored", step),
                Err(err) => {
                    error!("bring-up: {:?} failed: {:?} ({:?})", step, err, err.status());
                    return Err(err);
                }
            }
        }
        info!("bring-up: complete");
        Ok(())
    }
}
