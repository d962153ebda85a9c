//! Identification and reset steps
//!
//! - READ_LOCAL_VERSION (0x1001): checks the LMP subversion
//! - VENDOR_READ_ROM_VERSION (0xFC6D): records the ROM version
//! - HCI_RESET (0x0C03)

use crate::commands::{BringUp, CommandError, HciLink, StepOutcome, StepResult};
use crate::core::protocol::serialization::{read_u16, read_u8};
use crate::core::protocol::{opcode, CommandBuilder};

/// Return parameter offsets of Read Local Version Information
mod local_version {
    pub const HCI_REVISION: usize = 1;
    pub const LMP_SUBVERSION: usize = 6;
}

/// Handle READ_LOCAL_VERSION (0x1001)
pub async fn handle_read_local_version<L: HciLink>(ctx: &mut BringUp<'_, '_, L>) -> StepResult {
    let reply = ctx.command(CommandBuilder::new(opcode::READ_LOCAL_VERSION)).await?;
    let params = reply.return_params();

    let hci_revision = read_u16(params, local_version::HCI_REVISION).ok_or(CommandError::ShortEvent)?;
    let lmp_subversion = read_u16(params, local_version::LMP_SUBVERSION).ok_or(CommandError::ShortEvent)?;

    ctx.state.hci_revision = hci_revision;
    ctx.state.lmp_subversion = lmp_subversion;

    let expected = ctx.config.expected_lmp_subversion;
    if lmp_subversion != expected {
        return Err(CommandError::VersionMismatch {
            expected,
            got: lmp_subversion,
        });
    }

    info!(
        "System: LMP subversion 0x{:04X}, HCI revision 0x{:04X}",
        lmp_subversion, hci_revision
    );
    Ok(StepOutcome::Done)
}

/// Handle VENDOR_READ_ROM_VERSION (0xFC6D)
pub async fn handle_read_rom_version<L: HciLink>(ctx: &mut BringUp<'_, '_, L>) -> StepResult {
    let reply = ctx.command(CommandBuilder::new(opcode::VENDOR_READ_ROM_VERSION)).await?;
    let rom_version = read_u8(reply.return_params(), 0).ok_or(CommandError::ShortEvent)?;

    ctx.state.set_rom_version(rom_version);
    info!(
        "System: ROM version {}, chip revision {}",
        rom_version, ctx.state.chip_revision
    );
    Ok(StepOutcome::Done)
}

/// Handle HCI_RESET (0x0C03)
pub async fn handle_reset<L: HciLink>(ctx: &mut BringUp<'_, '_, L>) -> StepResult {
    ctx.command(CommandBuilder::new(opcode::HCI_RESET)).await?;
    info!("System: controller reset");
    Ok(StepOutcome::Done)
}
