//! VENDOR_UPDATE_BAUDRATE (0xFC17)
//!
//! The controller acknowledges at the old rate, so the local UART is only
//! reprogrammed after the Command Complete arrived.

use embassy_time::Timer;

use crate::commands::{BringUp, CommandError, HciLink, StepOutcome, StepResult};
use crate::core::protocol::{opcode, CommandBuilder};
use crate::patch::config::{baud_to_code, ConfigBlob};
use crate::patch::PatchError;

/// Baud rate bring-up should switch to, if any
pub fn target_baud_rate(config: &crate::config::HciConfig<'_>) -> Result<Option<u32>, PatchError> {
    if let Some(baud) = config.working_baud {
        return Ok(Some(baud));
    }
    Ok(ConfigBlob::parse(config.config_blob)?.working_baud())
}

pub async fn handle_update_baud_rate<L: HciLink>(ctx: &mut BringUp<'_, '_, L>) -> StepResult {
    let current = ctx.link.baud_rate();
    ctx.state.working_baud = current;

    let Some(target) = target_baud_rate(ctx.config)? else {
        info!("Baudrate: no working baud configured, staying at {}", current);
        return Ok(StepOutcome::Ignored);
    };
    if target == current {
        return Ok(StepOutcome::Ignored);
    }

    let code = baud_to_code(target).ok_or(CommandError::Patch(PatchError::UnknownBaudRate(target)))?;

    let mut command = CommandBuilder::new(opcode::VENDOR_UPDATE_BAUDRATE);
    command.add_u32(code)?;
    ctx.command(command).await?;

    ctx.link.set_baud_rate(target);
    Timer::after(ctx.config.baud_settle).await;
    ctx.state.working_baud = target;

    info!("Baudrate: {} -> {} (code 0x{:08X})", current, target, code);
    Ok(StepOutcome::Done)
}
