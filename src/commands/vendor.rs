//! Optional vendor tagging steps driven by efuse calibration data.

use crate::commands::{BringUp, HciLink, StepOutcome, StepResult};
use crate::core::protocol::{opcode, CommandBuilder};

/// Presence bits of the RF calibration command
mod rf_mask {
    pub const TX_GAIN: u8 = 1 << 0;
    pub const XTAL_TRIM: u8 = 1 << 1;
    pub const TSSI_TRIM: u8 = 1 << 2;
}

/// Handle VENDOR_RF_CALIBRATION (0xFD91)
///
/// Parameters: `[mask][tx gain][xtal trim][tssi trim]`, absent values are
/// sent as zero with their mask bit clear.
pub async fn handle_rf_calibration<L: HciLink>(ctx: &mut BringUp<'_, '_, L>) -> StepResult {
    let calibration = ctx.config.calibration;
    if !calibration.has_rf_trim() {
        return Ok(StepOutcome::Ignored);
    }

    let values = [
        (rf_mask::TX_GAIN, calibration.tx_gain),
        (rf_mask::XTAL_TRIM, calibration.xtal_trim),
        (rf_mask::TSSI_TRIM, calibration.tssi_trim),
    ];
    let mask = values
        .iter()
        .filter(|(_, value)| value.is_some())
        .fold(0, |mask, (bit, _)| mask | bit);

    let mut command = CommandBuilder::new(opcode::VENDOR_RF_CALIBRATION);
    command.add_u8(mask)?;
    for (_, value) in values {
        command.add_u8(value.unwrap_or(0))?;
    }
    ctx.command(command).await?;

    info!("Vendor: RF calibration applied (mask 0x{:02X})", mask);
    Ok(StepOutcome::Done)
}

/// Handle VENDOR_SET_CUT_VERSION (0xFDA5)
pub async fn handle_set_cut_version<L: HciLink>(ctx: &mut BringUp<'_, '_, L>) -> StepResult {
    let Some(cut) = ctx.config.calibration.cut_version else {
        return Ok(StepOutcome::Ignored);
    };

    let mut command = CommandBuilder::new(opcode::VENDOR_SET_CUT_VERSION);
    command.add_u8(cut)?;
    ctx.command(command).await?;

    info!("Vendor: cut version {}", cut);
    Ok(StepOutcome::Done)
}
