//! VENDOR_DOWNLOAD_PATCH (0xFC20)
//!
//! Streams the patch loader's fragments, one command per fragment. The
//! first return parameter of every ack echoes the index byte; on the final
//! fragment its high bit must be set.

use crate::commands::{BringUp, CommandError, HciLink, StepOutcome, StepResult};
use crate::config::PATCH_FRAGMENT_SIZE;
use crate::core::protocol::serialization::read_u8;
use crate::core::protocol::{opcode, CommandBuilder};
use crate::patch::{PatchError, PatchInfo, LAST_FRAGMENT_FLAG};

pub async fn handle_download_patch<L: HciLink>(ctx: &mut BringUp<'_, '_, L>) -> StepResult {
    let image = ctx.config.patch_image.ok_or(PatchError::MissingImage)?;
    ctx.state.key_id = ctx.config.calibration.key_id;

    let mut info = PatchInfo::new(image, ctx.config, ctx.state)?;
    ctx.state.project_id = info.project_id();
    ctx.state.ota_enabled = info.ota_enabled();

    let mut fragment = [0u8; 1 + PATCH_FRAGMENT_SIZE];
    while let Some(sent) = info.next_fragment(&mut fragment)? {
        let mut command = CommandBuilder::new(opcode::VENDOR_DOWNLOAD_PATCH);
        command.add_slice(&fragment[..1 + sent.len])?;
        let reply = ctx.command(command).await?;

        let ack = read_u8(reply.return_params(), 0).ok_or(CommandError::ShortEvent)?;
        if sent.is_last && ack & LAST_FRAGMENT_FLAG == 0 {
            return Err(CommandError::LastFragmentNotAcked);
        }
        ctx.state.patch_fragments_sent += 1;
        trace!("Patch: fragment {} acked (0x{:02X})", sent.index, ack);
    }

    info!(
        "Patch: {} fragments downloaded ({} + {} bytes)",
        info.fragments_sent(),
        info.fw_length(),
        info.config_length()
    );
    Ok(StepOutcome::Done)
}
