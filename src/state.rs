//! Controller State
//!
//! What bring-up learned about the attached controller. Reset on every open.

/// Controller identity and link parameters discovered during bring-up
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ControllerState {
    /// From Read Local Version
    pub lmp_subversion: u16,
    pub hci_revision: u16,
    /// From the vendor ROM version command
    pub rom_version: u8,
    /// Revision tag patch records are matched against (`rom_version + 1`)
    pub chip_revision: u8,
    /// Security key negotiated for the patch download
    pub key_id: Option<u8>,
    /// UART baud rate currently in use on both sides
    pub working_baud: u32,
    /// Project id found in the patch image trailer
    pub project_id: Option<u8>,
    pub patch_fragments_sent: usize,
    pub ota_enabled: bool,
}

impl ControllerState {
    pub const fn new() -> Self {
        Self {
            lmp_subversion: 0,
            hci_revision: 0,
            rom_version: 0,
            chip_revision: 0,
            key_id: None,
            working_baud: 0,
            project_id: None,
            patch_fragments_sent: 0,
            ota_enabled: false,
        }
    }

    /// Record the ROM version and derive the patch chip revision from it.
    pub fn set_rom_version(&mut self, rom_version: u8) {
        self.rom_version = rom_version;
        self.chip_revision = rom_version.wrapping_add(1);
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }
}
