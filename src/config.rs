//! Bring-up Configuration
//!
//! User-facing configuration via [`HciConfig`] builder pattern. Target
//! specific step selection lives in [`TargetCapabilities`]; board data read
//! from efuse/flash by the platform is handed over as [`CalibrationData`].

use embassy_time::Duration;

use crate::patch::config::DEFAULT_CONFIG;

/// Capacity of the UART RX ring buffer (one slot is always kept free)
pub const RX_RING_SIZE: usize = 1024;

/// RX is throttled once free ring space drops to this many bytes or fewer
pub const FLOW_CTRL_LOW_WATER: usize = 128;

/// RX is resumed once free ring space strictly exceeds this many bytes
pub const FLOW_CTRL_HIGH_WATER: usize = 512;

/// Bytes staged per hardware TX refill cycle
pub const TX_STAGING_SIZE: usize = 64;

/// Baud rate the controller boots with
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Time the controller needs after a baud rate switch
pub const BAUD_SETTLE_TIME: Duration = Duration::from_millis(50);

/// Payload bytes carried by one download-patch command
pub const PATCH_FRAGMENT_SIZE: usize = 252;

/// LMP subversion reported by the supported controller family
pub const DEFAULT_LMP_SUBVERSION: u16 = 0x8720;

const _: () = assert!(FLOW_CTRL_LOW_WATER < FLOW_CTRL_HIGH_WATER);
const _: () = assert!(FLOW_CTRL_HIGH_WATER < RX_RING_SIZE - 1);

/// Which bring-up steps this target runs.
///
/// Read local version and read ROM version always run; everything else is
/// selected here instead of per-target conditional compilation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TargetCapabilities {
    pub update_baud: bool,
    pub download_patch: bool,
    pub rf_calibration: bool,
    pub cut_version: bool,
    pub hci_reset: bool,
    /// Manufacturing/test mode: the transport opens but the host stack must not run
    pub mp_mode: bool,
}

impl TargetCapabilities {
    pub const fn new() -> Self {
        Self {
            update_baud: true,
            download_patch: true,
            rf_calibration: false,
            cut_version: false,
            hci_reset: true,
            mp_mode: false,
        }
    }

    /// Every optional step enabled.
    pub const fn full() -> Self {
        Self {
            update_baud: true,
            download_patch: true,
            rf_calibration: true,
            cut_version: true,
            hci_reset: true,
            mp_mode: false,
        }
    }
}

impl Default for TargetCapabilities {
    fn default() -> Self {
        Self::new()
    }
}

/// Board data sourced from efuse / flash. `None` keeps the compiled-in default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CalibrationData {
    /// Public device address, most significant byte first
    pub bd_addr: Option<[u8; 6]>,
    pub tx_gain: Option<u8>,
    pub xtal_trim: Option<u8>,
    pub tssi_trim: Option<u8>,
    /// Security key the controller was provisioned with
    pub key_id: Option<u8>,
    pub cut_version: Option<u8>,
}

impl CalibrationData {
    pub const fn new() -> Self {
        Self {
            bd_addr: None,
            tx_gain: None,
            xtal_trim: None,
            tssi_trim: None,
            key_id: None,
            cut_version: None,
        }
    }

    /// True when at least one RF trim value is available.
    pub fn has_rf_trim(&self) -> bool {
        self.tx_gain.is_some() || self.xtal_trim.is_some() || self.tssi_trim.is_some()
    }
}

/// Complete bring-up configuration.
#[derive(Debug, Clone, Copy)]
pub struct HciConfig<'a> {
    pub(crate) patch_image: Option<&'a [u8]>,
    pub(crate) config_blob: &'a [u8],
    pub(crate) initial_baud: u32,
    pub(crate) flow_control: bool,
    pub(crate) working_baud: Option<u32>,
    pub(crate) baud_settle: Duration,
    pub(crate) expected_lmp_subversion: u16,
    pub(crate) expected_project_id: Option<u8>,
    pub(crate) capabilities: TargetCapabilities,
    pub(crate) calibration: CalibrationData,
}

impl<'a> HciConfig<'a> {
    pub const fn new() -> Self {
        Self {
            patch_image: None,
            config_blob: DEFAULT_CONFIG,
            initial_baud: DEFAULT_BAUD_RATE,
            flow_control: true,
            working_baud: None,
            baud_settle: BAUD_SETTLE_TIME,
            expected_lmp_subversion: DEFAULT_LMP_SUBVERSION,
            expected_project_id: None,
            capabilities: TargetCapabilities::new(),
            calibration: CalibrationData::new(),
        }
    }

    /// Vendor patch image to download.
    pub const fn patch_image(mut self, image: &'a [u8]) -> Self {
        self.patch_image = Some(image);
        self
    }

    /// Replace the compiled-in configuration blob.
    pub const fn config_blob(mut self, blob: &'a [u8]) -> Self {
        self.config_blob = blob;
        self
    }

    pub const fn initial_baud(mut self, baud: u32) -> Self {
        self.initial_baud = baud;
        self
    }

    pub const fn flow_control(mut self, enabled: bool) -> Self {
        self.flow_control = enabled;
        self
    }

    /// Baud rate to switch to after identification. Without it the rate
    /// encoded in the configuration blob is used.
    pub const fn working_baud(mut self, baud: u32) -> Self {
        self.working_baud = Some(baud);
        self
    }

    pub const fn baud_settle(mut self, settle: Duration) -> Self {
        self.baud_settle = settle;
        self
    }

    pub const fn expected_lmp_subversion(mut self, subversion: u16) -> Self {
        self.expected_lmp_subversion = subversion;
        self
    }

    pub const fn expected_project_id(mut self, project_id: u8) -> Self {
        self.expected_project_id = Some(project_id);
        self
    }

    pub const fn capabilities(mut self, capabilities: TargetCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub const fn calibration(mut self, calibration: CalibrationData) -> Self {
        self.calibration = calibration;
        self
    }

    pub fn target(&self) -> &TargetCapabilities {
        &self.capabilities
    }
}

impl Default for HciConfig<'_> {
    fn default() -> Self {
        Self::new()
    }
}
