#![cfg_attr(not(test), no_std)]

//! Bluetooth Controller Bring-up and H4 Transport
//!
//! Drives an external HCI radio controller over a UART, organized into
//! layers:
//!
//! - `core`: ring-buffered UART transport, H4 framing, buffer pools and the
//!   standalone command/response engine
//! - `commands`: the bring-up process table and its vendor command steps
//! - `patch`: patch image parser, configuration blob and fragment cursor
//! - `interface`: the async task tying bring-up and host stack traffic together

// This must go FIRST so that other modules see its macros.
mod fmt;

pub mod commands;
pub mod config;
pub mod core;
pub mod interface;
pub mod patch;
pub mod state;

pub use crate::commands::{CommandError, HciStatus, ProcessTable, Step, StepOutcome};
pub use crate::config::{CalibrationData, HciConfig, TargetCapabilities};
pub use crate::core::transport::{IrqStatus, UartHal, UartTransport};
pub use crate::interface::{HciInterface, HciStack, IfEvent};
pub use crate::state::ControllerState;
