//! Core Transport Infrastructure
//!
//! Byte-level UART transport, buffer pools, H4 wire definitions and framing,
//! and the receive router used during bring-up.

pub mod h4;
pub mod memory;
pub mod protocol;
pub mod ring_buffer;
pub mod standalone;
pub mod transport;
