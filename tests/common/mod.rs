//! Common test utilities for the host-side integration tests
//!
//! This module provides:
//! - `FakeUart`: a `UartHal` over in-memory FIFOs, shared with the test
//! - `ControllerStub`: decodes the H4 commands the host writes and answers
//!   with Command Complete events, with per-opcode fault injection
//! - an ISR pump that keeps calling `on_interrupt` while a test future runs
//! - builders for patch images and configuration blobs

#![allow(dead_code)]

use std::collections::VecDeque;
use std::convert::Infallible;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use ameba_bt_hci::core::transport::{IrqStatus, UartHal, UartTransport};
use ameba_bt_hci::core::memory::{RxPacket, TxPacket};
use ameba_bt_hci::interface::{HciStack, IfEvent};
use embassy_futures::block_on;
use embassy_futures::select::{select, Either};
use embassy_futures::yield_now;

pub const LMP_SUBVERSION: u16 = 0x8720;
pub const ROM_VERSION: u8 = 2;

/// Bytes the fake TX FIFO accepts per interrupt
pub const TX_FIFO_DEPTH: usize = 16;

/// Fault injected into the reply to one opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Status(u8),
    WrongOpcode,
    /// Clear the last-fragment bit in download-patch acks
    DropLastFlag,
}

/// Synthetic controller answering every command with Command Complete
#[derive(Debug, Default)]
pub struct ControllerStub {
    pending: Vec<u8>,
    pub commands: Vec<(u16, Vec<u8>)>,
    pub fault: Option<(u16, Fault)>,
    pub lmp_subversion: u16,
    pub rom_version: u8,
}

impl ControllerStub {
    pub fn new() -> Self {
        Self {
            lmp_subversion: LMP_SUBVERSION,
            rom_version: ROM_VERSION,
            ..Default::default()
        }
    }

    pub fn with_fault(mut self, opcode: u16, fault: Fault) -> Self {
        self.fault = Some((opcode, fault));
        self
    }

    /// Feed one byte written by the host; returns a reply once a full
    /// command has been seen.
    fn feed(&mut self, byte: u8) -> Option<Vec<u8>> {
        self.pending.push(byte);
        if self.pending[0] != 0x01 {
            self.pending.clear();
            return None;
        }
        if self.pending.len() < 4 || self.pending.len() < 4 + self.pending[3] as usize {
            return None;
        }

        let frame = std::mem::take(&mut self.pending);
        let opcode = u16::from_le_bytes([frame[1], frame[2]]);
        let params = frame[4..].to_vec();
        let reply = self.respond(opcode, &params);
        self.commands.push((opcode, params));
        Some(reply)
    }

    /// Command Complete (with type byte) answering `opcode`
    pub fn respond(&self, opcode: u16, params: &[u8]) -> Vec<u8> {
        let mut ret = match opcode {
            0x1001 => {
                let [lo, hi] = self.lmp_subversion.to_le_bytes();
                vec![0x0B, 0x00, 0x00, 0x0B, 0x5D, 0x00, lo, hi]
            }
            0xFC6D => vec![self.rom_version],
            0xFC20 => vec![params.first().copied().unwrap_or(0)],
            _ => Vec::new(),
        };

        let mut status = 0;
        let mut echoed = opcode;
        match self.fault {
            Some((op, Fault::Status(code))) if op == opcode => status = code,
            Some((op, Fault::WrongOpcode)) if op == opcode => echoed = opcode.wrapping_add(1),
            Some((op, Fault::DropLastFlag)) if op == opcode => {
                if let Some(ack) = ret.first_mut() {
                    *ack &= 0x7F;
                }
            }
            _ => {}
        }
        command_complete(echoed, status, &ret)
    }

    /// Opcodes received so far, in order
    pub fn opcodes(&self) -> Vec<u16> {
        self.commands.iter().map(|(opcode, _)| *opcode).collect()
    }
}

/// H4 Command Complete event with the type byte
pub fn command_complete(opcode: u16, status: u8, params: &[u8]) -> Vec<u8> {
    let mut event = vec![0x04, 0x0E, (4 + params.len()) as u8, 0x01];
    event.extend_from_slice(&opcode.to_le_bytes());
    event.push(status);
    event.extend_from_slice(params);
    event
}

/// H4 LE Meta event with the type byte
pub fn le_meta_event(subevent: u8, params: &[u8]) -> Vec<u8> {
    let mut event = vec![0x04, 0x3E, (1 + params.len()) as u8, subevent];
    event.extend_from_slice(params);
    event
}

#[derive(Debug, Default)]
pub struct UartState {
    pub rx_fifo: VecDeque<u8>,
    pub tx_log: Vec<u8>,
    pub rx_irq: bool,
    pub tx_irq: bool,
    pub initialized: bool,
    pub baud: u32,
    pub flow_control: bool,
    pub baud_history: Vec<u32>,
    pub line_error: bool,
    pub line_errors_cleared: usize,
    pub init_count: usize,
    pub deinit_count: usize,
    tx_budget: usize,
    pub stub: Option<ControllerStub>,
}

/// In-memory UART; clones share the same state
#[derive(Debug, Clone, Default)]
pub struct FakeUart(pub Arc<Mutex<UartState>>);

impl FakeUart {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stub(stub: ControllerStub) -> Self {
        let uart = Self::new();
        uart.state().stub = Some(stub);
        uart
    }

    pub fn state(&self) -> MutexGuard<'_, UartState> {
        self.0.lock().unwrap()
    }

    /// Bytes arriving from the controller
    pub fn inject(&self, bytes: &[u8]) {
        self.state().rx_fifo.extend(bytes.iter().copied());
    }

    pub fn tx_log(&self) -> Vec<u8> {
        self.state().tx_log.clone()
    }

    pub fn commands(&self) -> Vec<(u16, Vec<u8>)> {
        self.state().stub.as_ref().map(|stub| stub.commands.clone()).unwrap_or_default()
    }

    pub fn opcodes(&self) -> Vec<u16> {
        self.state().stub.as_ref().map(ControllerStub::opcodes).unwrap_or_default()
    }
}

impl UartHal for FakeUart {
    fn init(&mut self, baud: u32, flow_control: bool) {
        let mut state = self.state();
        state.initialized = true;
        state.baud = baud;
        state.flow_control = flow_control;
        state.init_count += 1;
        state.baud_history.push(baud);
    }

    fn deinit(&mut self) {
        let mut state = self.state();
        state.initialized = false;
        state.rx_irq = false;
        state.tx_irq = false;
        state.deinit_count += 1;
    }

    fn set_baud_rate(&mut self, baud: u32) {
        let mut state = self.state();
        state.baud = baud;
        state.baud_history.push(baud);
    }

    fn interrupt_status(&mut self) -> IrqStatus {
        let mut state = self.state();
        state.tx_budget = TX_FIFO_DEPTH;
        IrqStatus {
            rx_ready: state.rx_irq && !state.rx_fifo.is_empty(),
            tx_ready: state.tx_irq,
            line_error: state.line_error,
        }
    }

    fn clear_line_status(&mut self) {
        let mut state = self.state();
        state.line_error = false;
        state.line_errors_cleared += 1;
    }

    fn read_byte(&mut self) -> Option<u8> {
        self.state().rx_fifo.pop_front()
    }

    fn write_byte(&mut self, byte: u8) -> nb::Result<(), Infallible> {
        let mut guard = self.state();
        let state = &mut *guard;
        if state.tx_budget == 0 {
            return Err(nb::Error::WouldBlock);
        }
        state.tx_budget -= 1;
        state.tx_log.push(byte);
        if let Some(reply) = state.stub.as_mut().and_then(|stub| stub.feed(byte)) {
            state.rx_fifo.extend(reply);
        }
        Ok(())
    }

    fn set_rx_interrupt(&mut self, enabled: bool) {
        self.state().rx_irq = enabled;
    }

    fn set_tx_interrupt(&mut self, enabled: bool) {
        self.state().tx_irq = enabled;
    }
}

/// Stand-in for the UART interrupt: service the transport forever.
pub async fn pump<H: UartHal, const N: usize>(transport: &UartTransport<H, N>) {
    loop {
        transport.on_interrupt();
        yield_now().await;
    }
}

/// Run `fut` to completion with the interrupt pump alongside.
pub fn run_with_isr<H: UartHal, const N: usize, F: Future>(transport: &UartTransport<H, N>, fut: F) -> F::Output {
    match block_on(select(pump(transport), fut)) {
        Either::First(()) => unreachable!("pump never returns"),
        Either::Second(output) => output,
    }
}

/// Yield until `done` holds.
pub async fn wait_until(mut done: impl FnMut() -> bool) {
    while !done() {
        yield_now().await;
    }
}

/// Host stack double recording everything it is told
#[derive(Debug, Default)]
pub struct RecordingStack {
    pub events: Mutex<Vec<IfEvent>>,
    pub received: Mutex<Vec<Vec<u8>>>,
    pub completed: Mutex<Vec<Vec<u8>>>,
}

impl RecordingStack {
    pub fn events(&self) -> Vec<IfEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn received(&self) -> Vec<Vec<u8>> {
        self.received.lock().unwrap().clone()
    }

    pub fn completed(&self) -> Vec<Vec<u8>> {
        self.completed.lock().unwrap().clone()
    }
}

impl HciStack for RecordingStack {
    fn recv(&self, packet: RxPacket) {
        self.received.lock().unwrap().push(packet.as_bytes().to_vec());
    }

    fn send_complete(&self, packet: &TxPacket) {
        self.completed.lock().unwrap().push(packet.body().to_vec());
    }

    fn on_event(&self, event: IfEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// One patch record for [`build_image`]
#[derive(Debug, Clone)]
pub struct Record {
    pub chip_revision: u8,
    pub priority: u8,
    pub key_id: u8,
    pub payload: Vec<u8>,
}

impl Record {
    pub fn new(chip_revision: u8, priority: u8, payload: &[u8]) -> Self {
        Self {
            chip_revision,
            priority,
            key_id: 0,
            payload: payload.to_vec(),
        }
    }

    pub fn keyed(mut self, key_id: u8) -> Self {
        self.key_id = key_id;
        self
    }
}

/// One section for [`build_image`]
#[derive(Debug, Clone)]
pub struct Section {
    pub opcode: u32,
    pub records: Vec<Record>,
}

impl Section {
    pub fn new(opcode: u32, records: Vec<Record>) -> Self {
        Self { opcode, records }
    }
}

/// v2 patch image from sections
pub fn build_image(sections: &[Section]) -> Vec<u8> {
    let mut image = b"RTBTCore".to_vec();
    image.extend_from_slice(&0x2024_0101u32.to_le_bytes());
    image.extend_from_slice(&0x0012_0000u32.to_le_bytes());
    image.extend_from_slice(&(sections.len() as u32).to_le_bytes());

    for section in sections {
        let mut payload = Vec::new();
        payload.extend_from_slice(&(section.records.len() as u16).to_le_bytes());
        payload.extend_from_slice(&[0, 0]);
        for record in &section.records {
            payload.extend_from_slice(&[record.chip_revision, record.priority, record.key_id, 0]);
            payload.extend_from_slice(&(record.payload.len() as u32).to_le_bytes());
            payload.extend_from_slice(&record.payload);
        }
        image.extend_from_slice(&section.opcode.to_le_bytes());
        image.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        image.extend_from_slice(&payload);
    }
    image
}

/// Append an extension trailer carrying `project_id`
pub fn with_project_id(mut image: Vec<u8>, project_id: u8) -> Vec<u8> {
    // terminator, then [value][len][op]
    image.extend_from_slice(&[0x00, 0xFF]);
    image.extend_from_slice(&[project_id, 0x01, 0x00]);
    image.extend_from_slice(&0x77FD_0451u32.to_le_bytes());
    image
}

/// Configuration blob from `(offset, value)` entries
pub fn config_blob(entries: &[(u16, &[u8])]) -> Vec<u8> {
    let mut body = Vec::new();
    for (offset, value) in entries {
        body.extend_from_slice(&offset.to_le_bytes());
        body.push(value.len() as u8);
        body.extend_from_slice(value);
    }
    let mut blob = 0x8723_AB55u32.to_le_bytes().to_vec();
    blob.extend_from_slice(&(body.len() as u16).to_le_bytes());
    blob.extend_from_slice(&body);
    blob
}

/// Deterministic filler bytes
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| seed.wrapping_add(i as u8)).collect()
}
