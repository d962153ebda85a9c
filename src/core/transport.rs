//! UART Transport Layer
//!
//! Ring-buffered, interrupt-driven byte channel to the radio controller:
//! - RX: the UART ISR moves bytes from the hardware FIFO into a [`RingBuffer`]
//!   and throttles the peer through flow control when the ring fills up
//! - TX: `send()` stages bytes and sleeps until the TX-ready interrupt has
//!   pushed the last one into the hardware FIFO

use core::cell::RefCell;
use core::convert::Infallible;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex as BlockingMutex;
use embassy_sync::mutex::Mutex;
use embassy_sync::signal::Signal;

use crate::config::{FLOW_CTRL_HIGH_WATER, FLOW_CTRL_LOW_WATER, RX_RING_SIZE, TX_STAGING_SIZE};
use crate::core::ring_buffer::{FlowAction, RingBuffer};

/// Pending UART interrupt sources
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct IrqStatus {
    /// RX FIFO holds data
    pub rx_ready: bool,
    /// TX FIFO can take more data
    pub tx_ready: bool,
    /// Overrun, parity, framing or break condition
    pub line_error: bool,
}

/// UART peripheral register access provided by the platform
pub trait UartHal {
    /// Power up and configure the peripheral
    fn init(&mut self, baud: u32, flow_control: bool);

    /// Power the peripheral down
    fn deinit(&mut self);

    /// Reprogram the baud generator
    fn set_baud_rate(&mut self, baud: u32);

    /// Currently pending (and enabled) interrupt sources
    fn interrupt_status(&mut self) -> IrqStatus;

    /// Acknowledge a line-status interrupt
    fn clear_line_status(&mut self);

    /// Pop one byte from the RX FIFO
    fn read_byte(&mut self) -> Option<u8>;

    /// Push one byte into the TX FIFO, `WouldBlock` when it is full
    fn write_byte(&mut self, byte: u8) -> nb::Result<(), Infallible>;

    fn set_rx_interrupt(&mut self, enabled: bool);

    fn set_tx_interrupt(&mut self, enabled: bool);
}

/// Transport errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransportError {
    /// Transport is not open (or was closed while waiting)
    NotOpen,
    /// `open()` called twice
    AlreadyOpen,
}

struct TxStaging {
    buf: [u8; TX_STAGING_SIZE],
    len: usize,
    pos: usize,
    active: bool,
}

impl TxStaging {
    const fn new() -> Self {
        Self {
            buf: [0; TX_STAGING_SIZE],
            len: 0,
            pos: 0,
            active: false,
        }
    }

    fn load(&mut self, data: &[u8]) {
        self.buf[..data.len()].copy_from_slice(data);
        self.len = data.len();
        self.pos = 0;
        self.active = true;
    }

    fn reset(&mut self) {
        self.len = 0;
        self.pos = 0;
        self.active = false;
    }
}

struct Inner<H, const N: usize> {
    hal: H,
    ring: RingBuffer<N>,
    tx: TxStaging,
    rx_ind: Option<fn()>,
    baud: u32,
    opened: bool,
}

/// What one ISR invocation did, reported outside the critical section
#[derive(Default)]
struct IsrResult {
    received: bool,
    line_error: bool,
    throttled: bool,
    tx_finished: bool,
    rx_ind: Option<fn()>,
}

/// Ring-buffered UART transport
pub struct UartTransport<H, const N: usize = RX_RING_SIZE> {
    inner: BlockingMutex<CriticalSectionRawMutex, RefCell<Inner<H, N>>>,
    rx_signal: Signal<CriticalSectionRawMutex, ()>,
    tx_done: Signal<CriticalSectionRawMutex, ()>,
    tx_lock: Mutex<CriticalSectionRawMutex, ()>,
}

impl<H: UartHal, const N: usize> UartTransport<H, N> {
    pub const fn new(hal: H) -> Self {
        Self {
            inner: BlockingMutex::new(RefCell::new(Inner {
                hal,
                ring: RingBuffer::new(FLOW_CTRL_LOW_WATER, FLOW_CTRL_HIGH_WATER),
                tx: TxStaging::new(),
                rx_ind: None,
                baud: 0,
                opened: false,
            })),
            rx_signal: Signal::new(),
            tx_done: Signal::new(),
            tx_lock: Mutex::new(()),
        }
    }

    /// Reset the ring buffer, bring the UART up and enable RX.
    pub fn open(&self, baud: u32, flow_control: bool) -> Result<(), TransportError> {
        self.inner.lock(|inner| {
            let mut inner = inner.borrow_mut();
            if inner.opened {
                return Err(TransportError::AlreadyOpen);
            }
            inner.ring.clear();
            inner.tx.reset();
            inner.hal.init(baud, flow_control);
            inner.hal.set_rx_interrupt(true);
            inner.baud = baud;
            inner.opened = true;
            Ok(())
        })?;
        self.rx_signal.reset();
        self.tx_done.reset();
        info!("uart: opened at {} baud, flow control {}", baud, flow_control);
        Ok(())
    }

    /// Disable interrupts, power the UART down and drop pending bytes.
    ///
    /// Wakes any reader or writer still waiting so it can observe `NotOpen`.
    pub fn close(&self) {
        let was_open = self.inner.lock(|inner| {
            let mut inner = inner.borrow_mut();
            if !inner.opened {
                return false;
            }
            inner.hal.set_rx_interrupt(false);
            inner.hal.set_tx_interrupt(false);
            inner.hal.deinit();
            inner.ring.clear();
            inner.tx.reset();
            inner.opened = false;
            true
        });
        if was_open {
            self.rx_signal.signal(());
            self.tx_done.signal(());
            info!("uart: closed");
        }
    }

    pub fn is_open(&self) -> bool {
        self.inner.lock(|inner| inner.borrow().opened)
    }

    /// Register a callback invoked from the ISR after new bytes arrived.
    pub fn set_rx_ind(&self, callback: Option<fn()>) {
        self.inner.lock(|inner| inner.borrow_mut().rx_ind = callback);
    }

    /// Reprogram the local baud generator.
    pub fn set_baud_rate(&self, baud: u32) {
        self.inner.lock(|inner| {
            let mut inner = inner.borrow_mut();
            inner.hal.set_baud_rate(baud);
            inner.baud = baud;
        });
        debug!("uart: baud rate now {}", baud);
    }

    pub fn baud_rate(&self) -> u32 {
        self.inner.lock(|inner| inner.borrow().baud)
    }

    /// Bytes waiting in the ring buffer
    pub fn pending(&self) -> usize {
        self.inner.lock(|inner| inner.borrow().ring.pending())
    }

    /// Send `data`, returning once the last byte sits in the hardware FIFO.
    pub async fn send(&self, data: &[u8]) -> Result<usize, TransportError> {
        self.send_parts(&[data]).await
    }

    /// Send several slices back to back without another sender interleaving.
    pub async fn send_parts(&self, parts: &[&[u8]]) -> Result<usize, TransportError> {
        let _guard = self.tx_lock.lock().await;
        let mut sent = 0;
        for chunk in parts.iter().flat_map(|part| part.chunks(TX_STAGING_SIZE)) {
            self.tx_done.reset();
            self.inner.lock(|inner| {
                let mut inner = inner.borrow_mut();
                if !inner.opened {
                    return Err(TransportError::NotOpen);
                }
                inner.tx.load(chunk);
                inner.hal.set_tx_interrupt(true);
                Ok(())
            })?;
            self.tx_done.wait().await;
            if !self.is_open() {
                return Err(TransportError::NotOpen);
            }
            sent += chunk.len();
        }
        Ok(sent)
    }

    /// Drain up to `out.len()` buffered bytes without waiting.
    pub fn read(&self, out: &mut [u8]) -> usize {
        let (count, resumed) = self.inner.lock(|inner| {
            let mut inner = inner.borrow_mut();
            let inner = &mut *inner;
            let count = inner.ring.read(out);
            let resumed = inner.ring.check_resume() == FlowAction::EnableRx;
            if resumed && inner.opened {
                inner.hal.set_rx_interrupt(true);
            }
            (count, resumed)
        });
        if resumed {
            debug!("uart: rx resumed");
        }
        count
    }

    /// Fill `out` completely, waiting for the ISR as needed.
    pub async fn read_exact(&self, out: &mut [u8]) -> Result<(), TransportError> {
        let mut filled = 0;
        while filled < out.len() {
            let count = self.read(&mut out[filled..]);
            filled += count;
            if filled < out.len() {
                if count == 0 && !self.is_open() {
                    return Err(TransportError::NotOpen);
                }
                self.rx_signal.wait().await;
            }
        }
        Ok(())
    }

    /// UART interrupt handler. Allocation-free, never blocks.
    pub fn on_interrupt(&self) {
        let result = self.inner.lock(|inner| {
            let mut inner = inner.borrow_mut();
            let inner = &mut *inner;
            let mut result = IsrResult::default();
            if !inner.opened {
                return result;
            }

            let status = inner.hal.interrupt_status();

            if status.line_error {
                inner.hal.clear_line_status();
                result.line_error = true;
            }

            if status.rx_ready && !inner.ring.rx_disabled() {
                while !inner.ring.is_full() {
                    match inner.hal.read_byte() {
                        Some(byte) => {
                            inner.ring.push(byte);
                            result.received = true;
                        }
                        None => break,
                    }
                }
                if inner.ring.check_throttle() == FlowAction::DisableRx {
                    inner.hal.set_rx_interrupt(false);
                    result.throttled = true;
                }
            }

            if status.tx_ready && inner.tx.active {
                while inner.tx.pos < inner.tx.len {
                    match inner.hal.write_byte(inner.tx.buf[inner.tx.pos]) {
                        Ok(()) => inner.tx.pos += 1,
                        Err(nb::Error::WouldBlock) => break,
                        Err(nb::Error::Other(never)) => match never {},
                    }
                }
                if inner.tx.pos == inner.tx.len {
                    inner.tx.active = false;
                    inner.hal.set_tx_interrupt(false);
                    result.tx_finished = true;
                }
            }

            result.rx_ind = inner.rx_ind;
            result
        });

        if result.line_error {
            warn!("uart: line status error cleared");
        }
        if result.throttled {
            debug!("uart: rx throttled");
        }
        if result.received {
            self.rx_signal.signal(());
            if let Some(rx_ind) = result.rx_ind {
                rx_ind();
            }
        }
        if result.tx_finished {
            self.tx_done.signal(());
        }
    }
}
