//! RX Ring Buffer
//!
//! Single-producer (UART ISR) / single-consumer (H4 worker) byte ring with
//! flow-control hysteresis. One slot is always left unused so that
//! `read_ptr == write_ptr` means empty and never full.

/// What the caller must do to the hardware RX interrupt after an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FlowAction {
    /// Leave the RX interrupt as it is
    None,
    /// Disable the RX interrupt so the peer sees flow control asserted
    DisableRx,
    /// Re-enable the RX interrupt
    EnableRx,
}

/// Fixed-capacity byte ring
pub struct RingBuffer<const N: usize> {
    buf: [u8; N],
    write_ptr: usize,
    read_ptr: usize,
    rx_disabled: bool,
    low_water: usize,
    high_water: usize,
}

impl<const N: usize> RingBuffer<N> {
    /// Create a ring with the given flow-control thresholds (free bytes).
    pub const fn new(low_water: usize, high_water: usize) -> Self {
        assert!(N > 1);
        assert!(low_water < high_water && high_water < N - 1);
        Self {
            buf: [0; N],
            write_ptr: 0,
            read_ptr: 0,
            rx_disabled: false,
            low_water,
            high_water,
        }
    }

    /// Largest number of bytes the ring can hold
    pub const fn capacity(&self) -> usize {
        N - 1
    }

    /// Bytes waiting to be read
    pub fn pending(&self) -> usize {
        (self.write_ptr + N - self.read_ptr) % N
    }

    /// Bytes that can still be written
    pub fn free_space(&self) -> usize {
        self.capacity() - self.pending()
    }

    pub fn is_empty(&self) -> bool {
        self.write_ptr == self.read_ptr
    }

    pub fn is_full(&self) -> bool {
        (self.write_ptr + 1) % N == self.read_ptr
    }

    /// True while flow control holds the RX interrupt off
    pub fn rx_disabled(&self) -> bool {
        self.rx_disabled
    }

    /// Store one byte. Returns `false` (byte dropped) when full.
    pub fn push(&mut self, byte: u8) -> bool {
        if self.is_full() {
            return false;
        }
        self.buf[self.write_ptr] = byte;
        self.write_ptr = (self.write_ptr + 1) % N;
        true
    }

    /// Drain up to `out.len()` bytes in FIFO order.
    pub fn read(&mut self, out: &mut [u8]) -> usize {
        let count = out.len().min(self.pending());
        let first = count.min(N - self.read_ptr);
        out[..first].copy_from_slice(&self.buf[self.read_ptr..self.read_ptr + first]);
        if count > first {
            out[first..count].copy_from_slice(&self.buf[..count - first]);
        }
        self.read_ptr = (self.read_ptr + count) % N;
        count
    }

    /// Producer side check, run after bytes were pushed.
    pub fn check_throttle(&mut self) -> FlowAction {
        if !self.rx_disabled && self.free_space() <= self.low_water {
            self.rx_disabled = true;
            FlowAction::DisableRx
        } else {
            FlowAction::None
        }
    }

    /// Consumer side check, run after bytes were drained.
    pub fn check_resume(&mut self) -> FlowAction {
        if self.rx_disabled && self.free_space() > self.high_water {
            self.rx_disabled = false;
            FlowAction::EnableRx
        } else {
            FlowAction::None
        }
    }

    /// Forget all pending bytes and flow-control state.
    pub fn clear(&mut self) {
        self.write_ptr = 0;
        self.read_ptr = 0;
        self.rx_disabled = false;
    }
}
