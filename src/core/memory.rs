//! Buffer Pool Management
//!
//! Static buffer pools for the receive and transmit paths. Uses atomic-pool
//! for zero-allocation buffer management; every buffer goes back to its
//! pool when the owning packet is dropped.

use core::sync::atomic::{AtomicUsize, Ordering};

use atomic_pool::{pool, Box};

use crate::core::protocol::{HciPacketHeader, PacketType};

/// Largest H4 frame: type byte + 4-byte ACL/ISO header + 1024-byte body
pub const BUFFER_SIZE: usize = 1 + 4 + 1024;

/// Number of RX buffers
pub const RX_POOL_SIZE: usize = 8;

/// Number of TX buffers
pub const TX_POOL_SIZE: usize = 8;

pool!(RxPool: [[u8; BUFFER_SIZE]; RX_POOL_SIZE]);
pool!(TxPool: [[u8; BUFFER_SIZE]; TX_POOL_SIZE]);

static RX_IN_USE: AtomicUsize = AtomicUsize::new(0);
static TX_IN_USE: AtomicUsize = AtomicUsize::new(0);

/// Buffer pool errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BufferError {
    /// No buffers available in pool
    PoolExhausted,
    /// Buffer too small for data
    BufferTooSmall,
    /// Invalid buffer size
    InvalidSize,
    /// TX queue has no free slot
    QueueFull,
}

/// One received H4 packet: `[type][header][body]`
pub struct RxPacket {
    data: Box<RxPool>,
    len: usize,
    packet_type: PacketType,
}

impl RxPacket {
    /// Take a buffer from the RX pool. `None` when the pool is exhausted.
    pub fn alloc(packet_type: PacketType) -> Option<Self> {
        let mut data = Box::<RxPool>::new([0; BUFFER_SIZE])?;
        RX_IN_USE.fetch_add(1, Ordering::Relaxed);
        data[0] = packet_type as u8;
        Some(Self {
            data,
            len: 1,
            packet_type,
        })
    }

    pub fn packet_type(&self) -> PacketType {
        self.packet_type
    }

    /// Whole frame including the H4 type byte
    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// Header and body, without the H4 type byte
    pub fn payload(&self) -> &[u8] {
        &self.data[1..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len <= 1
    }

    pub fn capacity(&self) -> usize {
        BUFFER_SIZE
    }

    /// Full backing storage for the framer to fill
    pub(crate) fn storage_mut(&mut self) -> &mut [u8] {
        &mut self.data[..]
    }

    pub(crate) fn set_len(&mut self, len: usize) -> Result<(), BufferError> {
        if len == 0 || len > BUFFER_SIZE {
            return Err(BufferError::InvalidSize);
        }
        self.len = len;
        Ok(())
    }
}

impl Drop for RxPacket {
    fn drop(&mut self) {
        RX_IN_USE.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Source of receive buffers for the H4 framer
pub trait RxAllocator {
    /// Buffer able to hold the whole frame announced by `header`, or `None`
    /// under memory pressure.
    fn alloc(&self, header: &HciPacketHeader) -> Option<RxPacket>;
}

/// Allocator backed by the static RX pool
#[derive(Debug, Clone, Copy, Default)]
pub struct PoolAllocator;

impl RxAllocator for PoolAllocator {
    fn alloc(&self, header: &HciPacketHeader) -> Option<RxPacket> {
        if header.frame_len() > BUFFER_SIZE {
            return None;
        }
        RxPacket::alloc(header.packet_type())
    }
}

/// Outbound H4 frame; byte 0 is reserved for the packet type
pub struct TxPacket {
    data: Box<TxPool>,
    len: usize,
    packet_type: PacketType,
}

impl TxPacket {
    /// Allocate a new TX packet from the pool and copy `body` behind the
    /// reserved type byte.
    pub fn new(packet_type: PacketType, body: &[u8]) -> Result<Self, BufferError> {
        if body.len() + 1 > BUFFER_SIZE {
            return Err(BufferError::BufferTooSmall);
        }

        let mut buffer = Box::<TxPool>::new([0; BUFFER_SIZE]).ok_or(BufferError::PoolExhausted)?;
        TX_IN_USE.fetch_add(1, Ordering::Relaxed);

        buffer[0] = packet_type as u8;
        buffer[1..body.len() + 1].copy_from_slice(body);

        Ok(Self {
            data: buffer,
            len: body.len() + 1,
            packet_type,
        })
    }

    pub fn packet_type(&self) -> PacketType {
        self.packet_type
    }

    /// Body without the type byte
    pub fn body(&self) -> &[u8] {
        &self.data[1..self.len]
    }

    /// Frame with the reserved leading byte
    pub fn frame_mut(&mut self) -> &mut [u8] {
        &mut self.data[..self.len]
    }

    /// Body length
    pub fn len(&self) -> usize {
        self.len - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len <= 1
    }
}

impl Drop for TxPacket {
    fn drop(&mut self) {
        TX_IN_USE.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Who handed a buffer to the interface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TxOrigin {
    /// Supplied by the host stack, completion must be acknowledged
    Stack,
    /// Created inside this crate
    Internal,
}

/// Pending outbound buffer
pub struct TxItem {
    pub packet: TxPacket,
    pub origin: TxOrigin,
}

/// TX queue for managing outgoing packets
pub struct TxQueue {
    queue: heapless::Deque<TxItem, TX_POOL_SIZE>,
}

impl TxQueue {
    /// Create a new TX queue
    pub const fn new() -> Self {
        Self {
            queue: heapless::Deque::new(),
        }
    }

    /// Enqueue a packet for transmission
    pub fn enqueue(&mut self, item: TxItem) -> Result<(), BufferError> {
        self.queue.push_back(item).map_err(|_| BufferError::QueueFull)
    }

    /// Dequeue the next packet for transmission
    pub fn dequeue(&mut self) -> Option<TxItem> {
        self.queue.pop_front()
    }

    /// Drop every pending item, returning how many were freed
    pub fn clear(&mut self) -> usize {
        let count = self.queue.len();
        self.queue.clear();
        count
    }

    /// Check if queue is empty
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Check if queue is full
    pub fn is_full(&self) -> bool {
        self.queue.is_full()
    }

    /// Get queue length
    pub fn len(&self) -> usize {
        self.queue.len()
    }
}

impl Default for TxQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Buffer pool statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PoolStats {
    pub rx_allocated: usize,
    pub rx_available: usize,
    pub tx_allocated: usize,
    pub tx_available: usize,
}

/// Get current pool statistics
pub fn stats() -> PoolStats {
    let rx = RX_IN_USE.load(Ordering::Relaxed);
    let tx = TX_IN_USE.load(Ordering::Relaxed);
    PoolStats {
        rx_allocated: rx,
        rx_available: RX_POOL_SIZE.saturating_sub(rx),
        tx_allocated: tx,
        tx_available: TX_POOL_SIZE.saturating_sub(tx),
    }
}
