//! H4 Framer
//!
//! Turns the UART byte stream into HCI packets and back. Receive runs as a
//! state machine inside the worker future:
//!
//! ```text
//! AWAIT_TYPE -> AWAIT_HEADER -> [AWAIT_SUBEVENT] -> AWAIT_BODY -> DISPATCH
//! ```
//!
//! The sub-event state is only entered for LE Meta events, whose first body
//! byte decides whether the packet may be dropped under memory pressure.

use crate::core::memory::{RxAllocator, RxPacket};
use crate::core::protocol::{event, HciPacketHeader, PacketType, ProtocolError};
use crate::core::transport::{TransportError, UartHal, UartTransport};

/// Largest fixed header behind the type byte (ACL / ISO)
const MAX_HEADER_LEN: usize = 4;

/// Scratch size used to skip the body of a discarded packet
const DISCARD_CHUNK: usize = 32;

/// Framer errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum H4Error {
    Transport(TransportError),
    Protocol(ProtocolError),
    /// Allocator had no buffer for a packet that must not be dropped
    AllocFailed { packet_type: PacketType, len: usize },
    /// Packet does not fit the buffer handed out by the allocator
    TooLong,
}

impl From<TransportError> for H4Error {
    fn from(err: TransportError) -> Self {
        H4Error::Transport(err)
    }
}

impl From<ProtocolError> for H4Error {
    fn from(err: ProtocolError) -> Self {
        H4Error::Protocol(err)
    }
}

/// Where assembled packets go
pub trait RxTarget {
    fn on_packet(&self, packet: RxPacket);
}

/// Receive-side state, exposed for tracing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RxState {
    AwaitType,
    AwaitHeader(PacketType),
    AwaitSubevent,
    AwaitBody { len: usize },
    Dispatch,
}

/// H4 framer over a ring-buffered UART
pub struct H4Framer<'t, H, const N: usize> {
    transport: &'t UartTransport<H, N>,
}

impl<H, const N: usize> Clone for H4Framer<'_, H, N> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<H, const N: usize> Copy for H4Framer<'_, H, N> {}

impl<'t, H: UartHal, const N: usize> H4Framer<'t, H, N> {
    pub const fn new(transport: &'t UartTransport<H, N>) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &'t UartTransport<H, N> {
        self.transport
    }

    /// Worker loop. Only returns on a fatal error; the transport must be
    /// reopened before receiving again.
    pub async fn rx_loop<A: RxAllocator, T: RxTarget>(&self, alloc: &A, target: &T) -> H4Error {
        loop {
            if let Err(err) = self.receive_packet(alloc, target).await {
                if !matches!(err, H4Error::Transport(TransportError::NotOpen)) {
                    error!("h4: rx loop stopped: {:?}", err);
                }
                return err;
            }
        }
    }

    /// Run the state machine for one packet (or one skipped byte).
    pub async fn receive_packet<A: RxAllocator, T: RxTarget>(&self, alloc: &A, target: &T) -> Result<(), H4Error> {
        let mut state = RxState::AwaitType;
        let mut header_bytes = [0u8; MAX_HEADER_LEN];
        let mut header = None;
        let mut packet: Option<RxPacket> = None;

        loop {
            state = match state {
                RxState::AwaitType => {
                    let mut byte = [0u8; 1];
                    self.transport.read_exact(&mut byte).await?;
                    match PacketType::from_u8(byte[0]) {
                        Some(PacketType::Command) | None => {
                            warn!("h4: skipping unexpected type byte 0x{:02X}", byte[0]);
                            return Ok(());
                        }
                        Some(packet_type) => RxState::AwaitHeader(packet_type),
                    }
                }
                RxState::AwaitHeader(packet_type) => {
                    let header_len = packet_type.header_len();
                    self.transport.read_exact(&mut header_bytes[..header_len]).await?;
                    let parsed = HciPacketHeader::parse(packet_type, &header_bytes[..header_len])?;
                    header = Some(parsed);
                    if parsed.event_code() == Some(event::LE_META) && parsed.body_len() > 0 {
                        RxState::AwaitSubevent
                    } else {
                        self.allocate(alloc, &parsed, None, &header_bytes, &mut packet).await?
                    }
                }
                RxState::AwaitSubevent => {
                    let mut byte = [0u8; 1];
                    self.transport.read_exact(&mut byte).await?;
                    let parsed = header.ok_or(ProtocolError::InvalidLength)?;
                    self.allocate(alloc, &parsed, Some(byte[0]), &header_bytes, &mut packet).await?
                }
                RxState::AwaitBody { len } => {
                    let parsed = header.ok_or(ProtocolError::InvalidLength)?;
                    let frame_len = parsed.frame_len();
                    let Some(rx) = packet.as_mut() else {
                        return Err(H4Error::TooLong);
                    };
                    let start = frame_len - len;
                    self.transport.read_exact(&mut rx.storage_mut()[start..frame_len]).await?;
                    rx.set_len(frame_len).map_err(|_| H4Error::TooLong)?;
                    RxState::Dispatch
                }
                RxState::Dispatch => {
                    if let Some(rx) = packet.take() {
                        target.on_packet(rx);
                    }
                    return Ok(());
                }
            };
        }
    }

    /// Ask the allocator for a buffer once the header (and sub-event) are known.
    ///
    /// Discardable packets that get no buffer are skipped here and the
    /// machine goes straight back to `AwaitType`.
    async fn allocate<A: RxAllocator>(
        &self,
        alloc: &A,
        header: &HciPacketHeader,
        subevent: Option<u8>,
        header_bytes: &[u8; MAX_HEADER_LEN],
        packet: &mut Option<RxPacket>,
    ) -> Result<RxState, H4Error> {
        let header_len = header.packet_type().header_len();
        let consumed = usize::from(subevent.is_some());
        let remaining = header.body_len() - consumed;

        match alloc.alloc(header) {
            Some(mut rx) => {
                if header.frame_len() > rx.capacity() {
                    return Err(H4Error::TooLong);
                }
                let storage = rx.storage_mut();
                storage[1..1 + header_len].copy_from_slice(&header_bytes[..header_len]);
                if let Some(subevent) = subevent {
                    storage[1 + header_len] = subevent;
                }
                *packet = Some(rx);
                Ok(RxState::AwaitBody { len: remaining })
            }
            None if subevent.is_some_and(event::is_discardable_subevent) => {
                debug!("h4: no buffer, discarding LE sub-event {:?} ({} bytes)", subevent, remaining);
                self.discard(remaining).await?;
                Ok(RxState::Dispatch)
            }
            None => {
                error!(
                    "h4: no buffer for {:?} packet of {} bytes",
                    header.packet_type(),
                    header.body_len()
                );
                Err(H4Error::AllocFailed {
                    packet_type: header.packet_type(),
                    len: header.body_len(),
                })
            }
        }
    }

    async fn discard(&self, mut len: usize) -> Result<(), H4Error> {
        let mut scratch = [0u8; DISCARD_CHUNK];
        while len > 0 {
            let chunk = len.min(DISCARD_CHUNK);
            self.transport.read_exact(&mut scratch[..chunk]).await?;
            len -= chunk;
        }
        Ok(())
    }

    /// Send the type byte then `body` as one uninterrupted write.
    /// Returns the number of body bytes sent.
    pub async fn send(&self, packet_type: PacketType, body: &[u8]) -> Result<usize, H4Error> {
        let indicator = [packet_type as u8];
        let sent = self.transport.send_parts(&[&indicator[..], body]).await?;
        Ok(sent - indicator.len())
    }

    /// Send a frame whose first byte the caller reserved for the type.
    /// Returns the number of body bytes sent.
    pub async fn send_reserved(&self, packet_type: PacketType, frame: &mut [u8]) -> Result<usize, H4Error> {
        let Some(slot) = frame.first_mut() else {
            return Err(ProtocolError::InvalidLength.into());
        };
        *slot = packet_type as u8;
        let sent = self.transport.send(frame).await?;
        Ok(sent - 1)
    }
}
