//! Standalone Command/Response Engine
//!
//! During bring-up there is no host stack yet, so the receive path is bound
//! to a one-shot exchange: the engine sends a command and sleeps until the
//! framer hands over the next event. Once bring-up succeeds the router is
//! switched to stack mode and every packet goes to [`HciStack::recv`].

use core::cell::Cell;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex as BlockingMutex;
use embassy_sync::signal::Signal;

use crate::commands::HciLink;
use crate::core::h4::{H4Error, H4Framer, RxTarget};
use crate::core::memory::RxPacket;
use crate::core::protocol::{PacketType, ProtocolError};
use crate::core::transport::UartHal;
use crate::interface::HciStack;

/// Receive target binding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RouteMode {
    /// Events complete the pending standalone exchange
    Standalone,
    /// Everything goes to the host stack
    Stack,
}

/// Whether a standalone send waits for the reply event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SyncMode {
    Sync,
    NotSync,
}

#[derive(Clone, Copy)]
struct RouterState {
    mode: RouteMode,
    waiting: bool,
}

/// Two-state receive target shared by the framer worker and the bring-up code
pub struct HciRouter<'s, S> {
    stack: &'s S,
    state: BlockingMutex<CriticalSectionRawMutex, Cell<RouterState>>,
    exchange: Signal<CriticalSectionRawMutex, RxPacket>,
}

impl<'s, S: HciStack> HciRouter<'s, S> {
    pub const fn new(stack: &'s S) -> Self {
        Self {
            stack,
            state: BlockingMutex::new(Cell::new(RouterState {
                mode: RouteMode::Standalone,
                waiting: false,
            })),
            exchange: Signal::new(),
        }
    }

    pub fn mode(&self) -> RouteMode {
        self.state.lock(|state| state.get().mode)
    }

    /// Rebind the receive target. Any armed exchange is abandoned.
    pub fn set_mode(&self, mode: RouteMode) {
        self.state.lock(|state| state.set(RouterState { mode, waiting: false }));
        self.exchange.reset();
        debug!("router: mode {:?}", mode);
    }

    pub fn stack(&self) -> &'s S {
        self.stack
    }

    /// Prepare for the next event before the command leaves.
    pub(crate) fn arm(&self) {
        self.exchange.reset();
        self.state.lock(|state| {
            let mut current = state.get();
            current.waiting = true;
            state.set(current);
        });
    }

    pub(crate) fn disarm(&self) {
        self.state.lock(|state| {
            let mut current = state.get();
            current.waiting = false;
            state.set(current);
        });
    }

    /// Wait for the event completing the armed exchange.
    pub(crate) async fn wait_event(&self) -> RxPacket {
        self.exchange.wait().await
    }
}

impl<S: HciStack> RxTarget for HciRouter<'_, S> {
    fn on_packet(&self, packet: RxPacket) {
        let deliver = self.state.lock(|state| {
            let mut current = state.get();
            match current.mode {
                RouteMode::Stack => Some(RouteMode::Stack),
                RouteMode::Standalone if current.waiting && packet.packet_type() == PacketType::Event => {
                    current.waiting = false;
                    state.set(current);
                    Some(RouteMode::Standalone)
                }
                RouteMode::Standalone => None,
            }
        });

        match deliver {
            Some(RouteMode::Stack) => self.stack.recv(packet),
            Some(RouteMode::Standalone) => self.exchange.signal(packet),
            None => debug!(
                "router: dropping unsolicited {:?} packet ({} bytes)",
                packet.packet_type(),
                packet.len()
            ),
        }
    }
}

/// Synchronous command/response engine used during bring-up
pub struct Standalone<'r, 't, 's, H, S, const N: usize> {
    framer: H4Framer<'t, H, N>,
    router: &'r HciRouter<'s, S>,
}

impl<'r, 't, 's, H: UartHal, S: HciStack, const N: usize> Standalone<'r, 't, 's, H, S, N> {
    pub fn new(framer: H4Framer<'t, H, N>, router: &'r HciRouter<'s, S>) -> Self {
        Self { framer, router }
    }

    pub fn framer(&self) -> &H4Framer<'t, H, N> {
        &self.framer
    }

    /// Send `buf[..len]` as a `packet_type` packet.
    ///
    /// With [`SyncMode::Sync`] the reply event (type byte stripped) is copied
    /// back into `buf` and its length returned; `buf` must be large enough for
    /// the bigger of the command and the event. There is no timeout. With
    /// [`SyncMode::NotSync`] the number of bytes sent is returned.
    pub async fn send(
        &self,
        packet_type: PacketType,
        buf: &mut [u8],
        len: usize,
        mode: SyncMode,
    ) -> Result<usize, H4Error> {
        let Some(packet) = buf.get(..len) else {
            return Err(ProtocolError::InvalidLength.into());
        };
        if mode == SyncMode::NotSync {
            return self.framer.send(packet_type, packet).await;
        }

        self.router.arm();
        if let Err(err) = self.framer.send(packet_type, packet).await {
            self.router.disarm();
            return Err(err);
        }

        let event = self.router.wait_event().await;
        let payload = event.payload();
        let copied = payload.len().min(buf.len());
        buf[..copied].copy_from_slice(&payload[..copied]);
        Ok(copied)
    }
}

impl<H: UartHal, S: HciStack, const N: usize> HciLink for Standalone<'_, '_, '_, H, S, N> {
    async fn exchange(&mut self, buf: &mut [u8], len: usize) -> Result<usize, H4Error> {
        self.send(PacketType::Command, buf, len, SyncMode::Sync).await
    }

    fn set_baud_rate(&mut self, baud: u32) {
        self.framer.transport().set_baud_rate(baud);
    }

    fn baud_rate(&self) -> u32 {
        self.framer.transport().baud_rate()
    }
}
