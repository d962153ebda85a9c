//! Async Interface Task
//!
//! [`HciInterface::run`] is the task body the application spawns. It owns
//! the controller lifecycle:
//!
//! ```text
//! idle --OPEN--> bring-up --READY--> running --CLOSE--> exit
//!                    |--FAIL--> idle
//!                    \--CLOSE--> exit
//! ```
//!
//! While a session is active the H4 receive worker runs concurrently with
//! the control loop. Writes submitted before bring-up finishes are queued
//! and drained once the host stack owns the receive path.

use core::cell::{Cell, RefCell};

use embassy_futures::select::{select, Either};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex as BlockingMutex;
use embassy_sync::channel::Channel;
use embassy_sync::signal::Signal;

use crate::commands::{BringUp, ProcessTable};
use crate::config::{HciConfig, RX_RING_SIZE};
use crate::core::h4::{H4Error, H4Framer};
use crate::core::memory::{BufferError, PoolAllocator, RxPacket, TxItem, TxOrigin, TxPacket, TxQueue};
use crate::core::protocol::PacketType;
use crate::core::standalone::{HciRouter, RouteMode, Standalone};
use crate::core::transport::{UartHal, UartTransport};
use crate::state::ControllerState;

/// Pending control messages
pub const CONTROL_QUEUE_DEPTH: usize = 8;

/// Upper host stack
pub trait HciStack {
    /// Packet received after bring-up
    fn recv(&self, packet: RxPacket);

    /// A buffer passed to [`HciInterface::write`] has been sent
    fn send_complete(&self, packet: &TxPacket);

    fn on_event(&self, event: IfEvent);
}

/// Lifecycle notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum IfEvent {
    /// Bring-up finished. With `mp_mode` the link is up but the host stack
    /// must not be started.
    Opened { ok: bool, mp_mode: bool },
    /// The receive worker lost synchronisation; `open()` again to recover.
    TransportLost(H4Error),
    Closed,
}

/// Control messages of the interface task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ControlMsg {
    Open,
    Ready,
    Fail,
    Close,
    Write,
}

/// How a session ended
enum SessionEnd {
    Failed,
    Lost(H4Error),
    Close,
}

/// Async HCI interface over a UART transport
pub struct HciInterface<'a, H, S, const N: usize = RX_RING_SIZE> {
    transport: &'a UartTransport<H, N>,
    router: HciRouter<'a, S>,
    config: HciConfig<'a>,
    control: Channel<CriticalSectionRawMutex, ControlMsg, CONTROL_QUEUE_DEPTH>,
    tx_queue: BlockingMutex<CriticalSectionRawMutex, RefCell<TxQueue>>,
    teardown: Signal<CriticalSectionRawMutex, ()>,
    controller: BlockingMutex<CriticalSectionRawMutex, Cell<ControllerState>>,
}

impl<'a, H: UartHal, S: HciStack, const N: usize> HciInterface<'a, H, S, N> {
    pub const fn new(transport: &'a UartTransport<H, N>, stack: &'a S, config: HciConfig<'a>) -> Self {
        Self {
            transport,
            router: HciRouter::new(stack),
            config,
            control: Channel::new(),
            tx_queue: BlockingMutex::new(RefCell::new(TxQueue::new())),
            teardown: Signal::new(),
            controller: BlockingMutex::new(Cell::new(ControllerState::new())),
        }
    }

    pub fn transport(&self) -> &'a UartTransport<H, N> {
        self.transport
    }

    pub fn router(&self) -> &HciRouter<'a, S> {
        &self.router
    }

    /// What the last bring-up learned about the controller
    pub fn controller_state(&self) -> ControllerState {
        self.controller.lock(|state| state.get())
    }

    /// Buffers waiting to be sent
    pub fn tx_pending(&self) -> usize {
        self.tx_queue.lock(|queue| queue.borrow().len())
    }

    /// Request bring-up. The result arrives as [`IfEvent::Opened`].
    pub async fn open(&self) {
        self.control.send(ControlMsg::Open).await;
    }

    /// Queue `data` for sending; acknowledged through
    /// [`HciStack::send_complete`].
    pub fn write(&self, packet_type: PacketType, data: &[u8]) -> Result<(), BufferError> {
        let packet = TxPacket::new(packet_type, data)?;
        self.enqueue(TxItem {
            packet,
            origin: TxOrigin::Stack,
        })
    }

    /// Queue a packet built inside the crate; not acknowledged to the stack.
    pub fn write_owned(&self, packet: TxPacket) -> Result<(), BufferError> {
        self.enqueue(TxItem {
            packet,
            origin: TxOrigin::Internal,
        })
    }

    /// Stop the task and wait until it has exited.
    pub async fn close(&self) {
        self.control.send(ControlMsg::Close).await;
        self.teardown.wait().await;
    }

    fn enqueue(&self, item: TxItem) -> Result<(), BufferError> {
        self.tx_queue.lock(|queue| queue.borrow_mut().enqueue(item))?;
        // One WRITE drains the whole list, a full queue already holds one
        let _ = self.control.try_send(ControlMsg::Write);
        Ok(())
    }

    /// Task body. Returns after CLOSE has been handled.
    pub async fn run(&self) {
        self.teardown.reset();
        info!("interface: task started");

        loop {
            match self.control.receive().await {
                ControlMsg::Open => match self.session().await {
                    SessionEnd::Close => {
                        self.transport.close();
                        break;
                    }
                    SessionEnd::Failed => {
                        self.transport.close();
                        self.router.set_mode(RouteMode::Standalone);
                        self.router.stack().on_event(IfEvent::Opened {
                            ok: false,
                            mp_mode: self.config.capabilities.mp_mode,
                        });
                    }
                    SessionEnd::Lost(err) => {
                        self.transport.close();
                        let was_running = self.router.mode() == RouteMode::Stack;
                        self.router.set_mode(RouteMode::Standalone);
                        let event = if was_running {
                            IfEvent::TransportLost(err)
                        } else {
                            IfEvent::Opened {
                                ok: false,
                                mp_mode: self.config.capabilities.mp_mode,
                            }
                        };
                        self.router.stack().on_event(event);
                    }
                },
                ControlMsg::Close => break,
                // Writes stay queued until a session is up
                ControlMsg::Write | ControlMsg::Ready | ControlMsg::Fail => {}
            }
        }

        let dropped = self.tx_queue.lock(|queue| queue.borrow_mut().clear());
        if dropped > 0 {
            debug!("interface: dropped {} queued buffers", dropped);
        }
        self.router.set_mode(RouteMode::Standalone);
        self.router.stack().on_event(IfEvent::Closed);
        info!("interface: task stopped");
        self.teardown.signal(());
    }

    async fn session(&self) -> SessionEnd {
        self.router.set_mode(RouteMode::Standalone);
        if let Err(err) = self.transport.open(self.config.initial_baud, self.config.flow_control) {
            error!("interface: transport open failed: {:?}", err);
            return SessionEnd::Failed;
        }

        let framer = H4Framer::new(self.transport);
        let worker = framer.rx_loop(&PoolAllocator, &self.router);
        match select(worker, self.control_loop(framer)).await {
            Either::First(err) => SessionEnd::Lost(err),
            Either::Second(end) => end,
        }
    }

    async fn control_loop(&self, framer: H4Framer<'a, H, N>) -> SessionEnd {
        let mut next = match select(self.bring_up(framer), self.wait_close()).await {
            Either::First(msg) => Some(msg),
            Either::Second(()) => {
                warn!("interface: closed during bring-up");
                return SessionEnd::Close;
            }
        };

        loop {
            let msg = match next.take() {
                Some(msg) => msg,
                None => self.control.receive().await,
            };
            match msg {
                ControlMsg::Ready => {
                    let mp_mode = self.config.capabilities.mp_mode;
                    if !mp_mode {
                        self.router.set_mode(RouteMode::Stack);
                    }
                    info!("interface: opened (mp mode {})", mp_mode);
                    self.router.stack().on_event(IfEvent::Opened { ok: true, mp_mode });
                    self.drain_tx(framer).await;
                }
                ControlMsg::Fail => return SessionEnd::Failed,
                ControlMsg::Write => self.drain_tx(framer).await,
                ControlMsg::Close => return SessionEnd::Close,
                ControlMsg::Open => warn!("interface: already open"),
            }
        }
    }

    /// Consume control messages until CLOSE. Queued writes are drained once
    /// the session is ready, so WRITE needs no handling here.
    async fn wait_close(&self) {
        loop {
            match self.control.receive().await {
                ControlMsg::Close => return,
                ControlMsg::Open => warn!("interface: already open"),
                ControlMsg::Write | ControlMsg::Ready | ControlMsg::Fail => {}
            }
        }
    }

    /// Run the process table. Yields READY or FAIL.
    async fn bring_up(&self, framer: H4Framer<'a, H, N>) -> ControlMsg {
        let mut state = ControllerState::new();
        state.working_baud = self.config.initial_baud;

        let mut link = Standalone::new(framer, &self.router);
        let table = ProcessTable::new(&self.config.capabilities);
        let result = {
            let mut ctx = BringUp::new(&mut link, &self.config, &mut state);
            table.run(&mut ctx).await
        };
        self.controller.lock(|controller| controller.set(state));

        match result {
            Ok(()) => ControlMsg::Ready,
            Err(err) => {
                error!("interface: bring-up failed: {:?}", err);
                ControlMsg::Fail
            }
        }
    }

    /// Send queued buffers in submission order.
    async fn drain_tx(&self, framer: H4Framer<'a, H, N>) {
        while let Some(mut item) = self.tx_queue.lock(|queue| queue.borrow_mut().dequeue()) {
            let packet_type = item.packet.packet_type();
            if let Err(err) = framer.send_reserved(packet_type, item.packet.frame_mut()).await {
                warn!("interface: send failed: {:?}", err);
            }
            if item.origin == TxOrigin::Stack {
                self.router.stack().send_complete(&item.packet);
            }
        }
    }
}
