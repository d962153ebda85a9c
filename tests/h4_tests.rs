//! H4 framer tests

mod common;

use std::cell::{Cell, RefCell};

use ameba_bt_hci::core::h4::{H4Error, H4Framer, RxTarget};
use ameba_bt_hci::core::memory::{PoolAllocator, RxAllocator, RxPacket};
use ameba_bt_hci::core::protocol::{HciPacketHeader, PacketType};
use ameba_bt_hci::core::transport::UartTransport;
use embassy_futures::block_on;

use common::*;

/// Collects delivered frames
#[derive(Default)]
struct Collector(RefCell<Vec<Vec<u8>>>);

impl RxTarget for Collector {
    fn on_packet(&self, packet: RxPacket) {
        self.0.borrow_mut().push(packet.as_bytes().to_vec());
    }
}

/// Refuses buffers for LE Meta events or for everything
struct StarvedAllocator {
    refuse_all: Cell<bool>,
}

impl StarvedAllocator {
    fn le_meta_only() -> Self {
        Self {
            refuse_all: Cell::new(false),
        }
    }

    fn everything() -> Self {
        Self {
            refuse_all: Cell::new(true),
        }
    }
}

impl RxAllocator for StarvedAllocator {
    fn alloc(&self, header: &HciPacketHeader) -> Option<RxPacket> {
        if self.refuse_all.get() || header.event_code() == Some(0x3E) {
            return None;
        }
        RxPacket::alloc(header.packet_type())
    }
}

fn setup(bytes: &[u8]) -> (FakeUart, UartTransport<FakeUart>) {
    let uart = FakeUart::new();
    let transport: UartTransport<FakeUart> = UartTransport::new(uart.clone());
    transport.open(115_200, true).unwrap();
    uart.inject(bytes);
    transport.on_interrupt();
    (uart, transport)
}

mod tests {
    use super::*;

    #[test]
    fn test_event_packet_delivered() {
        let event = command_complete(0x0C03, 0, &[]);
        let (_uart, transport) = setup(&event);
        let framer = H4Framer::new(&transport);
        let collector = Collector::default();

        block_on(framer.receive_packet(&PoolAllocator, &collector)).unwrap();

        assert_eq!(collector.0.borrow().as_slice(), &[event]);
        assert_eq!(transport.pending(), 0);
    }

    #[test]
    fn test_acl_packet_delivered() {
        let mut acl = vec![0x02, 0x40, 0x00, 0x05, 0x00];
        acl.extend_from_slice(&pattern(5, 0x10));
        let (_uart, transport) = setup(&acl);
        let framer = H4Framer::new(&transport);
        let collector = Collector::default();

        block_on(framer.receive_packet(&PoolAllocator, &collector)).unwrap();

        assert_eq!(collector.0.borrow().as_slice(), &[acl]);
    }

    #[test]
    fn test_le_meta_keeps_subevent_byte() {
        let event = le_meta_event(0x01, &pattern(18, 0));
        let (_uart, transport) = setup(&event);
        let framer = H4Framer::new(&transport);
        let collector = Collector::default();

        block_on(framer.receive_packet(&PoolAllocator, &collector)).unwrap();

        assert_eq!(collector.0.borrow().as_slice(), &[event]);
    }

    #[test]
    fn test_unknown_type_byte_skipped() {
        let event = command_complete(0x1001, 0, &[1, 2, 3]);
        let mut bytes = vec![0xAB, 0x00];
        bytes.extend_from_slice(&event);
        let (_uart, transport) = setup(&bytes);
        let framer = H4Framer::new(&transport);
        let collector = Collector::default();

        for _ in 0..3 {
            block_on(framer.receive_packet(&PoolAllocator, &collector)).unwrap();
        }

        assert_eq!(collector.0.borrow().as_slice(), &[event]);
    }

    #[test]
    fn test_discardable_report_dropped_under_pressure() {
        let report = le_meta_event(0x02, &pattern(40, 3));
        let event = command_complete(0xFC6D, 0, &[2]);
        let mut bytes = report.clone();
        bytes.extend_from_slice(&event);
        let (_uart, transport) = setup(&bytes);
        let framer = H4Framer::new(&transport);
        let collector = Collector::default();
        let alloc = StarvedAllocator::le_meta_only();

        block_on(framer.receive_packet(&alloc, &collector)).unwrap();
        assert!(collector.0.borrow().is_empty());
        assert_eq!(transport.pending(), event.len());

        block_on(framer.receive_packet(&alloc, &collector)).unwrap();
        assert_eq!(collector.0.borrow().as_slice(), &[event]);
    }

    #[test]
    fn test_extended_report_also_discardable() {
        let report = le_meta_event(0x0D, &pattern(60, 9));
        let (_uart, transport) = setup(&report);
        let framer = H4Framer::new(&transport);
        let collector = Collector::default();

        block_on(framer.receive_packet(&StarvedAllocator::le_meta_only(), &collector)).unwrap();

        assert!(collector.0.borrow().is_empty());
        assert_eq!(transport.pending(), 0);
    }

    #[test]
    fn test_non_discardable_alloc_failure_is_fatal() {
        let event = le_meta_event(0x01, &pattern(18, 0));
        let (_uart, transport) = setup(&event);
        let framer = H4Framer::new(&transport);
        let collector = Collector::default();

        let err = block_on(framer.rx_loop(&StarvedAllocator::le_meta_only(), &collector));

        assert_eq!(
            err,
            H4Error::AllocFailed {
                packet_type: PacketType::Event,
                len: 19
            }
        );
        assert!(collector.0.borrow().is_empty());
    }

    #[test]
    fn test_oversized_acl_is_fatal() {
        // handle 0x0001, length 2000: larger than any pool buffer
        let (_uart, transport) = setup(&[0x02, 0x01, 0x00, 0xD0, 0x07]);
        let framer = H4Framer::new(&transport);
        let collector = Collector::default();

        let err = block_on(framer.receive_packet(&PoolAllocator, &collector));

        assert_eq!(
            err,
            Err(H4Error::AllocFailed {
                packet_type: PacketType::Acl,
                len: 2000
            })
        );
    }

    #[test]
    fn test_starved_acl_is_fatal() {
        let (_uart, transport) = setup(&[0x02, 0x01, 0x00, 0x02, 0x00, 0xAA, 0xBB]);
        let framer = H4Framer::new(&transport);

        let err = block_on(framer.receive_packet(&StarvedAllocator::everything(), &Collector::default()));

        assert!(matches!(err, Err(H4Error::AllocFailed { packet_type: PacketType::Acl, len: 2 })));
    }

    #[test]
    fn test_send_prefixes_type_byte() {
        let (uart, transport) = setup(&[]);
        let framer = H4Framer::new(&transport);

        let sent = run_with_isr(&transport, framer.send(PacketType::Command, &[0x03, 0x0C, 0x00]));

        assert_eq!(sent, Ok(3));
        assert_eq!(uart.tx_log(), vec![0x01, 0x03, 0x0C, 0x00]);
    }

    #[test]
    fn test_send_reserved_uses_leading_slot() {
        let (uart, transport) = setup(&[]);
        let framer = H4Framer::new(&transport);
        let mut frame = [0xFF, 0x40, 0x00, 0x02, 0x00, 0x11, 0x22];

        let sent = run_with_isr(&transport, framer.send_reserved(PacketType::Acl, &mut frame));

        assert_eq!(sent, Ok(6));
        assert_eq!(uart.tx_log(), vec![0x02, 0x40, 0x00, 0x02, 0x00, 0x11, 0x22]);
    }

    #[test]
    fn test_rx_loop_stops_when_transport_closes() {
        let (_uart, transport) = setup(&[]);
        let framer = H4Framer::new(&transport);
        let collector = Collector::default();

        let (err, _) = block_on(embassy_futures::join::join(
            framer.rx_loop(&PoolAllocator, &collector),
            async {
                embassy_futures::yield_now().await;
                transport.close();
            },
        ));

        assert_eq!(err, H4Error::Transport(ameba_bt_hci::core::transport::TransportError::NotOpen));
    }
}
