mod common;

use common::bus::DummyUsbBus;
use common::{buffer, buffer_with, pattern};
use usb_device::endpoint::EndpointAddress;
use usb_device::UsbDirection;
use usbd_msc::udc::request::{Completion, Owner, RequestId, Status};
use usbd_msc::udc::setup::SetupPacket;
use usbd_msc::udc::{EpKind, Udc, UdcConfig, UdcError, UdcEvent, UsbSpeed};

fn ep_in(idx: usize) -> EndpointAddress {
    EndpointAddress::from_parts(idx, UsbDirection::In)
}

fn ep_out(idx: usize) -> EndpointAddress {
    EndpointAddress::from_parts(idx, UsbDirection::Out)
}

/// Attached controller after a bus reset, bulk IN 1 and bulk OUT 2 reserved
fn attached() -> (DummyUsbBus, Udc<DummyUsbBus>) {
    let bus = DummyUsbBus::new();
    let mut udc = Udc::new(bus.clone(), UdcConfig::default()).unwrap();
    udc.reserve_endpoint(ep_in(1), EpKind::Bulk, 64, 0).unwrap();
    udc.reserve_endpoint(ep_out(2), EpKind::Bulk, 64, 0).unwrap();
    udc.attach();
    assert!(bus.is_enabled());

    bus.bus_reset();
    udc.poll();
    assert_eq!(Some(UdcEvent::Reset), udc.take_event());
    assert_eq!(UsbSpeed::Full, udc.speed());
    (bus, udc)
}

fn with_bulk() -> (DummyUsbBus, Udc<DummyUsbBus>) {
    let (bus, mut udc) = attached();
    udc.create_bulk_endpoint(ep_in(1), 64).unwrap();
    udc.create_bulk_endpoint(ep_out(2), 64).unwrap();
    (bus, udc)
}

fn in_request(udc: &mut Udc<DummyUsbBus>, data: &[u8]) -> RequestId {
    let id = udc.alloc_request(Owner::Device).unwrap();
    assert!(udc.request_mut(id).unwrap().add_buffer(buffer_with(data)).is_ok());
    id
}

fn out_request(udc: &mut Udc<DummyUsbBus>, len: usize) -> RequestId {
    let id = udc.alloc_request(Owner::Device).unwrap();
    assert!(udc.request_mut(id).unwrap().add_buffer(buffer(len)).is_ok());
    id
}

fn completions(udc: &mut Udc<DummyUsbBus>) -> Vec<Completion> {
    let mut out = Vec::new();
    while let Some(event) = udc.take_event() {
        if let UdcEvent::Complete(c) = event {
            out.push(c);
        }
    }
    out
}

fn poll_n(udc: &mut Udc<DummyUsbBus>, n: usize) {
    for _ in 0..n {
        udc.poll();
    }
}

#[test]
fn reject_bad_ep0_packet_size() {
    let config = UdcConfig {
        max_packet_size_0: 48,
        ..Default::default()
    };
    assert_eq!(
        Some(UdcError::InvalidArg),
        Udc::new(DummyUsbBus::new(), config).err()
    );
}

#[test]
fn reserve_after_attach_is_unsupported() {
    let (_bus, mut udc) = attached();
    assert_eq!(
        Err(UdcError::Unsupported),
        udc.reserve_endpoint(ep_in(3), EpKind::Bulk, 64, 0)
    );
}

#[test]
fn bulk_endpoint_checks() {
    let (_bus, mut udc) = attached();
    assert_eq!(Err(UdcError::InvalidArg), udc.create_bulk_endpoint(ep_in(1), 48));
    // bigger than what was reserved
    assert_eq!(Err(UdcError::InvalidArg), udc.create_bulk_endpoint(ep_in(1), 128));
    // never reserved
    assert_eq!(Err(UdcError::InvalidArg), udc.create_bulk_endpoint(ep_in(3), 64));
    assert_eq!(Err(UdcError::InvalidEndpoint), udc.create_bulk_endpoint(ep_in(0), 64));

    assert_eq!(Ok(ep_in(1)), udc.create_bulk_endpoint(ep_in(1), 32));
    assert_eq!(Err(UdcError::Busy), udc.create_bulk_endpoint(ep_in(1), 32));
    assert!(udc.is_valid_endpoint(ep_in(1)));
    assert!(!udc.is_valid_endpoint(ep_out(1)));

    udc.destroy_endpoint(ep_in(1)).unwrap();
    assert!(!udc.is_valid_endpoint(ep_in(1)));
}

#[test]
fn submit_checks_direction_and_creation() {
    let (_bus, mut udc) = attached();
    let id = out_request(&mut udc, 64);
    assert_eq!(Err(UdcError::InvalidEndpoint), udc.submit_out(ep_out(2), id));
    udc.create_bulk_endpoint(ep_out(2), 64).unwrap();
    assert_eq!(Err(UdcError::InvalidEndpoint), udc.submit_in(ep_out(2), id));
}

#[test]
fn in_requests_complete_in_order() {
    let (bus, mut udc) = with_bulk();
    let first = pattern(100, 1);
    let second = pattern(10, 2);
    let a = in_request(&mut udc, &first);
    let b = in_request(&mut udc, &second);
    udc.submit_in(ep_in(1), a).unwrap();
    udc.submit_in(ep_in(1), b).unwrap();

    poll_n(&mut udc, 8);

    let packets = bus.read_packets(1);
    assert_eq!(vec![64, 36, 10], packets.iter().map(Vec::len).collect::<Vec<_>>());
    assert_eq!([first.clone(), second.clone()].concat(), packets.concat());

    let done = completions(&mut udc);
    assert_eq!(2, done.len());
    assert_eq!((a, Status::Ok), (done[0].req, done[0].status));
    assert_eq!((b, Status::Ok), (done[1].req, done[1].status));
    assert_eq!(ep_in(1), done[0].ep);
    assert_eq!(100, udc.request(a).unwrap().bytes_xfered);
}

#[test]
fn in_request_ends_with_zlp_on_packet_boundary() {
    let (bus, mut udc) = with_bulk();
    let id = in_request(&mut udc, &pattern(128, 3));
    udc.request_mut(id).unwrap().short_pkt = true;
    udc.submit_in(ep_in(1), id).unwrap();
    poll_n(&mut udc, 8);

    let packets = bus.read_packets(1);
    assert_eq!(vec![64, 64, 0], packets.iter().map(Vec::len).collect::<Vec<_>>());
    assert_eq!(1, completions(&mut udc).len());
}

#[test]
fn out_request_completes_on_short_packet() {
    let (bus, mut udc) = with_bulk();
    let data = pattern(100, 4);
    bus.write(2, &data);

    let id = out_request(&mut udc, 256);
    udc.submit_out(ep_out(2), id).unwrap();

    let done = completions(&mut udc);
    assert_eq!(1, done.len());
    assert_eq!(Status::Ok, done[0].status);
    let req = udc.request(id).unwrap();
    assert_eq!(100, req.bytes_xfered);
    assert_eq!(&data[..], &req.first_buffer().unwrap().as_slice()[..100]);
}

#[test]
fn out_request_completes_when_full() {
    let (bus, mut udc) = with_bulk();
    let data = pattern(160, 5);
    bus.write(2, &data);

    let a = out_request(&mut udc, 128);
    let b = out_request(&mut udc, 128);
    udc.submit_out(ep_out(2), a).unwrap();
    udc.submit_out(ep_out(2), b).unwrap();

    let done = completions(&mut udc);
    assert_eq!(vec![a, b], done.iter().map(|c| c.req).collect::<Vec<_>>());
    assert_eq!(128, udc.request(a).unwrap().bytes_xfered);
    assert_eq!(32, udc.request(b).unwrap().bytes_xfered);
    assert_eq!(0, bus.pending_out(2));
}

#[test]
fn out_data_arriving_later_is_read_on_poll() {
    let (bus, mut udc) = with_bulk();
    let id = out_request(&mut udc, 64);
    udc.submit_out(ep_out(2), id).unwrap();
    assert!(completions(&mut udc).is_empty());

    bus.write(2, &[1, 2, 3]);
    udc.poll();
    let done = completions(&mut udc);
    assert_eq!(1, done.len());
    assert_eq!(3, udc.request(id).unwrap().bytes_xfered);
}

#[test]
fn flush_completes_queued_requests_in_order() {
    let (_bus, mut udc) = with_bulk();
    let a = out_request(&mut udc, 64);
    let b = out_request(&mut udc, 64);
    udc.submit_out(ep_out(2), a).unwrap();
    udc.submit_out(ep_out(2), b).unwrap();

    udc.flush(ep_out(2)).unwrap();
    let done = completions(&mut udc);
    assert_eq!(
        vec![(a, Status::Flushed), (b, Status::Flushed)],
        done.iter().map(|c| (c.req, c.status)).collect::<Vec<_>>()
    );
    assert_eq!(Status::Flushed, udc.request(a).unwrap().status);
}

#[test]
fn free_request_drops_its_queued_completion() {
    let (bus, mut udc) = with_bulk();
    let a = out_request(&mut udc, 64);
    let b = out_request(&mut udc, 64);
    bus.write(2, &[0xAA; 10]);
    udc.submit_out(ep_out(2), a).unwrap();
    udc.submit_out(ep_out(2), b).unwrap();
    udc.flush(ep_out(2)).unwrap();

    assert!(udc.free_request(a).is_some());
    let done = completions(&mut udc);
    assert_eq!(vec![b], done.iter().map(|c| c.req).collect::<Vec<_>>());
    assert!(udc.request(a).is_none());
    assert!(udc.free_request(a).is_none());
}

#[test]
fn out_halt_drops_received_data() {
    let (bus, mut udc) = with_bulk();
    bus.write(2, &pattern(256, 6));
    udc.set_halt(ep_out(2)).unwrap();
    assert!(bus.is_stalled_out(2));
    assert_eq!(0, bus.pending_out(2));
    assert_eq!(Ok(true), udc.is_halted(ep_out(2)));

    udc.clear_halt(ep_out(2)).unwrap();
    assert!(!bus.is_stalled_out(2));
    assert_eq!(Ok(false), udc.is_halted(ep_out(2)));
}

#[test]
fn in_halt_waits_for_packet_in_flight() {
    let (bus, mut udc) = with_bulk();
    let data = pattern(100, 7);
    let id = in_request(&mut udc, &data);
    udc.submit_in(ep_in(1), id).unwrap();

    udc.set_halt(ep_in(1)).unwrap();
    assert_eq!(Ok(true), udc.is_halted(ep_in(1)));
    assert!(!bus.is_stalled_in(1));

    poll_n(&mut udc, 4);
    assert!(bus.is_stalled_in(1));
    assert_eq!(vec![64], bus.read_packets(1).iter().map(Vec::len).collect::<Vec<_>>());
    assert!(completions(&mut udc).is_empty());

    udc.clear_halt(ep_in(1)).unwrap();
    poll_n(&mut udc, 4);
    assert_eq!(&data[64..], &bus.read(1)[..]);
    assert_eq!(1, completions(&mut udc).len());
}

#[test]
fn wedged_endpoint_ignores_clear_halt() {
    let (bus, mut udc) = with_bulk();
    udc.set_wedge(ep_in(1)).unwrap();
    assert!(bus.is_stalled_in(1));
    assert_eq!(Ok(true), udc.is_wedged(ep_in(1)));

    udc.clear_halt(ep_in(1)).unwrap();
    assert!(bus.is_stalled_in(1));
    assert_eq!(Ok(true), udc.is_halted(ep_in(1)));

    udc.clear_wedge(ep_in(1)).unwrap();
    assert_eq!(Ok(true), udc.is_halted(ep_in(1)));
    udc.clear_halt(ep_in(1)).unwrap();
    assert!(!bus.is_stalled_in(1));
    assert_eq!(Ok(false), udc.is_halted(ep_in(1)));
}

#[test]
fn setup_packet_is_reported() {
    let (bus, mut udc) = attached();
    let raw = [0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00];
    bus.setup(raw);
    udc.poll();
    assert_eq!(
        Some(UdcEvent::Setup(SetupPacket::from_bytes(&raw))),
        udc.take_event()
    );
}

#[test]
fn ep0_stall_is_cleared_by_next_setup() {
    let (bus, mut udc) = attached();
    bus.setup([0x00, 0x09, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00]);
    udc.poll();
    udc.ep0_stall();
    assert!(bus.is_stalled_in(0));
    assert!(bus.is_stalled_out(0));

    bus.setup([0x80, 0x00, 0x00, 0x00, 0x00, 0x00, 0x02, 0x00]);
    udc.poll();
    assert!(!bus.is_stalled_in(0));
    assert!(!bus.is_stalled_out(0));
}

#[test]
fn address_applies_after_status_stage() {
    let (bus, mut udc) = attached();
    bus.setup([0x00, 0x05, 0x07, 0x00, 0x00, 0x00, 0x00, 0x00]);
    udc.poll();
    udc.set_address(7);
    udc.ep0_send_status();
    assert_eq!(0, udc.address());

    udc.poll();
    assert_eq!(7, udc.address());
    assert_eq!(7, bus.address());
    assert_eq!(vec![Vec::<u8>::new()], bus.read_packets(0));
}

#[test]
fn ep0_data_in_with_zlp() {
    let (bus, mut udc) = attached();
    let data = pattern(128, 8);
    let id = in_request(&mut udc, &data);
    udc.request_mut(id).unwrap().short_pkt = true;
    udc.ep0_submit_in(id).unwrap();
    assert_eq!(Err(UdcError::Busy), udc.ep0_submit_in(id));

    poll_n(&mut udc, 4);
    let packets = bus.read_packets(0);
    assert_eq!(vec![64, 64, 0], packets.iter().map(Vec::len).collect::<Vec<_>>());
    let done = completions(&mut udc);
    assert_eq!(1, done.len());
    assert_eq!(ep_in(0), done[0].ep);
}

#[test]
fn bus_reset_flushes_ep0_transfer() {
    let (bus, mut udc) = attached();
    let id = out_request(&mut udc, 16);
    udc.ep0_submit_out(id).unwrap();

    bus.bus_reset();
    udc.poll();
    let events: Vec<UdcEvent> = std::iter::from_fn(|| udc.take_event()).collect();
    assert!(events.contains(&UdcEvent::Complete(Completion {
        ep: ep_out(0),
        req: id,
        status: Status::Flushed,
    })));
    assert_eq!(Some(&UdcEvent::Reset), events.last());
}

#[test]
fn bus_events_do_not_crowd_out_completions() {
    let (bus, mut udc) = with_bulk();
    let id = in_request(&mut udc, &[1, 2, 3]);
    udc.submit_in(ep_in(1), id).unwrap();
    poll_n(&mut udc, 4);

    for _ in 0..100 {
        bus.signal_suspend();
        bus.signal_resume();
    }
    poll_n(&mut udc, 200);
    assert!(!udc.is_suspended());

    let events: Vec<UdcEvent> = std::iter::from_fn(|| udc.take_event()).collect();
    let done = UdcEvent::Complete(Completion {
        ep: ep_in(1),
        req: id,
        status: Status::Ok,
    });
    assert_eq!(vec![done, UdcEvent::Resume], events);
}

#[test]
fn reset_supersedes_earlier_bus_events() {
    let (bus, mut udc) = with_bulk();
    let id = in_request(&mut udc, &[1, 2, 3]);
    udc.submit_in(ep_in(1), id).unwrap();
    poll_n(&mut udc, 4);

    bus.signal_suspend();
    bus.setup([0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00]);
    poll_n(&mut udc, 2);
    for _ in 0..50 {
        bus.bus_reset();
    }
    poll_n(&mut udc, 60);

    let events: Vec<UdcEvent> = std::iter::from_fn(|| udc.take_event()).collect();
    assert_eq!(2, events.len());
    assert!(matches!(events[0], UdcEvent::Complete(c) if c.req == id));
    assert_eq!(UdcEvent::Reset, events[1]);
}

#[test]
fn vbus_sensing_gates_attach() {
    let bus = DummyUsbBus::new();
    let config = UdcConfig {
        vbus_sensing: true,
        ..Default::default()
    };
    let mut udc = Udc::new(bus.clone(), config).unwrap();
    udc.attach();
    assert!(!udc.is_attached());

    udc.vbus_on();
    assert!(udc.is_attached());

    udc.vbus_off();
    assert!(!udc.is_attached());
    assert_eq!(Some(UdcEvent::Reset), udc.take_event());
}

#[test]
fn detached_controller_ignores_bus() {
    let (bus, mut udc) = attached();
    udc.detach();
    bus.setup([0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00]);
    udc.poll();
    assert_eq!(None, udc.take_event());
}
