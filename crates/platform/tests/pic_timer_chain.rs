//! End-to-end flow: the guest programs the chips over the port bus, a
//! periodic timer source keeps itself scheduled, and a scripted guest
//! completes each delivery with an EOI and a trap return.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use retro_interrupts::{
    levels, GuestDispatch, Ticks, VirtualPic, MASTER_CMD, MASTER_DATA, SLAVE_CMD, SLAVE_DATA,
};
use retro_platform::{register_pic_ports, IoPortBus};

/// ~54.9 ms timer period in tick units.
const TIMER_PERIOD: Ticks = 65_536;

#[test]
fn timer_interrupt_chain_via_port_bus() {
    let pic = Rc::new(RefCell::new(VirtualPic::new()));
    let mut bus = IoPortBus::new();
    register_pic_ports(&mut bus, pic.clone());

    // Timer source: every delivery re-arms the period and runs guest code.
    let inbox: Rc<RefCell<Vec<GuestDispatch>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = inbox.clone();
    pic.borrow_mut()
        .register(
            levels::IRQ0,
            Some(Rc::new(move |p: &mut VirtualPic| {
                p.schedule(levels::IRQ0, TIMER_PERIOD);
                if let Some(d) = p.begin_dispatch(levels::IRQ0) {
                    sink.borrow_mut().push(d);
                }
            })),
            0,
        )
        .unwrap();
    pic.borrow_mut().unmask(levels::IRQ0);

    // Guest boot code: remap both chips, then open only the timer line.
    bus.write_u8(MASTER_CMD, 0x11);
    bus.write_u8(MASTER_DATA, 0x20);
    bus.write_u8(MASTER_DATA, 0x04);
    bus.write_u8(SLAVE_CMD, 0x11);
    bus.write_u8(SLAVE_DATA, 0x28);
    bus.write_u8(SLAVE_DATA, 0x02);
    bus.write_u8(MASTER_DATA, 0xFE);
    bus.write_u8(SLAVE_DATA, 0xFF);

    pic.borrow_mut().tick(Duration::from_secs(1));
    pic.borrow_mut().request(levels::IRQ0);

    let mut delivered = 0u32;
    for i in 1..=100u64 {
        pic.borrow_mut().tick(Duration::from_millis(1000 + i * 55));
        pic.borrow_mut().run_pending();

        // The guest's interrupt service routine, one delivery per slice.
        let next = inbox.borrow_mut().pop();
        if let Some(d) = next {
            assert_eq!(d.vector, 0x20);
            bus.write_u8(MASTER_CMD, 0x20);
            pic.borrow_mut().on_trap_return(d.marker);
            delivered += 1;
        }
    }

    assert!(delivered >= 90, "only {delivered} timer deliveries in 100 slices");
    assert_eq!(pic.borrow().nesting_depth(), 0);
    assert_eq!(pic.borrow().in_service(), 0);
}

#[test]
fn mask_state_survives_unrelated_bus_traffic() {
    let pic = Rc::new(RefCell::new(VirtualPic::new()));
    let mut bus = IoPortBus::new();
    register_pic_ports(&mut bus, pic.clone());

    bus.write_u8(MASTER_DATA, 0x5A);
    // Pokes at unmapped ports go nowhere.
    bus.write_u8(0x60, 0x12);
    bus.write_u8(0x43, 0x34);
    assert_eq!(bus.read_u8(MASTER_DATA), 0x5A);
    assert_eq!(bus.read_u8(0x60), 0xFF);
}
