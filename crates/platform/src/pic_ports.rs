//! Puts the interrupt controller on the guest port map.
//!
//! [`IoPortBus`](crate::io::IoPortBus) maps one port to one device
//! instance, and the controller answers on four ports, so the controller is
//! shared behind `Rc<RefCell<…>>` and registered once per port.

use std::cell::RefCell;
use std::rc::Rc;

use retro_interrupts::{VirtualPic, MASTER_CMD, MASTER_DATA, SLAVE_CMD, SLAVE_DATA};

use crate::io::{IoPortBus, PortIoDevice};

pub type SharedVirtualPic = Rc<RefCell<VirtualPic>>;

/// One-port view of a shared [`VirtualPic`].
struct PicPort {
    pic: SharedVirtualPic,
    port: u16,
}

impl PortIoDevice for PicPort {
    fn read_u8(&mut self, port: u16) -> u8 {
        debug_assert_eq!(port, self.port);
        self.pic.borrow().port_read(port)
    }

    fn write_u8(&mut self, port: u16, value: u8) {
        debug_assert_eq!(port, self.port);
        self.pic.borrow_mut().port_write(port, value);
    }

    fn reset(&mut self) {
        // The controller is shared across four port entries; resetting it
        // once per entry is idempotent.
        self.pic.borrow_mut().reset();
    }
}

/// Registers the controller's four legacy ports on the bus.
pub fn register_pic_ports(bus: &mut IoPortBus, pic: SharedVirtualPic) {
    for port in [MASTER_CMD, MASTER_DATA, SLAVE_CMD, SLAVE_DATA] {
        bus.register(
            port,
            Box::new(PicPort {
                pic: pic.clone(),
                port,
            }),
        );
    }
}
