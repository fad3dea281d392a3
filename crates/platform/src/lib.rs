//! Machine-side plumbing around the interrupt controller: the guest port
//! I/O dispatch table and the wiring that puts the controller on it.

#![forbid(unsafe_code)]

pub mod io;
pub mod pic_ports;

pub use io::{IoPortBus, PortIoDevice};
pub use pic_ports::{register_pic_ports, SharedVirtualPic};
