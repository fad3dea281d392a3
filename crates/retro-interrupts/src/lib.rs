//! Chained priority-interrupt-controller pair for a virtualized legacy PC.
//!
//! Guest software programs and observes a faithful pair of 8259-style chips
//! through four I/O ports, while the host side schedules, defers, coalesces
//! and recovers interrupts whose real sources are host events. On top of
//! the bit-exact register protocol sit three host-only layers:
//!
//! - a priority dispatch core that maps every source onto one linear level
//!   scale and runs the highest-priority eligible handler, reentrancy-safe
//!   by construction;
//! - heuristic completion tracking for dispatches that run guest code,
//!   built on opaque trap markers the guest-execution engine reports back;
//! - a virtual-time schedule table with a watchdog that force-redelivers
//!   requests whose completion was never observed.
//!
//! The guest-execution engine itself is a collaborator, not part of this
//! crate: it consumes [`GuestDispatch`] values and calls
//! [`VirtualPic::on_trap_return`] and [`VirtualPic::tick`].

#![forbid(unsafe_code)]

mod chip;
mod completion;
mod controller;
pub mod levels;
mod sched;
mod stack;

pub use chip::Chip;
pub use completion::TrapMarker;
pub use controller::{
    GuestDispatch, LevelHandler, RegisterError, TuningParams, VirtualPic, MASTER_CMD, MASTER_DATA,
    SLAVE_CMD, SLAVE_DATA,
};
pub use sched::{Ticks, MAX_INTERVAL, TICK_RATE};
