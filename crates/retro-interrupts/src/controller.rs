//! The controller proper: priority arbitration, guest port protocol,
//! completion tracking and the schedule/watchdog pass, all over one shared
//! set of level bitmasks.

use std::rc::Rc;
use std::time::Duration;

use thiserror::Error;

use crate::chip::{self, Chip, ChipState, CommandBits, EOI_CLASS_MASK, EOI_PATTERN};
use crate::completion::{CompletionTracker, TrapMarker};
use crate::levels::{self, HW_LEVELS, SLAVE_LEVELS};
use crate::sched::{Scheduler, Ticks, NEVER};
use crate::stack::DispatchStack;

/// Command/status port of the first chip.
pub const MASTER_CMD: u16 = 0x20;
/// Data/mask port of the first chip.
pub const MASTER_DATA: u16 = 0x21;
/// Command/status port of the second chip.
pub const SLAVE_CMD: u16 = 0xA0;
/// Data/mask port of the second chip.
pub const SLAVE_DATA: u16 = 0xA1;

/// Callback run when its level wins arbitration.
///
/// The handler receives the controller itself so it can re-enter it: a
/// device handler typically either finishes on the spot (host-internal
/// levels) or calls [`VirtualPic::begin_dispatch`] to hand the level to
/// guest execution, and may call [`VirtualPic::request`] or
/// [`VirtualPic::schedule`] to pace itself.
pub type LevelHandler = Rc<dyn Fn(&mut VirtualPic)>;

/// Empirically tuned knobs, preserved with their observed defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TuningParams {
    /// How far special mask mode widens the preemption window. The default
    /// spans the whole level range, so special mask mode effectively
    /// disables the "only strictly higher priority may preempt" rule.
    pub special_mask_span: u8,
    /// Dispatch-nesting depth above which fresh requests are parked in the
    /// pending queue, and at or below which a completed trap return
    /// immediately re-runs arbitration.
    pub overdrive_threshold: u32,
}

impl Default for TuningParams {
    fn default() -> Self {
        Self {
            special_mask_span: 32,
            overdrive_threshold: 1,
        }
    }
}

/// Hand-off value for a dispatch that must run guest code: the vector to
/// steer the guest to, and the marker the execution engine must report back
/// through [`VirtualPic::on_trap_return`] when the guest's rewritten return
/// path is reached.
#[derive(Debug, Clone, Copy)]
pub struct GuestDispatch {
    pub level: u8,
    pub vector: u8,
    pub marker: TrapMarker,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegisterError {
    #[error("interrupt level {0} is out of range (0..=31)")]
    LevelOutOfRange(u8),
}

struct LevelSlot {
    handler: Option<LevelHandler>,
    vector: u8,
}

/// Software model of the chained interrupt-controller pair plus the
/// host-side layers stacked on it.
///
/// All entry points run on one logical thread, but they re-enter each
/// other freely: a handler invoked by [`run_pending`](Self::run_pending)
/// may call [`request`](Self::request), which may be observed by the very
/// sweep that invoked the handler. Every bitmask update is therefore
/// written clear-then-verify, and re-dispatch happens only at the sweep's
/// own loop checkpoint.
pub struct VirtualPic {
    chips: [ChipState; 2],
    slots: [LevelSlot; levels::COUNT],
    /// Vector recorded for the cascade slot by chip-0 ICW2; the machine's
    /// unvectored-IRQ9 quirk wants it.
    irq2_vector: u8,
    /// Request register, shared across both chips.
    irr: u32,
    /// In-service register, shared across both chips.
    isr: u32,
    /// Second in-service register for the slave's levels; slave interrupts
    /// take two EOIs, and this register absorbs the first.
    slave_isr: u32,
    /// Host-private mask; a level with no handler stays masked here.
    host_mask: u32,
    /// Guest IF gate: masks the hardware levels while the guest runs with
    /// interrupts disabled.
    cli_mask: u32,
    smm_active: bool,
    /// Cached top of the dispatch stack, [`levels::NONE`] when idle.
    current: u8,
    stack: DispatchStack,
    tracker: CompletionTracker,
    /// Levels requested while busy, waiting for a completion to promote
    /// them into the request register.
    pending: u32,
    /// Pending levels the watchdog armed last pass; still being here on the
    /// next pass means the completion heuristic lost them.
    watchdog: u32,
    sched: Scheduler,
    tuning: TuningParams,
}

impl VirtualPic {
    pub fn new() -> Self {
        Self::with_tuning(TuningParams::default())
    }

    pub fn with_tuning(tuning: TuningParams) -> Self {
        let mut pic = Self {
            chips: [ChipState::new(Chip::Master), ChipState::new(Chip::Slave)],
            slots: std::array::from_fn(|i| LevelSlot {
                handler: None,
                vector: levels::DEFAULT_VECTORS[i],
            }),
            irq2_vector: 0,
            irr: 0,
            isr: 0,
            slave_isr: 0,
            host_mask: u32::MAX,
            cli_mask: 0,
            smm_active: false,
            current: levels::NONE,
            stack: DispatchStack::default(),
            tracker: CompletionTracker::default(),
            pending: 0,
            watchdog: 0,
            sched: Scheduler::default(),
            tuning,
        };
        pic.reset();
        pic
    }

    /// Back to power-on state: registers, chip state machines, stacks,
    /// queues and the schedule table. Handlers are dropped too; the
    /// machine re-registers its built-in levels after a reboot.
    pub fn reset(&mut self) {
        self.chips = [ChipState::new(Chip::Master), ChipState::new(Chip::Slave)];
        for (i, slot) in self.slots.iter_mut().enumerate() {
            slot.handler = None;
            slot.vector = levels::DEFAULT_VECTORS[i];
        }
        self.irq2_vector = 0;
        self.irr = 0;
        self.isr = 0;
        self.slave_isr = 0;
        self.host_mask = u32::MAX;
        self.cli_mask = 0;
        self.smm_active = false;
        self.current = levels::NONE;
        self.stack.clear();
        self.tracker.clear();
        self.pending = 0;
        self.watchdog = 0;
        self.sched.reset();
    }

    // ---- registration and host-side masking ----------------------------

    /// Installs the handler and (for software levels) the guest vector for
    /// one level. Hardware-level vectors are owned by the guest's ICW2
    /// writes and the `vector` argument is ignored for them.
    ///
    /// Registering `None` is the documented way to disable a level: it is
    /// host-masked and can never be dispatched.
    pub fn register(
        &mut self,
        level: u8,
        handler: Option<LevelHandler>,
        vector: u8,
    ) -> Result<(), RegisterError> {
        if level >= levels::NONE {
            return Err(RegisterError::LevelOutOfRange(level));
        }
        let slot = &mut self.slots[usize::from(level)];
        if level >= levels::SOFT_BASE {
            slot.vector = vector;
        }
        match handler {
            Some(h) => slot.handler = Some(h),
            None => {
                slot.handler = None;
                self.mask(level);
            }
        }
        Ok(())
    }

    /// Sets the host-private mask bit for a level.
    pub fn mask(&mut self, level: u8) {
        if level < levels::NONE {
            self.host_mask |= 1 << level;
        }
    }

    /// Clears the host-private mask bit, making the level dispatchable.
    /// Ignored while the level has no handler.
    pub fn unmask(&mut self, level: u8) {
        if level < levels::NONE && self.slots[usize::from(level)].handler.is_some() {
            self.host_mask &= !(1 << level);
        }
    }

    /// Gates the hardware levels on the guest's interrupt flag. The NMI
    /// and the software levels are not the guest's to disable.
    pub fn set_guest_interrupts_enabled(&mut self, enabled: bool) {
        self.cli_mask = if enabled { 0 } else { HW_LEVELS };
    }

    fn effective_mask(&self) -> u32 {
        self.chips[0].imr | self.chips[1].imr | self.host_mask | self.cli_mask
    }

    // ---- requesting and arbitration ------------------------------------

    /// Triggers a level. Returns whether the request landed in the request
    /// register immediately; a level that is already requested or in
    /// service, or a controller nested past the overdrive threshold, parks
    /// the request in the pending queue instead, from which a completion
    /// or the watchdog will promote it. The queue holds one request per
    /// level: sources needing more must re-trigger from their handler.
    pub fn request(&mut self, level: u8) -> bool {
        if level >= levels::NONE || self.slots[usize::from(level)].handler.is_none() {
            return false;
        }
        let bit = 1u32 << level;
        if (self.irr | self.isr) & bit != 0 || self.tracker.depth() > self.tuning.overdrive_threshold
        {
            if self.pending & bit != 0 {
                log::debug!("request for level {level} lost: already queued");
            } else {
                log::debug!("request for level {level} queued");
            }
            self.pending |= bit;
            self.sched.note_request(level);
            false
        } else {
            log::trace!("level {level} requested");
            self.irr |= bit;
            self.sched.note_request(level);
            true
        }
    }

    /// Whether a level has been requested (immediately or queued) and is
    /// not masked. Device models use this to keep their guest-visible
    /// status registers from betraying an event whose interrupt has not
    /// been delivered yet.
    pub fn is_pending(&self, level: u8) -> bool {
        if level >= levels::NONE {
            return false;
        }
        (self.irr | self.pending) & !self.effective_mask() & (1 << level) != 0
    }

    /// Dispatches requested levels until nothing eligible remains.
    ///
    /// Each pass picks the numerically lowest requested level that is
    /// neither masked nor in service, and dispatches it if it is strictly
    /// higher priority than the preemption threshold captured at entry
    /// (the current level, widened by the special-mask span when the guest
    /// turned special mask mode on). A synchronous handler completes
    /// before the next pass; a handler that handed its level to guest
    /// execution ends the sweep, since nothing can progress until the
    /// guest runs.
    pub fn run_pending(&mut self) {
        if self.irr & !self.isr == 0 {
            return;
        }
        let resume = self.current;
        let threshold = u32::from(resume)
            + if self.smm_active {
                u32::from(self.tuning.special_mask_span)
            } else {
                0
            };
        loop {
            let ready = self.irr & !(self.isr | self.effective_mask());
            if ready == 0 {
                break;
            }
            let level = ready.trailing_zeros() as u8;
            if u32::from(level) >= threshold {
                break;
            }
            let bit = 1u32 << level;

            // Clear-then-verify: a sweep nested inside a handler may have
            // taken this request between our scan and the clear.
            let seen = self.irr;
            self.irr = seen & !bit;
            if seen & bit == 0 {
                continue;
            }

            self.isr |= bit;
            self.slave_isr = self.isr & SLAVE_LEVELS;
            self.current = level;

            let depth_before = self.tracker.depth();
            match self.slots[usize::from(level)].handler.clone() {
                Some(run) => run(self),
                None => log::warn!("level {level} dispatched with no handler installed"),
            }

            if self.tracker.began_since(depth_before, level) {
                // In service until the guest EOIs and the trap returns.
                return;
            }

            // Synchronous completion. The clear is a no-op guard when the
            // handler already retired the level through the EOI path.
            self.isr &= !bit;
            self.slave_isr &= !bit;
            self.current = resume;
        }
        self.current = resume;
    }

    /// Whether any request is latched; cheap gate for the machine loop.
    pub fn has_requests(&self) -> bool {
        self.irr != 0
    }

    // ---- completion tracking -------------------------------------------

    /// Starts a guest-visible dispatch of `level`, which must be the level
    /// currently being dispatched. Pushes the dispatch stack and returns
    /// the vector plus the trap marker for the execution engine; `None`
    /// when nesting capacity is exhausted, in which case the level is
    /// treated as unable to nest and completes synchronously.
    pub fn begin_dispatch(&mut self, level: u8) -> Option<GuestDispatch> {
        if level != self.current || level >= levels::NONE {
            log::warn!(
                "begin_dispatch({level}) outside its own dispatch (current level {})",
                self.current
            );
            return None;
        }
        if !self.stack.push(level) {
            return None;
        }
        let Some(marker) = self.tracker.begin(level) else {
            self.stack.pop();
            return None;
        };
        let vector = self.slots[usize::from(level)].vector;
        log::debug!(
            "level {level} entering guest (vector {vector:#04x}, nesting {})",
            self.tracker.depth()
        );
        Some(GuestDispatch {
            level,
            vector,
            marker,
        })
    }

    /// Completion notification from the guest-execution engine: guest
    /// control reached the trap location `marker` was issued for.
    ///
    /// Only the innermost outstanding marker is accepted; stale or
    /// mismatched markers are logged and change nothing. On a match the
    /// level is retired if the guest never EOI'd it (the NMI and software
    /// levels have no EOI to give), queued requests that are no longer in
    /// conflict are promoted into the request register with their watchdog
    /// bits cleared, and, unless still nested past the overdrive
    /// threshold, arbitration runs again before control goes back to the
    /// engine.
    pub fn on_trap_return(&mut self, marker: TrapMarker) {
        let Some(level) = self.tracker.complete(marker) else {
            log::warn!("ignoring stale trap marker for level {}", marker.level());
            return;
        };
        let bit = 1u32 << level;
        if self.isr & bit != 0 {
            self.isr &= !bit;
            self.slave_isr &= !bit;
            if self.stack.top() == Some(level) {
                self.stack.pop();
                self.current = self.stack.top().unwrap_or(levels::NONE);
            } else {
                log::warn!(
                    "trap return retired level {level} but dispatch stack top is {:?}",
                    self.stack.top()
                );
            }
        }

        let promoted = self.pending & !self.irr & !self.isr;
        if promoted != 0 {
            log::debug!("promoting queued levels {promoted:#010x}");
            self.irr |= promoted;
            self.pending &= !promoted;
            self.watchdog &= !promoted;
        }

        if self.tracker.depth() <= self.tuning.overdrive_threshold {
            self.run_pending();
        }
    }

    /// Current dispatch-nesting depth (guest dispatches in flight).
    pub fn nesting_depth(&self) -> u32 {
        self.tracker.depth()
    }

    // ---- scheduling ----------------------------------------------------

    /// Arranges for `level` to be requested again `interval` ticks after
    /// its previous trigger. Call from the level's own handler to get a
    /// drift-free period; see [`TICK_RATE`](crate::TICK_RATE) for the
    /// units.
    pub fn schedule(&mut self, level: u8, interval: Ticks) {
        self.sched.schedule(level, interval);
    }

    /// Host timer pass: folds `wall` into virtual time (correcting counter
    /// wraparound), fires the watchdog for requests whose completion was
    /// never observed, and requests every level whose trigger time has
    /// come.
    pub fn tick(&mut self, wall: Duration) {
        self.sched.advance(wall);

        // Watchdog: anything armed on the previous pass and still neither
        // requested nor in service was lost by the completion heuristic;
        // force it through now. Everything still queued arms the next pass.
        let lost = self.watchdog & !self.irr & !self.isr;
        if lost != 0 {
            log::warn!("watchdog re-delivering lost levels {lost:#010x}");
            self.irr |= lost;
            self.pending &= !lost;
        }
        self.watchdog = (self.watchdog & !lost) | self.pending;

        if self.tracker.depth() <= self.tuning.overdrive_threshold {
            self.activate();
        }
    }

    /// Requests every level whose scheduled trigger time has passed and
    /// was not already honored, then advances the "now" cursor to the
    /// earliest such trigger so later schedules are not spuriously fired.
    fn activate(&mut self) {
        let sys_time = self.sched.sys_time();
        let mut earliest = sys_time;
        let mut fired = 0u32;
        for level in 0..levels::COUNT as u8 {
            let (next, last) = self.sched.entry(level);
            if next == NEVER || next >= sys_time || next == last {
                continue;
            }
            if next < earliest || earliest == NEVER {
                earliest = next;
            }
            self.request(level);
            fired += 1;
        }
        if fired != 0 {
            log::trace!("activated {fired} scheduled levels");
        }
        self.sched.set_cursor(earliest);
    }

    /// Next scheduled trigger time for a level, if any.
    pub fn next_trigger(&self, level: u8) -> Option<Ticks> {
        self.sched.next_trigger(level)
    }

    // ---- guest port protocol -------------------------------------------

    /// Guest write to one of the four controller ports.
    pub fn port_write(&mut self, port: u16, value: u8) {
        match port {
            MASTER_CMD => self.chip_write(Chip::Master, 0, value),
            MASTER_DATA => self.chip_write(Chip::Master, 1, value),
            SLAVE_CMD => self.chip_write(Chip::Slave, 0, value),
            SLAVE_DATA => self.chip_write(Chip::Slave, 1, value),
            _ => log::trace!("write to unmapped controller port {port:#06x}"),
        }
    }

    /// Guest read from one of the four controller ports.
    pub fn port_read(&self, port: u16) -> u8 {
        match port {
            MASTER_CMD => self.chip_read(Chip::Master, 0),
            MASTER_DATA => self.chip_read(Chip::Master, 1),
            SLAVE_CMD => self.chip_read(Chip::Slave, 0),
            SLAVE_DATA => self.chip_read(Chip::Slave, 1),
            _ => 0xFF,
        }
    }

    /// Guest write addressed by chip and port offset (0 = command,
    /// 1 = data).
    pub fn chip_write(&mut self, chip: Chip, offset: u8, value: u8) {
        if offset == 0 {
            self.command_write(chip, value);
        } else {
            self.data_write(chip, value);
        }
    }

    /// Guest read addressed by chip and port offset.
    pub fn chip_read(&self, chip: Chip, offset: u8) -> u8 {
        let state = &self.chips[chip as usize];
        if offset != 0 {
            chip::levels_to_guest(chip, state.imr)
        } else if state.read_isr {
            chip::levels_to_guest(chip, self.isr)
        } else {
            chip::levels_to_guest(chip, self.irr)
        }
    }

    fn command_write(&mut self, chip: Chip, value: u8) {
        let bits = CommandBits::from_bits_truncate(value);
        if bits.contains(CommandBits::ICW1) {
            self.chips[chip as usize].begin_init(value);
        } else if bits.contains(CommandBits::OCW3) {
            if bits.contains(CommandBits::OCW3_READ_SELECT) {
                self.chips[chip as usize].read_isr = bits.contains(CommandBits::OCW3_READ_ISR);
            }
            if bits.contains(CommandBits::OCW3_SMM_SELECT) {
                self.smm_active = bits.contains(CommandBits::OCW3_SMM_ON);
                log::debug!(
                    "special mask mode {}",
                    if self.smm_active { "on" } else { "off" }
                );
            }
        } else if value & EOI_CLASS_MASK == EOI_PATTERN {
            self.end_of_interrupt();
        }
        // Anything else is accepted and ignored; the state machine stays
        // deterministic for malformed sequences.
    }

    fn data_write(&mut self, chip: Chip, value: u8) {
        if self.chips[chip as usize].expecting_icw() {
            if self.chips[chip as usize].consume_icw_byte() {
                self.set_vector_base(chip, value);
            }
        } else {
            self.chips[chip as usize].imr = chip::guest_to_levels(chip, value);
        }
    }

    /// End-of-interrupt. The dispatch stack is authoritative for which
    /// level is being retired; the guest's claim (the cached current
    /// level) is only checked against it for diagnostics. Slave levels
    /// carry a bit in both in-service registers and need two EOIs, to
    /// either command port, before the level is retired.
    fn end_of_interrupt(&mut self) {
        let level = match self.stack.top() {
            Some(top) => {
                if top != self.current {
                    log::warn!(
                        "EOI: current level {} disagrees with dispatch stack top {top}",
                        self.current
                    );
                }
                top
            }
            None => {
                log::warn!("EOI with no dispatch in flight (current level {})", self.current);
                self.current
            }
        };
        if level >= levels::NONE {
            return;
        }
        let bit = 1u32 << level;
        if self.slave_isr & bit != 0 {
            self.slave_isr &= !bit;
            log::debug!("EOI absorbed by slave in-service bit for level {level}");
        } else {
            self.isr &= !bit;
            self.stack.pop();
            self.current = self.stack.top().unwrap_or(levels::NONE);
            log::debug!("EOI retired level {level}, current level now {}", self.current);
        }
    }

    fn set_vector_base(&mut self, chip: Chip, value: u8) {
        let base = value & 0xF8;
        match chip {
            Chip::Master => {
                self.slots[usize::from(levels::IRQ0)].vector = base;
                self.slots[usize::from(levels::IRQ1)].vector = base + 1;
                self.irq2_vector = base + 2;
                for (i, level) in (levels::IRQ3..=levels::IRQ7).enumerate() {
                    self.slots[usize::from(level)].vector = base + 3 + i as u8;
                }
            }
            Chip::Slave => {
                for (i, level) in (levels::IRQ8..=levels::IRQ15).enumerate() {
                    self.slots[usize::from(level)].vector = base + i as u8;
                }
            }
        }
        log::debug!("{chip:?} vector base set to {base:#04x}");
    }

    // ---- introspection -------------------------------------------------

    /// Level currently being dispatched, [`levels::NONE`] when idle.
    pub fn current_level(&self) -> u8 {
        self.current
    }

    /// Request register, in internal level numbering.
    pub fn requested(&self) -> u32 {
        self.irr
    }

    /// In-service register, in internal level numbering.
    pub fn in_service(&self) -> u32 {
        self.isr
    }

    /// Guest vector a level would be delivered on.
    pub fn vector(&self, level: u8) -> Option<u8> {
        if level < levels::NONE {
            Some(self.slots[usize::from(level)].vector)
        } else {
            None
        }
    }

    /// Vector recorded for the cascade slot by the last chip-0 ICW2.
    pub fn irq2_vector(&self) -> u8 {
        self.irq2_vector
    }
}

impl Default for VirtualPic {
    fn default() -> Self {
        Self::new()
    }
}
