//! Virtual-time trigger table for periodic and deferred interrupt sources.
//!
//! Time is counted in PIT-rate ticks (1,193,047/s), derived from host wall
//! time once per timer interrupt. Because the conversion folds the seconds
//! through a 900 s modulus, the counter wraps every fifteen minutes; the
//! wrap is detected when a fresh conversion comes out below the previous
//! one and is corrected by rebasing every live table entry in one pass.
//!
//! Each level has a `next` trigger time and a `last` honored time. Keeping
//! `next` relative to the level's own previous trigger, never to the wall
//! clock at call time, is what makes periodic sources drift-free no matter
//! how much jitter host timer delivery has. Entry 32 is the "now" cursor
//! the whole table is anchored to.

use std::time::Duration;

/// Virtual time in PIT-rate ticks.
pub type Ticks = i64;

/// Tick rate per second, matching the PIT counters so timer emulation can
/// pass intervals straight through.
pub const TICK_RATE: Ticks = 1_193_047;

/// Upper bound (exclusive) for a schedule interval: about fifteen minutes.
pub const MAX_INTERVAL: Ticks = 0x3FFF_FFFF;

/// "Not scheduled" sentinel.
pub(crate) const NEVER: Ticks = Ticks::MIN;

const WRAP_SECS: u64 = 900;
const WRAP_TICKS: Ticks = WRAP_SECS as Ticks * TICK_RATE;

/// Index of the "now" cursor pseudo-entry.
const CURSOR: usize = 32;

#[derive(Debug)]
pub(crate) struct Scheduler {
    /// Trigger time each entry last had honored.
    last: [Ticks; 33],
    /// Next trigger time per entry; `[CURSOR]` is the "now" cursor.
    next: [Ticks; 33],
    /// Tick value of the most recent wall-clock conversion.
    sys_time: Ticks,
    /// Cursor snapshot the wrap correction partitions entries against.
    cursor_time: Ticks,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self {
            last: [NEVER; 33],
            next: [NEVER; 33],
            sys_time: NEVER,
            cursor_time: 0,
        }
    }
}

impl Scheduler {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Folds a wall-clock reading into the tick counter, applying the
    /// one-time wraparound correction when the counter restarted.
    pub fn advance(&mut self, wall: Duration) {
        let micros = Ticks::from(wall.subsec_micros());
        let ticks = (wall.as_secs() % WRAP_SECS) as Ticks * TICK_RATE
            + micros * 1193 / 1000
            + micros / 21_277;
        if ticks < self.sys_time {
            self.rebase();
        }
        self.sys_time = ticks;
        self.cursor_time = self.next[CURSOR];
    }

    /// Rebase after a counter wrap: entries at or past the cursor move back
    /// by one wrap period so their relative order survives; entries the
    /// cursor already passed can never fire again and are expired.
    fn rebase(&mut self) {
        log::debug!("tick counter wrapped, rebasing schedule table");
        for i in 0..self.next.len() {
            if self.next[i] >= self.cursor_time {
                if self.next[i] != NEVER {
                    self.next[i] -= WRAP_TICKS;
                }
                if self.last[i] != NEVER {
                    self.last[i] -= WRAP_TICKS;
                }
            } else {
                self.next[i] = NEVER;
                self.last[i] = NEVER;
            }
        }
    }

    /// Arranges for `level` to trigger `interval` ticks after its previous
    /// trigger time, or after the "now" cursor if it was never scheduled.
    /// Out-of-range intervals are ignored.
    pub fn schedule(&mut self, level: u8, interval: Ticks) {
        if usize::from(level) >= CURSOR {
            return;
        }
        if interval <= 0 || interval >= MAX_INTERVAL {
            log::trace!("ignoring schedule of level {level} with interval {interval}");
            return;
        }
        let i = usize::from(level);
        self.next[i] = if self.last[i] == NEVER {
            self.next[CURSOR] + interval
        } else {
            self.next[i] + interval
        };
        log::trace!("level {level} scheduled for tick {}", self.next[i]);
    }

    /// Bookkeeping run for every accepted or queued request: a level whose
    /// trigger time was already honored gets re-anchored to the cursor so a
    /// later `schedule` call measures from the present rather than from a
    /// stale trigger.
    pub fn note_request(&mut self, level: u8) {
        let i = usize::from(level);
        if i >= CURSOR {
            return;
        }
        if self.next[i] == self.last[i] {
            self.next[i] = self.next[CURSOR];
        }
        self.last[i] = self.next[i];
    }

    /// `(next, last)` trigger times for one level.
    pub fn entry(&self, level: u8) -> (Ticks, Ticks) {
        let i = usize::from(level);
        (self.next[i], self.last[i])
    }

    pub fn sys_time(&self) -> Ticks {
        self.sys_time
    }

    /// Advances the cursor to the earliest still-live trigger time found by
    /// the activation scan.
    pub fn set_cursor(&mut self, earliest: Ticks) {
        self.next[CURSOR] = earliest;
        self.cursor_time = earliest;
    }

    pub fn next_trigger(&self, level: u8) -> Option<Ticks> {
        let i = usize::from(level);
        if i >= CURSOR || self.next[i] == NEVER {
            None
        } else {
            Some(self.next[i])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn advanced(secs: u64, micros: u32) -> Scheduler {
        let mut sched = Scheduler::default();
        sched.advance(Duration::new(secs, micros * 1000));
        sched
    }

    #[test]
    fn conversion_matches_pit_rate() {
        let sched = advanced(2, 0);
        assert_eq!(sched.sys_time(), 2 * TICK_RATE);

        // One full second of microseconds lands within a few ticks of the
        // rate (the split integer conversion floors twice).
        let sched = advanced(0, 999_999);
        assert!((sched.sys_time() - TICK_RATE).abs() <= 4);
    }

    #[test]
    fn first_advance_never_looks_like_a_wrap() {
        let mut sched = Scheduler::default();
        sched.advance(Duration::from_secs(1));
        assert_eq!(sched.sys_time(), TICK_RATE);
        assert_eq!(sched.entry(0), (NEVER, NEVER));
    }

    #[test]
    fn schedule_anchors_to_cursor_then_to_own_trigger() {
        let mut sched = advanced(10, 0);
        sched.set_cursor(10 * TICK_RATE);

        sched.schedule(1, 1000);
        assert_eq!(sched.next_trigger(1), Some(10 * TICK_RATE + 1000));

        // Once honored, the next period measures from the trigger itself.
        sched.note_request(1);
        sched.schedule(1, 1000);
        assert_eq!(sched.next_trigger(1), Some(10 * TICK_RATE + 2000));
    }

    #[test]
    fn out_of_range_intervals_are_ignored() {
        let mut sched = advanced(10, 0);
        sched.set_cursor(10 * TICK_RATE);

        sched.schedule(1, 0);
        sched.schedule(1, -5);
        sched.schedule(1, MAX_INTERVAL);
        assert_eq!(sched.next_trigger(1), None);
    }

    #[test]
    fn wrap_rebases_live_entries_and_expires_stale_ones() {
        let mut sched = advanced(899, 0);
        let now = 899 * TICK_RATE;
        sched.set_cursor(now);

        sched.schedule(1, 2000);
        sched.schedule(2, 2010);
        // A trigger the cursor already passed.
        sched.next[3] = now - 50;
        sched.last[3] = now - 50;

        // 901 s folds to 1 s worth of ticks: below the previous reading.
        sched.advance(Duration::from_secs(901));
        assert_eq!(sched.sys_time(), TICK_RATE);

        let a = sched.next_trigger(1).unwrap();
        let b = sched.next_trigger(2).unwrap();
        assert_eq!(b - a, 10);
        assert_eq!(a, now + 2000 - 900 * TICK_RATE);
        assert_eq!(sched.next_trigger(3), None);
    }
}
