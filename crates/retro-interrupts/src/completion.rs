//! Completion detection for dispatches that run inside the guest.
//!
//! A level that must execute guest code cannot finish synchronously: the
//! controller hands the guest-execution engine a [`TrapMarker`] along with
//! the vector, and the engine reports the marker back once guest control
//! reaches the reserved trap location its return path was rewritten to.
//! The marker is deliberately opaque (the engine only preserves and
//! returns it), so this crate does not care how the engine represents
//! return addresses.
//!
//! Detection is heuristic by nature: a guest that never performs the
//! expected return sequence leaves its marker outstanding forever. The
//! scheduler's watchdog pass covers redelivery in that case; the marker
//! list itself is bounded and simply stops accepting new dispatches at the
//! same depth the dispatch stack does.

const MAX_OUTSTANDING: usize = 32;

/// Opaque token identifying one guest-visible dispatch.
///
/// Obtained from `VirtualPic::begin_dispatch` and surrendered to
/// `VirtualPic::on_trap_return`. The sequence number makes stale tokens
/// from earlier dispatches of the same level detectable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrapMarker {
    level: u8,
    seq: u32,
}

impl TrapMarker {
    /// The level this marker was issued for.
    pub fn level(&self) -> u8 {
        self.level
    }
}

/// Outstanding-dispatch bookkeeping: the LIFO list of unreturned markers
/// doubles as the dispatch-nesting counter.
#[derive(Debug, Default)]
pub(crate) struct CompletionTracker {
    outstanding: Vec<TrapMarker>,
    next_seq: u32,
}

impl CompletionTracker {
    /// Issues a marker for a new guest dispatch of `level`, or refuses when
    /// nesting is already at capacity.
    pub fn begin(&mut self, level: u8) -> Option<TrapMarker> {
        if self.outstanding.len() >= MAX_OUTSTANDING {
            log::warn!("completion tracker full, refusing guest dispatch of level {level}");
            return None;
        }
        let marker = TrapMarker {
            level,
            seq: self.next_seq,
        };
        self.next_seq = self.next_seq.wrapping_add(1);
        self.outstanding.push(marker);
        Some(marker)
    }

    /// Retires the innermost outstanding dispatch if `marker` matches it.
    ///
    /// Guest returns unwind innermost-first, so only the top of the list is
    /// ever accepted; anything else is a stale or forged token and leaves
    /// all state untouched.
    pub fn complete(&mut self, marker: TrapMarker) -> Option<u8> {
        if self.outstanding.last() == Some(&marker) {
            self.outstanding.pop();
            Some(marker.level)
        } else {
            None
        }
    }

    /// Current dispatch-nesting depth.
    pub fn depth(&self) -> u32 {
        self.outstanding.len() as u32
    }

    /// Whether any marker at position `from` or deeper was issued for
    /// `level`. Used to tell "this handler handed its level to the guest"
    /// apart from markers that were already outstanding beforehand.
    pub fn began_since(&self, from: u32, level: u8) -> bool {
        self.outstanding
            .iter()
            .skip(from as usize)
            .any(|m| m.level == level)
    }

    pub fn clear(&mut self) {
        self.outstanding.clear();
    }
}
