use std::time::Instant;

use parking_lot::{Condvar, Mutex};

/// Reusable countdown barrier that releases every party at the same instant.
///
/// The coordinator owns one instance for the whole run and resets it to the number of live
/// parties before every iteration. Unlike `std::sync::Barrier`, waiting is bounded by a deadline
/// and a party that gives up breaks the barrier for everyone, so a single hung thread cannot
/// leave the others blocked forever.
#[derive(Debug)]
pub(crate) struct LockstepBarrier {
    state: Mutex<BarrierState>,
    changed: Condvar,
}

#[derive(Debug)]
struct BarrierState {
    arrived: Vec<bool>,
    arrived_count: usize,
    generation: u64,
    released_at: Option<Instant>,
    broken: bool,
}

/// A barrier wait that did not end in a release.
#[derive(Debug, Eq, PartialEq)]
pub(crate) struct BarrierBroken {
    /// Parties that had not arrived when the barrier broke.
    pub(crate) missing: Vec<usize>,
}

impl LockstepBarrier {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(BarrierState {
                arrived: Vec::new(),
                arrived_count: 0,
                generation: 0,
                released_at: None,
                broken: false,
            }),
            changed: Condvar::new(),
        }
    }

    /// Prepares the barrier for the next iteration with `parties` participants.
    ///
    /// Must not be called while any party is waiting.
    pub(crate) fn reset(&self, parties: usize) {
        let mut state = self.state.lock();

        state.arrived.clear();
        state.arrived.resize(parties, false);
        state.arrived_count = 0;
        state.released_at = None;
        state.broken = false;
    }

    /// Blocks until every party has arrived and returns the shared release instant.
    ///
    /// If `deadline` passes first, the barrier breaks and every waiting party (this one
    /// included) gets the list of parties that never arrived.
    pub(crate) fn wait(&self, party: usize, deadline: Instant) -> Result<Instant, BarrierBroken> {
        let mut state = self.state.lock();

        if state.broken {
            return Err(state.broken_result());
        }

        let slot = state
            .arrived
            .get_mut(party)
            .expect("party index must be within the size the barrier was reset to");
        assert!(!*slot, "party {party} arrived at the barrier twice");
        *slot = true;

        state.arrived_count = state
            .arrived_count
            .checked_add(1)
            .expect("cannot have more arrivals than parties");

        let generation = state.generation;

        if state.arrived_count == state.arrived.len() {
            let now = Instant::now();
            state.released_at = Some(now);
            state.generation = generation.wrapping_add(1);
            self.changed.notify_all();
            return Ok(now);
        }

        loop {
            if state.generation != generation {
                return Ok(state
                    .released_at
                    .expect("release instant is set whenever the generation advances"));
            }

            if state.broken {
                return Err(state.broken_result());
            }

            if self.changed.wait_until(&mut state, deadline).timed_out() {
                if state.generation != generation {
                    continue;
                }

                state.broken = true;
                self.changed.notify_all();
                return Err(state.broken_result());
            }
        }
    }

    /// Breaks the barrier, releasing every waiting party with an error.
    pub(crate) fn break_now(&self) {
        let mut state = self.state.lock();

        if state.released_at.is_none() {
            state.broken = true;
            self.changed.notify_all();
        }
    }
}

impl BarrierState {
    fn broken_result(&self) -> BarrierBroken {
        BarrierBroken {
            missing: self
                .arrived
                .iter()
                .enumerate()
                .filter(|(_, arrived)| !**arrived)
                .map(|(party, _)| party)
                .collect(),
        }
    }
}
