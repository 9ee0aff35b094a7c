//! The concurrency monitor: conflict-group admission, per-plane exclusion,
//! fair wake-up, and cancellation. A single `Mutex<State>` plus one
//! `Condvar` model what would otherwise be several cooperating locks and
//! counting semaphores, since a held `MutexGuard` cannot be handed from one
//! thread to another.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use log::{debug, trace, warn};

/// How often a blocked waiter re-checks its cancellation token. Cancellation
/// in this system is cooperative (there is no OS-level interrupt), so a
/// waiter parked on a condvar polls at this granularity; it is intentionally
/// short enough that cancellation latency is never user-visible relative to
/// scheduling jitter.
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(2);

/// The four conflict groups: 0..=2 are the rotation directions, 3 is
/// snapshot.
pub(crate) const GROUP_COUNT: usize = 4;
pub(crate) const SNAPSHOT_GROUP: usize = 3;

/// A cooperative cancellation flag a caller can share between the thread
/// driving a `Cube` call and whatever other thread decides to cancel it.
///
/// Cloning shares the same underlying flag; [`CancelToken::cancel`] from any
/// clone is observed by every blocked waiter holding another clone.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        CancelToken(Arc::new(AtomicBool::new(false)))
    }

    /// Requests cancellation. Idempotent.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Raised when a blocked request observes its [`CancelToken`] set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Cancelled;

struct State {
    /// Requests currently past admission and not yet exited.
    working: usize,
    /// The group currently occupying the cube, meaningful whenever
    /// `working > 0` or a wake pulse is in flight.
    active_group: Option<usize>,
    /// The group index favored on the next wake-up opportunity.
    next_priority: usize,
    /// Requests blocked at each group's wait point.
    waiting: [usize; GROUP_COUNT],
    /// Already-woken requests of `active_group` that have not yet resumed
    /// past their wait point.
    pending: usize,
    /// Outstanding wake permits per group, i.e. `group_wait[g]`'s count.
    group_ready: [usize; GROUP_COUNT],
    /// Whether the admission gate (`big-mutex`) is currently held, either by
    /// a request mid-admission-decision, by an exiting request, or by an
    /// in-flight wake cohort (the admission-gate inheritance span).
    gate_held: bool,
    /// FIFO ticket counters for admission-gate acquisition.
    next_ticket: u64,
    serving_ticket: u64,
    /// `plane_locked[p]` tracks `plane_wait[p]`'s single permit.
    plane_locked: Vec<bool>,
}

impl State {
    fn new(plane_count: usize) -> Self {
        State {
            working: 0,
            active_group: None,
            next_priority: 0,
            waiting: [0; GROUP_COUNT],
            pending: 0,
            group_ready: [0; GROUP_COUNT],
            gate_held: false,
            next_ticket: 0,
            serving_ticket: 0,
            plane_locked: vec![false; plane_count],
        }
    }

    fn no_waiters(&self) -> bool {
        self.waiting.iter().all(|&w| w == 0)
    }
}

/// The admission controller. One instance per cube; shared between every
/// thread calling `rotate`/`snapshot` through the facade.
pub(crate) struct Controller {
    state: Mutex<State>,
    cv: Condvar,
}

impl Controller {
    pub(crate) fn new(plane_count: usize) -> Self {
        Controller {
            state: Mutex::new(State::new(plane_count)),
            cv: Condvar::new(),
        }
    }

    /// Entry protocol for group `g`. Blocks until admitted;
    /// returns `Cancelled` if `cancel` is observed set while parked on
    /// `group-wait[g]`.
    pub(crate) fn enter(&self, g: usize, cancel: &CancelToken) -> Result<(), Cancelled> {
        let mut st = self.state.lock().unwrap();

        // Acquire the FIFO admission gate. Uninterruptible: cancellation is
        // not observed here, only deferred to the real wait points below.
        let ticket = st.next_ticket;
        st.next_ticket += 1;
        st = self
            .cv
            .wait_while(st, |s| s.serving_ticket != ticket || s.gate_held)
            .unwrap();
        st.gate_held = true;

        if st.no_waiters() && (st.working == 0 || st.active_group == Some(g)) {
            st.working += 1;
            st.active_group = Some(g);
            trace!("group {g} admitted immediately, working={}", st.working);
            st.gate_held = false;
            st.serving_ticket += 1;
            self.cv.notify_all();
            return Ok(());
        }

        st.waiting[g] += 1;
        trace!("group {g} blocked, waiting={:?}", st.waiting);
        st.gate_held = false;
        st.serving_ticket += 1;
        self.cv.notify_all();

        loop {
            if cancel.is_cancelled() {
                return self.cancel_while_waiting(st, g);
            }
            if st.group_ready[g] > 0 {
                st.group_ready[g] -= 1;
                break;
            }
            let (guard, _) = self.cv.wait_timeout(st, CANCEL_POLL_INTERVAL).unwrap();
            st = guard;
        }

        st.waiting[g] -= 1;
        st.pending -= 1;
        st.working += 1;
        trace!(
            "group {g} resumed, working={} pending={}",
            st.working, st.pending
        );
        if st.pending == 0 {
            st.gate_held = false;
        }
        self.cv.notify_all();
        Ok(())
    }

    /// Cancellation observed while blocked on `group-wait[g]`. `st` is
    /// the locked state guard; consumes it.
    fn cancel_while_waiting(
        &self,
        mut st: std::sync::MutexGuard<'_, State>,
        g: usize,
    ) -> Result<(), Cancelled> {
        warn!("group {g} cancellation observed while waiting on group-wait");
        st.waiting[g] -= 1;
        if st.pending > 0 && st.active_group == Some(g) {
            // A permit was already raised for this requester as part of an
            // in-flight cohort; drain it without blocking so it is not
            // leaked, then retire our share of the wake pulse.
            if st.group_ready[g] > 0 {
                st.group_ready[g] -= 1;
            }
            st.pending -= 1;
            if st.pending == 0 {
                // Last member of the cohort (successful or cancelled) must
                // resolve the inherited admission gate.
                if st.working > 0 {
                    st.gate_held = false;
                } else if !Self::try_wake_next_locked(&mut st) {
                    st.gate_held = false;
                }
            }
        }
        self.cv.notify_all();
        Err(Cancelled)
    }

    /// Exit protocol for group `g`.
    pub(crate) fn exit(&self, g: usize) {
        let mut st = self.state.lock().unwrap();
        st = self.cv.wait_while(st, |s| s.gate_held).unwrap();
        st.gate_held = true;

        st.working -= 1;
        let woke = Self::try_wake_next_locked(&mut st);
        if st.working > 0 || !woke {
            st.gate_held = false;
        }
        trace!("group {g} exited, working={} woke={woke}", st.working);
        self.cv.notify_all();
    }

    /// Scans `waiting` clockwise from `next_priority`, releasing the first
    /// non-empty group's entire cohort at once.
    fn try_wake_next_locked(st: &mut State) -> bool {
        for offset in 0..GROUP_COUNT {
            let candidate = (st.next_priority + offset) % GROUP_COUNT;
            if st.waiting[candidate] > 0 {
                st.active_group = Some(candidate);
                st.pending = st.waiting[candidate];
                st.group_ready[candidate] += st.pending;
                st.next_priority = (candidate + 1) % GROUP_COUNT;
                debug!(
                    "woke cohort: group={candidate} cohort_size={} next_priority={}",
                    st.pending, st.next_priority
                );
                return true;
            }
        }
        false
    }

    /// Acquires `plane-wait[p]` after rotation admission.
    pub(crate) fn acquire_plane(&self, p: usize, cancel: &CancelToken) -> Result<(), Cancelled> {
        let mut st = self.state.lock().unwrap();
        loop {
            if !st.plane_locked[p] {
                st.plane_locked[p] = true;
                return Ok(());
            }
            if cancel.is_cancelled() {
                warn!("plane {p} cancellation observed while waiting on plane-wait");
                return Err(Cancelled);
            }
            let (guard, _) = self.cv.wait_timeout(st, CANCEL_POLL_INTERVAL).unwrap();
            st = guard;
        }
    }

    /// Releases `plane-wait[p]`, always called before the shared exit block
    /// for a rotation.
    pub(crate) fn release_plane(&self, p: usize) {
        let mut st = self.state.lock().unwrap();
        st.plane_locked[p] = false;
        self.cv.notify_all();
    }
}
