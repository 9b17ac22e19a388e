//! Cross-process handshake: counting semaphores and the sync counter block
//!
//! Each direction is a capacity-one channel built from two counting
//! semaphores. `empty` starts at 1 and grants write permission, `full` starts
//! at 0 and grants read permission:
//!
//! ```text
//! sender:   send_begin (empty -1) .. write slot .. send_end (full +1)
//! receiver: recv_begin (full -1)  .. read slot  .. recv_end (empty +1)
//! ```
//!
//! The semaphores live in shared memory, so waiting is a spin/yield/sleep
//! backoff on an atomic word rather than a kernel object.

use crate::error::{LockstepError, Result};
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// One of the two independent message directions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Observations flowing from the simulation to the agent
    SimToAgent,
    /// Actions flowing from the agent back to the simulation
    AgentToSim,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::SimToAgent => f.write_str("sim-to-agent"),
            Direction::AgentToSim => f.write_str("agent-to-sim"),
        }
    }
}

/// Escalating wait: busy spin, then yield, then short sleeps
pub(crate) struct Backoff {
    step: u32,
}

impl Backoff {
    const SPIN_LIMIT: u32 = 6;
    const YIELD_LIMIT: u32 = 10;
    const SLEEP: Duration = Duration::from_micros(50);

    pub(crate) fn new() -> Self {
        Self { step: 0 }
    }

    #[inline]
    pub(crate) fn snooze(&mut self) {
        if self.step <= Self::SPIN_LIMIT {
            for _ in 0..(1u32 << self.step) {
                core::hint::spin_loop();
            }
        } else if self.step <= Self::YIELD_LIMIT {
            std::thread::yield_now();
        } else {
            std::thread::sleep(Self::SLEEP);
        }
        if self.step <= Self::YIELD_LIMIT {
            self.step += 1;
        }
    }
}

/// Counting semaphore stored in shared memory
#[repr(transparent)]
pub struct Semaphore(AtomicU32);

impl Semaphore {
    pub const fn new(count: u32) -> Self {
        Self(AtomicU32::new(count))
    }

    /// Decrement if positive, without waiting
    #[inline]
    pub fn try_wait(&self) -> bool {
        let mut current = self.0.load(Ordering::Relaxed);
        while current > 0 {
            match self.0.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
        false
    }

    /// Wait until the count is positive, then decrement it
    ///
    /// Returns `false` if `deadline` passed first.
    pub fn wait(&self, deadline: Option<Instant>) -> bool {
        let mut backoff = Backoff::new();
        loop {
            if self.try_wait() {
                return true;
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return false;
                }
            }
            backoff.snooze();
        }
    }

    #[inline]
    pub fn post(&self) {
        self.0.fetch_add(1, Ordering::Release);
    }

    #[inline]
    pub fn value(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }
}

/// Semaphore pair and message counters for one direction
///
/// The writer alone advances `begun` and `sent`, the reader alone advances
/// `received` and `consumed`, so an end without its begin is caught at the
/// call site instead of corrupting the semaphores.
#[repr(C)]
pub struct DirectionCounters {
    empty: Semaphore,
    full: Semaphore,
    /// Write permissions taken
    begun: AtomicU64,
    /// Messages published
    sent: AtomicU64,
    /// Read permissions taken
    received: AtomicU64,
    /// Messages released back to the writer
    consumed: AtomicU64,
}

impl DirectionCounters {
    const fn new() -> Self {
        Self {
            empty: Semaphore::new(1),
            full: Semaphore::new(0),
            begun: AtomicU64::new(0),
            sent: AtomicU64::new(0),
            received: AtomicU64::new(0),
            consumed: AtomicU64::new(0),
        }
    }

    #[inline]
    pub(crate) fn sent(&self) -> &AtomicU64 {
        &self.sent
    }

    #[inline]
    pub(crate) fn consumed(&self) -> &AtomicU64 {
        &self.consumed
    }
}

/// Synchronization block shared by both endpoints
#[repr(C)]
pub struct SyncCounters {
    sim_to_agent: DirectionCounters,
    agent_to_sim: DirectionCounters,
    finished: AtomicU32,
    _pad: u32,
}

fn deadline_after(timeout: Option<Duration>) -> Option<Instant> {
    timeout.and_then(|t| Instant::now().checked_add(t))
}

impl SyncCounters {
    /// Initialize a counter block in place: both slots empty, not finished
    ///
    /// # Safety
    /// The pointer must be valid, aligned, and not yet visible to a peer
    pub(crate) unsafe fn init(ptr: *mut Self) {
        ptr.write(Self {
            sim_to_agent: DirectionCounters::new(),
            agent_to_sim: DirectionCounters::new(),
            finished: AtomicU32::new(0),
            _pad: 0,
        });
    }

    #[inline]
    pub(crate) fn direction(&self, direction: Direction) -> &DirectionCounters {
        match direction {
            Direction::SimToAgent => &self.sim_to_agent,
            Direction::AgentToSim => &self.agent_to_sim,
        }
    }

    /// Block until the slot is writable, then take write permission
    pub fn send_begin(&self, direction: Direction, timeout: Option<Duration>) -> Result<()> {
        let counters = self.direction(direction);
        if counters.empty.wait(deadline_after(timeout)) {
            counters.begun.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(%direction, "send_begin");
            Ok(())
        } else {
            tracing::warn!(%direction, ?timeout, "peer did not free the slot in time");
            Err(LockstepError::Timeout { direction, op: "send" })
        }
    }

    /// Take write permission if the slot is writable right now
    pub fn try_send_begin(&self, direction: Direction) -> bool {
        let counters = self.direction(direction);
        let taken = counters.empty.try_wait();
        if taken {
            counters.begun.fetch_add(1, Ordering::Relaxed);
        }
        taken
    }

    /// Publish the slot to the peer
    ///
    /// Fails with `UnpairedBracket`, touching nothing, when no write
    /// permission is held.
    pub fn send_end(&self, direction: Direction) -> Result<()> {
        let counters = self.direction(direction);
        if counters.sent.load(Ordering::Relaxed) >= counters.begun.load(Ordering::Relaxed) {
            tracing::warn!(%direction, "send_end without send_begin");
            return Err(LockstepError::UnpairedBracket { direction, op: "send_end" });
        }
        self.publish(direction);
        Ok(())
    }

    /// Stamp and publish; the caller holds write permission
    pub(crate) fn publish(&self, direction: Direction) {
        let counters = self.direction(direction);
        counters.sent.fetch_add(1, Ordering::Release);
        counters.full.post();
        tracing::trace!(%direction, "send_end");
    }

    /// Give write permission back without publishing anything
    pub(crate) fn cancel_send(&self, direction: Direction) {
        let counters = self.direction(direction);
        counters.begun.fetch_sub(1, Ordering::Relaxed);
        counters.empty.post();
        tracing::trace!(%direction, "send cancelled");
    }

    /// Block until a message is pending, then take read permission
    pub fn recv_begin(&self, direction: Direction, timeout: Option<Duration>) -> Result<()> {
        let counters = self.direction(direction);
        if counters.full.wait(deadline_after(timeout)) {
            counters.received.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(%direction, "recv_begin");
            Ok(())
        } else {
            tracing::warn!(%direction, ?timeout, "no message from peer in time");
            Err(LockstepError::Timeout { direction, op: "receive" })
        }
    }

    /// Take read permission if a message is pending right now
    pub fn try_recv_begin(&self, direction: Direction) -> bool {
        let counters = self.direction(direction);
        let taken = counters.full.try_wait();
        if taken {
            counters.received.fetch_add(1, Ordering::Relaxed);
        }
        taken
    }

    /// Return the slot to the writer
    ///
    /// Fails with `UnpairedBracket`, touching nothing, when no read
    /// permission is held.
    pub fn recv_end(&self, direction: Direction) -> Result<()> {
        let counters = self.direction(direction);
        if counters.consumed.load(Ordering::Relaxed) >= counters.received.load(Ordering::Relaxed) {
            tracing::warn!(%direction, "recv_end without recv_begin");
            return Err(LockstepError::UnpairedBracket { direction, op: "recv_end" });
        }
        self.release(direction);
        Ok(())
    }

    /// Mark consumed and free the slot; the caller holds read permission
    pub(crate) fn release(&self, direction: Direction) {
        let counters = self.direction(direction);
        counters.consumed.fetch_add(1, Ordering::Release);
        counters.empty.post();
        tracing::trace!(%direction, "recv_end");
    }

    /// Realign the reader's counters with the writer's and free the slot
    ///
    /// For a held read permission whose message number is not the expected
    /// one; the slot goes back to the writer.
    pub(crate) fn resync(&self, direction: Direction) {
        let counters = self.direction(direction);
        let sent = counters.sent.load(Ordering::Acquire);
        counters.received.store(sent, Ordering::Relaxed);
        counters.consumed.store(sent, Ordering::Release);
        counters.empty.post();
    }

    /// Number of published, not yet received messages (0 or 1 under correct use)
    pub fn pending(&self, direction: Direction) -> u32 {
        self.direction(direction).full.value()
    }

    /// Shared end-of-stream flag
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire) != 0
    }

    /// Set the end-of-stream flag; callers hold send permission
    pub(crate) fn mark_finished(&self) {
        self.finished.store(1, Ordering::Release);
    }
}
