//! Lockstep IPC - shared memory lock-step channel between two processes
//!
//! A simulation process and an agent process exchange fixed-layout records
//! in rounds over a named POSIX shared memory region. Each direction is a
//! capacity-one slot guarded by a pair of counting semaphores, giving
//! exactly-once, in-order delivery without copies.
//!
//! # Architecture
//!
//! - **Region**: named segment with an object directory and an offset-based
//!   heap, valid at any mapping address
//! - **SyncCounters**: `empty`/`full` semaphores per direction plus the
//!   end-of-stream flag
//! - **Channel**: [`Sender`]/[`Receiver`] over one direction, in [`Single`]
//!   record or [`Batch`] sequence mode
//! - **Endpoint**: role negotiation (creator or attacher) and lifecycle
//!
//! # Round
//!
//! ```text
//! simulation                        agent
//!   send(obs)  ── sim-to-agent ──▶   recv() -> obs
//!   recv()     ◀── agent-to-sim ──   send(act)
//!   set_finished() ─────────────▶    recv() -> None
//! ```

mod batch;
pub mod bindings;
pub mod channel;
pub mod config;
pub mod endpoint;
pub mod envelope;
pub mod error;
mod heap;
pub mod region;
pub mod shm;
pub mod sync;

pub use channel::{
    Batch, BatchReader, BatchWriter, Mode, Receiver, RecordReader, RecordWriter, Sender, Single,
    TryRecv,
};
pub use config::{CreatePolicy, EndpointConfig, ObjectNames, Role, Side};
pub use endpoint::Endpoint;
pub use envelope::{Envelope, ObjectKind, ObjectTag};
pub use error::{LockstepError, Result};
pub use region::Region;
pub use sync::{Direction, SyncCounters};
