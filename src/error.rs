//! Error types for lockstep-ipc

use crate::sync::Direction;
use std::io;
use thiserror::Error;

/// Result type for lockstep-ipc operations
pub type Result<T> = std::result::Result<T, LockstepError>;

/// Errors that can occur while establishing or driving a channel
#[derive(Debug, Error)]
pub enum LockstepError {
    /// Failed to create shared memory
    #[error("Failed to create shared memory '{name}': {source}")]
    ShmCreate {
        name: String,
        #[source]
        source: io::Error,
    },

    /// Failed to open shared memory
    #[error("Failed to open shared memory '{name}': {source}")]
    ShmOpen {
        name: String,
        #[source]
        source: io::Error,
    },

    /// No segment exists under the name (the creator has not run yet)
    #[error("Shared memory segment '{name}' does not exist")]
    SegmentNotFound { name: String },

    /// A segment or object with this name already exists
    #[error("'{name}' already exists")]
    AlreadyExists { name: String },

    /// No object is registered under the name inside the region
    #[error("Object '{name}' not found in region")]
    ObjectNotFound { name: String },

    /// Failed to map memory
    #[error("Failed to map memory: {0}")]
    Mmap(#[source] io::Error),

    /// Failed to truncate shared memory
    #[error("Failed to set shared memory size: {0}")]
    Truncate(#[source] io::Error),

    /// Invalid region magic number
    #[error("Invalid region magic number: expected 0x{expected:08X}, got 0x{got:08X}")]
    InvalidMagic { expected: u32, got: u32 },

    /// Region layout version differs between the peers
    #[error("Unsupported region version: expected {expected}, got {got}")]
    VersionMismatch { expected: u32, got: u32 },

    /// Name too long
    #[error("Name too long: max {max} chars, got {got}")]
    NameTooLong { max: usize, got: usize },

    /// Name is empty or contains a character the OS rejects
    #[error("Invalid name '{0}'")]
    InvalidName(String),

    /// Region is smaller than its fixed header
    #[error("Region too small: need at least {min} bytes, got {got}")]
    RegionTooSmall { min: usize, got: usize },

    /// Region heap cannot satisfy an allocation
    #[error("Region heap exhausted: requested {requested} bytes, {available} available")]
    OutOfMemory { requested: usize, available: usize },

    /// Object directory has no free entry
    #[error("Object directory full ({max} entries)")]
    DirectoryFull { max: usize },

    /// Payload type has an alignment the region heap cannot honor
    #[error("Unsupported payload alignment {align} (max {max})")]
    UnsupportedAlignment { align: usize, max: usize },

    /// Object exists but was constructed with a different layout or mode
    #[error("Object '{name}' layout mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        name: String,
        expected: String,
        found: String,
    },

    /// Operation reserved for the creating endpoint
    #[error("'{0}' is only valid for the region creator")]
    CreatorOnly(&'static str),

    /// A blocking bracket exceeded the configured liveness timeout
    #[error("Timed out waiting to {op} on {direction}")]
    Timeout { direction: Direction, op: &'static str },

    /// An end call with no matching begin
    #[error("Unpaired {op} on {direction}")]
    UnpairedBracket { direction: Direction, op: &'static str },

    /// Message counters disagree, an unpaired bracket touched the slot
    #[error("Sequence mismatch on {direction}: expected message {expected}, found {found}")]
    SequenceMismatch {
        direction: Direction,
        expected: u64,
        found: u64,
    },

    /// Finish protocol used while finish handling is disabled
    #[error("Finish handling is disabled for this endpoint")]
    FinishDisabled,

    /// Only the simulation side may signal end-of-stream
    #[error("Only the simulation side may signal end-of-stream")]
    FinishNotPermitted,

    /// Send attempted after end-of-stream was signaled
    #[error("Endpoint already signaled end-of-stream")]
    AlreadyFinished,
}
