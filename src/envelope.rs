//! Message record contract

use std::fmt;

/// A fixed-layout message record that may be placed in shared memory
///
/// The type is the wire format between the two processes: its bytes are
/// read directly by a peer that may be built from another language.
///
/// # Safety
/// Implementors must:
/// - be `#[repr(C)]` (or `#[repr(transparent)]`) or a primitive,
/// - contain no pointers, references or owned heap memory,
/// - accept the all-zero bit pattern and any bit pattern the peer may
///   write as a valid value (so no `bool`, `char` or enums).
pub unsafe trait Envelope: Copy + Send + 'static {}

macro_rules! impl_envelope {
    ($($t:ty),* $(,)?) => {
        $(unsafe impl Envelope for $t {})*
    };
}

// Fixed-width only: the peer may be a process with a different pointer width
impl_envelope!(u8, u16, u32, u64, u128, i8, i16, i32, i64, i128, f32, f64);

unsafe impl<T: Envelope, const N: usize> Envelope for [T; N] {}

/// Discriminates what a named region object holds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ObjectKind {
    Record = 1,
    Batch = 2,
    Sync = 3,
}

impl ObjectKind {
    pub(crate) fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(ObjectKind::Record),
            2 => Some(ObjectKind::Batch),
            3 => Some(ObjectKind::Sync),
            _ => None,
        }
    }
}

/// Kind and element layout recorded for every named object
///
/// For batch objects the layout is that of one element, not of the
/// sequence header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectTag {
    pub kind: ObjectKind,
    pub size: usize,
    pub align: usize,
}

impl ObjectTag {
    pub const fn new(kind: ObjectKind, size: usize, align: usize) -> Self {
        Self { kind, size, align }
    }

    pub fn of<T>(kind: ObjectKind) -> Self {
        Self::new(kind, std::mem::size_of::<T>(), std::mem::align_of::<T>())
    }
}

impl fmt::Display for ObjectTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}(size={}, align={})", self.kind, self.size, self.align)
    }
}
