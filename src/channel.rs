//! Typed channel halves and scoped payload guards
//!
//! A [`Sender`] or [`Receiver`] binds one direction's payload object to the
//! shared [`SyncCounters`]. Payload bytes are reachable only through guards:
//! taking a guard performs the begin half of the bracket, dropping it
//! performs the end half, on every exit path.
//!
//! The payload mode is a type parameter: [`Single`] exchanges one record per
//! round, [`Batch`] a resizable sequence of records.

use crate::batch::{RawSeq, SeqHeader};
use crate::config::{Role, Side};
use crate::envelope::{Envelope, ObjectKind, ObjectTag};
use crate::error::{LockstepError, Result};
use crate::region::Region;
use crate::sync::{Direction, SyncCounters};
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

mod sealed {
    pub trait Sealed {}
}

/// Payload mode, fixed per endpoint and identical on both peers
pub trait Mode: sealed::Sealed + Send + 'static {
    #[doc(hidden)]
    const KIND: ObjectKind;
}

/// One record per direction per round
#[derive(Debug, Clone, Copy, Default)]
pub struct Single;

/// A resizable sequence of records per direction per round
#[derive(Debug, Clone, Copy, Default)]
pub struct Batch;

impl sealed::Sealed for Single {}
impl sealed::Sealed for Batch {}

impl Mode for Single {
    const KIND: ObjectKind = ObjectKind::Record;
}

impl Mode for Batch {
    const KIND: ObjectKind = ObjectKind::Batch;
}

/// Bytes of the named payload object for an element layout
pub(crate) fn payload_bytes(tag: &ObjectTag) -> usize {
    match tag.kind {
        ObjectKind::Batch => std::mem::size_of::<SeqHeader>(),
        _ => tag.size,
    }
}

/// State shared by both halves of one endpoint
pub(crate) struct Link {
    region: Region,
    sync: NonNull<SyncCounters>,
    pub(crate) role: Role,
    pub(crate) side: Side,
    pub(crate) handle_finish: bool,
    pub(crate) timeout: Option<Duration>,
    /// End-of-stream sent (simulation) or observed (agent)
    finished: AtomicBool,
}

// SAFETY: `sync` points into `region`, which the link keeps mapped; the
// counters are atomics
unsafe impl Send for Link {}
unsafe impl Sync for Link {}

impl Link {
    pub(crate) fn new(
        region: Region,
        sync: NonNull<SyncCounters>,
        role: Role,
        side: Side,
        handle_finish: bool,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            region,
            sync,
            role,
            side,
            handle_finish,
            timeout,
            finished: AtomicBool::new(false),
        }
    }

    #[inline]
    pub(crate) fn sync(&self) -> &SyncCounters {
        unsafe { self.sync.as_ref() }
    }

    #[inline]
    pub(crate) fn region(&self) -> &Region {
        &self.region
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }
}

/// What a successful receive acquisition produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
    Message,
    Finished,
}

/// Untyped direction handle: payload object plus bracket bookkeeping
pub(crate) struct RawSlot {
    link: Arc<Link>,
    direction: Direction,
    object: NonNull<u8>,
    tag: ObjectTag,
}

// SAFETY: `object` points into the region kept alive by `link`
unsafe impl Send for RawSlot {}

impl RawSlot {
    pub(crate) fn new(link: Arc<Link>, direction: Direction, object: NonNull<u8>, tag: ObjectTag) -> Self {
        Self {
            link,
            direction,
            object,
            tag,
        }
    }

    #[inline]
    pub(crate) fn direction(&self) -> Direction {
        self.direction
    }

    #[inline]
    pub(crate) fn object(&self) -> NonNull<u8> {
        self.object
    }

    #[inline]
    pub(crate) fn timeout(&self) -> Option<Duration> {
        self.link.timeout
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.link.is_finished()
    }

    /// Sequence view of a batch object; caller holds the bracket
    pub(crate) fn seq(&self) -> RawSeq<'_> {
        debug_assert_eq!(self.tag.kind, ObjectKind::Batch);
        unsafe { RawSeq::new(self.link.region(), self.object.cast(), self.tag.size) }
    }

    fn finish_applies(&self) -> bool {
        self.link.handle_finish && self.direction == Direction::SimToAgent
    }

    /// Take write permission; `Ok(false)` only when `block` is false and
    /// the slot is still occupied
    pub(crate) fn acquire_send(&self, block: bool) -> Result<bool> {
        if self.finish_applies() && self.link.is_finished() {
            return Err(LockstepError::AlreadyFinished);
        }
        let sync = self.link.sync();
        if block {
            sync.send_begin(self.direction, self.link.timeout)?;
            Ok(true)
        } else {
            Ok(sync.try_send_begin(self.direction))
        }
    }

    /// Stamp and publish the message
    pub(crate) fn release_send(&self) {
        self.link.sync().publish(self.direction);
    }

    /// Give write permission back with nothing published
    pub(crate) fn cancel_send(&self) {
        self.link.sync().cancel_send(self.direction);
    }

    /// Take read permission; `Ok(None)` only when `block` is false and
    /// nothing is pending
    pub(crate) fn acquire_recv(&self, block: bool) -> Result<Option<Delivery>> {
        if self.finish_applies() && self.link.is_finished() {
            return Ok(Some(Delivery::Finished));
        }

        let sync = self.link.sync();
        if block {
            sync.recv_begin(self.direction, self.link.timeout)?;
        } else if !sync.try_recv_begin(self.direction) {
            return Ok(None);
        }

        self.check_sequence()?;

        if self.finish_applies() && sync.is_finished() {
            self.link.finished.store(true, Ordering::Release);
            self.release_recv();
            tracing::info!(direction = %self.direction, "peer signaled end-of-stream");
            return Ok(Some(Delivery::Finished));
        }
        Ok(Some(Delivery::Message))
    }

    /// Verify the pending message directly follows the last one consumed
    fn check_sequence(&self) -> Result<()> {
        let sync = self.link.sync();
        let counters = sync.direction(self.direction);
        let sent = counters.sent().load(Ordering::Acquire);
        let expected = counters.consumed().load(Ordering::Relaxed) + 1;
        if sent == expected {
            return Ok(());
        }

        tracing::warn!(
            direction = %self.direction,
            expected,
            found = sent,
            "message sequence mismatch, skipping to the latest message"
        );
        // The slot goes back to the writer either way
        sync.resync(self.direction);
        Err(LockstepError::SequenceMismatch {
            direction: self.direction,
            expected,
            found: sent,
        })
    }

    /// Mark the message consumed and return the slot to the writer
    pub(crate) fn release_recv(&self) {
        self.link.sync().release(self.direction);
    }

    /// Number the next published message will carry
    pub(crate) fn next_sent(&self) -> u64 {
        self.link
            .sync()
            .direction(self.direction)
            .sent()
            .load(Ordering::Acquire)
            + 1
    }

    /// Number of the message currently held for reading
    pub(crate) fn next_consumed(&self) -> u64 {
        self.link
            .sync()
            .direction(self.direction)
            .consumed()
            .load(Ordering::Acquire)
            + 1
    }

    /// Set the end-of-stream flag through a regular send bracket
    pub(crate) fn send_finish(&self, timeout: Option<Duration>) -> Result<()> {
        if !self.link.handle_finish {
            return Err(LockstepError::FinishDisabled);
        }
        if self.direction != Direction::SimToAgent {
            return Err(LockstepError::FinishNotPermitted);
        }
        if self.link.is_finished() {
            return Ok(());
        }

        let sync = self.link.sync();
        sync.send_begin(self.direction, timeout)?;
        sync.mark_finished();
        self.release_send();
        self.link.finished.store(true, Ordering::Release);
        tracing::info!(direction = %self.direction, "signaled end-of-stream");
        Ok(())
    }
}

/// Wait bound for the implicit finish of a simulation endpoint being torn down
const FINISH_ON_DROP_TIMEOUT: Duration = Duration::from_secs(1);

impl RawSlot {
    /// Finish on behalf of a simulation endpoint that never did
    pub(crate) fn finish_on_drop(&self) {
        let link = &self.link;
        if link.side != Side::Simulation || !link.handle_finish || link.is_finished() {
            return;
        }
        let timeout = link.timeout.unwrap_or(FINISH_ON_DROP_TIMEOUT);
        match self.send_finish(Some(timeout)) {
            Ok(()) => tracing::debug!(segment = %link.region().name(), "finished on drop"),
            Err(e) => tracing::warn!(
                segment = %link.region().name(),
                error = %e,
                "could not signal end-of-stream on drop"
            ),
        }
    }
}

/// Held write permission; publishes on drop
struct SendPermit<'a> {
    raw: &'a RawSlot,
}

impl SendPermit<'_> {
    /// Release without publishing
    fn cancel(self) {
        self.raw.cancel_send();
        std::mem::forget(self);
    }
}

impl Drop for SendPermit<'_> {
    fn drop(&mut self) {
        self.raw.release_send();
    }
}

/// Held read permission; frees the slot on drop
struct RecvPermit<'a> {
    raw: &'a RawSlot,
}

impl Drop for RecvPermit<'_> {
    fn drop(&mut self) {
        self.raw.release_recv();
    }
}

/// Outcome of a non-blocking receive
#[derive(Debug)]
pub enum TryRecv<G> {
    /// Nothing pending
    Empty,
    /// The peer signaled end-of-stream
    Finished,
    Message(G),
}

impl<G> TryRecv<G> {
    pub fn message(self) -> Option<G> {
        match self {
            TryRecv::Message(guard) => Some(guard),
            _ => None,
        }
    }
}

/// Writing half of one direction
pub struct Sender<T, M = Single> {
    raw: RawSlot,
    _marker: PhantomData<fn() -> (T, M)>,
}

/// Reading half of one direction
pub struct Receiver<T, M = Single> {
    raw: RawSlot,
    _marker: PhantomData<fn() -> (T, M)>,
}

impl<T: Envelope, M: Mode> Sender<T, M> {
    pub(crate) fn from_raw(raw: RawSlot) -> Self {
        Self {
            raw,
            _marker: PhantomData,
        }
    }

    pub fn direction(&self) -> Direction {
        self.raw.direction()
    }

    pub(crate) fn raw(&self) -> &RawSlot {
        &self.raw
    }

    fn permit(&self, block: bool) -> Result<Option<SendPermit<'_>>> {
        Ok(self
            .raw
            .acquire_send(block)?
            .then(|| SendPermit { raw: &self.raw }))
    }
}

impl<T: Envelope, M: Mode> Receiver<T, M> {
    pub(crate) fn from_raw(raw: RawSlot) -> Self {
        Self {
            raw,
            _marker: PhantomData,
        }
    }

    pub fn direction(&self) -> Direction {
        self.raw.direction()
    }

    /// Whether end-of-stream has been observed on this direction
    pub fn is_finished(&self) -> bool {
        self.raw.finish_applies() && self.raw.link.is_finished()
    }

    fn permit(&self, block: bool) -> Result<TryRecv<RecvPermit<'_>>> {
        Ok(match self.raw.acquire_recv(block)? {
            None => TryRecv::Empty,
            Some(Delivery::Finished) => TryRecv::Finished,
            Some(Delivery::Message) => TryRecv::Message(RecvPermit { raw: &self.raw }),
        })
    }
}

impl<T: Envelope> Sender<T, Single> {
    /// Wait for the slot to be free and borrow the record for writing
    pub fn send(&mut self) -> Result<RecordWriter<'_, T>> {
        let permit = self
            .permit(true)?
            .ok_or(LockstepError::Timeout {
                direction: self.raw.direction(),
                op: "send",
            })?;
        Ok(RecordWriter::new(permit))
    }

    /// Borrow the record only if the peer already consumed the last one
    pub fn try_send(&mut self) -> Result<Option<RecordWriter<'_, T>>> {
        Ok(self.permit(false)?.map(RecordWriter::new))
    }

    /// Send one record
    pub fn send_value(&mut self, value: T) -> Result<()> {
        *self.send()? = value;
        Ok(())
    }
}

impl<T: Envelope> Receiver<T, Single> {
    /// Wait for the next record; `None` means end-of-stream
    pub fn recv(&mut self) -> Result<Option<RecordReader<'_, T>>> {
        Ok(self.permit(true)?.message().map(RecordReader::new))
    }

    pub fn try_recv(&mut self) -> Result<TryRecv<RecordReader<'_, T>>> {
        Ok(match self.permit(false)? {
            TryRecv::Empty => TryRecv::Empty,
            TryRecv::Finished => TryRecv::Finished,
            TryRecv::Message(permit) => TryRecv::Message(RecordReader::new(permit)),
        })
    }

    /// Receive one record by value
    pub fn recv_value(&mut self) -> Result<Option<T>> {
        Ok(self.recv()?.map(|record| *record))
    }
}

impl<T: Envelope> Sender<T, Batch> {
    /// Wait for the slot to be free and borrow the sequence for writing
    ///
    /// The sequence still holds the previous batch; clear or resize it.
    pub fn send(&mut self) -> Result<BatchWriter<'_, T>> {
        let permit = self
            .permit(true)?
            .ok_or(LockstepError::Timeout {
                direction: self.raw.direction(),
                op: "send",
            })?;
        Ok(BatchWriter::new(permit))
    }

    pub fn try_send(&mut self) -> Result<Option<BatchWriter<'_, T>>> {
        Ok(self.permit(false)?.map(BatchWriter::new))
    }

    /// Replace the sequence with `items` and send it
    ///
    /// Nothing is sent when the region cannot hold `items`.
    pub fn send_slice(&mut self, items: &[T]) -> Result<()> {
        let mut batch = self.send()?;
        if let Err(e) = batch.resize(items.len()) {
            batch.cancel();
            return Err(e);
        }
        batch.as_mut_slice().copy_from_slice(items);
        Ok(())
    }
}

impl<T: Envelope> Receiver<T, Batch> {
    /// Wait for the next batch; `None` means end-of-stream
    pub fn recv(&mut self) -> Result<Option<BatchReader<'_, T>>> {
        Ok(self.permit(true)?.message().map(BatchReader::new))
    }

    pub fn try_recv(&mut self) -> Result<TryRecv<BatchReader<'_, T>>> {
        Ok(match self.permit(false)? {
            TryRecv::Empty => TryRecv::Empty,
            TryRecv::Finished => TryRecv::Finished,
            TryRecv::Message(permit) => TryRecv::Message(BatchReader::new(permit)),
        })
    }

    /// Receive one batch as an owned vector
    pub fn recv_vec(&mut self) -> Result<Option<Vec<T>>> {
        Ok(self.recv()?.map(|batch| batch.to_vec()))
    }
}

/// Exclusive access to the outbound record until dropped
pub struct RecordWriter<'a, T> {
    permit: SendPermit<'a>,
    value: NonNull<T>,
    _marker: PhantomData<&'a mut T>,
}

impl<'a, T: Envelope> RecordWriter<'a, T> {
    fn new(permit: SendPermit<'a>) -> Self {
        let value = permit.raw.object().cast();
        Self {
            permit,
            value,
            _marker: PhantomData,
        }
    }

    /// Sequence number this message will carry, starting at 1
    pub fn message_number(&self) -> u64 {
        self.permit.raw.next_sent()
    }

    /// Free the slot without sending; the peer sees nothing
    pub fn cancel(self) {
        self.permit.cancel();
    }
}

impl<T> Deref for RecordWriter<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { self.value.as_ref() }
    }
}

impl<T> DerefMut for RecordWriter<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { self.value.as_mut() }
    }
}

/// Read access to the inbound record until dropped
pub struct RecordReader<'a, T> {
    permit: RecvPermit<'a>,
    value: NonNull<T>,
    _marker: PhantomData<&'a T>,
}

impl<'a, T: Envelope> RecordReader<'a, T> {
    fn new(permit: RecvPermit<'a>) -> Self {
        let value = permit.raw.object().cast();
        Self {
            permit,
            value,
            _marker: PhantomData,
        }
    }

    /// Sequence number of this message, starting at 1
    pub fn message_number(&self) -> u64 {
        self.permit.raw.next_consumed()
    }
}

impl<T> Deref for RecordReader<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { self.value.as_ref() }
    }
}

/// Exclusive access to the outbound sequence until dropped
pub struct BatchWriter<'a, T> {
    permit: SendPermit<'a>,
    _marker: PhantomData<&'a mut [T]>,
}

impl<'a, T: Envelope> BatchWriter<'a, T> {
    fn new(permit: SendPermit<'a>) -> Self {
        Self {
            permit,
            _marker: PhantomData,
        }
    }

    fn seq(&self) -> RawSeq<'_> {
        self.permit.raw.seq()
    }

    pub fn len(&self) -> usize {
        self.seq().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.seq().capacity()
    }

    /// Set the number of records; new records are zeroed
    pub fn resize(&mut self, len: usize) -> Result<()> {
        self.seq().resize(len)
    }

    /// Make room for `additional` more records without changing the length
    pub fn reserve(&mut self, additional: usize) -> Result<()> {
        self.seq().reserve(additional)
    }

    pub fn clear(&mut self) {
        self.seq().truncate(0);
    }

    pub fn truncate(&mut self, len: usize) {
        self.seq().truncate(len);
    }

    pub fn push(&mut self, value: T) -> Result<()> {
        let len = self.len();
        self.seq().resize(len + 1)?;
        self.as_mut_slice()[len] = value;
        Ok(())
    }

    pub fn extend_from_slice(&mut self, items: &[T]) -> Result<()> {
        let len = self.len();
        self.seq().resize(len + items.len())?;
        self.as_mut_slice()[len..].copy_from_slice(items);
        Ok(())
    }

    pub fn as_slice(&self) -> &[T] {
        let seq = self.seq();
        let data = seq.data().map_or(NonNull::<T>::dangling(), NonNull::cast);
        unsafe { std::slice::from_raw_parts(data.as_ptr(), seq.len()) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        let seq = self.seq();
        let data = seq.data().map_or(NonNull::<T>::dangling(), NonNull::cast);
        unsafe { std::slice::from_raw_parts_mut(data.as_ptr(), seq.len()) }
    }

    pub fn message_number(&self) -> u64 {
        self.permit.raw.next_sent()
    }

    /// Free the slot without sending; the sequence keeps whatever was written
    pub fn cancel(self) {
        self.permit.cancel();
    }
}

impl<T: Envelope> Deref for BatchWriter<'_, T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        self.as_slice()
    }
}

impl<T: Envelope> DerefMut for BatchWriter<'_, T> {
    fn deref_mut(&mut self) -> &mut [T] {
        self.as_mut_slice()
    }
}

/// Read access to the inbound sequence until dropped
pub struct BatchReader<'a, T> {
    permit: RecvPermit<'a>,
    data: NonNull<T>,
    len: usize,
    _marker: PhantomData<&'a [T]>,
}

impl<'a, T: Envelope> BatchReader<'a, T> {
    fn new(permit: RecvPermit<'a>) -> Self {
        let seq = permit.raw.seq();
        let data = seq.data().map_or(NonNull::<T>::dangling(), NonNull::cast);
        let len = seq.len();
        Self {
            permit,
            data,
            len,
            _marker: PhantomData,
        }
    }

    pub fn message_number(&self) -> u64 {
        self.permit.raw.next_consumed()
    }
}

impl<T> Deref for BatchReader<'_, T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        unsafe { std::slice::from_raw_parts(self.data.as_ptr(), self.len) }
    }
}
