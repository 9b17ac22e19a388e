//! One process's view of the lock-step channel
//!
//! An [`Endpoint`] owns the region mapping plus one sender (outbound
//! direction) and one receiver (inbound direction). The creator builds the
//! region and its three named objects; the attacher opens it and finds them.
//!
//! ```no_run
//! use lockstep_ipc::{Endpoint, EndpointConfig, Role, Side};
//!
//! # fn main() -> lockstep_ipc::Result<()> {
//! let config = EndpointConfig::new(Role::Creator, Side::Agent);
//! let mut agent: Endpoint<u64, u64> = Endpoint::new(&config)?;
//! while let Some(obs) = agent.recv_value()? {
//!     agent.send_value(obs * 2)?;
//! }
//! # Ok(())
//! # }
//! ```

use crate::channel::{
    payload_bytes, Batch, BatchReader, BatchWriter, Link, Mode, RawSlot, Receiver, RecordReader,
    RecordWriter, Sender, Single,
};
use crate::config::{EndpointConfig, Role, Side};
use crate::envelope::{Envelope, ObjectKind, ObjectTag};
use crate::error::Result;
use crate::region::Region;
use crate::sync::{Direction, SyncCounters};
use std::ptr::NonNull;
use std::sync::Arc;

/// Region plus both direction handles, element layouts known at runtime
pub(crate) struct Attachment {
    pub(crate) link: Arc<Link>,
    pub(crate) tx: RawSlot,
    pub(crate) rx: RawSlot,
}

/// Create or attach the region and its objects per `config`
///
/// `tx` and `rx` are the outbound and inbound element layouts of this side,
/// both of the same kind.
pub(crate) fn attach(config: &EndpointConfig, tx: ObjectTag, rx: ObjectTag) -> Result<Attachment> {
    config.validate()?;
    let names = &config.names;

    let outbound = config.side.outbound();
    let tag_for = |direction: Direction| if direction == outbound { tx } else { rx };
    let sync_tag = ObjectTag::of::<SyncCounters>(ObjectKind::Sync);
    let sync_bytes = std::mem::size_of::<SyncCounters>();

    let (region, sim_to_agent, agent_to_sim, sync) = match config.role {
        Role::Creator => {
            let region = Region::create(&names.segment, config.size, config.create_policy)?;
            let construct = |direction: Direction| {
                let tag = tag_for(direction);
                region.construct_raw(names.payload(direction), tag, payload_bytes(&tag))
            };
            let sim_to_agent = construct(Direction::SimToAgent)?;
            let agent_to_sim = construct(Direction::AgentToSim)?;
            let sync = region.construct_with(&names.sync, sync_tag, sync_bytes, |ptr| unsafe {
                SyncCounters::init(ptr.cast().as_ptr())
            })?;
            (region, sim_to_agent, agent_to_sim, sync)
        }
        Role::Attacher => {
            let region = Region::open(&names.segment)?;
            let find = |direction: Direction| region.find_raw(names.payload(direction), tag_for(direction));
            let sim_to_agent = find(Direction::SimToAgent)?;
            let agent_to_sim = find(Direction::AgentToSim)?;
            let sync = region.find_raw(&names.sync, sync_tag)?;
            (region, sim_to_agent, agent_to_sim, sync)
        }
    };

    tracing::info!(
        segment = %names.segment,
        role = ?config.role,
        side = ?config.side,
        kind = ?tx.kind,
        handle_finish = config.handle_finish,
        "endpoint ready"
    );

    let link = Arc::new(Link::new(
        region,
        sync.cast::<SyncCounters>(),
        config.role,
        config.side,
        config.handle_finish,
        config.timeout,
    ));
    let object = |direction: Direction| -> NonNull<u8> {
        match direction {
            Direction::SimToAgent => sim_to_agent,
            Direction::AgentToSim => agent_to_sim,
        }
    };
    let inbound = config.side.inbound();
    Ok(Attachment {
        tx: RawSlot::new(Arc::clone(&link), outbound, object(outbound), tx),
        rx: RawSlot::new(Arc::clone(&link), inbound, object(inbound), rx),
        link,
    })
}

/// Sends `Tx` records and receives `Rx` records in mode `M`
pub struct Endpoint<Tx: Envelope, Rx: Envelope, M: Mode = Single> {
    tx: Sender<Tx, M>,
    rx: Receiver<Rx, M>,
    link: Arc<Link>,
}

impl<Tx: Envelope, Rx: Envelope, M: Mode> Endpoint<Tx, Rx, M> {
    /// Create or attach per the configured role
    pub fn new(config: &EndpointConfig) -> Result<Self> {
        let Attachment { link, tx, rx } = attach(
            config,
            ObjectTag::of::<Tx>(M::KIND),
            ObjectTag::of::<Rx>(M::KIND),
        )?;
        Ok(Self {
            tx: Sender::from_raw(tx),
            rx: Receiver::from_raw(rx),
            link,
        })
    }

    pub fn sender(&mut self) -> &mut Sender<Tx, M> {
        &mut self.tx
    }

    pub fn receiver(&mut self) -> &mut Receiver<Rx, M> {
        &mut self.rx
    }

    /// Separate the halves, e.g. to move them to different threads
    ///
    /// The mapping stays alive until both halves are dropped. The implicit
    /// finish on drop does not apply to split halves.
    pub fn split(self) -> (Sender<Tx, M>, Receiver<Rx, M>) {
        let this = std::mem::ManuallyDrop::new(self);
        // SAFETY: fields are moved out exactly once and `this` is never dropped
        unsafe {
            let tx = std::ptr::read(&this.tx);
            let rx = std::ptr::read(&this.rx);
            let link = std::ptr::read(&this.link);
            drop(link);
            (tx, rx)
        }
    }

    /// Signal end-of-stream to the agent
    ///
    /// Only the simulation side may finish, and only with finish handling
    /// enabled. Waits for the previous message to be consumed first. Calling
    /// it again is a no-op.
    pub fn set_finished(&mut self) -> Result<()> {
        self.tx.raw().send_finish(self.link.timeout)
    }

    /// Whether end-of-stream was sent (simulation) or observed (agent)
    pub fn is_finished(&self) -> bool {
        self.link.is_finished()
    }

    /// Raw semaphore brackets, for peers driving the protocol by hand
    pub fn sync(&self) -> &SyncCounters {
        self.link.sync()
    }

    pub fn region(&self) -> &Region {
        self.link.region()
    }

    pub fn role(&self) -> Role {
        self.link.role
    }

    pub fn side(&self) -> Side {
        self.link.side
    }
}

impl<Tx: Envelope, Rx: Envelope> Endpoint<Tx, Rx, Single> {
    pub fn send(&mut self) -> Result<RecordWriter<'_, Tx>> {
        self.tx.send()
    }

    pub fn send_value(&mut self, value: Tx) -> Result<()> {
        self.tx.send_value(value)
    }

    /// `None` means the peer finished
    pub fn recv(&mut self) -> Result<Option<RecordReader<'_, Rx>>> {
        self.rx.recv()
    }

    pub fn recv_value(&mut self) -> Result<Option<Rx>> {
        self.rx.recv_value()
    }
}

impl<Tx: Envelope, Rx: Envelope> Endpoint<Tx, Rx, Batch> {
    pub fn send(&mut self) -> Result<BatchWriter<'_, Tx>> {
        self.tx.send()
    }

    pub fn send_slice(&mut self, items: &[Tx]) -> Result<()> {
        self.tx.send_slice(items)
    }

    /// `None` means the peer finished
    pub fn recv(&mut self) -> Result<Option<BatchReader<'_, Rx>>> {
        self.rx.recv()
    }

    pub fn recv_vec(&mut self) -> Result<Option<Vec<Rx>>> {
        self.rx.recv_vec()
    }
}

impl<Tx: Envelope, Rx: Envelope, M: Mode> Drop for Endpoint<Tx, Rx, M> {
    fn drop(&mut self) {
        self.tx.raw().finish_on_drop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CreatePolicy, ObjectNames};
    use crate::channel::TryRecv;
    use crate::error::LockstepError;
    use std::sync::atomic::Ordering;
    use std::thread;
    use std::time::Duration;

    fn names(tag: &str) -> ObjectNames {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let suffix = format!("{}_{}", tag, &id[..12]);
        ObjectNames::default().with_suffix(&suffix)
    }

    fn pair<M: Mode>(names: &ObjectNames, handle_finish: bool) -> (Endpoint<u64, u32, M>, Endpoint<u32, u64, M>) {
        let sim = EndpointConfig::new(Role::Creator, Side::Simulation)
            .with_names(names.clone())
            .with_size(65536)
            .with_handle_finish(handle_finish)
            .with_timeout(Duration::from_secs(10));
        let agent = EndpointConfig::new(Role::Attacher, Side::Agent)
            .with_names(names.clone())
            .with_handle_finish(handle_finish)
            .with_timeout(Duration::from_secs(10));
        let sim = Endpoint::new(&sim).unwrap();
        let agent = Endpoint::new(&agent).unwrap();
        (sim, agent)
    }

    #[test]
    fn test_single_round_trip() {
        let names = names("single");
        let (mut sim, mut agent) = pair::<Single>(&names, false);
        assert_eq!(sim.role(), Role::Creator);
        assert_eq!(agent.side(), Side::Agent);

        {
            let mut obs = sim.send().unwrap();
            assert_eq!(obs.message_number(), 1);
            *obs = 40;
        }
        let obs = agent.recv().unwrap().unwrap();
        assert_eq!(*obs, 40);
        assert_eq!(obs.message_number(), 1);
        drop(obs);

        agent.send_value(2).unwrap();
        assert_eq!(sim.recv_value().unwrap(), Some(2));
        assert_eq!(sim.sync().pending(Direction::SimToAgent), 0);
        assert_eq!(sim.sync().pending(Direction::AgentToSim), 0);
    }

    #[test]
    fn test_try_send_refuses_while_pending() {
        let names = names("try");
        let (mut sim, mut agent) = pair::<Single>(&names, false);

        assert!(matches!(agent.receiver().try_recv().unwrap(), TryRecv::Empty));
        sim.sender().try_send().unwrap().map(|mut w| *w = 1).unwrap();
        assert!(sim.sender().try_send().unwrap().is_none());
        assert_eq!(sim.sync().pending(Direction::SimToAgent), 1);

        match agent.receiver().try_recv().unwrap() {
            TryRecv::Message(r) => assert_eq!(*r, 1),
            other => panic!("expected a message, got {:?}", other.message().map(|r| *r)),
        }
        assert!(sim.sender().try_send().unwrap().is_some());
    }

    #[test]
    fn test_batch_lengths_follow_writer() {
        let names = names("batch");
        let (mut sim, mut agent) = pair::<Batch>(&names, false);

        for k in [0usize, 3, 17, 1, 0, 40] {
            {
                let mut batch = sim.send().unwrap();
                batch.clear();
                for i in 0..k {
                    batch.push(i as u64 * 10).unwrap();
                }
                assert_eq!(batch.len(), k);
            }
            let got = agent.recv_vec().unwrap().unwrap();
            assert_eq!(got.len(), k);
            assert!(got.iter().enumerate().all(|(i, v)| *v == i as u64 * 10));

            agent.send_slice(&vec![7u32; k]).unwrap();
            let reply = sim.recv().unwrap().unwrap();
            assert_eq!(reply.len(), k);
        }
    }

    #[test]
    fn test_mode_mismatch_fails_attach() {
        let names = names("mode");
        let sim = EndpointConfig::new(Role::Creator, Side::Simulation).with_names(names.clone());
        let _sim = Endpoint::<u64, u32, Single>::new(&sim).unwrap();

        let agent = EndpointConfig::new(Role::Attacher, Side::Agent).with_names(names.clone());
        assert!(matches!(
            Endpoint::<u32, u64, Batch>::new(&agent),
            Err(LockstepError::TypeMismatch { .. })
        ));
        assert!(matches!(
            Endpoint::<u32, u32, Single>::new(&agent),
            Err(LockstepError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_finish_rules() {
        let names = names("finish_rules");
        let (mut sim, agent) = pair::<Single>(&names, false);
        assert!(matches!(sim.set_finished(), Err(LockstepError::FinishDisabled)));
        drop((sim, agent));

        let names = self::names("finish_side");
        let (mut sim, mut agent) = pair::<Single>(&names, true);
        assert!(matches!(agent.set_finished(), Err(LockstepError::FinishNotPermitted)));

        sim.set_finished().unwrap();
        sim.set_finished().unwrap();
        assert!(sim.is_finished());
        assert!(matches!(sim.send(), Err(LockstepError::AlreadyFinished)));

        assert!(!agent.is_finished());
        assert!(agent.recv().unwrap().is_none());
        assert!(agent.is_finished());
        // Later receives do not block
        assert!(agent.recv_value().unwrap().is_none());
    }

    #[test]
    fn test_finish_on_drop() {
        let names = names("finish_drop");
        let (mut sim, mut agent) = pair::<Single>(&names, true);
        sim.send_value(5).unwrap();

        let agent = thread::spawn(move || {
            let mut seen = Vec::new();
            while let Some(v) = agent.recv_value().unwrap() {
                seen.push(v);
            }
            seen
        });
        drop(sim);
        assert_eq!(agent.join().unwrap(), vec![5]);
    }

    #[test]
    fn test_split_halves_outlive_endpoint() {
        let names = names("split");
        let (sim, mut agent) = pair::<Single>(&names, false);
        let (mut tx, mut rx) = sim.split();

        let echo = thread::spawn(move || {
            for _ in 0..10 {
                let v = agent.recv_value().unwrap().unwrap();
                agent.send_value(v as u32 + 1).unwrap();
            }
        });
        for i in 0..10u64 {
            tx.send_value(i).unwrap();
            assert_eq!(rx.recv_value().unwrap(), Some(i as u32 + 1));
        }
        echo.join().unwrap();
    }

    #[test]
    fn test_lost_message_is_skipped() {
        let names = names("lost");
        let (mut sim, mut agent) = pair::<Single>(&names, false);

        sim.send_value(1).unwrap();
        // One more message counted than the slot ever carried
        sim.sync()
            .direction(Direction::SimToAgent)
            .sent()
            .fetch_add(1, Ordering::Release);
        match agent.recv_value() {
            Err(LockstepError::SequenceMismatch { direction, expected, found }) => {
                assert_eq!(direction, Direction::SimToAgent);
                assert_eq!(expected, 1);
                assert_eq!(found, 2);
            }
            other => panic!("expected sequence mismatch, got {:?}", other.map_err(|e| e.to_string())),
        }
        // The slot went back to the writer and numbering resumes after the gap
        assert_eq!(sim.sync().pending(Direction::SimToAgent), 0);
        {
            let mut obs = sim.send().unwrap();
            assert_eq!(obs.message_number(), 3);
            *obs = 3;
        }
        let obs = agent.recv().unwrap().unwrap();
        assert_eq!((*obs, obs.message_number()), (3, 3));
    }

    #[test]
    fn test_cancelled_send_publishes_nothing() {
        let names = names("cancel");
        let (mut sim, mut agent) = pair::<Batch>(&names, false);

        let mut batch = sim.send().unwrap();
        batch.extend_from_slice(&[5, 6]).unwrap();
        batch.cancel();
        assert_eq!(sim.sync().pending(Direction::SimToAgent), 0);
        assert!(matches!(agent.receiver().try_recv().unwrap(), TryRecv::Empty));

        {
            let mut batch = sim.send().unwrap();
            assert_eq!(batch.message_number(), 1);
            batch.truncate(1);
            batch.push(7).unwrap();
        }
        assert_eq!(agent.recv_vec().unwrap(), Some(vec![5, 7]));
    }

    #[test]
    fn test_exclusive_creator_refuses_live_region() {
        let names = names("exclusive");
        let (_sim, _agent) = pair::<Single>(&names, false);
        let again = EndpointConfig::new(Role::Creator, Side::Agent)
            .with_names(names.clone())
            .with_create_policy(CreatePolicy::Exclusive);
        assert!(matches!(
            Endpoint::<u32, u64, Single>::new(&again),
            Err(LockstepError::AlreadyExists { .. })
        ));
    }
}
