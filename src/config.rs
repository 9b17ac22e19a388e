//! Endpoint configuration
//!
//! Both peers must agree on the names, the mode (a type parameter of
//! [`Endpoint`](crate::Endpoint)) and the finish handling flag, and must take
//! opposite roles and opposite sides.

use crate::error::{LockstepError, Result};
use crate::region::{MAX_OBJECT_NAME, MIN_REGION_SIZE};
use crate::shm::MAX_SEGMENT_NAME;
use crate::sync::Direction;
use std::time::Duration;

/// Default region size in bytes
pub const DEFAULT_REGION_SIZE: usize = 4096;

pub const DEFAULT_SEGMENT_NAME: &str = "LockstepSeg";
pub const DEFAULT_SIM_TO_AGENT_NAME: &str = "LockstepSimToAgent";
pub const DEFAULT_AGENT_TO_SIM_NAME: &str = "LockstepAgentToSim";
pub const DEFAULT_SYNC_NAME: &str = "LockstepSync";

/// Which peer creates the region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Creates the region and constructs every named object
    Creator,
    /// Opens the region and finds the objects by name
    Attacher,
}

/// Which half of the conversation this process is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// Produces observations and owns end-of-stream
    Simulation,
    /// Consumes observations and answers with actions
    Agent,
}

impl Side {
    pub fn outbound(self) -> Direction {
        match self {
            Side::Simulation => Direction::SimToAgent,
            Side::Agent => Direction::AgentToSim,
        }
    }

    pub fn inbound(self) -> Direction {
        match self {
            Side::Simulation => Direction::AgentToSim,
            Side::Agent => Direction::SimToAgent,
        }
    }
}

/// What the creator does when a segment with its name already exists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CreatePolicy {
    /// Remove the old segment and start fresh
    #[default]
    Clobber,
    /// Fail with `AlreadyExists`
    Exclusive,
}

/// Names of the segment and of the three objects inside it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectNames {
    pub segment: String,
    pub sim_to_agent: String,
    pub agent_to_sim: String,
    pub sync: String,
}

impl Default for ObjectNames {
    fn default() -> Self {
        Self {
            segment: DEFAULT_SEGMENT_NAME.to_string(),
            sim_to_agent: DEFAULT_SIM_TO_AGENT_NAME.to_string(),
            agent_to_sim: DEFAULT_AGENT_TO_SIM_NAME.to_string(),
            sync: DEFAULT_SYNC_NAME.to_string(),
        }
    }
}

impl ObjectNames {
    /// Replace names; an empty string keeps the current value
    pub fn set_names(&mut self, segment: &str, sim_to_agent: &str, agent_to_sim: &str, sync: &str) {
        for (slot, value) in [
            (&mut self.segment, segment),
            (&mut self.sim_to_agent, sim_to_agent),
            (&mut self.agent_to_sim, agent_to_sim),
            (&mut self.sync, sync),
        ] {
            if !value.is_empty() {
                *slot = value.to_string();
            }
        }
    }

    /// Append `_suffix` to every name, e.g. a run id so experiments can coexist
    pub fn with_suffix(&self, suffix: &str) -> Self {
        Self {
            segment: format!("{}_{}", self.segment, suffix),
            sim_to_agent: format!("{}_{}", self.sim_to_agent, suffix),
            agent_to_sim: format!("{}_{}", self.agent_to_sim, suffix),
            sync: format!("{}_{}", self.sync, suffix),
        }
    }

    /// Name of the payload object carrying `direction`
    pub fn payload(&self, direction: Direction) -> &str {
        match direction {
            Direction::SimToAgent => &self.sim_to_agent,
            Direction::AgentToSim => &self.agent_to_sim,
        }
    }
}

/// Endpoint configuration
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    pub role: Role,
    pub side: Side,
    /// Enables the end-of-stream flag; must match the peer
    pub handle_finish: bool,
    /// Region size in bytes, only used by the creator
    pub size: usize,
    pub names: ObjectNames,
    pub create_policy: CreatePolicy,
    /// Liveness bound for every blocking begin; `None` waits forever
    pub timeout: Option<Duration>,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            role: Role::Creator,
            side: Side::Simulation,
            handle_finish: false,
            size: DEFAULT_REGION_SIZE,
            names: ObjectNames::default(),
            create_policy: CreatePolicy::default(),
            timeout: None,
        }
    }
}

impl EndpointConfig {
    pub fn new(role: Role, side: Side) -> Self {
        Self {
            role,
            side,
            ..Self::default()
        }
    }

    pub fn with_handle_finish(mut self, handle_finish: bool) -> Self {
        self.handle_finish = handle_finish;
        self
    }

    pub fn with_size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    pub fn with_names(mut self, names: ObjectNames) -> Self {
        self.names = names;
        self
    }

    pub fn with_create_policy(mut self, policy: CreatePolicy) -> Self {
        self.create_policy = policy;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Reject configurations that could never establish a channel
    pub fn validate(&self) -> Result<()> {
        let segment = self.names.segment.trim_start_matches('/');
        if segment.is_empty() {
            return Err(LockstepError::InvalidName(self.names.segment.clone()));
        }
        if segment.len() > MAX_SEGMENT_NAME {
            return Err(LockstepError::NameTooLong {
                max: MAX_SEGMENT_NAME,
                got: segment.len(),
            });
        }

        let objects = [
            &self.names.sim_to_agent,
            &self.names.agent_to_sim,
            &self.names.sync,
        ];
        for name in objects {
            if name.is_empty() {
                return Err(LockstepError::InvalidName(name.clone()));
            }
            if name.len() > MAX_OBJECT_NAME {
                return Err(LockstepError::NameTooLong {
                    max: MAX_OBJECT_NAME,
                    got: name.len(),
                });
            }
        }
        if objects[0] == objects[1] || objects[0] == objects[2] || objects[1] == objects[2] {
            return Err(LockstepError::InvalidName(format!(
                "object names must be distinct: {}, {}, {}",
                objects[0], objects[1], objects[2]
            )));
        }

        if self.role == Role::Creator && self.size < MIN_REGION_SIZE {
            return Err(LockstepError::RegionTooSmall {
                min: MIN_REGION_SIZE,
                got: self.size,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EndpointConfig::default();
        assert_eq!(config.size, DEFAULT_REGION_SIZE);
        assert_eq!(config.names.segment, DEFAULT_SEGMENT_NAME);
        assert_eq!(config.create_policy, CreatePolicy::Clobber);
        assert!(config.timeout.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_set_names_keeps_empty() {
        let mut names = ObjectNames::default();
        names.set_names("Seg2", "", "Act", "");
        assert_eq!(names.segment, "Seg2");
        assert_eq!(names.sim_to_agent, DEFAULT_SIM_TO_AGENT_NAME);
        assert_eq!(names.agent_to_sim, "Act");
        assert_eq!(names.sync, DEFAULT_SYNC_NAME);
    }

    #[test]
    fn test_suffix_applies_to_all_names() {
        let names = ObjectNames::default().with_suffix("run7");
        assert_eq!(names.segment, "LockstepSeg_run7");
        assert_eq!(names.sync, "LockstepSync_run7");
        assert_eq!(names.payload(Direction::SimToAgent), "LockstepSimToAgent_run7");
        assert_eq!(names.payload(Direction::AgentToSim), "LockstepAgentToSim_run7");
    }

    #[test]
    fn test_uuid_suffix_fits() {
        let suffix = format!("finish_is_seen_on_next_receive_only_{}", uuid::Uuid::new_v4().simple());
        let config = EndpointConfig::new(Role::Creator, Side::Agent)
            .with_names(ObjectNames::default().with_suffix(&suffix));
        assert!(config.names.sim_to_agent.len() > 63);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_sides_are_mirrored() {
        assert_eq!(Side::Simulation.outbound(), Side::Agent.inbound());
        assert_eq!(Side::Agent.outbound(), Side::Simulation.inbound());
    }

    #[test]
    fn test_validate_rejects_bad_configs() {
        let small = EndpointConfig::default().with_size(128);
        assert!(matches!(
            small.validate(),
            Err(LockstepError::RegionTooSmall { .. })
        ));
        // Attachers take the size from the creator
        let mut attacher = EndpointConfig::new(Role::Attacher, Side::Agent).with_size(0);
        assert!(attacher.validate().is_ok());

        attacher.names.sync = "x".repeat(MAX_OBJECT_NAME + 1);
        assert!(matches!(
            attacher.validate(),
            Err(LockstepError::NameTooLong { .. })
        ));

        attacher.names.sync = attacher.names.sim_to_agent.clone();
        assert!(matches!(
            attacher.validate(),
            Err(LockstepError::InvalidName(_))
        ));
    }
}
