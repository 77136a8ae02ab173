//! Minimal entity used by engine unit tests

use serde::{Deserialize, Serialize};

use crate::statemachine::entity::tests::JobState;
use crate::statemachine::{EntityCore, StatefulEntity};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub core: EntityCore<JobState>,
    pub owner: Option<String>,
    pub kind: Option<String>,
}

impl Job {
    pub fn new(id: &str, state: JobState, now: i64) -> Self {
        Self {
            core: EntityCore::new(id, state, now),
            owner: None,
            kind: None,
        }
    }
}

impl StatefulEntity for Job {
    type State = JobState;

    const KIND: &'static str = "job";

    fn core(&self) -> &EntityCore<JobState> {
        &self.core
    }

    fn core_mut(&mut self) -> &mut EntityCore<JobState> {
        &mut self.core
    }

    fn discriminator(&self) -> Option<&str> {
        self.kind.as_deref()
    }

    fn owner(&self) -> Option<&str> {
        self.owner.as_deref()
    }
}
