//! Shared fixtures for the integration suites
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use dataspace_connector::config::AppConfig;
use dataspace_connector::spi::{
    MessageAck, RemoteMessage, RemoteMessageDispatcher, ServiceFailure, StatusResult,
};
use dataspace_connector::statemachine::{EntityCore, StatefulEntity};
use dataspace_connector::transfer::{TransferProcessError, TransferProcessService};

dataspace_connector::entity_states! {
    pub enum TaskState {
        Queued = 100 => "QUEUED",
        Running = 200 => "RUNNING",
        Done = 300 => "DONE",
        Failed = 400 => "FAILED",
    }
    final = [Done, Failed];
}

/// Minimal entity driven through the engine directly
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub core: EntityCore<TaskState>,
}

impl Task {
    pub fn queued(id: &str, now: i64) -> Self {
        Self {
            core: EntityCore::new(id, TaskState::Queued, now),
        }
    }
}

impl StatefulEntity for Task {
    type State = TaskState;

    const KIND: &'static str = "task";

    fn core(&self) -> &EntityCore<TaskState> {
        &self.core
    }

    fn core_mut(&mut self) -> &mut EntityCore<TaskState> {
        &mut self.core
    }
}

/// Minimal runtime configuration with zero retry delays
pub fn config(runtime_id: &str, callback_address: &str) -> AppConfig {
    let yaml = format!(
        r#"
runtime_id: {runtime_id}
participant_id: {runtime_id}
log_level: debug
log_dir: ./logs
log_file: test.log
use_json: false
rotation: never
transfer_process:
  callback_address: {callback_address}
  retry:
    limit: 5
    base_delay_ms: 0
data_plane:
  staleness_threshold_ms: 30000
  heartbeat_interval_ms: 10000
  completion_lease_wait_ms: 10
  retry:
    limit: 5
    base_delay_ms: 0
policies:
  contract-1:
    assigner: provider
"#
    );
    AppConfig::from_yaml(&yaml).expect("valid test config")
}

/// Records every dispatched message and answers with a fixed result, after any
/// failures queued with [`RecordingDispatcher::fail_next`]
pub struct RecordingDispatcher {
    pub sent: Mutex<Vec<RemoteMessage>>,
    queued: Mutex<VecDeque<ServiceFailure>>,
    result: StatusResult<MessageAck>,
}

impl RecordingDispatcher {
    pub fn acking() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            queued: Mutex::new(VecDeque::new()),
            result: Ok(MessageAck::default()),
        }
    }

    pub fn failing(failure: ServiceFailure) -> Self {
        Self {
            result: Err(failure),
            ..Self::acking()
        }
    }

    pub fn fail_next(&self, failure: ServiceFailure) {
        self.queued.lock().unwrap().push_back(failure);
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.sent.lock().unwrap().iter().map(|m| m.name()).collect()
    }

    /// Reasons carried by the dispatched messages named `name`
    pub fn reasons(&self, name: &str) -> Vec<Option<String>> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.name() == name)
            .filter_map(|m| match m {
                RemoteMessage::TransferSuspensionMessage(event)
                | RemoteMessage::TransferTerminationMessage(event) => Some(event.reason.clone()),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl RemoteMessageDispatcher for RecordingDispatcher {
    async fn dispatch(&self, message: RemoteMessage) -> StatusResult<MessageAck> {
        self.sent.lock().unwrap().push(message);
        match self.queued.lock().unwrap().pop_front() {
            Some(failure) => Err(failure),
            None => self.result.clone(),
        }
    }
}

fn to_failure(e: TransferProcessError) -> ServiceFailure {
    match e {
        TransferProcessError::NotFound(_) | TransferProcessError::InvalidRequest(_) => {
            ServiceFailure::fatal(e.to_string())
        }
        _ => ServiceFailure::retry(e.to_string()),
    }
}

/// Delivers protocol messages straight to the addressed connector's service
#[derive(Default)]
pub struct Loopback {
    peers: Mutex<Vec<(String, Arc<TransferProcessService>)>>,
}

impl Loopback {
    pub fn connect(&self, address: &str, service: Arc<TransferProcessService>) {
        self.peers.lock().unwrap().push((address.to_string(), service));
    }

    fn peer(&self, address: &str) -> Option<Arc<TransferProcessService>> {
        self.peers
            .lock()
            .unwrap()
            .iter()
            .find(|(a, _)| a == address)
            .map(|(_, s)| s.clone())
    }
}

#[async_trait]
impl RemoteMessageDispatcher for Loopback {
    async fn dispatch(&self, message: RemoteMessage) -> StatusResult<MessageAck> {
        let peer = self
            .peer(message.counter_party_address())
            .ok_or_else(|| ServiceFailure::fatal("unknown counterparty"))?;
        let result = match message {
            RemoteMessage::TransferRequestMessage(request) => peer
                .notify_requested(request)
                .await
                .map(|p| Some(p.id().to_string())),
            RemoteMessage::TransferStartMessage(start) => peer
                .notify_started(&start.process_id, start.data_address)
                .await
                .map(|_| None),
            RemoteMessage::TransferCompletionMessage(event) => {
                peer.notify_completed(&event.process_id).await.map(|_| None)
            }
            RemoteMessage::TransferSuspensionMessage(event) => peer
                .notify_suspended(&event.process_id, event.reason)
                .await
                .map(|_| None),
            RemoteMessage::TransferTerminationMessage(event) => peer
                .notify_terminated(&event.process_id, event.reason)
                .await
                .map(|_| None),
        };
        result
            .map(|correlation_id| MessageAck { correlation_id })
            .map_err(to_failure)
    }
}

pub fn scratch_dir(name: &str) -> std::path::PathBuf {
    std::env::temp_dir().join(format!(
        "connector-{name}-{}",
        ulid::Ulid::new().to_string().to_lowercase()
    ))
}
