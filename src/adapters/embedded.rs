//! In-process bridges between the two planes of one runtime

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::dataplane::{DataFlow, DataPlaneError, DataPlaneManager, TransferProcessApiClient};
use crate::spi::{
    DataFlowController, DataFlowResponse, DataFlowStartMessage, ServiceFailure, StatusResult,
};
use crate::statemachine::StatefulEntity;
use crate::transfer::{TransferProcessError, TransferProcessService};

/// Control plane view of a data plane living in the same process
pub struct EmbeddedDataFlowController {
    data_plane: Arc<DataPlaneManager>,
}

impl EmbeddedDataFlowController {
    pub fn new(data_plane: Arc<DataPlaneManager>) -> Self {
        Self { data_plane }
    }
}

#[async_trait]
impl DataFlowController for EmbeddedDataFlowController {
    async fn start(&self, message: DataFlowStartMessage) -> StatusResult<DataFlowResponse> {
        Ok(self.data_plane.start(message).await?)
    }

    async fn suspend(&self, process_id: &str) -> StatusResult<()> {
        self.data_plane.suspend(process_id).await?;
        Ok(())
    }

    async fn terminate(&self, process_id: &str, reason: Option<&str>) -> StatusResult<()> {
        match self
            .data_plane
            .terminate(process_id, reason.map(str::to_string))
            .await
        {
            Ok(_) => Ok(()),
            // Nothing was ever started for this process
            Err(DataPlaneError::NotFound(_)) => {
                debug!(process_id, "No data flow to terminate");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn to_failure(e: TransferProcessError) -> ServiceFailure {
    match e {
        TransferProcessError::NotFound(_) | TransferProcessError::InvalidRequest(_) => {
            ServiceFailure::fatal(e.to_string())
        }
        // A callback may overtake the process it reports on (e.g. still STARTING)
        TransferProcessError::Conflict(_)
        | TransferProcessError::InvalidState { .. }
        | TransferProcessError::DatabaseError(_) => ServiceFailure::retry(e.to_string()),
    }
}

/// Data plane callbacks delivered straight to the local transfer process service
pub struct EmbeddedControlPlaneClient {
    service: Arc<TransferProcessService>,
}

impl EmbeddedControlPlaneClient {
    pub fn new(service: Arc<TransferProcessService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl TransferProcessApiClient for EmbeddedControlPlaneClient {
    async fn provisioned(&self, flow: &DataFlow) -> StatusResult<()> {
        self.service
            .on_data_flow_provisioned(flow.id())
            .await
            .map(|_| ())
            .map_err(to_failure)
    }

    async fn completed(&self, flow: &DataFlow) -> StatusResult<()> {
        self.service
            .on_data_flow_completed(flow.id())
            .await
            .map(|_| ())
            .map_err(to_failure)
    }

    async fn failed(&self, flow: &DataFlow, reason: &str) -> StatusResult<()> {
        self.service
            .on_data_flow_failed(flow.id(), Some(reason.to_string()))
            .await
            .map(|_| ())
            .map_err(to_failure)
    }
}
