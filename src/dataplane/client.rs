//! Data plane → control plane notifications

use async_trait::async_trait;

use super::flow::DataFlow;
use crate::spi::StatusResult;

/// Reports flow outcomes to the transfer process owning the flow
#[async_trait]
pub trait TransferProcessApiClient: Send + Sync {
    /// Data plane resources are ready; the control plane may start the flow again
    async fn provisioned(&self, flow: &DataFlow) -> StatusResult<()>;

    async fn completed(&self, flow: &DataFlow) -> StatusResult<()>;

    async fn failed(&self, flow: &DataFlow, reason: &str) -> StatusResult<()>;
}
