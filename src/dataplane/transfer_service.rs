//! Transfer services
//!
//! A transfer service moves the bytes of a push flow from its source to its
//! destination. The registry picks the first service accepting the pair of address
//! types.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use super::flow::DataFlow;
use crate::spi::DataFlowStartMessage;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamFailure {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Not authorized: {0}")]
    NotAuthorized(String),

    #[error("{0}")]
    General(String),
}

pub type StreamResult<T> = Result<T, StreamFailure>;

#[async_trait]
pub trait TransferService: Send + Sync {
    fn name(&self) -> &str;

    fn can_handle(&self, source_type: &str, destination_type: &str) -> bool;

    /// Reject requests this service cannot execute as given
    fn validate(&self, request: &DataFlowStartMessage) -> StreamResult<()>;

    /// Run the transfer to completion
    async fn transfer(&self, request: DataFlowStartMessage) -> StreamResult<()>;

    /// Stop a running transfer; unknown flows are not an error
    async fn terminate(&self, flow: &DataFlow) -> StreamResult<()>;
}

#[derive(Default)]
pub struct TransferServiceRegistry {
    services: Vec<Arc<dyn TransferService>>,
}

impl TransferServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, service: Arc<dyn TransferService>) {
        self.services.push(service);
    }

    pub fn resolve(&self, request: &DataFlowStartMessage) -> Option<Arc<dyn TransferService>> {
        let source_type = request.source.type_name.as_str();
        let destination_type = request
            .destination
            .as_ref()
            .map(|d| d.type_name.as_str())
            .unwrap_or(request.transfer_type.destination_type.as_str());
        self.services
            .iter()
            .find(|s| s.can_handle(source_type, destination_type))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataplane::flow::tests::start_message;
    use crate::spi::{DataAddress, FlowType};

    struct Fixed(&'static str, &'static str);

    #[async_trait]
    impl TransferService for Fixed {
        fn name(&self) -> &str {
            self.0
        }

        fn can_handle(&self, source_type: &str, destination_type: &str) -> bool {
            source_type == self.1 && destination_type == self.1
        }

        fn validate(&self, _request: &DataFlowStartMessage) -> StreamResult<()> {
            Ok(())
        }

        async fn transfer(&self, _request: DataFlowStartMessage) -> StreamResult<()> {
            Ok(())
        }

        async fn terminate(&self, _flow: &DataFlow) -> StreamResult<()> {
            Ok(())
        }
    }

    #[test]
    fn test_resolve_by_address_types() {
        let mut registry = TransferServiceRegistry::new();
        registry.register(Arc::new(Fixed("http", "HttpData")));
        registry.register(Arc::new(Fixed("file", "File")));

        let message = start_message("df-1", FlowType::Push);
        assert_eq!(registry.resolve(&message).unwrap().name(), "file");

        let mut message = start_message("df-2", FlowType::Push);
        message.destination = Some(DataAddress::new("HttpData"));
        assert!(registry.resolve(&message).is_none());
    }
}
