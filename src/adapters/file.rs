//! Local file system transfer service

use std::path::Path;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::dataplane::{DataFlow, StreamFailure, StreamResult, TransferService};
use crate::spi::{DataAddress, DataFlowStartMessage};
use crate::statemachine::StatefulEntity;

pub const FILE_TYPE: &str = "File";
const PATH_PROPERTY: &str = "path";

fn path_of<'a>(address: &'a DataAddress, role: &str) -> StreamResult<&'a str> {
    address
        .property(PATH_PROPERTY)
        .filter(|p| !p.is_empty())
        .ok_or_else(|| StreamFailure::General(format!("{role} address has no path")))
}

/// Copies a `File` source to a `File` destination
#[derive(Debug, Default)]
pub struct FileTransferService;

impl FileTransferService {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TransferService for FileTransferService {
    fn name(&self) -> &str {
        "file"
    }

    fn can_handle(&self, source_type: &str, destination_type: &str) -> bool {
        source_type == FILE_TYPE && destination_type == FILE_TYPE
    }

    fn validate(&self, request: &DataFlowStartMessage) -> StreamResult<()> {
        path_of(&request.source, "source")?;
        let destination = request
            .destination
            .as_ref()
            .ok_or_else(|| StreamFailure::General("push transfer without destination".into()))?;
        path_of(destination, "destination")?;
        Ok(())
    }

    async fn transfer(&self, request: DataFlowStartMessage) -> StreamResult<()> {
        self.validate(&request)?;
        let source = path_of(&request.source, "source")?;
        let destination = request
            .destination
            .as_ref()
            .map(|d| path_of(d, "destination"))
            .transpose()?
            .unwrap_or_default();

        if !tokio::fs::try_exists(source).await.unwrap_or(false) {
            return Err(StreamFailure::NotFound(source.to_string()));
        }
        if let Some(parent) = Path::new(destination).parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StreamFailure::General(format!("{}: {e}", parent.display())))?;
        }

        let bytes = tokio::fs::copy(source, destination)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::PermissionDenied => {
                    StreamFailure::NotAuthorized(destination.to_string())
                }
                _ => StreamFailure::General(format!("copy {source} -> {destination}: {e}")),
            })?;
        info!(flow_id = %request.process_id, source, destination, bytes, "File transfer finished");
        Ok(())
    }

    async fn terminate(&self, flow: &DataFlow) -> StreamResult<()> {
        // A copy runs to completion; its late result is ignored once the flow left STARTED
        debug!(flow_id = %flow.id(), "File transfer termination requested");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataplane::flow::tests::start_message;
    use crate::spi::FlowType;

    fn scratch_dir() -> std::path::PathBuf {
        std::env::temp_dir().join(format!(
            "connector-file-{}",
            ulid::Ulid::new().to_string().to_lowercase()
        ))
    }

    #[test]
    fn test_validate_requires_paths() {
        let service = FileTransferService::new();
        assert!(service.validate(&start_message("df-1", FlowType::Push)).is_ok());

        let mut message = start_message("df-1", FlowType::Push);
        message.destination = Some(DataAddress::new(FILE_TYPE));
        assert!(service.validate(&message).is_err());

        message.destination = None;
        assert!(service.validate(&message).is_err());
    }

    #[tokio::test]
    async fn test_copies_file() {
        let dir = scratch_dir();
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let source = dir.join("in.csv");
        let destination = dir.join("nested/out.csv");
        tokio::fs::write(&source, b"a,b\n1,2\n").await.unwrap();

        let mut message = start_message("df-1", FlowType::Push);
        message.source = DataAddress::new(FILE_TYPE)
            .with_property(PATH_PROPERTY, source.to_string_lossy());
        message.destination = Some(
            DataAddress::new(FILE_TYPE)
                .with_property(PATH_PROPERTY, destination.to_string_lossy()),
        );

        FileTransferService::new().transfer(message).await.unwrap();
        assert_eq!(tokio::fs::read(&destination).await.unwrap(), b"a,b\n1,2\n");
        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_source_is_not_found() {
        let dir = scratch_dir();
        let mut message = start_message("df-1", FlowType::Push);
        message.source = DataAddress::new(FILE_TYPE)
            .with_property(PATH_PROPERTY, dir.join("missing.csv").to_string_lossy());
        message.destination = Some(
            DataAddress::new(FILE_TYPE)
                .with_property(PATH_PROPERTY, dir.join("out.csv").to_string_lossy()),
        );

        let err = FileTransferService::new().transfer(message).await.unwrap_err();
        assert!(matches!(err, StreamFailure::NotFound(_)));
    }
}
