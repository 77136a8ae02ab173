//! Consumer and provider runtimes exchanging protocol messages in process

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::Loopback;
use dataspace_connector::ConnectorRuntime;
use dataspace_connector::config::AppConfig;
use dataspace_connector::dataplane::DataFlowState;
use dataspace_connector::spi::DataAddress;
use dataspace_connector::statemachine::StatefulEntity;
use dataspace_connector::transfer::{TransferProcess, TransferProcessState, TransferRequest};

const CONSUMER: &str = "http://consumer/protocol";
const PROVIDER: &str = "http://provider/protocol";

struct Pair {
    consumer: ConnectorRuntime,
    provider: ConnectorRuntime,
}

async fn pair(provider_config: AppConfig) -> Pair {
    let loopback = Arc::new(Loopback::default());
    let consumer = ConnectorRuntime::builder(common::config("consumer", CONSUMER))
        .dispatcher(loopback.clone())
        .build()
        .await
        .unwrap();
    let provider = ConnectorRuntime::builder(provider_config)
        .dispatcher(loopback.clone())
        .build()
        .await
        .unwrap();
    loopback.connect(CONSUMER, consumer.transfer_processes().clone());
    loopback.connect(PROVIDER, provider.transfer_processes().clone());
    Pair { consumer, provider }
}

impl Pair {
    /// Drive every machine until `done` holds for the consumer's process
    async fn drive<F>(&self, consumer_id: &str, done: F) -> TransferProcess
    where
        F: Fn(&TransferProcess) -> bool,
    {
        let (consumer_tp, _) = self.consumer.state_machines();
        let (provider_tp, provider_df) = self.provider.state_machines();
        for _ in 0..200 {
            consumer_tp.run_once().await;
            provider_tp.run_once().await;
            provider_df.run_once().await;
            let process = self.consumer_process(consumer_id).await;
            if done(&process) {
                return process;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("transfer {consumer_id} did not settle");
    }

    async fn consumer_process(&self, id: &str) -> TransferProcess {
        self.consumer
            .transfer_processes()
            .find_by_id(id)
            .await
            .unwrap()
            .unwrap()
    }

    async fn provider_process(&self, id: &str) -> TransferProcess {
        self.provider
            .transfer_processes()
            .find_by_id(id)
            .await
            .unwrap()
            .unwrap()
    }
}

fn provider_config(source: &str) -> AppConfig {
    let mut config = common::config("provider", PROVIDER);
    config.assets.insert(
        "asset-1".to_string(),
        DataAddress::new("File").with_property("path", source),
    );
    config
}

#[tokio::test]
async fn test_push_file_transfer_completes_on_both_sides() {
    let dir = common::scratch_dir("e2e-push");
    std::fs::create_dir_all(&dir).unwrap();
    let source = dir.join("source.csv");
    let destination = dir.join("received").join("copy.csv");
    std::fs::write(&source, "id,value\n1,42\n").unwrap();

    let pair = pair(provider_config(source.to_str().unwrap())).await;
    let consumer = pair
        .consumer
        .transfer_processes()
        .initiate_consumer(TransferRequest {
            protocol: "dataspace-protocol-http".into(),
            counter_party_address: PROVIDER.into(),
            contract_id: "contract-1".into(),
            asset_id: "asset-1".into(),
            transfer_type: "File-PUSH".into(),
            data_destination: Some(
                DataAddress::new("File").with_property("path", destination.to_str().unwrap()),
            ),
            ..TransferRequest::default()
        })
        .await
        .unwrap();

    let consumer = pair
        .drive(consumer.id(), |p| p.state() == TransferProcessState::Completed)
        .await;
    let provider_id = consumer.correlation_id.clone().unwrap();

    // The provider deprovisions in the same pass that sends the completion message
    let provider = pair.provider_process(&provider_id).await;
    assert_eq!(provider.state(), TransferProcessState::Deprovisioned);
    assert_eq!(provider.correlation_id.as_deref(), Some(consumer.id()));

    let flow = pair
        .provider
        .data_plane()
        .find_by_id(&provider_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(flow.state(), DataFlowState::Notified);
    assert_eq!(flow.owner(), Some("provider"));

    assert_eq!(
        std::fs::read_to_string(&destination).unwrap(),
        "id,value\n1,42\n"
    );
    std::fs::remove_dir_all(&dir).ok();
}

#[tokio::test]
async fn test_pull_transfer_hands_out_endpoint() {
    let pair = pair(provider_config("/srv/data/report.csv")).await;
    let consumer = pair
        .consumer
        .transfer_processes()
        .initiate_consumer(TransferRequest {
            protocol: "dataspace-protocol-http".into(),
            counter_party_address: PROVIDER.into(),
            contract_id: "contract-1".into(),
            asset_id: "asset-1".into(),
            transfer_type: "HttpData-PULL".into(),
            ..TransferRequest::default()
        })
        .await
        .unwrap();

    let consumer = pair
        .drive(consumer.id(), |p| p.state() == TransferProcessState::Started)
        .await;
    let provider_id = consumer.correlation_id.clone().unwrap();

    let endpoint = consumer.content_data_address.as_ref().unwrap();
    assert_eq!(endpoint.type_name, "HttpData");
    assert_eq!(endpoint.property("flowId"), Some(provider_id.as_str()));
    assert_eq!(
        pair.provider_process(&provider_id).await.state(),
        TransferProcessState::Started
    );

    let (_, provider_df) = pair.provider.state_machines();
    provider_df.run_once().await;
    let flow = pair
        .provider
        .data_plane()
        .find_by_id(&provider_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(flow.state(), DataFlowState::Started);
}
