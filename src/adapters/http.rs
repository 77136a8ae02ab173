//! HTTP adapters
//!
//! Status mapping shared by every outgoing call:
//!
//! ```text
//! 2xx                → Ok
//! 4xx                → FATAL_ERROR   (the request itself is wrong)
//! 5xx / transport    → ERROR_RETRY
//! ```

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Serialize;
use tracing::debug;

use crate::dataplane::{DataFlow, TransferProcessApiClient};
use crate::spi::{MessageAck, RemoteMessage, RemoteMessageDispatcher, ServiceFailure, StatusResult};
use crate::statemachine::StatefulEntity;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Classify a response status
pub fn classify_status(status: StatusCode, context: &str, body: &str) -> StatusResult<()> {
    if status.is_success() {
        return Ok(());
    }
    let message = if body.is_empty() {
        format!("{context} returned {status}")
    } else {
        format!("{context} returned {status}: {body}")
    };
    if status.is_client_error() {
        Err(ServiceFailure::fatal(message))
    } else {
        Err(ServiceFailure::retry(message))
    }
}

fn transport_failure(context: &str, err: reqwest::Error) -> ServiceFailure {
    ServiceFailure::retry(format!("{context} failed: {err}"))
}

fn join(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path)
}

/// POST a JSON body; returns the response text of a successful call
async fn post_json<T: Serialize + ?Sized>(
    client: &reqwest::Client,
    url: &str,
    context: &str,
    body: &T,
) -> StatusResult<String> {
    let response = client
        .post(url)
        .json(body)
        .send()
        .await
        .map_err(|e| transport_failure(context, e))?;
    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    classify_status(status, context, &text)?;
    Ok(text)
}

fn build_client() -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()
}

/// Delivers protocol messages to the counterparty's protocol endpoint
pub struct HttpRemoteMessageDispatcher {
    client: reqwest::Client,
}

impl HttpRemoteMessageDispatcher {
    pub fn new() -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: build_client()?,
        })
    }

    /// Path of a message below the counterparty address
    pub fn path(message: &RemoteMessage) -> String {
        let id = message.process_id();
        match message {
            RemoteMessage::TransferRequestMessage(_) => "transfers/request".to_string(),
            RemoteMessage::TransferStartMessage(_) => format!("transfers/{id}/start"),
            RemoteMessage::TransferCompletionMessage(_) => format!("transfers/{id}/completion"),
            RemoteMessage::TransferSuspensionMessage(_) => format!("transfers/{id}/suspension"),
            RemoteMessage::TransferTerminationMessage(_) => format!("transfers/{id}/termination"),
        }
    }
}

#[async_trait]
impl RemoteMessageDispatcher for HttpRemoteMessageDispatcher {
    async fn dispatch(&self, message: RemoteMessage) -> StatusResult<MessageAck> {
        let url = join(message.counter_party_address(), &Self::path(&message));
        debug!(message = message.name(), url = %url, "Dispatching protocol message");

        let body = post_json(&self.client, &url, message.name(), &message).await?;
        if body.trim().is_empty() {
            return Ok(MessageAck::default());
        }
        serde_json::from_str(&body).map_err(|e| {
            ServiceFailure::fatal(format!("{}: invalid acknowledgement: {e}", message.name()))
        })
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FlowNotification<'a> {
    flow_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<&'a str>,
}

/// Reports flow outcomes to the control plane's transfer process API
pub struct HttpControlPlaneClient {
    client: reqwest::Client,
    /// Used when the flow carries no callback address
    default_url: Option<String>,
}

impl HttpControlPlaneClient {
    pub fn new(default_url: Option<String>) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: build_client()?,
            default_url,
        })
    }

    fn endpoint(&self, flow: &DataFlow, action: &str) -> StatusResult<String> {
        let base = flow
            .callback_address
            .as_deref()
            .or(self.default_url.as_deref())
            .ok_or_else(|| {
                ServiceFailure::fatal(format!("No control plane address for flow {}", flow.id()))
            })?;
        Ok(join(base, &format!("transferprocess/{}/{action}", flow.id())))
    }

    async fn send(&self, flow: &DataFlow, action: &str, reason: Option<&str>) -> StatusResult<()> {
        let url = self.endpoint(flow, action)?;
        let body = FlowNotification {
            flow_id: flow.id(),
            reason,
        };
        post_json(&self.client, &url, action, &body).await.map(|_| ())
    }
}

#[async_trait]
impl TransferProcessApiClient for HttpControlPlaneClient {
    async fn provisioned(&self, flow: &DataFlow) -> StatusResult<()> {
        self.send(flow, "provisioned", None).await
    }

    async fn completed(&self, flow: &DataFlow) -> StatusResult<()> {
        self.send(flow, "complete", None).await
    }

    async fn failed(&self, flow: &DataFlow, reason: &str) -> StatusResult<()> {
        self.send(flow, "fail", Some(reason)).await
    }
}
