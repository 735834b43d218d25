use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::{Communication, CommunicationError};
use crate::sync::protocol::{PeerMessage, SyncProtocol};

/// Content type of a protocol frame on the wire
pub const FRAME_CONTENT_TYPE: &str = "application/octet-stream";

/// Posts protocol frames to `<host>/sync`.
#[derive(Debug, Clone)]
pub struct HttpCommunication {
    client: reqwest::Client,
}

impl HttpCommunication {
    pub fn new(timeout: Duration) -> Result<Self, CommunicationError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CommunicationError::Client(e.to_string()))?;
        Ok(Self { client })
    }

    fn endpoint(host: &str) -> String {
        format!("{}/sync", host.trim_end_matches('/'))
    }
}

#[async_trait]
impl Communication for HttpCommunication {
    async fn send(&self, host: &str, message: &PeerMessage) -> Result<(), CommunicationError> {
        let frame = SyncProtocol::encode(message)?;

        let response = self
            .client
            .post(Self::endpoint(host))
            .header(reqwest::header::CONTENT_TYPE, FRAME_CONTENT_TYPE)
            .body(frame)
            .send()
            .await
            .map_err(|e| {
                debug!("POST to {} failed: {}", host, e);
                CommunicationError::PeerUnreachable(host.to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(CommunicationError::Rejected {
                host: host.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(())
    }
}
