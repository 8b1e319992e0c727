//! Delivering results back to requesters.

use crate::admission::Request;
use crate::fetcher::FetchResult;
use async_trait::async_trait;
use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Sends replies for finished requests.
#[async_trait]
pub trait Delivery: Send + Sync {
    async fn deliver_result(
        &self,
        request: &Request,
        result: &FetchResult,
    ) -> Result<(), DeliveryError>;

    async fn deliver_failure(&self, request: &Request, error: &str) -> Result<(), DeliveryError>;
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Reply<'a> {
    Result {
        message_id: i64,
        origin_id: i64,
        title: &'a str,
        path: String,
    },
    Failure {
        message_id: i64,
        origin_id: i64,
        error: &'a str,
    },
}

/// Writes one JSON object per reply to a byte sink (stdout in `haul serve`).
pub struct JsonLinesDelivery<W> {
    out: Mutex<W>,
}

impl<W> JsonLinesDelivery<W>
where
    W: AsyncWrite + Send + Unpin,
{
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    async fn write(&self, reply: &Reply<'_>) -> Result<(), DeliveryError> {
        let mut line = serde_json::to_vec(reply)?;
        line.push(b'\n');

        let mut out = self.out.lock().await;
        out.write_all(&line).await?;
        out.flush().await?;
        Ok(())
    }

    /// Consume the delivery and return the sink.
    pub fn into_inner(self) -> W {
        self.out.into_inner()
    }
}

#[async_trait]
impl<W> Delivery for JsonLinesDelivery<W>
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    async fn deliver_result(
        &self,
        request: &Request,
        result: &FetchResult,
    ) -> Result<(), DeliveryError> {
        self.write(&Reply::Result {
            message_id: request.message_id,
            origin_id: request.origin.id,
            title: &result.title,
            path: result.artifact_path.display().to_string(),
        })
        .await
    }

    async fn deliver_failure(&self, request: &Request, error: &str) -> Result<(), DeliveryError> {
        self.write(&Reply::Failure {
            message_id: request.message_id,
            origin_id: request.origin.id,
            error,
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::{Origin, Requester};
    use std::path::PathBuf;

    fn request() -> Request {
        Request {
            message_id: 9,
            text: "https://youtu.be/abc".to_string(),
            requester: Requester {
                id: 42,
                label: "alice".to_string(),
            },
            origin: Origin::private(42),
        }
    }

    #[tokio::test]
    async fn test_writes_one_line_per_reply() {
        let delivery = JsonLinesDelivery::new(Vec::new());
        let result = FetchResult {
            artifact_path: PathBuf::from("/data/a.mp4"),
            title: "A".to_string(),
            scratch_dir: None,
        };
        delivery.deliver_result(&request(), &result).await.unwrap();
        delivery
            .deliver_failure(&request(), "network timeout")
            .await
            .unwrap();

        let out = String::from_utf8(delivery.into_inner()).unwrap();
        let lines: Vec<serde_json::Value> = out
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["type"], "result");
        assert_eq!(lines[0]["path"], "/data/a.mp4");
        assert_eq!(lines[1]["type"], "failure");
        assert_eq!(lines[1]["error"], "network timeout");
        assert_eq!(lines[1]["message_id"], 9);
    }
}
