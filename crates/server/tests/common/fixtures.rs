//! Test fakes for the fetcher and delivery seams.

use async_trait::async_trait;
use haul_server::delivery::{Delivery, DeliveryError};
use haul_server::fetcher::{FetchError, FetchResult, Fetcher};
use haul_server::{Origin, Request, Requester};
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Build a private-chat request from `user_id`.
#[allow(dead_code)]
pub fn private_request(message_id: i64, user_id: i64, text: &str) -> Request {
    Request {
        message_id,
        text: text.to_string(),
        requester: Requester {
            id: user_id,
            label: format!("user{user_id}"),
        },
        origin: Origin::private(user_id),
    }
}

/// Build a request sent by `user_id` in group `group_id`.
#[allow(dead_code)]
pub fn group_request(message_id: i64, user_id: i64, group_id: i64, text: &str) -> Request {
    Request {
        message_id,
        text: text.to_string(),
        requester: Requester {
            id: user_id,
            label: format!("user{user_id}"),
        },
        origin: Origin::group(group_id, "test group"),
    }
}

/// Fetcher that fabricates results after a delay and counts invocations.
#[allow(dead_code)]
pub struct FakeFetcher {
    pub calls: AtomicUsize,
    pub urls: Mutex<Vec<String>>,
    pub delay: Duration,
    /// Fail every fetch with this message.
    pub fail_with: Option<String>,
}

#[allow(dead_code)]
impl FakeFetcher {
    pub fn new(delay: Duration) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            urls: Mutex::new(Vec::new()),
            delay,
            fail_with: None,
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            fail_with: Some(message.to_string()),
            ..Self::new(Duration::ZERO)
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Fetcher for FakeFetcher {
    async fn fetch(
        &self,
        url: &str,
        _credentials: Option<&str>,
        cancel: CancellationToken,
    ) -> Result<FetchResult, FetchError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.urls.lock().unwrap().push(url.to_string());

        tokio::select! {
            _ = tokio::time::sleep(self.delay) => {}
            _ = cancel.cancelled() => return Err(FetchError::Cancelled),
        }

        if let Some(message) = &self.fail_with {
            return Err(FetchError::Output(message.clone()));
        }
        Ok(FetchResult {
            artifact_path: PathBuf::from(format!("/downloads/{n}.mp4")),
            title: format!("video {n}"),
            scratch_dir: None,
        })
    }
}

/// A reply captured by [`RecordingDelivery`].
#[allow(dead_code)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Result { message_id: i64, title: String },
    Failure { message_id: i64, error: String },
}

#[allow(dead_code)]
#[derive(Default)]
pub struct RecordingDelivery {
    pub replies: Mutex<Vec<Reply>>,
}

#[allow(dead_code)]
impl RecordingDelivery {
    pub fn replies(&self) -> Vec<Reply> {
        self.replies.lock().unwrap().clone()
    }
}

#[async_trait]
impl Delivery for RecordingDelivery {
    async fn deliver_result(
        &self,
        request: &Request,
        result: &FetchResult,
    ) -> Result<(), DeliveryError> {
        self.replies.lock().unwrap().push(Reply::Result {
            message_id: request.message_id,
            title: result.title.clone(),
        });
        Ok(())
    }

    async fn deliver_failure(&self, request: &Request, error: &str) -> Result<(), DeliveryError> {
        self.replies.lock().unwrap().push(Reply::Failure {
            message_id: request.message_id,
            error: error.to_string(),
        });
        Ok(())
    }
}
