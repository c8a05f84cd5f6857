//! Per-exchange lifecycle guard: idle deadline and structural limits.
//!
//! The idle deadline is armed when the exchange starts and pushed forward on
//! every inbound event (head received, body chunk received). Outbound work
//! and handler time do not count as activity. Every suspension point in the
//! pipeline runs under [`ConnectionGuard::within`].

use std::future::Future;
use std::time::Duration;

use http::StatusCode;
use http::header::CONTENT_LENGTH;
use tokio::time::Instant;

use crate::exchange::RequestHead;
use crate::options::ApplicationOptions;
use crate::response::ServiceResponse;

/// The idle deadline passed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct IdleTimeout;

pub struct ConnectionGuard {
    idle: Duration,
    deadline: Instant,
    max_headers: usize,
    max_payload: usize,
    received: usize,
}

impl ConnectionGuard {
    pub fn new(opts: &ApplicationOptions) -> Self {
        let idle = opts.idle_timeout();
        Self {
            idle,
            deadline: Instant::now() + idle,
            max_headers: opts.max_headers,
            max_payload: opts.max_payload_bytes,
            received: 0,
        }
    }

    /// Records inbound activity.
    pub fn touch(&mut self) {
        self.deadline = Instant::now() + self.idle;
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Runs `fut` until it completes or the idle deadline passes.
    pub async fn within<F: Future>(&self, fut: F) -> Result<F::Output, IdleTimeout> {
        tokio::time::timeout_at(self.deadline, fut).await.map_err(|_| IdleTimeout)
    }

    /// Header-count cap and declared `content-length` cap.
    pub fn check_head(&self, head: &RequestHead) -> Result<(), ServiceResponse> {
        let count = head.headers.len();
        if count > self.max_headers {
            return Err(ServiceResponse::error(
                StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE,
                format!("{count} headers exceed the limit of {}", self.max_headers),
            ));
        }
        let declared = head
            .headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<usize>().ok());
        match declared {
            Some(len) if len > self.max_payload => Err(self.too_large()),
            _ => Ok(()),
        }
    }

    /// Accounts for one body chunk against the payload cap.
    pub fn accept_chunk(&mut self, len: usize) -> Result<(), ServiceResponse> {
        self.received = self.received.saturating_add(len);
        if self.received > self.max_payload {
            return Err(self.too_large());
        }
        Ok(())
    }

    fn too_large(&self) -> ServiceResponse {
        ServiceResponse::error(
            StatusCode::PAYLOAD_TOO_LARGE,
            format!("payload exceeds the limit of {} bytes", self.max_payload),
        )
    }
}
