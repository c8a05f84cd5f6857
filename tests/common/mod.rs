//! Scripted transport for driving the pipeline without sockets.
//!
//! Delays are virtual: tests run with `start_paused = true`, so tokio jumps
//! the clock whenever every task is waiting on a timer.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::io;
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use http::header::{HeaderName, HeaderValue};
use portico::{Exchange, HeaderMap, Method, RequestHead, StatusCode};
use serde_json::Value;

pub struct Scripted {
    head: Option<RequestHead>,
    head_delay: Duration,
    chunks: VecDeque<(Duration, Bytes)>,
    stall_body_write: bool,

    pub status: Option<StatusCode>,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub aborted: bool,
}

impl Scripted {
    pub fn new(method: Method, path: &str) -> Self {
        Self {
            head: Some(RequestHead::new(method, path)),
            head_delay: Duration::ZERO,
            chunks: VecDeque::new(),
            stall_body_write: false,
            status: None,
            headers: HeaderMap::new(),
            body: None,
            aborted: false,
        }
    }

    pub fn get(path: &str) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: &str) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        let head = self.head.as_mut().expect("head already taken");
        head.headers.append(
            HeaderName::from_bytes(name.as_bytes()).unwrap(),
            HeaderValue::from_str(value).unwrap(),
        );
        self
    }

    pub fn head_after(mut self, delay: Duration) -> Self {
        self.head_delay = delay;
        self
    }

    pub fn body(self, bytes: impl Into<Bytes>) -> Self {
        self.chunk_after(Duration::ZERO, bytes)
    }

    pub fn chunk_after(mut self, delay: Duration, bytes: impl Into<Bytes>) -> Self {
        self.chunks.push_back((delay, bytes.into()));
        self
    }

    /// Accept the response head, then never finish writing the body.
    pub fn stall_body_write(mut self) -> Self {
        self.stall_body_write = true;
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status.expect("no response head was sent")
    }

    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn text(&self) -> String {
        String::from_utf8(self.body.clone().unwrap_or_default().to_vec()).unwrap()
    }

    pub fn json(&self) -> Value {
        serde_json::from_slice(self.body.as_deref().unwrap_or_default()).unwrap()
    }
}

impl Exchange for Scripted {
    fn receive_head(&mut self) -> BoxFuture<'_, io::Result<RequestHead>> {
        Box::pin(async move {
            tokio::time::sleep(self.head_delay).await;
            self.head.take().ok_or_else(|| io::Error::other("head already taken"))
        })
    }

    fn next_chunk(&mut self) -> BoxFuture<'_, io::Result<Option<Bytes>>> {
        Box::pin(async move {
            let Some((delay, _)) = self.chunks.front() else {
                return Ok(None);
            };
            tokio::time::sleep(*delay).await;
            Ok(self.chunks.pop_front().map(|(_, bytes)| bytes))
        })
    }

    fn send_head(&mut self, status: StatusCode, headers: HeaderMap) -> BoxFuture<'_, io::Result<()>> {
        self.status = Some(status);
        self.headers = headers;
        Box::pin(async { Ok(()) })
    }

    fn send_body(&mut self, body: Bytes) -> BoxFuture<'_, io::Result<()>> {
        Box::pin(async move {
            if self.stall_body_write {
                std::future::pending::<()>().await;
            }
            self.body = Some(body);
            Ok(())
        })
    }

    fn abort(&mut self) {
        self.aborted = true;
    }
}
