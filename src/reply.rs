// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Reply Protocol
//!
//! Handlers finish a delivery by sending a `Reply`. The status code decides what happens
//! to the delivery: ack it, dead-letter it, or requeue it for a bounded number of retries.

use serde_json::Value;
use std::collections::BTreeMap;
use tokio::sync::oneshot;

/// Status used when the handler does not set one.
pub const DEFAULT_STATUS: u16 = 200;

/// Class of a reply status, computed by range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    /// 200-299: ack.
    Success,
    /// 400-499: dead-letter and ack.
    ClientError,
    /// 500-599: ack, then requeue until the retry budget is spent.
    ServerError,
    /// Anything else: dead-letter and ack.
    Unrecognized,
}

impl From<u16> for StatusClass {
    fn from(status: u16) -> Self {
        match status {
            200..=299 => StatusClass::Success,
            400..=499 => StatusClass::ClientError,
            500..=599 => StatusClass::ServerError,
            _ => StatusClass::Unrecognized,
        }
    }
}

/// What a handler answered.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Value,
}

impl Response {
    pub fn class(&self) -> StatusClass {
        StatusClass::from(self.status)
    }
}

/// Single-use reply handle given to a route handler.
///
/// `send` consumes the handle, so a delivery can be answered at most once. Dropping the
/// handle without sending leaves the delivery un-acked.
#[derive(Debug)]
pub struct Reply {
    tx: oneshot::Sender<Response>,
    status: u16,
    headers: BTreeMap<String, String>,
}

impl Reply {
    /// Creates a reply handle and the receiver the dispatcher resolves it from.
    pub(crate) fn channel() -> (Reply, oneshot::Receiver<Response>) {
        let (tx, rx) = oneshot::channel();
        (
            Reply {
                tx,
                status: DEFAULT_STATUS,
                headers: BTreeMap::default(),
            },
            rx,
        )
    }

    /// Sets the reply status. Defaults to 200.
    pub fn code(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    pub fn header(mut self, key: &str, value: &str) -> Self {
        self.headers.insert(key.to_owned(), value.to_owned());
        self
    }

    /// Answers the delivery and hands it to the reply protocol.
    ///
    /// # Parameters
    /// * `body` - Sent to the error queue as `response` for 4xx and unrecognized statuses,
    ///   and to the workflow inform topic as `payload`
    pub fn send(self, body: impl Into<Value>) {
        // A closed receiver means the service shut down; nothing is left to resolve.
        let _ = self.tx.send(Response {
            status: self.status,
            headers: self.headers,
            body: body.into(),
        });
    }
}
