//! In-memory upstream for tests.
//!
//! `MockConnector` plays the connector role for the supervisor; the paired
//! `MockUpstream` hands each accepted connection to the test as a
//! `MockSession` that can read outbound frames and push inbound ones.

use crate::codec::{OutboundFrame, EVENT_HEARTBEAT};
use crate::error::{Error, Result};
use crate::transport::{Connector, Transport};
use crate::types::{CollectionSlug, EventKind};
use async_trait::async_trait;
use futures::channel::mpsc as fmpsc;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Scripted outcome of one connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectPlan {
    Accept,
    Refuse,
    /// Never completes; exercises the handshake timeout.
    Hang,
}

struct MockState {
    plans: VecDeque<ConnectPlan>,
    attempts: Vec<Instant>,
}

#[derive(Clone)]
pub struct MockConnector {
    state: Arc<Mutex<MockState>>,
    sessions: mpsc::UnboundedSender<MockSession>,
}

pub struct MockUpstream {
    sessions: mpsc::UnboundedReceiver<MockSession>,
}

impl MockConnector {
    /// Connector that accepts every attempt unless scripted otherwise.
    pub fn new() -> (Self, MockUpstream) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = Self {
            state: Arc::new(Mutex::new(MockState {
                plans: VecDeque::new(),
                attempts: Vec::new(),
            })),
            sessions: tx,
        };
        (connector, MockUpstream { sessions: rx })
    }

    pub fn plan(&self, plan: ConnectPlan, times: usize) {
        if let Ok(mut state) = self.state.lock() {
            state.plans.extend(std::iter::repeat(plan).take(times));
        }
    }

    /// Instants at which connection attempts were made.
    pub fn attempts(&self) -> Vec<Instant> {
        self.state
            .lock()
            .map(|state| state.attempts.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self) -> Result<Transport> {
        let plan = {
            let mut state = self
                .state
                .lock()
                .map_err(|_| Error::TransportFailure("mock state poisoned".into()))?;
            state.attempts.push(Instant::now());
            state.plans.pop_front().unwrap_or(ConnectPlan::Accept)
        };

        match plan {
            ConnectPlan::Refuse => Err(Error::TransportFailure("connection refused".into())),
            ConnectPlan::Hang => futures::future::pending().await,
            ConnectPlan::Accept => {
                let (out_tx, out_rx) = fmpsc::unbounded::<String>();
                let (in_tx, in_rx) = fmpsc::unbounded::<Result<String>>();
                let _ = self.sessions.send(MockSession {
                    frames: out_rx,
                    inbound: in_tx,
                });
                Ok(Transport {
                    sink: Box::pin(out_tx.sink_map_err(|_| Error::ConnectionClosed)),
                    stream: Box::pin(in_rx),
                })
            }
        }
    }
}

impl MockUpstream {
    /// Next accepted connection.
    pub async fn accept(&mut self) -> MockSession {
        match self.sessions.recv().await {
            Some(session) => session,
            None => panic!("mock connector dropped"),
        }
    }
}

/// Server side of one mock connection.
pub struct MockSession {
    frames: fmpsc::UnboundedReceiver<String>,
    inbound: fmpsc::UnboundedSender<Result<String>>,
}

impl MockSession {
    /// Next frame the client sent, or `None` once the client closed.
    pub async fn next_frame(&mut self) -> Option<OutboundFrame> {
        let text = self.frames.next().await?;
        match serde_json::from_str(&text) {
            Ok(frame) => Some(frame),
            Err(e) => panic!("client sent undecodable frame {}: {}", text, e),
        }
    }

    /// Next frame that is not a heartbeat.
    pub async fn next_request(&mut self) -> Option<OutboundFrame> {
        loop {
            let frame = self.next_frame().await?;
            if frame.event != EVENT_HEARTBEAT {
                return Some(frame);
            }
        }
    }

    pub fn send_text(&self, text: impl Into<String>) {
        let _ = self.inbound.unbounded_send(Ok(text.into()));
    }

    pub fn reply_ok(&self, frame: &OutboundFrame) {
        self.send_text(
            json!({
                "topic": frame.topic,
                "event": "phx_reply",
                "payload": {"status": "ok", "response": {}},
                "ref": frame.reference.to_string(),
            })
            .to_string(),
        );
    }

    pub fn reply_error(&self, frame: &OutboundFrame, reason: &str) {
        self.send_text(
            json!({
                "topic": frame.topic,
                "event": "phx_reply",
                "payload": {"status": "error", "response": {"reason": reason}},
                "ref": frame.reference,
            })
            .to_string(),
        );
    }

    pub fn push_event(&self, kind: EventKind, collection: &CollectionSlug) {
        self.send_text(
            json!({
                "topic": format!("collection:{}", collection),
                "event": kind.wire_name(),
                "payload": {
                    "event_type": kind.wire_name(),
                    "payload": {"collection": {"slug": collection.as_str()}},
                },
                "ref": null,
            })
            .to_string(),
        );
    }

    /// Stop reading from the client; its next send fails.
    pub fn close_outbound(&mut self) {
        self.frames.close();
    }

    /// Break the connection with a transport error.
    pub fn fail(self) {
        let _ = self
            .inbound
            .unbounded_send(Err(Error::TransportFailure("connection reset".into())));
    }
}
