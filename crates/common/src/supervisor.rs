//! Connection supervisor: handshake timeout, heartbeats, failure detection,
//! exponential-backoff reconnection with an attempt ceiling, and periodic
//! connection rotation.

use crate::codec;
use crate::error::{Error, Result};
use crate::messages::ControlCommand;
use crate::outbox::Outbox;
use crate::transport::{Connector, FrameSink, Transport};
use crate::types::ConnectionState;
use crate::ws_handler::WsHandler;
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, interval_at, sleep, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Stand-in deadline for timers that are disarmed.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365);

/// Configuration for the connection supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Bound on reaching `connected` for one attempt.
    pub handshake_timeout: Duration,
    /// Delay before the first heartbeat of a connection.
    pub heartbeat_initial_delay: Duration,
    /// Interval between heartbeats.
    pub heartbeat_interval: Duration,
    /// Delay after the first failure; doubles per consecutive failure.
    pub reconnect_base_delay: Duration,
    /// Maximum reconnection delay.
    pub max_reconnect_delay: Duration,
    /// Consecutive failures after which automatic reconnection stops.
    pub max_reconnect_attempts: u32,
    /// Proactive close-and-reconnect period; `None` disables rotation.
    pub rotation_interval: Option<Duration>,
    /// Spacing between throttled handler work (reconciliation joins).
    pub join_throttle: Duration,
    /// Label for logs and metrics.
    pub label: String,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            heartbeat_initial_delay: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(30),
            reconnect_base_delay: Duration::from_secs(5),
            max_reconnect_delay: Duration::from_secs(30),
            max_reconnect_attempts: 5,
            rotation_interval: Some(Duration::from_secs(300)),
            join_throttle: Duration::from_millis(500),
            label: "feed".to_string(),
        }
    }
}

impl SupervisorConfig {
    /// Delay before retrying after `attempt` consecutive failures (1-based).
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.reconnect_base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_reconnect_delay)
    }
}

enum SessionEnd {
    Shutdown,
    Rotated,
    Failed(Error),
}

/// Owns the transport connection and drives a [`WsHandler`].
///
/// Runs as a single task: handler callbacks, command handling and every
/// timer are serviced from one `select!` loop, so the handler is the only
/// writer of its own state.
pub struct ConnectionSupervisor<C: Connector, H: WsHandler> {
    connector: C,
    handler: H,
    config: SupervisorConfig,
    command_rx: mpsc::Receiver<ControlCommand>,
    state_tx: watch::Sender<ConnectionState>,
    generation: u64,
    stopped: bool,
}

impl<C: Connector, H: WsHandler> ConnectionSupervisor<C, H> {
    pub fn new(
        connector: C,
        handler: H,
        config: SupervisorConfig,
        command_rx: mpsc::Receiver<ControlCommand>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            connector,
            handler,
            config,
            command_rx,
            state_tx,
            generation: 0,
            stopped: false,
        }
    }

    /// Observe connection state changes.
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    fn set_state(&self, state: ConnectionState) {
        gauge!("feed_connection_state", "feed" => self.config.label.clone()).set(state.as_gauge());
        self.state_tx.send_replace(state);
    }

    /// Run until shutdown. Returns `ReconnectionExhausted` if automatic
    /// reconnection gave up before the shutdown arrived.
    pub async fn run(mut self) -> Result<()> {
        let mut failures: u32 = 0;

        let result = loop {
            self.set_state(ConnectionState::Connecting);
            let end = match self.connect().await {
                Ok(Some(transport)) => {
                    failures = 0;
                    self.run_session(transport).await
                }
                Ok(None) => SessionEnd::Shutdown,
                Err(e) => SessionEnd::Failed(e),
            };

            match end {
                SessionEnd::Shutdown => break Ok(()),
                SessionEnd::Rotated => continue,
                SessionEnd::Failed(e) => {
                    failures += 1;
                    counter!("feed_errors_total", "feed" => self.config.label.clone(), "error_type" => e.kind()).increment(1);

                    if failures >= self.config.max_reconnect_attempts {
                        error!(
                            "[{}] Connection failed: {}; giving up after {} consecutive failures, restart required",
                            self.config.label, e, failures
                        );
                        self.set_state(ConnectionState::Exhausted);
                        self.handler.on_exhausted(failures).await;
                        self.idle_until_shutdown().await;
                        break Err(Error::ReconnectionExhausted { attempts: failures });
                    }

                    let delay = self.config.backoff_delay(failures);
                    warn!(
                        "[{}] Connection failed: {}, reconnecting in {:?} (attempt {}/{})",
                        self.config.label, e, delay, failures, self.config.max_reconnect_attempts
                    );
                    counter!("feed_reconnect_attempts_total", "feed" => self.config.label.clone()).increment(1);
                    self.set_state(ConnectionState::Disconnected);

                    if !self.wait_backoff(delay).await {
                        break Ok(());
                    }
                }
            }
        };

        self.stop_handler().await;
        if *self.state_tx.borrow() != ConnectionState::Exhausted {
            self.set_state(ConnectionState::Disconnected);
        }
        info!("[{}] Supervisor stopped", self.config.label);
        result
    }

    /// One connection attempt bounded by the handshake timeout. Commands that
    /// arrive meanwhile are handled offline. `Ok(None)` means shutdown.
    async fn connect(&mut self) -> Result<Option<Transport>> {
        info!("[{}] Connecting to feed", self.config.label);
        let handshake_timeout = self.config.handshake_timeout;
        let connect = tokio::time::timeout(handshake_timeout, self.connector.connect());
        tokio::pin!(connect);

        loop {
            tokio::select! {
                result = &mut connect => {
                    return match result {
                        Ok(Ok(transport)) => Ok(Some(transport)),
                        Ok(Err(e)) => Err(e),
                        Err(_) => Err(Error::TransportFailure(format!(
                            "handshake not completed within {:?}",
                            handshake_timeout
                        ))),
                    };
                }
                cmd = self.command_rx.recv() => match cmd {
                    Some(ControlCommand::Shutdown) | None => return Ok(None),
                    Some(cmd) => self.handler.handle_command(cmd, None).await,
                }
            }
        }
    }

    async fn run_session(&mut self, transport: Transport) -> SessionEnd {
        let Transport {
            mut sink,
            mut stream,
        } = transport;
        self.generation += 1;
        let label = self.config.label.clone();

        self.set_state(ConnectionState::Connected);
        info!("[{}] Feed connected (generation {})", label, self.generation);

        let mut outbox = Outbox::new(self.generation);
        self.handler.on_connected(&mut outbox).await;

        let mut heartbeat = interval_at(
            Instant::now() + self.config.heartbeat_initial_delay,
            self.config.heartbeat_interval,
        );
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut pace = interval(self.config.join_throttle);
        pace.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let rotation = sleep(self.config.rotation_interval.unwrap_or(FAR_FUTURE));
        tokio::pin!(rotation);
        let rotates = self.config.rotation_interval.is_some();

        let end = loop {
            if let Err(e) = flush(&mut sink, &mut outbox).await {
                break SessionEnd::Failed(e);
            }

            let deadline = self.handler.next_deadline();
            let wake = sleep_until(deadline.unwrap_or_else(|| Instant::now() + FAR_FUTURE));

            tokio::select! {
                frame = stream.next() => match frame {
                    Some(Ok(text)) => {
                        counter!("feed_frames_received_total", "feed" => label.clone()).increment(1);
                        match codec::decode(&text) {
                            Ok(frame) => self.handler.on_frame(frame, &mut outbox).await,
                            Err(e) => {
                                warn!("[{}] Dropping frame: {}", label, e);
                                counter!("feed_errors_total", "feed" => label.clone(), "error_type" => e.kind()).increment(1);
                            }
                        }
                    }
                    Some(Err(e)) => break SessionEnd::Failed(e),
                    None => {
                        info!("[{}] Feed stream ended", label);
                        break SessionEnd::Failed(Error::ConnectionClosed);
                    }
                },

                cmd = self.command_rx.recv() => match cmd {
                    Some(ControlCommand::Shutdown) | None => {
                        info!("[{}] Received shutdown command", label);
                        self.set_state(ConnectionState::Draining);
                        let _ = flush(&mut sink, &mut outbox).await;
                        let _ = sink.close().await;
                        break SessionEnd::Shutdown;
                    }
                    Some(cmd) => self.handler.handle_command(cmd, Some(&mut outbox)).await,
                },

                _ = heartbeat.tick() => {
                    let reference = outbox.heartbeat();
                    debug!("[{}] Sending heartbeat {}", label, reference);
                }

                _ = pace.tick(), if self.handler.has_paced_work() => {
                    self.handler.on_pace(&mut outbox);
                }

                _ = wake, if deadline.is_some() => {
                    self.handler.on_deadline(Instant::now());
                }

                _ = &mut rotation, if rotates => {
                    info!("[{}] Rotating feed connection", label);
                    self.set_state(ConnectionState::Draining);
                    let _ = flush(&mut sink, &mut outbox).await;
                    let _ = sink.close().await;
                    break SessionEnd::Rotated;
                }
            }
        };

        // Waiters are cancelled, not deferred to a reconnect that never comes.
        if matches!(end, SessionEnd::Shutdown) {
            self.stop_handler().await;
        }
        self.set_state(ConnectionState::Disconnected);
        let reason = match &end {
            SessionEnd::Shutdown => "shutdown".to_string(),
            SessionEnd::Rotated => "rotation".to_string(),
            SessionEnd::Failed(e) => e.to_string(),
        };
        self.handler.on_disconnected(&reason).await;
        end
    }

    async fn stop_handler(&mut self) {
        if !self.stopped {
            self.stopped = true;
            self.handler.on_shutdown().await;
        }
    }

    /// Sleep out a backoff delay while servicing commands offline.
    /// Returns `false` if shutdown was requested.
    async fn wait_backoff(&mut self, delay: Duration) -> bool {
        let backoff = sleep(delay);
        tokio::pin!(backoff);

        loop {
            tokio::select! {
                _ = &mut backoff => return true,
                cmd = self.command_rx.recv() => match cmd {
                    Some(ControlCommand::Shutdown) | None => return false,
                    Some(cmd) => self.handler.handle_command(cmd, None).await,
                }
            }
        }
    }

    async fn idle_until_shutdown(&mut self) {
        while let Some(cmd) = self.command_rx.recv().await {
            match cmd {
                ControlCommand::Shutdown => return,
                cmd => self.handler.handle_command(cmd, None).await,
            }
        }
    }
}

async fn flush(sink: &mut FrameSink, outbox: &mut Outbox) -> Result<()> {
    for frame in outbox.drain() {
        sink.send(frame.encode()?).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::InboundFrame;
    use crate::testing::{ConnectPlan, MockConnector};
    use async_trait::async_trait;

    /// Handler that reports lifecycle callbacks on a channel.
    struct RecordingHandler {
        events: mpsc::UnboundedSender<String>,
    }

    #[async_trait]
    impl WsHandler for RecordingHandler {
        async fn on_connected(&mut self, outbox: &mut Outbox) {
            let _ = self.events.send(format!("connected:{}", outbox.generation()));
        }

        async fn on_frame(&mut self, _frame: InboundFrame, _outbox: &mut Outbox) {
            let _ = self.events.send("frame".to_string());
        }

        async fn on_disconnected(&mut self, reason: &str) {
            let _ = self.events.send(format!("disconnected:{}", reason));
        }

        async fn on_exhausted(&mut self, attempts: u32) {
            let _ = self.events.send(format!("exhausted:{}", attempts));
        }

        async fn handle_command(&mut self, _cmd: ControlCommand, _outbox: Option<&mut Outbox>) {}

        async fn on_shutdown(&mut self) {
            let _ = self.events.send("shutdown".to_string());
        }
    }

    struct Harness {
        command_tx: mpsc::Sender<ControlCommand>,
        state: watch::Receiver<ConnectionState>,
        events: mpsc::UnboundedReceiver<String>,
        task: tokio::task::JoinHandle<Result<()>>,
    }

    fn start(connector: MockConnector, config: SupervisorConfig) -> Harness {
        let (events_tx, events) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::channel(8);
        let supervisor = ConnectionSupervisor::new(
            connector,
            RecordingHandler { events: events_tx },
            config,
            command_rx,
        );
        let state = supervisor.state();
        let task = tokio::spawn(supervisor.run());
        Harness {
            command_tx,
            state,
            events,
            task,
        }
    }

    fn gaps(attempts: &[Instant]) -> Vec<Duration> {
        attempts.windows(2).map(|w| w[1] - w[0]).collect()
    }

    #[test]
    fn test_backoff_delays() {
        let config = SupervisorConfig::default();
        let delays: Vec<Duration> = (1..=8).map(|a| config.backoff_delay(a)).collect();
        assert_eq!(delays[0], Duration::from_secs(5));
        assert_eq!(delays[1], Duration::from_secs(10));
        assert_eq!(delays[2], Duration::from_secs(20));
        assert_eq!(delays[3], Duration::from_secs(30));
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert!(delays.iter().all(|d| *d <= Duration::from_secs(30)));
        assert_eq!(config.backoff_delay(u32::MAX), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_five_failures() {
        let (connector, _upstream) = MockConnector::new();
        connector.plan(ConnectPlan::Refuse, 10);
        let mut harness = start(connector.clone(), SupervisorConfig::default());

        harness
            .state
            .wait_for(|s| *s == ConnectionState::Exhausted)
            .await
            .unwrap();
        assert_eq!(harness.events.recv().await.as_deref(), Some("exhausted:5"));

        // No automatic attempt after the ceiling, however long we wait.
        tokio::time::sleep(Duration::from_secs(600)).await;
        let attempts = connector.attempts();
        assert_eq!(attempts.len(), 5);
        assert_eq!(
            gaps(&attempts),
            vec![
                Duration::from_secs(5),
                Duration::from_secs(10),
                Duration::from_secs(20),
                Duration::from_secs(30),
            ]
        );

        harness.command_tx.send(ControlCommand::Shutdown).await.unwrap();
        let result = harness.task.await.unwrap();
        assert!(matches!(result, Err(Error::ReconnectionExhausted { attempts: 5 })));
        assert_eq!(*harness.state.borrow(), ConnectionState::Exhausted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_timeout_counts_as_failure() {
        let (connector, mut upstream) = MockConnector::new();
        connector.plan(ConnectPlan::Hang, 1);
        let _harness = start(connector.clone(), SupervisorConfig::default());

        let _session = upstream.accept().await;
        // 10s handshake timeout, then the first 5s backoff.
        assert_eq!(gaps(&connector.attempts()), vec![Duration::from_secs(15)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_schedule() {
        let (connector, mut upstream) = MockConnector::new();
        let _harness = start(connector, SupervisorConfig::default());

        let mut session = upstream.accept().await;
        let connected_at = Instant::now();

        let first = session.next_frame().await.unwrap();
        assert_eq!(first.topic, "phoenix");
        assert_eq!(first.event, "heartbeat");
        assert_eq!(Instant::now() - connected_at, Duration::from_secs(1));

        let second = session.next_frame().await.unwrap();
        assert_eq!(second.event, "heartbeat");
        assert!(second.reference > first.reference);
        assert_eq!(Instant::now() - connected_at, Duration::from_secs(31));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_keeps_a_single_heartbeat_schedule() {
        let (connector, mut upstream) = MockConnector::new();
        let _harness = start(connector, SupervisorConfig::default());

        let mut first = upstream.accept().await;
        assert_eq!(first.next_frame().await.unwrap().event, "heartbeat");
        first.fail();

        let mut second = upstream.accept().await;
        let connected_at = Instant::now();
        let mut beats = Vec::new();
        for _ in 0..4 {
            let frame = second.next_frame().await.unwrap();
            assert_eq!(frame.event, "heartbeat");
            beats.push(Instant::now() - connected_at);
        }
        assert_eq!(
            beats,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(31),
                Duration::from_secs(61),
                Duration::from_secs(91),
            ]
        );
        let extra = tokio::time::timeout(Duration::from_secs(29), second.next_frame()).await;
        assert!(extra.is_err(), "unexpected frame {:?}", extra);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_send_ends_session_and_backs_off() {
        let (connector, mut upstream) = MockConnector::new();
        let mut harness = start(connector.clone(), SupervisorConfig::default());

        let mut first = upstream.accept().await;
        assert_eq!(harness.events.recv().await.as_deref(), Some("connected:1"));
        first.close_outbound();

        let _second = upstream.accept().await;
        // The heartbeat at 1s cannot be sent, then the first 5s backoff.
        assert_eq!(gaps(&connector.attempts()), vec![Duration::from_secs(6)]);
        let disconnected = harness.events.recv().await.unwrap();
        assert!(disconnected.starts_with("disconnected:"), "{}", disconnected);
        assert_ne!(disconnected, "disconnected:rotation");
        assert_eq!(harness.events.recv().await.as_deref(), Some("connected:2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_frame_is_dropped_without_disconnect() {
        let (connector, mut upstream) = MockConnector::new();
        let mut harness = start(connector.clone(), SupervisorConfig::default());

        let mut session = upstream.accept().await;
        assert_eq!(harness.events.recv().await.as_deref(), Some("connected:1"));

        session.send_text("not json");
        session.send_text(r#"{"topic":"phoenix","event":"phx_reply","payload":{},"ref":"9"}"#);
        let heartbeat = session.next_frame().await.unwrap();
        session.reply_ok(&heartbeat);

        // Only the well-formed reply reaches the handler.
        assert_eq!(harness.events.recv().await.as_deref(), Some("frame"));
        assert_eq!(*harness.state.borrow(), ConnectionState::Connected);
        assert_eq!(connector.attempts().len(), 1);
        assert!(harness.events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_attempt_counter() {
        let (connector, mut upstream) = MockConnector::new();
        connector.plan(ConnectPlan::Refuse, 2);
        let mut harness = start(connector.clone(), SupervisorConfig::default());

        let session = upstream.accept().await;
        assert_eq!(harness.events.recv().await.as_deref(), Some("connected:1"));
        session.fail();

        let _session = upstream.accept().await;
        let gaps = gaps(&connector.attempts());
        // 5s, 10s for the refusals, then back to 5s after the dropped session.
        assert_eq!(
            gaps,
            vec![
                Duration::from_secs(5),
                Duration::from_secs(10),
                Duration::from_secs(5),
            ]
        );
        assert!(harness
            .events
            .recv()
            .await
            .unwrap()
            .starts_with("disconnected:"));
        assert_eq!(harness.events.recv().await.as_deref(), Some("connected:2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rotation_reconnects_without_backoff() {
        let (connector, mut upstream) = MockConnector::new();
        let config = SupervisorConfig {
            rotation_interval: Some(Duration::from_secs(60)),
            ..Default::default()
        };
        let mut harness = start(connector.clone(), config);

        let mut first = upstream.accept().await;
        // Drain heartbeats until the client closes the rotated connection.
        while first.next_frame().await.is_some() {}

        let _second = upstream.accept().await;
        assert_eq!(gaps(&connector.attempts()), vec![Duration::from_secs(60)]);

        assert_eq!(harness.events.recv().await.as_deref(), Some("connected:1"));
        assert_eq!(harness.events.recv().await.as_deref(), Some("disconnected:rotation"));
        assert_eq!(harness.events.recv().await.as_deref(), Some("connected:2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_closes_connection() {
        let (connector, mut upstream) = MockConnector::new();
        let mut harness = start(connector, SupervisorConfig::default());

        let mut session = upstream.accept().await;
        harness
            .state
            .wait_for(|s| *s == ConnectionState::Connected)
            .await
            .unwrap();
        harness.command_tx.send(ControlCommand::Shutdown).await.unwrap();

        assert!(harness.task.await.unwrap().is_ok());
        while session.next_frame().await.is_some() {}
        assert_eq!(*harness.state.borrow(), ConnectionState::Disconnected);

        let mut events = Vec::new();
        while let Ok(event) = harness.events.try_recv() {
            events.push(event);
        }
        assert_eq!(events, vec!["connected:1", "shutdown", "disconnected:shutdown"]);
    }
}
