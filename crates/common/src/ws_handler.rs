//! Session handler trait driven by the connection supervisor.

use crate::codec::InboundFrame;
use crate::messages::ControlCommand;
use crate::outbox::Outbox;
use async_trait::async_trait;
use tokio::time::Instant;

/// Callbacks the [`crate::ConnectionSupervisor`] invokes as connection events occur.
///
/// All calls happen on the supervisor task, one at a time, so implementations
/// own their state outright and need no interior locking. Frames queued on
/// the outbox are sent as soon as the call returns.
#[async_trait]
pub trait WsHandler: Send + 'static {
    /// A new connection reached `connected`. Called once per generation.
    async fn on_connected(&mut self, outbox: &mut Outbox);

    /// A decoded inbound frame arrived.
    async fn on_frame(&mut self, frame: InboundFrame, outbox: &mut Outbox);

    /// The current connection ended (failure, rotation or shutdown).
    async fn on_disconnected(&mut self, _reason: &str) {}

    /// Automatic reconnection gave up.
    async fn on_exhausted(&mut self, _attempts: u32) {}

    /// Handle a control command. `outbox` is `None` while not connected.
    async fn handle_command(&mut self, cmd: ControlCommand, outbox: Option<&mut Outbox>);

    /// Whether throttled work (reconciliation joins) is waiting.
    fn has_paced_work(&self) -> bool {
        false
    }

    /// Perform one unit of throttled work.
    fn on_pace(&mut self, _outbox: &mut Outbox) {}

    /// Earliest deadline the handler wants to be woken for.
    fn next_deadline(&self) -> Option<Instant> {
        None
    }

    /// Called once `next_deadline` has passed.
    fn on_deadline(&mut self, _now: Instant) {}

    /// The supervisor is stopping; resolve anything still waiting.
    async fn on_shutdown(&mut self) {}
}
