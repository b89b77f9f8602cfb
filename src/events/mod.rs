//! Event channel between the executor and its caller.
//!
//! [`Executor::execute`](crate::runtime::Executor::execute) returns an
//! [`EventStream`] backed by a bounded flume channel (capacity 256 by
//! default). Everything emitted during a step uses [`EventEmitter::emit`],
//! which never blocks: when the consumer lags, the event is dropped and
//! counted at debug level. Only terminal events (completion, terminal
//! error, interrupt) are sent synchronously so the caller always observes
//! how the run ended.

mod event;

pub use event::{
    ChannelUpdateEvent, ErrorEvent, ExecutionEvent, GraphCompletion, InterruptEvent, NodeEvent,
    StateUpdateEvent, StepEvent, StepPhase,
};

/// Default capacity of the event channel.
pub const DEFAULT_EVENT_BUFFER: usize = 256;

/// Sending half of the event channel. Cloneable; the channel closes when
/// every emitter is dropped.
#[derive(Clone)]
pub struct EventEmitter {
    tx: flume::Sender<ExecutionEvent>,
}

impl EventEmitter {
    /// Non-blocking emission; drops the event if the buffer is full or the
    /// consumer is gone.
    pub fn emit(&self, event: ExecutionEvent) {
        if let Err(err) = self.tx.try_send(event) {
            tracing::debug!(error = %err, "event dropped: consumer lagging or disconnected");
        }
    }

    /// Synchronous emission for terminal events; waits for buffer space so
    /// the caller cannot miss how the run ended.
    pub async fn emit_final(&self, event: ExecutionEvent) {
        if let Err(err) = self.tx.send_async(event).await {
            tracing::debug!(error = %err, "terminal event dropped: consumer disconnected");
        }
    }
}

/// Receiving half of the event channel.
pub struct EventStream {
    rx: flume::Receiver<ExecutionEvent>,
}

impl EventStream {
    /// Waits for the next event; `None` once the run is over and the buffer
    /// is drained.
    pub async fn next(&self) -> Option<ExecutionEvent> {
        self.rx.recv_async().await.ok()
    }

    /// Non-blocking poll for buffered events.
    pub fn try_next(&self) -> Option<ExecutionEvent> {
        self.rx.try_recv().ok()
    }

    /// Drains the stream until it closes, returning every event received.
    /// The last event is terminal (completion, error, or interrupt) unless
    /// the executor died without one.
    pub async fn collect_until_complete(&self) -> Vec<ExecutionEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.next().await {
            events.push(event);
        }
        events
    }

    /// Exposes the underlying receiver for select-style consumption.
    #[must_use]
    pub fn into_inner(self) -> flume::Receiver<ExecutionEvent> {
        self.rx
    }
}

/// Creates a bounded event channel.
#[must_use]
pub fn event_channel(capacity: usize) -> (EventEmitter, EventStream) {
    let (tx, rx) = flume::bounded(capacity.max(1));
    (EventEmitter { tx }, EventStream { rx })
}
