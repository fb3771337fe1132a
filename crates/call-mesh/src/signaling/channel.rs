//! Transport-independent handle on the signaling connection

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use super::protocol::{InboundEvent, OutboundEvent};
use crate::{Error, Result};

/// Something delivered by a signaling transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// Transport is authenticated and ready
    Connected,
    /// Relay event
    Event(InboundEvent),
    /// Transport went away, with an optional reason
    Disconnected(Option<String>),
}

/// Receiving half handed out alongside a [`SignalingChannel`]
pub type ChannelEvents = mpsc::UnboundedReceiver<ChannelEvent>;

/// Anything that can carry outbound events to the relay
pub trait SignalSink: Send + Sync {
    /// Queue one event for delivery
    fn send(&self, event: OutboundEvent) -> Result<()>;
}

impl SignalSink for mpsc::UnboundedSender<OutboundEvent> {
    fn send(&self, event: OutboundEvent) -> Result<()> {
        mpsc::UnboundedSender::send(self, event)
            .map_err(|e| Error::SignalingError(format!("sink closed: {}", e.0.name())))
    }
}

/// Bidirectional event connection to a relay
///
/// Outbound events are queued on an unbounded channel drained by a writer
/// task owned by the transport. Closing drops the queue's sender, so events
/// queued before `close()` are still flushed before the transport shuts down.
pub struct SignalingChannel {
    outbound: Mutex<Option<mpsc::UnboundedSender<OutboundEvent>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl SignalingChannel {
    /// Assemble a channel from a transport's outbound queue and reader task
    pub fn new(
        outbound: mpsc::UnboundedSender<OutboundEvent>,
        reader: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            outbound: Mutex::new(Some(outbound)),
            reader: Mutex::new(reader),
        }
    }

    /// Whether `close()` has been called
    pub fn is_closed(&self) -> bool {
        self.outbound.lock().is_none()
    }

    /// Close the channel
    ///
    /// Idempotent. Stops delivering inbound events immediately.
    pub fn close(&self) {
        let sender = self.outbound.lock().take();
        if sender.is_some() {
            debug!("Closing signaling channel");
        }
        drop(sender);

        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
    }
}

impl SignalSink for SignalingChannel {
    fn send(&self, event: OutboundEvent) -> Result<()> {
        let guard = self.outbound.lock();
        let Some(tx) = guard.as_ref() else {
            return Err(Error::SignalingError(format!(
                "channel closed, cannot send {}",
                event.name()
            )));
        };
        debug!(event = event.name(), "Sending signaling event");
        tx.send(event)
            .map_err(|e| Error::SignalingError(format!("transport gone: {}", e.0.name())))
    }
}

impl Drop for SignalingChannel {
    fn drop(&mut self) {
        self.close();
    }
}
