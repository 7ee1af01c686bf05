//! Frames as they move between the reader, the negotiator and the writer.

use std::fmt;

use tokio::sync::oneshot;

use crate::codec::Performative;
use crate::protocol::frame_type;

lazy_static::lazy_static! {
    // Frame-level tracing verbosity, from AMQPD_DEBUG_LEVEL (0 = off).
    static ref DEBUG_LEVEL: u8 = std::env::var("AMQPD_DEBUG_LEVEL")
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(0);
}

pub fn debug_level() -> u8 {
    *DEBUG_LEVEL
}

pub struct Frame {
    pub frame_type: u8,
    pub channel: u16,
    pub body: Performative,
    /// Fired by the writer once the frame is on the wire.
    pub done: Option<oneshot::Sender<()>>,
}

impl Frame {
    pub fn amqp(body: Performative) -> Self {
        Frame {
            frame_type: frame_type::AMQP,
            channel: 0,
            body,
            done: None,
        }
    }

    pub fn sasl(body: Performative) -> Self {
        Frame {
            frame_type: frame_type::SASL,
            channel: 0,
            body,
            done: None,
        }
    }

    pub fn with_done(mut self, done: oneshot::Sender<()>) -> Self {
        self.done = Some(done);
        self
    }

    pub fn type_name(&self) -> &'static str {
        match self.frame_type {
            frame_type::AMQP => "amqp",
            frame_type::SASL => "sasl",
            _ => "unknown",
        }
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("type", &self.type_name())
            .field("channel", &self.channel)
            .field("body", &self.body)
            .finish()
    }
}

/// Log a frame at the configured debug level. No-op at level 0.
pub(crate) fn trace_frame(direction: &str, frame: &Frame) {
    match debug_level() {
        0 => {}
        1 => tracing::debug!(
            direction,
            kind = frame.type_name(),
            channel = frame.channel,
            body = frame.body.name(),
            "frame"
        ),
        _ => tracing::debug!(direction, frame = ?frame, "frame"),
    }
}
