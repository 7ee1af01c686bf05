//! Minimal AMQP 1.0 frame codec.
//!
//! Covers what connection establishment needs: the protocol header, the frame
//! header, and the `open`, `close` and SASL performatives. Everything the
//! connection layer uses goes through four calls: [`parse_proto_header`],
//! [`parse_frame_header`], [`parse_frame_body`] and [`write_frame`].

pub mod header;
pub mod performative;
pub mod types;

pub use header::{
    parse_frame_body, parse_frame_header, parse_proto_header, write_frame, FrameHeader,
    ProtoHeader,
};
pub use performative::{
    AmqpError, Close, Open, Performative, SaslChallenge, SaslCode, SaslInit, SaslMechanisms,
    SaslOutcome, SaslResponse,
};
pub use types::Value;
