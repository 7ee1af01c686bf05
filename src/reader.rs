//! Frame reader task.
//!
//! Owns the read half of the socket for the life of the connection. While
//! negotiating, an `AMQP` prefix is parsed as a protocol header rather than a
//! frame header; once a plain AMQP header has been seen that never happens
//! again. Headers and frames share one queue so they arrive in wire order.

use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::buffer::Buffer;
use crate::codec::{parse_frame_body, parse_frame_header, parse_proto_header, FrameHeader, ProtoHeader};
use crate::error::ConnError;
use crate::frame::Frame;
use crate::protocol::{proto, FRAME_HEADER_SIZE, MAGIC, MAX_DECLARED_FRAME_SIZE, PROTO_HEADER_SIZE};

/// Something read off the wire.
pub(crate) enum Incoming {
    Header(ProtoHeader),
    Frame(Frame),
}

pub(crate) struct Reader<R> {
    pub io: R,
    /// Local max frame size; bounds how far the read position may drift
    /// before unread bytes are shifted to the front.
    pub max_frame_size: u32,
    pub incoming: mpsc::Sender<Incoming>,
    pub errors: mpsc::Sender<ConnError>,
    pub done: CancellationToken,
}

impl<R> Reader<R>
where
    R: AsyncRead + Unpin,
{
    pub async fn run(self) {
        let Reader {
            mut io,
            max_frame_size,
            incoming,
            errors,
            done,
        } = self;

        let mut buf = Buffer::new();
        let mut negotiating = true;
        // header of a frame whose body has not fully arrived
        let mut in_progress: Option<FrameHeader> = None;

        loop {
            if buf.is_empty() {
                buf.reset();
            } else if buf.read_pos() > max_frame_size as usize {
                buf.reclaim();
            }

            if in_progress.is_some() || buf.len() < FRAME_HEADER_SIZE {
                let read = tokio::select! {
                    r = buf.read_from_once(&mut io) => r,
                    _ = done.cancelled() => return,
                };
                if let Err(e) = read {
                    // errors caused by shutdown are not reported
                    if !done.is_cancelled() {
                        let _ = errors.try_send(e.into());
                    }
                    return;
                }
            }

            if in_progress.is_none() && buf.len() < FRAME_HEADER_SIZE {
                continue;
            }

            if negotiating && in_progress.is_none() && buf.bytes().starts_with(MAGIC) {
                let header = match parse_proto_header(buf.bytes()) {
                    Ok(h) => h,
                    Err(e) => {
                        let _ = errors.try_send(e.into());
                        return;
                    }
                };
                buf.skip(PROTO_HEADER_SIZE);
                if header.proto_id == proto::AMQP {
                    negotiating = false;
                }
                tokio::select! {
                    r = incoming.send(Incoming::Header(header)) => if r.is_err() { return },
                    _ = done.cancelled() => return,
                }
                continue;
            }

            let header = match in_progress {
                Some(h) => h,
                None => {
                    let h = match parse_frame_header(buf.bytes()) {
                        Ok(h) => h,
                        Err(e) => {
                            let _ = errors.try_send(e.into());
                            return;
                        }
                    };
                    if h.size > MAX_DECLARED_FRAME_SIZE {
                        let _ = errors.try_send(ConnError::PayloadTooLarge(h.size));
                        return;
                    }
                    buf.skip(FRAME_HEADER_SIZE);
                    in_progress = Some(h);
                    h
                }
            };

            if buf.len() < header.remaining() {
                continue;
            }
            in_progress = None;

            let raw = match buf.next(header.remaining()) {
                Some(raw) => raw,
                None => continue,
            };
            let body = &raw[header.extended_len()..];

            // empty body: heartbeat
            if body.is_empty() {
                continue;
            }

            let parsed = match parse_frame_body(body) {
                Ok(p) => p,
                Err(e) => {
                    let _ = errors.try_send(e.into());
                    return;
                }
            };

            let frame = Frame {
                frame_type: header.frame_type,
                channel: header.channel,
                body: parsed,
                done: None,
            };
            tokio::select! {
                r = incoming.send(Incoming::Frame(frame)) => if r.is_err() { return },
                _ = done.cancelled() => return,
            }
        }
    }
}
