//! Frame writer task.
//!
//! Owns the write half of the socket until teardown. Everything the
//! negotiator sends, protocol header echoes included, goes through the
//! outgoing queue so writes stay ordered. The final close frame arrives on a
//! separate one-shot request and is the last thing written.

use bytes::BytesMut;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::codec::{write_frame, Close, Performative, ProtoHeader};
use crate::error::{ConnError, Result};
use crate::frame::{trace_frame, Frame};

pub(crate) enum Outgoing {
    Header {
        proto_id: u8,
        done: oneshot::Sender<()>,
    },
    Frame(Frame),
}

pub(crate) struct Writer<W> {
    pub io: W,
    pub outgoing: mpsc::Receiver<Outgoing>,
    /// `Some(close)` writes a close frame before exiting; `None` just exits.
    pub stop: oneshot::Receiver<Option<Close>>,
    pub peer_max_frame_size: watch::Receiver<u32>,
    pub errors: mpsc::Sender<ConnError>,
    pub done: CancellationToken,
}

impl<W> Writer<W>
where
    W: AsyncWrite + Unpin,
{
    /// Run until stopped, the queue closes, or a write fails. Returns the
    /// write half so the caller can shut it down.
    pub async fn run(self) -> W {
        let Writer {
            mut io,
            mut outgoing,
            mut stop,
            peer_max_frame_size,
            errors,
            done,
        } = self;

        let mut buf = BytesMut::with_capacity(1024);

        loop {
            tokio::select! {
                req = &mut stop => {
                    if let Ok(Some(close)) = req {
                        let frame = Frame::amqp(Performative::Close(close));
                        let max = *peer_max_frame_size.borrow();
                        // the close is best effort; the connection is going away
                        if let Err(e) = send_frame(&mut io, &mut buf, &frame, max, &done).await {
                            tracing::debug!(error = %e, "final close not written");
                        }
                    }
                    return io;
                }
                next = outgoing.recv() => {
                    let Some(next) = next else {
                        return io;
                    };
                    // the completion signal is held until any error has been
                    // reported, so a waiter that sees it dropped finds the error
                    let (res, sent) = match next {
                        Outgoing::Header { proto_id, done: sent } => {
                            let bytes = ProtoHeader::new(proto_id).to_bytes();
                            (write_all(&mut io, &bytes, &done).await, Some(sent))
                        }
                        Outgoing::Frame(mut frame) => {
                            let sent = frame.done.take();
                            let max = *peer_max_frame_size.borrow();
                            (send_frame(&mut io, &mut buf, &frame, max, &done).await, sent)
                        }
                    };
                    match res {
                        Ok(()) => {
                            if let Some(sent) = sent {
                                let _ = sent.send(());
                            }
                        }
                        Err(e) => {
                            if !done.is_cancelled() {
                                let _ = errors.try_send(e);
                            }
                            drop(sent);
                            return io;
                        }
                    }
                }
            }
        }
    }
}

async fn send_frame<W>(
    io: &mut W,
    buf: &mut BytesMut,
    frame: &Frame,
    peer_max: u32,
    done: &CancellationToken,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    trace_frame("TX", frame);
    buf.clear();
    write_frame(buf, frame.frame_type, frame.channel, &frame.body)?;
    if buf.len() > peer_max as usize {
        return Err(ConnError::FrameTooLarge {
            kind: frame.body.name(),
            size: buf.len(),
            max: peer_max,
        });
    }
    write_all(io, buf, done).await
}

async fn write_all<W>(io: &mut W, bytes: &[u8], done: &CancellationToken) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let write = async {
        io.write_all(bytes).await?;
        io.flush().await
    };
    tokio::select! {
        r = write => Ok(r?),
        _ = done.cancelled() => Err(ConnError::ConnectionClosed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{AmqpError, Open, SaslMechanisms};
    use crate::protocol::{condition, proto, DEFAULT_MAX_FRAME_SIZE};
    use crate::reader::{Incoming, Reader};
    use tokio::io::AsyncReadExt;

    struct Harness {
        outgoing: mpsc::Sender<Outgoing>,
        stop: Option<oneshot::Sender<Option<Close>>>,
        peer_max: watch::Sender<u32>,
        errors: mpsc::Receiver<ConnError>,
        task: tokio::task::JoinHandle<tokio::io::DuplexStream>,
    }

    fn spawn_writer(io: tokio::io::DuplexStream) -> Harness {
        let (otx, outgoing) = mpsc::channel(1);
        let (stx, stop) = oneshot::channel();
        let (peer_max, peer_max_rx) = watch::channel(DEFAULT_MAX_FRAME_SIZE);
        let (etx, errors) = mpsc::channel(2);
        let task = tokio::spawn(
            Writer {
                io,
                outgoing,
                stop,
                peer_max_frame_size: peer_max_rx,
                errors: etx,
                done: CancellationToken::new(),
            }
            .run(),
        );
        Harness {
            outgoing: otx,
            stop: Some(stx),
            peer_max,
            errors,
            task,
        }
    }

    async fn send(h: &Harness, body: Performative) -> Result<(), oneshot::error::RecvError> {
        let (tx, rx) = oneshot::channel();
        h.outgoing
            .send(Outgoing::Frame(Frame::sasl(body).with_done(tx)))
            .await
            .ok();
        rx.await
    }

    #[tokio::test]
    async fn test_loopback_through_reader() {
        let (wio, rio) = tokio::io::duplex(4096);
        let h = spawn_writer(wio);

        let (itx, mut incoming) = mpsc::channel(1);
        let (etx, _errors) = mpsc::channel(2);
        let done = CancellationToken::new();
        let reader = tokio::spawn(
            Reader {
                io: rio,
                max_frame_size: DEFAULT_MAX_FRAME_SIZE,
                incoming: itx,
                errors: etx,
                done: done.clone(),
            }
            .run(),
        );

        let (sent_tx, sent_rx) = oneshot::channel();
        h.outgoing
            .send(Outgoing::Header {
                proto_id: proto::SASL,
                done: sent_tx,
            })
            .await
            .unwrap();
        sent_rx.await.unwrap();
        match incoming.recv().await {
            Some(Incoming::Header(hdr)) => assert_eq!(hdr.proto_id, proto::SASL),
            _ => panic!("expected the echoed header"),
        }

        let body = Performative::SaslMechanisms(SaslMechanisms {
            mechanisms: vec!["ANONYMOUS".into()],
        });
        send(&h, body.clone()).await.unwrap();
        match incoming.recv().await {
            Some(Incoming::Frame(fr)) => assert_eq!(fr.body, body),
            _ => panic!("expected the mechanisms frame"),
        }

        done.cancel();
        reader.await.unwrap();
        drop(h.outgoing);
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (wio, mut peer) = tokio::io::duplex(8192);
        let mut h = spawn_writer(wio);

        let mut open = Open::new("x".repeat(600));
        open.max_frame_size = 512;
        assert!(send(&h, Performative::Open(open.clone())).await.is_err());
        let err = h.errors.recv().await.unwrap();
        assert!(matches!(err, ConnError::FrameTooLarge { max: 512, .. }));
        h.task.await.unwrap();

        // nothing reached the wire
        drop(h.outgoing);
        let mut rest = Vec::new();
        peer.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_peer_max_update_applies() {
        let (wio, _peer) = tokio::io::duplex(8192);
        let h = spawn_writer(wio);
        h.peer_max.send_replace(4096);
        let open = Open::new("x".repeat(600));
        assert!(send(&h, Performative::Open(open)).await.is_ok());
        drop(h.outgoing);
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_with_close_writes_it_last() {
        let (wio, mut peer) = tokio::io::duplex(4096);
        let mut h = spawn_writer(wio);
        let close = Close {
            error: Some(AmqpError::new(condition::CONNECTION_FORCED, "bye")),
        };
        h.stop.take().unwrap().send(Some(close.clone())).unwrap();
        let io = h.task.await.unwrap();
        drop(io);

        let mut wire = Vec::new();
        peer.read_to_end(&mut wire).await.unwrap();
        let hdr = crate::codec::parse_frame_header(&wire).unwrap();
        assert_eq!(hdr.size as usize, wire.len());
        let body = crate::codec::parse_frame_body(&wire[8..]).unwrap();
        assert_eq!(body, Performative::Close(close));
    }

    #[tokio::test]
    async fn test_stop_without_close_writes_nothing() {
        let (wio, mut peer) = tokio::io::duplex(4096);
        let mut h = spawn_writer(wio);
        h.stop.take().unwrap().send(None).unwrap();
        drop(h.task.await.unwrap());
        let mut wire = Vec::new();
        peer.read_to_end(&mut wire).await.unwrap();
        assert!(wire.is_empty());
    }
}
