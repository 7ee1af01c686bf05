//! Server side of AMQP 1.0 connection establishment.
//!
//! [`IncomingConnection::negotiate`] splits the socket between a reader task
//! and a writer task and then drives the establishment state machine from the
//! caller's task. The machine only talks to the socket through the tasks'
//! queues, and every wait on them is bounded by the connect timeout.
//!
//! ```text
//! NegotiateProto --SASL hdr--> SaslStart --> SaslNegotiate --outcome--> NegotiateProto
//! NegotiateProto --AMQP hdr + OPEN, SASL done--> Ready
//! NegotiateProto --AMQP hdr + OPEN, no SASL--> OPEN, forced close, error
//! ```
//!
//! Any failure records the first error, tears the connection down in a fixed
//! order (final close and writer, write-half shutdown, done latch, reader)
//! and returns that first error.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::codec::{
    AmqpError, Close, Open, Performative, ProtoHeader, SaslChallenge, SaslCode, SaslMechanisms,
    SaslOutcome, Value,
};
use crate::error::{ConnError, Result, SaslError};
use crate::frame::{trace_frame, Frame};
use crate::protocol::{condition, open_props, proto, timeouts, DEFAULT_MAX_FRAME_SIZE};
use crate::reader::{Incoming, Reader};
use crate::sasl::{Mechanism, SaslRegistry, SaslSession};
use crate::writer::{Outgoing, Writer};

type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// Options applied when a connection is constructed.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Deadline for each negotiation read and write. Zero disables it.
    pub connect_timeout: Duration,
    pub container_id: String,
    /// Largest frame this side accepts, advertised in OPEN.
    pub max_frame_size: u32,
    /// Extra OPEN properties, merged over `product`.
    pub properties: BTreeMap<String, Value>,
    /// Sent as the `groups` OPEN property after a successful SASL exchange.
    pub groups: Vec<String>,
    pub mechanisms: SaslRegistry,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            connect_timeout: Duration::from_millis(timeouts::CONNECT_MS),
            container_id: uuid::Uuid::new_v4().to_string(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            properties: BTreeMap::new(),
            groups: Vec::new(),
            mechanisms: SaslRegistry::new(),
        }
    }
}

impl ConnectionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_container_id(mut self, id: impl Into<String>) -> Self {
        self.container_id = id.into();
        self
    }

    pub fn with_max_frame_size(mut self, size: u32) -> Self {
        self.max_frame_size = size;
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: Value) -> Self {
        self.properties.insert(key.into(), value);
        self
    }

    pub fn with_groups(mut self, groups: Vec<String>) -> Self {
        self.groups = groups;
        self
    }

    pub fn with_mechanism(mut self, name: impl Into<String>, mechanism: Mechanism) -> Self {
        self.mechanisms.register(name, mechanism);
        self
    }

    pub fn with_mechanisms(mut self, registry: SaslRegistry) -> Self {
        self.mechanisms = registry;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    NegotiateProto,
    SaslStart,
    SaslNegotiate,
    Ready,
}

/// Write-once error cell. The first error recorded is the one reported.
#[derive(Debug, Default)]
struct ErrorSlot(Mutex<Option<ConnError>>);

impl ErrorSlot {
    fn set(&self, err: ConnError) -> bool {
        let mut slot = self.0.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(err);
        true
    }

    fn take(&self) -> Option<ConnError> {
        self.0.lock().take()
    }
}

enum Rx {
    Header(ProtoHeader),
    Frame(Frame),
    Err(ConnError),
    Timeout,
}

/// A connection that has completed (or is completing) establishment.
pub struct IncomingConnection {
    config: ConnectionConfig,
    sasl: SaslSession,
    sasl_hostname: Option<String>,

    peer_max_frame_size: watch::Sender<u32>,
    peer_container_id: Option<String>,
    peer_hostname: Option<String>,
    peer_desired_capabilities: Vec<String>,

    ready: bool,
    opened: bool,
    err: ErrorSlot,

    rx_incoming: mpsc::Receiver<Incoming>,
    conn_err: mpsc::Receiver<ConnError>,
    tx_frame: Option<mpsc::Sender<Outgoing>>,
    tx_stop: Option<oneshot::Sender<Option<Close>>>,

    writer: Option<JoinHandle<BoxedWrite>>,
    reader: Option<JoinHandle<()>>,
    done: CancellationToken,
}

impl IncomingConnection {
    /// Run connection establishment on `stream` until the peer's OPEN has
    /// arrived after a completed SASL exchange.
    ///
    /// On success the connection is ready for [`accept`](Self::accept) or
    /// [`reject`](Self::reject). On failure the socket has already been
    /// closed and the first recorded error is returned.
    pub async fn negotiate<S>(stream: S, config: ConnectionConfig) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (rio, wio) = tokio::io::split(stream);

        let (incoming_tx, rx_incoming) = mpsc::channel(1);
        // room for one report from each task so neither blocks on it
        let (err_tx, conn_err) = mpsc::channel(2);
        let (tx_frame, outgoing) = mpsc::channel(1);
        let (tx_stop, stop) = oneshot::channel();
        let (peer_max_frame_size, peer_max_rx) = watch::channel(DEFAULT_MAX_FRAME_SIZE);
        let done = CancellationToken::new();

        let reader = tokio::spawn(
            Reader {
                io: rio,
                max_frame_size: config.max_frame_size,
                incoming: incoming_tx,
                errors: err_tx.clone(),
                done: done.clone(),
            }
            .run(),
        );
        let writer = tokio::spawn(
            Writer {
                io: Box::new(wio) as BoxedWrite,
                outgoing,
                stop,
                peer_max_frame_size: peer_max_rx,
                errors: err_tx,
                done: done.clone(),
            }
            .run(),
        );

        let mut conn = IncomingConnection {
            config,
            sasl: SaslSession::default(),
            sasl_hostname: None,
            peer_max_frame_size,
            peer_container_id: None,
            peer_hostname: None,
            peer_desired_capabilities: Vec::new(),
            ready: false,
            opened: false,
            err: ErrorSlot::default(),
            rx_incoming,
            conn_err,
            tx_frame: Some(tx_frame),
            tx_stop: Some(tx_stop),
            writer: Some(writer),
            reader: Some(reader),
            done,
        };

        match conn.process(State::NegotiateProto).await {
            Ok(()) => {
                conn.ready = true;
                Ok(conn)
            }
            Err(e) => {
                conn.err.set(e);
                conn.teardown().await;
                Err(conn.err.take().unwrap_or(ConnError::ConnectionClosed))
            }
        }
    }

    async fn process(&mut self, mut state: State) -> Result<()> {
        loop {
            tracing::trace!(?state, "negotiation step");
            state = match state {
                State::NegotiateProto => self.negotiate_proto().await?,
                State::SaslStart => self.sasl_start().await?,
                State::SaslNegotiate => self.sasl_negotiate().await?,
                State::Ready => return Ok(()),
            };
        }
    }

    async fn negotiate_proto(&mut self) -> Result<State> {
        let header = self.read_proto_header().await?;
        match header.proto_id {
            proto::TLS => Err(ConnError::UnsupportedProtocol(header.proto_id)),
            proto::SASL => {
                self.write_proto_header(proto::SASL).await?;
                Ok(State::SaslStart)
            }
            proto::AMQP => {
                self.write_proto_header(proto::AMQP).await?;
                self.recv_open().await?;
                if self.sasl.outcome().is_some() {
                    return Ok(State::Ready);
                }

                // SASL was skipped: answer the OPEN, then force the close
                self.send_open().await?;
                let err = ConnError::SaslRequired(header.proto_id);
                self.request_close(Some(Close {
                    error: Some(AmqpError::new(condition::CONNECTION_FORCED, err.to_string())),
                }));
                Err(err)
            }
            other => {
                tracing::debug!(proto_id = other, "unexpected protocol id");
                Err(ConnError::UnknownProtocol(other))
            }
        }
    }

    async fn sasl_start(&mut self) -> Result<State> {
        let mechanisms = SaslMechanisms {
            mechanisms: self.config.mechanisms.names(),
        };
        self.write_frame(Frame::sasl(Performative::SaslMechanisms(mechanisms)))
            .await?;
        Ok(State::SaslNegotiate)
    }

    async fn sasl_negotiate(&mut self) -> Result<State> {
        let init = match self.read_frame().await?.body {
            Performative::SaslInit(init) => init,
            other => return Err(unexpected("sasl-init", &other)),
        };

        let hostname = init.hostname.clone().unwrap_or_default();
        self.sasl_hostname = init.hostname;
        let mechanism = init.mechanism;
        let mut step = self
            .config
            .mechanisms
            .start(&mechanism)
            .ok_or_else(|| ConnError::UnknownMechanism(mechanism.clone()))?;

        let mut response = init.initial_response;
        loop {
            let out = match step(&mut self.sasl, hostname.as_str(), &response[..]) {
                Ok(out) => out,
                Err(source) => {
                    self.send_failure_outcome(&source).await;
                    return Err(ConnError::Sasl { mechanism, source });
                }
            };
            if out.is_finished() {
                break;
            }

            let challenge = SaslChallenge {
                challenge: out.challenge,
            };
            self.write_frame(Frame::sasl(Performative::SaslChallenge(challenge)))
                .await?;
            response = match self.read_frame().await?.body {
                Performative::SaslResponse(r) => r.response,
                other => return Err(unexpected("sasl-response", &other)),
            };

            match out.next {
                Some(next) => step = next,
                // final challenge; the response ends the exchange
                None => break,
            }
        }

        let outcome = self
            .sasl
            .outcome()
            .cloned()
            .ok_or(ConnError::MissingOutcome)?;
        self.write_frame(Frame::sasl(Performative::SaslOutcome(outcome)))
            .await?;
        Ok(State::NegotiateProto)
    }

    // Tell the peer why before the connection goes away. A failure to
    // deliver it does not replace the mechanism error.
    async fn send_failure_outcome(&mut self, err: &SaslError) {
        let code = match err {
            SaslError::AuthFailed(_) => SaslCode::Auth,
            SaslError::System(_) => SaslCode::Sys,
        };
        self.sasl.set_outcome(code, None);
        let outcome = self.sasl.outcome().cloned().unwrap_or(SaslOutcome {
            code,
            additional_data: None,
        });
        if let Err(e) = self
            .write_frame(Frame::sasl(Performative::SaslOutcome(outcome)))
            .await
        {
            tracing::debug!(error = %e, "failed to send sasl failure outcome");
        }
    }

    async fn recv_open(&mut self) -> Result<()> {
        let open = match self.read_frame().await?.body {
            Performative::Open(open) => open,
            other => return Err(unexpected("open", &other)),
        };
        if open.max_frame_size > 0 {
            self.peer_max_frame_size.send_replace(open.max_frame_size);
        }
        self.peer_container_id = Some(open.container_id);
        self.peer_hostname = open.hostname;
        self.peer_desired_capabilities = open.desired_capabilities;
        Ok(())
    }

    async fn send_open(&mut self) -> Result<()> {
        let open = self.local_open();
        self.write_frame(Frame::amqp(Performative::Open(open))).await?;
        self.opened = true;
        Ok(())
    }

    fn local_open(&self) -> Open {
        let mut open = Open::new(self.config.container_id.clone());
        open.max_frame_size = self.config.max_frame_size;
        open.channel_max = 1;
        open.properties.insert(
            open_props::PRODUCT.to_string(),
            Value::string(open_props::PRODUCT_NAME),
        );
        for (k, v) in &self.config.properties {
            open.properties.insert(k.clone(), v.clone());
        }

        if self.sasl.succeeded() {
            let identity = self.sasl.identity().unwrap_or_default();
            open.properties.insert(
                open_props::AUTHENTICATED_IDENTITY.to_string(),
                Value::Map(vec![
                    (Value::string("sub"), Value::string(identity)),
                    (Value::string("preferred_username"), Value::string(identity)),
                ]),
            );
            open.properties.insert(
                open_props::GROUPS.to_string(),
                Value::List(
                    self.config
                        .groups
                        .iter()
                        .map(|g| Value::string(g.as_str()))
                        .collect(),
                ),
            );
            if self
                .peer_desired_capabilities
                .iter()
                .any(|c| c == open_props::ADDRESS_AUTHZ_CAPABILITY)
            {
                open.offered_capabilities
                    .push(open_props::ADDRESS_AUTHZ_CAPABILITY.to_string());
            }
        }
        open
    }

    // Wait for whatever the reader produces next, bounded by the connect
    // timeout. The reader reports an error only after its last push, so
    // polling its queue first keeps that push ahead of the error.
    async fn next_event(&mut self) -> Rx {
        let deadline = deadline(self.config.connect_timeout);
        tokio::select! {
            biased;
            Some(item) = self.rx_incoming.recv() => match item {
                Incoming::Header(h) => Rx::Header(h),
                Incoming::Frame(f) => Rx::Frame(f),
            },
            e = self.conn_err.recv() => Rx::Err(e.unwrap_or(ConnError::ConnectionClosed)),
            _ = deadline => Rx::Timeout,
        }
    }

    async fn read_proto_header(&mut self) -> Result<ProtoHeader> {
        match self.next_event().await {
            Rx::Header(h) => Ok(h),
            Rx::Frame(f) => Err(unexpected("protocol header", &f.body)),
            Rx::Err(e) => Err(e),
            Rx::Timeout => Err(ConnError::Timeout),
        }
    }

    async fn read_frame(&mut self) -> Result<Frame> {
        match self.next_event().await {
            Rx::Frame(f) => {
                trace_frame("RX", &f);
                Ok(f)
            }
            Rx::Header(h) => Err(ConnError::UnexpectedHeader(h.proto_id)),
            Rx::Err(e) => Err(e),
            Rx::Timeout => Err(ConnError::Timeout),
        }
    }

    async fn write_proto_header(&mut self, proto_id: u8) -> Result<()> {
        let (done, sent) = oneshot::channel();
        self.enqueue(Outgoing::Header { proto_id, done }, sent).await
    }

    async fn write_frame(&mut self, frame: Frame) -> Result<()> {
        let (done, sent) = oneshot::channel();
        self.enqueue(Outgoing::Frame(frame.with_done(done)), sent)
            .await
    }

    // Hand an item to the writer and wait until it is on the wire.
    async fn enqueue(&mut self, item: Outgoing, sent: oneshot::Receiver<()>) -> Result<()> {
        let tx = self
            .tx_frame
            .clone()
            .ok_or(ConnError::ConnectionClosed)?;
        let written = async move {
            tx.send(item)
                .await
                .map_err(|_| ConnError::ConnectionClosed)?;
            sent.await.map_err(|_| ConnError::ConnectionClosed)
        };
        let res = match with_deadline(self.config.connect_timeout, written).await {
            Some(res) => res,
            None => Err(ConnError::Timeout),
        };
        match res {
            // the writer gave up; report why if it said
            Err(ConnError::ConnectionClosed) => Err(self
                .conn_err
                .try_recv()
                .unwrap_or(ConnError::ConnectionClosed)),
            res => res,
        }
    }

    fn request_close(&mut self, close: Option<Close>) {
        if let Some(stop) = self.tx_stop.take() {
            let _ = stop.send(close);
        }
    }

    async fn teardown(&mut self) {
        self.request_close(None);
        self.tx_frame = None;

        if let Some(mut writer) = self.writer.take() {
            let limit = if self.config.connect_timeout.is_zero() {
                Duration::from_millis(timeouts::CONNECT_MS)
            } else {
                self.config.connect_timeout
            };
            let io = match tokio::time::timeout(limit, &mut writer).await {
                Ok(res) => res.ok(),
                Err(_) => {
                    tracing::debug!("writer did not stop in time");
                    self.done.cancel();
                    writer.await.ok()
                }
            };
            if let Some(mut io) = io {
                if let Err(e) = io.shutdown().await {
                    tracing::debug!(error = %e, "socket shutdown failed");
                }
            }
        }

        self.err.set(ConnError::ConnectionClosed);
        self.done.cancel();

        if let Some(reader) = self.reader.take() {
            let _ = reader.await;
        }
    }

    // Tear down and report the recorded error, treating a plain close as
    // success.
    async fn finish(&mut self) -> Result<()> {
        self.ready = false;
        self.teardown().await;
        match self.err.take() {
            None | Some(ConnError::ConnectionClosed) => Ok(()),
            Some(e) => Err(e),
        }
    }

    /// Send this side's OPEN, completing establishment.
    pub async fn accept(&mut self) -> Result<()> {
        if !self.ready || self.opened {
            return Err(ConnError::NotReady);
        }
        if let Err(e) = self.send_open().await {
            self.err.set(e);
            return match self.finish().await {
                Ok(()) => Err(ConnError::ConnectionClosed),
                Err(e) => Err(e),
            };
        }
        Ok(())
    }

    /// Refuse the connection with an AMQP error condition. OPEN is sent
    /// first if it has not been already, as CLOSE is only valid after it.
    pub async fn reject(
        mut self,
        condition: impl Into<String>,
        description: impl Into<String>,
    ) -> Result<()> {
        if !self.ready {
            self.finish().await?;
            return Err(ConnError::NotReady);
        }
        if !self.opened {
            if let Err(e) = self.send_open().await {
                self.err.set(e);
                return self.finish().await;
            }
        }
        self.request_close(Some(Close {
            error: Some(AmqpError::new(condition, description)),
        }));
        self.finish().await
    }

    /// Close the connection. A CLOSE frame without an error is sent if this
    /// side's OPEN went out; otherwise the socket is just closed.
    pub async fn close(mut self) -> Result<()> {
        if self.opened {
            self.request_close(Some(Close::default()));
        }
        self.finish().await
    }

    /// Identity recorded by the SASL mechanism, if any.
    pub fn authenticated_identity(&self) -> Option<&str> {
        self.sasl.identity()
    }

    pub fn sasl_outcome(&self) -> Option<&SaslOutcome> {
        self.sasl.outcome()
    }

    pub fn sasl_hostname(&self) -> Option<&str> {
        self.sasl_hostname.as_deref()
    }

    pub fn peer_max_frame_size(&self) -> u32 {
        *self.peer_max_frame_size.borrow()
    }

    pub fn max_frame_size(&self) -> u32 {
        self.config.max_frame_size
    }

    pub fn container_id(&self) -> &str {
        &self.config.container_id
    }

    pub fn peer_container_id(&self) -> Option<&str> {
        self.peer_container_id.as_deref()
    }

    pub fn peer_hostname(&self) -> Option<&str> {
        self.peer_hostname.as_deref()
    }

    pub fn peer_desired_capabilities(&self) -> &[String] {
        &self.peer_desired_capabilities
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }
}

impl Drop for IncomingConnection {
    fn drop(&mut self) {
        self.done.cancel();
    }
}

fn unexpected(expected: &'static str, got: &Performative) -> ConnError {
    ConnError::UnexpectedFrame {
        expected,
        got: got.name().to_string(),
    }
}

// Resolves after `timeout`, or never when it is zero.
async fn deadline(timeout: Duration) {
    if timeout.is_zero() {
        std::future::pending::<()>().await;
    } else {
        tokio::time::sleep(timeout).await;
    }
}

async fn with_deadline<F: Future>(timeout: Duration, fut: F) -> Option<F::Output> {
    if timeout.is_zero() {
        Some(fut.await)
    } else {
        tokio::time::timeout(timeout, fut).await.ok()
    }
}
