use amqpd::codec::{
    parse_frame_body, parse_frame_header, parse_proto_header, write_frame, Close, Open,
    Performative, ProtoHeader, SaslCode, SaslInit, Value,
};
use amqpd::protocol::{condition, frame_type, open_props, proto};
use amqpd::sasl::SaslRegistry;
use amqpd::{ConnectionConfig, Server, ServerHandle};
use anyhow::{bail, Result};
use bytes::BytesMut;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

async fn start_server(connect_timeout: Duration) -> Result<ServerHandle> {
    let config = ConnectionConfig::new()
        .with_container_id("e2e-server")
        .with_connect_timeout(connect_timeout)
        .with_mechanisms(SaslRegistry::with_anonymous())
        .with_groups(vec!["monitor".into()]);
    let handle = Server::new(config)
        .with_negotiation_timeout(Duration::from_secs(5))
        .start("127.0.0.1", 0)
        .await?;
    Ok(handle)
}

async fn send_header(s: &mut TcpStream, id: u8) -> Result<()> {
    s.write_all(&ProtoHeader::new(id).to_bytes()).await?;
    Ok(())
}

async fn send(s: &mut TcpStream, kind: u8, body: Performative) -> Result<()> {
    let mut buf = BytesMut::new();
    write_frame(&mut buf, kind, 0, &body)?;
    s.write_all(&buf).await?;
    Ok(())
}

async fn recv_header(s: &mut TcpStream) -> Result<ProtoHeader> {
    let mut b = [0u8; 8];
    s.read_exact(&mut b).await?;
    Ok(parse_proto_header(&b)?)
}

async fn recv(s: &mut TcpStream) -> Result<Performative> {
    let mut b = [0u8; 8];
    s.read_exact(&mut b).await?;
    let hdr = parse_frame_header(&b)?;
    let mut rest = vec![0u8; hdr.remaining()];
    s.read_exact(&mut rest).await?;
    Ok(parse_frame_body(&rest[hdr.extended_len()..])?)
}

async fn expect_eof(s: &mut TcpStream) -> Result<()> {
    let mut b = [0u8; 1];
    let n = tokio::time::timeout(Duration::from_secs(5), s.read(&mut b)).await??;
    if n != 0 {
        bail!("expected EOF, got byte {:#04x}", b[0]);
    }
    Ok(())
}

async fn send_open(s: &mut TcpStream) -> Result<()> {
    send_header(s, proto::AMQP).await?;
    assert_eq!(recv_header(s).await?.proto_id, proto::AMQP);
    let mut open = Open::new("e2e-client");
    open.max_frame_size = 65536;
    send(s, frame_type::AMQP, Performative::Open(open)).await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn anonymous_connection_is_accepted() -> Result<()> {
    let handle = start_server(Duration::from_secs(2)).await?;
    let mut s = TcpStream::connect(handle.local_addr()).await?;

    send_header(&mut s, proto::SASL).await?;
    assert_eq!(recv_header(&mut s).await?.proto_id, proto::SASL);
    match recv(&mut s).await? {
        Performative::SaslMechanisms(m) => assert_eq!(m.mechanisms, vec!["ANONYMOUS"]),
        other => bail!("expected sasl-mechanisms, got {other:?}"),
    }
    send(
        &mut s,
        frame_type::SASL,
        Performative::SaslInit(SaslInit {
            mechanism: "ANONYMOUS".into(),
            initial_response: b"dave@example".to_vec(),
            hostname: None,
        }),
    )
    .await?;
    match recv(&mut s).await? {
        Performative::SaslOutcome(o) => assert_eq!(o.code, SaslCode::Ok),
        other => bail!("expected sasl-outcome, got {other:?}"),
    }

    send_open(&mut s).await?;
    let open = match recv(&mut s).await? {
        Performative::Open(o) => o,
        other => bail!("expected open, got {other:?}"),
    };
    assert_eq!(open.container_id, "e2e-server");
    match open.properties.get(open_props::AUTHENTICATED_IDENTITY) {
        Some(Value::Map(entries)) => assert!(entries
            .iter()
            .any(|(_, v)| v.as_str() == Some("dave@example"))),
        other => bail!("missing authenticated identity: {other:?}"),
    }

    // the listener closes accepted connections once OPEN is exchanged
    assert_eq!(recv(&mut s).await?, Performative::Close(Close { error: None }));
    expect_eof(&mut s).await?;

    handle.stop().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pipelined_client_is_accepted() -> Result<()> {
    let handle = start_server(Duration::from_secs(2)).await?;

    for _ in 0..16 {
        let mut s = TcpStream::connect(handle.local_addr()).await?;
        let mut wire = BytesMut::new();
        wire.extend_from_slice(&ProtoHeader::new(proto::SASL).to_bytes());
        write_frame(
            &mut wire,
            frame_type::SASL,
            0,
            &Performative::SaslInit(SaslInit {
                mechanism: "ANONYMOUS".into(),
                initial_response: b"batch@example".to_vec(),
                hostname: None,
            }),
        )?;
        wire.extend_from_slice(&ProtoHeader::new(proto::AMQP).to_bytes());
        write_frame(
            &mut wire,
            frame_type::AMQP,
            0,
            &Performative::Open(Open::new("e2e-client")),
        )?;
        s.write_all(&wire).await?;

        assert_eq!(recv_header(&mut s).await?.proto_id, proto::SASL);
        assert!(matches!(recv(&mut s).await?, Performative::SaslMechanisms(_)));
        match recv(&mut s).await? {
            Performative::SaslOutcome(o) => assert_eq!(o.code, SaslCode::Ok),
            other => bail!("expected sasl-outcome, got {other:?}"),
        }
        assert_eq!(recv_header(&mut s).await?.proto_id, proto::AMQP);
        assert!(matches!(recv(&mut s).await?, Performative::Open(_)));
        assert_eq!(recv(&mut s).await?, Performative::Close(Close { error: None }));
        expect_eof(&mut s).await?;
    }

    handle.stop().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn plain_amqp_is_forced_closed() -> Result<()> {
    let handle = start_server(Duration::from_secs(2)).await?;
    let mut s = TcpStream::connect(handle.local_addr()).await?;

    send_open(&mut s).await?;
    assert!(matches!(recv(&mut s).await?, Performative::Open(_)));
    match recv(&mut s).await? {
        Performative::Close(Close { error: Some(e) }) => {
            assert_eq!(e.condition, condition::CONNECTION_FORCED);
        }
        other => bail!("expected forced close, got {other:?}"),
    }
    expect_eof(&mut s).await?;

    handle.stop().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn slow_header_is_dropped() -> Result<()> {
    let handle = start_server(Duration::from_millis(150)).await?;
    let mut s = TcpStream::connect(handle.local_addr()).await?;

    // half a header, then nothing
    s.write_all(b"AM").await?;
    expect_eof(&mut s).await?;

    handle.stop().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_waits_for_in_flight_connections() -> Result<()> {
    let handle = start_server(Duration::from_secs(30)).await?;
    let addr = handle.local_addr();
    let mut idle = TcpStream::connect(addr).await?;
    // let the handler start
    tokio::time::sleep(Duration::from_millis(50)).await;

    tokio::time::timeout(Duration::from_secs(5), handle.stop()).await?;
    handle.stop().await;

    expect_eof(&mut idle).await?;
    assert!(TcpStream::connect(addr).await.is_err());
    Ok(())
}
