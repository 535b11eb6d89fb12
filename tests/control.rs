//! Control protocol over a real loopback socket, provisioning the in-process
//! broker.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use ip6tun::control::{
    self, BrokerProvisioner, ClientId, ControlCipher, ControlMessage, ControlService,
    ControlSettings, MessageType,
};
use ip6tun::{Broker, BrokerSettings};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const SECRET: &[u8] = b"an-example-control-secret-of-32+bytes";
const TIMEOUT: Duration = Duration::from_secs(5);

struct Harness {
    addr: String,
    broker: Broker,
    service: Arc<ControlService>,
    shutdown: CancellationToken,
    server: JoinHandle<()>,
}

async fn harness(mapping_ttl: Duration) -> Harness {
    let broker = Broker::new(BrokerSettings {
        bind_address: Ipv4Addr::LOCALHOST,
        ..BrokerSettings::default()
    });
    let service = Arc::new(ControlService::new(
        ControlCipher::new(SECRET).unwrap(),
        Arc::new(BrokerProvisioner::new(broker.clone())),
        ControlSettings {
            read_timeout: Duration::from_secs(1),
            mapping_ttl,
        },
    ));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let shutdown = CancellationToken::new();
    let server = tokio::spawn(Arc::clone(&service).serve(listener, shutdown.clone()));
    Harness {
        addr,
        broker,
        service,
        shutdown,
        server,
    }
}

fn free_port() -> u16 {
    let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    l.local_addr().unwrap().port()
}

fn message(kind: MessageType, local_port: u16, remote_port: u16) -> ControlMessage {
    ControlMessage {
        kind,
        client_id: ClientId::from_label("test-client"),
        local_port,
        remote_port,
    }
}

async fn send(h: &Harness, msg: &ControlMessage) -> ControlMessage {
    let cipher = ControlCipher::new(SECRET).unwrap();
    control::client::send(&h.addr, &cipher, msg, TIMEOUT)
        .await
        .unwrap()
}

async fn echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut rd, mut wr) = stream.into_split();
                let _ = tokio::io::copy(&mut rd, &mut wr).await;
            });
        }
    });
    addr
}

#[tokio::test]
async fn test_update_provisions_working_tunnel() {
    let h = harness(Duration::from_secs(3600)).await;
    let echo = echo_server().await;
    let listen_port = free_port();

    let reply = send(&h, &message(MessageType::Update, echo.port(), listen_port)).await;
    assert_eq!(reply.kind, MessageType::Acknowledge);
    assert_eq!(reply.client_id, ClientId::from_label("test-client"));

    let tunnels = h.broker.list().await;
    assert_eq!(tunnels.len(), 1);
    let tunnel = &tunnels[0];
    assert_eq!(tunnel.name(), ClientId::from_label("test-client").to_string());
    assert_eq!(tunnel.local_port(), listen_port);
    let target = tunnel.target().await;
    assert_eq!(target.host(), "127.0.0.1");
    assert_eq!(target.port(), echo.port());

    let mut c = TcpStream::connect((Ipv4Addr::LOCALHOST, listen_port))
        .await
        .unwrap();
    c.write_all(b"via control").await.unwrap();
    let mut buf = [0u8; 11];
    tokio::time::timeout(TIMEOUT, c.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"via control");

    let mappings = h.service.mappings().await;
    assert_eq!(mappings.len(), 1);
    assert_eq!(mappings[0].mapping.address, IpAddr::V4(Ipv4Addr::LOCALHOST));

    h.shutdown.cancel();
    h.server.await.unwrap();
    h.broker.close().await;
}

#[tokio::test]
async fn test_refresh_retargets_same_tunnel() {
    let h = harness(Duration::from_secs(3600)).await;
    let listen_port = free_port();

    send(&h, &message(MessageType::Update, 1000, listen_port)).await;
    let id = h.broker.list().await[0].id();
    let reply = send(&h, &message(MessageType::Update, 2000, listen_port)).await;
    assert_eq!(reply.kind, MessageType::Acknowledge);

    let tunnels = h.broker.list().await;
    assert_eq!(tunnels.len(), 1);
    assert_eq!(tunnels[0].id(), id);
    assert_eq!(tunnels[0].target().await.port(), 2000);
    h.broker.close().await;
}

#[tokio::test]
async fn test_delete_and_unknown_client() {
    let h = harness(Duration::from_secs(3600)).await;

    let reply = send(&h, &message(MessageType::Delete, 0, 0)).await;
    assert_eq!(reply.kind, MessageType::ErrorNoTunnel);

    send(&h, &message(MessageType::Update, 22, free_port())).await;
    assert_eq!(h.broker.len().await, 1);

    let reply = send(&h, &message(MessageType::Delete, 0, 0)).await;
    assert_eq!(reply.kind, MessageType::Acknowledge);
    assert!(h.broker.is_empty().await);
    assert!(h.service.mappings().await.is_empty());
}

#[tokio::test]
async fn test_provision_failure_replies_error() {
    let h = harness(Duration::from_secs(3600)).await;
    let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = occupied.local_addr().unwrap().port();

    let reply = send(&h, &message(MessageType::Update, 22, port)).await;
    assert_eq!(reply.kind, MessageType::ErrorNoTunnel);
    assert!(h.broker.is_empty().await);
    assert!(h.service.mappings().await.is_empty());
}

#[tokio::test]
async fn test_failed_port_change_forgets_mapping() {
    let h = harness(Duration::from_secs(3600)).await;
    let reply = send(&h, &message(MessageType::Update, 22, free_port())).await;
    assert_eq!(reply.kind, MessageType::Acknowledge);
    assert_eq!(h.service.mappings().await.len(), 1);

    // Moving to a port someone else holds tears the old tunnel down and
    // fails to bind the new one.
    let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let taken = occupied.local_addr().unwrap().port();
    let reply = send(&h, &message(MessageType::Update, 22, taken)).await;
    assert_eq!(reply.kind, MessageType::ErrorNoTunnel);
    assert!(h.broker.is_empty().await);
    assert!(h.service.mappings().await.is_empty());

    let reply = send(&h, &message(MessageType::Delete, 0, 0)).await;
    assert_eq!(reply.kind, MessageType::ErrorNoTunnel);
}

#[tokio::test]
async fn test_wrong_key_gets_no_reply() {
    let h = harness(Duration::from_secs(3600)).await;
    let other = ControlCipher::new(b"a-completely-different-32-byte-secret").unwrap();
    let res = control::client::send(
        &h.addr,
        &other,
        &message(MessageType::Update, 22, free_port()),
        TIMEOUT,
    )
    .await;
    assert!(res.is_err());
    assert!(h.broker.is_empty().await);
}

#[tokio::test]
async fn test_short_frame_times_out_server_side() {
    let h = harness(Duration::from_secs(3600)).await;
    let mut s = TcpStream::connect(&h.addr).await.unwrap();
    s.write_all(&[0u8; 10]).await.unwrap();

    // The server gives up after its read timeout and closes without a reply.
    let mut buf = Vec::new();
    let n = tokio::time::timeout(TIMEOUT, s.read_to_end(&mut buf))
        .await
        .expect("server never closed the connection");
    assert!(matches!(n, Ok(0) | Err(_)));
    assert!(h.broker.is_empty().await);
}

#[tokio::test]
async fn test_replies_are_ignored() {
    let h = harness(Duration::from_secs(3600)).await;
    let peer = IpAddr::V4(Ipv4Addr::LOCALHOST);
    assert!(h
        .service
        .handle(message(MessageType::Acknowledge, 1, 2), peer)
        .await
        .is_none());
    assert!(h
        .service
        .handle(message(MessageType::ErrorNoTunnel, 1, 2), peer)
        .await
        .is_none());
}

#[tokio::test]
async fn test_sweep_removes_expired_mappings() {
    let h = harness(Duration::from_millis(1)).await;
    send(&h, &message(MessageType::Update, 22, free_port())).await;
    assert_eq!(h.broker.len().await, 1);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(h.service.sweep_expired().await, 1);
    assert!(h.broker.is_empty().await);
    assert_eq!(h.service.sweep_expired().await, 0);

    let fresh = harness(Duration::from_secs(3600)).await;
    send(&fresh, &message(MessageType::Update, 22, free_port())).await;
    assert_eq!(fresh.service.sweep_expired().await, 0);
    assert_eq!(fresh.broker.len().await, 1);
    fresh.broker.close().await;
}

#[tokio::test]
async fn test_sweeper_runs_with_zero_interval() {
    let h = harness(Duration::from_millis(1)).await;
    send(&h, &message(MessageType::Update, 22, free_port())).await;

    let sweeper = tokio::spawn(
        Arc::clone(&h.service).run_sweeper(Duration::ZERO, h.shutdown.clone()),
    );
    tokio::time::timeout(TIMEOUT, async {
        while !h.broker.is_empty().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("sweeper never expired the mapping");
    assert!(h.service.mappings().await.is_empty());

    h.shutdown.cancel();
    sweeper.await.unwrap();
    h.server.await.unwrap();
}
