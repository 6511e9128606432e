//! End-to-end remoting over real TCP sockets.

use async_trait::async_trait;
use rcgen::{BasicConstraints, CertificateParams, IsCa, KeyPair};
use remora_types::config::{ConnectionParams, TlsConfig};
use remora_types::{HandlerId, Packet, RemotingError};
use remora_wire::{
    ConnectionState, EchoHandler, PacketDispatcher, PacketHandler, PacketReturner, PacketService,
    RemotingConnection, TcpConnector, TlsContextBuilder,
};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const ECHO: HandlerId = HandlerId(10);
const SILENT: HandlerId = HandlerId(11);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Records every packet; answers nothing.
struct Recorder {
    id: HandlerId,
    seen: mpsc::UnboundedSender<Packet>,
}

#[async_trait]
impl PacketHandler for Recorder {
    fn id(&self) -> HandlerId {
        self.id
    }

    async fn handle(&self, packet: Packet, _returner: Arc<dyn PacketReturner>) {
        let _ = self.seen.send(packet);
    }
}

async fn service_with(
    handlers: Vec<Arc<dyn PacketHandler>>,
    tls: Option<Arc<rustls::ServerConfig>>,
) -> Arc<PacketService> {
    let dispatcher = Arc::new(PacketDispatcher::new());
    for handler in handlers {
        dispatcher.register(handler).unwrap();
    }
    PacketService::start("127.0.0.1:0".parse().unwrap(), dispatcher, tls)
        .await
        .unwrap()
}

async fn connect(service: &PacketService, timeout_ms: u64) -> Arc<RemotingConnection> {
    let params = ConnectionParams {
        port: service.local_addr().port(),
        timeout_ms,
        ..ConnectionParams::default()
    };
    let connector = TcpConnector::new(params.address());
    let connection = Arc::new(RemotingConnection::new(Arc::new(connector), params));
    connection.start().await.unwrap();
    connection
}

#[tokio::test]
async fn test_one_way_reaches_handler_without_reply() {
    init_tracing();
    let (seen, mut seen_rx) = mpsc::unbounded_channel();
    let service = service_with(vec![Arc::new(Recorder { id: ECHO, seen })], None).await;
    let connection = connect(&service, 5_000).await;

    connection
        .send_one_way(ECHO, None, Packet::new(1, "hello"))
        .await
        .unwrap();

    let observed = seen_rx.recv().await.unwrap();
    assert_eq!(observed.target(), ECHO);
    assert!(!observed.expects_reply());
    assert_eq!(observed.payload().as_ref(), b"hello");
    assert_eq!(connection.pending_calls(), 0);

    connection.stop().await;
    service.stop().await;
}

#[tokio::test]
async fn test_blocking_echo() {
    init_tracing();
    let service = service_with(vec![Arc::new(EchoHandler::new(ECHO))], None).await;
    let connection = connect(&service, 5_000).await;

    let reply = connection
        .send_blocking(ECHO, ECHO, Packet::new(4, "ping"))
        .await
        .unwrap();

    assert_eq!(reply.target(), ECHO);
    assert_eq!(reply.kind(), 4);
    assert_eq!(reply.payload().as_ref(), b"ping");
    assert!(reply.correlation_id().is_some());
    assert_eq!(connection.pending_calls(), 0);

    connection.stop().await;
    service.stop().await;
}

#[tokio::test]
async fn test_concurrent_blocking_calls_get_their_own_replies() {
    init_tracing();
    let service = service_with(vec![Arc::new(EchoHandler::new(ECHO))], None).await;
    let connection = connect(&service, 5_000).await;

    let mut calls = Vec::new();
    for i in 0..32u32 {
        let connection = Arc::clone(&connection);
        calls.push(tokio::spawn(async move {
            let body = format!("call-{i}");
            let reply = connection
                .send_blocking(ECHO, ECHO, Packet::new(1, body.clone()))
                .await
                .unwrap();
            assert_eq!(reply.payload().as_ref(), body.as_bytes());
        }));
    }
    for call in calls {
        call.await.unwrap();
    }
    assert_eq!(connection.pending_calls(), 0);

    connection.stop().await;
    service.stop().await;
}

#[tokio::test]
async fn test_silent_handler_times_out_with_default_timeout() {
    init_tracing();
    let (seen, _seen_rx) = mpsc::unbounded_channel();
    let service = service_with(vec![Arc::new(Recorder { id: SILENT, seen })], None).await;
    let connection = connect(&service, 100).await;

    let started = tokio::time::Instant::now();
    let err = connection
        .send_blocking(SILENT, SILENT, Packet::empty(1))
        .await
        .unwrap_err();

    assert!(matches!(err, RemotingError::CallTimeout { .. }));
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert_eq!(connection.pending_calls(), 0);
    assert_eq!(connection.state(), ConnectionState::Started);

    connection.stop().await;
    service.stop().await;
}

#[tokio::test]
async fn test_stop_unwinds_pending_calls() {
    init_tracing();
    let (seen, mut seen_rx) = mpsc::unbounded_channel();
    let service = service_with(vec![Arc::new(Recorder { id: SILENT, seen })], None).await;
    let connection = connect(&service, 60_000).await;

    let mut calls = Vec::new();
    for _ in 0..4 {
        let connection = Arc::clone(&connection);
        calls.push(tokio::spawn(async move {
            connection
                .send_blocking(SILENT, SILENT, Packet::empty(1))
                .await
        }));
    }
    for _ in 0..4 {
        seen_rx.recv().await.unwrap();
    }

    connection.stop().await;

    for call in calls {
        assert!(matches!(
            call.await.unwrap(),
            Err(RemotingError::ConnectionClosed)
        ));
    }
    assert_eq!(connection.pending_calls(), 0);
    service.stop().await;
}

#[tokio::test]
async fn test_service_stop_closes_client() {
    init_tracing();
    let (seen, mut seen_rx) = mpsc::unbounded_channel();
    let service = service_with(vec![Arc::new(Recorder { id: SILENT, seen })], None).await;
    let connection = connect(&service, 60_000).await;

    let call = {
        let connection = Arc::clone(&connection);
        tokio::spawn(async move {
            connection
                .send_blocking(SILENT, SILENT, Packet::empty(1))
                .await
        })
    };
    seen_rx.recv().await.unwrap();

    service.stop().await;

    assert!(matches!(
        call.await.unwrap(),
        Err(RemotingError::ConnectionClosed)
    ));
    assert_eq!(connection.state(), ConnectionState::Stopped);
}

// ---------------------------------------------------------------------------
// TLS
// ---------------------------------------------------------------------------

struct Pki {
    ca_pem: String,
    server_pem: String,
}

fn pki() -> Pki {
    let mut ca_params = CertificateParams::new(Vec::<String>::new()).unwrap();
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    let ca_key = KeyPair::generate().unwrap();
    let ca_cert = ca_params.self_signed(&ca_key).unwrap();

    let leaf_params = CertificateParams::new(vec!["localhost".to_string()]).unwrap();
    let leaf_key = KeyPair::generate().unwrap();
    let leaf_cert = leaf_params.signed_by(&leaf_key, &ca_cert, &ca_key).unwrap();

    Pki {
        ca_pem: ca_cert.pem(),
        server_pem: format!("{}{}", leaf_cert.pem(), leaf_key.serialize_pem()),
    }
}

fn temp_store(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

#[tokio::test]
async fn test_blocking_echo_over_tls() {
    init_tracing();
    let pki = pki();
    let server_store = temp_store(&pki.server_pem);
    let ca_store = temp_store(&pki.ca_pem);

    let server_context = TlsContextBuilder::new(TlsConfig {
        keystore_path: Some(server_store.path().display().to_string()),
        ..TlsConfig::default()
    })
    .protocol_override(Vec::new())
    .build()
    .unwrap();
    let server_config = server_context.server_config(&[]).unwrap();
    let service = service_with(
        vec![Arc::new(EchoHandler::new(ECHO))],
        Some(server_config),
    )
    .await;

    let client_context = TlsContextBuilder::new(TlsConfig {
        truststore_path: Some(ca_store.path().display().to_string()),
        ..TlsConfig::default()
    })
    .protocol_override(Vec::new())
    .build()
    .unwrap();
    let params = ConnectionParams {
        port: service.local_addr().port(),
        ..ConnectionParams::default()
    };
    let connector = TcpConnector::new(params.address()).with_tls(
        Arc::new(client_context),
        "localhost",
        vec!["SSLv3".to_string(), "TLSv1.3".to_string()],
    );
    let connection = RemotingConnection::new(Arc::new(connector), params);
    connection.start().await.unwrap();

    let reply = connection
        .send_blocking(ECHO, ECHO, Packet::new(1, "secure"))
        .await
        .unwrap();
    assert_eq!(reply.payload().as_ref(), b"secure");

    connection.stop().await;
    service.stop().await;
}

#[tokio::test]
async fn test_tls_with_only_weak_protocols_fails_at_connect() {
    init_tracing();
    let pki = pki();
    let ca_store = temp_store(&pki.ca_pem);
    let client_context = TlsContextBuilder::new(TlsConfig {
        truststore_path: Some(ca_store.path().display().to_string()),
        ..TlsConfig::default()
    })
    .protocol_override(Vec::new())
    .build()
    .unwrap();

    let service = service_with(vec![Arc::new(EchoHandler::new(ECHO))], None).await;
    let params = ConnectionParams {
        port: service.local_addr().port(),
        ..ConnectionParams::default()
    };
    let connector = TcpConnector::new(params.address()).with_tls(
        Arc::new(client_context),
        "localhost",
        vec!["SSLv3".to_string(), "SSLv2Hello".to_string()],
    );
    let connection = RemotingConnection::new(Arc::new(connector), params);

    assert!(matches!(
        connection.start().await,
        Err(RemotingError::Tls(_))
    ));
    assert_eq!(connection.state(), ConnectionState::Created);
    service.stop().await;
}
