//! Loopback mutual-TLS handshake and frame delivery across a real
//! multiplexed connection, rather than the in-process `tokio::io::duplex`
//! pipes the unit tests use.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::TcpListener;
use tunnel_cert::{build_csr, initialize_key, InstanceIdentity, SigningAuthority};
use tunnel_mux::{
    build_client_config, build_server_config, peer_certificate_der, FrameSender, InboundHandler,
    StreamReceiver, StreamTable,
};
use tunnel_protocol::{ConnectOpenPayload, Frame, StreamId};

struct RecordingHandler {
    seen: Arc<tokio::sync::Notify>,
    last: Arc<std::sync::Mutex<Option<Frame>>>,
}

#[async_trait]
impl InboundHandler for RecordingHandler {
    async fn handle_new_stream(&self, opening_frame: Frame, _stream_rx: StreamReceiver, _reply_tx: FrameSender) {
        *self.last.lock().unwrap() = Some(opening_frame);
        self.seen.notify_one();
    }
}

fn issue_cert(authority: &SigningAuthority, identity: &InstanceIdentity, addr: Ipv4Addr, dir: &std::path::Path) -> (String, String) {
    let key_pem = initialize_key(dir).unwrap();
    let mut addrs = BTreeSet::new();
    addrs.insert(addr);
    let csr_pem = build_csr(identity, &addrs, &key_pem).unwrap();
    let cert_pem = authority.issue(&csr_pem).unwrap();
    (cert_pem, key_pem)
}

#[tokio::test]
async fn a_frame_sent_over_a_real_mutual_tls_connection_reaches_the_peers_handler() {
    let authority = SigningAuthority::new_self_signed().unwrap();
    let trust_anchor = authority.trust_anchor_pem();

    let server_identity = InstanceIdentity::new("arn:aws:ecs:us-east-1:123456789012:task/c/server");
    let client_identity = InstanceIdentity::new("arn:aws:ecs:us-east-1:123456789012:task/c/client");
    let loopback = Ipv4Addr::new(127, 0, 0, 1);

    let server_dir = tempfile::tempdir().unwrap();
    let (server_cert, server_key) = issue_cert(&authority, &server_identity, loopback, server_dir.path());
    let client_dir = tempfile::tempdir().unwrap();
    let (client_cert, client_key) = issue_cert(&authority, &client_identity, loopback, client_dir.path());

    let server_config = build_server_config(&trust_anchor, &server_cert, &server_key).unwrap();
    let client_config = build_client_config(&trust_anchor, &client_cert, &client_key).unwrap();

    let listener = TcpListener::bind((loopback, 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server_task = tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        let tls = tunnel_mux::accept(tcp, server_config).await.unwrap();
        let (_, connection) = tls.get_ref();
        let peer_certs = connection.peer_certificates().unwrap();
        peer_certificate_der(peer_certs).unwrap().to_vec();
        tls
    });

    let server_name = rustls_pki_types::ServerName::IpAddress(rustls_pki_types::IpAddr::from(
        std::net::IpAddr::V4(loopback),
    ));
    let client_tls = tunnel_mux::connect(addr, server_name, client_config).await.unwrap();
    let server_tls = server_task.await.unwrap();

    let table = Arc::new(StreamTable::new());
    let seen = Arc::new(tokio::sync::Notify::new());
    let last = Arc::new(std::sync::Mutex::new(None));
    let handler = Arc::new(RecordingHandler { seen: Arc::clone(&seen), last: Arc::clone(&last) });
    let (_server_frame_tx, _server_handle) = tunnel_mux::spawn(server_tls, table, handler);

    let client_table = Arc::new(StreamTable::new());
    let client_handler = Arc::new(RecordingHandler {
        seen: Arc::new(tokio::sync::Notify::new()),
        last: Arc::new(std::sync::Mutex::new(None)),
    });
    let (client_frame_tx, _client_handle) = tunnel_mux::spawn(client_tls, client_table, client_handler);

    let open = Frame::ConnectOpen(ConnectOpenPayload { id: StreamId::new(), address: "example.com:443".into() });
    client_frame_tx.send(open.clone()).await.unwrap();

    tokio::time::timeout(std::time::Duration::from_secs(5), seen.notified()).await.unwrap();
    let received = last.lock().unwrap().clone().unwrap();
    assert_eq!(received.stream_id(), open.stream_id());
}
