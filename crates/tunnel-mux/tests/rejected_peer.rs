//! Scenario 6 (§8): a peer presents a certificate whose CN is a different
//! instance id. The handshake itself succeeds (both sides trust the same
//! signing authority), but the post-handshake identity check must reject the
//! connection before any frame is ever decoded — mirroring the accept loop's
//! `validate_peer` call in the server binary.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;

use tokio::net::TcpListener;
use tunnel_cert::{build_csr, initialize_key, validate_peer, InstanceIdentity, PeerValidationError, SigningAuthority};
use tunnel_mux::peer_certificate_der;

fn issue_cert(authority: &SigningAuthority, identity: &InstanceIdentity, addr: Ipv4Addr, dir: &std::path::Path) -> (String, String) {
    let key_pem = initialize_key(dir).unwrap();
    let mut addrs = BTreeSet::new();
    addrs.insert(addr);
    let csr_pem = build_csr(identity, &addrs, &key_pem).unwrap();
    let cert_pem = authority.issue(&csr_pem).unwrap();
    (cert_pem, key_pem)
}

#[tokio::test]
async fn a_peer_with_the_wrong_common_name_fails_identity_validation_after_a_successful_handshake() {
    let authority = SigningAuthority::new_self_signed().unwrap();
    let trust_anchor = authority.trust_anchor_pem();
    let loopback = Ipv4Addr::new(127, 0, 0, 1);

    let expected_identity = InstanceIdentity::new("arn:aws:ecs:us-east-1:123456789012:task/c/expected");
    let impostor_identity = InstanceIdentity::new("arn:aws:ecs:us-east-1:123456789012:task/c/impostor");

    let server_dir = tempfile::tempdir().unwrap();
    let (server_cert, server_key) = issue_cert(&authority, &expected_identity, loopback, server_dir.path());
    let client_dir = tempfile::tempdir().unwrap();
    let (client_cert, client_key) = issue_cert(&authority, &impostor_identity, loopback, client_dir.path());

    let server_config = tunnel_mux::build_server_config(&trust_anchor, &server_cert, &server_key).unwrap();
    let client_config = tunnel_mux::build_client_config(&trust_anchor, &client_cert, &client_key).unwrap();

    let listener = TcpListener::bind((loopback, 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server_task = tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        let tls = tunnel_mux::accept(tcp, server_config).await.unwrap();
        let (_, connection) = tls.get_ref();
        let peer_certs = connection.peer_certificates().unwrap();
        let peer_der = peer_certificate_der(peer_certs).unwrap().to_vec();
        // The identity check the server's accept loop runs before ever
        // handing the transport to the multiplexer.
        validate_peer(&peer_der, &expected_identity, loopback)
    });

    let server_name = rustls_pki_types::ServerName::IpAddress(rustls_pki_types::IpAddr::from(
        std::net::IpAddr::V4(loopback),
    ));
    let _client_tls = tunnel_mux::connect(addr, server_name, client_config).await.unwrap();

    let result = server_task.await.unwrap();
    match result {
        Err(PeerValidationError::CommonNameMismatch { expected, actual }) => {
            assert_eq!(expected, expected_identity.as_str());
            assert_eq!(actual, impostor_identity.as_str());
        }
        other => panic!("expected a common-name mismatch, got {other:?}"),
    }
}
