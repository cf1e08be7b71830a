//! End-to-end scenarios over real sockets: startup negotiation, TLS
//! bridging, cache hits, and single-flight collapse across sessions.


use std::time::Duration;

use bytes::Bytes;
use rustls::pki_types::ServerName;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use pgflight::protocol;
use pgflight::tls::TlsContextPair;

use proxy_test_support::{
    ProxyTestServer, assert_no_bytes, plain_handshake, read_n, startup_packet,
};

#[tokio::test]
async fn test_plain_relay_when_upstream_declines_tls() {
    let proxy = ProxyTestServer::start().await;
    let mut client = proxy.connect_client().await;
    let mut upstream = proxy.accept_upstream().await;

    // Client asks for TLS; the upstream declines.
    client.write_all(&protocol::SSL_REQUEST).await.unwrap();
    assert_eq!(read_n(&mut upstream, 8).await, protocol::SSL_REQUEST);
    upstream.write_all(b"N").await.unwrap();

    // The proxy declines to the client and forwards the captured packet.
    assert_eq!(read_n(&mut client, 1).await, b"N");
    assert_eq!(read_n(&mut upstream, 8).await, protocol::SSL_REQUEST);

    // Startup and subsequent traffic pass through byte-identical.
    plain_handshake(&mut client, &mut upstream).await;

    upstream.write_all(b"WELCOME").await.unwrap();
    assert_eq!(read_n(&mut client, 7).await, b"WELCOME");

    client.write_all(b"ARBITRARY").await.unwrap();
    assert_eq!(read_n(&mut upstream, 9).await, b"ARBITRARY");
}

#[tokio::test]
async fn test_non_ssl_startup_is_forwarded_verbatim() {
    let proxy = ProxyTestServer::start().await;
    let mut client = proxy.connect_client().await;
    let mut upstream = proxy.accept_upstream().await;

    plain_handshake(&mut client, &mut upstream).await;

    upstream.write_all(b"OK").await.unwrap();
    assert_eq!(read_n(&mut client, 2).await, b"OK");
}

#[tokio::test]
async fn test_dual_tls_bridges_encrypted_legs() {
    let proxy = ProxyTestServer::start().await;
    let mut client = proxy.connect_client().await;
    let mut upstream = proxy.accept_upstream().await;

    client.write_all(&protocol::SSL_REQUEST).await.unwrap();
    assert_eq!(read_n(&mut upstream, 8).await, protocol::SSL_REQUEST);
    upstream.write_all(b"S").await.unwrap();

    assert_eq!(read_n(&mut client, 1).await, b"S");

    // The test plays both outer parties: a TLS client toward the proxy and
    // a TLS server behind the fake upstream socket. The proxy shakes hands
    // with the client first, then with the upstream, so run both in parallel.
    let outer = TlsContextPair::new().unwrap();
    let server_name = ServerName::try_from("localhost").unwrap();
    let (client_tls, upstream_tls) = tokio::join!(
        outer.connector().connect(server_name, client),
        outer.acceptor().accept(upstream),
    );
    let mut client = client_tls.unwrap();
    let mut upstream = upstream_tls.unwrap();

    // The startup packet and all subsequent bytes flow over both TLS legs.
    let packet = startup_packet();
    client.write_all(&packet).await.unwrap();
    client.flush().await.unwrap();
    assert_eq!(read_n(&mut upstream, packet.len()).await, packet);

    upstream.write_all(b"WELCOME").await.unwrap();
    upstream.flush().await.unwrap();
    assert_eq!(read_n(&mut client, 7).await, b"WELCOME");

    client.write_all(b"PING").await.unwrap();
    client.flush().await.unwrap();
    assert_eq!(read_n(&mut upstream, 4).await, b"PING");
}

#[tokio::test]
async fn test_cache_hit_skips_upstream() {
    let proxy = ProxyTestServer::start().await;
    proxy
        .cache
        .put("SELECT 1", Bytes::from_static(b"XREPLY"))
        .await;

    let mut client = proxy.connect_client().await;
    let mut upstream = proxy.accept_upstream().await;
    plain_handshake(&mut client, &mut upstream).await;

    client
        .write_all(&protocol::build_query("SELECT 1"))
        .await
        .unwrap();
    assert_eq!(read_n(&mut client, 6).await, b"XREPLY");

    // The upstream never sees the query.
    assert_no_bytes(&mut upstream).await;
    let stats = proxy.cache.stats();
    assert_eq!(stats.l1_hits, 1);
}

#[tokio::test]
async fn test_identical_queries_collapse_to_one_upstream_execution() {
    let proxy = ProxyTestServer::start().await;

    let mut client_a = proxy.connect_client().await;
    let mut upstream_a = proxy.accept_upstream().await;
    plain_handshake(&mut client_a, &mut upstream_a).await;

    let mut client_b = proxy.connect_client().await;
    let mut upstream_b = proxy.accept_upstream().await;
    plain_handshake(&mut client_b, &mut upstream_b).await;

    let frame = protocol::build_query("SELECT x");

    // A leads: its query reaches the upstream.
    client_a.write_all(&frame).await.unwrap();
    assert_eq!(read_n(&mut upstream_a, frame.len()).await, frame);

    // B joins the same flight: its query is not forwarded.
    client_b.write_all(&frame).await.unwrap();
    assert_no_bytes(&mut upstream_b).await;

    // The upstream answers A; both clients receive the response.
    upstream_a.write_all(b"RESP").await.unwrap();
    assert_eq!(read_n(&mut client_a, 4).await, b"RESP");
    assert_eq!(read_n(&mut client_b, 4).await, b"RESP");

    // The response is memoized under the query's digest.
    assert_eq!(
        proxy.cache.get("SELECT x").await,
        Some(Bytes::from_static(b"RESP"))
    );
}

#[tokio::test]
async fn test_distinct_queries_do_not_collapse() {
    let proxy = ProxyTestServer::start().await;

    let mut client_a = proxy.connect_client().await;
    let mut upstream_a = proxy.accept_upstream().await;
    plain_handshake(&mut client_a, &mut upstream_a).await;

    let mut client_b = proxy.connect_client().await;
    let mut upstream_b = proxy.accept_upstream().await;
    plain_handshake(&mut client_b, &mut upstream_b).await;

    let frame_a = protocol::build_query("SELECT a");
    let frame_b = protocol::build_query("SELECT b");

    client_a.write_all(&frame_a).await.unwrap();
    client_b.write_all(&frame_b).await.unwrap();

    assert_eq!(read_n(&mut upstream_a, frame_a.len()).await, frame_a);
    assert_eq!(read_n(&mut upstream_b, frame_b.len()).await, frame_b);
}

#[tokio::test]
async fn test_graceful_shutdown_closes_listener() {
    let proxy = ProxyTestServer::start().await;
    proxy.shutdown.cancel();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(TcpStream::connect(("127.0.0.1", proxy.port)).await.is_err());
}
