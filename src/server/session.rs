mod error;

pub use error::SessionError;

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::{Outcome, QueryCache};
use crate::config::Config;
use crate::protocol;
use crate::server::stream::ProxyStream;
use crate::tls::TlsContextPair;

/// Read buffer size for each relay direction.
const BUFFER_SIZE: usize = 8192;

/// Peer-initiated termination indications that end a direction without
/// counting as an error. TLS truncation, shutdown alerts, and record-MAC
/// failures surface from rustls as io errors; cancellation surfaces as
/// `ConnectionAborted`.
fn is_benign_disconnect(e: &io::Error) -> bool {
    if matches!(
        e.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::BrokenPipe
    ) {
        return true;
    }
    let message = e.to_string();
    message.contains("close_notify")
        || message.contains("BadRecordMac")
        || message.contains("bad record mac")
        || message.contains("protocol is shutdown")
}

/// A single proxied client connection and its bound upstream connection.
///
/// The session performs the PostgreSQL startup dance (including the optional
/// in-line TLS upgrade on both legs), then bridges bytes in both directions
/// while sniffing client-to-server Query frames and driving the cache and
/// the single-flight coordinator.
pub struct Session {
    id: u64,
    config: Arc<Config>,
    cache: Arc<QueryCache>,
    tls: Arc<TlsContextPair>,
    /// Cancelled by `close`; every relay step observes it.
    cancel: CancellationToken,
    destroying: AtomicBool,
    client_eof: AtomicBool,
    server_eof: AtomicBool,
    /// The in-flight query text iff this session is its flight's leader.
    current_query: parking_lot::Mutex<Option<String>>,
}

impl Session {
    pub fn new(
        id: u64,
        config: Arc<Config>,
        cache: Arc<QueryCache>,
        tls: Arc<TlsContextPair>,
    ) -> Self {
        Self {
            id,
            config,
            cache,
            tls,
            cancel: CancellationToken::new(),
            destroying: AtomicBool::new(false),
            client_eof: AtomicBool::new(false),
            server_eof: AtomicBool::new(false),
            current_query: parking_lot::Mutex::new(None),
        }
    }

    /// Drives the session to completion and releases it.
    pub async fn run(&self, client: TcpStream) {
        if let Err(e) = self.drive(client).await {
            debug!(session = self.id, error = %e, "session ended with error");
        }
        self.close();
    }

    /// Closes the session. Idempotent: only the first call does anything.
    pub fn close(&self) {
        if self
            .destroying
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        debug!(session = self.id, "closing session");
        self.cancel.cancel();
    }

    /// The startup state machine, ending in the relay loops.
    async fn drive(&self, mut client: TcpStream) -> Result<(), SessionError> {
        let host = self.config.database.host.as_str();
        let port = self.config.database.port;

        let mut server = match TcpStream::connect((host, port)).await {
            Ok(server) => server,
            Err(e) => {
                error!(session = self.id, host, port, error = %e, "upstream connect failed");
                return Err(e.into());
            }
        };
        debug!(session = self.id, host, port, "connected to upstream");

        let mut buf = vec![0u8; BUFFER_SIZE];
        let n = match client.read(&mut buf).await {
            Ok(0) => {
                debug!(session = self.id, "client closed before startup");
                return Ok(());
            }
            Ok(n) => n,
            Err(e) if is_benign_disconnect(&e) => {
                debug!(session = self.id, error = %e, "client went away before startup");
                return Ok(());
            }
            Err(e) => {
                warn!(session = self.id, error = %e, "startup read failed");
                return Err(e.into());
            }
        };

        if !protocol::is_ssl_request(&buf[..n]) {
            // Not an SSLRequest: the first packet is the real startup.
            // Forward it verbatim and start bridging.
            server.write_all(&buf[..n]).await.inspect_err(
                |e| warn!(session = self.id, error = %e, "startup forward failed"),
            )?;
            debug!(session = self.id, "startup packet relayed, bridging");
            return self.relay(client.into(), server.into()).await;
        }

        let startup_packet = buf[..n].to_vec();
        info!(session = self.id, "client requested TLS");

        let upstream_tls = if self.config.ssl.enabled {
            self.probe_upstream_tls(&mut server).await?
        } else {
            debug!(session = self.id, "TLS bridging disabled, answering N");
            false
        };

        if !upstream_tls {
            info!(session = self.id, "continuing in plaintext");
            client.write_all(b"N").await.inspect_err(
                |e| warn!(session = self.id, error = %e, "failed to answer SSLRequest"),
            )?;
            server.write_all(&startup_packet).await.inspect_err(
                |e| warn!(session = self.id, error = %e, "startup forward failed"),
            )?;
            return self.relay(client.into(), server.into()).await;
        }

        // Both peers want TLS: accept the client first, then dial upstream.
        client.write_all(b"S").await.inspect_err(
            |e| warn!(session = self.id, error = %e, "failed to answer SSLRequest"),
        )?;

        let client_tls = match self.tls.acceptor().accept(client).await {
            Ok(stream) => stream,
            Err(e) if is_benign_disconnect(&e) => {
                debug!(session = self.id, error = %e, "client left during TLS handshake");
                return Ok(());
            }
            Err(e) => {
                error!(session = self.id, error = %e, "client TLS handshake failed");
                return Err(e.into());
            }
        };

        let server_name = ServerName::try_from(self.config.database.host.clone())?;
        let server_tls = match self.tls.connector().connect(server_name, server).await {
            Ok(stream) => stream,
            Err(e) => {
                error!(session = self.id, error = %e, "upstream TLS handshake failed");
                return Err(e.into());
            }
        };
        info!(session = self.id, "TLS established on both legs");

        let mut client: ProxyStream = client_tls.into();
        let mut server: ProxyStream = server_tls.into();

        // The real startup packet now arrives over TLS.
        let n = match client.read(&mut buf).await {
            Ok(0) => {
                debug!(session = self.id, "client closed after TLS handshake");
                return Ok(());
            }
            Ok(n) => n,
            Err(e) if is_benign_disconnect(&e) => {
                debug!(session = self.id, error = %e, "client left after TLS handshake");
                return Ok(());
            }
            Err(e) => {
                warn!(session = self.id, error = %e, "post-TLS startup read failed");
                return Err(e.into());
            }
        };
        server.write_all(&buf[..n]).await.inspect_err(
            |e| warn!(session = self.id, error = %e, "post-TLS startup forward failed"),
        )?;
        server.flush().await?;
        debug!(session = self.id, "startup packet relayed over TLS, bridging");

        self.relay(client, server).await
    }

    /// Sends an SSLRequest upstream and reads the one-byte verdict.
    ///
    /// The upstream may have dropped the idle socket between connect and
    /// probe; a failed probe write gets one fresh connection before failing
    /// the session.
    async fn probe_upstream_tls(&self, server: &mut TcpStream) -> Result<bool, SessionError> {
        if let Err(e) = server.write_all(&protocol::SSL_REQUEST).await {
            warn!(session = self.id, error = %e, "upstream went away before TLS probe, reconnecting");
            let host = self.config.database.host.as_str();
            let port = self.config.database.port;
            *server = TcpStream::connect((host, port)).await.inspect_err(
                |e| error!(session = self.id, error = %e, "upstream reconnect failed"),
            )?;
            server.write_all(&protocol::SSL_REQUEST).await.inspect_err(
                |e| warn!(session = self.id, error = %e, "TLS probe failed"),
            )?;
        }

        let mut verdict = [0u8; 1];
        server.read_exact(&mut verdict).await.inspect_err(
            |e| warn!(session = self.id, error = %e, "no verdict for TLS probe"),
        )?;
        debug!(session = self.id, verdict = %(verdict[0] as char), "upstream TLS verdict");
        Ok(verdict[0] == b'S')
    }

    /// Bridges bytes in both directions until both halves close or a fatal
    /// error cancels the session, then releases both endpoints.
    async fn relay(&self, client: ProxyStream, server: ProxyStream) -> Result<(), SessionError> {
        let (client_read, client_write) = tokio::io::split(client);
        let (server_read, server_write) = tokio::io::split(server);

        // Both loops funnel client-bound writes through one mutex, so a
        // cached response can never interleave with a relayed chunk.
        let client_write = Mutex::new(client_write);
        let server_write = Mutex::new(server_write);

        let client_to_server = self.client_to_server(client_read, &server_write, &client_write);
        let server_to_client = self.server_to_client(server_read, &client_write);
        let (c2s, s2c) = tokio::join!(client_to_server, server_to_client);

        // Initiate TLS shutdown on wrapped endpoints and close the sockets.
        let _ = client_write.lock().await.shutdown().await;
        let _ = server_write.lock().await.shutdown().await;

        c2s.and(s2c)
    }

    /// Client-to-server direction: sniffs Query frames and drives the
    /// leader/waiter protocol; everything else is forwarded verbatim.
    async fn client_to_server(
        &self,
        mut reader: ReadHalf<ProxyStream>,
        server_write: &Mutex<WriteHalf<ProxyStream>>,
        client_write: &Mutex<WriteHalf<ProxyStream>>,
    ) -> Result<(), SessionError> {
        let mut buf = vec![0u8; BUFFER_SIZE];
        loop {
            let n = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                read = reader.read(&mut buf) => match read {
                    Ok(0) => {
                        info!(session = self.id, "client closed connection");
                        self.mark_client_eof();
                        return Ok(());
                    }
                    Ok(n) => n,
                    Err(e) if is_benign_disconnect(&e) => {
                        debug!(session = self.id, error = %e, "client read ended");
                        self.mark_client_eof();
                        return Ok(());
                    }
                    Err(e) => {
                        warn!(session = self.id, error = %e, "client read failed");
                        self.close();
                        return Err(e.into());
                    }
                },
            };
            let chunk = &buf[..n];

            if protocol::is_query_frame(chunk) {
                let query = protocol::extract_query(chunk);
                if !query.is_empty() {
                    match self.cache.do_single_flight(&query).await {
                        Outcome::CacheHit(response) => {
                            info!(session = self.id, query = %query, "cache hit");
                            if !self.write_client(client_write, &response).await? {
                                return Ok(());
                            }
                            continue;
                        }
                        Outcome::Waiter(rx) => {
                            info!(session = self.id, query = %query, "waiting on in-flight query");
                            let response = tokio::select! {
                                _ = self.cancel.cancelled() => return Ok(()),
                                result = rx => match result {
                                    Ok(response) => response,
                                    Err(_) => {
                                        warn!(session = self.id, query = %query, "flight abandoned");
                                        self.close();
                                        return Err(SessionError::FlightAbandoned);
                                    }
                                },
                            };
                            if !self.write_client(client_write, &response).await? {
                                return Ok(());
                            }
                            continue;
                        }
                        Outcome::Leader => {
                            info!(session = self.id, query = %query, "leading upstream execution");
                            *self.current_query.lock() = Some(query);
                        }
                    }
                }
            }

            if self.server_eof.load(Ordering::SeqCst) {
                debug!(session = self.id, "upstream closed, dropping client bytes");
                return Ok(());
            }

            let mut writer = server_write.lock().await;
            match write_and_flush(&mut writer, chunk).await {
                Ok(()) => debug!(session = self.id, bytes = n, "forwarded to upstream"),
                Err(e) if is_benign_disconnect(&e) => {
                    debug!(session = self.id, error = %e, "upstream write ended");
                    return Ok(());
                }
                Err(e) => {
                    warn!(session = self.id, error = %e, "upstream write failed");
                    self.close();
                    return Err(e.into());
                }
            }
        }
    }

    /// Server-to-client direction. The first read after this session was
    /// elected leader carries the response to memoize and multicast.
    async fn server_to_client(
        &self,
        mut reader: ReadHalf<ProxyStream>,
        client_write: &Mutex<WriteHalf<ProxyStream>>,
    ) -> Result<(), SessionError> {
        let mut buf = vec![0u8; BUFFER_SIZE];
        loop {
            let n = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                read = reader.read(&mut buf) => match read {
                    Ok(0) => {
                        info!(session = self.id, "upstream closed connection");
                        self.mark_server_eof();
                        return Ok(());
                    }
                    Ok(n) => n,
                    Err(e) if is_benign_disconnect(&e) => {
                        debug!(session = self.id, error = %e, "upstream read ended");
                        self.mark_server_eof();
                        return Ok(());
                    }
                    Err(e) => {
                        warn!(session = self.id, error = %e, "upstream read failed");
                        self.close();
                        return Err(e.into());
                    }
                },
            };
            let chunk = &buf[..n];

            let leader_query = self.current_query.lock().take();
            if let Some(query) = leader_query {
                info!(session = self.id, query = %query, bytes = n, "publishing upstream response");
                self.cache
                    .notify_flight_result(&query, Bytes::copy_from_slice(chunk))
                    .await;
            }

            if self.client_eof.load(Ordering::SeqCst) {
                debug!(session = self.id, "client closed, dropping upstream bytes");
                return Ok(());
            }

            let mut writer = client_write.lock().await;
            match write_and_flush(&mut writer, chunk).await {
                Ok(()) => debug!(session = self.id, bytes = n, "forwarded to client"),
                Err(e) if is_benign_disconnect(&e) => {
                    debug!(session = self.id, error = %e, "client write ended");
                    return Ok(());
                }
                Err(e) => {
                    warn!(session = self.id, error = %e, "client write failed");
                    self.close();
                    return Err(e.into());
                }
            }
        }
    }

    /// Delivers a memoized or multicast response to the client. Returns
    /// false when the client leg ended benignly.
    async fn write_client(
        &self,
        client_write: &Mutex<WriteHalf<ProxyStream>>,
        response: &[u8],
    ) -> Result<bool, SessionError> {
        let mut writer = client_write.lock().await;
        match write_and_flush(&mut writer, response).await {
            Ok(()) => {
                debug!(session = self.id, bytes = response.len(), "response sent to client");
                Ok(true)
            }
            Err(e) if is_benign_disconnect(&e) => {
                debug!(session = self.id, error = %e, "client write ended");
                Ok(false)
            }
            Err(e) => {
                warn!(session = self.id, error = %e, "response write failed");
                self.close();
                Err(e.into())
            }
        }
    }

    fn mark_client_eof(&self) {
        self.client_eof.store(true, Ordering::SeqCst);
        if self.server_eof.load(Ordering::SeqCst) {
            self.close();
        }
    }

    fn mark_server_eof(&self) {
        self.server_eof.store(true, Ordering::SeqCst);
        if self.client_eof.load(Ordering::SeqCst) {
            self.close();
        }
    }
}

async fn write_and_flush(writer: &mut WriteHalf<ProxyStream>, chunk: &[u8]) -> io::Result<()> {
    writer.write_all(chunk).await?;
    writer.flush().await
}
