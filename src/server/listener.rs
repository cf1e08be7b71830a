use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cache::QueryCache;
use crate::config::Config;
use crate::server::session::Session;
use crate::tls::TlsContextPair;

/// TCP acceptor bridging PostgreSQL clients to the upstream database.
pub struct Server {
    listener: TcpListener,
    next_session_id: AtomicU64,
    accepting: AtomicBool,
    shutdown: CancellationToken,
    config: Arc<Config>,
    cache: Arc<QueryCache>,
    tls: Arc<TlsContextPair>,
}

impl Server {
    /// Creates a server over an already-bound listener.
    pub fn new(
        listener: TcpListener,
        config: Arc<Config>,
        cache: Arc<QueryCache>,
        tls: Arc<TlsContextPair>,
    ) -> Self {
        Self {
            listener,
            next_session_id: AtomicU64::new(1),
            accepting: AtomicBool::new(true),
            shutdown: CancellationToken::new(),
            config,
            cache,
            tls,
        }
    }

    /// Token that stops the accept loop when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until shut down, then closes the listening
    /// endpoint and waits for in-flight sessions to finish naturally.
    pub async fn serve(self) -> io::Result<()> {
        let Self {
            listener,
            next_session_id,
            accepting,
            shutdown,
            config,
            cache,
            tls,
        } = self;

        info!(addr = %listener.local_addr()?, "accepting connections");
        let mut sessions = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    accepting.store(false, Ordering::SeqCst);
                    info!("listener shutting down");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((socket, peer_addr)) => {
                        if !accepting.load(Ordering::SeqCst) {
                            continue;
                        }
                        let id = next_session_id.fetch_add(1, Ordering::SeqCst);
                        info!(session = id, peer = %peer_addr, "accepted connection");

                        let session =
                            Session::new(id, config.clone(), cache.clone(), tls.clone());
                        sessions.spawn(async move {
                            session.run(socket).await;
                            info!(session = id, "connection closed");
                        });
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                },
            }
        }

        drop(listener);
        while sessions.join_next().await.is_some() {}
        info!("all sessions drained");
        Ok(())
    }
}
