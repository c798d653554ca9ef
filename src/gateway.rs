//! Gateway harness: listeners, upstream dialing, and the quit signal.
//!
//! `Gateway::start` binds every listen spec and returns a running
//! handle; `RunningGateway::quit` translates the external stop signal
//! into the pool's quiesce and resolves when the pool has drained.
//!
//! Without a usable key/cert pair the gateway cannot offer STARTTLS,
//! so every accepted connection is served by the stub stage until the
//! operator provides one and restarts.

use crate::config::GatewayConfig;
use crate::connection::{Connection, Security, TcpUpstream, Upstream, tls_acceptor, tls_connector};
use crate::endpoint::{ImapClient, ImapServer};
use crate::error::Result;
use crate::keysync::{HttpSync, ReqwestSync};
use crate::pool::{Pair, PoolDeps, PoolHandle, UserPool};
use crate::proto::Extensions;
use crate::reader::{CommandReader, ResponseReader};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, info, warn};

pub struct Gateway {
    config: GatewayConfig,
    http: Arc<dyn HttpSync>,
}

impl Gateway {
    /// Build a gateway with the production keysync client.
    pub fn new(config: GatewayConfig) -> Result<Self> {
        let http: Arc<dyn HttpSync> = Arc::new(ReqwestSync::new()?);
        Ok(Self { config, http })
    }

    /// Build a gateway with a caller-provided keysync client (tests).
    #[must_use]
    pub fn with_http(config: GatewayConfig, http: Arc<dyn HttpSync>) -> Self {
        Self { config, http }
    }

    /// Bind all listeners and start serving.
    pub async fn start(self) -> Result<RunningGateway> {
        let acceptor = match tls_acceptor(&self.config.cert, &self.config.key) {
            Ok(acceptor) => Some(acceptor),
            Err(e) => {
                warn!(error = %e, "no usable certificate, serving stubs");
                None
            }
        };
        let connector = tls_connector(self.config.trust_upstream);
        let upstream: Arc<dyn Upstream> = Arc::new(TcpUpstream::new(
            self.config.remote.clone(),
            connector.clone(),
        ));

        let (pool, handle) = UserPool::new(PoolDeps {
            http: self.http,
            api: self.config.api.clone(),
            maildir_root: self.config.maildir_root.clone(),
            acceptor: acceptor.clone(),
        });
        let pool_task = tokio::spawn(pool.run());

        let mut addrs = Vec::new();
        let mut accept_tasks = Vec::new();
        for spec in &self.config.listens {
            let listener = TcpListener::bind((spec.host.as_str(), spec.port)).await?;
            let addr = listener.local_addr()?;
            info!(%spec, %addr, "listening");
            addrs.push(addr);
            accept_tasks.push(tokio::spawn(accept_loop(
                listener,
                spec.security,
                acceptor.clone(),
                connector.clone(),
                upstream.clone(),
                self.config.remote.host.clone(),
                handle.clone(),
            )));
        }

        if self.config.indicate_ready {
            // Service supervisors wait for this line on stdout.
            println!("READY");
        }

        Ok(RunningGateway {
            addrs,
            handle,
            pool_task,
            accept_tasks,
        })
    }
}

pub struct RunningGateway {
    addrs: Vec<SocketAddr>,
    handle: PoolHandle,
    pool_task: tokio::task::JoinHandle<()>,
    accept_tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl RunningGateway {
    /// The bound listener addresses, in listen-spec order.
    #[must_use]
    pub fn addrs(&self) -> &[SocketAddr] {
        &self.addrs
    }

    /// Graceful shutdown: stop accepting, quiesce the pool, return
    /// when every stage is gone.
    pub async fn quit(self) {
        info!("gateway shutting down");
        for task in &self.accept_tasks {
            task.abort();
        }
        self.handle.quit().await;
        let _ = self.pool_task.await;
    }
}

async fn accept_loop(
    listener: TcpListener,
    security: Security,
    acceptor: Option<TlsAcceptor>,
    connector: TlsConnector,
    upstream: Arc<dyn Upstream>,
    upstream_host: String,
    handle: PoolHandle,
) {
    loop {
        let (tcp, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };
        debug!(%peer, "accepted downstream connection");
        let acceptor = acceptor.clone();
        let connector = connector.clone();
        let upstream = upstream.clone();
        let upstream_host = upstream_host.clone();
        let handle = handle.clone();
        tokio::spawn(async move {
            handle_conn(
                tcp,
                peer,
                security,
                acceptor,
                &connector,
                upstream.as_ref(),
                &upstream_host,
                handle,
            )
            .await;
        });
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_conn(
    tcp: tokio::net::TcpStream,
    peer: SocketAddr,
    security: Security,
    acceptor: Option<TlsAcceptor>,
    connector: &TlsConnector,
    upstream: &dyn Upstream,
    upstream_host: &str,
    handle: PoolHandle,
) {
    let mut conn = Connection::new(tcp, security, Some(peer));

    if security == Security::Tls {
        let Some(acceptor) = &acceptor else {
            // Implicit-TLS listener with no cert: nothing to say.
            return;
        };
        if let Err(e) = conn.accept_tls(acceptor).await {
            debug!(%peer, error = %e, "TLS accept failed");
            return;
        }
    } else if acceptor.is_none() {
        handle.new_stub(conn);
        return;
    }

    let client_conn = match upstream.dial().await {
        Ok(up) => up,
        Err(e) => {
            warn!(%peer, error = %e, "upstream dial failed");
            let _ = conn
                .stream
                .write_all(b"* BYE upstream unavailable\r\n")
                .await;
            let _ = conn.stream.shutdown().await;
            return;
        }
    };

    let mut client = ImapClient::new(client_conn, ResponseReader::new(Extensions::gateway()));
    if let Err(e) = client.establish(connector, upstream_host).await {
        warn!(%peer, error = %e, "upstream session failed");
        let _ = conn
            .stream
            .write_all(b"* BYE upstream unavailable\r\n")
            .await;
        let _ = conn.stream.shutdown().await;
        client.close().await;
        return;
    }

    let server = ImapServer::new(conn, CommandReader::new(Extensions::gateway()));
    handle.new_pair(Pair { server, client });
}
