//! Anon stage: a connected pair before authentication.
//!
//! Relays the pre-login conversation (CAPABILITY, STARTTLS), forwards
//! LOGIN upstream, and on success captures the credentials together
//! with the post-login capability set. The downstream tagged LOGIN
//! completion is deliberately *not* sent here: whoever adopts the pair
//! (user stage) or fails it (preuser) owes the client that answer.

use crate::endpoint::{ImapClient, ImapServer};
use crate::error::{Error, Result};
use crate::pool::{AuthPair, PoolMsg};
use crate::proto::{
    CommandBody, Response, Status, Tagged, UntaggedData, capability_code, filter_capabilities,
};
use tokio::sync::mpsc::UnboundedSender;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::connection::Security;

pub(crate) enum AnonOutcome {
    Login(Box<AuthPair>),
    Closed,
    Failed(Error),
}

struct LoginCapture {
    user: String,
    pass: String,
    login_tag: String,
    caps: Vec<String>,
}

pub(crate) struct Anon {
    id: u64,
    server: ImapServer,
    client: ImapClient,
    acceptor: Option<TlsAcceptor>,
    cancel: CancellationToken,
    pool_tx: UnboundedSender<PoolMsg>,
}

impl Anon {
    pub(crate) const fn new(
        id: u64,
        server: ImapServer,
        client: ImapClient,
        acceptor: Option<TlsAcceptor>,
        cancel: CancellationToken,
        pool_tx: UnboundedSender<PoolMsg>,
    ) -> Self {
        Self {
            id,
            server,
            client,
            acceptor,
            cancel,
            pool_tx,
        }
    }

    pub(crate) async fn run(mut self) {
        let cancel = self.cancel.clone();
        let result = tokio::select! {
            () = cancel.cancelled() => Err(Error::Cancelled),
            r = self.negotiate() => r,
        };

        let id = self.id;
        let pool_tx = self.pool_tx.clone();
        let Self {
            mut server,
            mut client,
            ..
        } = self;

        let outcome = match result {
            Ok(Some(login)) => AnonOutcome::Login(Box::new(AuthPair {
                server,
                client,
                user: login.user,
                pass: login.pass,
                login_tag: login.login_tag,
                caps: login.caps,
            })),
            Ok(None) => {
                server.close().await;
                client.close().await;
                AnonOutcome::Closed
            }
            Err(Error::Cancelled) => {
                server.bye("shutting down").await;
                client.close().await;
                AnonOutcome::Closed
            }
            Err(e) => {
                warn!(error = %e, "anon failed");
                server.bye("connection error").await;
                client.close().await;
                AnonOutcome::Failed(e)
            }
        };
        let _ = pool_tx.send(PoolMsg::AnonDone { id, outcome });
    }

    /// Drive the pre-authentication state machine. `Ok(None)` means the
    /// downstream went away (or logged out) before authenticating.
    async fn negotiate(&mut self) -> Result<Option<LoginCapture>> {
        self.server.greet("citm ready").await?;

        loop {
            let Some(cmd) = self.server.recv().await? else {
                return Ok(None);
            };
            let tag = cmd.tag.clone();
            match cmd.body {
                CommandBody::Capability => self.relay_capability(&tag).await?,
                CommandBody::Noop => {
                    self.tagged(&tag, Status::Ok, "NOOP completed").await?;
                }
                CommandBody::Starttls => self.starttls(&tag).await?,
                CommandBody::Login { user, pass } => {
                    if self.server.security() == Security::StartTls {
                        self.tagged(&tag, Status::No, "STARTTLS required before LOGIN")
                            .await?;
                        continue;
                    }
                    if let Some(capture) = self.login(&tag, user, pass).await? {
                        return Ok(Some(capture));
                    }
                }
                CommandBody::Logout => {
                    self.server
                        .send(&Response::Untagged(UntaggedData::Bye {
                            text: "logging out".into(),
                        }))
                        .await?;
                    self.tagged(&tag, Status::Ok, "LOGOUT completed").await?;
                    return Ok(None);
                }
                _ => {
                    self.tagged(&tag, Status::Bad, "log in first").await?;
                }
            }
        }
    }

    /// Relay CAPABILITY upstream, stripping extensions the gateway does
    /// not carry before answering downstream.
    async fn relay_capability(&mut self, tag: &str) -> Result<()> {
        let (untagged, tagged) = self.client.exchange(CommandBody::Capability).await?;
        let caps = extract_caps(&untagged, &tagged);
        self.server
            .send(&Response::Untagged(UntaggedData::Capability(
                filter_capabilities(&caps),
            )))
            .await?;
        self.tagged(tag, tagged.status, &tagged.text).await
    }

    async fn starttls(&mut self, tag: &str) -> Result<()> {
        if self.server.security() == Security::Tls {
            return self.tagged(tag, Status::Bad, "already using TLS").await;
        }
        let Some(acceptor) = self.acceptor.clone() else {
            return self.tagged(tag, Status::No, "STARTTLS unavailable").await;
        };
        self.tagged(tag, Status::Ok, "begin TLS negotiation now")
            .await?;
        self.server.starttls(&acceptor).await
    }

    /// Forward LOGIN upstream. On OK, re-issue CAPABILITY (the
    /// advertised set changes after authentication) and capture
    /// everything; on NO/BAD relay the refusal and stay.
    async fn login(
        &mut self,
        tag: &str,
        user: String,
        pass: String,
    ) -> Result<Option<LoginCapture>> {
        debug!(%user, "forwarding LOGIN upstream");
        let (_, tagged) = self
            .client
            .exchange(CommandBody::Login {
                user: user.clone(),
                pass: pass.clone(),
            })
            .await?;

        if tagged.status != Status::Ok {
            debug!(%user, status = ?tagged.status, "upstream refused LOGIN");
            self.tagged(tag, tagged.status, &tagged.text).await?;
            return Ok(None);
        }

        let (untagged, cap_tagged) = self.client.exchange(CommandBody::Capability).await?;
        if cap_tagged.status != Status::Ok {
            return Err(Error::Protocol(format!(
                "post-login CAPABILITY failed: {}",
                cap_tagged.text
            )));
        }
        let caps = extract_caps(&untagged, &cap_tagged);

        Ok(Some(LoginCapture {
            user,
            pass,
            login_tag: tag.to_string(),
            caps,
        }))
    }

    async fn tagged(&mut self, tag: &str, status: Status, text: &str) -> Result<()> {
        self.server
            .send(&Response::Tagged(Tagged {
                tag: tag.to_string(),
                status,
                text: text.to_string(),
            }))
            .await
    }
}

/// Pull a capability list out of an exchange: either an untagged
/// CAPABILITY response or a `[CAPABILITY ...]` code on the completion.
fn extract_caps(untagged: &[UntaggedData], tagged: &Tagged) -> Vec<String> {
    for data in untagged {
        if let UntaggedData::Capability(caps) = data {
            return caps.clone();
        }
    }
    capability_code(&tagged.text).unwrap_or_default()
}
