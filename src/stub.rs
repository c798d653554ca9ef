//! Stub stage: serving connections before a certificate exists.
//!
//! Between process start and the first successful cert provisioning
//! the gateway cannot offer STARTTLS, so it greets, admits to knowing
//! CAPABILITY, and turns everything else away.

use crate::endpoint::ImapServer;
use crate::pool::PoolMsg;
use crate::proto::{CommandBody, Response, Status, Tagged, UntaggedData};
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub(crate) struct Stub {
    id: u64,
    server: ImapServer,
    cancel: CancellationToken,
    pool_tx: UnboundedSender<PoolMsg>,
}

impl Stub {
    pub(crate) const fn new(
        id: u64,
        server: ImapServer,
        cancel: CancellationToken,
        pool_tx: UnboundedSender<PoolMsg>,
    ) -> Self {
        Self {
            id,
            server,
            cancel,
            pool_tx,
        }
    }

    pub(crate) async fn run(mut self) {
        let cancel = self.cancel.clone();
        tokio::select! {
            () = cancel.cancelled() => {}
            () = self.serve() => {}
        }
        self.server.close().await;
        let _ = self.pool_tx.send(PoolMsg::StubDone { id: self.id });
    }

    async fn serve(&mut self) {
        if self.server.greet("citm not ready").await.is_err() {
            return;
        }
        loop {
            let cmd = match self.server.recv().await {
                Ok(Some(cmd)) => cmd,
                Ok(None) | Err(_) => return,
            };
            let tag = cmd.tag.clone();
            let ok = match cmd.body {
                CommandBody::Capability => self.capability(&tag).await,
                CommandBody::Login { .. } => {
                    self.tagged(&tag, Status::Bad, "not ready for login").await
                }
                CommandBody::Noop => self.tagged(&tag, Status::Ok, "NOOP completed").await,
                CommandBody::Starttls => {
                    // No cert yet; decline and hang up.
                    let _ = self
                        .tagged(&tag, Status::No, "STARTTLS unavailable")
                        .await;
                    return;
                }
                CommandBody::Logout => {
                    let _ = self
                        .server
                        .send(&Response::Untagged(UntaggedData::Bye {
                            text: "logging out".into(),
                        }))
                        .await;
                    let _ = self.tagged(&tag, Status::Ok, "LOGOUT completed").await;
                    return;
                }
                _ => {
                    debug!(name = %cmd.body.name(), "stub closing on command");
                    let _ = self.tagged(&tag, Status::Bad, "not ready").await;
                    return;
                }
            };
            if !ok {
                return;
            }
        }
    }

    async fn capability(&mut self, tag: &str) -> bool {
        let caps = Response::Untagged(UntaggedData::Capability(vec![
            "IMAP4rev1".into(),
            "STARTTLS".into(),
        ]));
        if self.server.send(&caps).await.is_err() {
            return false;
        }
        self.tagged(tag, Status::Ok, "CAPABILITY completed").await
    }

    async fn tagged(&mut self, tag: &str, status: Status, text: &str) -> bool {
        self.server
            .send(&Response::Tagged(Tagged {
                tag: tag.to_string(),
                status,
                text: text.to_string(),
            }))
            .await
            .is_ok()
    }
}
