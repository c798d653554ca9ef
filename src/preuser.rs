//! Preuser stage: holding authenticated pairs while keysync runs.
//!
//! The first authenticated pair for a user creates a preuser; pairs
//! that authenticate while it is in flight queue up behind it. All of
//! them share fate: keysync success promotes every pair to the new
//! user stage in arrival order, failure answers every held LOGIN with
//! the same refusal.

use crate::error::{Error, Result};
use crate::keydir::KeyDir;
use crate::keysync::{HttpSync, run_keysync};
use crate::pool::{AuthPair, PoolMsg, Promotion};
use crate::proto::{Response, Status, Tagged, UntaggedData};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

const KEEPALIVE_PERIOD: Duration = Duration::from_secs(30);

pub(crate) enum PreuserMsg {
    AddPair(Box<AuthPair>),
}

pub(crate) struct PreuserHandle {
    pub tx: UnboundedSender<PreuserMsg>,
    pub cancel: CancellationToken,
}

pub(crate) struct Preuser {
    user: String,
    pass: String,
    keydir: Arc<dyn KeyDir>,
    http: Arc<dyn HttpSync>,
    api: Url,
    pairs: Vec<AuthPair>,
    rx: UnboundedReceiver<PreuserMsg>,
    cancel: CancellationToken,
    pool_tx: UnboundedSender<PoolMsg>,
}

impl Preuser {
    pub(crate) fn new(
        first: AuthPair,
        keydir: Arc<dyn KeyDir>,
        http: Arc<dyn HttpSync>,
        api: Url,
        pool_tx: UnboundedSender<PoolMsg>,
    ) -> (Self, PreuserHandle) {
        let (tx, rx) = unbounded_channel();
        let cancel = CancellationToken::new();
        let preuser = Self {
            user: first.user.clone(),
            pass: first.pass.clone(),
            keydir,
            http,
            api,
            pairs: vec![first],
            rx,
            cancel: cancel.clone(),
            pool_tx,
        };
        (preuser, PreuserHandle { tx, cancel })
    }

    pub(crate) async fn run(mut self) {
        let cancel = self.cancel.clone();
        let keysync_fut = run_keysync(
            self.http.clone(),
            self.keydir.clone(),
            self.api.clone(),
            self.pass.clone(),
        );
        tokio::pin!(keysync_fut);

        let mut keepalive = tokio::time::interval(KEEPALIVE_PERIOD);
        keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        keepalive.tick().await; // the first tick is immediate

        let result: Result<()> = loop {
            tokio::select! {
                () = cancel.cancelled() => break Err(Error::Cancelled),
                r = &mut keysync_fut => break r.map(|_| ()),
                Some(msg) = self.rx.recv() => match msg {
                    PreuserMsg::AddPair(pair) => self.add_pair(*pair).await,
                },
                _ = keepalive.tick() => self.keepalive().await,
            }
        };

        // Pairs that raced the keysync result onto our channel share
        // fate with the rest; anything sent after the close falls back
        // to the pool's re-route path.
        self.rx.close();
        while let Ok(PreuserMsg::AddPair(pair)) = self.rx.try_recv() {
            self.add_pair(*pair).await;
        }

        let user = self.user.clone();
        let outcome = match result {
            Ok(()) => {
                info!(user = %user, pairs = self.pairs.len(), "keysync succeeded, promoting");
                Ok(Promotion {
                    keydir: self.keydir,
                    pairs: self.pairs,
                })
            }
            Err(e) => {
                warn!(user = %user, error = %e, "preuser failed");
                Self::fail_pairs(self.pairs, &e).await;
                Err(e)
            }
        };
        let _ = self.pool_tx.send(PoolMsg::PreuserDone { user, outcome });
    }

    /// Queue another authenticated pair. It must carry the same
    /// credentials as the one that created this preuser; an impostor
    /// pair fails alone.
    async fn add_pair(&mut self, mut pair: AuthPair) {
        if pair.user != self.user || pair.pass != self.pass {
            warn!(user = %self.user, "queued pair with mismatched credentials");
            let _ = pair
                .server
                .send(&Response::Tagged(Tagged {
                    tag: pair.login_tag.clone(),
                    status: Status::No,
                    text: "credentials changed, try again".into(),
                }))
                .await;
            pair.server.bye("closing").await;
            pair.client.close().await;
            return;
        }
        debug!(user = %self.user, "queued pair behind keysync");
        self.pairs.push(pair);
    }

    /// The held pairs have seen no answer to their LOGIN yet; keep the
    /// connections from idling out while keysync runs.
    async fn keepalive(&mut self) {
        for pair in &mut self.pairs {
            let _ = pair
                .server
                .send(&Response::Untagged(UntaggedData::Status {
                    status: Status::Ok,
                    text: "keysync in progress".into(),
                }))
                .await;
        }
    }

    async fn fail_pairs(pairs: Vec<AuthPair>, e: &Error) {
        let text = match e {
            Error::Cancelled => "shutting down".to_string(),
            Error::Auth(msg) => format!("login rejected: {msg}"),
            _ => format!("login failed: {e}"),
        };
        for mut pair in pairs {
            let _ = pair
                .server
                .send(&Response::Tagged(Tagged {
                    tag: pair.login_tag.clone(),
                    status: Status::No,
                    text: text.clone(),
                }))
                .await;
            pair.server.bye("closing").await;
            pair.client.close().await;
        }
    }
}
