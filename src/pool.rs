//! User pool: the process-wide session registry.
//!
//! Owns every live stage. Incoming pairs start as anon instances in
//! the unowned set; an authenticated pair is routed to the user for
//! its identity, to the preuser still keysyncing for it, or into a
//! brand new preuser. For any user id there is at most one of
//! {preuser, user} at any instant.
//!
//! The pool runs as a single task and processes stage completions
//! strictly in arrival order, so the map is only ever touched from one
//! place. A refcount tracks live stages; quiesce is a [`Pause`] whose
//! condition is "refcount reached zero".

use crate::anon::{Anon, AnonOutcome};
use crate::connection::Connection;
use crate::endpoint::{ImapClient, ImapServer};
use crate::error::Result;
use crate::keydir::{self, KeyDir};
use crate::keysync::HttpSync;
use crate::pause::Pause;
use crate::preuser::{Preuser, PreuserHandle, PreuserMsg};
use crate::proto::{Response, Status, Tagged};
use crate::stub::Stub;
use crate::user::{User, UserHandle, UserMsg};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio::sync::oneshot;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

/// A connected but unauthenticated `{server, client}` pair.
pub struct Pair {
    pub server: ImapServer,
    pub client: ImapClient,
}

/// A pair that made it through LOGIN. The tagged LOGIN completion for
/// `login_tag` has not been sent yet; the adopting stage owes it.
pub struct AuthPair {
    pub server: ImapServer,
    pub client: ImapClient,
    pub user: String,
    pub pass: String,
    pub login_tag: String,
    pub caps: Vec<String>,
}

/// What a successful preuser hands to the new user stage.
pub(crate) struct Promotion {
    pub keydir: Arc<dyn KeyDir>,
    pub pairs: Vec<AuthPair>,
}

pub(crate) enum PoolMsg {
    NewPair(Box<Pair>),
    NewStub(Connection),
    /// Re-route an authenticated pair whose target stage completed
    /// while the pair was in flight to it.
    Route(Box<AuthPair>),
    AnonDone {
        id: u64,
        outcome: AnonOutcome,
    },
    StubDone {
        id: u64,
    },
    PreuserDone {
        user: String,
        outcome: Result<Promotion>,
    },
    UserGone {
        user: String,
    },
    Quit {
        ack: oneshot::Sender<()>,
    },
}

enum Entry {
    Preuser(PreuserHandle),
    User(UserHandle),
}

/// Everything stages need that the pool hands out.
pub struct PoolDeps {
    pub http: Arc<dyn HttpSync>,
    pub api: Url,
    pub maildir_root: PathBuf,
    pub acceptor: Option<TlsAcceptor>,
}

/// Cheap handle for submitting work to the pool task.
#[derive(Clone)]
pub struct PoolHandle {
    tx: UnboundedSender<PoolMsg>,
}

impl PoolHandle {
    /// Admit a freshly connected pair; it starts in the anon stage.
    pub fn new_pair(&self, pair: Pair) {
        let _ = self.tx.send(PoolMsg::NewPair(Box::new(pair)));
    }

    /// Admit a connection while no certificate is available.
    pub fn new_stub(&self, conn: Connection) {
        let _ = self.tx.send(PoolMsg::NewStub(conn));
    }

    /// Graceful shutdown: stop admitting, drain every stage, resolve
    /// once the last one is gone.
    pub async fn quit(&self) {
        let (ack, done) = oneshot::channel();
        if self.tx.send(PoolMsg::Quit { ack }).is_ok() {
            let _ = done.await;
        }
    }
}

pub struct UserPool {
    rx: UnboundedReceiver<PoolMsg>,
    tx: UnboundedSender<PoolMsg>,
    deps: PoolDeps,
    entries: HashMap<String, Entry>,
    unowned: HashMap<u64, CancellationToken>,
    stubs: HashMap<u64, CancellationToken>,
    next_id: u64,
    refs: Arc<AtomicUsize>,
    quitting: bool,
    quit_pause: Option<Pause>,
}

impl UserPool {
    #[must_use]
    pub fn new(deps: PoolDeps) -> (Self, PoolHandle) {
        let (tx, rx) = unbounded_channel();
        let pool = Self {
            rx,
            tx: tx.clone(),
            deps,
            entries: HashMap::new(),
            unowned: HashMap::new(),
            stubs: HashMap::new(),
            next_id: 0,
            refs: Arc::new(AtomicUsize::new(0)),
            quitting: false,
            quit_pause: None,
        };
        (pool, PoolHandle { tx })
    }

    /// Process messages until quiesce completes.
    pub async fn run(mut self) {
        while let Some(msg) = self.rx.recv().await {
            self.handle(msg).await;
            if self.try_finish() {
                break;
            }
        }
        info!("user pool drained");
    }

    async fn handle(&mut self, msg: PoolMsg) {
        match msg {
            PoolMsg::NewPair(pair) => self.on_new_pair(*pair).await,
            PoolMsg::NewStub(conn) => self.on_new_stub(conn),
            PoolMsg::Route(pair) => {
                if self.quitting {
                    Self::refuse_pair(*pair, "shutting down").await;
                } else {
                    self.route(*pair).await;
                }
            }
            PoolMsg::AnonDone { id, outcome } => self.on_anon_done(id, outcome).await,
            PoolMsg::StubDone { id } => {
                self.stubs.remove(&id);
                self.drop_ref();
            }
            PoolMsg::PreuserDone { user, outcome } => self.on_preuser_done(user, outcome).await,
            PoolMsg::UserGone { user } => {
                self.entries.remove(&user);
                self.drop_ref();
            }
            PoolMsg::Quit { ack } => self.on_quit(ack),
        }
    }

    fn add_ref(&self) {
        self.refs.fetch_add(1, Ordering::SeqCst);
    }

    fn drop_ref(&self) {
        let prev = self.refs.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "pool refcount underflow");
    }

    fn try_finish(&mut self) -> bool {
        if !self.quitting || self.refs.load(Ordering::SeqCst) != 0 {
            return false;
        }
        if let Some(pause) = self.quit_pause.take() {
            let _ = pause.run();
        }
        true
    }

    async fn on_new_pair(&mut self, mut pair: Pair) {
        if self.quitting {
            pair.server.bye("shutting down").await;
            pair.client.close().await;
            return;
        }
        let id = self.next_id;
        self.next_id += 1;
        let cancel = CancellationToken::new();
        self.unowned.insert(id, cancel.clone());
        self.add_ref();
        let anon = Anon::new(
            id,
            pair.server,
            pair.client,
            self.deps.acceptor.clone(),
            cancel,
            self.tx.clone(),
        );
        tokio::spawn(anon.run());
    }

    fn on_new_stub(&mut self, conn: Connection) {
        if self.quitting {
            return;
        }
        let id = self.next_id;
        self.next_id += 1;
        let cancel = CancellationToken::new();
        self.stubs.insert(id, cancel.clone());
        self.add_ref();
        let server = ImapServer::new(
            conn,
            crate::reader::CommandReader::new(crate::proto::Extensions::gateway()),
        );
        tokio::spawn(Stub::new(id, server, cancel, self.tx.clone()).run());
    }

    async fn on_anon_done(&mut self, id: u64, outcome: AnonOutcome) {
        self.unowned.remove(&id);
        self.drop_ref();
        match outcome {
            AnonOutcome::Closed => {}
            AnonOutcome::Failed(e) => warn!(error = %e, "anon pair failed"),
            AnonOutcome::Login(pair) => {
                if self.quitting {
                    Self::refuse_pair(*pair, "shutting down").await;
                } else {
                    self.route(*pair).await;
                }
            }
        }
    }

    /// Route an authenticated pair per the one-entry-per-user rule.
    async fn route(&mut self, pair: AuthPair) {
        match self.entries.get(&pair.user) {
            // A send failure means the stage just completed and its
            // terminal message is still queued behind us; putting the
            // pair back through the pool channel lands it after that
            // message, when the entry reflects reality again.
            Some(Entry::User(handle)) => {
                debug!(user = %pair.user, "attaching pair to existing user");
                if let Err(tokio::sync::mpsc::error::SendError(UserMsg::AddPair(pair))) =
                    handle.tx.send(UserMsg::AddPair(Box::new(pair)))
                {
                    let _ = self.tx.send(PoolMsg::Route(pair));
                }
            }
            Some(Entry::Preuser(handle)) => {
                debug!(user = %pair.user, "queueing pair behind keysync");
                if let Err(tokio::sync::mpsc::error::SendError(PreuserMsg::AddPair(pair))) =
                    handle.tx.send(PreuserMsg::AddPair(Box::new(pair)))
                {
                    let _ = self.tx.send(PoolMsg::Route(pair));
                }
            }
            None => {
                let user = pair.user.clone();
                let keydir = match keydir::open(&user, &self.deps.maildir_root) {
                    Ok(kd) => Arc::new(kd),
                    Err(e) => {
                        warn!(user = %user, error = %e, "key directory unavailable");
                        Self::refuse_pair(pair, "login failed").await;
                        return;
                    }
                };
                info!(user = %user, "starting preuser");
                let (preuser, handle) = Preuser::new(
                    pair,
                    keydir,
                    self.deps.http.clone(),
                    self.deps.api.clone(),
                    self.tx.clone(),
                );
                self.entries.insert(user, Entry::Preuser(handle));
                self.add_ref();
                tokio::spawn(preuser.run());
            }
        }
    }

    async fn on_preuser_done(&mut self, user: String, outcome: Result<Promotion>) {
        self.drop_ref();
        match outcome {
            Ok(promotion) => {
                if self.quitting {
                    for pair in promotion.pairs {
                        Self::refuse_pair(pair, "shutting down").await;
                    }
                    self.entries.remove(&user);
                    return;
                }
                match User::new(user.clone(), promotion, self.tx.clone()) {
                    Ok((stage, handle)) => {
                        self.entries.insert(user, Entry::User(handle));
                        self.add_ref();
                        tokio::spawn(stage.run());
                    }
                    Err(e) => {
                        warn!(user = %user, error = %e, "user stage failed to start");
                        self.entries.remove(&user);
                    }
                }
            }
            Err(e) => {
                debug!(user = %user, error = %e, "preuser torn down");
                self.entries.remove(&user);
            }
        }
    }

    fn on_quit(&mut self, ack: oneshot::Sender<()>) {
        if self.quitting {
            // A second quit gets its answer when the first completes;
            // with the pool already drained, answer now.
            if self.refs.load(Ordering::SeqCst) == 0 {
                let _ = ack.send(());
            }
            return;
        }
        info!("pool quiescing");
        self.quitting = true;
        for cancel in self.unowned.values() {
            cancel.cancel();
        }
        for cancel in self.stubs.values() {
            cancel.cancel();
        }
        for entry in self.entries.values() {
            match entry {
                Entry::Preuser(handle) => handle.cancel.cancel(),
                Entry::User(handle) => {
                    let _ = handle.tx.send(UserMsg::Quit);
                }
            }
        }
        let refs = self.refs.clone();
        self.quit_pause = Some(Pause::new(
            move || refs.load(Ordering::SeqCst) == 0,
            move || {
                let _ = ack.send(());
            },
            || {},
        ));
    }

    async fn refuse_pair(mut pair: AuthPair, text: &str) {
        let _ = pair
            .server
            .send(&Response::Tagged(Tagged {
                tag: pair.login_tag.clone(),
                status: Status::No,
                text: text.to_string(),
            }))
            .await;
        pair.server.bye("closing").await;
        pair.client.close().await;
    }
}

impl std::fmt::Debug for UserPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserPool")
            .field("entries", &self.entries.len())
            .field("unowned", &self.unowned.len())
            .field("refs", &self.refs.load(Ordering::SeqCst))
            .field("quitting", &self.quitting)
            .finish()
    }
}
