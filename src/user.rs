//! User stage: the steady-state per-user relay.
//!
//! One authenticated upstream client, N downstream sessions. Each
//! session is pumped by a child task into the user's event channel;
//! the user task owns the upstream connection, rewrites downstream
//! tags into its own monotone namespace, and applies the crypto pass
//! on message bodies in both directions.
//!
//! Multiplexing discipline: at most one in-flight upstream command per
//! session, commands beyond that queue per session in arrival order.
//! Untagged upstream data is routed to the session with the oldest
//! in-flight command, or fanned out to everyone when nothing is in
//! flight (which is how idling sessions hear about new mail).

use crate::endpoint::{ImapClient, ImapServer};
use crate::envelope;
use crate::error::{Error, Result};
use crate::keydir::KeyDir;
use crate::pool::{AuthPair, PoolMsg, Promotion};
use crate::proto::{
    Command, CommandBody, Response, Segment, Status, Tagged, UntaggedData, filter_capabilities,
};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub(crate) enum UserMsg {
    AddPair(Box<AuthPair>),
    Quit,
}

pub(crate) struct UserHandle {
    pub tx: UnboundedSender<UserMsg>,
    pub cancel: CancellationToken,
}

enum SessEvent {
    Cmd(u64, Command),
    Closed(u64),
    Failed(u64, Error),
}

enum SessionOut {
    Resp(Response),
    Bye(String),
    Close,
}

struct Session {
    out: UnboundedSender<SessionOut>,
    queue: VecDeque<Command>,
    inflight: bool,
    idling: bool,
    idle_tag: String,
}

pub(crate) struct User {
    name: String,
    #[allow(dead_code)]
    keydir: Arc<dyn KeyDir>,
    message_key: [u8; 32],
    client: ImapClient,
    caps: Vec<String>,
    sessions: HashMap<u64, Session>,
    next_sid: u64,
    /// Upstream tag -> (session, downstream tag), oldest first.
    inflight: VecDeque<(String, u64, String)>,
    pending: VecDeque<Response>,
    adopt: Vec<(ImapServer, String)>,
    spares: Vec<ImapClient>,
    rx: UnboundedReceiver<UserMsg>,
    sess_tx: UnboundedSender<SessEvent>,
    sess_rx: UnboundedReceiver<SessEvent>,
    cancel: CancellationToken,
    pool_tx: UnboundedSender<PoolMsg>,
    quitting: bool,
    logout_tag: Option<String>,
    logout_done: bool,
    upstream_dead: bool,
}

impl User {
    /// Build a user from a promotion. The originating pair contributes
    /// the upstream client; queued pairs' upstream connections are
    /// surplus and get closed on startup.
    pub(crate) fn new(
        name: String,
        promotion: Promotion,
        pool_tx: UnboundedSender<PoolMsg>,
    ) -> Result<(Self, UserHandle)> {
        let mut pairs = promotion.pairs;
        if pairs.is_empty() {
            return Err(Error::Internal("promotion without pairs".into()));
        }
        let first = pairs.remove(0);
        let message_key = promotion.keydir.message_key()?;

        let mut adopt = vec![(first.server, first.login_tag)];
        let mut spares = Vec::new();
        for pair in pairs {
            adopt.push((pair.server, pair.login_tag));
            spares.push(pair.client);
        }

        let (tx, rx) = unbounded_channel();
        let (sess_tx, sess_rx) = unbounded_channel();
        let cancel = CancellationToken::new();
        let user = Self {
            name,
            keydir: promotion.keydir,
            message_key,
            client: first.client,
            caps: first.caps,
            sessions: HashMap::new(),
            next_sid: 0,
            inflight: VecDeque::new(),
            pending: VecDeque::new(),
            adopt,
            spares,
            rx,
            sess_tx,
            sess_rx,
            cancel: cancel.clone(),
            pool_tx,
            quitting: false,
            logout_tag: None,
            logout_done: false,
            upstream_dead: false,
        };
        Ok((user, UserHandle { tx, cancel }))
    }

    pub(crate) async fn run(mut self) {
        for mut spare in std::mem::take(&mut self.spares) {
            spare.close().await;
        }
        for (server, login_tag) in std::mem::take(&mut self.adopt) {
            self.adopt(server, &login_tag);
        }
        info!(user = %self.name, sessions = self.sessions.len(), "user online");

        let cancel = self.cancel.clone();
        loop {
            while let Some(resp) = self.pending.pop_front() {
                if let Err(e) = self.on_upstream(resp).await {
                    warn!(user = %self.name, error = %e, "relay failed");
                    self.teardown("relay failure").await;
                    return self.report_gone().await;
                }
            }
            if self.quitting && self.logout_done && self.sessions.is_empty() {
                break;
            }

            tokio::select! {
                () = cancel.cancelled() => {
                    self.teardown("shutting down").await;
                    return self.report_gone().await;
                }
                Some(msg) = self.rx.recv() => match msg {
                    UserMsg::AddPair(pair) => self.add_pair(*pair).await,
                    UserMsg::Quit => self.begin_quit().await,
                },
                Some(ev) = self.sess_rx.recv() => {
                    if let Err(e) = self.on_session_event(ev).await {
                        warn!(user = %self.name, error = %e, "upstream send failed");
                        self.teardown("upstream connection lost").await;
                        return self.report_gone().await;
                    }
                }
                r = self.client.recv(), if !self.upstream_dead => match r {
                    Ok(resp) => self.pending.push_back(resp),
                    Err(e) => {
                        self.upstream_dead = true;
                        if self.quitting {
                            self.logout_done = true;
                        } else {
                            warn!(user = %self.name, error = %e, "upstream died");
                            self.teardown("upstream connection lost").await;
                            return self.report_gone().await;
                        }
                    }
                },
            }
        }
        self.client.close().await;
        self.report_gone().await;
    }

    /// Final accounting: refuse any pair that raced onto our channel,
    /// then tell the pool we are gone. Sends after the close fail and
    /// take the pool's re-route path instead.
    async fn report_gone(&mut self) {
        self.rx.close();
        while let Ok(msg) = self.rx.try_recv() {
            if let UserMsg::AddPair(pair) = msg {
                Self::refuse(*pair, "session ending, try again").await;
            }
        }
        let _ = self.pool_tx.send(PoolMsg::UserGone {
            user: self.name.clone(),
        });
    }

    async fn refuse(mut pair: AuthPair, text: &str) {
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

    /// Attach a downstream session and answer its deferred LOGIN.
    fn adopt(&mut self, server: ImapServer, login_tag: &str) {
        let sid = self.next_sid;
        self.next_sid += 1;
        let (out_tx, out_rx) = unbounded_channel();
        tokio::spawn(pump(sid, server, self.sess_tx.clone(), out_rx));
        let _ = out_tx.send(SessionOut::Resp(Response::Tagged(Tagged {
            tag: login_tag.to_string(),
            status: Status::Ok,
            text: "LOGIN completed".into(),
        })));
        self.sessions.insert(
            sid,
            Session {
                out: out_tx,
                queue: VecDeque::new(),
                inflight: false,
                idling: false,
                idle_tag: String::new(),
            },
        );
        debug!(user = %self.name, sid, "session attached");
    }

    async fn add_pair(&mut self, mut pair: AuthPair) {
        if self.quitting {
            Self::refuse(pair, "shutting down").await;
            return;
        }
        pair.client.close().await;
        self.adopt(pair.server, &pair.login_tag);
    }

    async fn begin_quit(&mut self) {
        if self.quitting {
            return;
        }
        self.quitting = true;
        info!(user = %self.name, "user quiescing");
        for session in self.sessions.values() {
            let _ = session.out.send(SessionOut::Bye("shutting down".into()));
        }
        let tag = self.client.alloc_tag();
        self.logout_tag = Some(tag.clone());
        match self.client.send(&Command::new(tag, CommandBody::Logout)).await {
            Ok(extras) => self.pending.extend(extras),
            Err(_) => {
                self.upstream_dead = true;
                self.logout_done = true;
            }
        }
    }

    async fn on_session_event(&mut self, ev: SessEvent) -> Result<()> {
        match ev {
            SessEvent::Cmd(sid, cmd) => {
                if let Some(session) = self.sessions.get_mut(&sid) {
                    session.queue.push_back(cmd);
                    self.drain_session(sid).await?;
                }
            }
            SessEvent::Closed(sid) => {
                self.sessions.remove(&sid);
                debug!(user = %self.name, sid, "session detached");
            }
            SessEvent::Failed(sid, e) => {
                self.sessions.remove(&sid);
                debug!(user = %self.name, sid, error = %e, "session failed");
            }
        }
        Ok(())
    }

    /// Feed queued commands for one session, keeping at most one in
    /// flight upstream.
    async fn drain_session(&mut self, sid: u64) -> Result<()> {
        loop {
            let Some(session) = self.sessions.get_mut(&sid) else {
                return Ok(());
            };
            if session.inflight {
                return Ok(());
            }
            let Some(cmd) = session.queue.pop_front() else {
                return Ok(());
            };
            let tag = cmd.tag.clone();
            match cmd.body {
                CommandBody::Capability => {
                    let mut caps = filter_capabilities(&self.caps);
                    if !caps.iter().any(|c| c == "IMAP4rev1") {
                        caps.insert(0, "IMAP4rev1".into());
                    }
                    let _ = session
                        .out
                        .send(SessionOut::Resp(Response::Untagged(UntaggedData::Capability(caps))));
                    Self::answer(session, &tag, Status::Ok, "CAPABILITY completed");
                }
                CommandBody::Noop => {
                    self.forward(sid, Command::new(tag, CommandBody::Noop)).await?;
                }
                CommandBody::Starttls => {
                    Self::answer(session, &tag, Status::Bad, "already authenticated");
                }
                CommandBody::Login { .. } => {
                    Self::answer(session, &tag, Status::Bad, "already logged in");
                }
                CommandBody::Logout => {
                    let _ = session.out.send(SessionOut::Resp(Response::Untagged(
                        UntaggedData::Bye {
                            text: "logging out".into(),
                        },
                    )));
                    Self::answer(session, &tag, Status::Ok, "LOGOUT completed");
                    let _ = session.out.send(SessionOut::Close);
                }
                CommandBody::Idle => {
                    session.idling = true;
                    session.idle_tag = tag;
                    let _ = session.out.send(SessionOut::Resp(Response::Continuation {
                        text: "idling".into(),
                    }));
                }
                CommandBody::Done => {
                    session.idling = false;
                    let idle_tag = std::mem::take(&mut session.idle_tag);
                    Self::answer(session, &idle_tag, Status::Ok, "IDLE terminated");
                }
                CommandBody::Append {
                    mailbox,
                    flags,
                    body,
                } => {
                    let sealed = envelope::encrypt(&self.message_key, &body)?;
                    self.forward(
                        sid,
                        Command::new(
                            tag,
                            CommandBody::Append {
                                mailbox,
                                flags,
                                body: sealed,
                            },
                        ),
                    )
                    .await?;
                }
                body @ CommandBody::Other { .. } => {
                    self.forward(sid, Command::new(tag, body)).await?;
                }
            }
        }
    }

    fn answer(session: &mut Session, tag: &str, status: Status, text: &str) {
        let _ = session.out.send(SessionOut::Resp(Response::Tagged(Tagged {
            tag: tag.to_string(),
            status,
            text: text.to_string(),
        })));
    }

    /// Rewrite the tag and send upstream. APPEND is serialized through
    /// this single write path, so literal streaming never interleaves.
    async fn forward(&mut self, sid: u64, cmd: Command) -> Result<()> {
        let uptag = self.client.alloc_tag();
        self.inflight.push_back((uptag.clone(), sid, cmd.tag.clone()));
        if let Some(session) = self.sessions.get_mut(&sid) {
            session.inflight = true;
        }
        let rewritten = Command::new(uptag, cmd.body);
        let extras = self.client.send(&rewritten).await?;
        self.pending.extend(extras);
        Ok(())
    }

    async fn on_upstream(&mut self, resp: Response) -> Result<()> {
        match resp {
            Response::Tagged(tagged) => {
                if self.logout_tag.as_deref() == Some(tagged.tag.as_str()) {
                    self.logout_done = true;
                    return Ok(());
                }
                let Some(pos) = self.inflight.iter().position(|(t, _, _)| *t == tagged.tag)
                else {
                    warn!(user = %self.name, tag = %tagged.tag, "completion for unknown tag");
                    return Ok(());
                };
                let Some((_, sid, downtag)) = self.inflight.remove(pos) else {
                    return Ok(());
                };
                if let Some(session) = self.sessions.get_mut(&sid) {
                    session.inflight = false;
                    let _ = session.out.send(SessionOut::Resp(Response::Tagged(Tagged {
                        tag: downtag,
                        status: tagged.status,
                        text: tagged.text,
                    })));
                }
                self.drain_session(sid).await
            }
            Response::Untagged(data) => {
                let data = match data {
                    UntaggedData::Fetch { seq, attrs } => self.decrypt_fetch(seq, attrs),
                    other => other,
                };
                if let Some(&(_, sid, _)) = self.inflight.front() {
                    if let Some(session) = self.sessions.get(&sid) {
                        let _ = session.out.send(SessionOut::Resp(Response::Untagged(data)));
                    }
                } else {
                    for session in self.sessions.values() {
                        let _ = session
                            .out
                            .send(SessionOut::Resp(Response::Untagged(data.clone())));
                    }
                }
                Ok(())
            }
            Response::Continuation { .. } => {
                warn!(user = %self.name, "unsolicited continuation from upstream");
                Ok(())
            }
        }
    }

    /// Open any enveloped body literals and recompute BODYSTRUCTURE
    /// from the cleartext when both travel in the same response.
    fn decrypt_fetch(&self, seq: u32, attrs: Vec<Segment>) -> UntaggedData {
        let mut decrypted: Option<Vec<u8>> = None;
        let mut attrs: Vec<Segment> = attrs
            .into_iter()
            .map(|seg| match seg {
                Segment::Literal(data) if envelope::is_envelope(&data) => {
                    match envelope::decrypt(&self.message_key, &data) {
                        Ok(plain) => {
                            if decrypted.is_none() {
                                decrypted = Some(plain.clone());
                            }
                            Segment::Literal(plain)
                        }
                        Err(e) => {
                            warn!(user = %self.name, seq, error = %e, "envelope failed to open");
                            Segment::Literal(data)
                        }
                    }
                }
                other => other,
            })
            .collect();

        if let Some(plain) = &decrypted {
            if let Ok(bs) = envelope::bodystructure(plain) {
                for seg in &mut attrs {
                    if let Segment::Text(text) = seg {
                        if let Some(rewritten) = envelope::replace_bodystructure(text, &bs) {
                            *text = rewritten;
                            break;
                        }
                    }
                }
            }
        }
        UntaggedData::Fetch { seq, attrs }
    }

    async fn teardown(&mut self, reason: &str) {
        for session in self.sessions.values() {
            let _ = session.out.send(SessionOut::Bye(reason.into()));
        }
        self.sessions.clear();
        self.client.close().await;
    }
}

/// Per-session child task: owns the downstream endpoint, forwards
/// parsed commands up and writes responses back. IDLE grammar
/// switching happens here so a fast DONE can never race the relay.
async fn pump(
    sid: u64,
    mut server: ImapServer,
    tx: UnboundedSender<SessEvent>,
    mut rx: UnboundedReceiver<SessionOut>,
) {
    loop {
        tokio::select! {
            r = server.recv() => match r {
                Ok(Some(cmd)) => {
                    match cmd.body {
                        CommandBody::Idle => server.set_idle(true),
                        CommandBody::Done => server.set_idle(false),
                        _ => {}
                    }
                    if tx.send(SessEvent::Cmd(sid, cmd)).is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    let _ = tx.send(SessEvent::Closed(sid));
                    break;
                }
                Err(e) => {
                    let _ = server.send_raw(b"* BAD protocol error\r\n").await;
                    server.bye("protocol error").await;
                    let _ = tx.send(SessEvent::Failed(sid, e));
                    break;
                }
            },
            out = rx.recv() => match out {
                Some(SessionOut::Resp(resp)) => {
                    if server.send(&resp).await.is_err() {
                        let _ = tx.send(SessEvent::Failed(
                            sid,
                            Error::Io(std::io::Error::other("downstream write failed")),
                        ));
                        break;
                    }
                }
                Some(SessionOut::Bye(text)) => {
                    server.bye(&text).await;
                    let _ = tx.send(SessEvent::Closed(sid));
                    break;
                }
                Some(SessionOut::Close) | None => {
                    server.close().await;
                    let _ = tx.send(SessEvent::Closed(sid));
                    break;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Connection, Security};
    use crate::keydir::PeerKey;
    use crate::proto::Extensions;
    use crate::reader::{CommandReader, ResponseReader};
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, duplex};
    use tokio::sync::mpsc;

    const KEY: [u8; 32] = [7u8; 32];

    struct TestKeyDir;

    impl KeyDir for TestKeyDir {
        fn user(&self) -> &str {
            "alice"
        }
        fn device_public(&self) -> String {
            "PUB".into()
        }
        fn fingerprint(&self) -> String {
            "fp".into()
        }
        fn sign(&self, _data: &[u8]) -> Result<Vec<u8>> {
            Ok(vec![])
        }
        fn verify(&self, _data: &[u8], _sig: &[u8]) -> Result<bool> {
            Ok(true)
        }
        fn peers(&self) -> Vec<PeerKey> {
            vec![]
        }
        fn set_peers(&self, _peers: Vec<PeerKey>) -> Result<()> {
            Ok(())
        }
        fn rotate(&self) -> Result<()> {
            Ok(())
        }
        fn message_key(&self) -> Result<[u8; 32]> {
            Ok(KEY)
        }
    }

    struct Fixture {
        downstreams: Vec<DuplexStream>,
        upstream: DuplexStream,
        handle: UserHandle,
        pool_rx: mpsc::UnboundedReceiver<PoolMsg>,
    }

    fn start_user(n_pairs: usize, upstream_literal_plus: bool) -> Fixture {
        let mut downstreams = Vec::new();
        let mut pairs = Vec::new();
        let (up_ours, up_theirs) = duplex(64 * 1024);
        let mut up_ours = Some(up_ours);
        for i in 0..n_pairs {
            let (dn_ours, dn_theirs) = duplex(64 * 1024);
            downstreams.push(dn_theirs);
            // Only the first pair's upstream connection is real; the
            // rest are surplus and get closed at startup.
            let (spare_ours, _spare_theirs) = duplex(1024);
            let conn = if let Some(real) = up_ours.take() {
                Connection::new(real, Security::Plain, None)
            } else {
                Connection::new(spare_ours, Security::Plain, None)
            };
            let mut client = ImapClient::new(conn, ResponseReader::new(Extensions::gateway()));
            client.set_literal_plus(upstream_literal_plus);
            pairs.push(AuthPair {
                server: ImapServer::new(
                    Connection::new(dn_ours, Security::Plain, None),
                    CommandReader::new(Extensions::gateway()),
                ),
                client,
                user: "alice".into(),
                pass: "pw".into(),
                login_tag: format!("login{i}"),
                caps: vec!["IMAP4rev1".into(), "IDLE".into(), "XSECRET".into()],
            });
        }
        let (pool_tx, pool_rx) = mpsc::unbounded_channel();
        let promotion = Promotion {
            keydir: Arc::new(TestKeyDir),
            pairs,
        };
        let (user, handle) = User::new("alice".into(), promotion, pool_tx).unwrap();
        tokio::spawn(user.run());
        Fixture {
            downstreams,
            upstream: up_theirs,
            handle,
            pool_rx,
        }
    }

    async fn read_line(stream: &mut DuplexStream) -> String {
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        while !line.ends_with(b"\n") {
            stream.read_exact(&mut byte).await.unwrap();
            line.push(byte[0]);
        }
        String::from_utf8(line).unwrap()
    }

    #[tokio::test]
    async fn adoption_answers_deferred_login() {
        let mut fx = start_user(2, false);
        assert_eq!(
            read_line(&mut fx.downstreams[0]).await,
            "login0 OK LOGIN completed\r\n"
        );
        assert_eq!(
            read_line(&mut fx.downstreams[1]).await,
            "login1 OK LOGIN completed\r\n"
        );
    }

    #[tokio::test]
    async fn rewrites_tags_both_ways() {
        let mut fx = start_user(1, false);
        read_line(&mut fx.downstreams[0]).await;

        fx.downstreams[0].write_all(b"t1 NOOP\r\n").await.unwrap();
        assert_eq!(read_line(&mut fx.upstream).await, "citm1 NOOP\r\n");
        fx.upstream
            .write_all(b"citm1 OK NOOP completed\r\n")
            .await
            .unwrap();
        assert_eq!(
            read_line(&mut fx.downstreams[0]).await,
            "t1 OK NOOP completed\r\n"
        );
    }

    #[tokio::test]
    async fn interleaved_sessions_route_by_tag() {
        let mut fx = start_user(2, false);
        read_line(&mut fx.downstreams[0]).await;
        read_line(&mut fx.downstreams[1]).await;

        fx.downstreams[0]
            .write_all(b"x1 UID FETCH 1 (FLAGS)\r\n")
            .await
            .unwrap();
        assert_eq!(
            read_line(&mut fx.upstream).await,
            "citm1 UID FETCH 1 (FLAGS)\r\n"
        );
        fx.downstreams[1].write_all(b"y1 NOOP\r\n").await.unwrap();
        assert_eq!(read_line(&mut fx.upstream).await, "citm2 NOOP\r\n");

        // Answer in reverse order; each session still gets its own.
        fx.upstream
            .write_all(b"citm2 OK NOOP completed\r\ncitm1 OK FETCH completed\r\n")
            .await
            .unwrap();
        assert_eq!(
            read_line(&mut fx.downstreams[1]).await,
            "y1 OK NOOP completed\r\n"
        );
        assert_eq!(
            read_line(&mut fx.downstreams[0]).await,
            "x1 OK FETCH completed\r\n"
        );
    }

    #[tokio::test]
    async fn append_body_is_sealed_upstream() {
        let mut fx = start_user(1, true);
        read_line(&mut fx.downstreams[0]).await;

        fx.downstreams[0]
            .write_all(b"a1 APPEND INBOX {5+}\r\nhello\r\n")
            .await
            .unwrap();

        let header = read_line(&mut fx.upstream).await;
        assert!(header.starts_with("citm1 APPEND \"INBOX\" {"));
        let len: usize = header
            .trim_end()
            .trim_end_matches("+}")
            .rsplit('{')
            .next()
            .unwrap()
            .parse()
            .unwrap();
        let mut body = vec![0u8; len + 2];
        fx.upstream.read_exact(&mut body).await.unwrap();
        let body = String::from_utf8(body).unwrap();
        assert!(body.contains("BEGIN CITM MESSAGE"));
        assert!(!body.contains("hello"));

        fx.upstream
            .write_all(b"citm1 OK APPEND completed\r\n")
            .await
            .unwrap();
        assert_eq!(
            read_line(&mut fx.downstreams[0]).await,
            "a1 OK APPEND completed\r\n"
        );
    }

    #[tokio::test]
    async fn fetch_body_is_opened_downstream() {
        let mut fx = start_user(1, false);
        read_line(&mut fx.downstreams[0]).await;

        fx.downstreams[0]
            .write_all(b"f1 UID FETCH 1 (BODY[])\r\n")
            .await
            .unwrap();
        read_line(&mut fx.upstream).await;

        let sealed = envelope::encrypt(&KEY, b"hello").unwrap();
        let mut resp = format!("* 1 FETCH (UID 1 BODY[] {{{}}}\r\n", sealed.len()).into_bytes();
        resp.extend_from_slice(&sealed);
        resp.extend_from_slice(b")\r\ncitm1 OK FETCH completed\r\n");
        fx.upstream.write_all(&resp).await.unwrap();

        assert_eq!(
            read_line(&mut fx.downstreams[0]).await,
            "* 1 FETCH (UID 1 BODY[] {5}\r\n"
        );
        let mut body = vec![0u8; 5];
        fx.downstreams[0].read_exact(&mut body).await.unwrap();
        assert_eq!(&body, b"hello");
        assert_eq!(read_line(&mut fx.downstreams[0]).await, ")\r\n");
        assert_eq!(
            read_line(&mut fx.downstreams[0]).await,
            "f1 OK FETCH completed\r\n"
        );
    }

    #[tokio::test]
    async fn idle_is_terminated_locally() {
        let mut fx = start_user(1, false);
        read_line(&mut fx.downstreams[0]).await;

        fx.downstreams[0].write_all(b"i1 IDLE\r\n").await.unwrap();
        assert_eq!(read_line(&mut fx.downstreams[0]).await, "+ idling\r\n");

        // Unsolicited upstream data reaches the idling session.
        fx.upstream.write_all(b"* 3 EXISTS\r\n").await.unwrap();
        assert_eq!(read_line(&mut fx.downstreams[0]).await, "* 3 EXISTS\r\n");

        fx.downstreams[0].write_all(b"DONE\r\n").await.unwrap();
        assert_eq!(
            read_line(&mut fx.downstreams[0]).await,
            "i1 OK IDLE terminated\r\n"
        );
    }

    #[tokio::test]
    async fn upstream_death_fails_all_sessions() {
        let mut fx = start_user(2, false);
        read_line(&mut fx.downstreams[0]).await;
        read_line(&mut fx.downstreams[1]).await;

        drop(fx.upstream);
        for dn in &mut fx.downstreams {
            let mut out = String::new();
            dn.read_to_string(&mut out).await.unwrap();
            assert!(out.contains("* BYE upstream connection lost"), "{out}");
        }
        assert!(matches!(
            fx.pool_rx.recv().await,
            Some(PoolMsg::UserGone { .. })
        ));
    }

    #[tokio::test]
    async fn quit_drains_and_logs_out() {
        let mut fx = start_user(2, false);
        read_line(&mut fx.downstreams[0]).await;
        read_line(&mut fx.downstreams[1]).await;

        fx.handle.tx.send(UserMsg::Quit).unwrap();
        assert_eq!(read_line(&mut fx.upstream).await, "citm1 LOGOUT\r\n");
        fx.upstream
            .write_all(b"* BYE shutting down\r\ncitm1 OK LOGOUT completed\r\n")
            .await
            .unwrap();

        for dn in &mut fx.downstreams {
            let mut out = String::new();
            dn.read_to_string(&mut out).await.unwrap();
            assert!(out.contains("* BYE shutting down"), "{out}");
        }
        assert!(matches!(
            fx.pool_rx.recv().await,
            Some(PoolMsg::UserGone { user }) if user == "alice"
        ));
    }
}
