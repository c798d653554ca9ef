//! Session endpoints: framed duplex handles over a [`Connection`].
//!
//! [`ImapServer`] faces a downstream mail client and yields parsed
//! [`Command`]s; [`ImapClient`] faces the upstream server and yields
//! parsed [`Response`]s. Writes are awaited through to the socket,
//! which is what gives each session its backpressure: a stage that is
//! not consuming does not read, and a peer that is not draining blocks
//! the write.

use crate::connection::{Connection, Security};
use crate::error::{Error, Result};
use crate::proto::{
    Command, CommandBody, Response, Status, Tagged, UntaggedData, WireChunk, capability_code,
};
use crate::reader::{CommandReader, ResponseReader};
use std::collections::HashSet;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, trace};

const READ_CHUNK: usize = 8 * 1024;

/// Downstream-facing endpoint.
pub struct ImapServer {
    conn: Connection,
    reader: CommandReader,
    closed: bool,
}

impl ImapServer {
    #[must_use]
    pub fn new(conn: Connection, reader: CommandReader) -> Self {
        Self {
            conn,
            reader,
            closed: false,
        }
    }

    #[must_use]
    pub const fn security(&self) -> Security {
        self.conn.security
    }

    #[must_use]
    pub const fn is_closed(&self) -> bool {
        self.closed
    }

    /// Send the `* OK` greeting.
    pub async fn greet(&mut self, text: &str) -> Result<()> {
        self.send(&Response::Untagged(UntaggedData::Status {
            status: Status::Ok,
            text: text.to_string(),
        }))
        .await
    }

    /// Receive the next command. `Ok(None)` means the peer closed the
    /// connection cleanly. Synchronizing-literal continuations are
    /// answered here as a side effect.
    pub async fn recv(&mut self) -> Result<Option<Command>> {
        loop {
            if let Some(cmd) = self.reader.next()? {
                trace!(tag = %cmd.tag, name = %cmd.body.name(), "downstream command");
                return Ok(Some(cmd));
            }
            if self.reader.take_continuation_request() {
                self.send_raw(b"+ OK\r\n").await?;
            }
            let mut buf = [0u8; READ_CHUNK];
            let n = self.conn.stream.read(&mut buf).await?;
            if n == 0 {
                self.closed = true;
                return Ok(None);
            }
            self.reader.feed(&buf[..n]);
        }
    }

    pub async fn send(&mut self, resp: &Response) -> Result<()> {
        self.send_raw(&resp.to_bytes()).await
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.conn.stream.write_all(bytes).await?;
        self.conn.stream.flush().await?;
        Ok(())
    }

    /// Switch the reader in or out of the IDLE continuation grammar.
    pub fn set_idle(&mut self, on: bool) {
        self.reader.set_idle_done(on);
    }

    /// Upgrade the downstream connection after a STARTTLS exchange. The
    /// OK must already have been sent.
    pub async fn starttls(&mut self, acceptor: &TlsAcceptor) -> Result<()> {
        debug!("upgrading downstream to TLS");
        self.conn.accept_tls(acceptor).await
    }

    /// `* BYE`, then close.
    pub async fn bye(&mut self, text: &str) {
        let _ = self
            .send(&Response::Untagged(UntaggedData::Bye {
                text: text.to_string(),
            }))
            .await;
        self.close().await;
    }

    pub async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            let _ = self.conn.stream.shutdown().await;
        }
    }
}

/// Upstream-facing endpoint.
///
/// Allocates its own monotone tag namespace (`citm1`, `citm2`, ...)
/// and tracks the set of tags awaiting completion, so a tagged
/// response for an unknown tag is caught here rather than misrouted.
pub struct ImapClient {
    conn: Connection,
    reader: ResponseReader,
    tag_seq: u64,
    pending: HashSet<String>,
    literal_plus: bool,
}

impl ImapClient {
    #[must_use]
    pub fn new(conn: Connection, reader: ResponseReader) -> Self {
        Self {
            conn,
            reader,
            tag_seq: 0,
            pending: HashSet::new(),
            literal_plus: false,
        }
    }

    #[must_use]
    pub const fn literal_plus(&self) -> bool {
        self.literal_plus
    }

    /// Record that the upstream advertised `LITERAL+`; subsequent sends
    /// use non-synchronizing literals.
    pub fn set_literal_plus(&mut self, on: bool) {
        self.literal_plus = on;
    }

    pub fn alloc_tag(&mut self) -> String {
        self.tag_seq += 1;
        format!("citm{}", self.tag_seq)
    }

    /// Consume the server greeting. Captures a `[CAPABILITY ...]` code
    /// when present and handles the STARTTLS security mode.
    pub async fn establish(
        &mut self,
        connector: &TlsConnector,
        host: &str,
    ) -> Result<Option<Vec<String>>> {
        let greeting = self.recv().await?;
        let caps = match greeting {
            Response::Untagged(UntaggedData::Status {
                status: Status::Ok,
                ref text,
            }) => capability_code(text),
            Response::Untagged(UntaggedData::Bye { text }) => {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    format!("upstream sent BYE: {text}"),
                )));
            }
            other => {
                return Err(Error::Protocol(format!(
                    "unexpected upstream greeting: {other:?}"
                )));
            }
        };
        if self.conn.security == Security::StartTls {
            let (_, tagged) = self.exchange(CommandBody::Starttls).await?;
            if tagged.status != Status::Ok {
                return Err(Error::Tls(format!(
                    "upstream refused STARTTLS: {}",
                    tagged.text
                )));
            }
            self.conn.connect_tls(connector, host).await?;
        }
        if let Some(caps) = &caps {
            self.literal_plus = caps.iter().any(|c| c.eq_ignore_ascii_case("LITERAL+"));
        }
        Ok(caps)
    }

    /// Send a command upstream. For synchronizing literals this waits
    /// for the `+` continuation before each literal; any full responses
    /// that arrive in the meantime are returned for the caller to
    /// process.
    pub async fn send(&mut self, cmd: &Command) -> Result<Vec<Response>> {
        if !matches!(cmd.body, CommandBody::Done) {
            self.pending.insert(cmd.tag.clone());
        }
        trace!(tag = %cmd.tag, name = %cmd.body.name(), "upstream command");
        let chunks = cmd.to_chunks(self.literal_plus);
        let mut collected = Vec::new();
        let mut iter = chunks.into_iter().peekable();
        while let Some(chunk) = iter.next() {
            let (bytes, literal_next) = match &chunk {
                WireChunk::Line(b) => (
                    b.clone(),
                    matches!(iter.peek(), Some(WireChunk::Literal(_))),
                ),
                WireChunk::Literal(b) => (b.clone(), false),
            };
            self.conn.stream.write_all(&bytes).await?;
            self.conn.stream.flush().await?;
            if literal_next && !self.literal_plus {
                self.await_continuation(&mut collected).await?;
            }
        }
        Ok(collected)
    }

    async fn await_continuation(&mut self, collected: &mut Vec<Response>) -> Result<()> {
        loop {
            match self.recv().await? {
                Response::Continuation { .. } => return Ok(()),
                other => collected.push(other),
            }
        }
    }

    /// Receive the next upstream response. A closed upstream is an
    /// error here: the server owes us at least a BYE.
    pub async fn recv(&mut self) -> Result<Response> {
        loop {
            if let Some(resp) = self.reader.next()? {
                if let Response::Tagged(tagged) = &resp {
                    if !self.pending.remove(&tagged.tag) {
                        return Err(Error::Protocol(format!(
                            "tagged response for unknown tag {}",
                            tagged.tag
                        )));
                    }
                }
                return Ok(resp);
            }
            let mut buf = [0u8; READ_CHUNK];
            let n = self.conn.stream.read(&mut buf).await?;
            if n == 0 {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "upstream closed",
                )));
            }
            self.reader.feed(&buf[..n]);
        }
    }

    /// Send one command and collect everything up to its tagged
    /// completion. Only valid while no other command is in flight --
    /// the sequential stages (anon, preuser) use this.
    pub async fn exchange(&mut self, body: CommandBody) -> Result<(Vec<UntaggedData>, Tagged)> {
        let tag = self.alloc_tag();
        let cmd = Command::new(tag.clone(), body);
        let early = self.send(&cmd).await?;

        let mut untagged = Vec::new();
        let mut queue: std::collections::VecDeque<Response> = early.into();
        loop {
            let resp = if let Some(r) = queue.pop_front() {
                r
            } else {
                self.recv().await?
            };
            match resp {
                Response::Tagged(tagged) if tagged.tag == tag => {
                    return Ok((untagged, tagged));
                }
                Response::Tagged(tagged) => {
                    return Err(Error::Protocol(format!(
                        "interleaved completion for tag {}",
                        tagged.tag
                    )));
                }
                Response::Untagged(data) => untagged.push(data),
                Response::Continuation { .. } => {
                    return Err(Error::Protocol("unexpected continuation".into()));
                }
            }
        }
    }

    pub async fn close(&mut self) {
        let _ = self.conn.stream.shutdown().await;
    }
}
