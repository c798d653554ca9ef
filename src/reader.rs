//! Incremental IMAP reader.
//!
//! IMAP input is not line-bounded: a counted literal (`{N}` or `{N+}`)
//! introduces exactly N raw octets regardless of CRLFs, after which the
//! surrounding line continues. The [`Scanner`] therefore accumulates a
//! *unit* -- alternating text fragments and literal payloads -- and the
//! side-specific readers parse completed units into [`Command`]s or
//! [`Response`]s.
//!
//! Feeding is decoupled from draining: callers [`feed`] whatever bytes
//! the socket produced, then call `next()` until it returns `None`.
//! Parse state persists across feeds, so EOF mid-token is simply "no
//! unit yet". Any syntax violation kills the reader permanently.
//!
//! [`feed`]: CommandReader::feed

use crate::error::{Error, Result};
use crate::proto::{
    Command, CommandBody, Extensions, Response, Segment, Status, Tagged, UntaggedData,
};

/// Default cap on a single literal. Anything larger is a protocol
/// error, not an allocation.
pub const DEFAULT_MAX_LITERAL: usize = 32 * 1024 * 1024;

#[derive(Debug)]
enum ScanState {
    Line,
    Literal { remaining: usize },
}

/// Splits a byte stream into units of alternating text fragments and
/// literal payloads.
#[derive(Debug)]
struct Scanner {
    buf: Vec<u8>,
    parts: Vec<Segment>,
    state: ScanState,
    max_literal: usize,
    allow_literal_plus: bool,
    /// Set when a synchronizing `{N}` marker was consumed; the owner
    /// must send a `+` continuation before the peer will transmit the
    /// literal octets.
    pending_continuation: bool,
}

impl Scanner {
    fn new(max_literal: usize, allow_literal_plus: bool) -> Self {
        Self {
            buf: Vec::new(),
            parts: Vec::new(),
            state: ScanState::Line,
            max_literal,
            allow_literal_plus,
            pending_continuation: false,
        }
    }

    fn feed(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    fn take_continuation(&mut self) -> bool {
        std::mem::take(&mut self.pending_continuation)
    }

    /// Parse a trailing `{N}` / `{N+}` marker. Returns `(count, plus)`.
    fn literal_marker(line: &str) -> Option<(usize, bool)> {
        let line = line.strip_suffix('}')?;
        let open = line.rfind('{')?;
        let mut digits = &line[open + 1..];
        let plus = if let Some(d) = digits.strip_suffix('+') {
            digits = d;
            true
        } else {
            false
        };
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        digits.parse().ok().map(|n| (n, plus))
    }

    fn next_unit(&mut self) -> Result<Option<Vec<Segment>>> {
        loop {
            match self.state {
                ScanState::Literal { remaining } => {
                    let take = remaining.min(self.buf.len());
                    if take > 0 {
                        let Some(Segment::Literal(data)) = self.parts.last_mut() else {
                            return Err(Error::Internal("scanner literal state desync".into()));
                        };
                        data.extend(self.buf.drain(..take));
                    }
                    let remaining = remaining - take;
                    if remaining > 0 {
                        self.state = ScanState::Literal { remaining };
                        return Ok(None);
                    }
                    self.state = ScanState::Line;
                }
                ScanState::Line => {
                    let Some(nl) = self.buf.iter().position(|&b| b == b'\n') else {
                        return Ok(None);
                    };
                    let mut line: Vec<u8> = self.buf.drain(..=nl).collect();
                    line.pop(); // \n
                    if line.last() == Some(&b'\r') {
                        line.pop();
                    }
                    let line = String::from_utf8(line)
                        .map_err(|_| Error::Protocol("non-ASCII bytes in line".into()))?;

                    if let Some((count, plus)) = Self::literal_marker(&line) {
                        if plus && !self.allow_literal_plus {
                            return Err(Error::Protocol(
                                "non-synchronizing literal without LITERAL+".into(),
                            ));
                        }
                        if count > self.max_literal {
                            return Err(Error::Protocol(format!(
                                "literal of {count} bytes exceeds limit"
                            )));
                        }
                        let text = &line[..line.rfind('{').unwrap_or(0)];
                        self.parts.push(Segment::Text(text.to_string()));
                        self.parts.push(Segment::Literal(Vec::with_capacity(count)));
                        if count == 0 {
                            self.state = ScanState::Line;
                        } else {
                            self.state = ScanState::Literal { remaining: count };
                        }
                        if !plus {
                            self.pending_continuation = true;
                        }
                    } else {
                        self.parts.push(Segment::Text(line));
                        return Ok(Some(std::mem::take(&mut self.parts)));
                    }
                }
            }
        }
    }
}

/// Cursor over a unit's segments for astring argument extraction.
struct Args<'a> {
    segs: &'a [Segment],
    idx: usize,
    pos: usize,
}

impl<'a> Args<'a> {
    const fn new(segs: &'a [Segment]) -> Self {
        Self { segs, idx: 0, pos: 0 }
    }

    /// Next argument as atom, quoted string, or literal.
    fn next_astring(&mut self) -> Result<Vec<u8>> {
        loop {
            match self.segs.get(self.idx) {
                None => return Err(Error::Protocol("missing argument".into())),
                Some(Segment::Literal(data)) => {
                    self.idx += 1;
                    self.pos = 0;
                    return Ok(data.clone());
                }
                Some(Segment::Text(t)) => {
                    let bytes = t.as_bytes();
                    while self.pos < bytes.len() && bytes[self.pos] == b' ' {
                        self.pos += 1;
                    }
                    if self.pos >= bytes.len() {
                        self.idx += 1;
                        self.pos = 0;
                        continue;
                    }
                    if bytes[self.pos] == b'"' {
                        let (out, after) = quoted_string(bytes, self.pos)?;
                        self.pos = after;
                        return Ok(out);
                    }
                    let start = self.pos;
                    while self.pos < bytes.len() && bytes[self.pos] != b' ' {
                        self.pos += 1;
                    }
                    return Ok(bytes[start..self.pos].to_vec());
                }
            }
        }
    }

    /// True when nothing but whitespace remains.
    fn exhausted(&self) -> bool {
        for (i, seg) in self.segs.iter().enumerate().skip(self.idx) {
            match seg {
                Segment::Literal(_) => return false,
                Segment::Text(t) => {
                    let from = if i == self.idx { self.pos } else { 0 };
                    if t.as_bytes()[from.min(t.len())..]
                        .iter()
                        .any(|&b| b != b' ')
                    {
                        return false;
                    }
                }
            }
        }
        true
    }

    /// Remaining segments, verbatim from the current position.
    fn rest(&self) -> Vec<Segment> {
        let mut out = Vec::new();
        for (i, seg) in self.segs.iter().enumerate().skip(self.idx) {
            if i == self.idx {
                if let Segment::Text(t) = seg {
                    out.push(Segment::Text(t[self.pos.min(t.len())..].to_string()));
                    continue;
                }
            }
            out.push(seg.clone());
        }
        out
    }
}

/// Parse a quoted string starting at `pos` (the opening quote).
/// Returns the unescaped contents and the position after the closing
/// quote.
fn quoted_string(bytes: &[u8], mut pos: usize) -> Result<(Vec<u8>, usize)> {
    pos += 1; // opening quote
    let mut out = Vec::new();
    while pos < bytes.len() {
        match bytes[pos] {
            b'"' => return Ok((out, pos + 1)),
            b'\\' => {
                pos += 1;
                let Some(&escaped) = bytes.get(pos) else {
                    break;
                };
                out.push(escaped);
                pos += 1;
            }
            b => {
                out.push(b);
                pos += 1;
            }
        }
    }
    Err(Error::Protocol("unterminated quoted string".into()))
}

fn valid_tag(tag: &str) -> bool {
    !tag.is_empty()
        && tag != "*"
        && tag
            .bytes()
            .all(|b| b.is_ascii_graphic() && !b"(){%*\"\\+".contains(&b))
}

/// Split `unit` into the leading word of its first text fragment and
/// an [`Args`] cursor positioned after it.
fn leading_word(unit: &[Segment]) -> Result<(String, Args<'_>)> {
    let Some(Segment::Text(first)) = unit.first() else {
        return Err(Error::Internal("unit without leading text".into()));
    };
    let trimmed = first.trim_start_matches(' ');
    let skipped = first.len() - trimmed.len();
    let end = trimmed.find(' ').unwrap_or(trimmed.len());
    let word = trimmed[..end].to_string();
    if word.is_empty() {
        return Err(Error::Protocol("empty line".into()));
    }
    let mut args = Args::new(unit);
    args.pos = skipped + end;
    Ok((word, args))
}

fn parse_append(args: &mut Args<'_>, unit: &[Segment]) -> Result<CommandBody> {
    let mailbox = String::from_utf8(args.next_astring()?)
        .map_err(|_| Error::Protocol("non-UTF-8 mailbox name".into()))?;

    // The message is the final literal; anything between the mailbox
    // and it (flag list, date-time) is relayed verbatim.
    let body_idx = unit
        .iter()
        .rposition(|s| matches!(s, Segment::Literal(_)))
        .ok_or_else(|| Error::Protocol("APPEND requires a literal".into()))?;
    if body_idx < args.idx {
        return Err(Error::Protocol("APPEND requires a message literal".into()));
    }
    let Segment::Literal(body) = &unit[body_idx] else {
        return Err(Error::Internal("rposition pointed at text".into()));
    };
    for seg in &unit[body_idx + 1..] {
        match seg {
            Segment::Literal(_) => {
                return Err(Error::Protocol("junk after APPEND literal".into()));
            }
            Segment::Text(t) => {
                if t.bytes().any(|b| b != b' ') {
                    return Err(Error::Protocol("junk after APPEND literal".into()));
                }
            }
        }
    }

    let mut flags = String::new();
    for (i, seg) in unit[..body_idx].iter().enumerate().skip(args.idx) {
        match seg {
            Segment::Literal(_) => {
                return Err(Error::Protocol("unexpected literal in APPEND flags".into()));
            }
            Segment::Text(t) => {
                let from = if i == args.idx { args.pos } else { 0 };
                flags.push_str(&t[from.min(t.len())..]);
            }
        }
    }
    let flags = flags.trim().to_string();

    Ok(CommandBody::Append {
        mailbox,
        flags: if flags.is_empty() { None } else { Some(flags) },
        body: body.clone(),
    })
}

fn parse_command(unit: &[Segment], exts: Extensions, idle_done: bool) -> Result<Command> {
    if idle_done {
        if let [Segment::Text(line)] = unit {
            if line.trim().eq_ignore_ascii_case("DONE") {
                return Ok(Command::new(String::new(), CommandBody::Done));
            }
        }
        return Err(Error::Protocol("expected DONE to end IDLE".into()));
    }

    let (tag, args) = leading_word(unit)?;
    if !valid_tag(&tag) {
        return Err(Error::Protocol(format!("invalid command tag: {tag:?}")));
    }

    let rest = args.rest();
    let (name, mut args) = leading_word(&rest)
        .map_err(|_| Error::Protocol("command without a name".into()))?;

    let body = match name.to_ascii_uppercase().as_str() {
        "CAPABILITY" => CommandBody::Capability,
        "NOOP" => CommandBody::Noop,
        "STARTTLS" => CommandBody::Starttls,
        "LOGOUT" => CommandBody::Logout,
        "IDLE" if exts.idle => CommandBody::Idle,
        "LOGIN" => {
            let user = String::from_utf8(args.next_astring()?)
                .map_err(|_| Error::Protocol("non-UTF-8 username".into()))?;
            let pass = String::from_utf8(args.next_astring()?)
                .map_err(|_| Error::Protocol("non-UTF-8 password".into()))?;
            if !args.exhausted() {
                return Err(Error::Protocol("LOGIN takes exactly two arguments".into()));
            }
            CommandBody::Login { user, pass }
        }
        "APPEND" => parse_append(&mut args, &rest)?,
        "UID" => {
            // Peek the subcommand for extension gating, then relay.
            let sub = String::from_utf8(Args::new(&args.rest()).next_astring().unwrap_or_default())
                .unwrap_or_default();
            if sub.eq_ignore_ascii_case("EXPUNGE") && !exts.uidplus {
                return Err(Error::Protocol("UID EXPUNGE requires UIDPLUS".into()));
            }
            CommandBody::Other {
                name,
                args: args.rest(),
            }
        }
        _ => CommandBody::Other {
            name,
            args: args.rest(),
        },
    };

    Ok(Command::new(tag, body))
}

fn parse_untagged(rest: &[Segment], exts: Extensions) -> Result<UntaggedData> {
    let (word, args) = leading_word(rest)?;

    if let Some(status) = Status::parse(&word) {
        let text = match args.rest().first() {
            Some(Segment::Text(t)) => t.trim_start().to_string(),
            _ => String::new(),
        };
        return Ok(UntaggedData::Status { status, text });
    }
    if word.eq_ignore_ascii_case("BYE") {
        let text = match args.rest().first() {
            Some(Segment::Text(t)) => t.trim_start().to_string(),
            _ => String::new(),
        };
        return Ok(UntaggedData::Bye { text });
    }
    if word.eq_ignore_ascii_case("CAPABILITY") {
        let caps = match args.rest().first() {
            Some(Segment::Text(t)) => t.split_whitespace().map(str::to_string).collect(),
            _ => Vec::new(),
        };
        return Ok(UntaggedData::Capability(caps));
    }
    if word.eq_ignore_ascii_case("VANISHED") && !exts.qresync {
        return Err(Error::Protocol("VANISHED requires QRESYNC".into()));
    }
    if let Ok(seq) = word.parse::<u32>() {
        let rest_after_seq = args.rest();
        if let Ok((kind, kind_args)) = leading_word(&rest_after_seq) {
            if kind.eq_ignore_ascii_case("FETCH") {
                return Ok(UntaggedData::Fetch {
                    seq,
                    attrs: kind_args.rest(),
                });
            }
        }
    }
    Ok(UntaggedData::Other(rest.to_vec()))
}

fn parse_response(unit: &[Segment], exts: Extensions) -> Result<Response> {
    let Some(Segment::Text(first)) = unit.first() else {
        return Err(Error::Internal("unit without leading text".into()));
    };

    if let Some(text) = first.strip_prefix('+') {
        if unit.len() > 1 {
            return Err(Error::Protocol("literal after continuation".into()));
        }
        return Ok(Response::Continuation {
            text: text.trim_start().to_string(),
        });
    }

    let (word, args) = leading_word(unit)?;
    if word == "*" {
        return Ok(Response::Untagged(parse_untagged(&args.rest(), exts)?));
    }

    if !valid_tag(&word) {
        return Err(Error::Protocol(format!("invalid response tag: {word:?}")));
    }
    let rest = args.rest();
    let (status_word, status_args) = leading_word(&rest)
        .map_err(|_| Error::Protocol("tagged response without status".into()))?;
    let status = Status::parse(&status_word)
        .ok_or_else(|| Error::Protocol(format!("unknown response status: {status_word}")))?;
    let text = match status_args.rest().first() {
        Some(Segment::Text(t)) => t.trim_start().to_string(),
        _ => String::new(),
    };
    Ok(Response::Tagged(Tagged {
        tag: word,
        status,
        text,
    }))
}

/// Server-side reader: bytes from a downstream client, out come
/// [`Command`]s.
#[derive(Debug)]
pub struct CommandReader {
    scanner: Scanner,
    exts: Extensions,
    idle_done: bool,
    dead: bool,
}

impl CommandReader {
    #[must_use]
    pub fn new(exts: Extensions) -> Self {
        Self {
            scanner: Scanner::new(DEFAULT_MAX_LITERAL, exts.literal_plus),
            exts,
            idle_done: false,
            dead: false,
        }
    }

    #[must_use]
    pub fn with_max_literal(exts: Extensions, max_literal: usize) -> Self {
        Self {
            scanner: Scanner::new(max_literal, exts.literal_plus),
            exts,
            idle_done: false,
            dead: false,
        }
    }

    pub fn feed(&mut self, chunk: &[u8]) {
        self.scanner.feed(chunk);
    }

    /// Switch the grammar into (or out of) the IDLE continuation state,
    /// in which the only acceptable input is a bare `DONE` line.
    pub fn set_idle_done(&mut self, on: bool) {
        self.idle_done = on;
    }

    /// True once per synchronizing literal marker: the caller must send
    /// a `+` continuation downstream.
    pub fn take_continuation_request(&mut self) -> bool {
        self.scanner.take_continuation()
    }

    /// Drain the next fully parsed command, if any. After the first
    /// error the reader is dead and keeps failing.
    pub fn next(&mut self) -> Result<Option<Command>> {
        if self.dead {
            return Err(Error::Protocol("reader is dead".into()));
        }
        let unit = match self.scanner.next_unit() {
            Ok(Some(unit)) => unit,
            Ok(None) => return Ok(None),
            Err(e) => {
                self.dead = true;
                return Err(e);
            }
        };
        match parse_command(&unit, self.exts, self.idle_done) {
            Ok(cmd) => Ok(Some(cmd)),
            Err(e) => {
                self.dead = true;
                Err(e)
            }
        }
    }
}

/// Client-side reader: bytes from the upstream server, out come
/// [`Response`]s.
#[derive(Debug)]
pub struct ResponseReader {
    scanner: Scanner,
    exts: Extensions,
    dead: bool,
}

impl ResponseReader {
    #[must_use]
    pub fn new(exts: Extensions) -> Self {
        // Upstream responses may always carry {N+}; only clients need
        // permission to send them.
        Self {
            scanner: Scanner::new(DEFAULT_MAX_LITERAL, true),
            exts,
            dead: false,
        }
    }

    pub fn feed(&mut self, chunk: &[u8]) {
        self.scanner.feed(chunk);
    }

    pub fn next(&mut self) -> Result<Option<Response>> {
        if self.dead {
            return Err(Error::Protocol("reader is dead".into()));
        }
        let unit = match self.scanner.next_unit() {
            Ok(Some(unit)) => unit,
            Ok(None) => return Ok(None),
            Err(e) => {
                self.dead = true;
                return Err(e);
            }
        };
        match parse_response(&unit, self.exts) {
            Ok(resp) => Ok(Some(resp)),
            Err(e) => {
                self.dead = true;
                Err(e)
            }
        }
    }
}
