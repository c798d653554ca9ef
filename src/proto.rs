//! IMAP protocol data model shared by both relay directions.
//!
//! The gateway only parses the commands it has to act on (LOGIN,
//! STARTTLS, APPEND, IDLE, ...). Everything else is carried as raw
//! argument [`Segment`]s so it can be relayed byte-for-byte, literals
//! included.

/// The extension set a reader was configured with.
///
/// Tokens belonging to an extension are only accepted in grammar
/// contexts that require that extension when the corresponding flag is
/// set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extensions {
    pub idle: bool,
    pub uidplus: bool,
    pub condstore: bool,
    pub qresync: bool,
    pub literal_plus: bool,
}

impl Extensions {
    /// No extensions at all, bare RFC 3501.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            idle: false,
            uidplus: false,
            condstore: false,
            qresync: false,
            literal_plus: false,
        }
    }

    /// The set the gateway itself implements on the downstream side.
    #[must_use]
    pub const fn gateway() -> Self {
        Self {
            idle: true,
            uidplus: true,
            condstore: false,
            qresync: false,
            literal_plus: true,
        }
    }
}

impl Default for Extensions {
    fn default() -> Self {
        Self::gateway()
    }
}

/// Capabilities the gateway is willing to advertise downstream.
///
/// Anything upstream offers beyond these is stripped before relay, so
/// clients never negotiate an extension the relay cannot carry.
pub const SUPPORTED_CAPABILITIES: &[&str] =
    &["IMAP4rev1", "STARTTLS", "IDLE", "UIDPLUS", "LITERAL+"];

/// Filter an advertised capability list down to what the gateway
/// supports. `AUTH=` mechanisms are dropped as well; the gateway only
/// relays LOGIN.
#[must_use]
pub fn filter_capabilities(caps: &[String]) -> Vec<String> {
    caps.iter()
        .filter(|c| {
            SUPPORTED_CAPABILITIES
                .iter()
                .any(|s| s.eq_ignore_ascii_case(c))
        })
        .cloned()
        .collect()
}

/// One piece of a command or response: either raw line text or the
/// contents of a counted literal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Text(String),
    Literal(Vec<u8>),
}

/// Tagged-response status per RFC 3501.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    No,
    Bad,
}

impl Status {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::No => "NO",
            Self::Bad => "BAD",
        }
    }

    #[must_use]
    pub fn parse(word: &str) -> Option<Self> {
        if word.eq_ignore_ascii_case("OK") {
            Some(Self::Ok)
        } else if word.eq_ignore_ascii_case("NO") {
            Some(Self::No)
        } else if word.eq_ignore_ascii_case("BAD") {
            Some(Self::Bad)
        } else {
            None
        }
    }
}

/// A fully parsed client command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub tag: String,
    pub body: CommandBody,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandBody {
    Capability,
    Noop,
    Starttls,
    Logout,
    Idle,
    /// The bare `DONE` line terminating an IDLE. Carries no tag.
    Done,
    Login {
        user: String,
        pass: String,
    },
    Append {
        mailbox: String,
        /// Flag list and optional date-time, verbatim, e.g. `(\Seen)`.
        flags: Option<String>,
        body: Vec<u8>,
    },
    /// Any command the gateway relays without interpreting. `args`
    /// holds everything after the command name, literals included;
    /// text segments keep their original spacing.
    Other {
        name: String,
        args: Vec<Segment>,
    },
}

impl CommandBody {
    /// Canonical (uppercase) command name, for logging and dispatch.
    #[must_use]
    pub fn name(&self) -> String {
        match self {
            Self::Capability => "CAPABILITY".into(),
            Self::Noop => "NOOP".into(),
            Self::Starttls => "STARTTLS".into(),
            Self::Logout => "LOGOUT".into(),
            Self::Idle => "IDLE".into(),
            Self::Done => "DONE".into(),
            Self::Login { .. } => "LOGIN".into(),
            Self::Append { .. } => "APPEND".into(),
            Self::Other { name, .. } => name.to_ascii_uppercase(),
        }
    }
}

/// A unit of outbound wire data. Senders that must honor synchronizing
/// literals wait for a `+` continuation before each `Literal` chunk;
/// everyone else just concatenates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireChunk {
    /// A complete line, CRLF included.
    Line(Vec<u8>),
    /// Raw literal octets, exactly as counted by the preceding marker.
    Literal(Vec<u8>),
}

/// Quote a string per the IMAP `quoted` grammar.
#[must_use]
pub fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

fn literal_marker(len: usize, lit_plus: bool) -> String {
    if lit_plus {
        format!("{{{len}+}}")
    } else {
        format!("{{{len}}}")
    }
}

/// Append `segments` to a chunk list, inserting literal markers where
/// text gives way to literal data. `head` is the already-assembled
/// start of the first line.
fn segments_to_chunks(
    head: String,
    segments: &[Segment],
    lit_plus: bool,
    out: &mut Vec<WireChunk>,
) {
    let mut line = head;
    for seg in segments {
        match seg {
            Segment::Text(t) => line.push_str(t),
            Segment::Literal(data) => {
                line.push_str(&literal_marker(data.len(), lit_plus));
                line.push_str("\r\n");
                out.push(WireChunk::Line(line.into_bytes()));
                out.push(WireChunk::Literal(data.clone()));
                line = String::new();
            }
        }
    }
    line.push_str("\r\n");
    out.push(WireChunk::Line(line.into_bytes()));
}

impl Command {
    #[must_use]
    pub const fn new(tag: String, body: CommandBody) -> Self {
        Self { tag, body }
    }

    /// Serialize for transmission. `lit_plus` selects non-synchronizing
    /// `{N+}` literals; the sender is expected to stream `Literal`
    /// chunks without waiting for continuation in that case.
    #[must_use]
    pub fn to_chunks(&self, lit_plus: bool) -> Vec<WireChunk> {
        let tag = &self.tag;
        let mut out = Vec::new();
        match &self.body {
            CommandBody::Capability
            | CommandBody::Noop
            | CommandBody::Starttls
            | CommandBody::Logout
            | CommandBody::Idle => {
                let line = format!("{tag} {}\r\n", self.body.name());
                out.push(WireChunk::Line(line.into_bytes()));
            }
            CommandBody::Done => {
                out.push(WireChunk::Line(b"DONE\r\n".to_vec()));
            }
            CommandBody::Login { user, pass } => {
                let line = format!("{tag} LOGIN {} {}\r\n", quote(user), quote(pass));
                out.push(WireChunk::Line(line.into_bytes()));
            }
            CommandBody::Append {
                mailbox,
                flags,
                body,
            } => {
                let mut head = format!("{tag} APPEND {}", quote(mailbox));
                if let Some(flags) = flags {
                    head.push(' ');
                    head.push_str(flags);
                }
                head.push(' ');
                head.push_str(&literal_marker(body.len(), lit_plus));
                head.push_str("\r\n");
                out.push(WireChunk::Line(head.into_bytes()));
                out.push(WireChunk::Literal(body.clone()));
                out.push(WireChunk::Line(b"\r\n".to_vec()));
            }
            CommandBody::Other { name, args } => {
                segments_to_chunks(format!("{tag} {name}"), args, lit_plus, &mut out);
            }
        }
        out
    }
}

/// A fully parsed server response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Tagged(Tagged),
    Continuation { text: String },
    Untagged(UntaggedData),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tagged {
    pub tag: String,
    pub status: Status,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UntaggedData {
    Capability(Vec<String>),
    /// Untagged `* OK`/`* NO`/`* BAD`, including the greeting.
    Status { status: Status, text: String },
    Bye { text: String },
    /// `* <seq> FETCH ...`; attrs keep their original spacing and any
    /// body literals.
    Fetch { seq: u32, attrs: Vec<Segment> },
    /// Anything else after `* `, verbatim.
    Other(Vec<Segment>),
}

impl Response {
    /// Serialize for transmission. Server-to-client literals carry no
    /// continuation handshake, so a flat byte string suffices.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut chunks = Vec::new();
        match self {
            Self::Tagged(Tagged { tag, status, text }) => {
                let line = if text.is_empty() {
                    format!("{tag} {}\r\n", status.as_str())
                } else {
                    format!("{tag} {} {text}\r\n", status.as_str())
                };
                chunks.push(WireChunk::Line(line.into_bytes()));
            }
            Self::Continuation { text } => {
                let line = if text.is_empty() {
                    "+\r\n".to_string()
                } else {
                    format!("+ {text}\r\n")
                };
                chunks.push(WireChunk::Line(line.into_bytes()));
            }
            Self::Untagged(data) => match data {
                UntaggedData::Capability(caps) => {
                    let line = format!("* CAPABILITY {}\r\n", caps.join(" "));
                    chunks.push(WireChunk::Line(line.into_bytes()));
                }
                UntaggedData::Status { status, text } => {
                    let line = format!("* {} {text}\r\n", status.as_str());
                    chunks.push(WireChunk::Line(line.into_bytes()));
                }
                UntaggedData::Bye { text } => {
                    let line = format!("* BYE {text}\r\n");
                    chunks.push(WireChunk::Line(line.into_bytes()));
                }
                UntaggedData::Fetch { seq, attrs } => {
                    segments_to_chunks(format!("* {seq} FETCH"), attrs, false, &mut chunks);
                }
                UntaggedData::Other(segments) => {
                    // Parsed segments keep the space after the `*`.
                    segments_to_chunks("*".to_string(), segments, false, &mut chunks);
                }
            },
        }
        let mut out = Vec::new();
        for chunk in chunks {
            match chunk {
                WireChunk::Line(b) | WireChunk::Literal(b) => out.extend_from_slice(&b),
            }
        }
        out
    }
}

/// Extract the capability list from a `[CAPABILITY ...]` response code
/// if the text carries one (servers often put it in the greeting or
/// the LOGIN completion).
#[must_use]
pub fn capability_code(text: &str) -> Option<Vec<String>> {
    let start = text.find('[')?;
    let end = text[start..].find(']')? + start;
    let inside = &text[start + 1..end];
    let mut words = inside.split_whitespace();
    if !words.next()?.eq_ignore_ascii_case("CAPABILITY") {
        return None;
    }
    Some(words.map(str::to_string).collect())
}
