//! In-process fake upstream IMAP server.
//!
//! Speaks just enough IMAP4rev1 for the gateway's upstream side:
//! greeting with a capability code, LOGIN (password `pw` is the only
//! valid one), CAPABILITY, SELECT, APPEND with literals (both `{N}`
//! and `{N+}`), `UID FETCH uid (BODY[])`, NOOP, and LOGOUT. It
//! advertises `XUPSTREAM` so tests can watch the gateway strip
//! capabilities it does not carry.
//!
//! Runs on localhost with an OS-assigned port, one task per
//! connection, until dropped.

use super::io::{read_line, write_line};
use super::mailbox::SharedMail;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

const CAPABILITIES: &str = "IMAP4rev1 LITERAL+ IDLE UIDPLUS XUPSTREAM";

pub struct FakeUpstreamServer {
    port: u16,
    _handle: tokio::task::JoinHandle<()>,
}

impl FakeUpstreamServer {
    pub async fn start(mail: SharedMail) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind to ephemeral port");
        let port = listener.local_addr().unwrap().port();

        let handle = tokio::spawn(async move {
            loop {
                let Ok((stream, _addr)) = listener.accept().await else {
                    break;
                };
                let mail = mail.clone();
                tokio::spawn(async move {
                    handle_connection(stream, &mail).await;
                });
            }
        });

        Self {
            port,
            _handle: handle,
        }
    }

    pub const fn port(&self) -> u16 {
        self.port
    }
}

/// One command, with any literals it carried collected separately.
struct WireCommand {
    tag: String,
    name: String,
    rest: String,
    literals: Vec<Vec<u8>>,
}

/// Read a full command. Handles literal markers: synchronizing ones
/// get a `+` continuation, then exactly N octets are consumed and the
/// command line continues.
async fn read_command(stream: &mut tokio::net::TcpStream) -> Option<WireCommand> {
    let mut text = String::new();
    let mut literals = Vec::new();

    loop {
        let line = read_line(stream).await?;
        let trimmed = line.trim_end();
        if let Some((count, plus)) = literal_marker(trimmed) {
            text.push_str(trimmed);
            text.push(' ');
            if !plus && write_line(stream, "+ OK\r\n").await.is_err() {
                return None;
            }
            let mut data = vec![0u8; count];
            stream.read_exact(&mut data).await.ok()?;
            literals.push(data);
        } else {
            text.push_str(trimmed);
            break;
        }
    }

    let mut words = text.splitn(3, ' ');
    let tag = words.next()?.to_string();
    let name = words.next()?.to_uppercase();
    let rest = words.next().unwrap_or("").to_string();
    Some(WireCommand {
        tag,
        name,
        rest,
        literals,
    })
}

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
    digits.parse().ok().map(|n| (n, plus))
}

fn unquote(token: &str) -> String {
    token.trim_matches('"').to_string()
}

async fn handle_connection(mut stream: tokio::net::TcpStream, mail: &SharedMail) {
    let greeting = format!("* OK [CAPABILITY {CAPABILITIES}] fake upstream ready\r\n");
    if write_line(&mut stream, &greeting).await.is_err() {
        return;
    }

    loop {
        let Some(cmd) = read_command(&mut stream).await else {
            return;
        };
        let tag = &cmd.tag;
        let ok = match cmd.name.as_str() {
            "CAPABILITY" => {
                let resp = format!("* CAPABILITY {CAPABILITIES}\r\n{tag} OK CAPABILITY completed\r\n");
                write_line(&mut stream, &resp).await.is_ok()
            }
            "NOOP" => {
                write_line(&mut stream, &format!("{tag} OK NOOP completed\r\n"))
                    .await
                    .is_ok()
            }
            "LOGIN" => {
                let mut parts = cmd.rest.split(' ');
                let user = unquote(parts.next().unwrap_or(""));
                let pass = unquote(parts.next().unwrap_or(""));
                mail.lock().unwrap().logins.push((user, pass.clone()));
                let resp = if pass == "pw" {
                    format!("{tag} OK LOGIN completed\r\n")
                } else {
                    format!("{tag} NO [AUTHENTICATIONFAILED] invalid credentials\r\n")
                };
                write_line(&mut stream, &resp).await.is_ok()
            }
            "SELECT" => {
                let count = mail.lock().unwrap().messages.len();
                let resp = format!(
                    "* {count} EXISTS\r\n* 0 RECENT\r\n{tag} OK [READ-WRITE] SELECT completed\r\n"
                );
                write_line(&mut stream, &resp).await.is_ok()
            }
            "APPEND" => {
                if let Some(raw) = cmd.literals.into_iter().last() {
                    let uid = mail.lock().unwrap().append(raw);
                    let resp = format!("{tag} OK [APPENDUID 1 {uid}] APPEND completed\r\n");
                    write_line(&mut stream, &resp).await.is_ok()
                } else {
                    write_line(&mut stream, &format!("{tag} BAD APPEND needs a literal\r\n"))
                        .await
                        .is_ok()
                }
            }
            "UID" => serve_uid(&mut stream, tag, &cmd.rest, mail).await,
            "LOGOUT" => {
                mail.lock().unwrap().logouts += 1;
                let resp = format!("* BYE fake upstream signing off\r\n{tag} OK LOGOUT completed\r\n");
                let _ = write_line(&mut stream, &resp).await;
                return;
            }
            _ => {
                write_line(&mut stream, &format!("{tag} BAD unknown command\r\n"))
                    .await
                    .is_ok()
            }
        };
        if !ok {
            return;
        }
    }
}

/// `UID FETCH <uid> (BODY[])` against the stored messages.
async fn serve_uid(
    stream: &mut tokio::net::TcpStream,
    tag: &str,
    rest: &str,
    mail: &SharedMail,
) -> bool {
    let mut words = rest.split(' ');
    let sub = words.next().unwrap_or("").to_uppercase();
    if sub != "FETCH" {
        return write_line(stream, &format!("{tag} BAD unsupported UID command\r\n"))
            .await
            .is_ok();
    }
    let Some(uid) = words.next().and_then(|w| w.parse::<u32>().ok()) else {
        return write_line(stream, &format!("{tag} BAD bad uid\r\n"))
            .await
            .is_ok();
    };

    let payload = {
        let mail = mail.lock().unwrap();
        mail.get(uid).map(<[u8]>::to_vec)
    };
    if let Some(raw) = payload {
        let seq = uid; // uids are assigned densely from 1 in these tests
        let header = format!("* {seq} FETCH (UID {uid} BODY[] {{{}}}\r\n", raw.len());
        if write_line(stream, &header).await.is_err() {
            return false;
        }
        if stream.write_all(&raw).await.is_err() || stream.flush().await.is_err() {
            return false;
        }
        if write_line(stream, ")\r\n").await.is_err() {
            return false;
        }
    }
    write_line(stream, &format!("{tag} OK FETCH completed\r\n"))
        .await
        .is_ok()
}
