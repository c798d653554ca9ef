#![allow(clippy::similar_names)]

//! End-to-end tests for the gateway against the fake upstream server.
//!
//! Each test starts a `FakeUpstreamServer`, points a `Gateway` at it
//! with a test keysync client, connects to the gateway's listener
//! like a mail client would, and speaks raw IMAP over the socket.

mod fake_upstream;

use citm::{AddrSpec, Gateway, GatewayConfig, HttpRequest, HttpResponse, HttpSync, KeyDir,
    RunningGateway, open_keydir};
use fake_upstream::io::{read_line, read_until, write_line};
use fake_upstream::{FakeUpstreamServer, MailStore};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;

/// Keysync double: counts calls, optionally blocks until released,
/// and answers every registration with the given status plus a peer
/// listing containing the supplied fingerprints.
struct TestHttp {
    status: u16,
    fingerprints: Vec<String>,
    calls: AtomicUsize,
    gate: Mutex<Option<std::sync::mpsc::Receiver<()>>>,
}

impl TestHttp {
    fn new(status: u16, fingerprints: Vec<String>) -> Arc<Self> {
        Arc::new(Self {
            status,
            fingerprints,
            calls: AtomicUsize::new(0),
            gate: Mutex::new(None),
        })
    }

    fn gated(status: u16, fingerprints: Vec<String>) -> (Arc<Self>, std::sync::mpsc::Sender<()>) {
        let (tx, rx) = std::sync::mpsc::channel();
        let http = Self {
            status,
            fingerprints,
            calls: AtomicUsize::new(0),
            gate: Mutex::new(Some(rx)),
        };
        (Arc::new(http), tx)
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl HttpSync for TestHttp {
    fn request(&self, _req: &HttpRequest) -> citm::Result<HttpResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(rx) = self.gate.lock().unwrap().take() {
            let _ = rx.recv();
        }
        let peers: Vec<_> = self
            .fingerprints
            .iter()
            .map(|fp| serde_json::json!({ "fingerprint": fp, "public": "AAAA" }))
            .collect();
        let body = serde_json::json!({ "peers": peers });
        Ok(HttpResponse {
            status: self.status,
            headers: vec![],
            body: serde_json::to_vec(&body).unwrap(),
        })
    }
}

fn temp_root(name: &str) -> PathBuf {
    let unique = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("citm-e2e-{name}-{unique}"));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

/// Generate a self-signed cert/key pair under `root` so the gateway
/// relays instead of serving stubs.
fn write_certs(root: &std::path::Path) -> (PathBuf, PathBuf) {
    let cert = rcgen::generate_simple_self_signed(vec!["127.0.0.1".to_string()])
        .expect("generate self-signed cert");
    let cert_path = root.join("citm.cert");
    let key_path = root.join("citm.key");
    std::fs::write(&cert_path, cert.cert.pem()).unwrap();
    std::fs::write(&key_path, cert.key_pair.serialize_pem()).unwrap();
    (cert_path, key_path)
}

/// The pool will open the same key directory; opening it up front
/// pins the device secret so the test's peer listing can include the
/// right fingerprint.
fn fingerprint_for(user: &str, root: &std::path::Path) -> String {
    let maildir = root.join("maildir");
    std::fs::create_dir_all(&maildir).unwrap();
    open_keydir(user, &maildir).unwrap().fingerprint()
}

async fn start_gateway(
    upstream: &FakeUpstreamServer,
    http: Arc<dyn HttpSync>,
    root: &std::path::Path,
    with_certs: bool,
) -> RunningGateway {
    let _ = rustls::crypto::ring::default_provider().install_default();
    let (cert, key) = if with_certs {
        write_certs(root)
    } else {
        (root.join("missing.cert"), root.join("missing.key"))
    };
    let config = GatewayConfig {
        listens: vec![AddrSpec::parse("imap://127.0.0.1:0").unwrap()],
        remote: AddrSpec::parse(&format!("imap://127.0.0.1:{}", upstream.port())).unwrap(),
        key,
        cert,
        maildir_root: root.join("maildir"),
        api: url::Url::parse("https://keys.example.test/api/").unwrap(),
        trust_upstream: false,
        indicate_ready: false,
    };
    Gateway::with_http(config, http).start().await.unwrap()
}

async fn connect(gw: &RunningGateway) -> TcpStream {
    let stream = TcpStream::connect(gw.addrs()[0]).await.unwrap();
    stream.set_nodelay(true).unwrap();
    stream
}

/// Connect and log in as `user` with the only good password.
async fn login(gw: &RunningGateway, user: &str, tag: &str) -> TcpStream {
    let mut stream = connect(gw).await;
    assert!(read_line(&mut stream).await.unwrap().contains("citm ready"));
    write_line(&mut stream, &format!("{tag} LOGIN {user} pw\r\n"))
        .await
        .unwrap();
    read_until(&mut stream, &format!("{tag} OK LOGIN completed")).await;
    stream
}

async fn wait_for(mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("condition never became true");
}

// ── Tests ──────────────────────────────────────────────────────────

#[tokio::test]
async fn stub_serves_until_certs_exist() {
    let root = temp_root("stub");
    let mail = MailStore::new();
    let upstream = FakeUpstreamServer::start(mail.clone()).await;
    let http = TestHttp::new(200, vec![]);
    let gw = start_gateway(&upstream, http, &root, false).await;

    let mut stream = connect(&gw).await;
    assert!(
        read_line(&mut stream)
            .await
            .unwrap()
            .contains("citm not ready")
    );
    write_line(&mut stream, "a CAPABILITY\r\n").await.unwrap();
    let out = read_until(&mut stream, "a OK").await;
    assert!(out.contains("* CAPABILITY IMAP4rev1 STARTTLS"));

    write_line(&mut stream, "b LOGIN alice pw\r\n").await.unwrap();
    let out = read_until(&mut stream, "b BAD").await;
    assert!(out.contains("not ready for login"));

    // Nothing ever reached the upstream.
    assert!(mail.lock().unwrap().logins.is_empty());
    gw.quit().await;
}

#[tokio::test]
async fn happy_login_relays_and_builds_a_user() {
    let root = temp_root("happy");
    let mail = MailStore::new();
    let upstream = FakeUpstreamServer::start(mail.clone()).await;
    let http = TestHttp::new(200, vec![fingerprint_for("alice", &root)]);
    let gw = start_gateway(&upstream, http.clone(), &root, true).await;

    let mut stream = connect(&gw).await;
    assert!(read_line(&mut stream).await.unwrap().contains("citm ready"));

    // Capability relay strips what the gateway does not carry.
    write_line(&mut stream, "a CAPABILITY\r\n").await.unwrap();
    let out = read_until(&mut stream, "a OK CAPABILITY completed").await;
    assert!(out.contains("IMAP4rev1"));
    assert!(out.contains("IDLE"));
    assert!(!out.contains("XUPSTREAM"));

    write_line(&mut stream, "b LOGIN alice pw\r\n").await.unwrap();
    read_until(&mut stream, "b OK LOGIN completed").await;

    // The relay is now live: a NOOP goes up and comes back.
    write_line(&mut stream, "c NOOP\r\n").await.unwrap();
    read_until(&mut stream, "c OK NOOP completed").await;

    assert_eq!(http.calls(), 1);
    let logins = mail.lock().unwrap().logins.clone();
    assert!(logins.contains(&("alice".to_string(), "pw".to_string())));
    gw.quit().await;
}

#[tokio::test]
async fn bad_password_is_relayed_and_anon_stays() {
    let root = temp_root("badpw");
    let mail = MailStore::new();
    let upstream = FakeUpstreamServer::start(mail.clone()).await;
    let http = TestHttp::new(200, vec![fingerprint_for("alice", &root)]);
    let gw = start_gateway(&upstream, http.clone(), &root, true).await;

    let mut stream = connect(&gw).await;
    read_line(&mut stream).await.unwrap();

    write_line(&mut stream, "b LOGIN alice wrong\r\n").await.unwrap();
    let out = read_until(&mut stream, "b NO").await;
    assert!(out.contains("AUTHENTICATIONFAILED"));
    // No keysync for a refused login.
    assert_eq!(http.calls(), 0);

    // Same connection recovers with good credentials.
    write_line(&mut stream, "c LOGIN alice pw\r\n").await.unwrap();
    read_until(&mut stream, "c OK LOGIN completed").await;
    assert_eq!(http.calls(), 1);
    gw.quit().await;
}

#[tokio::test]
async fn concurrent_pairs_share_one_keysync() {
    let root = temp_root("concurrent");
    let mail = MailStore::new();
    let upstream = FakeUpstreamServer::start(mail.clone()).await;
    let (http, release) = TestHttp::gated(200, vec![fingerprint_for("alice", &root)]);
    let gw = start_gateway(&upstream, http.clone(), &root, true).await;

    let mut first = connect(&gw).await;
    read_line(&mut first).await.unwrap();
    write_line(&mut first, "a LOGIN alice pw\r\n").await.unwrap();

    let mut second = connect(&gw).await;
    read_line(&mut second).await.unwrap();
    write_line(&mut second, "b LOGIN alice pw\r\n").await.unwrap();

    // Both LOGINs have hit the upstream; keysync is still gated.
    {
        let mail = mail.clone();
        wait_for(move || mail.lock().unwrap().logins.len() == 2).await;
    }
    release.send(()).unwrap();

    read_until(&mut first, "a OK LOGIN completed").await;
    read_until(&mut second, "b OK LOGIN completed").await;
    // One keysync served both pairs.
    assert_eq!(http.calls(), 1);
    gw.quit().await;
}

#[tokio::test]
async fn keysync_failure_shares_fate_and_unregisters() {
    let root = temp_root("keysync-fail");
    let mail = MailStore::new();
    let upstream = FakeUpstreamServer::start(mail.clone()).await;
    let http = TestHttp::new(500, vec![]);
    let gw = start_gateway(&upstream, http.clone(), &root, true).await;

    let mut stream = connect(&gw).await;
    read_line(&mut stream).await.unwrap();
    write_line(&mut stream, "b LOGIN alice pw\r\n").await.unwrap();
    let out = read_until(&mut stream, "b NO").await;
    assert!(out.contains("login failed"));
    read_until(&mut stream, "* BYE").await;
    assert_eq!(http.calls(), 1);

    // The pool dropped the user id: a fresh attempt keysyncs again.
    let mut retry = connect(&gw).await;
    read_line(&mut retry).await.unwrap();
    write_line(&mut retry, "b LOGIN alice pw\r\n").await.unwrap();
    read_until(&mut retry, "b NO").await;
    assert_eq!(http.calls(), 2);
    gw.quit().await;
}

#[tokio::test]
async fn append_is_sealed_at_rest_and_opened_on_fetch() {
    let root = temp_root("roundtrip");
    let mail = MailStore::new();
    let upstream = FakeUpstreamServer::start(mail.clone()).await;
    let http = TestHttp::new(200, vec![fingerprint_for("alice", &root)]);
    let gw = start_gateway(&upstream, http, &root, true).await;

    let mut stream = login(&gw, "alice", "a").await;

    write_line(&mut stream, "b APPEND INBOX {5+}\r\nhello\r\n")
        .await
        .unwrap();
    let out = read_until(&mut stream, "APPEND completed").await;
    assert!(out.contains("b OK"), "{out}");

    // At rest the message is an envelope, not the cleartext.
    {
        let mail = mail.lock().unwrap();
        let (_, raw) = &mail.messages[0];
        let raw = String::from_utf8_lossy(raw);
        assert!(raw.contains("BEGIN CITM MESSAGE"), "{raw}");
        assert!(!raw.contains("hello"));
    }

    // Fetching it back yields the cleartext with a rewritten literal.
    write_line(&mut stream, "c UID FETCH 1 (BODY[])\r\n")
        .await
        .unwrap();
    let out = read_until(&mut stream, "c OK FETCH completed").await;
    assert!(out.contains("{5}\r\n"), "{out}");
    assert!(out.contains("hello"), "{out}");
    assert!(!out.contains("BEGIN CITM MESSAGE"), "{out}");
    gw.quit().await;
}

#[tokio::test]
async fn quit_under_load_drains_everything() {
    let root = temp_root("quit");
    let mail = MailStore::new();
    let upstream = FakeUpstreamServer::start(mail.clone()).await;
    let http = TestHttp::new(
        200,
        vec![
            fingerprint_for("alice", &root),
            fingerprint_for("bob", &root),
        ],
    );
    let gw = start_gateway(&upstream, http, &root, true).await;

    let mut sessions = Vec::new();
    for (user, tag) in [
        ("alice", "a1"),
        ("alice", "a2"),
        ("alice", "a3"),
        ("bob", "b1"),
        ("bob", "b2"),
        ("bob", "b3"),
    ] {
        sessions.push(login(&gw, user, tag).await);
    }

    // Quit resolves only once the pool refcount hits zero.
    gw.quit().await;

    for stream in &mut sessions {
        let out = read_until(stream, "* BYE").await;
        assert!(out.contains("shutting down"), "{out}");
        // The transport is closed after the BYE.
        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).await.unwrap();
    }

    // One upstream LOGOUT per user, not per session.
    assert_eq!(mail.lock().unwrap().logouts, 2);
}
