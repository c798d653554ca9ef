//! Shared I/O helpers for the fake upstream server and the tests.
//!
//! These are thin wrappers around `AsyncWriteExt`/`AsyncReadExt` that
//! flush after every write and read one CRLF-terminated line at a
//! time, which keeps the wire conversations deterministic.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Write a string to the stream and flush.
pub async fn write_line<S: AsyncWrite + Unpin>(stream: &mut S, line: &str) -> std::io::Result<()> {
    stream.write_all(line.as_bytes()).await?;
    stream.flush().await
}

/// Read a single line, byte by byte, up to and including the LF.
/// Returns `None` on EOF before any byte arrives.
pub async fn read_line<S: AsyncRead + Unpin>(stream: &mut S) -> Option<String> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        match stream.read(&mut byte).await {
            Ok(0) | Err(_) => {
                return if line.is_empty() {
                    None
                } else {
                    Some(String::from_utf8_lossy(&line).into_owned())
                };
            }
            Ok(_) => {
                line.push(byte[0]);
                if byte[0] == b'\n' {
                    return Some(String::from_utf8_lossy(&line).into_owned());
                }
            }
        }
    }
}

/// Read lines until one contains `needle`; returns everything read.
/// Panics (failing the test) on EOF.
pub async fn read_until<S: AsyncRead + Unpin>(stream: &mut S, needle: &str) -> String {
    let mut all = String::new();
    loop {
        let line = read_line(stream)
            .await
            .unwrap_or_else(|| panic!("EOF while waiting for {needle:?}; got:\n{all}"));
        all.push_str(&line);
        if line.contains(needle) {
            return all;
        }
    }
}
