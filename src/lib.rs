#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc)]

//! citm -- crypt-in-the-middle IMAP gateway
//!
//! Clients speak IMAP to the local gateway as if it were their mail
//! server; the gateway keeps a persistent session to the real server
//! and transparently seals outbound message bodies into an encrypted
//! envelope (and opens inbound ones), with key material synchronized
//! over an out-of-band HTTPS channel. UIDs, flags, SEARCH, and FETCH
//! structure are preserved so existing clients work unmodified.

mod anon;
mod config;
mod connection;
mod endpoint;
mod envelope;
mod error;
mod gateway;
mod keydir;
mod keysync;
mod pause;
mod pool;
mod preuser;
mod proto;
mod reader;
mod stub;
mod user;

pub use config::{AddrSpec, GatewayConfig};
pub use connection::{Connection, Security, Transport, Upstream};
pub use endpoint::{ImapClient, ImapServer};
pub use error::{Error, Result};
pub use gateway::{Gateway, RunningGateway};
pub use keydir::{FsKeyDir, KeyDir, PeerKey, open as open_keydir};
pub use keysync::{HttpRequest, HttpResponse, HttpSync, Method, ReqwestSync};
pub use pause::Pause;
pub use pool::{Pair, PoolDeps, PoolHandle, UserPool};
pub use proto::{
    Command, CommandBody, Extensions, Response, Segment, Status, Tagged, UntaggedData,
};
pub use reader::{CommandReader, ResponseReader};
