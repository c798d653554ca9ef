//! Test data model for the fake upstream server.
//!
//! The store is shared with the server via `Arc<Mutex<..>>` so tests
//! can seed messages beforehand and inspect what the gateway relayed:
//! which credentials arrived, what APPEND bodies look like at rest,
//! and how many LOGOUTs the quiesce produced.

use std::sync::{Arc, Mutex};

pub type SharedMail = Arc<Mutex<MailStore>>;

#[derive(Debug, Default)]
pub struct MailStore {
    /// `(uid, raw message)` pairs, in uid order.
    pub messages: Vec<(u32, Vec<u8>)>,
    next_uid: u32,
    /// Credentials presented over the wire, in arrival order.
    pub logins: Vec<(String, String)>,
    pub logouts: usize,
}

impl MailStore {
    pub fn new() -> SharedMail {
        Arc::new(Mutex::new(Self {
            messages: Vec::new(),
            next_uid: 1,
            logins: Vec::new(),
            logouts: 0,
        }))
    }

    /// Store a message, returning its uid.
    pub fn append(&mut self, raw: Vec<u8>) -> u32 {
        let uid = self.next_uid;
        self.next_uid += 1;
        self.messages.push((uid, raw));
        uid
    }

    pub fn get(&self, uid: u32) -> Option<&[u8]> {
        self.messages
            .iter()
            .find(|(u, _)| *u == uid)
            .map(|(_, raw)| raw.as_slice())
    }
}
