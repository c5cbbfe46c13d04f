/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

//! A scripted record engine for driving the worker in tests.
//!
//! Records are `[type: u8][len: u16 be][payload]`. A client sends HELLO
//! with the ticket it wants to resume, the server answers HELLO with
//! `[resumed: u8][new ticket]` and both sides are done.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{DecryptStatus, EngineStatus, Role, TlsEngine};
use crate::{EngineError, EngineErrorKind, ResumableSession};

pub(crate) const HELLO: u8 = 1;
pub(crate) const DATA: u8 = 2;
pub(crate) const CLOSE: u8 = 3;
pub(crate) const ALERT: u8 = 4;

const MAX_RECORD_PAYLOAD: usize = 16384;

pub(crate) fn record(kind: u8, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(3 + payload.len());
    buf.put_u8(kind);
    buf.put_u16(payload.len() as u16);
    buf.put_slice(payload);
    buf.freeze()
}

pub(crate) fn client_hello(ticket: &[u8]) -> Bytes {
    record(HELLO, ticket)
}

pub(crate) fn server_hello(resumed: bool, ticket: &[u8]) -> Bytes {
    let mut payload = vec![u8::from(resumed)];
    payload.extend_from_slice(ticket);
    record(HELLO, &payload)
}

pub(crate) fn data(payload: &[u8]) -> Bytes {
    record(DATA, payload)
}

pub(crate) fn close_notify() -> Bytes {
    record(CLOSE, b"")
}

pub(crate) fn alert() -> Bytes {
    record(ALERT, b"")
}

/// Split a byte stream into `(type, payload)` records.
pub(crate) fn parse_records(mut data: &[u8]) -> Vec<(u8, Vec<u8>)> {
    let mut records = Vec::new();
    while data.len() >= 3 {
        let kind = data[0];
        let len = u16::from_be_bytes([data[1], data[2]]) as usize;
        if data.len() < 3 + len {
            break;
        }
        records.push((kind, data[3..3 + len].to_vec()));
        data = &data[3 + len..];
    }
    records
}

#[derive(Default)]
pub(crate) struct MockContext {
    pub(crate) reject_peer_cert: bool,
    pub(crate) alpn: Option<Vec<u8>>,
    /// report end of data without an error code when there is no input
    pub(crate) spurious_eof: AtomicBool,
}

impl MockContext {
    pub(crate) fn set_spurious_eof(&self, enable: bool) {
        self.spurious_eof.store(enable, Ordering::Relaxed);
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct MockSession(pub(crate) Vec<u8>);

impl ResumableSession for MockSession {
    fn is_resumable(&self) -> bool {
        !self.0.is_empty()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Start,
    WaitHello,
    Done,
    Failed,
}

pub(crate) struct MockEngine {
    role: Role,
    state: State,
    incoming: BytesMut,
    outgoing: BytesMut,
    plaintext: VecDeque<Bytes>,
    offered: Option<MockSession>,
    ticket: Option<Vec<u8>>,
    reused: bool,
    reject_peer_cert: bool,
    alpn: Option<Vec<u8>>,
    spurious_eof: bool,
    verify_error: Option<String>,
    peer_closed: bool,
    close_sent: bool,
}

impl MockEngine {
    fn next_record(&mut self) -> Option<(u8, Bytes)> {
        if self.incoming.len() < 3 {
            return None;
        }
        let len = u16::from_be_bytes([self.incoming[1], self.incoming[2]]) as usize;
        if self.incoming.len() < 3 + len {
            return None;
        }
        let kind = self.incoming.get_u8();
        self.incoming.advance(2);
        Some((kind, self.incoming.split_to(len).freeze()))
    }

    fn write_record(&mut self, kind: u8, payload: &[u8]) {
        self.outgoing.put_slice(&record(kind, payload));
    }

    fn fail(&mut self, kind: EngineErrorKind, reason: &str) -> EngineStatus {
        self.state = State::Failed;
        EngineStatus::Fatal(EngineError::new(kind, reason))
    }
}

impl TlsEngine for MockEngine {
    type Context = MockContext;
    type Session = MockSession;

    fn new(role: Role, context: &MockContext) -> Result<Self, EngineError> {
        Ok(MockEngine {
            role,
            state: State::Start,
            incoming: BytesMut::new(),
            outgoing: BytesMut::new(),
            plaintext: VecDeque::new(),
            offered: None,
            ticket: None,
            reused: false,
            reject_peer_cert: context.reject_peer_cert,
            alpn: context.alpn.clone(),
            spurious_eof: context.spurious_eof.load(Ordering::Relaxed),
            verify_error: None,
            peer_closed: false,
            close_sent: false,
        })
    }

    fn set_role(&mut self, role: Role) {
        self.role = role;
    }

    fn clear_error(&mut self) {}

    fn handshake_step(&mut self) -> EngineStatus {
        match (self.role, self.state) {
            (_, State::Done) => EngineStatus::Done,
            (_, State::Failed) => {
                EngineStatus::Fatal(EngineError::new(EngineErrorKind::Protocol, "failed"))
            }
            (Role::Client, State::Start) => {
                let ticket = self
                    .offered
                    .as_ref()
                    .map(|s| s.0.clone())
                    .unwrap_or_default();
                self.write_record(HELLO, &ticket);
                self.state = State::WaitHello;
                EngineStatus::WantRead
            }
            (Role::Client, State::WaitHello) => match self.next_record() {
                None if self.spurious_eof => EngineStatus::Fatal(EngineError::new(
                    EngineErrorKind::UnexpectedEof,
                    "eof without error",
                )),
                None => EngineStatus::WantRead,
                Some((HELLO, payload)) => {
                    if self.reject_peer_cert {
                        self.write_record(ALERT, b"");
                        self.verify_error = Some("certificate verify failed".to_string());
                        return self.fail(
                            EngineErrorKind::CertificateVerify,
                            "certificate verify failed",
                        );
                    }
                    self.reused = payload.first() == Some(&1);
                    self.ticket = Some(payload.get(1..).unwrap_or_default().to_vec());
                    self.state = State::Done;
                    EngineStatus::Done
                }
                Some(_) => self.fail(EngineErrorKind::Protocol, "unexpected record"),
            },
            (Role::Server, _) => match self.next_record() {
                None => EngineStatus::WantRead,
                Some((HELLO, payload)) => {
                    self.reused = !payload.is_empty();
                    self.write_record(HELLO, &[u8::from(self.reused), b't', b'1']);
                    self.state = State::Done;
                    EngineStatus::Done
                }
                Some(_) => {
                    self.write_record(ALERT, b"");
                    self.fail(EngineErrorKind::Protocol, "unexpected record")
                }
            },
        }
    }

    fn feed_ciphertext(&mut self, data: &[u8]) {
        self.incoming.put_slice(data);
    }

    fn pending_ciphertext(&self) -> usize {
        self.outgoing.len()
    }

    fn drain_ciphertext(&mut self, max_size: usize) -> Bytes {
        let len = self.outgoing.len().min(max_size);
        self.outgoing.split_to(len).freeze()
    }

    fn encrypt(&mut self, plaintext: &[u8]) -> EngineStatus {
        if self.state != State::Done || self.close_sent {
            return EngineStatus::Fatal(EngineError::new(
                EngineErrorKind::Protocol,
                "not established",
            ));
        }
        for chunk in plaintext.chunks(MAX_RECORD_PAYLOAD) {
            self.write_record(DATA, chunk);
        }
        EngineStatus::Done
    }

    fn decrypt_next(&mut self, buf: &mut [u8]) -> DecryptStatus {
        if let Some(mut chunk) = self.plaintext.pop_front() {
            let len = chunk.len().min(buf.len());
            buf[..len].copy_from_slice(&chunk[..len]);
            chunk.advance(len);
            if !chunk.is_empty() {
                self.plaintext.push_front(chunk);
            }
            return DecryptStatus::Chunk(len);
        }
        if self.peer_closed {
            return DecryptStatus::Eof;
        }
        match self.next_record() {
            None if self.spurious_eof && self.incoming.is_empty() => {
                let e = EngineError::new(EngineErrorKind::UnexpectedEof, "eof without error");
                DecryptStatus::Fatal(e)
            }
            None => DecryptStatus::WouldBlock,
            Some((DATA, payload)) => {
                self.plaintext.push_back(payload);
                self.decrypt_next(buf)
            }
            Some((CLOSE, _)) => {
                self.peer_closed = true;
                DecryptStatus::Eof
            }
            Some(_) => {
                self.state = State::Failed;
                DecryptStatus::Fatal(EngineError::new(EngineErrorKind::Protocol, "bad record"))
            }
        }
    }

    fn shutdown(&mut self, force: bool) {
        if !force && !self.close_sent && self.state == State::Done {
            self.write_record(CLOSE, b"");
        }
        self.close_sent = true;
    }

    fn session_get(&self) -> Option<MockSession> {
        match self.role {
            Role::Client => self.ticket.clone().map(MockSession),
            Role::Server => None,
        }
    }

    fn session_set(&mut self, session: MockSession) -> bool {
        self.offered = Some(session);
        true
    }

    fn session_reused(&self) -> bool {
        self.reused
    }

    fn selected_alpn(&self) -> Option<Vec<u8>> {
        if self.state == State::Done {
            self.alpn.clone()
        } else {
            None
        }
    }

    fn peer_verify_error(&self) -> Option<String> {
        self.verify_error.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake() {
        let ctx = MockContext::default();
        let mut client = MockEngine::new(Role::Client, &ctx).unwrap();
        let mut server = MockEngine::new(Role::Server, &ctx).unwrap();
        client.session_set(MockSession(b"ticket-old".to_vec()));

        assert_eq!(client.handshake_step(), EngineStatus::WantRead);
        server.feed_ciphertext(&client.drain_ciphertext(usize::MAX));
        assert_eq!(server.handshake_step(), EngineStatus::Done);
        assert!(server.session_reused());
        client.feed_ciphertext(&server.drain_ciphertext(usize::MAX));
        assert_eq!(client.handshake_step(), EngineStatus::Done);
        assert!(client.session_reused());
        assert_eq!(client.session_get(), Some(MockSession(b"t1".to_vec())));
    }

    #[test]
    fn split_chunk() {
        let ctx = MockContext::default();
        let mut engine = MockEngine::new(Role::Server, &ctx).unwrap();
        engine.feed_ciphertext(&client_hello(b""));
        assert_eq!(engine.handshake_step(), EngineStatus::Done);
        engine.feed_ciphertext(&data(b"abcdef"));
        engine.feed_ciphertext(&close_notify());

        let mut buf = [0u8; 4];
        assert_eq!(engine.decrypt_next(&mut buf), DecryptStatus::Chunk(4));
        assert_eq!(&buf, b"abcd");
        assert_eq!(engine.decrypt_next(&mut buf), DecryptStatus::Chunk(2));
        assert_eq!(&buf[..2], b"ef");
        assert_eq!(engine.decrypt_next(&mut buf), DecryptStatus::Eof);
    }
}
