/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use bytes::Bytes;

use crate::{EngineError, ResumableSession};

mod bio;

mod openssl;
pub(crate) use self::openssl::set_new_session_callback;
pub use self::openssl::{OpensslContext, OpensslEngine};

#[cfg(test)]
pub(crate) mod mock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineStatus {
    Done,
    WantRead,
    WantWrite,
    Fatal(EngineError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecryptStatus {
    /// Number of plaintext bytes written to the caller's buffer.
    Chunk(usize),
    WouldBlock,
    /// Peer sent its close notification.
    Eof,
    Fatal(EngineError),
}

/// A TLS state machine decoupled from real I/O by a pair of ciphertext
/// buffers.
///
/// Incoming ciphertext is pushed in with [`TlsEngine::feed_ciphertext`] and
/// whatever the engine wants on the wire is pulled out with
/// [`TlsEngine::drain_ciphertext`].
pub trait TlsEngine: Sized + 'static {
    type Context: Send + Sync + 'static;
    type Session: ResumableSession;

    fn new(role: Role, context: &Self::Context) -> Result<Self, EngineError>;

    fn set_role(&mut self, role: Role);

    /// Forget errors left over from earlier operations.
    fn clear_error(&mut self);

    fn handshake_step(&mut self) -> EngineStatus;

    fn feed_ciphertext(&mut self, data: &[u8]);

    fn pending_ciphertext(&self) -> usize;

    fn drain_ciphertext(&mut self, max_size: usize) -> Bytes;

    fn encrypt(&mut self, plaintext: &[u8]) -> EngineStatus;

    fn decrypt_next(&mut self, buf: &mut [u8]) -> DecryptStatus;

    /// Queue a close notification, or with `force` mark the session closed
    /// without sending anything.
    fn shutdown(&mut self, force: bool);

    fn session_get(&self) -> Option<Self::Session>;

    fn session_set(&mut self, session: Self::Session) -> bool;

    fn session_reused(&self) -> bool;

    fn selected_alpn(&self) -> Option<Vec<u8>>;

    /// `None` if the peer certificate passed verification or was not checked.
    fn peer_verify_error(&self) -> Option<String>;
}
