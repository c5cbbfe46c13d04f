/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::io;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::OnceLock;

use bytes::Bytes;
use openssl::error::ErrorStack;
use openssl::ex_data::Index;
use openssl::ssl::{self, ErrorCode, ShutdownState, Ssl, SslContext, SslContextBuilder, SslSession};
use openssl::x509::X509VerifyResult;

use super::bio::MemoryBio;
use super::{DecryptStatus, EngineStatus, Role, TlsEngine};
use crate::{EngineError, EngineErrorKind, ResumableSession};

/// Per connection settings on top of a shared [`SslContext`].
#[derive(Clone)]
pub struct OpensslContext {
    ssl_context: SslContext,
    verify_name: Option<String>,
    disable_sni: bool,
}

impl OpensslContext {
    pub fn new(ssl_context: SslContext) -> Self {
        OpensslContext {
            ssl_context,
            verify_name: None,
            disable_sni: false,
        }
    }

    /// Verify the peer certificate against `name`, and also send it as SNI
    /// unless `disable_sni` is set or it is an IP address.
    pub fn with_verify_name(mut self, name: String, disable_sni: bool) -> Self {
        self.verify_name = Some(name);
        self.disable_sni = disable_sni;
        self
    }

    #[inline]
    pub fn ssl_context(&self) -> &SslContext {
        &self.ssl_context
    }

    fn build_ssl(&self, role: Role) -> Result<Ssl, ErrorStack> {
        let mut ssl = Ssl::new(&self.ssl_context)?;
        match role {
            Role::Client => {
                ssl.set_connect_state();
                if let Some(name) = &self.verify_name {
                    if let Ok(ip) = IpAddr::from_str(name) {
                        ssl.param_mut().set_ip(ip)?;
                    } else {
                        ssl.param_mut().set_host(name)?;
                        if !self.disable_sni {
                            ssl.set_hostname(name)?;
                        }
                    }
                }
            }
            Role::Server => ssl.set_accept_state(),
        }
        Ok(ssl)
    }
}

static NEW_SESSION_INDEX: OnceLock<Index<Ssl, SslSession>> = OnceLock::new();

fn new_session_index() -> Result<Index<Ssl, SslSession>, ErrorStack> {
    if let Some(index) = NEW_SESSION_INDEX.get() {
        return Ok(*index);
    }
    let index = Ssl::new_ex_index()?;
    Ok(*NEW_SESSION_INDEX.get_or_init(|| index))
}

/// Keep the latest session OpenSSL reports through the new session callback
/// on the connection. `session_get` hands out only those, or the session a
/// handshake was resumed from.
///
/// OpenSSL calls it once a TLS 1.2 handshake completes, and for each TLS 1.3
/// ticket received, but never for the session object it holds before that.
/// With TLS 1.3 that one may already carry the echoed legacy session id
/// while having nothing to resume from.
pub(crate) fn set_new_session_callback(
    builder: &mut SslContextBuilder,
) -> Result<(), ErrorStack> {
    let index = new_session_index()?;
    builder.set_new_session_callback(move |ssl, session| ssl.set_ex_data(index, session));
    Ok(())
}

impl ResumableSession for SslSession {
    /// Sessions come from the new session callback, which OpenSSL only calls
    /// for cacheable sessions, or from a resumed handshake. An empty id is
    /// still never offered.
    fn is_resumable(&self) -> bool {
        !self.id().is_empty()
    }
}

pub struct OpensslEngine {
    stream: ssl::SslStream<MemoryBio>,
}

impl OpensslEngine {
    fn map_error(&self, e: ssl::Error) -> EngineStatus {
        match e.code() {
            ErrorCode::WANT_READ => EngineStatus::WantRead,
            ErrorCode::WANT_WRITE => EngineStatus::WantWrite,
            ErrorCode::ZERO_RETURN => EngineStatus::Fatal(EngineError::new(
                EngineErrorKind::PeerClosed,
                "close notify received",
            )),
            ErrorCode::SYSCALL => {
                if let Some(io_err) = e.io_error() {
                    if io_err.kind() == io::ErrorKind::WouldBlock {
                        return EngineStatus::WantRead;
                    }
                    return EngineStatus::Fatal(EngineError::new(
                        EngineErrorKind::Io(io_err.kind()),
                        io_err.to_string(),
                    ));
                }
                if let Some(stack) = e.ssl_error() {
                    if !stack.errors().is_empty() {
                        return EngineStatus::Fatal(EngineError::new(
                            EngineErrorKind::Protocol,
                            stack.to_string(),
                        ));
                    }
                }
                EngineStatus::Fatal(EngineError::new(
                    EngineErrorKind::UnexpectedEof,
                    "unexpected eof without error code",
                ))
            }
            ErrorCode::SSL => {
                let verify = self.stream.ssl().verify_result();
                if verify != X509VerifyResult::OK {
                    EngineStatus::Fatal(EngineError::new(
                        EngineErrorKind::CertificateVerify,
                        verify.error_string(),
                    ))
                } else {
                    EngineStatus::Fatal(EngineError::new(EngineErrorKind::Protocol, e.to_string()))
                }
            }
            _ => EngineStatus::Fatal(EngineError::new(EngineErrorKind::Protocol, e.to_string())),
        }
    }
}

impl TlsEngine for OpensslEngine {
    type Context = OpensslContext;
    type Session = SslSession;

    fn new(role: Role, context: &OpensslContext) -> Result<Self, EngineError> {
        let ssl = context.build_ssl(role).map_err(|e| {
            EngineError::new(
                EngineErrorKind::Protocol,
                format!("failed to create ssl state: {e}"),
            )
        })?;
        let stream = ssl::SslStream::new(ssl, MemoryBio::default()).map_err(|e| {
            EngineError::new(
                EngineErrorKind::Protocol,
                format!("failed to create ssl stream: {e}"),
            )
        })?;
        Ok(OpensslEngine { stream })
    }

    fn set_role(&mut self, role: Role) {
        match role {
            Role::Client => self.stream.ssl_mut().set_connect_state(),
            Role::Server => self.stream.ssl_mut().set_accept_state(),
        }
    }

    fn clear_error(&mut self) {
        // drain the error queue of this thread
        let _ = ErrorStack::get();
    }

    fn handshake_step(&mut self) -> EngineStatus {
        match self.stream.do_handshake() {
            Ok(_) => EngineStatus::Done,
            Err(e) => self.map_error(e),
        }
    }

    fn feed_ciphertext(&mut self, data: &[u8]) {
        self.stream.get_mut().feed(data);
    }

    fn pending_ciphertext(&self) -> usize {
        self.stream.get_ref().outgoing_len()
    }

    fn drain_ciphertext(&mut self, max_size: usize) -> Bytes {
        self.stream.get_mut().drain(max_size)
    }

    fn encrypt(&mut self, plaintext: &[u8]) -> EngineStatus {
        let mut offset = 0;
        while offset < plaintext.len() {
            match self.stream.ssl_write(&plaintext[offset..]) {
                Ok(n) => offset += n,
                Err(e) => return self.map_error(e),
            }
        }
        EngineStatus::Done
    }

    fn decrypt_next(&mut self, buf: &mut [u8]) -> DecryptStatus {
        match self.stream.ssl_read(buf) {
            Ok(0) => DecryptStatus::WouldBlock,
            Ok(n) => DecryptStatus::Chunk(n),
            Err(e) => match self.map_error(e) {
                EngineStatus::Done | EngineStatus::WantRead | EngineStatus::WantWrite => {
                    DecryptStatus::WouldBlock
                }
                EngineStatus::Fatal(e) if e.kind() == EngineErrorKind::PeerClosed => {
                    DecryptStatus::Eof
                }
                EngineStatus::Fatal(e) => DecryptStatus::Fatal(e),
            },
        }
    }

    fn shutdown(&mut self, force: bool) {
        if force {
            self.stream
                .set_shutdown(ShutdownState::SENT | ShutdownState::RECEIVED);
        } else {
            // only queues the close notify, the reply is never waited for
            let _ = self.stream.shutdown();
        }
    }

    fn session_get(&self) -> Option<SslSession> {
        let ssl = self.stream.ssl();
        if let Some(session) = NEW_SESSION_INDEX.get().and_then(|i| ssl.ex_data(*i)) {
            return Some(session.clone());
        }
        // a resumed tls 1.2 session is not reported again
        if ssl.session_reused() {
            ssl.session().map(|s| s.to_owned())
        } else {
            None
        }
    }

    fn session_set(&mut self, session: SslSession) -> bool {
        // SAFETY: sessions are only handed out by the cache bound to the
        // same ssl context this engine was created from
        unsafe { self.stream.ssl_mut().set_session(&session).is_ok() }
    }

    fn session_reused(&self) -> bool {
        self.stream.ssl().session_reused()
    }

    fn selected_alpn(&self) -> Option<Vec<u8>> {
        self.stream
            .ssl()
            .selected_alpn_protocol()
            .map(|p| p.to_vec())
    }

    fn peer_verify_error(&self) -> Option<String> {
        let verify = self.stream.ssl().verify_result();
        if verify == X509VerifyResult::OK {
            None
        } else {
            Some(verify.error_string().to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{TlsClientConfigBuilder, TlsProtocol, testutil};

    const BUF_SIZE: usize = 16384;

    fn exchange(from: &mut OpensslEngine, to: &mut OpensslEngine) -> bool {
        let data = from.drain_ciphertext(usize::MAX);
        if data.is_empty() {
            return false;
        }
        to.feed_ciphertext(&data);
        true
    }

    fn handshake(client: &mut OpensslEngine, server: &mut OpensslEngine) -> EngineStatus {
        for _ in 0..16 {
            let c = client.handshake_step();
            exchange(client, server);
            if let EngineStatus::Fatal(_) = c {
                return c;
            }
            let s = server.handshake_step();
            exchange(server, client);
            if let EngineStatus::Fatal(_) = s {
                return s;
            }
            if c == EngineStatus::Done && s == EngineStatus::Done {
                return EngineStatus::Done;
            }
        }
        EngineStatus::WantRead
    }

    fn engine_pair(verify_name: &str) -> (OpensslEngine, OpensslEngine) {
        let (server_ctx, ca) = testutil::server_context("localhost");
        let client_ctx =
            testutil::client_context(&ca).with_verify_name(verify_name.to_string(), false);
        let client = OpensslEngine::new(Role::Client, &client_ctx).unwrap();
        let server = OpensslEngine::new(Role::Server, &server_ctx).unwrap();
        (client, server)
    }

    #[test]
    fn handshake_and_data() {
        let (mut client, mut server) = engine_pair("localhost");
        assert_eq!(handshake(&mut client, &mut server), EngineStatus::Done);
        assert!(client.peer_verify_error().is_none());

        assert_eq!(client.encrypt(b"hello"), EngineStatus::Done);
        assert!(exchange(&mut client, &mut server));
        let mut buf = vec![0u8; BUF_SIZE];
        assert_eq!(server.decrypt_next(&mut buf), DecryptStatus::Chunk(5));
        assert_eq!(&buf[..5], b"hello");
        assert_eq!(server.decrypt_next(&mut buf), DecryptStatus::WouldBlock);
    }

    #[test]
    fn close_notify() {
        let (mut client, mut server) = engine_pair("localhost");
        assert_eq!(handshake(&mut client, &mut server), EngineStatus::Done);

        server.shutdown(false);
        assert!(server.pending_ciphertext() > 0);
        assert!(exchange(&mut server, &mut client));
        let mut buf = vec![0u8; BUF_SIZE];
        let mut closed = false;
        for _ in 0..4 {
            match client.decrypt_next(&mut buf) {
                DecryptStatus::Eof => {
                    closed = true;
                    break;
                }
                DecryptStatus::WouldBlock => {}
                r => panic!("unexpected decrypt result {r:?}"),
            }
        }
        assert!(closed);
    }

    #[test]
    fn forced_shutdown_is_silent() {
        let (mut client, mut server) = engine_pair("localhost");
        assert_eq!(handshake(&mut client, &mut server), EngineStatus::Done);
        let mut buf = vec![0u8; BUF_SIZE];
        let _ = client.decrypt_next(&mut buf);
        let _ = client.drain_ciphertext(usize::MAX);

        client.shutdown(true);
        assert_eq!(client.pending_ciphertext(), 0);
    }

    #[test]
    fn bad_certificate() {
        let (mut client, mut server) = engine_pair("not-this-host");
        match handshake(&mut client, &mut server) {
            EngineStatus::Fatal(e) => {
                assert_eq!(e.kind(), EngineErrorKind::CertificateVerify);
                assert!(
                    e.classify(true)
                        .to_string()
                        .contains("bad peer certificate")
                );
            }
            r => panic!("unexpected handshake result {r:?}"),
        }
        assert!(client.peer_verify_error().is_some());
    }

    #[test]
    fn garbage_input() {
        let (_, mut server) = engine_pair("localhost");
        server.feed_ciphertext(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n");
        match server.handshake_step() {
            EngineStatus::Fatal(e) => assert_eq!(e.kind(), EngineErrorKind::Protocol),
            r => panic!("unexpected handshake result {r:?}"),
        }
    }

    #[test]
    fn want_read_before_input() {
        let (mut client, mut server) = engine_pair("localhost");
        assert_eq!(server.handshake_step(), EngineStatus::WantRead);
        assert_eq!(client.handshake_step(), EngineStatus::WantRead);
        // client hello is waiting to be sent
        assert!(client.pending_ciphertext() > 0);
    }

    #[test]
    fn session_after_tickets() {
        let (mut client, mut server) = engine_pair("localhost");
        assert!(client.session_get().is_none());
        assert_eq!(handshake(&mut client, &mut server), EngineStatus::Done);
        // tls 1.3 tickets are not read yet
        assert!(client.session_get().is_none());

        let mut buf = vec![0u8; BUF_SIZE];
        assert_eq!(client.decrypt_next(&mut buf), DecryptStatus::WouldBlock);
        let session = client.session_get().unwrap();
        assert!(session.is_resumable());
    }

    #[test]
    fn tls12_session_resumed() {
        let (server_ctx, ca) = testutil::server_context("localhost");
        let mut builder = TlsClientConfigBuilder::default();
        builder.set_no_default_ca_certificates();
        builder.set_ca_certificates(vec![ca]).unwrap();
        builder.set_max_protocol(TlsProtocol::Tls12);
        let config = builder.build().unwrap();
        let client_ctx = OpensslContext::clone(config.context())
            .with_verify_name("localhost".to_string(), false);

        let mut client = OpensslEngine::new(Role::Client, &client_ctx).unwrap();
        let mut server = OpensslEngine::new(Role::Server, &server_ctx).unwrap();
        assert_eq!(handshake(&mut client, &mut server), EngineStatus::Done);
        assert!(!client.session_reused());
        let session = client.session_get().unwrap();
        assert!(session.is_resumable());

        // the resumed session is handed out again for the next connection
        let mut session = Some(session);
        for _ in 0..2 {
            let mut client = OpensslEngine::new(Role::Client, &client_ctx).unwrap();
            let mut server = OpensslEngine::new(Role::Server, &server_ctx).unwrap();
            assert!(client.session_set(session.take().unwrap()));
            assert_eq!(handshake(&mut client, &mut server), EngineStatus::Done);
            assert!(client.session_reused());
            session = client.session_get();
            assert!(session.is_some());
        }
    }
}
