/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::io;

use thiserror::Error;

/// Failures reported by the outer byte stream transport.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    #[error("end of stream")]
    Eof,
    #[error("timed out")]
    Timeout,
    #[error("canceled")]
    Canceled,
    #[error("io error: {0}")]
    Io(io::ErrorKind),
}

impl From<io::Error> for TransportError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::TimedOut => TransportError::Timeout,
            io::ErrorKind::UnexpectedEof => TransportError::Eof,
            kind => TransportError::Io(kind),
        }
    }
}

/// Result kinds delivered to the connect, accept, send and receive completions.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TlsTransportError {
    #[error("peer closed the tls session")]
    PeerClosed,
    #[error("bad peer certificate: {0}")]
    BadPeerCertificate(String),
    #[error("tls error: {0}")]
    TlsError(String),
    #[error("canceled")]
    Canceled,
    #[error("shutting down")]
    ShuttingDown,
    #[error("timed out")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(TransportError),
    #[error("unexpected: {0}")]
    Unexpected(String),
}

impl From<TransportError> for TlsTransportError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Timeout => TlsTransportError::Timeout,
            TransportError::Canceled => TlsTransportError::Canceled,
            e => TlsTransportError::Transport(e),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineErrorKind {
    /// A close notification was received.
    PeerClosed,
    /// The peer certificate was rejected by the verifier.
    CertificateVerify,
    /// The engine saw end of data without any underlying error code.
    UnexpectedEof,
    Protocol,
    Io(io::ErrorKind),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind:?}: {reason}")]
pub struct EngineError {
    kind: EngineErrorKind,
    reason: String,
}

impl EngineError {
    pub fn new<T: Into<String>>(kind: EngineErrorKind, reason: T) -> Self {
        EngineError {
            kind,
            reason: reason.into(),
        }
    }

    #[inline]
    pub fn kind(&self) -> EngineErrorKind {
        self.kind
    }

    #[inline]
    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub(crate) fn is_spurious_eof(&self) -> bool {
        self.kind == EngineErrorKind::UnexpectedEof
    }

    /// Map an engine failure to the upward error kind.
    ///
    /// Certificate failures are only reported as such while the handshake
    /// has not completed.
    pub(crate) fn classify(&self, handshaking: bool) -> TlsTransportError {
        match self.kind {
            EngineErrorKind::PeerClosed => TlsTransportError::PeerClosed,
            EngineErrorKind::CertificateVerify if handshaking => {
                TlsTransportError::BadPeerCertificate(self.reason.clone())
            }
            EngineErrorKind::CertificateVerify | EngineErrorKind::Protocol => {
                TlsTransportError::TlsError(self.reason.clone())
            }
            EngineErrorKind::UnexpectedEof => TlsTransportError::Transport(TransportError::Eof),
            EngineErrorKind::Io(kind) => TransportError::from(io::Error::from(kind)).into(),
        }
    }
}
