/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

//! TLS on top of a callback driven byte stream transport.
//!
//! A [`TlsWorker`] owns every TLS connection pinned to one worker thread and
//! pumps bytes between the outer [`Transport`] and a per connection
//! [`TlsEngine`]. Client session resumption is shared between workers through
//! a [`TlsClientSessionCache`], and server side contexts through a
//! [`ListenerContextTable`].

mod error;
pub use error::{EngineError, EngineErrorKind, TlsTransportError, TransportError};

mod stats;
pub use stats::{TlsTransportStats, TlsTransportStatsSnapshot};

mod session;
pub use session::{ResumableSession, TlsClientSessionCache};

mod listener;
pub use listener::ListenerContextTable;

pub mod engine;
pub use engine::{DecryptStatus, EngineStatus, OpensslContext, OpensslEngine, Role, TlsEngine};

pub mod transport;
pub use transport::{TcpHandle, TcpTransportConfig, TokioTcpTransport, Transport, TransportEvent};

mod worker;
pub use worker::{
    AcceptCallback, ConnId, ConnectCallback, ListenerId, Phase, RecvCallback, SendCallback,
    TlsWorker,
};

mod driver;
pub use driver::WorkerDriver;

mod runtime;
pub use runtime::{WorkerRuntimeConfig, WorkersGuard};

mod config;
pub use config::{
    OpensslClientSessionCache, TlsCertificatePair, TlsClientConfig, TlsClientConfigBuilder,
    TlsProtocol, TlsServerConfig, TlsServerConfigBuilder,
};

#[cfg(feature = "yaml")]
pub mod yaml {
    pub use crate::config::yaml::*;
}
