/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;

use crate::TransportError;
use crate::worker::{ConnId, ListenerId};

mod tcp;
pub use tcp::{TcpHandle, TcpTransportConfig, TokioTcpTransport};

#[cfg(test)]
pub(crate) mod mock;

/// Completions reported by a [`Transport`] back to its worker.
#[derive(Debug)]
pub enum TransportEvent<H> {
    Connected {
        token: ConnId,
        result: Result<(H, SocketAddr), TransportError>,
    },
    Accepted {
        listener: ListenerId,
        handle: H,
        peer: SocketAddr,
    },
    /// An empty buffer is a zero byte read that carries no error.
    Read {
        token: ConnId,
        result: Result<Bytes, TransportError>,
    },
    WriteDone {
        token: ConnId,
        result: Result<(), TransportError>,
    },
}

/// A non blocking byte stream socket layer.
///
/// Every method only submits the operation; completions are handed back to
/// the owning worker as [`TransportEvent`]s. The caller never has more than
/// one write outstanding for the same handle.
pub trait Transport: 'static {
    type Handle: Clone;

    fn connect(
        &mut self,
        token: ConnId,
        local: Option<SocketAddr>,
        remote: SocketAddr,
        timeout: Duration,
    );

    /// Start accepting, returning the address actually bound.
    fn listen(
        &mut self,
        listener: ListenerId,
        local: SocketAddr,
        backlog: u32,
    ) -> io::Result<SocketAddr>;

    fn stop_listen(&mut self, listener: ListenerId);

    /// Keep reading until paused or canceled.
    fn read(&mut self, token: ConnId, handle: &Self::Handle);

    fn pause_read(&mut self, handle: &Self::Handle);

    fn resume_read(&mut self, handle: &Self::Handle);

    fn cancel_read(&mut self, handle: &Self::Handle);

    fn write(&mut self, token: ConnId, handle: &Self::Handle, data: Bytes);

    fn close(&mut self, handle: Self::Handle);
}
