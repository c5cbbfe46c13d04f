/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;

use super::{AcceptCallback, ConnectCallback, Phase, RecvCallback, SendCallback};
use crate::engine::{Role, TlsEngine};
use crate::transport::Transport;
use crate::{TlsClientSessionCache, TlsTransportError};

pub(super) enum HandshakeNotify<T: Transport, E: TlsEngine> {
    Connect(ConnectCallback<T, E>),
    Accept(AcceptCallback<T, E>),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum OuterRead {
    Idle,
    Active,
    Paused,
}

pub(super) struct ConnectionState<T: Transport, E: TlsEngine> {
    pub(super) role: Role,
    pub(super) phase: Phase,
    pub(super) peer: SocketAddr,
    pub(super) context: Arc<E::Context>,
    pub(super) engine: Option<E>,
    pub(super) session_cache: Option<Arc<TlsClientSessionCache<E::Context, E::Session>>>,

    /// `None` until connected
    pub(super) outer: Option<T::Handle>,
    pub(super) outer_read: OuterRead,
    pub(super) connecting: bool,

    pub(super) handshake_cb: Option<HandshakeNotify<T, E>>,
    pub(super) handshake_completed: bool,

    pub(super) recv_cb: Option<RecvCallback<T, E>>,
    pub(super) read_requested: bool,
    pub(super) read_paused: bool,
    pub(super) cancel_pending: bool,
    pub(super) deferred_error: Option<TlsTransportError>,

    /// plaintext not handed to the engine yet
    pub(super) waiting_sends: VecDeque<(Bytes, SendCallback<T, E>)>,
    /// encrypted, keyed by the end offset of their ciphertext
    pub(super) encrypted_sends: VecDeque<(u64, SendCallback<T, E>)>,
    /// attached to the transport write in flight
    pub(super) inflight_sends: Vec<SendCallback<T, E>>,
    pub(super) ciphertext_submitted: u64,
    pub(super) pending_sends: usize,

    pub(super) closing: bool,
    pub(super) close_reason: Option<TlsTransportError>,
    pub(super) close_notified: bool,
    pub(super) force_close: bool,
    pub(super) shutdown_sent: bool,
    pub(super) transport_failed: bool,
    pub(super) fatal: bool,

    pub(super) pump_scheduled: bool,
}

impl<T: Transport, E: TlsEngine> ConnectionState<T, E> {
    fn new(role: Role, peer: SocketAddr, context: Arc<E::Context>) -> Self {
        ConnectionState {
            role,
            phase: Phase::Init,
            peer,
            context,
            engine: None,
            session_cache: None,
            outer: None,
            outer_read: OuterRead::Idle,
            connecting: false,
            handshake_cb: None,
            handshake_completed: false,
            recv_cb: None,
            read_requested: false,
            read_paused: false,
            cancel_pending: false,
            deferred_error: None,
            waiting_sends: VecDeque::new(),
            encrypted_sends: VecDeque::new(),
            inflight_sends: Vec::new(),
            ciphertext_submitted: 0,
            pending_sends: 0,
            closing: false,
            close_reason: None,
            close_notified: false,
            force_close: false,
            shutdown_sent: false,
            transport_failed: false,
            fatal: false,
            pump_scheduled: false,
        }
    }

    pub(super) fn new_client(
        remote: SocketAddr,
        context: Arc<E::Context>,
        session_cache: Option<Arc<TlsClientSessionCache<E::Context, E::Session>>>,
        connect_cb: ConnectCallback<T, E>,
    ) -> Self {
        let mut conn = ConnectionState::new(Role::Client, remote, context);
        conn.session_cache = session_cache;
        conn.handshake_cb = Some(HandshakeNotify::Connect(connect_cb));
        conn.connecting = true;
        conn
    }

    pub(super) fn new_server(
        peer: SocketAddr,
        context: Arc<E::Context>,
        handle: T::Handle,
        accept_cb: AcceptCallback<T, E>,
    ) -> Self {
        let mut conn = ConnectionState::new(Role::Server, peer, context);
        conn.outer = Some(handle);
        conn.handshake_cb = Some(HandshakeNotify::Accept(accept_cb));
        conn
    }

    /// Whether the outer transport should be delivering ciphertext.
    pub(super) fn wants_outer_read(&self) -> bool {
        if self.closing || self.transport_failed || self.outer.is_none() {
            return false;
        }
        match self.phase {
            Phase::Handshaking => true,
            Phase::Io => self.read_requested && !self.read_paused,
            Phase::Init | Phase::Closed => false,
        }
    }

    pub(super) fn delivering(&self) -> bool {
        self.phase == Phase::Io
            && self.read_requested
            && !self.read_paused
            && !self.closing
            && !self.cancel_pending
            && self.recv_cb.is_some()
    }

    /// Nothing more will reach the wire, so the handle may be released.
    pub(super) fn can_finish_close(&self) -> bool {
        if !self.closing || self.connecting || self.pending_sends > 0 {
            return false;
        }
        if self.transport_failed || self.outer.is_none() {
            return true;
        }
        match &self.engine {
            Some(engine) => self.shutdown_sent && engine.pending_ciphertext() == 0,
            None => true,
        }
    }

    pub(super) fn should_remember_session(&self) -> bool {
        self.role == Role::Client
            && self.handshake_completed
            && !self.fatal
            && self.session_cache.is_some()
    }

    /// Every send callback not yet completed, in submission order.
    pub(super) fn take_unsent(&mut self) -> Vec<SendCallback<T, E>> {
        let mut cbs = std::mem::take(&mut self.inflight_sends);
        cbs.extend(self.encrypted_sends.drain(..).map(|(_, cb)| cb));
        cbs.extend(self.waiting_sends.drain(..).map(|(_, cb)| cb));
        cbs
    }
}
