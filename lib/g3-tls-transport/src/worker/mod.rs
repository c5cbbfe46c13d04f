/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap;
use bytes::Bytes;
use log::{debug, error, info, warn};
use lru::LruCache;

use crate::engine::{Role, TlsEngine};
use crate::transport::{Transport, TransportEvent};
use crate::{
    ListenerContextTable, TlsClientSessionCache, TlsTransportError, TlsTransportStats,
    TransportError,
};

mod connection;
use connection::{ConnectionState, HandshakeNotify, OuterRead};

mod pump;


/// Max size of one transport write.
pub(crate) const TLS_BUF_SIZE: usize = 65535;
/// Size of the buffer plaintext is decrypted into.
const TLS_READ_CHUNK_SIZE: usize = 16384;
/// Errors kept for connections closed before their reader came back.
const CLOSED_READ_CACHE_SIZE: NonZeroUsize = NonZeroUsize::new(1024).unwrap();

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(u64);

impl ConnId {
    pub(crate) const fn new(id: u64) -> Self {
        ConnId(id)
    }

    #[inline]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl ListenerId {
    pub(crate) const fn new(id: u64) -> Self {
        ListenerId(id)
    }

    #[inline]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Init,
    Handshaking,
    Io,
    Closed,
}

pub type ConnectCallback<T, E> =
    Box<dyn FnOnce(&mut TlsWorker<T, E>, ConnId, Result<(), TlsTransportError>)>;
pub type AcceptCallback<T, E> =
    Rc<dyn Fn(&mut TlsWorker<T, E>, ConnId, Result<(), TlsTransportError>)>;
pub type SendCallback<T, E> =
    Box<dyn FnOnce(&mut TlsWorker<T, E>, ConnId, Result<(), TlsTransportError>)>;
pub type RecvCallback<T, E> =
    Box<dyn FnMut(&mut TlsWorker<T, E>, ConnId, Result<&[u8], TlsTransportError>)>;

enum Task<T: Transport, E: TlsEngine> {
    Pump(ConnId),
    Event(TransportEvent<T::Handle>),
    Call(Box<dyn FnOnce(&mut TlsWorker<T, E>)>),
}

struct ListenerState<T: Transport, E: TlsEngine> {
    local: SocketAddr,
    contexts: Arc<ListenerContextTable<E::Context>>,
    accept_cb: AcceptCallback<T, E>,
}

/// A read error left for a reader that was paused when its connection went away.
struct ClosedRead<T: Transport, E: TlsEngine> {
    error: TlsTransportError,
    recv_cb: Option<RecvCallback<T, E>>,
}

struct ConnTag {
    worker: usize,
    id: ConnId,
}

impl fmt::Display for ConnTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TLS[w{}#{}]", self.worker, self.id)
    }
}

/// All TLS connections of one worker thread.
///
/// Completions are only ever run from inside [`TlsWorker::handle_event`] or
/// one of the request methods. Requests made from inside a completion are
/// queued and served once that completion returns, so a completion never
/// runs nested in another one for the same connection.
pub struct TlsWorker<T: Transport, E: TlsEngine> {
    worker_id: usize,
    transport: T,
    stats: Arc<TlsTransportStats>,
    conns: AHashMap<ConnId, ConnectionState<T, E>>,
    listeners: AHashMap<ListenerId, ListenerState<T, E>>,
    tasks: VecDeque<Task<T, E>>,
    running: bool,
    shutting_down: bool,
    next_conn_id: u64,
    next_listener_id: u64,
    read_buf: Vec<u8>,
    closed_reads: LruCache<ConnId, ClosedRead<T, E>>,
}

impl<T: Transport, E: TlsEngine> TlsWorker<T, E> {
    pub fn new(worker_id: usize, transport: T) -> Self {
        Self::with_stats(worker_id, transport, Arc::new(TlsTransportStats::default()))
    }

    /// Create a worker that shares `stats` with other workers.
    pub fn with_stats(worker_id: usize, transport: T, stats: Arc<TlsTransportStats>) -> Self {
        TlsWorker {
            worker_id,
            transport,
            stats,
            conns: AHashMap::new(),
            listeners: AHashMap::new(),
            tasks: VecDeque::new(),
            running: false,
            shutting_down: false,
            next_conn_id: 1,
            next_listener_id: 1,
            read_buf: vec![0u8; TLS_READ_CHUNK_SIZE],
            closed_reads: LruCache::new(CLOSED_READ_CACHE_SIZE),
        }
    }

    #[inline]
    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    #[inline]
    pub fn transport(&self) -> &T {
        &self.transport
    }

    #[inline]
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    #[inline]
    pub fn stats(&self) -> &Arc<TlsTransportStats> {
        &self.stats
    }

    fn tag(&self, id: ConnId) -> ConnTag {
        ConnTag {
            worker: self.worker_id,
            id,
        }
    }

    fn alloc_conn_id(&mut self) -> ConnId {
        let id = ConnId::new(self.next_conn_id);
        self.next_conn_id += 1;
        id
    }

    /// Start accepting TLS connections on `local`.
    ///
    /// Each accepted connection takes a snapshot of this worker's slot in
    /// `contexts`; `accept_cb` runs once for it when the handshake finishes.
    pub fn listen(
        &mut self,
        local: SocketAddr,
        backlog: u32,
        contexts: Arc<ListenerContextTable<E::Context>>,
        accept_cb: AcceptCallback<T, E>,
    ) -> Result<ListenerId, TlsTransportError> {
        if self.shutting_down {
            return Err(TlsTransportError::ShuttingDown);
        }
        if contexts.get(self.worker_id).is_none() {
            let e = TlsTransportError::Unexpected(format!(
                "no server context slot for worker {} in a table of {}",
                self.worker_id,
                contexts.len()
            ));
            error!("TLS[w{}] listen on {local}: {e}", self.worker_id);
            return Err(e);
        }

        let worker_id = self.worker_id;
        let id = ListenerId::new(self.next_listener_id);
        self.next_listener_id += 1;
        let local = self
            .transport
            .listen(id, local, backlog)
            .map_err(|e| {
                warn!("TLS[w{worker_id}] failed to listen on {local}: {e}");
                TlsTransportError::from(TransportError::from(e))
            })?;
        info!("TLS[w{}] listener {id} started on {local}", self.worker_id);
        self.listeners.insert(
            id,
            ListenerState {
                local,
                contexts,
                accept_cb,
            },
        );
        Ok(id)
    }

    pub fn listener_addr(&self, id: ListenerId) -> Option<SocketAddr> {
        self.listeners.get(&id).map(|l| l.local)
    }

    /// Connections already accepted are not affected.
    pub fn stop_listening(&mut self, id: ListenerId) -> bool {
        if self.listeners.remove(&id).is_none() {
            return false;
        }
        self.transport.stop_listen(id);
        info!("TLS[w{}] listener {id} stopped", self.worker_id);
        true
    }

    /// Open a client connection to `remote`.
    ///
    /// A session cached for `remote` is offered for resumption. The cache
    /// must be the one created for `context`.
    pub fn connect(
        &mut self,
        local: Option<SocketAddr>,
        remote: SocketAddr,
        timeout: Duration,
        context: Arc<E::Context>,
        session_cache: Option<Arc<TlsClientSessionCache<E::Context, E::Session>>>,
        connect_cb: ConnectCallback<T, E>,
    ) -> Result<ConnId, TlsTransportError> {
        if self.shutting_down {
            return Err(TlsTransportError::ShuttingDown);
        }
        if let Some(cache) = &session_cache {
            if !Arc::ptr_eq(cache.context(), &context) {
                let e = TlsTransportError::Unexpected(
                    "session cache is bound to another client context".to_string(),
                );
                error!("TLS[w{}] connect to {remote}: {e}", self.worker_id);
                return Err(e);
            }
        }

        let id = self.alloc_conn_id();
        self.conns.insert(
            id,
            ConnectionState::new_client(remote, context, session_cache, connect_cb),
        );
        debug!("{} connecting to {remote}", self.tag(id));
        self.transport.connect(id, local, remote, timeout);
        Ok(id)
    }

    /// Queue `data` for encryption.
    ///
    /// `send_cb` runs once all of its ciphertext has been written to the
    /// transport, or with the error that prevented it. Empty data is
    /// refused with `Unexpected` as it would never reach the transport.
    pub fn send(
        &mut self,
        id: ConnId,
        data: Bytes,
        send_cb: SendCallback<T, E>,
    ) -> Result<(), TlsTransportError> {
        if self.shutting_down {
            return Err(TlsTransportError::ShuttingDown);
        }
        if data.is_empty() {
            let e = TlsTransportError::Unexpected("empty send data".to_string());
            error!("{} send: {e}", self.tag(id));
            return Err(e);
        }
        let Some(conn) = self.conns.get_mut(&id) else {
            return Err(TlsTransportError::Canceled);
        };
        if conn.closing {
            return Err(TlsTransportError::Canceled);
        }
        conn.waiting_sends.push_back((data, send_cb));
        self.schedule_pump(id);
        self.run_tasks();
        Ok(())
    }

    /// Register `recv_cb` for decrypted data, replacing any previous one.
    ///
    /// An error held back since the last reader went away is delivered
    /// first, even if the connection has been closed since.
    pub fn start_read(
        &mut self,
        id: ConnId,
        recv_cb: RecvCallback<T, E>,
    ) -> Result<(), TlsTransportError> {
        let Some(conn) = self.conns.get_mut(&id) else {
            let Some(closed) = self.closed_reads.pop(&id) else {
                return Err(TlsTransportError::Canceled);
            };
            self.deliver_closed_read(id, closed.error, recv_cb);
            return Ok(());
        };
        if conn.closing && conn.deferred_error.is_none() {
            return Err(if self.shutting_down {
                TlsTransportError::ShuttingDown
            } else {
                TlsTransportError::Canceled
            });
        }
        conn.recv_cb = Some(recv_cb);
        conn.read_requested = true;
        conn.read_paused = false;
        conn.cancel_pending = false;
        self.schedule_pump(id);
        self.run_tasks();
        Ok(())
    }

    pub fn pause_read(&mut self, id: ConnId) {
        let Some(conn) = self.conns.get_mut(&id) else {
            return;
        };
        conn.read_paused = true;
        self.schedule_pump(id);
        self.run_tasks();
    }

    pub fn resume_read(&mut self, id: ConnId) {
        let Some(conn) = self.conns.get_mut(&id) else {
            if let Some(closed) = self.closed_reads.pop(&id) {
                match closed.recv_cb {
                    Some(recv_cb) => self.deliver_closed_read(id, closed.error, recv_cb),
                    None => {
                        self.closed_reads.put(id, closed);
                    }
                }
            }
            return;
        };
        conn.read_paused = false;
        self.schedule_pump(id);
        self.run_tasks();
    }

    /// Stop reading.
    ///
    /// Once connected the registered reader gets one `Canceled` completion.
    /// During the handshake the connect or accept completion fails with
    /// `Canceled` and the connection is closed.
    pub fn cancel_read(&mut self, id: ConnId) {
        let Some(conn) = self.conns.get_mut(&id) else {
            return;
        };
        if conn.phase < Phase::Io || conn.read_requested {
            conn.cancel_pending = true;
            self.schedule_pump(id);
            self.run_tasks();
        }
    }

    /// Close gracefully, sending a close notification if connected.
    pub fn close(&mut self, id: ConnId) {
        let reason = if self.shutting_down {
            TlsTransportError::ShuttingDown
        } else {
            TlsTransportError::Canceled
        };
        self.begin_close(id, Some(reason), false);
        self.run_tasks();
    }

    /// Stop all listeners and close every connection.
    ///
    /// New requests are refused with `ShuttingDown` from now on.
    pub fn shutdown(&mut self) {
        if self.shutting_down {
            return;
        }
        self.shutting_down = true;
        info!(
            "TLS[w{}] shutting down with {} connections",
            self.worker_id,
            self.conns.len()
        );

        let listeners: Vec<ListenerId> = self.listeners.keys().copied().collect();
        for id in listeners {
            self.stop_listening(id);
        }
        let conns: Vec<ConnId> = self.conns.keys().copied().collect();
        for id in conns {
            self.begin_close(id, Some(TlsTransportError::ShuttingDown), false);
        }
        self.run_tasks();
    }

    #[inline]
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down
    }

    pub fn is_shutdown_complete(&self) -> bool {
        self.shutting_down && self.conns.is_empty() && self.listeners.is_empty()
    }

    /// Feed a transport completion to the worker.
    pub fn handle_event(&mut self, event: TransportEvent<T::Handle>) {
        self.tasks.push_back(Task::Event(event));
        self.run_tasks();
    }

    /// An unknown connection, including one already destroyed, is `Closed`.
    pub fn phase(&self, id: ConnId) -> Phase {
        self.conns.get(&id).map(|c| c.phase).unwrap_or(Phase::Closed)
    }

    pub fn role(&self, id: ConnId) -> Option<Role> {
        self.conns.get(&id).map(|c| c.role)
    }

    pub fn peer_addr(&self, id: ConnId) -> Option<SocketAddr> {
        self.conns.get(&id).map(|c| c.peer)
    }

    pub fn selected_alpn(&self, id: ConnId) -> Option<Vec<u8>> {
        self.conns.get(&id)?.engine.as_ref()?.selected_alpn()
    }

    /// `None` if the peer certificate was accepted or not checked.
    pub fn peer_verify_result(&self, id: ConnId) -> Option<String> {
        self.conns.get(&id)?.engine.as_ref()?.peer_verify_error()
    }

    pub fn session_reused(&self, id: ConnId) -> bool {
        self.conns
            .get(&id)
            .and_then(|c| c.engine.as_ref())
            .map(|e| e.session_reused())
            .unwrap_or(false)
    }

    #[inline]
    pub fn connection_count(&self) -> usize {
        self.conns.len()
    }

    #[inline]
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    fn deliver_closed_read(
        &mut self,
        id: ConnId,
        error: TlsTransportError,
        mut recv_cb: RecvCallback<T, E>,
    ) {
        self.tasks
            .push_back(Task::Call(Box::new(move |worker: &mut Self| {
                recv_cb(worker, id, Err(error))
            })));
        self.run_tasks();
    }

    fn schedule_pump(&mut self, id: ConnId) {
        if let Some(conn) = self.conns.get_mut(&id) {
            if !conn.pump_scheduled {
                conn.pump_scheduled = true;
                self.tasks.push_back(Task::Pump(id));
            }
        }
    }

    fn run_tasks(&mut self) {
        if self.running {
            return;
        }
        self.running = true;
        while let Some(task) = self.tasks.pop_front() {
            match task {
                Task::Pump(id) => {
                    if let Some(conn) = self.conns.get_mut(&id) {
                        conn.pump_scheduled = false;
                        self.do_bio(id, None);
                    }
                }
                Task::Event(event) => self.on_event(event),
                Task::Call(f) => f(self),
            }
        }
        self.running = false;
    }

    fn on_event(&mut self, event: TransportEvent<T::Handle>) {
        match event {
            TransportEvent::Connected { token, result } => self.on_connected(token, result),
            TransportEvent::Accepted {
                listener,
                handle,
                peer,
            } => self.on_accepted(listener, handle, peer),
            TransportEvent::Read { token, result } => match result {
                Ok(data) => self.do_bio(token, Some(data)),
                Err(e) => self.on_read_error(token, e),
            },
            TransportEvent::WriteDone { token, result } => self.on_write_done(token, result),
        }
    }

    fn on_connected(
        &mut self,
        id: ConnId,
        result: Result<(T::Handle, SocketAddr), TransportError>,
    ) {
        let tag = self.tag(id);
        let Some(conn) = self.conns.get_mut(&id) else {
            if let Ok((handle, _)) = result {
                self.transport.close(handle);
            }
            return;
        };
        conn.connecting = false;
        match result {
            Ok((handle, peer)) => {
                debug!("{tag} connected to {peer}");
                conn.outer = Some(handle);
                conn.peer = peer;
                self.schedule_pump(id);
            }
            Err(e) => {
                let e = TlsTransportError::from(e);
                warn!("{tag} failed to connect to {}: {e}", conn.peer);
                conn.fatal = true;
                self.notify_handshake(id, Err(e));
                self.begin_close(id, None, true);
            }
        }
    }

    fn on_accepted(&mut self, listener: ListenerId, handle: T::Handle, peer: SocketAddr) {
        if self.shutting_down {
            self.transport.close(handle);
            return;
        }
        let Some(l) = self.listeners.get(&listener) else {
            debug!(
                "TLS[w{}] drop connection from {peer} to stopped listener {listener}",
                self.worker_id
            );
            self.transport.close(handle);
            return;
        };
        let Some(context) = l.contexts.get(self.worker_id) else {
            error!(
                "TLS[w{}] listener {listener} has no server context for this worker",
                self.worker_id
            );
            self.transport.close(handle);
            return;
        };
        let accept_cb = Rc::clone(&l.accept_cb);

        let id = self.alloc_conn_id();
        self.conns.insert(
            id,
            ConnectionState::new_server(peer, context, handle, accept_cb),
        );
        debug!("{} accepted from {peer} on listener {listener}", self.tag(id));
        self.schedule_pump(id);
    }

    fn on_read_error(&mut self, id: ConnId, e: TransportError) {
        let tag = self.tag(id);
        let Some(conn) = self.conns.get_mut(&id) else {
            return;
        };
        if e == TransportError::Canceled {
            // our own cancel_read
            return;
        }

        // the transport stops reading after reporting an error
        conn.outer_read = OuterRead::Idle;
        if !matches!(e, TransportError::Eof | TransportError::Timeout) {
            conn.transport_failed = true;
        }
        if conn.closing {
            self.schedule_pump(id);
            return;
        }
        conn.fatal = true;

        let err = TlsTransportError::from(e);
        if conn.phase < Phase::Io {
            warn!("{tag} read failed during handshake: {err}");
            self.fail_handshake(id, err);
        } else {
            warn!("{tag} read failed: {err}");
            self.deliver_read_error(id, err);
            self.begin_close(id, None, true);
        }
    }

    fn on_write_done(&mut self, id: ConnId, result: Result<(), TransportError>) {
        let tag = self.tag(id);
        let Some(conn) = self.conns.get_mut(&id) else {
            return;
        };
        if conn.pending_sends == 0 {
            error!("{tag} write completion without a write in flight");
            return;
        }
        conn.pending_sends -= 1;
        let cbs = std::mem::take(&mut conn.inflight_sends);

        match result {
            Ok(()) => {
                for cb in cbs {
                    cb(self, id, Ok(()));
                }
            }
            Err(e) => {
                let err = TlsTransportError::from(e);
                warn!("{tag} write failed: {err}");
                conn.transport_failed = true;
                conn.fatal = true;
                let handshaking = conn.phase < Phase::Io;
                for cb in cbs {
                    cb(self, id, Err(err.clone()));
                }
                if handshaking {
                    self.fail_handshake(id, err);
                } else {
                    self.begin_close(id, None, true);
                }
            }
        }
        self.schedule_pump(id);
    }

    fn begin_close(&mut self, id: ConnId, reason: Option<TlsTransportError>, force: bool) {
        let Some(conn) = self.conns.get_mut(&id) else {
            return;
        };
        conn.force_close |= force;
        if !conn.closing {
            conn.closing = true;
            conn.close_reason = reason;
        }
        self.schedule_pump(id);
    }

    fn fail_handshake(&mut self, id: ConnId, err: TlsTransportError) {
        let tag = self.tag(id);
        let Some(conn) = self.conns.get_mut(&id) else {
            return;
        };
        conn.fatal = true;
        self.stats.add_handshake_failed();
        debug!("{tag} handshake failed: {err}");
        self.notify_handshake(id, Err(err));
        self.begin_close(id, None, true);
    }

    /// Run the connect or accept completion, at most once.
    fn notify_handshake(&mut self, id: ConnId, result: Result<(), TlsTransportError>) {
        let Some(conn) = self.conns.get_mut(&id) else {
            return;
        };
        let Some(notify) = conn.handshake_cb.take() else {
            return;
        };
        self.call_handshake_cb(notify, id, result);
    }

    fn call_handshake_cb(
        &mut self,
        notify: HandshakeNotify<T, E>,
        id: ConnId,
        result: Result<(), TlsTransportError>,
    ) {
        if let Err(TlsTransportError::Unexpected(reason)) = &result {
            error!("{} unexpected handshake failure: {reason}", self.tag(id));
        }
        match notify {
            HandshakeNotify::Connect(cb) => cb(self, id, result),
            HandshakeNotify::Accept(cb) => cb(self, id, result),
        }
    }

    /// Hand a data phase error to the reader, or hold it back until the
    /// reader is ready. A timeout reaches a paused reader right away.
    fn deliver_read_error(&mut self, id: ConnId, err: TlsTransportError) {
        let Some(conn) = self.conns.get_mut(&id) else {
            return;
        };
        let ready = conn.read_requested
            && conn.recv_cb.is_some()
            && (!conn.read_paused || err == TlsTransportError::Timeout);
        if !ready {
            if conn.deferred_error.is_none() {
                conn.deferred_error = Some(err);
            }
            return;
        }
        conn.read_requested = false;
        if let Some(mut cb) = conn.recv_cb.take() {
            if let TlsTransportError::Unexpected(reason) = &err {
                error!("{} unexpected read failure: {reason}", self.tag(id));
            }
            cb(self, id, Err(err));
        }
    }
}
