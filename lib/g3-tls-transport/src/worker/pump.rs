/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use bytes::Bytes;
use log::{debug, trace, warn};

use super::{ClosedRead, ConnId, OuterRead, Phase, TLS_BUF_SIZE, TLS_READ_CHUNK_SIZE, TlsWorker};
use crate::engine::{DecryptStatus, EngineStatus, Role, TlsEngine};
use crate::transport::Transport;
use crate::{EngineError, TlsTransportError};

impl<T: Transport, E: TlsEngine> TlsWorker<T, E> {
    /// Move bytes as far as they can go for one connection.
    ///
    /// `received` is ciphertext just read from the transport. A pump with
    /// nothing received, nothing to send and no close in progress is a pure
    /// retrigger, and an end of data reported without any error code is
    /// ignored for it.
    pub(super) fn do_bio(&mut self, id: ConnId, received: Option<Bytes>) {
        let tag = self.tag(id);
        let Some(conn) = self.conns.get_mut(&id) else {
            return;
        };
        if conn.phase == Phase::Closed {
            return;
        }
        let received = received.filter(|d| !d.is_empty());
        let pure_retrigger = received.is_none() && conn.waiting_sends.is_empty() && !conn.closing;
        trace!(
            "{tag} pump in {:?} with {} bytes received",
            conn.phase,
            received.as_ref().map(|d| d.len()).unwrap_or(0)
        );

        self.notify_close(id);
        self.deliver_deferred_error(id);
        self.process_cancel(id);

        let Some(conn) = self.conns.get_mut(&id) else {
            return;
        };
        if conn.phase == Phase::Init {
            if conn.outer.is_none() || conn.closing {
                // connect still in progress, or nothing was ever sent
                self.finish_close_if_ready(id);
                return;
            }
            if let Err(e) = self.start_engine(id) {
                let e = TlsTransportError::Unexpected(format!("failed to create tls engine: {e}"));
                self.fail_handshake(id, e);
                self.finish_close_if_ready(id);
                return;
            }
        }

        let Some(conn) = self.conns.get_mut(&id) else {
            return;
        };
        let Some(engine) = conn.engine.as_mut() else {
            self.finish_close_if_ready(id);
            return;
        };
        engine.clear_error();
        if let Some(data) = &received {
            engine.feed_ciphertext(data);
        }
        if conn.closing && !conn.shutdown_sent {
            engine.shutdown(conn.force_close);
            conn.shutdown_sent = true;
        }

        let mut want_write = false;
        if conn.phase == Phase::Handshaking && !conn.closing {
            match engine.handshake_step() {
                EngineStatus::Done => self.complete_handshake(id),
                EngineStatus::WantRead => {}
                EngineStatus::WantWrite => want_write = true,
                EngineStatus::Fatal(e) if e.is_spurious_eof() && pure_retrigger => {
                    trace!("{tag} ignore eof without error on retrigger");
                }
                EngineStatus::Fatal(e) => {
                    debug!("{tag} handshake error: {e}");
                    self.fail_handshake(id, e.classify(true));
                }
            }
        }

        self.encrypt_waiting(id);
        self.decrypt_available(id, pure_retrigger);
        self.flush(id);
        if want_write {
            self.schedule_pump(id);
        }
        self.update_outer_read(id);
        self.finish_close_if_ready(id);
    }

    fn start_engine(&mut self, id: ConnId) -> Result<(), EngineError> {
        let Some(conn) = self.conns.get_mut(&id) else {
            return Ok(());
        };
        let mut engine = E::new(conn.role, &conn.context)?;
        engine.set_role(conn.role);
        if conn.role == Role::Client {
            if let Some(cache) = &conn.session_cache {
                if let Some(session) = cache.take(&conn.peer.to_string()) {
                    if engine.session_set(session) {
                        self.stats.add_session_offered();
                    }
                }
            }
        }
        conn.engine = Some(engine);
        conn.phase = Phase::Handshaking;
        Ok(())
    }

    fn complete_handshake(&mut self, id: ConnId) {
        let tag = self.tag(id);
        let Some(conn) = self.conns.get_mut(&id) else {
            return;
        };
        conn.phase = Phase::Io;
        conn.handshake_completed = true;
        self.stats.add_handshake_ok();
        let reused = conn.engine.as_ref().map(|e| e.session_reused()).unwrap_or(false);
        if reused && conn.role == Role::Client {
            self.stats.add_session_reused();
        }
        debug!(
            "{tag} handshake done as {:?} with {}, session reused: {reused}",
            conn.role, conn.peer
        );
        self.notify_handshake(id, Ok(()));
    }

    /// Tell the pending handshake and the reader why a local close started.
    fn notify_close(&mut self, id: ConnId) {
        let Some(conn) = self.conns.get_mut(&id) else {
            return;
        };
        if !conn.closing || conn.close_notified {
            return;
        }
        conn.close_notified = true;
        let Some(reason) = conn.close_reason.clone() else {
            return;
        };

        self.notify_handshake(id, Err(reason.clone()));

        let Some(conn) = self.conns.get_mut(&id) else {
            return;
        };
        if conn.phase == Phase::Io && conn.read_requested {
            conn.read_requested = false;
            if let Some(mut cb) = conn.recv_cb.take() {
                cb(self, id, Err(reason));
            }
        }
    }

    fn deliver_deferred_error(&mut self, id: ConnId) {
        let Some(conn) = self.conns.get_mut(&id) else {
            return;
        };
        if !conn.read_requested || conn.read_paused || conn.recv_cb.is_none() {
            return;
        }
        if let Some(e) = conn.deferred_error.take() {
            self.deliver_read_error(id, e);
        }
    }

    fn process_cancel(&mut self, id: ConnId) {
        let tag = self.tag(id);
        let Some(conn) = self.conns.get_mut(&id) else {
            return;
        };
        if !conn.cancel_pending {
            return;
        }
        conn.cancel_pending = false;

        match conn.phase {
            Phase::Init | Phase::Handshaking => {
                debug!("{tag} read canceled during handshake");
                self.notify_handshake(id, Err(TlsTransportError::Canceled));
                self.begin_close(id, None, false);
            }
            Phase::Io => {
                if !conn.read_requested {
                    return;
                }
                conn.read_requested = false;
                if conn.outer_read != OuterRead::Idle {
                    if let Some(handle) = &conn.outer {
                        self.transport.cancel_read(handle);
                    }
                    conn.outer_read = OuterRead::Idle;
                }
                if let Some(mut cb) = conn.recv_cb.take() {
                    cb(self, id, Err(TlsTransportError::Canceled));
                }
            }
            Phase::Closed => {}
        }
    }

    /// Hand queued plaintext to the engine, oldest first.
    fn encrypt_waiting(&mut self, id: ConnId) {
        let tag = self.tag(id);
        loop {
            let Some(conn) = self.conns.get_mut(&id) else {
                return;
            };
            if conn.phase != Phase::Io || conn.closing {
                return;
            }
            let Some(engine) = conn.engine.as_mut() else {
                return;
            };
            let Some((data, send_cb)) = conn.waiting_sends.pop_front() else {
                return;
            };

            match engine.encrypt(&data) {
                EngineStatus::Done => {
                    let end = conn.ciphertext_submitted + engine.pending_ciphertext() as u64;
                    conn.encrypted_sends.push_back((end, send_cb));
                }
                EngineStatus::WantRead | EngineStatus::WantWrite => {
                    conn.waiting_sends.push_front((data, send_cb));
                    return;
                }
                EngineStatus::Fatal(e) => {
                    conn.fatal = true;
                    let err = e.classify(false);
                    warn!("{tag} encrypt failed: {err}");
                    send_cb(self, id, Err(err.clone()));
                    self.deliver_read_error(id, err);
                    self.begin_close(id, None, true);
                    return;
                }
            }
        }
    }

    /// Deliver decrypted data for as long as the reader keeps reading.
    fn decrypt_available(&mut self, id: ConnId, pure_retrigger: bool) {
        let tag = self.tag(id);
        let mut buf = std::mem::take(&mut self.read_buf);
        if buf.is_empty() {
            // taken by an outer pump of another connection
            buf = vec![0u8; TLS_READ_CHUNK_SIZE];
        }

        loop {
            let Some(conn) = self.conns.get_mut(&id) else {
                break;
            };
            if !conn.delivering() {
                break;
            }
            let Some(engine) = conn.engine.as_mut() else {
                break;
            };

            match engine.decrypt_next(&mut buf) {
                DecryptStatus::Chunk(n) => {
                    let Some(mut cb) = conn.recv_cb.take() else {
                        break;
                    };
                    cb(self, id, Ok(&buf[..n]));
                    if let Some(conn) = self.conns.get_mut(&id) {
                        if conn.read_requested && conn.recv_cb.is_none() {
                            conn.recv_cb = Some(cb);
                        }
                    }
                }
                DecryptStatus::WouldBlock => break,
                DecryptStatus::Eof => {
                    debug!("{tag} close notify received");
                    self.deliver_read_error(id, TlsTransportError::PeerClosed);
                    self.begin_close(id, None, false);
                    break;
                }
                DecryptStatus::Fatal(e) if e.is_spurious_eof() && pure_retrigger => {
                    trace!("{tag} ignore eof without error on retrigger");
                    break;
                }
                DecryptStatus::Fatal(e) => {
                    conn.fatal = true;
                    let err = e.classify(false);
                    warn!("{tag} decrypt failed: {err}");
                    self.deliver_read_error(id, err);
                    self.begin_close(id, None, true);
                    break;
                }
            }
        }

        if self.read_buf.is_empty() {
            self.read_buf = buf;
        }
    }

    /// Submit pending ciphertext if no write is in flight, and settle the
    /// sends it covers.
    fn flush(&mut self, id: ConnId) {
        let tag = self.tag(id);
        let Some(conn) = self.conns.get_mut(&id) else {
            return;
        };

        if !conn.transport_failed && conn.pending_sends == 0 {
            if let (Some(engine), Some(handle)) = (conn.engine.as_mut(), conn.outer.as_ref()) {
                if engine.pending_ciphertext() > 0 {
                    let data = engine.drain_ciphertext(TLS_BUF_SIZE);
                    trace!("{tag} write {} bytes", data.len());
                    conn.ciphertext_submitted += data.len() as u64;
                    conn.pending_sends += 1;
                    self.transport.write(id, handle, data);
                }
            }
        }

        let mut done = Vec::new();
        loop {
            let end = match conn.encrypted_sends.front() {
                Some((end, _)) => *end,
                None => break,
            };
            if end > conn.ciphertext_submitted {
                break;
            }
            let Some((_, send_cb)) = conn.encrypted_sends.pop_front() else {
                break;
            };
            if conn.pending_sends > 0 {
                conn.inflight_sends.push(send_cb);
            } else {
                // nothing was left to write for it
                done.push(send_cb);
            }
        }
        for send_cb in done {
            send_cb(self, id, Ok(()));
        }
    }

    fn update_outer_read(&mut self, id: ConnId) {
        let Some(conn) = self.conns.get_mut(&id) else {
            return;
        };
        let Some(handle) = conn.outer.as_ref() else {
            return;
        };
        match (conn.wants_outer_read(), conn.outer_read) {
            (true, OuterRead::Idle) => {
                self.transport.read(id, handle);
                conn.outer_read = OuterRead::Active;
            }
            (true, OuterRead::Paused) => {
                self.transport.resume_read(handle);
                conn.outer_read = OuterRead::Active;
            }
            (false, OuterRead::Active) => {
                self.transport.pause_read(handle);
                conn.outer_read = OuterRead::Paused;
            }
            _ => {}
        }
    }

    fn finish_close_if_ready(&mut self, id: ConnId) {
        if self.conns.get(&id).is_some_and(|c| c.can_finish_close()) {
            self.finish_close(id);
        }
    }

    /// Destroy the connection and release its transport handle.
    ///
    /// Everything still waiting on it completes here, after it is gone.
    pub(super) fn finish_close(&mut self, id: ConnId) {
        let tag = self.tag(id);
        let Some(mut conn) = self.conns.remove(&id) else {
            return;
        };
        conn.phase = Phase::Closed;
        let reason = if self.shutting_down {
            TlsTransportError::ShuttingDown
        } else {
            TlsTransportError::Canceled
        };

        if conn.should_remember_session() {
            if let (Some(cache), Some(engine)) = (&conn.session_cache, &conn.engine) {
                if let Some(session) = engine.session_get() {
                    if cache.remember(&conn.peer.to_string(), session) {
                        self.stats.add_session_cached();
                        trace!("{tag} session cached for {}", conn.peer);
                    }
                }
            }
        }
        conn.engine = None;

        if conn.outer_read != OuterRead::Idle {
            if let Some(handle) = &conn.outer {
                self.transport.cancel_read(handle);
            }
            conn.outer_read = OuterRead::Idle;
        }
        if let Some(handle) = conn.outer.take() {
            self.transport.close(handle);
        }
        self.stats.add_closed();
        debug!("{tag} closed");

        let handshake_cb = conn.handshake_cb.take();
        let mut recv_cb = if conn.handshake_completed && conn.read_requested {
            conn.recv_cb.take()
        } else {
            None
        };
        if let Some(error) = conn.deferred_error.take() {
            // wait for the reader to come back
            self.closed_reads.put(
                id,
                ClosedRead {
                    error,
                    recv_cb: recv_cb.take(),
                },
            );
        }
        let unsent = conn.take_unsent();
        drop(conn);

        if let Some(notify) = handshake_cb {
            self.call_handshake_cb(notify, id, Err(reason.clone()));
        }
        if let Some(mut cb) = recv_cb {
            cb(self, id, Err(reason.clone()));
        }
        if !unsent.is_empty() {
            debug!("{tag} {} sends dropped: {reason}", unsent.len());
        }
        for send_cb in unsent {
            send_cb(self, id, Err(reason.clone()));
        }
    }
}
