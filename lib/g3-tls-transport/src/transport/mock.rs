/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;

use super::Transport;
use crate::worker::{ConnId, ListenerId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct MockHandle(pub(crate) u32);

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum MockCall {
    Connect { token: ConnId, remote: SocketAddr },
    Listen { listener: ListenerId, local: SocketAddr },
    StopListen(ListenerId),
    Read(ConnId, MockHandle),
    PauseRead(MockHandle),
    ResumeRead(MockHandle),
    CancelRead(MockHandle),
    Write(ConnId, MockHandle, Bytes),
    Close(MockHandle),
}

/// Records every request; completions are fed back by the test.
#[derive(Default)]
pub(crate) struct MockTransport {
    pub(crate) calls: Vec<MockCall>,
    pub(crate) fail_listen: bool,
}

impl MockTransport {
    pub(crate) fn writes(&self, handle: MockHandle) -> Vec<Bytes> {
        self.calls
            .iter()
            .filter_map(|c| match c {
                MockCall::Write(_, h, data) if *h == handle => Some(data.clone()),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn count<F>(&self, f: F) -> usize
    where
        F: Fn(&MockCall) -> bool,
    {
        self.calls.iter().filter(|c| f(c)).count()
    }

    pub(crate) fn closed(&self, handle: MockHandle) -> bool {
        self.calls.contains(&MockCall::Close(handle))
    }

    /// The outer read state of the handle as implied by the recorded calls.
    pub(crate) fn reading(&self, handle: MockHandle) -> bool {
        let mut reading = false;
        for c in &self.calls {
            match c {
                MockCall::Read(_, h) | MockCall::ResumeRead(h) if *h == handle => reading = true,
                MockCall::PauseRead(h) | MockCall::CancelRead(h) | MockCall::Close(h)
                    if *h == handle =>
                {
                    reading = false
                }
                _ => {}
            }
        }
        reading
    }
}

impl Transport for MockTransport {
    type Handle = MockHandle;

    fn connect(
        &mut self,
        token: ConnId,
        _local: Option<SocketAddr>,
        remote: SocketAddr,
        _timeout: Duration,
    ) {
        self.calls.push(MockCall::Connect { token, remote });
    }

    fn listen(
        &mut self,
        listener: ListenerId,
        local: SocketAddr,
        _backlog: u32,
    ) -> io::Result<SocketAddr> {
        if self.fail_listen {
            return Err(io::Error::from(io::ErrorKind::AddrInUse));
        }
        self.calls.push(MockCall::Listen { listener, local });
        Ok(local)
    }

    fn stop_listen(&mut self, listener: ListenerId) {
        self.calls.push(MockCall::StopListen(listener));
    }

    fn read(&mut self, token: ConnId, handle: &MockHandle) {
        self.calls.push(MockCall::Read(token, *handle));
    }

    fn pause_read(&mut self, handle: &MockHandle) {
        self.calls.push(MockCall::PauseRead(*handle));
    }

    fn resume_read(&mut self, handle: &MockHandle) {
        self.calls.push(MockCall::ResumeRead(*handle));
    }

    fn cancel_read(&mut self, handle: &MockHandle) {
        self.calls.push(MockCall::CancelRead(*handle));
    }

    fn write(&mut self, token: ConnId, handle: &MockHandle, data: Bytes) {
        self.calls.push(MockCall::Write(token, *handle, data));
    }

    fn close(&mut self, handle: MockHandle) {
        self.calls.push(MockCall::Close(handle));
    }
}
