/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::cell::RefCell;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;

use ahash::AHashMap;
use bytes::{Bytes, BytesMut};
use log::{debug, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;

use super::{Transport, TransportEvent};
use crate::TransportError;
use crate::worker::{ConnId, ListenerId};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_LISTEN_BACKLOG: u32 = 4096;
const DEFAULT_READ_BUFFER_SIZE: usize = 16384;
const MINIMAL_READ_BUFFER_SIZE: usize = 1024;
const ACCEPT_RETRY_WAIT: Duration = Duration::from_millis(10);

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TcpTransportConfig {
    connect_timeout: Duration,
    read_timeout: Option<Duration>,
    backlog: u32,
    read_buffer_size: usize,
}

impl Default for TcpTransportConfig {
    fn default() -> Self {
        TcpTransportConfig {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: None,
            backlog: DEFAULT_LISTEN_BACKLOG,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
        }
    }
}

impl TcpTransportConfig {
    /// Used when a connect request does not carry its own timeout.
    pub fn set_connect_timeout(&mut self, timeout: Duration) {
        self.connect_timeout = timeout;
    }

    /// Fail a reading connection that has been idle for this long.
    pub fn set_read_timeout(&mut self, timeout: Duration) {
        self.read_timeout = Some(timeout);
    }

    /// Used when a listen request passes a zero backlog.
    pub fn set_backlog(&mut self, backlog: u32) {
        self.backlog = backlog;
    }

    pub fn set_read_buffer_size(&mut self, size: usize) {
        self.read_buffer_size = size.max(MINIMAL_READ_BUFFER_SIZE);
    }

    #[inline]
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    #[inline]
    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout
    }

    #[inline]
    pub fn backlog(&self) -> u32 {
        self.backlog
    }

    #[inline]
    pub fn read_buffer_size(&self) -> usize {
        self.read_buffer_size
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ReadCtl {
    Run,
    Pause,
    Stop,
}

pub struct TcpConn {
    local: SocketAddr,
    peer: SocketAddr,
    /// taken by the read task once reading starts
    reader: RefCell<Option<OwnedReadHalf>>,
    writer: Mutex<OwnedWriteHalf>,
    read_ctl: watch::Sender<ReadCtl>,
}

pub type TcpHandle = Rc<TcpConn>;

impl TcpConn {
    fn new(stream: TcpStream, peer: SocketAddr) -> io::Result<Self> {
        let local = stream.local_addr()?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        let (read_ctl, _) = watch::channel(ReadCtl::Pause);
        Ok(TcpConn {
            local,
            peer,
            reader: RefCell::new(Some(reader)),
            writer: Mutex::new(writer),
            read_ctl,
        })
    }

    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    #[inline]
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

impl fmt::Debug for TcpConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpConn")
            .field("local", &self.local)
            .field("peer", &self.peer)
            .finish()
    }
}

/// [`Transport`] over tokio TCP sockets.
///
/// All tasks are spawned with [`tokio::task::spawn_local`], so the transport
/// must be driven from inside a [`tokio::task::LocalSet`].
pub struct TokioTcpTransport {
    config: TcpTransportConfig,
    events: mpsc::UnboundedSender<TransportEvent<TcpHandle>>,
    listeners: AHashMap<ListenerId, JoinHandle<()>>,
}

impl TokioTcpTransport {
    pub fn new(
        config: TcpTransportConfig,
        events: mpsc::UnboundedSender<TransportEvent<TcpHandle>>,
    ) -> Self {
        TokioTcpTransport {
            config,
            events,
            listeners: AHashMap::new(),
        }
    }

    #[inline]
    pub fn config(&self) -> &TcpTransportConfig {
        &self.config
    }
}

impl Drop for TokioTcpTransport {
    fn drop(&mut self) {
        for (_, task) in self.listeners.drain() {
            task.abort();
        }
    }
}

async fn connect_to(local: Option<SocketAddr>, remote: SocketAddr) -> io::Result<TcpStream> {
    let socket = if remote.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    if let Some(addr) = local {
        socket.bind(addr)?;
    }
    socket.connect(remote).await
}

fn new_listener(local: SocketAddr, backlog: u32) -> io::Result<TcpListener> {
    let socket = if local.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    if local.port() != 0 {
        // every worker binds the same address
        socket.set_reuseaddr(true)?;
        #[cfg(any(
            target_os = "linux",
            target_os = "android",
            target_os = "freebsd",
            target_os = "macos"
        ))]
        socket.set_reuseport(true)?;
    }
    socket.bind(local)?;
    socket.listen(backlog)
}

async fn accept_loop(
    listener: ListenerId,
    tcp_listener: TcpListener,
    events: mpsc::UnboundedSender<TransportEvent<TcpHandle>>,
) {
    loop {
        match tcp_listener.accept().await {
            Ok((stream, peer)) => match TcpConn::new(stream, peer) {
                Ok(conn) => {
                    let event = TransportEvent::Accepted {
                        listener,
                        handle: Rc::new(conn),
                        peer,
                    };
                    if events.send(event).is_err() {
                        break;
                    }
                }
                Err(e) => debug!("failed to setup accepted connection from {peer}: {e}"),
            },
            Err(e) => {
                warn!("listener {listener} accept failed: {e}");
                tokio::time::sleep(ACCEPT_RETRY_WAIT).await;
            }
        }
    }
}

async fn read_with_timeout(
    reader: &mut OwnedReadHalf,
    buf: &mut BytesMut,
    timeout: Option<Duration>,
) -> io::Result<usize> {
    match timeout {
        Some(timeout) => match tokio::time::timeout(timeout, reader.read_buf(buf)).await {
            Ok(r) => r,
            Err(_) => Err(io::Error::from(io::ErrorKind::TimedOut)),
        },
        None => reader.read_buf(buf).await,
    }
}

async fn read_loop(
    token: ConnId,
    mut reader: OwnedReadHalf,
    mut ctl: watch::Receiver<ReadCtl>,
    events: mpsc::UnboundedSender<TransportEvent<TcpHandle>>,
    buffer_size: usize,
    timeout: Option<Duration>,
) {
    let mut buf = BytesMut::with_capacity(buffer_size);
    loop {
        let state = match ctl.wait_for(|c| *c != ReadCtl::Pause).await {
            Ok(state) => *state,
            Err(_) => return,
        };
        if state == ReadCtl::Stop {
            return;
        }

        buf.reserve(buffer_size);
        let r = tokio::select! {
            biased;

            r = ctl.changed() => {
                if r.is_err() {
                    return;
                }
                continue;
            }
            r = read_with_timeout(&mut reader, &mut buf, timeout) => r,
        };

        let (result, done) = match r {
            Ok(0) => (Err(TransportError::Eof), true),
            Ok(_) => (Ok(buf.split().freeze()), false),
            Err(e) => (Err(TransportError::from(e)), true),
        };
        if events.send(TransportEvent::Read { token, result }).is_err() || done {
            return;
        }
    }
}

impl Transport for TokioTcpTransport {
    type Handle = TcpHandle;

    fn connect(
        &mut self,
        token: ConnId,
        local: Option<SocketAddr>,
        remote: SocketAddr,
        timeout: Duration,
    ) {
        let timeout = if timeout.is_zero() {
            self.config.connect_timeout
        } else {
            timeout
        };
        let events = self.events.clone();
        tokio::task::spawn_local(async move {
            let result = match tokio::time::timeout(timeout, connect_to(local, remote)).await {
                Ok(Ok(stream)) => TcpConn::new(stream, remote)
                    .map(|conn| (Rc::new(conn), remote))
                    .map_err(TransportError::from),
                Ok(Err(e)) => Err(TransportError::from(e)),
                Err(_) => Err(TransportError::Timeout),
            };
            let _ = events.send(TransportEvent::Connected { token, result });
        });
    }

    fn listen(
        &mut self,
        listener: ListenerId,
        local: SocketAddr,
        backlog: u32,
    ) -> io::Result<SocketAddr> {
        let backlog = if backlog == 0 {
            self.config.backlog
        } else {
            backlog
        };
        let tcp_listener = new_listener(local, backlog)?;
        let addr = tcp_listener.local_addr()?;
        let task = tokio::task::spawn_local(accept_loop(
            listener,
            tcp_listener,
            self.events.clone(),
        ));
        if let Some(old) = self.listeners.insert(listener, task) {
            old.abort();
        }
        Ok(addr)
    }

    fn stop_listen(&mut self, listener: ListenerId) {
        if let Some(task) = self.listeners.remove(&listener) {
            task.abort();
        }
    }

    fn read(&mut self, token: ConnId, handle: &TcpHandle) {
        handle.read_ctl.send_replace(ReadCtl::Run);
        let Some(reader) = handle.reader.borrow_mut().take() else {
            return;
        };
        tokio::task::spawn_local(read_loop(
            token,
            reader,
            handle.read_ctl.subscribe(),
            self.events.clone(),
            self.config.read_buffer_size,
            self.config.read_timeout,
        ));
    }

    fn pause_read(&mut self, handle: &TcpHandle) {
        handle.read_ctl.send_replace(ReadCtl::Pause);
    }

    fn resume_read(&mut self, handle: &TcpHandle) {
        handle.read_ctl.send_replace(ReadCtl::Run);
    }

    fn cancel_read(&mut self, handle: &TcpHandle) {
        // the read task stays parked until the next read request
        handle.read_ctl.send_replace(ReadCtl::Pause);
    }

    fn write(&mut self, token: ConnId, handle: &TcpHandle, data: Bytes) {
        let handle = Rc::clone(handle);
        let events = self.events.clone();
        tokio::task::spawn_local(async move {
            let mut writer = handle.writer.lock().await;
            let result = writer
                .write_all(&data)
                .await
                .map_err(TransportError::from);
            let _ = events.send(TransportEvent::WriteDone { token, result });
        });
    }

    fn close(&mut self, handle: TcpHandle) {
        handle.read_ctl.send_replace(ReadCtl::Stop);
        handle.reader.borrow_mut().take();
        tokio::task::spawn_local(async move {
            let mut writer = handle.writer.lock().await;
            let _ = writer.shutdown().await;
        });
    }
}
