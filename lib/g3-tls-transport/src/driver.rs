/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::sync::Arc;

use log::{debug, info};
use tokio::sync::{mpsc, watch};

use crate::{
    TcpHandle, TcpTransportConfig, TlsEngine, TlsTransportStats, TlsWorker, TokioTcpTransport,
    TransportEvent,
};

/// Runs one [`TlsWorker`] over tokio TCP on the current thread.
///
/// The driver must be polled inside a [`tokio::task::LocalSet`].
pub struct WorkerDriver<E: TlsEngine> {
    worker: TlsWorker<TokioTcpTransport, E>,
    receiver: mpsc::UnboundedReceiver<TransportEvent<TcpHandle>>,
}

impl<E: TlsEngine> WorkerDriver<E> {
    pub fn new(worker_id: usize, config: TcpTransportConfig) -> Self {
        Self::with_stats(worker_id, config, Arc::new(TlsTransportStats::default()))
    }

    pub fn with_stats(
        worker_id: usize,
        config: TcpTransportConfig,
        stats: Arc<TlsTransportStats>,
    ) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let transport = TokioTcpTransport::new(config, sender);
        WorkerDriver {
            worker: TlsWorker::with_stats(worker_id, transport, stats),
            receiver,
        }
    }

    #[inline]
    pub fn worker(&self) -> &TlsWorker<TokioTcpTransport, E> {
        &self.worker
    }

    #[inline]
    pub fn worker_mut(&mut self) -> &mut TlsWorker<TokioTcpTransport, E> {
        &mut self.worker
    }

    /// Wait for the next transport completion and feed it to the worker.
    ///
    /// Returns false if no more completions can arrive.
    pub async fn run_once(&mut self) -> bool {
        match self.receiver.recv().await {
            Some(event) => {
                self.worker.handle_event(event);
                true
            }
            None => false,
        }
    }

    /// Feed completions until `done` returns true.
    pub async fn run_until<F>(&mut self, mut done: F)
    where
        F: FnMut(&mut TlsWorker<TokioTcpTransport, E>) -> bool,
    {
        while !done(&mut self.worker) {
            if !self.run_once().await {
                break;
            }
        }
    }

    /// Serve until `close` fires, then shut the worker down and wait for
    /// every connection to go away.
    pub async fn run_until_closed(&mut self, mut close: watch::Receiver<()>) {
        let worker_id = self.worker.worker_id();
        info!("TLS[w{worker_id}] started");
        loop {
            if self.worker.is_shutdown_complete() {
                break;
            }
            let shutting_down = self.worker.is_shutting_down();
            tokio::select! {
                biased;

                _ = close.changed(), if !shutting_down => {
                    debug!("TLS[w{worker_id}] close signal received");
                    self.worker.shutdown();
                }
                r = self.receiver.recv() => match r {
                    Some(event) => self.worker.handle_event(event),
                    None => break,
                }
            }
        }
        info!("TLS[w{worker_id}] stopped");
    }
}
