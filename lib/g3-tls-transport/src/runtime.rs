/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::future::Future;
use std::num::NonZeroUsize;
use std::thread::JoinHandle;

use anyhow::anyhow;
use log::{error, trace, warn};
use tokio::sync::watch;
use tokio::task::LocalSet;

/// Worker threads, each with its own current thread tokio runtime.
pub struct WorkerRuntimeConfig {
    thread_number: NonZeroUsize,
    thread_stack_size: Option<usize>,
    max_io_events_per_tick: Option<usize>,
}

impl Default for WorkerRuntimeConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerRuntimeConfig {
    pub fn new() -> Self {
        let thread_number = std::thread::available_parallelism().unwrap_or(NonZeroUsize::MIN);
        WorkerRuntimeConfig {
            thread_number,
            thread_stack_size: None,
            max_io_events_per_tick: None,
        }
    }

    pub fn set_thread_number(&mut self, num: NonZeroUsize) {
        self.thread_number = num;
    }

    pub fn set_thread_stack_size(&mut self, size: usize) {
        self.thread_stack_size = Some(size);
    }

    pub fn set_max_io_events_per_tick(&mut self, capacity: usize) {
        self.max_io_events_per_tick = Some(capacity);
    }

    #[inline]
    pub fn thread_number(&self) -> usize {
        self.thread_number.get()
    }

    pub fn check(&self) -> anyhow::Result<()> {
        if let Some(n) = self.max_io_events_per_tick {
            if n == 0 {
                return Err(anyhow!("max io events per tick should not be 0"));
            }
        }
        Ok(())
    }

    /// Spawn the worker threads and run `f(worker_id, close_receiver)` on
    /// each of them inside a [`LocalSet`].
    pub fn start<F, Fut>(&self, f: F) -> anyhow::Result<WorkersGuard>
    where
        F: Fn(usize, watch::Receiver<()>) -> Fut + Clone + Send + 'static,
        Fut: Future<Output = ()> + 'static,
    {
        let (close_w, _close_r) = watch::channel(());
        let mut handles = Vec::with_capacity(self.thread_number.get());

        for i in 0..self.thread_number.get() {
            let close_r = close_w.subscribe();
            let f = f.clone();

            let mut thread_builder = std::thread::Builder::new().name(format!("worker#{i}"));
            if let Some(stack_size) = self.thread_stack_size {
                thread_builder = thread_builder.stack_size(stack_size);
            }
            let max_io_events_per_tick = self.max_io_events_per_tick;

            let handle = thread_builder
                .spawn(move || {
                    trace!("started worker thread #{i}");

                    let mut builder = tokio::runtime::Builder::new_current_thread();
                    builder.enable_all();
                    if let Some(n) = max_io_events_per_tick {
                        builder.max_io_events_per_tick(n);
                    }

                    match builder.build() {
                        Ok(rt) => {
                            let local = LocalSet::new();
                            local.block_on(&rt, f(i, close_r));
                        }
                        Err(e) => {
                            error!("failed to create tokio runtime on worker thread {i}: {e}");
                        }
                    }
                    trace!("stopped worker thread #{i}");
                })
                .map_err(|e| anyhow!("failed to spawn worker thread {i}: {e}"))?;
            handles.push(handle);
        }

        Ok(WorkersGuard {
            close_sender: close_w,
            handles,
        })
    }
}

/// Signals every worker to close when shut down or dropped.
pub struct WorkersGuard {
    close_sender: watch::Sender<()>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkersGuard {
    #[inline]
    pub fn worker_count(&self) -> usize {
        self.handles.len()
    }

    /// Tell all workers to close and wait for their threads to exit.
    pub fn shutdown(mut self) {
        let _ = self.close_sender.send(());
        for (i, handle) in self.handles.drain(..).enumerate() {
            if handle.join().is_err() {
                warn!("worker thread #{i} panicked");
            }
        }
    }
}

impl Drop for WorkersGuard {
    fn drop(&mut self) {
        let _ = self.close_sender.send(());
    }
}
