/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard};

use ahash::AHashMap;
use lru::LruCache;

pub trait ResumableSession: Send + 'static {
    /// Whether the session carries a ticket or session id a later
    /// handshake could resume from.
    fn is_resumable(&self) -> bool;
}

struct CacheEntry<S> {
    peer: Arc<str>,
    session: S,
}

struct CacheInner<S> {
    buckets: AHashMap<Arc<str>, VecDeque<u64>>,
    /// every entry of all buckets, oldest first
    lru: LruCache<u64, CacheEntry<S>, ahash::RandomState>,
    next_id: u64,
}

impl<S> CacheInner<S> {
    fn unlink(&mut self, peer: &str, id: u64) {
        let Some(bucket) = self.buckets.get_mut(peer) else {
            return;
        };
        if bucket.front() == Some(&id) {
            bucket.pop_front();
        } else if let Some(pos) = bucket.iter().position(|v| *v == id) {
            bucket.remove(pos);
        }
        if bucket.is_empty() {
            self.buckets.remove(peer);
        }
    }
}

/// Client side session cache, keyed by the remote peer.
///
/// The cache is bound to one client context and keeps it alive for as long
/// as any cached session may still be handed to a new connection.
pub struct TlsClientSessionCache<C, S> {
    context: Arc<C>,
    capacity: NonZeroUsize,
    inner: Mutex<CacheInner<S>>,
}

impl<C, S: ResumableSession> TlsClientSessionCache<C, S> {
    pub fn new(context: Arc<C>, capacity: NonZeroUsize) -> Self {
        TlsClientSessionCache {
            context,
            capacity,
            inner: Mutex::new(CacheInner {
                buckets: AHashMap::new(),
                lru: LruCache::with_hasher(capacity, ahash::RandomState::new()),
                next_id: 0,
            }),
        }
    }

    #[inline]
    pub fn context(&self) -> &Arc<C> {
        &self.context
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity.get()
    }

    fn lock(&self) -> MutexGuard<'_, CacheInner<S>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Store a session for `peer`, evicting the oldest entry of the whole
    /// cache if it is full.
    ///
    /// Returns false if the session is not resumable.
    pub fn remember(&self, peer: &str, session: S) -> bool {
        if !session.is_resumable() {
            return false;
        }

        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id = inner.next_id.wrapping_add(1);

        let peer: Arc<str> = match inner.buckets.get_key_value(peer) {
            Some((k, _)) => Arc::clone(k),
            None => Arc::from(peer),
        };
        inner
            .buckets
            .entry(Arc::clone(&peer))
            .or_default()
            .push_back(id);

        let entry = CacheEntry { peer, session };
        if let Some((old_id, old)) = inner.lru.push(id, entry) {
            inner.unlink(&old.peer, old_id);
        }
        true
    }

    /// Take the newest session cached for `peer`.
    ///
    /// The session is removed from the cache and will never be returned again.
    pub fn take(&self, peer: &str) -> Option<S> {
        let mut inner = self.lock();
        let bucket = inner.buckets.get_mut(peer)?;
        let id = bucket.pop_back();
        if bucket.is_empty() {
            inner.buckets.remove(peer);
        }
        let entry = inner.lru.pop(&id?)?;
        Some(entry.session)
    }

    pub fn len(&self) -> usize {
        self.lock().lru.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn peer_count(&self) -> usize {
        self.lock().buckets.len()
    }
}
