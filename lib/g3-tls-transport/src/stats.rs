/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct TlsTransportStats {
    handshake_ok: AtomicU64,
    handshake_failed: AtomicU64,
    session_offered: AtomicU64,
    session_reused: AtomicU64,
    session_cached: AtomicU64,
    closed: AtomicU64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TlsTransportStatsSnapshot {
    pub handshake_ok: u64,
    pub handshake_failed: u64,
    pub session_offered: u64,
    pub session_reused: u64,
    pub session_cached: u64,
    pub closed: u64,
}

impl TlsTransportStats {
    #[inline]
    pub(crate) fn add_handshake_ok(&self) {
        self.handshake_ok.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn add_handshake_failed(&self) {
        self.handshake_failed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn add_session_offered(&self) {
        self.session_offered.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn add_session_reused(&self) {
        self.session_reused.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn add_session_cached(&self) {
        self.session_cached.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn add_closed(&self) {
        self.closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TlsTransportStatsSnapshot {
        TlsTransportStatsSnapshot {
            handshake_ok: self.handshake_ok.load(Ordering::Relaxed),
            handshake_failed: self.handshake_failed.load(Ordering::Relaxed),
            session_offered: self.session_offered.load(Ordering::Relaxed),
            session_reused: self.session_reused.load(Ordering::Relaxed),
            session_cached: self.session_cached.load(Ordering::Relaxed),
            closed: self.closed.load(Ordering::Relaxed),
        }
    }
}

impl TlsTransportStatsSnapshot {
    pub fn session_reuse_ratio(&self) -> Option<f64> {
        if self.session_offered == 0 {
            return None;
        }
        Some(self.session_reused as f64 / self.session_offered as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reuse_ratio() {
        let stats = TlsTransportStats::default();
        assert!(stats.snapshot().session_reuse_ratio().is_none());

        stats.add_session_offered();
        stats.add_session_offered();
        stats.add_session_reused();
        let snap = stats.snapshot();
        assert_eq!(snap.session_offered, 2);
        assert_eq!(snap.session_reused, 1);
        assert_eq!(snap.session_reuse_ratio(), Some(0.5));
    }
}
