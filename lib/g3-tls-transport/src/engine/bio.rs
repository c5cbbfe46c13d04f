/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::io::{self, Read, Write};

use bytes::{Buf, Bytes, BytesMut};

/// In memory transport for the ssl state machine.
///
/// Reading from an empty inbound buffer reports `WouldBlock`, so the ssl
/// layer asks for more input instead of treating it as end of stream.
#[derive(Default)]
pub(crate) struct MemoryBio {
    incoming: BytesMut,
    outgoing: BytesMut,
}

impl MemoryBio {
    #[inline]
    pub(crate) fn feed(&mut self, data: &[u8]) {
        self.incoming.extend_from_slice(data);
    }

    #[inline]
    pub(crate) fn outgoing_len(&self) -> usize {
        self.outgoing.len()
    }

    pub(crate) fn drain(&mut self, max_size: usize) -> Bytes {
        let len = self.outgoing.len().min(max_size);
        self.outgoing.split_to(len).freeze()
    }
}

impl Read for MemoryBio {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.incoming.is_empty() {
            return Err(io::Error::from(io::ErrorKind::WouldBlock));
        }
        let len = self.incoming.len().min(buf.len());
        buf[..len].copy_from_slice(&self.incoming[..len]);
        self.incoming.advance(len);
        Ok(len)
    }
}

impl Write for MemoryBio {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.outgoing.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_empty() {
        let mut bio = MemoryBio::default();
        let mut buf = [0u8; 8];
        let e = bio.read(&mut buf).unwrap_err();
        assert_eq!(e.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn read_partial() {
        let mut bio = MemoryBio::default();
        bio.feed(b"123456");
        let mut buf = [0u8; 4];
        assert_eq!(bio.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf, b"1234");
        assert_eq!(bio.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"56");
        assert!(bio.read(&mut buf).is_err());
    }

    #[test]
    fn drain_chunked() {
        let mut bio = MemoryBio::default();
        bio.write_all(b"abcdef").unwrap();
        assert_eq!(bio.outgoing_len(), 6);
        assert_eq!(bio.drain(4).as_ref(), b"abcd");
        assert_eq!(bio.drain(4).as_ref(), b"ef");
        assert!(bio.drain(4).is_empty());
    }
}
