/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use anyhow::anyhow;

mod protocol;
pub use protocol::TlsProtocol;

mod cert_pair;
pub use cert_pair::TlsCertificatePair;

mod client;
pub use client::{OpensslClientSessionCache, TlsClientConfig, TlsClientConfigBuilder};

mod server;
pub use server::{TlsServerConfig, TlsServerConfigBuilder};

#[cfg(feature = "yaml")]
pub(crate) mod yaml;

#[cfg(test)]
pub(crate) mod testutil;

/// ALPN id for DNS over TLS
const ALPN_DOT: &str = "dot";

fn expand_alpn_name(name: &str) -> &str {
    match name.to_ascii_lowercase().as_str() {
        "dot" | "dns" | "dns_over_tls" => ALPN_DOT,
        _ => name,
    }
}

/// Encode protocol names into the length prefixed ALPN wire format.
fn alpn_wire_sequence(protocols: &[String]) -> anyhow::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(32);
    for p in protocols {
        let name = expand_alpn_name(p);
        let len = u8::try_from(name.len())
            .ok()
            .filter(|len| *len > 0)
            .ok_or_else(|| anyhow!("invalid alpn protocol name {p}"))?;
        buf.push(len);
        buf.extend_from_slice(name.as_bytes());
    }
    Ok(buf)
}

/// Pick the first of our protocols that the client also offered.
fn select_alpn<'a>(ours: &[u8], offered: &'a [u8]) -> Option<&'a [u8]> {
    let mut ours_left = ours;
    while let Some((len, rest)) = ours_left.split_first() {
        let len = *len as usize;
        if rest.len() < len {
            return None;
        }
        let (want, next) = rest.split_at(len);
        ours_left = next;

        let mut offered_left = offered;
        while let Some((olen, orest)) = offered_left.split_first() {
            let olen = *olen as usize;
            if orest.len() < olen {
                break;
            }
            let (name, onext) = orest.split_at(olen);
            if name == want {
                return Some(name);
            }
            offered_left = onext;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alpn_wire() {
        let wire = alpn_wire_sequence(&["DoT".to_string(), "h2".to_string()]).unwrap();
        assert_eq!(wire, b"\x03dot\x02h2");
        assert!(alpn_wire_sequence(&[String::new()]).is_err());
        assert!(alpn_wire_sequence(&["a".repeat(256)]).is_err());
    }

    #[test]
    fn alpn_select() {
        let ours = b"\x03dot\x02h2";
        assert_eq!(select_alpn(ours, b"\x02h2\x03dot"), Some(&b"dot"[..]));
        assert_eq!(select_alpn(ours, b"\x08http/1.1\x02h2"), Some(&b"h2"[..]));
        assert_eq!(select_alpn(ours, b"\x08http/1.1"), None);
        assert_eq!(select_alpn(ours, b"\x09http/1.1"), None);
    }
}
