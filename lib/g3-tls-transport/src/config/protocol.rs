/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::str::FromStr;

use anyhow::anyhow;
use openssl::ssl::SslVersion;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum TlsProtocol {
    Tls12,
    Tls13,
}

impl TlsProtocol {
    pub(crate) fn ssl_version(&self) -> SslVersion {
        match self {
            TlsProtocol::Tls12 => SslVersion::TLS1_2,
            TlsProtocol::Tls13 => SslVersion::TLS1_3,
        }
    }
}

impl FromStr for TlsProtocol {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tls12" | "tls1.2" | "tls1_2" => Ok(TlsProtocol::Tls12),
            "tls13" | "tls1.3" | "tls1_3" => Ok(TlsProtocol::Tls13),
            _ => Err(anyhow!("unknown tls protocol {s}")),
        }
    }
}
