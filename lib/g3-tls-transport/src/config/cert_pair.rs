/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use anyhow::anyhow;
use openssl::pkey::{PKey, Private};
use openssl::ssl::SslContextBuilder;
use openssl::x509::X509;

/// A leaf certificate, its chain and the matching private key, kept in DER.
#[derive(Default, Clone, Debug, Eq, PartialEq)]
pub struct TlsCertificatePair {
    leaf_cert: Vec<u8>,
    chain_certs: Vec<Vec<u8>>,
    key: Vec<u8>,
}

impl TlsCertificatePair {
    pub fn check(&self) -> anyhow::Result<()> {
        if self.leaf_cert.is_empty() {
            return Err(anyhow!("no certificate set"));
        }
        if self.key.is_empty() {
            return Err(anyhow!("no private key set"));
        }
        Ok(())
    }

    pub fn is_set(&self) -> bool {
        !self.leaf_cert.is_empty() || !self.key.is_empty()
    }

    pub fn set_certificates(&mut self, certs: Vec<X509>) -> anyhow::Result<()> {
        let mut certs_iter = certs.into_iter();
        let leaf_cert = certs_iter
            .next()
            .ok_or_else(|| anyhow!("no certificate found"))?;
        self.leaf_cert = leaf_cert
            .to_der()
            .map_err(|e| anyhow!("failed to encode certificate: {e}"))?;

        self.chain_certs.clear();
        for (i, cert) in certs_iter.enumerate() {
            let bytes = cert
                .to_der()
                .map_err(|e| anyhow!("failed to encode chain certificate #{i}: {e}"))?;
            self.chain_certs.push(bytes);
        }
        Ok(())
    }

    pub fn set_private_key(&mut self, key: PKey<Private>) -> anyhow::Result<()> {
        self.key = key
            .private_key_to_der()
            .map_err(|e| anyhow!("failed to encode private key: {e}"))?;
        Ok(())
    }

    pub(crate) fn add_to_ssl_context(
        &self,
        ssl_builder: &mut SslContextBuilder,
    ) -> anyhow::Result<()> {
        let leaf_cert = X509::from_der(&self.leaf_cert)
            .map_err(|e| anyhow!("failed to decode certificate: {e}"))?;
        ssl_builder
            .set_certificate(&leaf_cert)
            .map_err(|e| anyhow!("failed to set certificate: {e}"))?;
        for (i, cert) in self.chain_certs.iter().enumerate() {
            let chain_cert = X509::from_der(cert)
                .map_err(|e| anyhow!("failed to decode chain certificate #{i}: {e}"))?;
            ssl_builder
                .add_extra_chain_cert(chain_cert)
                .map_err(|e| anyhow!("failed to add chain certificate #{i}: {e}"))?;
        }

        let key = PKey::private_key_from_der(&self.key)
            .map_err(|e| anyhow!("failed to decode private key: {e}"))?;
        ssl_builder
            .set_private_key(&key)
            .map_err(|e| anyhow!("failed to set private key: {e}"))?;
        ssl_builder
            .check_private_key()
            .map_err(|e| anyhow!("private key does not match the certificate: {e}"))?;
        Ok(())
    }
}
