/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::num::NonZeroUsize;
use std::sync::Arc;

use anyhow::anyhow;
use openssl::ssl::{SslConnector, SslMethod, SslSession, SslSessionCacheMode, SslVerifyMode};
use openssl::x509::X509;
use openssl::x509::store::X509StoreBuilder;

use super::{TlsCertificatePair, TlsProtocol};
use crate::{OpensslContext, TlsClientSessionCache};

const DEFAULT_SESSION_CACHE_CAPACITY: usize = 150;

pub type OpensslClientSessionCache = TlsClientSessionCache<OpensslContext, SslSession>;

#[derive(Clone)]
pub struct TlsClientConfig {
    context: Arc<OpensslContext>,
    session_cache: Option<Arc<OpensslClientSessionCache>>,
}

impl TlsClientConfig {
    #[inline]
    pub fn context(&self) -> &Arc<OpensslContext> {
        &self.context
    }

    /// The cache bound to [`TlsClientConfig::context`], if enabled.
    #[inline]
    pub fn session_cache(&self) -> Option<&Arc<OpensslClientSessionCache>> {
        self.session_cache.as_ref()
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TlsClientConfigBuilder {
    min_protocol: Option<TlsProtocol>,
    max_protocol: Option<TlsProtocol>,
    ciphers: Vec<String>,
    ca_certs: Vec<Vec<u8>>,
    no_default_ca_certs: bool,
    client_cert_pair: Option<TlsCertificatePair>,
    alpn_protocols: Vec<String>,
    verify_name: Option<String>,
    disable_sni: bool,
    insecure: bool,
    session_cache_capacity: usize,
}

impl Default for TlsClientConfigBuilder {
    fn default() -> Self {
        TlsClientConfigBuilder {
            min_protocol: None,
            max_protocol: None,
            ciphers: Vec::new(),
            ca_certs: Vec::new(),
            no_default_ca_certs: false,
            client_cert_pair: None,
            alpn_protocols: Vec::new(),
            verify_name: None,
            disable_sni: false,
            insecure: false,
            session_cache_capacity: DEFAULT_SESSION_CACHE_CAPACITY,
        }
    }
}

impl TlsClientConfigBuilder {
    /// Config for DNS over TLS, which always negotiates the `dot` protocol.
    pub fn for_dns_over_tls() -> Self {
        TlsClientConfigBuilder {
            alpn_protocols: vec![super::ALPN_DOT.to_string()],
            ..Default::default()
        }
    }

    pub fn check(&self) -> anyhow::Result<()> {
        if let Some(cert_pair) = &self.client_cert_pair {
            cert_pair.check()?;
        }

        if let (Some(min), Some(max)) = (self.min_protocol, self.max_protocol) {
            if min > max {
                return Err(anyhow!("min protocol version is above the max one"));
            }
        }

        if !self.ciphers.is_empty() && self.fixed_protocol().is_none() {
            return Err(anyhow!(
                "protocol should be set to a fixed version if you want to specify cipher list / ciphersuites"
            ));
        }

        Ok(())
    }

    fn fixed_protocol(&self) -> Option<TlsProtocol> {
        match (self.min_protocol, self.max_protocol) {
            (Some(min), Some(max)) if min == max => Some(min),
            _ => None,
        }
    }

    pub fn set_protocol(&mut self, protocol: TlsProtocol) {
        self.min_protocol = Some(protocol);
        self.max_protocol = Some(protocol);
    }

    pub fn set_min_protocol(&mut self, protocol: TlsProtocol) {
        self.min_protocol = Some(protocol);
    }

    pub fn set_max_protocol(&mut self, protocol: TlsProtocol) {
        self.max_protocol = Some(protocol);
    }

    pub fn set_ciphers(&mut self, ciphers: Vec<String>) {
        self.ciphers = ciphers;
    }

    pub fn set_ca_certificates(&mut self, certs: Vec<X509>) -> anyhow::Result<()> {
        let mut all_der = Vec::with_capacity(certs.len());
        for (i, cert) in certs.into_iter().enumerate() {
            let bytes = cert
                .to_der()
                .map_err(|e| anyhow!("failed to encode ca certificate #{i}: {e}"))?;
            all_der.push(bytes);
        }
        self.ca_certs = all_der;
        Ok(())
    }

    pub fn set_no_default_ca_certificates(&mut self) {
        self.no_default_ca_certs = true;
    }

    pub fn set_cert_pair(&mut self, pair: TlsCertificatePair) -> Option<TlsCertificatePair> {
        self.client_cert_pair.replace(pair)
    }

    pub fn set_alpn_protocols(&mut self, protocols: Vec<String>) {
        self.alpn_protocols = protocols;
    }

    /// Name to check the server certificate against, also sent as SNI.
    pub fn set_verify_name(&mut self, name: String) {
        self.verify_name = Some(name);
    }

    pub fn set_disable_sni(&mut self) {
        self.disable_sni = true;
    }

    pub fn set_insecure(&mut self, insecure: bool) {
        self.insecure = insecure;
    }

    /// Max number of sessions kept for resumption, 0 to disable the cache.
    pub fn set_session_cache_capacity(&mut self, capacity: usize) {
        self.session_cache_capacity = capacity;
    }

    pub fn build(&self) -> anyhow::Result<TlsClientConfig> {
        let mut ctx_builder = SslConnector::builder(SslMethod::tls_client())
            .map_err(|e| anyhow!("failed to create ssl context builder: {e}"))?;
        if self.insecure {
            ctx_builder.set_verify(SslVerifyMode::NONE);
        } else {
            ctx_builder.set_verify(SslVerifyMode::PEER);
        }

        ctx_builder
            .set_min_proto_version(self.min_protocol.map(|p| p.ssl_version()))
            .map_err(|e| anyhow!("failed to set min protocol version: {e}"))?;
        ctx_builder
            .set_max_proto_version(self.max_protocol.map(|p| p.ssl_version()))
            .map_err(|e| anyhow!("failed to set max protocol version: {e}"))?;
        if !self.ciphers.is_empty() {
            let ciphers = self.ciphers.join(":");
            match self.fixed_protocol() {
                Some(TlsProtocol::Tls12) => ctx_builder
                    .set_cipher_list(&ciphers)
                    .map_err(|e| anyhow!("failed to set cipher list: {e}"))?,
                Some(TlsProtocol::Tls13) => ctx_builder
                    .set_ciphersuites(&ciphers)
                    .map_err(|e| anyhow!("failed to set ciphersuites: {e}"))?,
                None => return Err(anyhow!("no fixed protocol version for the ciphers")),
            }
        }

        if let Some(cert_pair) = &self.client_cert_pair {
            cert_pair.add_to_ssl_context(&mut ctx_builder)?;
        }

        let mut store_builder = X509StoreBuilder::new()
            .map_err(|e| anyhow!("failed to create ca cert store builder: {e}"))?;
        if !self.no_default_ca_certs {
            store_builder
                .set_default_paths()
                .map_err(|e| anyhow!("failed to load default ca certs: {e}"))?;
        }
        for (i, cert) in self.ca_certs.iter().enumerate() {
            let ca_cert = X509::from_der(cert.as_slice())
                .map_err(|e| anyhow!("failed to decode ca certificate #{i}: {e}"))?;
            store_builder
                .add_cert(ca_cert)
                .map_err(|e| anyhow!("failed to add ca certificate #{i}: {e}"))?;
        }
        ctx_builder
            .set_verify_cert_store(store_builder.build())
            .map_err(|e| anyhow!("failed to set ca certs: {e}"))?;

        // sessions are kept in our own cache, keyed by the remote address
        ctx_builder.set_session_cache_mode(
            SslSessionCacheMode::CLIENT | SslSessionCacheMode::NO_INTERNAL_STORE,
        );
        crate::engine::set_new_session_callback(&mut ctx_builder)
            .map_err(|e| anyhow!("failed to set new session callback: {e}"))?;

        if !self.alpn_protocols.is_empty() {
            let buf = super::alpn_wire_sequence(&self.alpn_protocols)?;
            ctx_builder
                .set_alpn_protos(buf.as_slice())
                .map_err(|e| anyhow!("failed to set alpn protocols: {e}"))?;
        }

        let mut context = OpensslContext::new(ctx_builder.build().into_context());
        if let Some(name) = &self.verify_name {
            context = context.with_verify_name(name.clone(), self.disable_sni);
        }
        let context = Arc::new(context);

        let session_cache = NonZeroUsize::new(self.session_cache_capacity)
            .map(|cap| Arc::new(TlsClientSessionCache::new(Arc::clone(&context), cap)));

        Ok(TlsClientConfig {
            context,
            session_cache,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_ciphers() {
        let mut builder = TlsClientConfigBuilder::default();
        builder.set_ciphers(vec!["TLS_AES_128_GCM_SHA256".to_string()]);
        assert!(builder.check().is_err());
        builder.set_protocol(TlsProtocol::Tls13);
        assert!(builder.check().is_ok());
        assert!(builder.build().is_ok());
    }

    #[test]
    fn check_version_bounds() {
        let mut builder = TlsClientConfigBuilder::default();
        builder.set_min_protocol(TlsProtocol::Tls13);
        builder.set_max_protocol(TlsProtocol::Tls12);
        assert!(builder.check().is_err());
    }

    #[test]
    fn session_cache_bound_to_context() {
        let config = TlsClientConfigBuilder::default().build().unwrap();
        let cache = config.session_cache().unwrap();
        assert!(Arc::ptr_eq(cache.context(), config.context()));
        assert_eq!(cache.capacity(), DEFAULT_SESSION_CACHE_CAPACITY);

        let mut builder = TlsClientConfigBuilder::for_dns_over_tls();
        builder.set_session_cache_capacity(0);
        let config = builder.build().unwrap();
        assert!(config.session_cache().is_none());
    }
}
