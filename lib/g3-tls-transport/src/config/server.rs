/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::sync::Arc;

use anyhow::{Context, anyhow};
use openssl::ssl::{AlpnError, SslAcceptor, SslMethod, SslSessionCacheMode, SslVerifyMode};
use openssl::stack::Stack;
use openssl::x509::X509;
use openssl::x509::store::X509StoreBuilder;

use super::{TlsCertificatePair, TlsProtocol};
use crate::{ListenerContextTable, OpensslContext};

const MAX_SESSION_ID_CONTEXT_LEN: usize = 32;

#[derive(Clone)]
pub struct TlsServerConfig {
    context: Arc<OpensslContext>,
}

impl TlsServerConfig {
    #[inline]
    pub fn context(&self) -> &Arc<OpensslContext> {
        &self.context
    }

    /// Share this context with every worker of a new listener.
    pub fn context_table(&self, worker_count: usize) -> Arc<ListenerContextTable<OpensslContext>> {
        Arc::new(ListenerContextTable::new(
            Arc::clone(&self.context),
            worker_count,
        ))
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TlsServerConfigBuilder {
    cert_pairs: Vec<TlsCertificatePair>,
    min_protocol: Option<TlsProtocol>,
    max_protocol: Option<TlsProtocol>,
    client_auth: bool,
    client_auth_certs: Vec<Vec<u8>>,
    alpn_protocols: Vec<String>,
    session_id_context: String,
}

impl TlsServerConfigBuilder {
    pub fn empty() -> Self {
        TlsServerConfigBuilder {
            cert_pairs: Vec::with_capacity(1),
            min_protocol: None,
            max_protocol: None,
            client_auth: false,
            client_auth_certs: Vec::new(),
            alpn_protocols: Vec::new(),
            session_id_context: String::new(),
        }
    }

    pub fn check(&self) -> anyhow::Result<()> {
        if self.cert_pairs.is_empty() {
            return Err(anyhow!("no cert pair is set"));
        }

        if let (Some(min), Some(max)) = (self.min_protocol, self.max_protocol) {
            if min > max {
                return Err(anyhow!("min protocol version is above the max one"));
            }
        }

        if self.session_id_context.len() > MAX_SESSION_ID_CONTEXT_LEN {
            return Err(anyhow!(
                "session id context should be no longer than {MAX_SESSION_ID_CONTEXT_LEN} bytes"
            ));
        }

        Ok(())
    }

    pub fn enable_client_auth(&mut self) {
        self.client_auth = true;
    }

    pub fn set_client_auth_certificates(&mut self, certs: Vec<X509>) -> anyhow::Result<()> {
        for (i, cert) in certs.into_iter().enumerate() {
            let bytes = cert
                .to_der()
                .map_err(|e| anyhow!("failed to encode client chain certificate #{i}: {e}"))?;
            self.client_auth_certs.push(bytes);
        }
        Ok(())
    }

    pub fn set_min_protocol(&mut self, protocol: TlsProtocol) {
        self.min_protocol = Some(protocol);
    }

    pub fn set_max_protocol(&mut self, protocol: TlsProtocol) {
        self.max_protocol = Some(protocol);
    }

    pub fn set_alpn_protocols(&mut self, protocols: Vec<String>) {
        self.alpn_protocols = protocols;
    }

    pub fn set_session_id_context(&mut self, context: String) {
        self.session_id_context = context;
    }

    pub fn push_cert_pair(&mut self, cert_pair: TlsCertificatePair) -> anyhow::Result<()> {
        cert_pair.check()?;
        self.cert_pairs.push(cert_pair);
        Ok(())
    }

    pub fn build(&self) -> anyhow::Result<TlsServerConfig> {
        let mut ssl_builder = SslAcceptor::mozilla_intermediate_v5(SslMethod::tls_server())
            .map_err(|e| anyhow!("failed to build ssl context: {e}"))?;

        for (i, pair) in self.cert_pairs.iter().enumerate() {
            pair.add_to_ssl_context(&mut ssl_builder)
                .context(format!("failed to add cert pair #{i} to ssl context"))?;
        }

        if let Some(min) = self.min_protocol {
            ssl_builder
                .set_min_proto_version(Some(min.ssl_version()))
                .map_err(|e| anyhow!("failed to set min protocol version: {e}"))?;
        }
        if let Some(max) = self.max_protocol {
            ssl_builder
                .set_max_proto_version(Some(max.ssl_version()))
                .map_err(|e| anyhow!("failed to set max protocol version: {e}"))?;
        }

        ssl_builder.set_session_cache_mode(SslSessionCacheMode::SERVER);
        if !self.session_id_context.is_empty() {
            ssl_builder
                .set_session_id_context(self.session_id_context.as_bytes())
                .map_err(|e| anyhow!("failed to set session id context: {e}"))?;
        }

        if self.client_auth {
            ssl_builder.set_verify(SslVerifyMode::PEER | SslVerifyMode::FAIL_IF_NO_PEER_CERT);

            let mut store_builder = X509StoreBuilder::new()
                .map_err(|e| anyhow!("failed to create ca cert store builder: {e}"))?;
            let mut subject_stack =
                Stack::new().map_err(|e| anyhow!("failed to get new ca name stack: {e}"))?;

            if self.client_auth_certs.is_empty() {
                store_builder
                    .set_default_paths()
                    .map_err(|e| anyhow!("failed to load default ca certs: {e}"))?;
            } else {
                for (i, cert) in self.client_auth_certs.iter().enumerate() {
                    let ca_cert = X509::from_der(cert.as_slice())
                        .map_err(|e| anyhow!("[#{i}] failed to decode ca certificate: {e}"))?;
                    let subject = ca_cert
                        .subject_name()
                        .to_owned()
                        .map_err(|e| anyhow!("[#{i}] failed to get ca subject name: {e}"))?;
                    store_builder
                        .add_cert(ca_cert)
                        .map_err(|e| anyhow!("[#{i}] failed to add ca certificate: {e}"))?;
                    subject_stack
                        .push(subject)
                        .map_err(|e| anyhow!("[#{i}] failed to push to ca name stack: {e}"))?;
                }
            }
            ssl_builder
                .set_verify_cert_store(store_builder.build())
                .map_err(|e| anyhow!("failed to set ca certs: {e}"))?;
            if !subject_stack.is_empty() {
                ssl_builder.set_client_ca_list(subject_stack);
            }
        } else {
            ssl_builder.set_verify(SslVerifyMode::NONE);
        }

        if !self.alpn_protocols.is_empty() {
            let ours = super::alpn_wire_sequence(&self.alpn_protocols)?;
            ssl_builder.set_alpn_select_callback(move |_ssl, offered| {
                super::select_alpn(&ours, offered).ok_or(AlpnError::NOACK)
            });
        }

        let ssl_acceptor = ssl_builder.build();
        Ok(TlsServerConfig {
            context: Arc::new(OpensslContext::new(ssl_acceptor.into_context())),
        })
    }
}
