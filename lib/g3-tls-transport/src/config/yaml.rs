/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::fs::File;
use std::io::Read;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, anyhow};
use humanize_rs::ParseError;
use openssl::pkey::{PKey, Private};
use openssl::x509::X509;
use yaml_rust::{Yaml, yaml};

use super::{TlsCertificatePair, TlsClientConfigBuilder, TlsProtocol, TlsServerConfigBuilder};
use crate::{TcpTransportConfig, WorkerRuntimeConfig};

fn foreach_kv<F>(table: &yaml::Hash, mut f: F) -> anyhow::Result<()>
where
    F: FnMut(&str, &Yaml) -> anyhow::Result<()>,
{
    for (k, v) in table.iter() {
        if let Yaml::String(key) = k {
            f(key, v).context(format!("failed to parse value of key {key}"))?;
        } else {
            return Err(anyhow!("key in hash should be string"));
        }
    }
    Ok(())
}

fn normalize_key(raw: &str) -> String {
    raw.to_lowercase().replace('-', "_")
}

fn as_bool(v: &Yaml) -> anyhow::Result<bool> {
    match v {
        Yaml::String(s) => match s.to_lowercase().as_str() {
            "on" | "true" | "yes" | "1" => Ok(true),
            "off" | "false" | "no" | "0" => Ok(false),
            _ => Err(anyhow!("invalid yaml string value for 'bool': {s}")),
        },
        Yaml::Boolean(value) => Ok(*value),
        Yaml::Integer(i) => Ok(*i != 0),
        _ => Err(anyhow!(
            "yaml value type for 'bool' should be 'boolean' / 'string' / 'integer'"
        )),
    }
}

fn as_u32(v: &Yaml) -> anyhow::Result<u32> {
    match v {
        Yaml::String(s) => Ok(u32::from_str(s)?),
        Yaml::Integer(i) => Ok(u32::try_from(*i)?),
        _ => Err(anyhow!(
            "yaml value type for 'u32' should be 'string' or 'integer'"
        )),
    }
}

fn as_usize(v: &Yaml) -> anyhow::Result<usize> {
    match v {
        Yaml::String(s) => Ok(usize::from_str(s)?),
        Yaml::Integer(i) => Ok(usize::try_from(*i)?),
        _ => Err(anyhow!(
            "yaml value type for 'usize' should be 'string' or 'integer'"
        )),
    }
}

fn as_nonzero_usize(v: &Yaml) -> anyhow::Result<NonZeroUsize> {
    match v {
        Yaml::String(s) => Ok(NonZeroUsize::from_str(s)?),
        Yaml::Integer(i) => {
            let u = usize::try_from(*i)?;
            Ok(NonZeroUsize::try_from(u)?)
        }
        _ => Err(anyhow!(
            "yaml value type for 'nonzero usize' should be 'string' or 'integer'"
        )),
    }
}

fn as_string(v: &Yaml) -> anyhow::Result<String> {
    match v {
        Yaml::String(s) => Ok(s.to_string()),
        Yaml::Integer(i) => Ok(i.to_string()),
        Yaml::Real(s) => Ok(s.to_string()),
        _ => Err(anyhow!(
            "yaml value type for string should be 'string' / 'integer' / 'real'"
        )),
    }
}

fn as_string_list(v: &Yaml) -> anyhow::Result<Vec<String>> {
    match v {
        Yaml::Array(seq) => {
            let mut list = Vec::with_capacity(seq.len());
            for (i, v) in seq.iter().enumerate() {
                let s = as_string(v).context(format!("invalid value for list element #{i}"))?;
                list.push(s);
            }
            Ok(list)
        }
        _ => {
            let s = as_string(v).context("invalid single value for the list")?;
            Ok(vec![s])
        }
    }
}

/// Plain numbers are taken as seconds.
pub fn as_duration(v: &Yaml) -> anyhow::Result<Duration> {
    match v {
        Yaml::String(value) => match humanize_rs::duration::parse(value) {
            Ok(v) => Ok(v),
            Err(ParseError::MissingUnit) => {
                if let Ok(u) = u64::from_str(value) {
                    Ok(Duration::from_secs(u))
                } else if let Ok(f) = f64::from_str(value) {
                    Duration::try_from_secs_f64(f).map_err(anyhow::Error::new)
                } else {
                    Err(anyhow!("invalid duration string"))
                }
            }
            Err(e) => Err(anyhow!("invalid humanize duration string: {e}")),
        },
        Yaml::Integer(value) => {
            if let Ok(u) = u64::try_from(*value) {
                Ok(Duration::from_secs(u))
            } else {
                Err(anyhow!("unsupported duration string"))
            }
        }
        Yaml::Real(s) => {
            let f = f64::from_str(s).map_err(|e| anyhow!("invalid f64 value: {e}"))?;
            Duration::try_from_secs_f64(f).map_err(anyhow::Error::new)
        }
        _ => Err(anyhow!(
            "yaml value type for humanize duration should be 'string' or 'integer' or 'real'"
        )),
    }
}

fn as_file(v: &Yaml, lookup_dir: Option<&Path>) -> anyhow::Result<(File, PathBuf)> {
    let Yaml::String(path) = v else {
        return Err(anyhow!("yaml value type for file path should be string"));
    };
    let path = PathBuf::from_str(path).map_err(|e| anyhow!("invalid path: {e:?}"))?;
    let path = if path.is_absolute() {
        path
    } else if let Some(dir) = lookup_dir {
        dir.join(path)
    } else {
        return Err(anyhow!(
            "invalid value: {} is not an absolute path",
            path.display()
        ));
    };
    let file =
        File::open(&path).map_err(|e| anyhow!("failed to open file({}): {e:?}", path.display()))?;
    Ok((file, path))
}

fn read_file(
    value: &Yaml,
    lookup_dir: Option<&Path>,
    max_size: usize,
) -> anyhow::Result<(String, PathBuf)> {
    let (file, path) = as_file(value, lookup_dir).context("invalid file")?;
    let mut contents = String::with_capacity(max_size.min(64 * 1024));
    file.take(max_size as u64)
        .read_to_string(&mut contents)
        .map_err(|e| anyhow!("failed to read contents of file {}: {e}", path.display()))?;
    Ok((contents, path))
}

fn as_certificates_from_single_element(
    value: &Yaml,
    lookup_dir: Option<&Path>,
) -> anyhow::Result<Vec<X509>> {
    const MAX_FILE_SIZE: usize = 4_000_000; // 4MB

    if let Yaml::String(s) = value {
        if s.trim_start().starts_with("--") {
            let certs = X509::stack_from_pem(s.as_bytes())
                .map_err(|e| anyhow!("invalid certificate string: {e}"))?;
            return if certs.is_empty() {
                Err(anyhow!("no valid certificate found"))
            } else {
                Ok(certs)
            };
        }
    }

    let (contents, path) = read_file(value, lookup_dir, MAX_FILE_SIZE)?;
    let certs = X509::stack_from_pem(contents.as_bytes())
        .map_err(|e| anyhow!("invalid certificate file({}): {e}", path.display()))?;
    if certs.is_empty() {
        Err(anyhow!(
            "no valid certificate found in file {}",
            path.display()
        ))
    } else {
        Ok(certs)
    }
}

/// PEM certificates, inline or from files relative to `lookup_dir`.
pub fn as_certificates(value: &Yaml, lookup_dir: Option<&Path>) -> anyhow::Result<Vec<X509>> {
    if let Yaml::Array(seq) = value {
        let mut certs = Vec::new();
        for (i, v) in seq.iter().enumerate() {
            let this_certs = as_certificates_from_single_element(v, lookup_dir)
                .context(format!("invalid certificates value for element #{i}"))?;
            certs.extend(this_certs);
        }
        Ok(certs)
    } else {
        as_certificates_from_single_element(value, lookup_dir)
    }
}

pub fn as_private_key(value: &Yaml, lookup_dir: Option<&Path>) -> anyhow::Result<PKey<Private>> {
    const MAX_FILE_SIZE: usize = 256_000; // 256KB

    if let Yaml::String(s) = value {
        if s.trim_start().starts_with("--") {
            return PKey::private_key_from_pem(s.as_bytes())
                .map_err(|e| anyhow!("invalid private key string: {e}"));
        }
    }

    let (contents, path) = read_file(value, lookup_dir, MAX_FILE_SIZE)?;
    PKey::private_key_from_pem(contents.as_bytes())
        .map_err(|e| anyhow!("invalid private key file({}): {e}", path.display()))
}

pub fn as_certificate_pair(
    value: &Yaml,
    lookup_dir: Option<&Path>,
) -> anyhow::Result<TlsCertificatePair> {
    if let Yaml::Hash(map) = value {
        let mut pair = TlsCertificatePair::default();

        foreach_kv(map, |k, v| match normalize_key(k).as_str() {
            "certificate" | "cert" => {
                let cert = as_certificates(v, lookup_dir)
                    .context(format!("invalid certificates value for key {k}"))?;
                pair.set_certificates(cert)
                    .context("failed to set certificate")?;
                Ok(())
            }
            "private_key" | "key" => {
                let key = as_private_key(v, lookup_dir)
                    .context(format!("invalid private key value for key {k}"))?;
                pair.set_private_key(key)
                    .context("failed to set private key")?;
                Ok(())
            }
            _ => Err(anyhow!("invalid key {k}")),
        })?;

        pair.check()?;
        Ok(pair)
    } else {
        Err(anyhow!(
            "yaml value type for tls certificate pair should be 'map'"
        ))
    }
}

fn as_protocol(value: &Yaml) -> anyhow::Result<TlsProtocol> {
    if let Yaml::String(s) = value {
        TlsProtocol::from_str(s)
    } else {
        Err(anyhow!(
            "yaml value type for tls protocol should be 'string'"
        ))
    }
}

fn as_ciphers(value: &Yaml) -> anyhow::Result<Vec<String>> {
    let mut ciphers = Vec::new();
    match value {
        Yaml::String(s) => {
            for cipher in s.split(':') {
                ciphers.push(cipher.to_string());
            }
            Ok(ciphers)
        }
        Yaml::Array(seq) => {
            for (i, v) in seq.iter().enumerate() {
                if let Yaml::String(s) = v {
                    ciphers.push(s.to_string());
                } else {
                    return Err(anyhow!("invalid cipher string for #{i}"));
                }
            }
            Ok(ciphers)
        }
        _ => Err(anyhow!(
            "yaml value type for tls ciphers should be 'string' or an 'array' of string"
        )),
    }
}

fn set_tls_client_config_builder(
    mut builder: TlsClientConfigBuilder,
    value: &Yaml,
    lookup_dir: Option<&Path>,
) -> anyhow::Result<TlsClientConfigBuilder> {
    if let Yaml::Hash(map) = value {
        let mut cert_pair = TlsCertificatePair::default();

        foreach_kv(map, |k, v| match normalize_key(k).as_str() {
            "protocol" => {
                let protocol =
                    as_protocol(v).context(format!("invalid tls protocol value for key {k}"))?;
                builder.set_protocol(protocol);
                Ok(())
            }
            "min_tls_version" | "tls_version_min" => {
                let protocol =
                    as_protocol(v).context(format!("invalid tls version value for key {k}"))?;
                builder.set_min_protocol(protocol);
                Ok(())
            }
            "max_tls_version" | "tls_version_max" => {
                let protocol =
                    as_protocol(v).context(format!("invalid tls version value for key {k}"))?;
                builder.set_max_protocol(protocol);
                Ok(())
            }
            "ciphers" => {
                let ciphers =
                    as_ciphers(v).context(format!("invalid tls ciphers value for key {k}"))?;
                builder.set_ciphers(ciphers);
                Ok(())
            }
            "disable_sni" => {
                let disable = as_bool(v).context(format!("invalid bool value for key {k}"))?;
                if disable {
                    builder.set_disable_sni();
                }
                Ok(())
            }
            "tls_name" | "verify_name" => {
                let name = as_string(v).context(format!("invalid string value for key {k}"))?;
                builder.set_verify_name(name);
                Ok(())
            }
            "certificate" | "cert" => {
                let cert = as_certificates(v, lookup_dir)
                    .context(format!("invalid certificates value for key {k}"))?;
                cert_pair
                    .set_certificates(cert)
                    .context("failed to set certificate")?;
                Ok(())
            }
            "private_key" | "key" => {
                let key = as_private_key(v, lookup_dir)
                    .context(format!("invalid private key value for key {k}"))?;
                cert_pair
                    .set_private_key(key)
                    .context("failed to set private key")?;
                Ok(())
            }
            "cert_pair" => {
                let pair = as_certificate_pair(v, lookup_dir)
                    .context(format!("invalid cert pair value for key {k}"))?;
                builder.set_cert_pair(pair);
                Ok(())
            }
            "ca_certificate" | "ca_cert" | "server_auth_certificate" | "server_auth_cert" => {
                let certs = as_certificates(v, lookup_dir)
                    .context(format!("invalid certificates value for key {k}"))?;
                builder
                    .set_ca_certificates(certs)
                    .context("failed to set ca certificate")?;
                Ok(())
            }
            "no_default_ca_certificate" | "no_default_ca_cert" => {
                let no_default = as_bool(v).context(format!("invalid bool value for key {k}"))?;
                if no_default {
                    builder.set_no_default_ca_certificates();
                }
                Ok(())
            }
            "alpn_protocol" | "alpn_protocols" | "alpn" => {
                let protocols =
                    as_string_list(v).context(format!("invalid alpn list value for key {k}"))?;
                builder.set_alpn_protocols(protocols);
                Ok(())
            }
            "no_session_cache" | "disable_session_cache" | "session_cache_disabled" => {
                let no = as_bool(v).context(format!("invalid bool value for key {k}"))?;
                if no {
                    builder.set_session_cache_capacity(0);
                }
                Ok(())
            }
            "session_cache_capacity" | "session_cache_size" => {
                let cap = as_usize(v).context(format!("invalid usize value for key {k}"))?;
                builder.set_session_cache_capacity(cap);
                Ok(())
            }
            "insecure" => {
                let enable = as_bool(v)?;
                builder.set_insecure(enable);
                Ok(())
            }
            _ => Err(anyhow!("invalid key {k}")),
        })?;

        if cert_pair.is_set() && builder.set_cert_pair(cert_pair).is_some() {
            return Err(anyhow!("found duplicate client certificate config"));
        }

        builder.check()?;
        Ok(builder)
    } else {
        Err(anyhow!(
            "yaml value type for 'tls client config builder' should be 'map'"
        ))
    }
}

pub fn as_tls_client_config_builder(
    value: &Yaml,
    lookup_dir: Option<&Path>,
) -> anyhow::Result<TlsClientConfigBuilder> {
    set_tls_client_config_builder(TlsClientConfigBuilder::default(), value, lookup_dir)
}

/// Same as [`as_tls_client_config_builder`] but defaults to the `dot` ALPN id.
pub fn as_dns_over_tls_client_config_builder(
    value: &Yaml,
    lookup_dir: Option<&Path>,
) -> anyhow::Result<TlsClientConfigBuilder> {
    set_tls_client_config_builder(
        TlsClientConfigBuilder::for_dns_over_tls(),
        value,
        lookup_dir,
    )
}

pub fn as_tls_server_config_builder(
    value: &Yaml,
    lookup_dir: Option<&Path>,
) -> anyhow::Result<TlsServerConfigBuilder> {
    if let Yaml::Hash(map) = value {
        let mut builder = TlsServerConfigBuilder::empty();
        let mut cert_pair = TlsCertificatePair::default();

        foreach_kv(map, |k, v| match normalize_key(k).as_str() {
            "cert_pairs" => {
                if let Yaml::Array(seq) = v {
                    for (i, v) in seq.iter().enumerate() {
                        let pair = as_certificate_pair(v, lookup_dir)
                            .context(format!("invalid cert pair value for {k}#{i}"))?;
                        builder.push_cert_pair(pair)?;
                    }
                } else {
                    let pair = as_certificate_pair(v, lookup_dir)
                        .context(format!("invalid cert pair value for key {k}"))?;
                    builder.push_cert_pair(pair)?;
                }
                Ok(())
            }
            "certificate" | "cert" => {
                let cert = as_certificates(v, lookup_dir)
                    .context(format!("invalid certificates value for key {k}"))?;
                cert_pair
                    .set_certificates(cert)
                    .context("failed to set certificate")?;
                Ok(())
            }
            "private_key" | "key" => {
                let key = as_private_key(v, lookup_dir)
                    .context(format!("invalid private key value for key {k}"))?;
                cert_pair
                    .set_private_key(key)
                    .context("failed to set private key")?;
                Ok(())
            }
            "enable_client_auth" => {
                let enable = as_bool(v).context(format!("invalid bool value for key {k}"))?;
                if enable {
                    builder.enable_client_auth();
                }
                Ok(())
            }
            "ca_certificate" | "ca_cert" | "client_auth_certificate" | "client_auth_cert" => {
                let certs = as_certificates(v, lookup_dir)
                    .context(format!("invalid certificates value for key {k}"))?;
                builder
                    .set_client_auth_certificates(certs)
                    .context("failed to set client auth certificates")?;
                Ok(())
            }
            "min_tls_version" | "tls_version_min" => {
                let protocol =
                    as_protocol(v).context(format!("invalid tls version value for key {k}"))?;
                builder.set_min_protocol(protocol);
                Ok(())
            }
            "max_tls_version" | "tls_version_max" => {
                let protocol =
                    as_protocol(v).context(format!("invalid tls version value for key {k}"))?;
                builder.set_max_protocol(protocol);
                Ok(())
            }
            "alpn_protocol" | "alpn_protocols" | "alpn" => {
                let protocols =
                    as_string_list(v).context(format!("invalid alpn list value for key {k}"))?;
                builder.set_alpn_protocols(protocols);
                Ok(())
            }
            "session_id_context" => {
                let context = as_string(v).context(format!("invalid string value for key {k}"))?;
                builder.set_session_id_context(context);
                Ok(())
            }
            _ => Err(anyhow!("invalid key {k}")),
        })?;

        if cert_pair.is_set() {
            builder.push_cert_pair(cert_pair)?;
        }

        builder.check()?;
        Ok(builder)
    } else {
        Err(anyhow!(
            "yaml value type for 'tls server config builder' should be 'map'"
        ))
    }
}

pub fn as_tcp_transport_config(value: &Yaml) -> anyhow::Result<TcpTransportConfig> {
    if let Yaml::Hash(map) = value {
        let mut config = TcpTransportConfig::default();

        foreach_kv(map, |k, v| match normalize_key(k).as_str() {
            "connect_timeout" => {
                let timeout = as_duration(v)
                    .context(format!("invalid humanize duration value for key {k}"))?;
                config.set_connect_timeout(timeout);
                Ok(())
            }
            "read_timeout" | "idle_timeout" => {
                let timeout = as_duration(v)
                    .context(format!("invalid humanize duration value for key {k}"))?;
                config.set_read_timeout(timeout);
                Ok(())
            }
            "backlog" | "listen_backlog" => {
                let backlog = as_u32(v).context(format!("invalid u32 value for key {k}"))?;
                config.set_backlog(backlog);
                Ok(())
            }
            "read_buffer_size" => {
                let size = as_usize(v).context(format!("invalid usize value for key {k}"))?;
                config.set_read_buffer_size(size);
                Ok(())
            }
            _ => Err(anyhow!("invalid key {k}")),
        })?;

        Ok(config)
    } else {
        Err(anyhow!(
            "yaml value type for 'tcp transport config' should be 'map'"
        ))
    }
}

pub fn as_worker_runtime_config(value: &Yaml) -> anyhow::Result<WorkerRuntimeConfig> {
    if let Yaml::Hash(map) = value {
        let mut config = WorkerRuntimeConfig::default();

        foreach_kv(map, |k, v| match normalize_key(k).as_str() {
            "thread_number" | "threads" | "worker_number" => {
                let value = as_nonzero_usize(v)?;
                config.set_thread_number(value);
                Ok(())
            }
            "thread_stack_size" => {
                let value = as_usize(v).context(format!("invalid usize value for key {k}"))?;
                config.set_thread_stack_size(value);
                Ok(())
            }
            "max_io_events_per_tick" => {
                let capacity = as_usize(v)?;
                config.set_max_io_events_per_tick(capacity);
                Ok(())
            }
            _ => Err(anyhow!("invalid key {k}")),
        })?;

        config.check().context("invalid worker config")?;
        Ok(config)
    } else {
        Err(anyhow!(
            "yaml value type for 'worker runtime config' should be 'map'"
        ))
    }
}
