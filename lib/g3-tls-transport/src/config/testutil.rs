/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::net::IpAddr;
use std::str::FromStr;

use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::ec::{EcGroup, EcKey};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::x509::extension::{
    BasicConstraints, ExtendedKeyUsage, KeyUsage, SubjectAlternativeName,
};
use openssl::x509::{X509, X509Builder, X509Name, X509NameBuilder};

use super::{TlsCertificatePair, TlsClientConfigBuilder, TlsServerConfigBuilder};
use crate::OpensslContext;

fn new_key() -> PKey<Private> {
    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).unwrap();
    let key = EcKey::generate(&group).unwrap();
    PKey::from_ec_key(key).unwrap()
}

fn new_name(cn: &str) -> X509Name {
    let mut builder = X509NameBuilder::new().unwrap();
    builder.append_entry_by_nid(Nid::COMMONNAME, cn).unwrap();
    builder.build()
}

fn new_builder(subject: &X509Name, key: &PKey<Private>) -> X509Builder {
    let mut builder = X509Builder::new().unwrap();
    builder.set_version(2).unwrap();
    let mut serial = BigNum::new().unwrap();
    serial.rand(64, MsbOption::MAYBE_ZERO, false).unwrap();
    builder
        .set_serial_number(&serial.to_asn1_integer().unwrap())
        .unwrap();
    builder.set_subject_name(subject).unwrap();
    builder.set_pubkey(key).unwrap();
    builder
        .set_not_before(&Asn1Time::days_from_now(0).unwrap())
        .unwrap();
    builder
        .set_not_after(&Asn1Time::days_from_now(1).unwrap())
        .unwrap();
    builder
}

/// A throwaway CA and a leaf certificate for `name` signed by it.
pub(crate) fn generate(name: &str) -> (X509, PKey<Private>, X509) {
    let ca_key = new_key();
    let ca_name = new_name("g3 tls transport test ca");
    let mut builder = new_builder(&ca_name, &ca_key);
    builder.set_issuer_name(&ca_name).unwrap();
    builder
        .append_extension(BasicConstraints::new().critical().ca().build().unwrap())
        .unwrap();
    builder
        .append_extension(
            KeyUsage::new()
                .critical()
                .key_cert_sign()
                .crl_sign()
                .build()
                .unwrap(),
        )
        .unwrap();
    builder.sign(&ca_key, MessageDigest::sha256()).unwrap();
    let ca_cert = builder.build();

    let key = new_key();
    let mut builder = new_builder(&new_name(name), &key);
    builder.set_issuer_name(ca_cert.subject_name()).unwrap();
    let mut san = SubjectAlternativeName::new();
    if IpAddr::from_str(name).is_ok() {
        san.ip(name);
    } else {
        san.dns(name);
    }
    san.ip("127.0.0.1");
    let san = san
        .build(&builder.x509v3_context(Some(&ca_cert), None))
        .unwrap();
    builder.append_extension(san).unwrap();
    builder
        .append_extension(
            ExtendedKeyUsage::new()
                .server_auth()
                .client_auth()
                .build()
                .unwrap(),
        )
        .unwrap();
    builder.sign(&ca_key, MessageDigest::sha256()).unwrap();
    (builder.build(), key, ca_cert)
}

pub(crate) fn cert_pair(name: &str) -> (TlsCertificatePair, X509) {
    let (cert, key, ca) = generate(name);
    let mut pair = TlsCertificatePair::default();
    pair.set_certificates(vec![cert]).unwrap();
    pair.set_private_key(key).unwrap();
    (pair, ca)
}

pub(crate) fn server_context(name: &str) -> (OpensslContext, X509) {
    let (pair, ca) = cert_pair(name);
    let mut builder = TlsServerConfigBuilder::empty();
    builder.push_cert_pair(pair).unwrap();
    let config = builder.build().unwrap();
    (OpensslContext::clone(config.context()), ca)
}

pub(crate) fn client_context(ca: &X509) -> OpensslContext {
    let mut builder = TlsClientConfigBuilder::default();
    builder.set_no_default_ca_certificates();
    builder.set_ca_certificates(vec![ca.clone()]).unwrap();
    builder.set_session_cache_capacity(0);
    let config = builder.build().unwrap();
    OpensslContext::clone(config.context())
}
