//! Builds the rustls server configuration for ldaps:// listeners from the
//! `tls` section of the config.

use anyhow::{Context, Result};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::RootCertStore;
use rustls_pemfile::{certs, pkcs8_private_keys, rsa_private_keys};
use std::fs;
use std::io::Cursor;
use std::sync::Arc;

use crate::config::TlsConfig;

/// Load the server identity (and, when `require_client_cert` is set, the
/// client-certificate verifier rooted at `ca_file`). Errors name the config
/// field whose material is unusable, so startup failures point at the YAML.
pub fn load_server_config(tls: &TlsConfig) -> Result<Arc<rustls::ServerConfig>> {
    if tls.require_client_cert && tls.ca_file.is_none() {
        anyhow::bail!("tls.require_client_cert is set but tls.ca_file is not");
    }
    let chain = cert_chain(&tls.cert_file, "tls.cert_file")?;
    let key = private_key(&tls.key_file, "tls.key_file")?;

    let builder = match (&tls.ca_file, tls.require_client_cert) {
        (Some(ca_file), true) => {
            let mut roots = RootCertStore::empty();
            for cert in cert_chain(ca_file, "tls.ca_file")? {
                roots
                    .add(cert)
                    .with_context(|| format!("tls.ca_file {}: rejected CA certificate", ca_file))?;
            }
            let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
                .build()
                .context("Build client certificate verifier")?;
            rustls::ServerConfig::builder().with_client_cert_verifier(verifier)
        }
        _ => rustls::ServerConfig::builder().with_no_client_auth(),
    };

    let config = builder
        .with_single_cert(chain, key)
        .context("tls.cert_file and tls.key_file do not form a usable server identity")?;
    Ok(Arc::new(config))
}

fn read_pem(path: &str, field: &str) -> Result<Vec<u8>> {
    fs::read(path).with_context(|| format!("{} {}: unreadable", field, path))
}

fn cert_chain(path: &str, field: &str) -> Result<Vec<CertificateDer<'static>>> {
    let pem = read_pem(path, field)?;
    let chain: Vec<_> = certs(&mut Cursor::new(&pem))
        .collect::<Result<_, _>>()
        .with_context(|| format!("{} {}: not valid PEM", field, path))?;
    if chain.is_empty() {
        anyhow::bail!("{} {}: holds no CERTIFICATE block", field, path);
    }
    Ok(chain)
}

/// PKCS#8 is what current tooling emits; traditional RSA PEM is the
/// fallback for older material.
fn private_key(path: &str, field: &str) -> Result<PrivateKeyDer<'static>> {
    let pem = read_pem(path, field)?;
    if let Some(key) = pkcs8_private_keys(&mut Cursor::new(&pem)).next() {
        let key = key.with_context(|| format!("{} {}: unreadable PKCS#8 key", field, path))?;
        return Ok(key.into());
    }
    if let Some(key) = rsa_private_keys(&mut Cursor::new(&pem)).next() {
        let key = key.with_context(|| format!("{} {}: unreadable RSA key", field, path))?;
        return Ok(key.into());
    }
    anyhow::bail!("{} {}: holds no PRIVATE KEY block", field, path)
}
