//! # Tunnel TLS Setup
//!
//! The tunnel acceptor terminates TLS with a keypair persisted as
//! `server.crt`/`server.key` next to the binary. When the files are
//! absent a self-signed pair is generated and written out, so a fresh
//! deployment works without any certificate ceremony (clients either
//! skip verification or pin the fingerprint).

use std::fs;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;
use tracing::info;

pub const CERT_FILE: &str = "server.crt";
pub const KEY_FILE: &str = "server.key";

/// Builds the acceptor for the tunnel control port, generating the
/// keypair first if needed. Failure here is fatal: the server cannot run
/// without a TLS identity.
pub fn tunnel_acceptor() -> anyhow::Result<TlsAcceptor> {
    ensure_self_signed_cert(Path::new(CERT_FILE), Path::new(KEY_FILE))?;

    let certs = load_certs(Path::new(CERT_FILE))?;
    let key = load_key(Path::new(KEY_FILE))?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("invalid tunnel certificate/key pair")?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Writes a fresh self-signed certificate unless both files already
/// exist.
fn ensure_self_signed_cert(cert_path: &Path, key_path: &Path) -> anyhow::Result<()> {
    if cert_path.exists() && key_path.exists() {
        return Ok(());
    }

    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
        .context("failed to generate self-signed certificate")?;
    fs::write(cert_path, cert.cert.pem()).context("failed to write certificate file")?;
    fs::write(key_path, cert.key_pair.serialize_pem()).context("failed to write key file")?;

    info!(
        "generated self-signed certificate: {} / {}",
        cert_path.display(),
        key_path.display()
    );
    Ok(())
}

fn load_certs(path: &Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let file = fs::File::open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("failed to parse {}", path.display()))?;
    anyhow::ensure!(!certs.is_empty(), "no certificates in {}", path.display());
    Ok(certs)
}

fn load_key(path: &Path) -> anyhow::Result<PrivateKeyDer<'static>> {
    let file = fs::File::open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .with_context(|| format!("failed to parse {}", path.display()))?
        .with_context(|| format!("no private key in {}", path.display()))
}
