//! TLS material: the listener-side acceptor for ldaps:// and the client
//! config used when the backend itself is ldaps://.

use anyhow::{bail, Context, Result};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::ClientConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, RootCertStore, SignatureScheme};
use rustls_pemfile::{certs, pkcs8_private_keys, rsa_private_keys};
use std::fs;
use std::io::BufReader;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;
use tracing::warn;

use crate::server::ClientStream;

/// What happens to an accepted TCP stream before LDAP starts. The listener
/// gets one of these and never has to know whether it serves ldap or ldaps.
pub enum StreamUpgrader {
    Plain,
    Tls(TlsAcceptor),
}

impl StreamUpgrader {
    /// Build from the listener scheme and the configured cert/key paths.
    /// Fails at startup on unreadable or unparsable material.
    pub fn from_listener(
        tls: bool,
        cert_file: Option<&str>,
        key_file: Option<&str>,
    ) -> Result<Self> {
        if !tls {
            return Ok(StreamUpgrader::Plain);
        }
        let (cert, key) = match (cert_file, key_file) {
            (Some(c), Some(k)) => (c, k),
            _ => bail!("ldaps:// listener needs tls_cert_file and tls_key_file"),
        };
        let config = load_server_config_from_files(cert, key)?;
        Ok(StreamUpgrader::Tls(TlsAcceptor::from(config)))
    }

    pub async fn upgrade(&self, stream: TcpStream) -> Result<ClientStream> {
        match self {
            StreamUpgrader::Plain => Ok(ClientStream::Tcp(stream)),
            StreamUpgrader::Tls(acceptor) => {
                let tls = acceptor
                    .accept(stream)
                    .await
                    .context("TLS handshake with client")?;
                Ok(ClientStream::Tls(tls))
            }
        }
    }
}

/// Build a rustls ServerConfig from PEM certificate and key file paths.
pub fn load_server_config_from_files(
    cert_file: &str,
    key_file: &str,
) -> Result<Arc<rustls::ServerConfig>> {
    let certs = load_certs_from_file(cert_file)?;
    let key = load_private_key_from_file(key_file)?;
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("build ServerConfig from cert and key")?;
    Ok(Arc::new(config))
}

fn load_certs_from_file(path: &str) -> Result<Vec<CertificateDer<'static>>> {
    let file = fs::File::open(path).with_context(|| format!("open cert file {path}"))?;
    let mut reader = BufReader::new(file);
    let certs: Vec<CertificateDer<'static>> = certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .context("parse PEM certificates")?;
    if certs.is_empty() {
        bail!("no certificates found in {path}");
    }
    Ok(certs)
}

/// PKCS8 first, then the legacy RSA PEM form.
fn load_private_key_from_file(path: &str) -> Result<PrivateKeyDer<'static>> {
    let file = fs::File::open(path).with_context(|| format!("open key file {path}"))?;
    let mut reader = BufReader::new(file);
    let pkcs8: Vec<_> = pkcs8_private_keys(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .context("parse PEM PKCS8 keys")?;
    if let Some(key) = pkcs8.into_iter().next() {
        return Ok(key.into());
    }
    let file = fs::File::open(path).with_context(|| format!("open key file {path}"))?;
    let mut reader = BufReader::new(file);
    let rsa: Vec<_> = rsa_private_keys(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .context("parse PEM RSA keys")?;
    rsa.into_iter()
        .next()
        .map(Into::into)
        .ok_or_else(|| anyhow::anyhow!("no private key found in {path}"))
}

/// TLS client config for ldaps:// backends: system roots, optionally an
/// extra CA bundle file, optionally no verification at all.
pub fn backend_client_config(skip_verify: bool, ca_file: Option<&str>) -> Result<Arc<ClientConfig>> {
    let mut root_store = RootCertStore::empty();
    for cert in rustls_native_certs::load_native_certs().context("load system CA certs")? {
        let _ = root_store.add(cert);
    }
    if let Some(path) = ca_file {
        let pem = fs::read(path).with_context(|| format!("read CA bundle {path}"))?;
        for cert in certs(&mut std::io::Cursor::new(&pem)) {
            let cert = cert.with_context(|| format!("parse CA bundle {path}"))?;
            let _ = root_store.add(cert);
        }
    }
    let mut config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    if skip_verify {
        warn!("backend certificate verification is disabled");
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(InsecureServerVerifier));
    }
    Ok(Arc::new(config))
}

/// Verifier that accepts any server certificate. Only reachable through
/// backend_tls_skip_verify.
#[derive(Debug)]
struct InsecureServerVerifier;

impl ServerCertVerifier for InsecureServerVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::ED25519,
        ]
    }
}
