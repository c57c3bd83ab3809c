//! TLS settings and their compilation into a rustls client configuration.
//!
//! Settings are plain data owned by the client. Every change bumps the
//! client's TLS generation, and transports recompile the settings the next
//! time their connection is checked out.

use rustls::client::WebPkiServerVerifier;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{
    CryptoProvider, WebPkiSupportedAlgorithms, verify_tls12_signature, verify_tls13_signature,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{
    CertificateError, ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme,
    SupportedProtocolVersion,
};
use rustls_pemfile::{certs, private_key};
use std::fmt;
use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::TransportError;

/// Decides the fate of a server certificate.
///
/// Receives whether built-in verification passed and the end-entity
/// certificate; its return value is final.
pub type VerifyCallback = Arc<dyn Fn(bool, &CertificateDer<'_>) -> bool + Send + Sync>;

/// Server certificate verification mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum VerifyMode {
    /// Verify the server certificate chain and hostname.
    #[default]
    Peer,
    /// Accept any server certificate.
    None,
}

/// TLS protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TlsVersion {
    /// TLS 1.2
    Tls12,
    /// TLS 1.3
    Tls13,
}

impl TlsVersion {
    fn as_rustls(self) -> &'static SupportedProtocolVersion {
        match self {
            Self::Tls12 => &rustls::version::TLS12,
            Self::Tls13 => &rustls::version::TLS13,
        }
    }
}

/// TLS parameters applied to HTTPS connections.
#[derive(Default)]
pub struct TlsSettings {
    /// Client certificate chain.
    pub certificate: Option<Vec<CertificateDer<'static>>>,
    /// Client private key.
    pub private_key: Option<PrivateKeyDer<'static>>,
    /// PEM file of additional trusted roots.
    pub ca_file: Option<PathBuf>,
    /// Directory of PEM files with additional trusted roots.
    pub ca_path: Option<PathBuf>,
    /// Trusted roots replacing the bundled set.
    pub cert_store: Option<Arc<RootCertStore>>,
    /// Allowed cipher suites by IANA name, e.g. `TLS13_AES_128_GCM_SHA256`.
    pub ciphers: Option<Vec<String>>,
    /// Verification mode.
    pub verify_mode: VerifyMode,
    /// Maximum number of intermediate certificates accepted.
    pub verify_depth: Option<usize>,
    /// Custom verification hook.
    pub verify_callback: Option<VerifyCallback>,
    /// Pin a single protocol version.
    pub ssl_version: Option<TlsVersion>,
    /// Lowest protocol version offered.
    pub min_version: Option<TlsVersion>,
    /// Highest protocol version offered.
    pub max_version: Option<TlsVersion>,
    /// Deadline for the TLS handshake.
    pub ssl_timeout: Option<Duration>,
}

impl Clone for TlsSettings {
    fn clone(&self) -> Self {
        Self {
            certificate: self.certificate.clone(),
            private_key: self.private_key.as_ref().map(PrivateKeyDer::clone_key),
            ca_file: self.ca_file.clone(),
            ca_path: self.ca_path.clone(),
            cert_store: self.cert_store.clone(),
            ciphers: self.ciphers.clone(),
            verify_mode: self.verify_mode,
            verify_depth: self.verify_depth,
            verify_callback: self.verify_callback.clone(),
            ssl_version: self.ssl_version,
            min_version: self.min_version,
            max_version: self.max_version,
            ssl_timeout: self.ssl_timeout,
        }
    }
}

impl fmt::Debug for TlsSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsSettings")
            .field("certificate", &self.certificate.as_ref().map(Vec::len))
            .field("private_key", &self.private_key.as_ref().map(|_| "<redacted>"))
            .field("ca_file", &self.ca_file)
            .field("ca_path", &self.ca_path)
            .field("cert_store", &self.cert_store.as_ref().map(|s| s.len()))
            .field("ciphers", &self.ciphers)
            .field("verify_mode", &self.verify_mode)
            .field("verify_depth", &self.verify_depth)
            .field("verify_callback", &self.verify_callback.is_some())
            .field("ssl_version", &self.ssl_version)
            .field("min_version", &self.min_version)
            .field("max_version", &self.max_version)
            .field("ssl_timeout", &self.ssl_timeout)
            .finish()
    }
}

impl TlsSettings {
    /// Compile the settings into a rustls client configuration.
    pub fn client_config(&self) -> Result<Arc<ClientConfig>, TransportError> {
        let provider = Arc::new(self.crypto_provider()?);
        let versions = self.protocol_versions();
        if versions.is_empty() {
            return Err(TransportError::TlsConfig(
                "minimum TLS version is above the maximum".to_string(),
            ));
        }

        let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
            .with_protocol_versions(&versions)
            .map_err(|e| TransportError::TlsConfig(e.to_string()))?;

        let roots = self.root_store()?;
        let builder = if self.needs_custom_verifier() {
            let inner = match self.verify_mode {
                VerifyMode::Peer => Some(
                    WebPkiServerVerifier::builder_with_provider(
                        Arc::new(roots),
                        Arc::clone(&provider),
                    )
                    .build()
                    .map_err(|e| TransportError::TlsConfig(e.to_string()))?,
                ),
                VerifyMode::None => None,
            };

            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(PeerVerifier {
                    inner,
                    depth: self.verify_depth,
                    callback: self.verify_callback.clone(),
                    algorithms: provider.signature_verification_algorithms,
                }))
        } else {
            builder.with_root_certificates(roots)
        };

        let mut config = match (&self.certificate, &self.private_key) {
            (Some(chain), Some(key)) => builder
                .with_client_auth_cert(chain.clone(), key.clone_key())
                .map_err(|e| TransportError::TlsConfig(e.to_string()))?,
            _ => builder.with_no_client_auth(),
        };

        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        Ok(Arc::new(config))
    }

    /// Handshake deadline derived from the SSL timeout.
    pub fn handshake_timeout(&self) -> Option<Duration> {
        self.ssl_timeout
    }

    fn needs_custom_verifier(&self) -> bool {
        self.verify_mode == VerifyMode::None
            || self.verify_depth.is_some()
            || self.verify_callback.is_some()
    }

    fn crypto_provider(&self) -> Result<CryptoProvider, TransportError> {
        let mut provider = rustls::crypto::ring::default_provider();

        if let Some(names) = &self.ciphers {
            provider.cipher_suites.retain(|suite| {
                suite
                    .suite()
                    .as_str()
                    .is_some_and(|name| names.iter().any(|n| n.eq_ignore_ascii_case(name)))
            });

            if provider.cipher_suites.is_empty() {
                return Err(TransportError::TlsConfig(format!(
                    "no supported cipher suite in {}",
                    names.join(",")
                )));
            }
        }

        Ok(provider)
    }

    fn protocol_versions(&self) -> Vec<&'static SupportedProtocolVersion> {
        if let Some(version) = self.ssl_version {
            return vec![version.as_rustls()];
        }

        let min = self.min_version.unwrap_or(TlsVersion::Tls12);
        let max = self.max_version.unwrap_or(TlsVersion::Tls13);

        [TlsVersion::Tls12, TlsVersion::Tls13]
            .into_iter()
            .filter(|version| *version >= min && *version <= max)
            .map(TlsVersion::as_rustls)
            .collect()
    }

    fn root_store(&self) -> Result<RootCertStore, TransportError> {
        let mut roots = match &self.cert_store {
            Some(store) => RootCertStore::clone(store),
            None => {
                let mut roots = RootCertStore::empty();
                roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
                roots
            }
        };

        if let Some(file) = &self.ca_file {
            add_roots(&mut roots, load_certs(file)?)?;
        }

        if let Some(dir) = &self.ca_path {
            let entries = fs::read_dir(dir).map_err(|e| {
                TransportError::TlsConfig(format!("Failed to read CA directory: {}", e))
            })?;

            for entry in entries.flatten() {
                let path = entry.path();
                let is_pem = path
                    .extension()
                    .and_then(|ext| ext.to_str())
                    .is_some_and(|ext| matches!(ext, "pem" | "crt"));
                if is_pem {
                    add_roots(&mut roots, load_certs(&path)?)?;
                }
            }
        }

        Ok(roots)
    }
}

fn add_roots(
    roots: &mut RootCertStore,
    certs: Vec<CertificateDer<'static>>,
) -> Result<(), TransportError> {
    for cert in certs {
        roots
            .add(cert)
            .map_err(|e| TransportError::TlsConfig(format!("Invalid CA certificate: {}", e)))?;
    }
    Ok(())
}

/// Load certificates from a PEM file.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TransportError> {
    let file = File::open(path).map_err(|e| {
        TransportError::TlsConfig(format!("Failed to open certificate file: {}", e))
    })?;

    let mut reader = BufReader::new(file);

    certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| TransportError::TlsConfig(format!("Failed to parse certificates: {}", e)))
}

/// Load a private key from a PEM file.
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TransportError> {
    let file = File::open(path)
        .map_err(|e| TransportError::TlsConfig(format!("Failed to open key file: {}", e)))?;

    let mut reader = BufReader::new(file);

    private_key(&mut reader)
        .map_err(|e| TransportError::TlsConfig(format!("Failed to read private key: {}", e)))?
        .ok_or_else(|| TransportError::TlsConfig("No private key found in file".to_string()))
}

/// Parse certificates from PEM bytes.
pub fn parse_certs(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, TransportError> {
    let mut reader = BufReader::new(pem);

    certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| TransportError::TlsConfig(format!("Failed to parse certificates: {}", e)))
}

/// Parse a private key from PEM bytes.
pub fn parse_private_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>, TransportError> {
    let mut reader = BufReader::new(pem);

    private_key(&mut reader)
        .map_err(|e| TransportError::TlsConfig(format!("Failed to read private key: {}", e)))?
        .ok_or_else(|| TransportError::TlsConfig("No private key found".to_string()))
}

/// Server certificate verifier honouring verify mode, depth and callback.
struct PeerVerifier {
    /// `None` when verification is disabled.
    inner: Option<Arc<WebPkiServerVerifier>>,
    depth: Option<usize>,
    callback: Option<VerifyCallback>,
    algorithms: WebPkiSupportedAlgorithms,
}

impl fmt::Debug for PeerVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerVerifier")
            .field("verify", &self.inner.is_some())
            .field("depth", &self.depth)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

impl ServerCertVerifier for PeerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let mut verdict = match &self.inner {
            Some(inner) => inner
                .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
                .map(|_| ()),
            None => Ok(()),
        };

        if let Some(depth) = self.depth
            && verdict.is_ok()
            && intermediates.len() > depth
        {
            verdict = Err(rustls::Error::General(format!(
                "certificate chain has {} intermediates, verify depth is {}",
                intermediates.len(),
                depth
            )));
        }

        match &self.callback {
            Some(callback) if callback(verdict.is_ok(), end_entity) => {
                Ok(ServerCertVerified::assertion())
            }
            Some(_) => Err(verdict.err().unwrap_or(rustls::Error::InvalidCertificate(
                CertificateError::ApplicationVerificationFailure,
            ))),
            None => verdict.map(|()| ServerCertVerified::assertion()),
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings_compile() {
        let config = TlsSettings::default().client_config().unwrap();
        assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);
    }

    #[test]
    fn test_verify_none_compiles() {
        let settings = TlsSettings {
            verify_mode: VerifyMode::None,
            ..Default::default()
        };
        assert!(settings.client_config().is_ok());
    }

    #[test]
    fn test_verify_callback_compiles() {
        let settings = TlsSettings {
            verify_callback: Some(Arc::new(|preverified, _cert| preverified)),
            verify_depth: Some(3),
            ..Default::default()
        };
        assert!(settings.client_config().is_ok());
    }

    #[test]
    fn test_cipher_filter() {
        let settings = TlsSettings {
            ciphers: Some(vec!["tls13_aes_128_gcm_sha256".to_string()]),
            ..Default::default()
        };
        let provider = settings.crypto_provider().unwrap();
        assert_eq!(provider.cipher_suites.len(), 1);

        let settings = TlsSettings {
            ciphers: Some(vec!["RC4-MD5".to_string()]),
            ..Default::default()
        };
        assert!(matches!(
            settings.client_config(),
            Err(TransportError::TlsConfig(_))
        ));
    }

    #[test]
    fn test_protocol_versions() {
        let pinned = TlsSettings {
            ssl_version: Some(TlsVersion::Tls12),
            ..Default::default()
        };
        assert_eq!(pinned.protocol_versions().len(), 1);

        let ranged = TlsSettings {
            min_version: Some(TlsVersion::Tls13),
            ..Default::default()
        };
        assert_eq!(ranged.protocol_versions().len(), 1);

        let inverted = TlsSettings {
            min_version: Some(TlsVersion::Tls13),
            max_version: Some(TlsVersion::Tls12),
            ..Default::default()
        };
        assert!(inverted.protocol_versions().is_empty());
        assert!(inverted.client_config().is_err());
    }

    #[test]
    fn test_parse_invalid_key() {
        assert!(parse_private_key(b"invalid key data").is_err());
    }

    #[test]
    fn test_missing_ca_file() {
        let settings = TlsSettings {
            ca_file: Some(PathBuf::from("/nonexistent/ca.pem")),
            ..Default::default()
        };
        assert!(matches!(
            settings.client_config(),
            Err(TransportError::TlsConfig(_))
        ));
    }

    #[test]
    fn test_debug_redacts_key() {
        let debug = format!("{:?}", TlsSettings::default());
        assert!(debug.contains("TlsSettings"));
        assert!(!debug.contains("BEGIN"));
    }
}
