//! Client certificate identity
//!
//! Share-mode sessions authenticate to the control plane with a client
//! certificate. The PEM material is injected by the supervisor; this
//! module turns it into the two client configurations the agent needs:
//! a `reqwest::Identity` for HTTP calls and a `rustls::ClientConfig` for
//! the WebSocket dial.

use std::sync::Arc;

use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("failed to read {path}: {message}")]
    Read { path: String, message: String },

    #[error("invalid certificate PEM: {0}")]
    CertPem(String),

    #[error("invalid private key PEM: {0}")]
    KeyPem(String),

    #[error("TLS configuration error: {0}")]
    Tls(String),
}

/// Client certificate and key, kept as PEM.
#[derive(Clone)]
pub struct ClientIdentity {
    cert_pem: Vec<u8>,
    key_pem: Vec<u8>,
}

impl std::fmt::Debug for ClientIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientIdentity")
            .field("cert_pem_len", &self.cert_pem.len())
            .finish()
    }
}

impl ClientIdentity {
    pub fn from_pem(cert_pem: Vec<u8>, key_pem: Vec<u8>) -> Self {
        Self { cert_pem, key_pem }
    }

    pub fn from_pem_files(cert_path: &str, key_path: &str) -> Result<Self, IdentityError> {
        let cert_pem = std::fs::read(cert_path).map_err(|e| IdentityError::Read {
            path: cert_path.to_string(),
            message: e.to_string(),
        })?;
        let key_pem = std::fs::read(key_path).map_err(|e| IdentityError::Read {
            path: key_path.to_string(),
            message: e.to_string(),
        })?;
        Ok(Self::from_pem(cert_pem, key_pem))
    }

    /// Identity for reqwest-based control-plane calls.
    pub fn reqwest_identity(&self) -> Result<reqwest::Identity, IdentityError> {
        let mut bundle = self.cert_pem.clone();
        bundle.push(b'\n');
        bundle.extend_from_slice(&self.key_pem);
        reqwest::Identity::from_pem(&bundle).map_err(|e| IdentityError::Tls(e.to_string()))
    }

    /// TLS client config presenting this identity, verifying the server
    /// against the bundled web PKI roots. Used for the WebSocket dial.
    pub fn rustls_client_config(&self) -> Result<Arc<rustls::ClientConfig>, IdentityError> {
        let certs: Vec<CertificateDer<'static>> =
            rustls_pemfile::certs(&mut self.cert_pem.as_slice())
                .collect::<Result<_, _>>()
                .map_err(|e| IdentityError::CertPem(e.to_string()))?;
        if certs.is_empty() {
            return Err(IdentityError::CertPem("no certificates found".to_string()));
        }
        let key: PrivateKeyDer<'static> =
            rustls_pemfile::private_key(&mut self.key_pem.as_slice())
                .map_err(|e| IdentityError::KeyPem(e.to_string()))?
                .ok_or_else(|| IdentityError::KeyPem("no private key found".to_string()))?;

        // Idempotent; the Err when a provider is already installed is fine.
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_client_auth_cert(certs, key)
            .map_err(|e| IdentityError::Tls(e.to_string()))?;
        Ok(Arc::new(config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_files_are_reported() {
        let err = ClientIdentity::from_pem_files("/nonexistent/cert.pem", "/nonexistent/key.pem")
            .unwrap_err();
        assert!(matches!(err, IdentityError::Read { .. }));
    }

    #[test]
    fn test_garbage_pem_is_rejected() {
        let identity =
            ClientIdentity::from_pem(b"not a cert".to_vec(), b"not a key".to_vec());
        assert!(identity.rustls_client_config().is_err());
    }
}
