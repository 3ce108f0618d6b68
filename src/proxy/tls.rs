//! Per-host certificate minting for the MITM CONNECT path, under a local CA
//! the operator trusts out-of-band. CA provisioning itself is out of
//! scope; this module only mints leaf certificates once a CA keypair is
//! supplied.

use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};

use crate::error::{Result, WardenError};

/// Holds the local CA's keypair and issues leaf certificates on demand.
/// Never persisted by this crate; the operator is responsible for trusting
/// and rotating the CA out-of-band.
pub struct CertMinter {
    ca_key: KeyPair,
    ca_cert: rcgen::Certificate,
}

impl CertMinter {
    /// Builds a minter from a PEM-encoded CA certificate and key.
    ///
    /// # Errors
    ///
    /// Returns [`WardenError::EnforcerFailed`] if the PEM cannot be parsed
    /// into a valid CA certificate.
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        let ca_key = KeyPair::from_pem(key_pem)
            .map_err(|e| WardenError::enforcer_failed("tls-ca-key", e.to_string()))?;
        let params = CertificateParams::from_ca_cert_pem(cert_pem)
            .map_err(|e| WardenError::enforcer_failed("tls-ca-cert", e.to_string()))?;
        let ca_cert = params
            .self_signed(&ca_key)
            .map_err(|e| WardenError::enforcer_failed("tls-ca-self-sign", e.to_string()))?;

        Ok(Self { ca_key, ca_cert })
    }

    /// Mints a leaf certificate for `host`, signed by the local CA, and
    /// returns the `(cert_der, key_der)` pair in DER encoding for use with
    /// `rustls::ServerConfig`.
    ///
    /// # Errors
    ///
    /// Returns [`WardenError::EnforcerFailed`] if certificate generation or
    /// signing fails.
    pub fn mint_for_host(&self, host: &str) -> Result<(Vec<u8>, Vec<u8>)> {
        let mut params = CertificateParams::new(vec![host.to_owned()])
            .map_err(|e| WardenError::enforcer_failed("tls-leaf-params", e.to_string()))?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, host);
        params.distinguished_name = dn;

        let leaf_key = KeyPair::generate().map_err(|e| WardenError::enforcer_failed("tls-leaf-key", e.to_string()))?;
        let leaf_cert = params
            .signed_by(&leaf_key, &self.ca_cert, &self.ca_key)
            .map_err(|e| WardenError::enforcer_failed("tls-leaf-sign", e.to_string()))?;

        Ok((leaf_cert.der().to_vec(), leaf_key.serialize_der()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_ca() -> (String, String) {
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "egress-warden test CA");
        params.distinguished_name = dn;
        params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);

        let key = KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();
        (cert.pem(), key.serialize_pem())
    }

    #[test]
    fn mints_leaf_cert_for_host() {
        let (cert_pem, key_pem) = test_ca();
        let minter = CertMinter::from_pem(&cert_pem, &key_pem).expect("build minter");
        let (cert_der, key_der) = minter.mint_for_host("example.com").expect("mint leaf");
        assert!(!cert_der.is_empty());
        assert!(!key_der.is_empty());
    }
}
