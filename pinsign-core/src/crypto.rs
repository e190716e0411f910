//! In-process cryptography behind a narrow interface
//!
//! Everything the signer needs from a crypto library goes through
//! [`CryptoBackend`]: key generation, self-signing the trust anchor,
//! producing the enveloping signature and verifying it. Keys cross the
//! interface as PEM, certificates and signatures as DER.

use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::error::ErrorStack;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkcs7::{Pkcs7, Pkcs7Flags};
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::stack::Stack;
use openssl::x509::extension::{BasicConstraints, SubjectKeyIdentifier};
use openssl::x509::store::X509StoreBuilder;
use openssl::x509::{X509NameBuilder, X509};
use thiserror::Error;

use crate::config::OrganizationFields;

/// Errors from the crypto backend
#[derive(Error, Debug)]
pub enum CryptoError {
    /// The underlying library reported an error
    #[error("OpenSSL error: {0}")]
    OpenSsl(#[from] ErrorStack),

    /// Signature or signer certificate did not verify
    #[error("Signature verification failed: {0}")]
    Verification(String),

    /// Input is not a certificate, key or signed artifact
    #[error("Malformed {what}: {reason}")]
    Malformed { what: &'static str, reason: String },
}

/// Subject of a self-signed trust anchor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectFields {
    pub country: String,
    pub state: String,
    pub locality: String,
    pub organization: String,
    pub common_name: String,
}

impl SubjectFields {
    /// Fixed organizational identity with the customer as common name
    pub fn for_customer(organization: &OrganizationFields, customer: &str) -> Self {
        SubjectFields {
            country: organization.country.clone(),
            state: organization.state.clone(),
            locality: organization.locality.clone(),
            organization: organization.organization.clone(),
            common_name: customer.to_string(),
        }
    }
}

/// The operations the trust anchor manager and signer rely on
pub trait CryptoBackend: Send + Sync {
    /// Generate an RSA private key, returned as PKCS#8 PEM
    fn generate_keypair(&self, bits: u32) -> Result<Vec<u8>, CryptoError>;

    /// Self-sign a certificate over `key_pem`, returned as DER
    fn self_sign_certificate(
        &self,
        key_pem: &[u8],
        subject: &SubjectFields,
        validity_days: u32,
    ) -> Result<Vec<u8>, CryptoError>;

    /// Produce an enveloping signature (content embedded), returned as DER
    fn sign(&self, payload: &[u8], cert_der: &[u8], key_pem: &[u8])
        -> Result<Vec<u8>, CryptoError>;

    /// Verify an enveloping signature trusting only `anchor_der`, returning the embedded content
    fn verify(&self, artifact: &[u8], anchor_der: &[u8]) -> Result<Vec<u8>, CryptoError>;
}

/// [`CryptoBackend`] backed by the system OpenSSL library
#[derive(Debug, Clone, Copy, Default)]
pub struct OpensslBackend;

impl OpensslBackend {
    pub fn new() -> Self {
        OpensslBackend
    }

    fn load_key(key_pem: &[u8]) -> Result<PKey<Private>, CryptoError> {
        PKey::private_key_from_pem(key_pem).map_err(|e| CryptoError::Malformed {
            what: "private key",
            reason: e.to_string(),
        })
    }

    fn load_cert(cert_der: &[u8]) -> Result<X509, CryptoError> {
        X509::from_der(cert_der).map_err(|e| CryptoError::Malformed {
            what: "certificate",
            reason: e.to_string(),
        })
    }
}

impl CryptoBackend for OpensslBackend {
    fn generate_keypair(&self, bits: u32) -> Result<Vec<u8>, CryptoError> {
        let rsa = Rsa::generate(bits)?;
        let pkey = PKey::from_rsa(rsa)?;
        Ok(pkey.private_key_to_pem_pkcs8()?)
    }

    fn self_sign_certificate(
        &self,
        key_pem: &[u8],
        subject: &SubjectFields,
        validity_days: u32,
    ) -> Result<Vec<u8>, CryptoError> {
        let pkey = Self::load_key(key_pem)?;

        let mut name = X509NameBuilder::new()?;
        name.append_entry_by_nid(Nid::COUNTRYNAME, &subject.country)?;
        name.append_entry_by_nid(Nid::STATEORPROVINCENAME, &subject.state)?;
        name.append_entry_by_nid(Nid::LOCALITYNAME, &subject.locality)?;
        name.append_entry_by_nid(Nid::ORGANIZATIONNAME, &subject.organization)?;
        name.append_entry_by_nid(Nid::COMMONNAME, &subject.common_name)?;
        let name = name.build();

        let serial = {
            let mut bn = BigNum::new()?;
            bn.rand(159, MsbOption::MAYBE_ZERO, false)?;
            bn.to_asn1_integer()?
        };

        let mut builder = X509::builder()?;
        builder.set_version(2)?;
        builder.set_serial_number(&serial)?;
        builder.set_subject_name(&name)?;
        builder.set_issuer_name(&name)?;
        builder.set_pubkey(&pkey)?;
        let not_before = Asn1Time::days_from_now(0)?;
        let not_after = Asn1Time::days_from_now(validity_days)?;
        builder.set_not_before(&not_before)?;
        builder.set_not_after(&not_after)?;

        // Same extensions `openssl req -x509` adds by default
        builder.append_extension(BasicConstraints::new().critical().ca().build()?)?;
        let subject_key_id =
            SubjectKeyIdentifier::new().build(&builder.x509v3_context(None, None))?;
        builder.append_extension(subject_key_id)?;

        builder.sign(&pkey, MessageDigest::sha512())?;
        Ok(builder.build().to_der()?)
    }

    fn sign(
        &self,
        payload: &[u8],
        cert_der: &[u8],
        key_pem: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let pkey = Self::load_key(key_pem)?;
        let cert = Self::load_cert(cert_der)?;
        let extra_certs = Stack::<X509>::new()?;

        // No DETACHED flag: the manifest travels inside the signature
        let signed = Pkcs7::sign(&cert, &pkey, &extra_certs, payload, Pkcs7Flags::BINARY)?;
        Ok(signed.to_der()?)
    }

    fn verify(&self, artifact: &[u8], anchor_der: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let anchor = Self::load_cert(anchor_der)?;
        let pkcs7 = Pkcs7::from_der(artifact).map_err(|e| CryptoError::Malformed {
            what: "signed manifest",
            reason: e.to_string(),
        })?;

        let mut store = X509StoreBuilder::new()?;
        store.add_cert(anchor)?;
        let store = store.build();

        let extra_certs = Stack::<X509>::new()?;
        let mut content = Vec::new();
        pkcs7
            .verify(
                &extra_certs,
                &store,
                None,
                Some(&mut content),
                Pkcs7Flags::BINARY,
            )
            .map_err(|e| CryptoError::Verification(e.to_string()))?;

        Ok(content)
    }
}

/// PEM encoding of a DER certificate
pub fn certificate_der_to_pem(cert_der: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cert = OpensslBackend::load_cert(cert_der)?;
    Ok(cert.to_pem()?)
}

/// DER encoding of a certificate supplied as either PEM or DER
pub fn certificate_to_der(bytes: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if bytes.starts_with(b"-----BEGIN") {
        let cert = X509::from_pem(bytes).map_err(|e| CryptoError::Malformed {
            what: "certificate",
            reason: e.to_string(),
        })?;
        Ok(cert.to_der()?)
    } else {
        Ok(OpensslBackend::load_cert(bytes)?.to_der()?)
    }
}
