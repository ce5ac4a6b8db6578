// Copyright (c) 2026 Alpenhorn Coordinator
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! edTLS: every handshake uses a short-lived, self-signed P-256
//! certificate whose peer identity is vouched for by a long-lived Ed25519
//! signing key, instead of a CA chain.
//!
//! A fresh certificate is minted every [`CERT_VALIDITY`] and refreshed at
//! two-thirds of its lifetime ([`EphemeralCert::needs_refresh`]). The vouch
//! is carried as a custom X.509 extension ([`VOUCH_EXTENSION_OID`]) whose
//! content is the Ed25519 signature produced by
//! [`crate::core::security::keystore::Keystore::vouch_edtls_leaf`].

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rcgen::{CertificateParams, CustomExtension, DistinguishedName, KeyPair, PKCS_ECDSA_P256_SHA256};
use thiserror::Error;
use x509_parser::prelude::*;

use crate::core::security::keystore::{verify_edtls_vouch, Keystore, KeystoreError, SignerBackend};
use crate::core::types::{PublicKey, Signature};

/// Certificate validity window (one hour).
pub const CERT_VALIDITY: Duration = Duration::from_secs(3600);

/// Fraction of [`CERT_VALIDITY`] after which a fresh certificate is minted.
const REFRESH_FRACTION_NUM: u32 = 2;
const REFRESH_FRACTION_DEN: u32 = 3;

/// Private enterprise arbitrary OID carrying the vouch signature.
pub const VOUCH_EXTENSION_OID: &[u64] = &[1, 3, 6, 1, 4, 1, 55957, 1, 1];

/// edTLS errors.
#[derive(Debug, Error)]
pub enum EdtlsError {
    /// Certificate generation failed.
    #[error("certificate generation")]
    Generate,
    /// The peer's certificate could not be parsed.
    #[error("malformed peer certificate")]
    Malformed,
    /// The peer's certificate carried no vouch extension, or more than one
    /// peer certificate was presented.
    #[error("missing or ambiguous vouch")]
    NoVouch,
    /// `notAfter` was not in the future.
    #[error("certificate expired")]
    Expired,
    /// The vouch signature did not verify against the expected long-lived key.
    #[error("vouch signature verification failed")]
    VerificationFailed,
}

impl From<KeystoreError> for EdtlsError {
    fn from(_: KeystoreError) -> Self {
        EdtlsError::VerificationFailed
    }
}

fn der_octet_string(content: &[u8]) -> Vec<u8> {
    let mut out = vec![0x04u8];
    // Short-form length is enough: vouch signatures are 64 bytes.
    if content.len() < 0x80 {
        out.push(content.len() as u8);
    } else {
        out.push(0x81);
        out.push(content.len() as u8);
    }
    out.extend_from_slice(content);
    out
}

/// Strip the OCTET STRING tag/length prefix written by [`der_octet_string`].
/// Only short- and one-byte-long-form lengths are accepted, which is all
/// `der_octet_string` ever produces for a 64-byte Ed25519 signature.
fn parse_der_octet_string(der: &[u8]) -> Option<&[u8]> {
    let (tag, rest) = der.split_first()?;
    if *tag != 0x04 {
        return None;
    }
    let (len_byte, rest) = rest.split_first()?;
    let len = if *len_byte < 0x80 {
        *len_byte as usize
    } else if *len_byte == 0x81 {
        let (b, rest2) = rest.split_first()?;
        let _ = rest2;
        *b as usize
    } else {
        return None;
    };
    let content_start = if *len_byte < 0x80 { 0 } else { 1 };
    let content = rest.get(content_start..content_start + len)?;
    Some(content)
}

/// A short-lived edTLS leaf certificate plus its matching private key,
/// vouched for by a long-lived identity.
pub struct EphemeralCert {
    cert_der: Vec<u8>,
    key_der: Vec<u8>,
    not_after: SystemTime,
    refresh_at: SystemTime,
}

impl EphemeralCert {
    /// Mint a fresh ephemeral certificate vouched for by `signer`.
    pub fn mint<B: SignerBackend>(signer: &Keystore<B>) -> Result<Self, EdtlsError> {
        let key_pair = KeyPair::generate(&PKCS_ECDSA_P256_SHA256).map_err(|_| EdtlsError::Generate)?;
        let leaf_spki_der = key_pair.public_key_der();

        let now = SystemTime::now();
        let not_after = now + CERT_VALIDITY;
        let not_after_unix = not_after
            .duration_since(UNIX_EPOCH)
            .map_err(|_| EdtlsError::Generate)?
            .as_secs();

        let vouch = signer
            .vouch_edtls_leaf(&leaf_spki_der, not_after_unix)
            .map_err(EdtlsError::from)?;

        let mut params = CertificateParams::new(vec!["alpenhorn".into()]);
        params.distinguished_name = DistinguishedName::new();
        params.not_before = now.into();
        params.not_after = not_after.into();
        params.alg = &PKCS_ECDSA_P256_SHA256;
        params.key_pair = Some(key_pair);
        params
            .custom_extensions
            .push(CustomExtension::from_oid_content(
                VOUCH_EXTENSION_OID,
                der_octet_string(&vouch.0),
            ));

        let cert = rcgen::Certificate::from_params(params).map_err(|_| EdtlsError::Generate)?;
        let cert_der = cert.serialize_der().map_err(|_| EdtlsError::Generate)?;
        let key_der = cert.serialize_private_key_der();

        let refresh_secs =
            CERT_VALIDITY.as_secs() * REFRESH_FRACTION_NUM as u64 / REFRESH_FRACTION_DEN as u64;
        let refresh_at = now + Duration::from_secs(refresh_secs);

        Ok(Self { cert_der, key_der, not_after, refresh_at })
    }

    /// DER-encoded certificate, ready for `rustls::Certificate`.
    pub fn cert_der(&self) -> &[u8] {
        &self.cert_der
    }

    /// DER-encoded PKCS#8 private key, ready for `rustls::PrivateKey`.
    pub fn key_der(&self) -> &[u8] {
        &self.key_der
    }

    /// Whether this certificate has crossed two-thirds of its validity
    /// window and a replacement should be minted.
    pub fn needs_refresh(&self) -> bool {
        SystemTime::now() >= self.refresh_at
    }

    /// Whether `notAfter` still lies in the future.
    pub fn is_live(&self) -> bool {
        SystemTime::now() < self.not_after
    }

    /// PEM-encoded certificate, for servers (`axum_server`'s rustls config)
    /// that take PEM rather than raw DER.
    pub fn cert_pem(&self) -> Vec<u8> {
        pem_encode("CERTIFICATE", &self.cert_der).into_bytes()
    }

    /// PEM-encoded PKCS#8 private key, for servers that take PEM rather
    /// than raw DER.
    pub fn key_pem(&self) -> Vec<u8> {
        pem_encode("PRIVATE KEY", &self.key_der).into_bytes()
    }
}

fn pem_encode(label: &str, der: &[u8]) -> String {
    use base64::Engine as _;
    use std::fmt::Write as _;

    let b64 = base64::engine::general_purpose::STANDARD.encode(der);
    let mut out = format!("-----BEGIN {label}-----\n");
    for chunk in b64.as_bytes().chunks(64) {
        let _ = writeln!(out, "{}", std::str::from_utf8(chunk).expect("ascii base64"));
    }
    let _ = write!(out, "-----END {label}-----\n");
    out
}

/// Verify a peer's edTLS leaf certificate against its expected long-lived
/// Ed25519 public key. Exactly one certificate must be presented.
pub fn verify_peer_cert(peer_certs: &[Vec<u8>], expected_long_term_pk: &PublicKey) -> Result<(), EdtlsError> {
    let cert_der = match peer_certs {
        [one] => one.as_slice(),
        _ => return Err(EdtlsError::NoVouch),
    };

    let (_, cert) = parse_x509_certificate(cert_der).map_err(|_| EdtlsError::Malformed)?;

    let not_after_unix = cert.validity().not_after.timestamp();
    if not_after_unix <= 0 {
        return Err(EdtlsError::Expired);
    }
    let not_after_unix = not_after_unix as u64;
    let not_after = UNIX_EPOCH + Duration::from_secs(not_after_unix);
    if SystemTime::now() >= not_after {
        return Err(EdtlsError::Expired);
    }

    let vouch_ext = cert
        .extensions()
        .iter()
        .find(|ext| ext.oid.to_string() == oid_to_string(VOUCH_EXTENSION_OID))
        .ok_or(EdtlsError::NoVouch)?;
    let vouch_bytes = parse_der_octet_string(vouch_ext.value).ok_or(EdtlsError::Malformed)?;

    let leaf_spki_der = cert.tbs_certificate.subject_pki.raw;

    verify_edtls_vouch(
        expected_long_term_pk,
        leaf_spki_der,
        not_after_unix,
        &Signature(vouch_bytes.to_vec()),
    )
    .map_err(|_| EdtlsError::VerificationFailed)
}

fn oid_to_string(arcs: &[u64]) -> String {
    arcs.iter().map(|a| a.to_string()).collect::<Vec<_>>().join(".")
}

/// A `rustls` server-certificate verifier that accepts exactly one
/// certificate and delegates to [`verify_peer_cert`] instead of checking a
/// CA chain — the client-side half of edTLS pinning.
#[derive(Debug)]
struct PinnedServerVerifier {
    expected: PublicKey,
}

impl rustls::client::danger::ServerCertVerifier for PinnedServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        verify_peer_cert(&[end_entity.as_ref().to_vec()], &self.expected)
            .map_err(|e| rustls::Error::General(e.to_string()))?;
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

/// Build a client TLS config that pins the server's edTLS vouch to
/// `expected_peer_key` instead of validating a CA chain. Since the vouch
/// signature, not the TLS signature itself, carries the trust decision,
/// the TLS-layer signature checks above are intentionally permissive —
/// `verify_server_cert` is where the real rejection happens.
pub fn build_client_tls_config(expected_peer_key: PublicKey) -> std::sync::Arc<rustls::ClientConfig> {
    let verifier = std::sync::Arc::new(PinnedServerVerifier { expected: expected_peer_key });
    let config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_no_client_auth();
    std::sync::Arc::new(config)
}

/// Build a client TLS config that both pins the peer's edTLS vouch to
/// `expected_peer_key` and presents `cert` as this side's own client
/// identity, for the authenticated HTTP client's outbound calls to the
/// config server, PKG set, CDN, and mix chain — all of which require a
/// client certificate to authenticate, unlike the plain server-pinned
/// [`build_client_tls_config`] the websocket client dials with.
pub fn build_authenticated_client_config(
    cert: &EphemeralCert,
    expected_peer_key: PublicKey,
) -> Result<rustls::ClientConfig, EdtlsError> {
    let verifier = std::sync::Arc::new(PinnedServerVerifier { expected: expected_peer_key });
    let cert_chain = vec![rustls::pki_types::CertificateDer::from(cert.cert_der().to_vec())];
    let key_der =
        rustls::pki_types::PrivateKeyDer::from(rustls::pki_types::PrivatePkcs8KeyDer::from(cert.key_der().to_vec()));
    rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_client_auth_cert(cert_chain, key_der)
        .map_err(|_| EdtlsError::Generate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::security::keystore::FileEd25519Backend;
    use tempfile::tempdir;

    fn keystore() -> Keystore<FileEd25519Backend> {
        let dir = tempdir().unwrap();
        Keystore::open(dir.path().to_str().unwrap()).unwrap()
    }

    #[test]
    fn vouch_round_trips_through_keystore_signing() {
        let ks = keystore();
        let leaf = b"fake-spki-der".to_vec();
        let not_after = 1_900_000_000u64;
        let vouch = ks.vouch_edtls_leaf(&leaf, not_after).unwrap();
        let pk = PublicKey(ks.public_key().to_vec());
        assert!(verify_edtls_vouch(&pk, &leaf, not_after, &vouch).is_ok());
    }

    #[test]
    fn tampered_not_after_rejects() {
        let ks = keystore();
        let leaf = b"fake-spki-der".to_vec();
        let vouch = ks.vouch_edtls_leaf(&leaf, 1_900_000_000).unwrap();
        let pk = PublicKey(ks.public_key().to_vec());
        assert!(verify_edtls_vouch(&pk, &leaf, 1_900_000_001, &vouch).is_err());
    }

    #[test]
    fn freshly_minted_cert_is_live_and_does_not_need_refresh() {
        let ks = keystore();
        let cert = EphemeralCert::mint(&ks).unwrap();
        assert!(cert.is_live());
        assert!(!cert.needs_refresh());
    }
}
