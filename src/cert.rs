use std::io::{BufReader, Cursor};

use chrono::{DateTime, Duration, Utc};
use der::{asn1::Ia5String, Encode as _};
use eyre::{eyre, WrapErr as _};
use pkcs8::{DecodePrivateKey as _, EncodePrivateKey as _, LineEnding};
use rsa::RsaPrivateKey;
use sha2::Sha256;
use x509_cert::{
    builder::{Builder as _, RequestBuilder as CsrBuilder},
    ext::pkix::{name::GeneralName, SubjectAltName},
    name::Name,
};

use crate::store::Store;

/// Issued certificate chain, persisted verbatim as returned by the CA.
pub(crate) const CERTIFICATE_FILE: &str = "certificate.pem";

/// The private key the certificate is issued for.
pub(crate) const CERT_KEY_FILE: &str = "certkey.pem";

/// Key size for generated certificate keys.
const RSA_BITS: usize = 2048;

/// Make an RSA private key (from which we can derive a public key).
pub fn create_rsa_key(bits: usize) -> eyre::Result<RsaPrivateKey> {
    RsaPrivateKey::new(&mut rand::thread_rng(), bits).wrap_err("RSA key generation failed")
}

/// Loads the certificate key, generating and persisting one on first use.
///
/// The key is reused across renewals.
pub(crate) async fn ensure_cert_key(store: &dyn Store) -> eyre::Result<RsaPrivateKey> {
    if let Some(pem) = store.read(CERT_KEY_FILE).await? {
        let pem = String::from_utf8(pem).wrap_err("certificate key is not UTF-8")?;
        return RsaPrivateKey::from_pkcs8_pem(&pem).wrap_err("reading certificate key");
    }

    log::info!("Generating new certificate key");
    let key = create_rsa_key(RSA_BITS)?;
    let pem = key.to_pkcs8_pem(LineEnding::LF)?;
    store.write(CERT_KEY_FILE, pem.as_bytes()).await?;

    Ok(key)
}

/// Creates a CSR for `domains` and signs it with `key` using RSA-SHA256.
///
/// The first item of `domains` is picked for the CSR's Common Name (CN). All
/// domains, the first included, go into the Subject Alternative Name (SAN)
/// extension; issuers read the SAN list, not the CN.
pub(crate) fn create_csr(
    key: &RsaPrivateKey,
    domains: &[&str],
) -> eyre::Result<x509_cert::request::CertReq> {
    let primary_domain = domains.first().ok_or_else(|| eyre!("no domains for CSR"))?;
    let subject = format!("CN={primary_domain}")
        .parse::<Name>()
        .wrap_err("CSR subject")?;

    let signer = rsa::pkcs1v15::SigningKey::<Sha256>::new(key.clone());

    let mut csr = CsrBuilder::new(subject, &signer).map_err(|err| eyre!("csr builder: {err}"))?;

    let san = domains
        .iter()
        .map(|domain| Ok(GeneralName::DnsName(Ia5String::new(domain)?)))
        .collect::<Result<Vec<_>, der::Error>>()?;

    csr.add_extension(&SubjectAltName(san))
        .map_err(|err| eyre!("csr san extension: {err}"))?;

    csr.build::<rsa::pkcs1v15::Signature>()
        .map_err(|err| eyre!("build csr: {err}"))
}

/// Returns the CSR as base64url DER, the form `finalize` expects.
pub(crate) fn csr_der_b64(csr: &x509_cert::request::CertReq) -> eyre::Result<String> {
    use base64::prelude::*;
    Ok(BASE64_URL_SAFE_NO_PAD.encode(csr.to_der()?))
}

/// What the driver needs to know about an issued certificate.
#[derive(Debug, Clone)]
pub(crate) struct CertInfo {
    pub not_after: DateTime<Utc>,
    pub sans: Vec<String>,
}

/// An issued certificate chain in PEM format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Certificate {
    pem: String,
}

impl Certificate {
    pub fn new(pem: String) -> Self {
        Certificate { pem }
    }

    /// The chain exactly as the CA returned it.
    pub fn pem(&self) -> &str {
        &self.pem
    }

    /// The chain split into DER certificates, end-entity first.
    pub fn certificate_chain(&self) -> eyre::Result<Vec<Vec<u8>>> {
        let mut rdr = BufReader::new(Cursor::new(self.pem.as_bytes()));

        rustls_pemfile::certs(&mut rdr)
            .map(|res| res.map(|cert| cert.to_vec()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    fn end_entity_der(&self) -> eyre::Result<Vec<u8>> {
        self.certificate_chain()?
            .into_iter()
            .next()
            .ok_or_else(|| eyre!("no certificates in chain"))
    }

    /// Expiry of the end-entity certificate.
    pub fn not_after(&self) -> eyre::Result<DateTime<Utc>> {
        Ok(self.inspect()?.not_after)
    }

    /// Count of the number of (whole) valid days left.
    ///
    /// It's up to the ACME API provider to decide how long an issued certificate is valid.
    /// Let's Encrypt sets the validity to 90 days. This function reports 89 days for a newly
    /// issued cert, since it counts _whole_ days.
    ///
    /// It is possible to get negative days for an expired certificate.
    pub fn valid_days_left(&self, now: DateTime<Utc>) -> eyre::Result<i64> {
        Ok((self.inspect()?.not_after - now).num_days())
    }

    /// DNS names in the end-entity certificate's SAN extension, lowercased.
    pub fn sans(&self) -> eyre::Result<Vec<String>> {
        Ok(self.inspect()?.sans)
    }

    /// Whether the certificate can serve `names` until at least
    /// `now + margin_days`.
    pub(crate) fn is_usable(&self, names: &[String], now: DateTime<Utc>, margin_days: i64) -> bool {
        match self.inspect() {
            Ok(info) => {
                info.not_after > now + Duration::days(margin_days)
                    && names
                        .iter()
                        .all(|name| info.sans.contains(&name.to_ascii_lowercase()))
            }
            Err(err) => {
                log::warn!("Stored certificate failed to parse: {err}");
                false
            }
        }
    }

    /// Whether the end-entity certificate was issued for `key`.
    #[cfg(not(test))]
    pub(crate) fn matches_key(&self, key: &RsaPrivateKey) -> eyre::Result<bool> {
        use der::Decode as _;
        use rsa::pkcs8::DecodePublicKey as _;

        let cert = x509_cert::Certificate::from_der(&self.end_entity_der()?)?;
        let spki = cert.tbs_certificate.subject_public_key_info.to_der()?;
        let public = rsa::RsaPublicKey::from_public_key_der(&spki)?;

        Ok(public == key.to_public_key())
    }

    #[cfg(test)]
    pub(crate) fn matches_key(&self, _key: &RsaPrivateKey) -> eyre::Result<bool> {
        Ok(true)
    }

    #[cfg(not(test))]
    fn inspect(&self) -> eyre::Result<CertInfo> {
        use der::Decode as _;

        const SUBJECT_ALT_NAME_OID: der::asn1::ObjectIdentifier =
            der::asn1::ObjectIdentifier::new_unwrap("2.5.29.17");

        let cert = x509_cert::Certificate::from_der(&self.end_entity_der()?)
            .wrap_err("parsing end-entity certificate")?;

        let not_after_secs = cert
            .tbs_certificate
            .validity
            .not_after
            .to_date_time()
            .unix_duration()
            .as_secs();
        let not_after = DateTime::from_timestamp(not_after_secs as i64, 0)
            .ok_or_else(|| eyre!("certificate notAfter out of range"))?;

        let mut sans = Vec::new();
        if let Some(extensions) = &cert.tbs_certificate.extensions {
            for ext in extensions {
                if ext.extn_id != SUBJECT_ALT_NAME_OID {
                    continue;
                }

                let san = SubjectAltName::from_der(ext.extn_value.as_bytes())?;
                for name in &san.0 {
                    if let GeneralName::DnsName(dns) = name {
                        sans.push(dns.as_str().to_ascii_lowercase());
                    }
                }
            }
        }

        Ok(CertInfo { not_after, sans })
    }

    // The mock CA in `crate::test` cannot mint real X.509; its stand-in
    // blocks carry a descriptor instead. See `test::fake_chain`.
    #[cfg(test)]
    fn inspect(&self) -> eyre::Result<CertInfo> {
        let der = self.end_entity_der()?;
        let text = String::from_utf8(der).wrap_err("descriptor block")?;

        let mut not_after = None;
        let mut sans = Vec::new();

        for field in text.split(';') {
            if let Some(value) = field.strip_prefix("not-after:") {
                not_after = Some(
                    DateTime::parse_from_rfc3339(value)
                        .wrap_err("descriptor not-after")?
                        .with_timezone(&Utc),
                );
            } else if let Some(value) = field.strip_prefix("san:") {
                sans = value
                    .split(',')
                    .filter(|s| !s.is_empty())
                    .map(|s| s.to_ascii_lowercase())
                    .collect();
            }
        }

        Ok(CertInfo {
            not_after: not_after.ok_or_else(|| eyre!("descriptor missing not-after"))?,
            sans,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::fake_chain;

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_chain_splits_into_blocks() {
        let cert = Certificate::new(fake_chain(
            "2030-06-01T00:00:00Z",
            &["device.example.com"],
        ));

        // end entity + issuer
        assert_eq!(cert.certificate_chain().unwrap().len(), 2);
    }

    #[test]
    fn test_not_after_and_days_left() {
        let cert = Certificate::new(fake_chain(
            "2030-06-01T00:00:00Z",
            &["device.example.com"],
        ));

        assert_eq!(cert.not_after().unwrap(), utc("2030-06-01T00:00:00Z"));
        assert_eq!(
            cert.valid_days_left(utc("2030-05-12T00:00:00Z")).unwrap(),
            20
        );
        assert_eq!(
            cert.valid_days_left(utc("2030-07-01T00:00:00Z")).unwrap(),
            -30
        );
    }

    #[test]
    fn test_usability_checks_margin_and_names() {
        let names = vec!["device.example.com".to_owned()];
        let cert = Certificate::new(fake_chain(
            "2030-06-01T00:00:00Z",
            &["Device.Example.Com", "alt.example.com"],
        ));

        // 40 days out, 30-day margin: fine
        assert!(cert.is_usable(&names, utc("2030-04-22T00:00:00Z"), 30));

        // 20 days out, 30-day margin: renewal due
        assert!(!cert.is_usable(&names, utc("2030-05-12T00:00:00Z"), 30));

        // name not covered
        let other = vec!["other.example.com".to_owned()];
        assert!(!cert.is_usable(&other, utc("2030-04-22T00:00:00Z"), 30));
    }

    #[test]
    fn test_garbage_is_not_usable() {
        let cert = Certificate::new("not a pem".to_owned());
        assert!(!cert.is_usable(
            &["device.example.com".to_owned()],
            utc("2030-01-01T00:00:00Z"),
            30
        ));
    }

    #[tokio::test]
    async fn test_cert_key_is_reused_from_store() {
        let store = crate::store::MemStore::new();
        store
            .write(CERT_KEY_FILE, crate::test::test_key_pem().as_bytes())
            .await
            .unwrap();

        let a = ensure_cert_key(&store).await.unwrap();
        let b = ensure_cert_key(&store).await.unwrap();

        assert_eq!(a, b);
    }
}
