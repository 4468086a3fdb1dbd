use std::io::{BufReader, Cursor};

use der::{
    asn1::{Ia5String, ObjectIdentifier, PrintableStringRef, Utf8StringRef},
    time::{OffsetDateTime, PrimitiveDateTime},
    Decode as _,
};
use x509_cert::{
    builder::{Builder, RequestBuilder as CsrBuilder},
    ext::pkix::{name::GeneralName, SubjectAltName},
    name::Name,
    request::CertReq,
};

use crate::error::{Error, Result};

const COMMON_NAME: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.3");
const EXTENSION_REQUEST: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.14");
const SUBJECT_ALT_NAME: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.29.17");

/// Creates a CSR for `domains` and signs it with `signer`.
///
/// The first item of `domains` is picked for the CSR's Common Name (CN). All
/// domains, the first included, are added to a Subject Alternative Name (SAN)
/// extension, since validators ignore the CN for name matching.
pub fn create_csr(signer: &p256::ecdsa::SigningKey, domains: &[&str]) -> Result<CertReq> {
    let primary_domain = domains
        .first()
        .ok_or_else(|| Error::Crypto("a CSR needs at least one domain".to_owned()))?;
    let subject = format!("CN={primary_domain}").parse::<Name>()?;

    let mut csr = CsrBuilder::new(subject, signer)?;

    let san = domains
        .iter()
        .map(|domain| {
            Ia5String::new(domain)
                .map(GeneralName::DnsName)
                .map_err(|err| Error::Crypto(format!("invalid domain {domain:?}: {err}")))
        })
        .collect::<Result<Vec<_>>>()?;
    csr.add_extension(&SubjectAltName(san))?;

    Ok(csr.build::<p256::ecdsa::DerSignature>()?)
}

/// Domains a CSR asks to be certified for.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CsrDomains {
    /// Subject Common Name, if the CSR carries one.
    pub common_name: Option<String>,
    /// DNS entries of the Subject Alternative Name extension.
    pub alt_names: Vec<String>,
}

impl CsrDomains {
    /// All domains, common name first, without duplicates.
    pub fn all(&self) -> Vec<String> {
        let mut domains = Vec::with_capacity(self.alt_names.len() + 1);
        domains.extend(self.common_name.clone());

        for name in &self.alt_names {
            if !domains.contains(name) {
                domains.push(name.clone());
            }
        }

        domains
    }
}

/// Extract the Common Name and SAN DNS entries from a CSR.
pub fn read_csr_domains(csr: &CertReq) -> Result<CsrDomains> {
    let common_name = csr
        .info
        .subject
        .0
        .iter()
        .flat_map(|rdn| rdn.0.iter())
        .find(|atv| atv.oid == COMMON_NAME)
        .map(|atv| decode_directory_string(&atv.value))
        .transpose()?;

    let mut alt_names = vec![];

    for attr in csr.info.attributes.iter() {
        if attr.oid != EXTENSION_REQUEST {
            continue;
        }

        for value in attr.values.iter() {
            let extensions = value.decode_as::<x509_cert::ext::Extensions>()?;

            for ext in extensions {
                if ext.extn_id != SUBJECT_ALT_NAME {
                    continue;
                }

                let san = SubjectAltName::from_der(ext.extn_value.as_bytes())?;
                alt_names.extend(san.0.into_iter().filter_map(|name| match name {
                    GeneralName::DnsName(dns) => Some(dns.to_string()),
                    _ => None,
                }));
            }
        }
    }

    Ok(CsrDomains {
        common_name,
        alt_names,
    })
}

fn decode_directory_string(value: &der::Any) -> Result<String> {
    if let Ok(s) = value.decode_as::<Utf8StringRef<'_>>() {
        return Ok(s.to_string());
    }
    let s = value.decode_as::<PrintableStringRef<'_>>()?;
    Ok(s.to_string())
}

/// An issued certificate chain in PEM format, end-entity certificate first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Certificate {
    certificate: String,
}

impl Certificate {
    pub(crate) fn new(certificate: String) -> Self {
        Certificate { certificate }
    }

    /// Wrap a previously downloaded chain, validating that it parses.
    pub fn parse(certificate: String) -> Result<Self> {
        let cert = Certificate::new(certificate);
        cert.end_entity()?;
        Ok(cert)
    }

    /// The certificate chain in PEM format.
    pub fn certificate(&self) -> &str {
        &self.certificate
    }

    /// The certificate chain in DER format, end-entity first.
    pub fn certificate_chain(&self) -> Result<Vec<Vec<u8>>> {
        let mut rdr = BufReader::new(Cursor::new(self.certificate()));

        rustls_pemfile::certs(&mut rdr)
            .map(|res| res.map(|cert| cert.to_vec()))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|err| Error::Crypto(format!("invalid certificate chain: {err}")))
    }

    /// The end-entity certificate in DER encoding.
    pub fn certificate_der(&self) -> Result<Vec<u8>> {
        let chain = self.certificate_chain()?;
        chain
            .into_iter()
            .next()
            .ok_or_else(|| Error::Crypto("no certificates in chain".to_owned()))
    }

    fn end_entity(&self) -> Result<x509_cert::Certificate> {
        Ok(x509_cert::Certificate::from_der(&self.certificate_der()?)?)
    }

    /// Key facts about the end-entity certificate.
    pub fn info(&self) -> Result<CertificateInfo> {
        let cert = self.end_entity()?;
        let tbs = &cert.tbs_certificate;

        let mut domains = vec![];
        for ext in tbs.extensions.iter().flatten() {
            if ext.extn_id != SUBJECT_ALT_NAME {
                continue;
            }

            let san = SubjectAltName::from_der(ext.extn_value.as_bytes())?;
            domains.extend(san.0.iter().filter_map(|name| match name {
                GeneralName::DnsName(dns) => Some(dns.to_string()),
                _ => None,
            }));
        }

        Ok(CertificateInfo {
            domains,
            issuer_common_name: name_common_name(&tbs.issuer)?,
            not_before: to_offset_date_time(tbs.validity.not_before.to_date_time())?,
            not_after: to_offset_date_time(tbs.validity.not_after.to_date_time())?,
        })
    }

    /// The number of (whole) valid days left on the end-entity certificate.
    ///
    /// It's up to the ACME API provider to decide how long an issued
    /// certificate is valid. Let's Encrypt sets the validity to 90 days, so
    /// this reports 89 for a freshly issued cert, counting whole days only.
    ///
    /// It is possible to get negative days for an expired certificate.
    pub fn valid_days_left(&self) -> Result<i64> {
        let info = self.info()?;
        let diff = info.not_after - OffsetDateTime::now_utc();
        Ok(diff.whole_days())
    }

    /// Issuer Common Names of every certificate in the chain, used for
    /// matching a preferred chain by the name of its issuers.
    pub(crate) fn issuer_common_names(&self) -> Result<Vec<String>> {
        let mut names = vec![];

        for der in self.certificate_chain()? {
            let cert = x509_cert::Certificate::from_der(&der)?;
            names.extend(name_common_name(&cert.tbs_certificate.issuer)?);
        }

        Ok(names)
    }
}

/// Summary of an end-entity certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateInfo {
    /// SAN DNS entries the certificate covers.
    pub domains: Vec<String>,
    /// Common Name of the issuing certificate, if present.
    pub issuer_common_name: Option<String>,
    pub not_before: OffsetDateTime,
    pub not_after: OffsetDateTime,
}

fn name_common_name(name: &Name) -> Result<Option<String>> {
    name.0
        .iter()
        .flat_map(|rdn| rdn.0.iter())
        .find(|atv| atv.oid == COMMON_NAME)
        .map(|atv| decode_directory_string(&atv.value))
        .transpose()
}

fn to_offset_date_time(dt: der::DateTime) -> Result<OffsetDateTime> {
    let primitive = PrimitiveDateTime::try_from(dt)
        .map_err(|err| Error::Crypto(format!("certificate validity out of range: {err}")))?;
    // x509 validity timestamps are defined in UTC
    Ok(primitive.assume_utc())
}
