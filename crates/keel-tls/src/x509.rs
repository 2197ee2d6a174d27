//! Peer-certificate introspection: distinguished names and subject
//! alternative names.

use std::net::IpAddr;

use x509_parser::extensions::GeneralName;
use x509_parser::prelude::*;

use keel_types::TlsError;

/// RFC 2253 string forms of the peer's subject and issuer names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDn {
    pub subject: String,
    pub issuer: String,
}

/// Subject-alternative-name categories usable as a query filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubjectAltNameType {
    DnsName,
    Rfc822Name,
    Uri,
    IpAddress,
    Dn,
    OtherName,
}

/// One typed subject-alternative-name entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubjectAltName {
    DnsName(String),
    Rfc822Name(String),
    Uri(String),
    IpAddress(IpAddr),
    Dn(String),
    /// Carries the type OID of the unrecognized name.
    OtherName(String),
}

impl SubjectAltName {
    pub fn name_type(&self) -> SubjectAltNameType {
        match self {
            SubjectAltName::DnsName(_) => SubjectAltNameType::DnsName,
            SubjectAltName::Rfc822Name(_) => SubjectAltNameType::Rfc822Name,
            SubjectAltName::Uri(_) => SubjectAltNameType::Uri,
            SubjectAltName::IpAddress(_) => SubjectAltNameType::IpAddress,
            SubjectAltName::Dn(_) => SubjectAltNameType::Dn,
            SubjectAltName::OtherName(_) => SubjectAltNameType::OtherName,
        }
    }
}

fn parse(der: &[u8]) -> Result<X509Certificate<'_>, TlsError> {
    let (_, cert) =
        x509_parser::parse_x509_certificate(der).map_err(|e| TlsError::Credential {
            reason: format!("failed to parse peer certificate: {e:?}"),
        })?;
    Ok(cert)
}

pub(crate) fn extract_dn(der: &[u8]) -> Result<SessionDn, TlsError> {
    let cert = parse(der)?;
    Ok(SessionDn {
        subject: cert.subject().to_string(),
        issuer: cert.issuer().to_string(),
    })
}

/// Extract SAN entries, optionally restricted to `filter` types. An empty
/// filter returns every recognized entry.
pub(crate) fn extract_alt_names(
    der: &[u8],
    filter: &[SubjectAltNameType],
) -> Result<Vec<SubjectAltName>, TlsError> {
    let cert = parse(der)?;
    let san = match cert
        .subject_alternative_name()
        .map_err(|e| TlsError::Credential {
            reason: format!("malformed subject alternative name extension: {e}"),
        })? {
        Some(ext) => ext.value,
        None => return Ok(Vec::new()),
    };

    let mut names = Vec::new();
    for general_name in &san.general_names {
        let entry = match general_name {
            GeneralName::DNSName(name) => SubjectAltName::DnsName((*name).to_string()),
            GeneralName::RFC822Name(name) => SubjectAltName::Rfc822Name((*name).to_string()),
            GeneralName::URI(uri) => SubjectAltName::Uri((*uri).to_string()),
            GeneralName::IPAddress(bytes) => SubjectAltName::IpAddress(parse_ip(bytes)?),
            GeneralName::DirectoryName(name) => SubjectAltName::Dn(name.to_string()),
            GeneralName::OtherName(oid, _) => SubjectAltName::OtherName(oid.to_string()),
            _ => continue,
        };
        if filter.is_empty() || filter.contains(&entry.name_type()) {
            names.push(entry);
        }
    }
    Ok(names)
}

fn parse_ip(bytes: &[u8]) -> Result<IpAddr, TlsError> {
    match bytes.len() {
        4 => {
            let octets: [u8; 4] = bytes.try_into().unwrap_or_default();
            Ok(IpAddr::from(octets))
        }
        16 => {
            let octets: [u8; 16] = bytes.try_into().unwrap_or_default();
            Ok(IpAddr::from(octets))
        }
        other => Err(TlsError::Credential {
            reason: format!("unexpected size {other} for ipaddress alt name value"),
        }),
    }
}
