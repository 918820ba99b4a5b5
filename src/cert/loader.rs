//! Certificate loader (C9): resolves the right certificate for an
//! incoming TLS ClientHello by SNI, extending the teacher's domain-keyed
//! `CertStore` into a real `rustls::server::ResolvesServerCert` so the
//! proxy's TLS acceptor can serve every domain group from one listener.

use std::collections::HashSet;
use std::io::BufReader;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use tracing::{info, warn};

/// What's known about an installed certificate beyond its key material,
/// used to detect the changes expiry alone can't see: an alias added to the
/// group, or a staging cert left in place after switching to production.
#[derive(Debug, Clone)]
struct CertMeta {
    sans: Vec<String>,
    staging: bool,
}

/// SNI-resolving certificate store: exact domain match, then wildcard
/// (`*.example.test`), then a generated self-signed fallback so the
/// handshake never outright fails for an unknown SNI (spec §4.9).
pub struct CertLoader {
    certs: DashMap<String, Arc<CertifiedKey>>,
    expiries: DashMap<String, chrono::DateTime<chrono::Utc>>,
    meta: DashMap<String, CertMeta>,
    default_cert: Arc<CertifiedKey>,
}

impl CertLoader {
    pub fn new() -> anyhow::Result<Self> {
        Ok(Self {
            certs: DashMap::new(),
            expiries: DashMap::new(),
            meta: DashMap::new(),
            default_cert: Arc::new(generate_self_signed("localhost")?),
        })
    }

    /// Installs a cert for every SAN it covers, keyed separately so lookups
    /// for an alias domain resolve without re-parsing.
    pub fn install_pem_for_domains(&self, domains: &[String], cert_pem: &str, key_pem: &str) -> anyhow::Result<()> {
        let certified = Arc::new(build_certified_key(cert_pem, key_pem)?);
        let expiry = super::acme::parse_cert_expiry(cert_pem);
        let info = super::acme::parse_cert_info(cert_pem);
        for domain in domains {
            let domain = domain.to_lowercase();
            self.certs.insert(domain.clone(), certified.clone());
            if let Some(expiry) = expiry {
                self.expiries.insert(domain.clone(), expiry);
            }
            if let Some(info) = &info {
                self.meta.insert(domain, CertMeta { sans: info.sans.clone(), staging: info.staging });
            }
        }
        info!(domains = ?domains, "installed certificate");
        Ok(())
    }

    /// Whether `domain` has a certificate that won't expire within
    /// `renewal_window`. A domain with no certificate at all is never
    /// "fresh".
    pub fn has_fresh_cert(&self, domain: &str, renewal_window: Duration) -> bool {
        let domain = domain.to_lowercase();
        if !self.certs.contains_key(&domain) {
            return false;
        }
        match self.expiries.get(&domain) {
            Some(expiry) => {
                let threshold = chrono::Utc::now() + chrono::Duration::from_std(renewal_window).unwrap_or_default();
                *expiry > threshold
            }
            // Expiry unknown (unparseable cert): treat as stale so a
            // refresh is attempted rather than serving it indefinitely.
            None => false,
        }
    }

    /// Whether `domain`'s installed certificate already covers
    /// `expected_sans` and matches the expected staging/production origin.
    /// A domain with no certificate, or one whose metadata couldn't be
    /// parsed, never matches — a missing cert is handled by the normal
    /// issuance path, and unparseable metadata should force a reissue
    /// rather than silently serve something we can't verify.
    pub fn matches(&self, domain: &str, expected_sans: &[String], expect_staging: bool) -> bool {
        let domain = domain.to_lowercase();
        let Some(meta) = self.meta.get(&domain) else { return false };
        if meta.staging != expect_staging {
            return false;
        }
        let have: HashSet<String> = meta.sans.iter().cloned().collect();
        expected_sans.iter().all(|d| have.contains(&d.to_lowercase()))
    }

    /// Domains whose certificate has already expired, for periodic cleanup.
    pub fn expired_domains(&self) -> Vec<String> {
        let now = chrono::Utc::now();
        self.expiries.iter().filter(|e| *e.value() <= now).map(|e| e.key().clone()).collect()
    }

    /// Removes `domain`'s installed certificate and metadata. Leaves the
    /// default self-signed fallback to answer any further SNI for it.
    pub fn evict(&self, domain: &str) {
        let domain = domain.to_lowercase();
        self.certs.remove(&domain);
        self.expiries.remove(&domain);
        self.meta.remove(&domain);
    }

    fn lookup(&self, domain: &str) -> Option<Arc<CertifiedKey>> {
        let domain = domain.to_lowercase();
        if let Some(cert) = self.certs.get(&domain) {
            return Some(cert.clone());
        }
        let mut labels = domain.splitn(2, '.');
        let _first = labels.next()?;
        let rest = labels.next()?;
        self.certs.get(&format!("*.{rest}")).map(|c| c.clone())
    }
}

impl ResolvesServerCert for CertLoader {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        match client_hello.server_name() {
            Some(name) => self.lookup(name).or_else(|| {
                warn!(domain = %name, "no certificate for SNI, serving self-signed fallback");
                Some(self.default_cert.clone())
            }),
            None => Some(self.default_cert.clone()),
        }
    }
}

fn build_certified_key(cert_pem: &str, key_pem: &str) -> anyhow::Result<CertifiedKey> {
    let mut cert_reader = BufReader::new(cert_pem.as_bytes());
    let certs: Vec<_> = rustls_pemfile::certs(&mut cert_reader).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        anyhow::bail!("no certificates found in PEM data");
    }

    let mut key_reader = BufReader::new(key_pem.as_bytes());
    let key = loop {
        match rustls_pemfile::read_one(&mut key_reader)? {
            Some(rustls_pemfile::Item::Pkcs1Key(k)) => break rustls::pki_types::PrivateKeyDer::Pkcs1(k),
            Some(rustls_pemfile::Item::Pkcs8Key(k)) => break rustls::pki_types::PrivateKeyDer::Pkcs8(k),
            Some(rustls_pemfile::Item::Sec1Key(k)) => break rustls::pki_types::PrivateKeyDer::Sec1(k),
            Some(_) => continue,
            None => anyhow::bail!("no private key found in PEM data"),
        }
    };

    let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)?;
    Ok(CertifiedKey::new(certs, signing_key))
}

fn generate_self_signed(domain: &str) -> anyhow::Result<CertifiedKey> {
    let cert = rcgen::generate_simple_self_signed(vec![domain.to_string()])?;
    let cert_der = cert.cert.der().clone();
    let key_der = rustls::pki_types::PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der());

    let signing_key = rustls::crypto::ring::sign::any_supported_type(&rustls::pki_types::PrivateKeyDer::Pkcs8(key_der))?;
    Ok(CertifiedKey::new(vec![cert_der], signing_key))
}

/// All currently loaded domains (exact + wildcard keys), for diagnostics.
pub fn loaded_domains(loader: &CertLoader) -> Vec<String> {
    loader.certs.iter().map(|e| e.key().clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_cert_serves_unknown_sni() {
        let loader = CertLoader::new().unwrap();
        assert!(loader.lookup("unknown.test").is_none());
    }

    #[test]
    fn fresh_check_false_for_unknown_domain() {
        let loader = CertLoader::new().unwrap();
        assert!(!loader.has_fresh_cert("unknown.test", Duration::from_secs(2_592_000)));
    }

    #[test]
    fn matches_false_for_unknown_domain() {
        let loader = CertLoader::new().unwrap();
        assert!(!loader.matches("unknown.test", &["unknown.test".to_string()], false));
    }

    #[test]
    fn expired_domains_empty_when_nothing_installed() {
        let loader = CertLoader::new().unwrap();
        assert!(loader.expired_domains().is_empty());
    }

    #[test]
    fn evict_is_a_no_op_on_unknown_domain() {
        let loader = CertLoader::new().unwrap();
        loader.evict("unknown.test");
        assert!(!loader.has_fresh_cert("unknown.test", Duration::from_secs(1)));
    }
}
