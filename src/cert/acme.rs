//! ACME client (RFC 8555) with HTTP-01 challenges for automatic TLS
//! certificate provisioning from Let's Encrypt.

use anyhow::{Context, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use dashmap::DashMap;
use ring::rand::SystemRandom;
use ring::signature::{EcdsaKeyPair, KeyPair as RingKeyPair, ECDSA_P256_SHA256_FIXED_SIGNING};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::sync::RwLock;
use tokio::time::sleep;
use tracing::{debug, info, warn};

pub const LETS_ENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";
pub const LETS_ENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";

#[derive(Debug, Clone)]
pub struct AcmeConfig {
    pub email: String,
    pub cache_dir: PathBuf,
    pub staging: bool,
}

impl Default for AcmeConfig {
    fn default() -> Self {
        Self {
            email: String::new(),
            cache_dir: PathBuf::from("./data/certs"),
            staging: true,
        }
    }
}

/// Pending HTTP-01 challenges: token -> key authorization, served by
/// [`super::challenge::ChallengeResponder`].
#[derive(Default, Clone)]
pub struct AcmeChallenges {
    challenges: Arc<DashMap<String, String>>,
}

impl AcmeChallenges {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, token: &str, key_authorization: &str) {
        self.challenges.insert(token.to_string(), key_authorization.to_string());
    }

    pub fn get(&self, token: &str) -> Option<String> {
        self.challenges.get(token).map(|v| v.clone())
    }

    pub fn remove(&self, token: &str) {
        self.challenges.remove(token);
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(dead_code)]
struct Directory {
    new_nonce: String,
    new_account: String,
    new_order: String,
    #[serde(default)]
    revoke_cert: Option<String>,
    #[serde(default)]
    key_change: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct AccountCredentials {
    kid: String,
    private_key: String,
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
enum OrderStatus {
    Pending,
    Ready,
    Processing,
    Valid,
    Invalid,
}

#[derive(Debug, Deserialize)]
struct Order {
    status: OrderStatus,
    #[serde(default)]
    authorizations: Vec<String>,
    #[serde(default)]
    finalize: String,
    #[serde(default)]
    certificate: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Authorization {
    status: String,
    identifier: Identifier,
    challenges: Vec<Challenge>,
}

#[derive(Debug, Deserialize)]
#[allow(dead_code)]
struct Identifier {
    #[serde(rename = "type")]
    id_type: String,
    value: String,
}

#[derive(Debug, Deserialize)]
#[allow(dead_code)]
struct Challenge {
    #[serde(rename = "type")]
    challenge_type: String,
    url: String,
    token: String,
    #[serde(default)]
    status: String,
}

pub struct AcmeClient {
    config: AcmeConfig,
    http: reqwest::Client,
    directory: RwLock<Option<Directory>>,
    account_kid: RwLock<Option<String>>,
    key_pair: RwLock<Option<Vec<u8>>>,
    challenges: AcmeChallenges,
}

impl AcmeClient {
    pub async fn new(config: AcmeConfig) -> Result<Self> {
        fs::create_dir_all(&config.cache_dir)
            .await
            .context("failed to create ACME cache directory")?;

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("failed to create ACME http client")?;

        let client = Self {
            config,
            http,
            directory: RwLock::new(None),
            account_kid: RwLock::new(None),
            key_pair: RwLock::new(None),
            challenges: AcmeChallenges::new(),
        };

        client.fetch_directory().await?;
        client.load_or_create_account().await?;

        Ok(client)
    }

    pub fn challenges(&self) -> AcmeChallenges {
        self.challenges.clone()
    }

    async fn fetch_directory(&self) -> Result<()> {
        let url = if self.config.staging {
            LETS_ENCRYPT_STAGING
        } else {
            LETS_ENCRYPT_PRODUCTION
        };

        debug!(url = %url, "fetching ACME directory");

        let response = self.http.get(url).send().await.context("failed to fetch ACME directory")?;
        let directory: Directory = response.json().await.context("failed to parse ACME directory")?;

        *self.directory.write().await = Some(directory);
        Ok(())
    }

    async fn get_nonce(&self) -> Result<String> {
        let directory = self.directory.read().await;
        let directory = directory.as_ref().context("ACME directory not loaded")?;

        let response = self.http.head(&directory.new_nonce).send().await.context("failed to get nonce")?;

        response
            .headers()
            .get("replay-nonce")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
            .context("no nonce in response")
    }

    async fn load_or_create_account(&self) -> Result<()> {
        let account_path = self.config.cache_dir.join("account.json");

        if account_path.exists() {
            let data = fs::read_to_string(&account_path).await.context("failed to read account file")?;
            let credentials: AccountCredentials =
                serde_json::from_str(&data).context("failed to parse account credentials")?;
            let key_bytes = URL_SAFE_NO_PAD.decode(&credentials.private_key).context("failed to decode private key")?;

            *self.account_kid.write().await = Some(credentials.kid);
            *self.key_pair.write().await = Some(key_bytes);

            info!("loaded existing ACME account");
        } else {
            info!(email = %self.config.email, "creating new ACME account");

            let rng = SystemRandom::new();
            let pkcs8_bytes = EcdsaKeyPair::generate_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, &rng)
                .map_err(|e| anyhow::anyhow!("failed to generate ACME account key: {e}"))?;
            let key_bytes = pkcs8_bytes.as_ref().to_vec();
            *self.key_pair.write().await = Some(key_bytes.clone());

            let new_account_url = {
                let directory = self.directory.read().await;
                let directory = directory.as_ref().context("ACME directory not loaded")?;
                directory.new_account.clone()
            };

            let payload = serde_json::json!({
                "termsOfServiceAgreed": true,
                "contact": [format!("mailto:{}", self.config.email)]
            });

            let (response, _) = self.signed_request(&new_account_url, Some(payload), true).await?;

            let kid = response
                .headers()
                .get("location")
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_string())
                .context("no account URL in response")?;

            *self.account_kid.write().await = Some(kid.clone());

            let credentials = AccountCredentials {
                kid,
                private_key: URL_SAFE_NO_PAD.encode(&key_bytes),
            };
            let data = serde_json::to_string_pretty(&credentials).context("failed to serialize account credentials")?;
            crate::util::atomic_write(&account_path, data.as_bytes(), 0o600)
                .context("failed to save account credentials")?;

            info!("ACME account created and saved");
        }

        Ok(())
    }

    async fn signed_request(
        &self,
        url: &str,
        payload: Option<serde_json::Value>,
        use_jwk: bool,
    ) -> Result<(reqwest::Response, String)> {
        let nonce = self.get_nonce().await?;

        let key_bytes = self.key_pair.read().await;
        let key_bytes = key_bytes.as_ref().context("no ACME account key")?;

        let key_pair = EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, key_bytes, &SystemRandom::new())
            .map_err(|e| anyhow::anyhow!("failed to load ACME account key: {e}"))?;

        let mut protected = serde_json::json!({
            "alg": "ES256",
            "nonce": nonce,
            "url": url
        });

        if use_jwk {
            let (x, y) = public_key_xy(&key_pair);
            protected["jwk"] = serde_json::json!({
                "kty": "EC",
                "crv": "P-256",
                "x": URL_SAFE_NO_PAD.encode(x),
                "y": URL_SAFE_NO_PAD.encode(y)
            });
        } else {
            let kid = self.account_kid.read().await;
            let kid = kid.as_ref().context("no ACME account kid")?;
            protected["kid"] = serde_json::Value::String(kid.clone());
        }

        let protected_b64 = URL_SAFE_NO_PAD.encode(protected.to_string().as_bytes());
        let payload_b64 = match payload {
            Some(p) => URL_SAFE_NO_PAD.encode(p.to_string().as_bytes()),
            None => String::new(),
        };

        let signing_input = format!("{protected_b64}.{payload_b64}");
        let signature = key_pair
            .sign(&SystemRandom::new(), signing_input.as_bytes())
            .map_err(|e| anyhow::anyhow!("failed to sign ACME request: {e}"))?;

        let body = serde_json::json!({
            "protected": protected_b64,
            "payload": payload_b64,
            "signature": URL_SAFE_NO_PAD.encode(signature.as_ref()),
        });

        let response = self
            .http
            .post(url)
            .header("Content-Type", "application/jose+json")
            .json(&body)
            .send()
            .await
            .context("failed to send signed ACME request")?;

        let new_nonce = response
            .headers()
            .get("replay-nonce")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        Ok((response, new_nonce))
    }

    fn jwk_thumbprint(&self, key_bytes: &[u8]) -> Result<String> {
        let key_pair = EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, key_bytes, &SystemRandom::new())
            .map_err(|e| anyhow::anyhow!("failed to load ACME account key: {e}"))?;
        let (x, y) = public_key_xy(&key_pair);

        let jwk_json = format!(
            r#"{{"crv":"P-256","kty":"EC","x":"{}","y":"{}"}}"#,
            URL_SAFE_NO_PAD.encode(x),
            URL_SAFE_NO_PAD.encode(y)
        );

        let hash = ring::digest::digest(&ring::digest::SHA256, jwk_json.as_bytes());
        Ok(URL_SAFE_NO_PAD.encode(hash.as_ref()))
    }

    /// Requests a single certificate covering all of `domains`.
    pub async fn request_certificate(&self, domains: &[String]) -> Result<CertificateResult> {
        info!(domains = ?domains, "requesting certificate");

        let new_order_url = {
            let directory = self.directory.read().await;
            let directory = directory.as_ref().context("ACME directory not loaded")?;
            directory.new_order.clone()
        };

        let identifiers: Vec<_> = domains
            .iter()
            .map(|d| serde_json::json!({"type": "dns", "value": d}))
            .collect();

        let (response, _) = self
            .signed_request(&new_order_url, Some(serde_json::json!({"identifiers": identifiers})), false)
            .await?;

        let order_url = response
            .headers()
            .get("location")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
            .context("no order URL in response")?;

        let order: Order = response.json().await.context("failed to parse order")?;
        debug!(order_url = %order_url, status = ?order.status, "order created");

        for auth_url in &order.authorizations {
            self.process_authorization(auth_url).await?;
        }

        let order = self.poll_order(&order_url, OrderStatus::Ready).await?;

        let (private_key_pem, csr_der) = self.generate_csr(domains)?;
        let (response, _) = self
            .signed_request(&order.finalize, Some(serde_json::json!({"csr": URL_SAFE_NO_PAD.encode(&csr_der)})), false)
            .await?;

        if !response.status().is_success() {
            let error_text = response.text().await.unwrap_or_default();
            anyhow::bail!("failed to finalize order: {error_text}");
        }

        let order = self.poll_order(&order_url, OrderStatus::Valid).await?;

        let cert_url = order.certificate.context("no certificate URL in finalized order")?;
        let (response, _) = self.signed_request(&cert_url, None, false).await?;
        let certificate_chain_pem = response.text().await.context("failed to download certificate")?;

        for domain in domains {
            self.challenges.remove(domain);
        }

        info!(domains = ?domains, "certificate obtained");

        Ok(CertificateResult {
            private_key_pem,
            certificate_chain_pem,
            domains: domains.to_vec(),
        })
    }

    async fn process_authorization(&self, auth_url: &str) -> Result<()> {
        let (response, _) = self.signed_request(auth_url, None, false).await?;
        let auth: Authorization = response.json().await.context("failed to parse authorization")?;

        let domain = &auth.identifier.value;
        debug!(domain = %domain, status = %auth.status, "processing authorization");

        if auth.status == "valid" {
            return Ok(());
        }

        let challenge = auth
            .challenges
            .iter()
            .find(|c| c.challenge_type == "http-01")
            .context("no HTTP-01 challenge offered")?;

        let key_bytes = self.key_pair.read().await;
        let key_bytes = key_bytes.as_ref().context("no ACME account key")?;
        let thumbprint = self.jwk_thumbprint(key_bytes)?;
        let key_auth = format!("{}.{}", challenge.token, thumbprint);

        info!(domain = %domain, token = %challenge.token, "serving HTTP-01 challenge");
        self.challenges.add(&challenge.token, &key_auth);

        let (response, _) = self.signed_request(&challenge.url, Some(serde_json::json!({})), false).await?;
        if !response.status().is_success() {
            let error_text = response.text().await.unwrap_or_default();
            warn!(domain = %domain, error = %error_text, "challenge notification rejected");
        }

        for _ in 0..30 {
            sleep(Duration::from_secs(2)).await;

            let (response, _) = self.signed_request(auth_url, None, false).await?;
            let auth: Authorization = response.json().await?;

            match auth.status.as_str() {
                "valid" => {
                    info!(domain = %domain, "authorization validated");
                    return Ok(());
                }
                "invalid" => anyhow::bail!("authorization for {domain} was rejected by the CA"),
                _ => debug!(domain = %domain, status = %auth.status, "waiting for authorization"),
            }
        }

        anyhow::bail!("authorization for {domain} timed out")
    }

    async fn poll_order(&self, order_url: &str, expected: OrderStatus) -> Result<Order> {
        for _ in 0..30 {
            let (response, _) = self.signed_request(order_url, None, false).await?;
            let order: Order = response.json().await.context("failed to parse order")?;

            if order.status == expected || order.status == OrderStatus::Valid {
                return Ok(order);
            }
            if order.status == OrderStatus::Invalid {
                anyhow::bail!("order became invalid");
            }

            debug!(status = ?order.status, ?expected, "waiting for order");
            sleep(Duration::from_secs(2)).await;
        }

        anyhow::bail!("order polling timed out")
    }

    fn generate_csr(&self, domains: &[String]) -> Result<(String, Vec<u8>)> {
        use rcgen::{CertificateParams, DistinguishedName, KeyPair};

        let key_pair = KeyPair::generate().context("failed to generate certificate key pair")?;
        let key_der = key_pair.serialize_der();
        let private_key_pem = pem::encode(&pem::Pem::new("PRIVATE KEY", key_der));

        let mut params = CertificateParams::default();
        params.distinguished_name = DistinguishedName::new();
        params.subject_alt_names = domains
            .iter()
            .map(|d| rcgen::SanType::DnsName(d.clone().try_into().unwrap()))
            .collect();

        let csr = params.serialize_request(&key_pair).context("failed to create CSR")?;
        Ok((private_key_pem, csr.der().to_vec()))
    }

    pub async fn save_certificate(&self, result: &CertificateResult) -> Result<PathBuf> {
        let domain = result.domains.first().context("certificate result has no domains")?;
        let cert_dir = self.config.cache_dir.join(domain);
        fs::create_dir_all(&cert_dir).await.context("failed to create certificate directory")?;

        let cert_path = cert_dir.join("fullchain.pem");
        let key_path = cert_dir.join("privkey.pem");

        crate::util::atomic_write(&cert_path, result.certificate_chain_pem.as_bytes(), 0o644)
            .context("failed to write certificate")?;
        crate::util::atomic_write(&key_path, result.private_key_pem.as_bytes(), 0o600)
            .context("failed to write private key")?;

        info!(domain = %domain, cert_path = %cert_path.display(), "certificate saved");
        Ok(cert_dir)
    }

    pub async fn has_certificate(&self, domain: &str) -> bool {
        self.config.cache_dir.join(domain).join("fullchain.pem").exists()
    }

    pub fn cert_dir(&self, domain: &str) -> PathBuf {
        self.config.cache_dir.join(domain)
    }

    pub async fn cached_domains(&self) -> Result<Vec<String>> {
        let certs_dir = &self.config.cache_dir;
        if !certs_dir.exists() {
            return Ok(Vec::new());
        }

        let mut domains = Vec::new();
        let mut entries = fs::read_dir(certs_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    domains.push(name.to_string());
                }
            }
        }
        Ok(domains)
    }
}

fn public_key_xy(key_pair: &EcdsaKeyPair) -> (Vec<u8>, Vec<u8>) {
    let public_key = key_pair.public_key().as_ref();
    (public_key[1..33].to_vec(), public_key[33..65].to_vec())
}

#[derive(Debug, Clone)]
pub struct CertificateResult {
    pub private_key_pem: String,
    pub certificate_chain_pem: String,
    pub domains: Vec<String>,
}

/// Parses a PEM certificate chain's leaf `notAfter`. Unlike the stub this
/// once was, this actually decodes the X.509 structure rather than always
/// returning `None`.
pub fn parse_cert_expiry(pem_chain: &str) -> Option<chrono::DateTime<chrono::Utc>> {
    let (_, pem) = x509_parser::pem::parse_x509_pem(pem_chain.as_bytes()).ok()?;
    let cert = pem.parse_x509().ok()?;
    let not_after = cert.validity().not_after;
    chrono::DateTime::from_timestamp(not_after.timestamp(), 0)
}

/// SAN list and staging/production origin of a leaf certificate, used to
/// detect when a reissue is needed for a reason other than expiry (an alias
/// added to the group, or a staging cert left over from a first boot).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertInfo {
    pub sans: Vec<String>,
    pub staging: bool,
}

/// Extracts the leaf's SAN DNS names and a best-effort staging/production
/// classification from its issuer. Let's Encrypt staging issuers carry
/// "STAGING" in their CN (e.g. "(STAGING) Fake LE Intermediate X1"); no
/// staging CA includes that token, so this heuristic has no false negative
/// against a real staging order with the current Let's Encrypt naming.
pub fn parse_cert_info(pem_chain: &str) -> Option<CertInfo> {
    let (_, pem) = x509_parser::pem::parse_x509_pem(pem_chain.as_bytes()).ok()?;
    let cert = pem.parse_x509().ok()?;

    let mut sans = Vec::new();
    if let Ok(Some(ext)) = cert.subject_alternative_name() {
        for name in &ext.value.general_names {
            if let x509_parser::extensions::GeneralName::DNSName(dns) = name {
                sans.push(dns.to_lowercase());
            }
        }
    }

    let issuer = cert.issuer().to_string();
    let staging = issuer.to_uppercase().contains("STAGING");

    Some(CertInfo { sans, staging })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn challenges_round_trip() {
        let challenges = AcmeChallenges::new();
        challenges.add("tok", "auth");
        assert_eq!(challenges.get("tok"), Some("auth".to_string()));
        challenges.remove("tok");
        assert!(challenges.get("tok").is_none());
    }

    #[test]
    fn config_defaults_to_staging() {
        let config = AcmeConfig::default();
        assert!(config.staging);
        assert!(config.email.is_empty());
    }

    #[test]
    fn parse_cert_expiry_rejects_garbage() {
        assert!(parse_cert_expiry("not a cert").is_none());
    }

    #[test]
    fn parse_cert_info_rejects_garbage() {
        assert!(parse_cert_info("not a cert").is_none());
    }
}
