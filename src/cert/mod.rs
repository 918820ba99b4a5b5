//! Certificate manager (C7), ACME HTTP-01 client (part of C7), the loopback
//! challenge responder (C8), and the SNI-aware certificate loader (C9).

pub mod acme;
pub mod challenge;
pub mod loader;

pub use acme::{AcmeClient, AcmeConfig as AcmeClientConfig, CertificateResult};
pub use challenge::ChallengeResponder;
pub use loader::CertLoader;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::config::AcmeConfig;
use crate::util::Debouncer;

/// One certificate's worth of domains: the canonical name plus any aliases,
/// all covered by the same certificate's SAN list (spec §4.7: a domain
/// group shares one ACME order).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DomainGroupKey {
    pub canonical: String,
    pub all: Vec<String>,
}

/// Owns the ACME client, the challenge responder, and the cert loader;
/// drives issuance and renewal for every domain group the reconciler hands
/// it.
pub struct CertManager {
    acme: Arc<AcmeClient>,
    loader: Arc<CertLoader>,
    renewal_window: Duration,
    refresh_debounce: Debouncer,
    staging: bool,
}

impl CertManager {
    pub async fn new(config: &AcmeConfig, loader: Arc<CertLoader>) -> anyhow::Result<Self> {
        let acme_config = AcmeClientConfig {
            email: config.default_email.clone().unwrap_or_default(),
            cache_dir: config.cert_dir.clone(),
            staging: config.staging,
        };
        let acme = Arc::new(AcmeClient::new(acme_config).await?);
        Ok(Self {
            acme,
            loader,
            renewal_window: config.renewal_window,
            refresh_debounce: Debouncer::new(Duration::from_secs(5)),
            staging: config.staging,
        })
    }

    pub fn challenges(&self) -> acme::AcmeChallenges {
        self.acme.challenges()
    }

    /// Ensures every domain group has a loaded, non-expiring-soon certificate.
    /// Issues new certs for groups that have none; skips groups already
    /// covered by a fresh cert. Logs and continues past a single group's
    /// failure rather than aborting the whole batch.
    pub async fn ensure_certificates(&self, groups: &[DomainGroupKey]) {
        for group in groups {
            if let Err(e) = self.ensure_certificate(group).await {
                error!(canonical = %group.canonical, error = %e, "certificate issuance failed");
            }
        }
    }

    /// Blocking, error-propagating variant for callers that need to know
    /// issuance actually succeeded before proceeding — boot (so the proxy
    /// never comes up silently serving the self-signed fallback) and a
    /// single freshly redeployed app's domain group.
    pub async fn refresh_sync(&self, groups: &[DomainGroupKey]) -> anyhow::Result<()> {
        for group in groups {
            self.ensure_certificate(group).await?;
        }
        Ok(())
    }

    /// Debounced, fire-and-forget hook for the reconciler's routine pass:
    /// call on every label change, the actual issuance batch runs once
    /// activity settles.
    pub async fn refresh(self: &Arc<Self>, groups: Vec<DomainGroupKey>) {
        let this = self.clone();
        self.refresh_debounce
            .trigger("cert-refresh", move || async move {
                this.ensure_certificates(&groups).await;
            })
            .await;
    }

    /// Evicts certificates that have already expired, so a renewal that
    /// never succeeded doesn't leave a permanently-stale cert served to
    /// clients forever. Called from the reconciler's periodic pass.
    pub fn cleanup_expired(&self) {
        for domain in self.loader.expired_domains() {
            warn!(domain = %domain, "evicting expired certificate");
            self.loader.evict(&domain);
        }
    }

    /// Issues or reuses a certificate for one domain group. A group is
    /// considered fresh only if it isn't close to expiry *and* its
    /// installed cert's SAN set and staging/production origin still match
    /// what's expected — an alias added to the group or a staging→
    /// production flip must force reissuance even though the old cert has
    /// plenty of time left on it.
    async fn ensure_certificate(&self, group: &DomainGroupKey) -> anyhow::Result<()> {
        if self.loader.has_fresh_cert(&group.canonical, self.renewal_window)
            && self.loader.matches(&group.canonical, &group.all, self.staging)
        {
            return Ok(());
        }

        let reachable = self.preflight_dns(&group.all).await;
        if reachable.is_empty() {
            warn!(canonical = %group.canonical, "no domains in group passed DNS preflight, skipping issuance");
            return Ok(());
        }
        if reachable.len() < group.all.len() {
            let skipped: HashSet<_> = group.all.iter().filter(|d| !reachable.contains(*d)).collect();
            warn!(canonical = %group.canonical, ?skipped, "some domains failed DNS preflight and are excluded from the cert");
        }

        let result = self.acme.request_certificate(&reachable).await?;
        self.acme.save_certificate(&result).await?;
        // Installed under every reachable domain, not just the canonical —
        // otherwise an alias ClientHello falls through to the self-signed
        // default and the browser rejects the mismatch.
        self.loader.install_pem_for_domains(&reachable, &result.certificate_chain_pem, &result.private_key_pem)?;
        info!(canonical = %group.canonical, "issued and loaded certificate");
        Ok(())
    }

    /// Confirms each domain's A/AAAA record resolves before requesting a
    /// cert for it; ACME's own HTTP-01 validation would fail anyway on an
    /// unrouted domain, but failing fast here avoids burning a rate-limited
    /// order on a typo.
    async fn preflight_dns(&self, domains: &[String]) -> Vec<String> {
        let mut ok = Vec::with_capacity(domains.len());
        for domain in domains {
            match tokio::net::lookup_host((domain.as_str(), 0)).await {
                Ok(mut addrs) if addrs.next().is_some() => ok.push(domain.clone()),
                _ => warn!(domain = %domain, "DNS preflight failed, domain will not be included in the cert"),
            }
        }
        ok
    }
}
