//! Label schema (C2): the metadata a deployer attaches to each app
//! container. Parsing never panics — a malformed or missing field produces
//! a [`LabelError`] naming the field, and the caller (the deployment
//! manager) excludes the container rather than crashing.

use std::collections::HashMap;
use std::fmt;

pub const LABEL_APP: &str = "app";
pub const LABEL_DEPLOYMENT_ID: &str = "deployment_id";
pub const LABEL_PORT: &str = "port";
pub const LABEL_HEALTH_PATH: &str = "health_path";
pub const LABEL_DOMAINS: &str = "domains";
pub const LABEL_ACME_EMAIL: &str = "acme_email";

/// One `{canonical, aliases[]}` domain group. A container may declare
/// several, separated by `;`; within a group the canonical comes first and
/// aliases follow separated by `,` (`x.test,www.x.test;api.test`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainGroup {
    pub canonical: String,
    pub aliases: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Labels {
    pub app: String,
    pub deployment_id: String,
    pub port: String,
    pub health_path: String,
    pub domains: Vec<DomainGroup>,
    pub acme_email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelError {
    pub field: &'static str,
    pub reason: String,
}

impl fmt::Display for LabelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "label {:?}: {}", self.field, self.reason)
    }
}

impl std::error::Error for LabelError {}

impl Labels {
    /// Parse the label schema out of a container's raw label map.
    pub fn parse(raw: &HashMap<String, String>) -> Result<Labels, LabelError> {
        let app = non_empty(raw, LABEL_APP)?;
        let deployment_id = non_empty(raw, LABEL_DEPLOYMENT_ID)?;
        let port = non_empty(raw, LABEL_PORT)?;
        if port.parse::<u16>().is_err() {
            return Err(LabelError {
                field: LABEL_PORT,
                reason: format!("{port:?} is not a valid port number"),
            });
        }

        let health_path = non_empty(raw, LABEL_HEALTH_PATH)?;
        if !health_path.starts_with('/') {
            return Err(LabelError {
                field: LABEL_HEALTH_PATH,
                reason: format!("{health_path:?} is not an absolute path"),
            });
        }

        let domains_raw = non_empty(raw, LABEL_DOMAINS)?;
        let domains = parse_domains(&domains_raw)?;

        let acme_email = raw.get(LABEL_ACME_EMAIL).filter(|s| !s.is_empty()).cloned();

        Ok(Labels {
            app,
            deployment_id,
            port,
            health_path,
            domains,
            acme_email,
        })
    }

    /// All canonical + alias domains this container declares, lowercased.
    pub fn all_domains(&self) -> Vec<String> {
        let mut out = Vec::new();
        for group in &self.domains {
            out.push(group.canonical.to_lowercase());
            out.extend(group.aliases.iter().map(|a| a.to_lowercase()));
        }
        out
    }

    /// Whether `port` appears among a container's exposed ports. If the
    /// container declares no exposed ports at all, the label is trusted
    /// (the health check will catch a real mismatch) per spec §4.2.
    pub fn port_matches(&self, exposed: &[u16]) -> bool {
        if exposed.is_empty() {
            return true;
        }
        self.port
            .parse::<u16>()
            .map(|p| exposed.contains(&p))
            .unwrap_or(false)
    }
}

fn non_empty(raw: &HashMap<String, String>, field: &'static str) -> Result<String, LabelError> {
    match raw.get(field) {
        Some(v) if !v.trim().is_empty() => Ok(v.clone()),
        Some(_) => Err(LabelError {
            field,
            reason: "present but empty".to_string(),
        }),
        None => Err(LabelError {
            field,
            reason: "missing".to_string(),
        }),
    }
}

fn parse_domains(raw: &str) -> Result<Vec<DomainGroup>, LabelError> {
    let mut groups = Vec::new();
    for group_str in raw.split(';').map(str::trim).filter(|s| !s.is_empty()) {
        let mut parts = group_str.split(',').map(str::trim).filter(|s| !s.is_empty());
        let canonical = parts.next().ok_or_else(|| LabelError {
            field: LABEL_DOMAINS,
            reason: format!("group {group_str:?} has no canonical domain"),
        })?;
        let aliases = parts.map(String::from).collect();
        groups.push(DomainGroup {
            canonical: canonical.to_string(),
            aliases,
        });
    }
    if groups.is_empty() {
        return Err(LabelError {
            field: LABEL_DOMAINS,
            reason: "no domain groups configured".to_string(),
        });
    }
    Ok(groups)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_labels() -> HashMap<String, String> {
        let mut m = HashMap::new();
        m.insert(LABEL_APP.to_string(), "web".to_string());
        m.insert(LABEL_DEPLOYMENT_ID.to_string(), "20240102030405".to_string());
        m.insert(LABEL_PORT.to_string(), "8080".to_string());
        m.insert(LABEL_HEALTH_PATH.to_string(), "/healthz".to_string());
        m.insert(LABEL_DOMAINS.to_string(), "x.test,y.test".to_string());
        m
    }

    #[test]
    fn parses_well_formed_labels() {
        let labels = Labels::parse(&base_labels()).unwrap();
        assert_eq!(labels.app, "web");
        assert_eq!(labels.domains.len(), 1);
        assert_eq!(labels.domains[0].canonical, "x.test");
        assert_eq!(labels.domains[0].aliases, vec!["y.test".to_string()]);
        assert!(labels.acme_email.is_none());
    }

    #[test]
    fn parses_multiple_domain_groups() {
        let mut raw = base_labels();
        raw.insert(LABEL_DOMAINS.to_string(), "x.test,y.test;api.test".to_string());
        let labels = Labels::parse(&raw).unwrap();
        assert_eq!(labels.domains.len(), 2);
        assert_eq!(labels.domains[1].canonical, "api.test");
        assert!(labels.domains[1].aliases.is_empty());
    }

    #[test]
    fn rejects_missing_field() {
        let mut raw = base_labels();
        raw.remove(LABEL_APP);
        let err = Labels::parse(&raw).unwrap_err();
        assert_eq!(err.field, LABEL_APP);
    }

    #[test]
    fn rejects_non_numeric_port() {
        let mut raw = base_labels();
        raw.insert(LABEL_PORT.to_string(), "not-a-port".to_string());
        let err = Labels::parse(&raw).unwrap_err();
        assert_eq!(err.field, LABEL_PORT);
    }

    #[test]
    fn rejects_relative_health_path() {
        let mut raw = base_labels();
        raw.insert(LABEL_HEALTH_PATH.to_string(), "healthz".to_string());
        let err = Labels::parse(&raw).unwrap_err();
        assert_eq!(err.field, LABEL_HEALTH_PATH);
    }

    #[test]
    fn port_label_trusted_when_no_ports_exposed() {
        let labels = Labels::parse(&base_labels()).unwrap();
        assert!(labels.port_matches(&[]));
        assert!(labels.port_matches(&[8080]));
        assert!(!labels.port_matches(&[9090]));
    }
}
