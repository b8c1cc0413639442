use std::fmt;

/// A SPIFFE trust domain name.
///
/// Trust domains are bare DNS-like names: lowercase alphanumerics, dots,
/// dashes, and underscores, without a scheme, port, or path.
#[derive(Clone, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct TrustDomain(String);

#[derive(Debug, thiserror::Error)]
#[error("invalid trust domain {0:?}: {1}")]
pub struct InvalidTrustDomain(String, &'static str);

/// An OAuth token issuer, e.g. `https://keycloak.keycloak.svc/realms/master`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct Issuer(String);

#[derive(Debug, thiserror::Error)]
#[error("invalid issuer {0:?}: {1}")]
pub struct InvalidIssuer(String, &'static str);

/// Formats the SPIFFE ID the identity provider issues for a workload's
/// service account.
pub fn spiffe_id(trust_domain: &TrustDomain, ns: &str, sa: &str) -> String {
    format!("spiffe://{}/ns/{}/sa/{}", trust_domain, ns, sa)
}

// === impl TrustDomain ===

impl TrustDomain {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::str::FromStr for TrustDomain {
    type Err = InvalidTrustDomain;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(InvalidTrustDomain(s.to_string(), "must not be empty"));
        }
        if s.len() > 255 {
            return Err(InvalidTrustDomain(
                s.to_string(),
                "must not exceed 255 characters",
            ));
        }
        if s.contains("://") {
            return Err(InvalidTrustDomain(
                s.to_string(),
                "must not include a scheme",
            ));
        }
        if !s
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '-' | '_'))
        {
            return Err(InvalidTrustDomain(
                s.to_string(),
                "must be lowercase alphanumerics, dots, dashes, and underscores",
            ));
        }
        Ok(Self(s.to_string()))
    }
}

impl fmt::Display for TrustDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// === impl Issuer ===

impl Issuer {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::str::FromStr for Issuer {
    type Err = InvalidIssuer;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let uri = s
            .parse::<http::Uri>()
            .map_err(|_| InvalidIssuer(s.to_string(), "must be a valid URI"))?;
        match uri.scheme_str() {
            Some("http") | Some("https") => {}
            _ => {
                return Err(InvalidIssuer(
                    s.to_string(),
                    "must use an http or https scheme",
                ))
            }
        }
        if uri.authority().is_none() {
            return Err(InvalidIssuer(s.to_string(), "must include an authority"));
        }
        if uri.query().is_some() {
            return Err(InvalidIssuer(s.to_string(), "must not include a query"));
        }
        Ok(Self(s.trim_end_matches('/').to_string()))
    }
}

impl fmt::Display for Issuer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trust_domain_accepts_dns_names() {
        for td in ["cluster.local", "prod.example.org", "td_0"] {
            assert!(td.parse::<TrustDomain>().is_ok(), "{td} should parse");
        }
    }

    #[test]
    fn trust_domain_rejects_schemes_and_uppercase() {
        for td in ["", "spiffe://cluster.local", "Cluster.Local", "a b"] {
            assert!(td.parse::<TrustDomain>().is_err(), "{td} should not parse");
        }
    }

    #[test]
    fn issuer_requires_http_authority() {
        assert!("https://keycloak.keycloak.svc.cluster.local:8080/realms/master"
            .parse::<Issuer>()
            .is_ok());
        assert!("ftp://example.com".parse::<Issuer>().is_err());
        assert!("/realms/master".parse::<Issuer>().is_err());
        assert!("https://example.com/realms/x?y=1".parse::<Issuer>().is_err());
    }

    #[test]
    fn issuer_normalizes_trailing_slash() {
        let issuer = "http://idp.example.com/realms/agents/"
            .parse::<Issuer>()
            .unwrap();
        assert_eq!(issuer.as_str(), "http://idp.example.com/realms/agents");
    }

    #[test]
    fn spiffe_id_shape() {
        let td = "cluster.local".parse::<TrustDomain>().unwrap();
        assert_eq!(
            spiffe_id(&td, "agents", "math-agent"),
            "spiffe://cluster.local/ns/agents/sa/math-agent"
        );
    }
}
