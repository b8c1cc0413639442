use std::fmt;

/// Matches a destination host, either exactly or by DNS suffix.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum HostMatch {
    Exact(String),
    /// Matches any host ending in `.{suffix}`. Written as `*.{suffix}`.
    Suffix(String),
}

#[derive(Debug, thiserror::Error)]
#[error("invalid host pattern {0:?}: {1}")]
pub struct InvalidHostMatch(String, &'static str);

/// Matches an intercepted connection's destination.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DestinationMatch {
    pub host: HostMatch,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

/// The audience and scopes to request when exchanging a token for a matched
/// destination.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeTarget {
    pub audience: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scopes: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeRule {
    #[serde(rename = "match")]
    pub destination: DestinationMatch,
    #[serde(flatten)]
    pub target: ExchangeTarget,
}

/// The ordered outbound exchange rule list with its default fallback.
///
/// Rules are evaluated in list order and the first match wins, even when a
/// later rule would also match (or would match more specifically).
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeRules {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    rules: Vec<ExchangeRule>,
    default: ExchangeTarget,
}

// === impl HostMatch ===

impl HostMatch {
    pub fn matches(&self, host: &str) -> bool {
        match self {
            Self::Exact(h) => h.eq_ignore_ascii_case(host),
            Self::Suffix(suffix) => {
                let host = host.trim_end_matches('.');
                host.len() > suffix.len() + 1
                    && host
                        .get(host.len() - suffix.len() - 1..)
                        .is_some_and(|tail| {
                            tail.as_bytes()[0] == b'.'
                                && tail[1..].eq_ignore_ascii_case(suffix)
                        })
            }
        }
    }
}

impl std::str::FromStr for HostMatch {
    type Err = InvalidHostMatch;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(InvalidHostMatch(s.to_string(), "must not be empty"));
        }
        if let Some(suffix) = s.strip_prefix("*.") {
            if suffix.is_empty() || suffix.contains('*') {
                return Err(InvalidHostMatch(
                    s.to_string(),
                    "wildcard must be a leading `*.` followed by a host suffix",
                ));
            }
            return Ok(Self::Suffix(suffix.to_string()));
        }
        if s.contains('*') {
            return Err(InvalidHostMatch(
                s.to_string(),
                "wildcards are only supported as a leading `*.`",
            ));
        }
        Ok(Self::Exact(s.to_string()))
    }
}

impl fmt::Display for HostMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(h) => h.fmt(f),
            Self::Suffix(suffix) => write!(f, "*.{suffix}"),
        }
    }
}

impl serde::Serialize for HostMatch {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for HostMatch {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = <String as serde::Deserialize<'_>>::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// === impl DestinationMatch ===

impl DestinationMatch {
    pub fn matches(&self, host: &str, port: u16) -> bool {
        if let Some(p) = self.port {
            if p != port {
                return false;
            }
        }
        self.host.matches(host)
    }
}

// === impl ExchangeRules ===

impl ExchangeRules {
    pub fn new(rules: Vec<ExchangeRule>, default: ExchangeTarget) -> Self {
        Self { rules, default }
    }

    pub fn rules(&self) -> &[ExchangeRule] {
        &self.rules
    }

    pub fn default_target(&self) -> &ExchangeTarget {
        &self.default
    }

    /// Resolves the exchange target for a destination. The first listed rule
    /// that matches wins; the default applies when none match.
    pub fn resolve(&self, host: &str, port: u16) -> &ExchangeTarget {
        self.rules
            .iter()
            .find(|r| r.destination.matches(host, port))
            .map(|r| &r.target)
            .unwrap_or(&self.default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(host: &str, port: Option<u16>, audience: &str) -> ExchangeRule {
        ExchangeRule {
            destination: DestinationMatch {
                host: host.parse().unwrap(),
                port,
            },
            target: ExchangeTarget {
                audience: audience.to_string(),
                scopes: vec![],
            },
        }
    }

    fn default_target() -> ExchangeTarget {
        ExchangeTarget {
            audience: "default".to_string(),
            scopes: vec![],
        }
    }

    #[test]
    fn exact_and_suffix_matching() {
        let m = "api.example.com".parse::<HostMatch>().unwrap();
        assert!(m.matches("api.example.com"));
        assert!(m.matches("API.EXAMPLE.COM"));
        assert!(!m.matches("www.example.com"));

        let m = "*.example.com".parse::<HostMatch>().unwrap();
        assert!(m.matches("api.example.com"));
        assert!(m.matches("a.b.example.com"));
        assert!(!m.matches("example.com"), "suffix must not match the apex");
        assert!(!m.matches("notexample.com"));
    }

    #[test]
    fn rejects_malformed_patterns() {
        for p in ["", "*.", "a.*.b", "api.*"] {
            assert!(p.parse::<HostMatch>().is_err(), "{p} should not parse");
        }
    }

    #[test]
    fn port_narrows_a_match() {
        let d = DestinationMatch {
            host: "api.example.com".parse().unwrap(),
            port: Some(443),
        };
        assert!(d.matches("api.example.com", 443));
        assert!(!d.matches("api.example.com", 8443));
    }

    #[test]
    fn first_listed_rule_wins() {
        // Two rules that both match the same destination: the list order
        // decides, for either ordering.
        let a = rule("api.example.com", None, "x");
        let b = rule("*.example.com", None, "y");

        let rules = ExchangeRules::new(vec![a.clone(), b.clone()], default_target());
        assert_eq!(rules.resolve("api.example.com", 443).audience, "x");

        let rules = ExchangeRules::new(vec![b, a], default_target());
        assert_eq!(rules.resolve("api.example.com", 443).audience, "y");
    }

    #[test]
    fn equally_specific_rules_use_list_order() {
        let a = rule("api.example.com", None, "x");
        let b = rule("api.example.com", None, "y");
        let rules = ExchangeRules::new(vec![a, b], default_target());
        assert_eq!(rules.resolve("api.example.com", 80).audience, "x");
    }

    #[test]
    fn unmatched_destination_falls_back_to_default() {
        let rules = ExchangeRules::new(vec![rule("api.example.com", None, "x")], default_target());
        assert_eq!(rules.resolve("other.example.org", 443).audience, "default");
    }

    #[test]
    fn wire_format_round_trips_ordered() {
        let rules = ExchangeRules::new(
            vec![
                rule("api.example.com", Some(443), "x"),
                rule("*.example.com", None, "y"),
            ],
            default_target(),
        );
        let json = serde_json::to_string(&rules).unwrap();
        let parsed: ExchangeRules = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, rules);
        assert_eq!(parsed.rules()[0].target.audience, "x");
    }
}
