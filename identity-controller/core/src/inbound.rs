use crate::Issuer;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::fmt;

/// The validation rules an inbound request's bearer token must satisfy.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundRules {
    pub issuer: Issuer,
    pub audience: String,
    #[serde(default, skip_serializing_if = "ScopeSet::is_empty")]
    pub required_scopes: ScopeSet,
}

/// An ordered set of OAuth scope names.
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct ScopeSet(BTreeSet<String>);

/// Claims extracted from a bearer token, independent of how the token's
/// signature was verified.
#[derive(Clone, Debug, Default, serde::Deserialize)]
pub struct TokenClaims {
    #[serde(rename = "iss", default)]
    pub issuer: String,

    #[serde(rename = "sub", default)]
    pub subject: String,

    #[serde(rename = "aud", default, deserialize_with = "one_or_many")]
    pub audience: Vec<String>,

    #[serde(rename = "scope", default, deserialize_with = "scope_claim")]
    pub scopes: ScopeSet,
}

/// The outcome of checking a token against the active rules.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny(DenyReason),
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum DenyReason {
    #[error("issuer {found:?} does not match {expected:?}")]
    IssuerMismatch { expected: String, found: String },

    #[error("audience {expected:?} not present in token")]
    AudienceMismatch { expected: String },

    #[error("token is missing required scopes: {}", .0.join(", "))]
    InsufficientScope(Vec<String>),
}

// === impl InboundRules ===

impl InboundRules {
    pub fn check(&self, claims: &TokenClaims) -> Decision {
        if claims.issuer != self.issuer.as_str() {
            return Decision::Deny(DenyReason::IssuerMismatch {
                expected: self.issuer.to_string(),
                found: claims.issuer.clone(),
            });
        }

        if !claims.audience.iter().any(|a| *a == self.audience) {
            return Decision::Deny(DenyReason::AudienceMismatch {
                expected: self.audience.clone(),
            });
        }

        let missing = self
            .required_scopes
            .iter()
            .filter(|s| !claims.scopes.contains(s))
            .cloned()
            .collect::<Vec<_>>();
        if !missing.is_empty() {
            return Decision::Deny(DenyReason::InsufficientScope(missing));
        }

        Decision::Allow
    }
}

// === impl ScopeSet ===

impl ScopeSet {
    /// Parses the space-delimited `scope` claim of an access token.
    pub fn from_claim(claim: &str) -> Self {
        claim
            .split_whitespace()
            .map(|s| s.to_string())
            .collect::<BTreeSet<_>>()
            .into()
    }

    pub fn contains(&self, scope: &str) -> bool {
        self.0.contains(scope)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.0.iter()
    }
}

impl From<BTreeSet<String>> for ScopeSet {
    fn from(scopes: BTreeSet<String>) -> Self {
        Self(scopes)
    }
}

impl FromIterator<String> for ScopeSet {
    fn from_iter<T: IntoIterator<Item = String>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> FromIterator<&'a str> for ScopeSet {
    fn from_iter<T: IntoIterator<Item = &'a str>>(iter: T) -> Self {
        Self(iter.into_iter().map(|s| s.to_string()).collect())
    }
}

impl fmt::Display for ScopeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for scope in &self.0 {
            if !first {
                f.write_str(" ")?;
            }
            first = false;
            f.write_str(scope)?;
        }
        Ok(())
    }
}

// The `aud` claim may be a single string or an array of strings.
fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(serde::Deserialize)]
    #[serde(untagged)]
    enum Aud {
        One(String),
        Many(Vec<String>),
    }

    Ok(match Aud::deserialize(deserializer)? {
        Aud::One(aud) => vec![aud],
        Aud::Many(auds) => auds,
    })
}

fn scope_claim<'de, D>(deserializer: D) -> Result<ScopeSet, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let claim = String::deserialize(deserializer)?;
    Ok(ScopeSet::from_claim(&claim))
}
