#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod bundle;
mod identity;
pub mod inbound;
pub mod outbound;

pub use self::identity::{spiffe_id, InvalidIssuer, InvalidTrustDomain, Issuer, TrustDomain};
pub use ipnet::{IpNet, Ipv4Net, Ipv6Net};

pub const CONTROLLER_NAME: &str = "workloadidentity.io/identity-controller";
