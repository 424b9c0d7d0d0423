//! Secret handling utilities.
//!
//! Re-exports secrecy types and provides helpers for mentioning secrets in
//! logs without exposing them.

pub use secrecy::{ExposeSecret, SecretString};

/// A connection URL with any password replaced by `***`, for logging.
pub fn redact_url(url: &SecretString) -> String {
    let raw = url.expose_secret();
    let Some((scheme, rest)) = raw.split_once("://") else {
        return "***".to_string();
    };
    match rest.rsplit_once('@') {
        Some((userinfo, host)) => {
            let user = userinfo.split_once(':').map_or(userinfo, |(user, _)| user);
            format!("{scheme}://{user}:***@{host}")
        }
        None => raw.to_string(),
    }
}
