//! Secret handling utilities.
//!
//! Re-exports secrecy types so callers outside `config` don't depend on
//! the crate directly.

pub use secrecy::{ExposeSecret, SecretString};

/// Render a connection URL for logs with any password replaced.
pub fn redact_url(url: &SecretString) -> String {
    let raw = url.expose_secret();
    let Some((scheme, rest)) = raw.split_once("://") else {
        return "<redacted>".to_string();
    };
    match rest.split_once('@') {
        Some((userinfo, host)) => {
            let user = userinfo.split(':').next().unwrap_or_default();
            format!("{scheme}://{user}:***@{host}")
        }
        None => raw.to_string(),
    }
}
