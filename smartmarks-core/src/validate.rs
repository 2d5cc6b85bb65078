//! Local well-formedness checks for bookmark input.
//!
//! Everything here runs before a request reaches the store.

use reqwest::Url;
use thiserror::Error;

/// Scheme prepended to URLs entered without one.
pub const DEFAULT_SCHEME: &str = "https://";

const HTTP_SCHEMES: [&str; 2] = ["http://", "https://"];

/// Input rejected before any remote call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Please enter a title")]
    MissingTitle,

    #[error("Please enter a URL")]
    MissingUrl,

    #[error("Invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("No signed-in user")]
    MissingOwner,
}

/// Trims `raw`, prepends `https://` unless it already starts with `http://`
/// or `https://` (any case), and checks that the result parses.
///
/// The returned string is the normalized input itself, not the parser's
/// serialization, so `example.com` becomes `https://example.com` without a
/// trailing slash.
pub fn normalize_url(raw: &str) -> Result<String, ValidationError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::MissingUrl);
    }

    let normalized = if has_http_scheme(trimmed) {
        trimmed.to_string()
    } else {
        format!("{}{}", DEFAULT_SCHEME, trimmed)
    };

    Url::parse(&normalized).map_err(|e| ValidationError::InvalidUrl {
        url: normalized.clone(),
        reason: e.to_string(),
    })?;

    Ok(normalized)
}

fn has_http_scheme(url: &str) -> bool {
    HTTP_SCHEMES.iter().any(|scheme| {
        url.get(..scheme.len())
            .is_some_and(|prefix| prefix.eq_ignore_ascii_case(scheme))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_host_gets_https() {
        assert_eq!(normalize_url("example.com").unwrap(), "https://example.com");
        assert_eq!(
            normalize_url("example.com/path?q=1").unwrap(),
            "https://example.com/path?q=1"
        );
    }

    #[test]
    fn test_explicit_scheme_unchanged() {
        assert_eq!(normalize_url("http://example.com").unwrap(), "http://example.com");
        assert_eq!(normalize_url("https://example.com").unwrap(), "https://example.com");
    }

    #[test]
    fn test_scheme_check_is_case_insensitive() {
        assert_eq!(normalize_url("HTTPS://Example.com").unwrap(), "HTTPS://Example.com");
        assert_eq!(normalize_url("Http://example.com").unwrap(), "Http://example.com");
    }

    #[test]
    fn test_surrounding_whitespace_trimmed() {
        assert_eq!(normalize_url("  example.com \n").unwrap(), "https://example.com");
    }

    #[test]
    fn test_blank_is_missing() {
        assert_eq!(normalize_url(""), Err(ValidationError::MissingUrl));
        assert_eq!(normalize_url("   "), Err(ValidationError::MissingUrl));
    }

    #[test]
    fn test_malformed_after_normalization() {
        let err = normalize_url("exa mple.com").unwrap_err();
        assert!(matches!(err, ValidationError::InvalidUrl { ref url, .. } if url == "https://exa mple.com"));

        assert!(matches!(
            normalize_url("https://"),
            Err(ValidationError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn test_non_ascii_prefix_does_not_panic() {
        assert_eq!(normalize_url("ébc.fr").unwrap(), "https://ébc.fr");
    }
}
