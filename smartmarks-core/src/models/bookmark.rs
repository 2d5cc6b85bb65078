use chrono::{DateTime, Utc};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::validate::{normalize_url, ValidationError};

/// A bookmark row as stored by the hosted database.
///
/// `id` and `created_at` are assigned by the store when the row is inserted
/// and never change afterwards. The owner is serialized as `user_id` to match
/// the table's column name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bookmark {
    pub id: String,
    #[serde(rename = "user_id")]
    pub owner_id: String,
    pub title: String,
    pub url: String,
    pub created_at: DateTime<Utc>,
}

impl Bookmark {
    /// Host part of the URL without a leading `www.`, or the raw URL when it
    /// does not parse.
    pub fn domain(&self) -> String {
        Url::parse(&self.url)
            .ok()
            .and_then(|url| url.host_str().map(str::to_owned))
            .map(|host| match host.strip_prefix("www.") {
                Some(rest) => rest.to_string(),
                None => host,
            })
            .unwrap_or_else(|| self.url.clone())
    }
}

impl fmt::Display for Bookmark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.title)?;
        writeln!(f, "  {}", self.url)?;
        write!(
            f,
            "  {} · {}",
            self.domain(),
            self.created_at.format("%b %-d, %Y")
        )
    }
}

/// Insert payload sent to the store. The store fills in `id` and `created_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewBookmark {
    pub title: String,
    pub url: String,
    #[serde(rename = "user_id")]
    pub owner_id: String,
}

/// Raw user input for a new bookmark, before trimming and URL normalization.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BookmarkCandidate {
    pub title: String,
    pub url: String,
}

impl BookmarkCandidate {
    pub fn new(title: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            url: url.into(),
        }
    }

    /// Trims and normalizes the candidate into an insert payload for `owner_id`.
    ///
    /// The title is checked before the URL, so a candidate with both fields
    /// blank reports the missing title.
    pub fn validate(&self, owner_id: &str) -> Result<NewBookmark, ValidationError> {
        if owner_id.trim().is_empty() {
            return Err(ValidationError::MissingOwner);
        }

        let title = self.title.trim();
        if title.is_empty() {
            return Err(ValidationError::MissingTitle);
        }

        let url = normalize_url(&self.url)?;

        Ok(NewBookmark {
            title: title.to_string(),
            url,
            owner_id: owner_id.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn bookmark(url: &str) -> Bookmark {
        Bookmark {
            id: "b1".to_string(),
            owner_id: "user-1".to_string(),
            title: "Example".to_string(),
            url: url.to_string(),
            created_at: Utc.with_ymd_and_hms(2024, 3, 5, 12, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_domain_strips_www() {
        assert_eq!(bookmark("https://www.rust-lang.org/learn").domain(), "rust-lang.org");
        assert_eq!(bookmark("http://docs.rs").domain(), "docs.rs");
    }

    #[test]
    fn test_domain_falls_back_to_raw_url() {
        assert_eq!(bookmark("not a url").domain(), "not a url");
    }

    #[test]
    fn test_display() {
        let output = format!("{}", bookmark("https://www.example.com"));
        assert!(output.starts_with("Example\n"));
        assert!(output.contains("https://www.example.com"));
        assert!(output.contains("example.com · Mar 5, 2024"));
    }

    #[test]
    fn test_wire_names() {
        let json = serde_json::to_value(bookmark("https://example.com")).unwrap();
        assert_eq!(json["user_id"], "user-1");
        assert!(json.get("owner_id").is_none());

        let parsed: Bookmark = serde_json::from_str(
            r#"{"id":"7d1c","user_id":"u9","title":"T","url":"https://x.dev","created_at":"2024-01-02T03:04:05.123456+00:00"}"#,
        )
        .unwrap();
        assert_eq!(parsed.owner_id, "u9");
        assert_eq!(parsed.id, "7d1c");
    }

    #[test]
    fn test_candidate_trims_and_normalizes() {
        let new = BookmarkCandidate::new("  Example  ", " example.com ")
            .validate("user-1")
            .unwrap();
        assert_eq!(new.title, "Example");
        assert_eq!(new.url, "https://example.com");
        assert_eq!(new.owner_id, "user-1");
    }

    #[test]
    fn test_candidate_keeps_explicit_scheme() {
        let new = BookmarkCandidate::new("Ex", "http://example.com")
            .validate("user-1")
            .unwrap();
        assert_eq!(new.url, "http://example.com");
    }

    #[test]
    fn test_candidate_rejects_blank_fields() {
        assert_eq!(
            BookmarkCandidate::new("", "http://x.com").validate("user-1"),
            Err(ValidationError::MissingTitle)
        );
        assert_eq!(
            BookmarkCandidate::new("T", "   ").validate("user-1"),
            Err(ValidationError::MissingUrl)
        );
        assert_eq!(
            BookmarkCandidate::new("T", "x.com").validate(" "),
            Err(ValidationError::MissingOwner)
        );
    }
}
