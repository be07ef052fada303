//! Core posting model and dedup-key rules for jobtrawl.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

pub const CRATE_NAME: &str = "jobtrawl-core";

/// A single textual attribute of a posting.
///
/// `Unavailable` is the explicit "field unavailable" marker. It is persisted as
/// SQL `NULL` and serialized as JSON `null`, so it never collides with a present
/// empty string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "Option<String>", into = "Option<String>")]
pub enum FieldValue {
    Present(String),
    #[default]
    Unavailable,
}

impl FieldValue {
    pub fn present(value: impl Into<String>) -> Self {
        Self::Present(value.into())
    }

    pub fn is_present(&self) -> bool {
        matches!(self, Self::Present(_))
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable)
    }

    pub fn as_deref(&self) -> Option<&str> {
        match self {
            Self::Present(value) => Some(value.as_str()),
            Self::Unavailable => None,
        }
    }

    /// Keeps `self` when present, otherwise falls back to `other`.
    pub fn or(self, other: FieldValue) -> FieldValue {
        if self.is_present() {
            self
        } else {
            other
        }
    }
}

impl From<Option<String>> for FieldValue {
    fn from(value: Option<String>) -> Self {
        match value {
            Some(value) => Self::Present(value),
            None => Self::Unavailable,
        }
    }
}

impl From<FieldValue> for Option<String> {
    fn from(value: FieldValue) -> Self {
        match value {
            FieldValue::Present(value) => Some(value),
            FieldValue::Unavailable => None,
        }
    }
}

/// Store-assigned surrogate key. Never changes after creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PostingId(pub i64);

impl PostingId {
    /// Cursor value that sorts before every stored id.
    pub const START: PostingId = PostingId(0);

    pub fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for PostingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Descriptive attributes of a posting, named after their persisted columns.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PostingFields {
    #[serde(rename = "job_title")]
    pub title: FieldValue,
    #[serde(rename = "job_link")]
    pub link: FieldValue,
    pub company_name: FieldValue,
    pub company_link: FieldValue,
    #[serde(rename = "job_source")]
    pub source_name: FieldValue,
    #[serde(rename = "job_location")]
    pub location: FieldValue,
    pub salary: FieldValue,
    #[serde(rename = "job_type")]
    pub employment_type: FieldValue,
    #[serde(rename = "job_description")]
    pub description: FieldValue,
    #[serde(rename = "job_posted_date")]
    pub posted_date: FieldValue,
}

impl PostingFields {
    /// Every textual column in persisted order, paired with its column name.
    pub fn columns(&self) -> [(&'static str, &FieldValue); 10] {
        [
            ("job_title", &self.title),
            ("job_link", &self.link),
            ("company_name", &self.company_name),
            ("company_link", &self.company_link),
            ("job_source", &self.source_name),
            ("job_location", &self.location),
            ("salary", &self.salary),
            ("job_type", &self.employment_type),
            ("job_description", &self.description),
            ("job_posted_date", &self.posted_date),
        ]
    }

    pub fn detail(&self) -> DetailFields {
        DetailFields {
            description: self.description.clone(),
            employment_type: self.employment_type.clone(),
            salary: self.salary.clone(),
        }
    }

    pub fn missing_count(&self) -> usize {
        self.columns().iter().filter(|(_, v)| v.is_unavailable()).count()
    }
}

/// Fields that are only reliably available on a posting's detail page.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DetailFields {
    pub description: FieldValue,
    pub employment_type: FieldValue,
    pub salary: FieldValue,
}

impl DetailFields {
    pub fn is_empty(&self) -> bool {
        self.description.is_unavailable()
            && self.employment_type.is_unavailable()
            && self.salary.is_unavailable()
    }

    pub fn is_complete(&self) -> bool {
        self.description.is_present() && self.employment_type.is_present() && self.salary.is_present()
    }
}

/// Persisted posting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Posting {
    pub id: PostingId,
    #[serde(flatten)]
    pub fields: PostingFields,
    pub dedup_key: DedupKey,
    pub created_at: DateTime<Utc>,
    pub enriched_at: Option<DateTime<Utc>>,
}

impl Posting {
    pub fn is_enriched(&self) -> bool {
        self.enriched_at.is_some()
    }
}

/// A posting that has not been stored yet, keyed for insert-if-absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPosting {
    pub dedup_key: DedupKey,
    pub fields: PostingFields,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DedupKey(String);

impl DedupKey {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which attributes decide whether an extracted posting already exists.
///
/// `Title` reproduces the historical behavior and is known to merge distinct
/// postings that share a title across companies. `Link` is the default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupStrategy {
    #[default]
    Link,
    Title,
    TitleCompany,
}

impl DedupStrategy {
    /// Derives the dedup key, or `None` when the required attributes are unavailable.
    ///
    /// `Link` falls back to `TitleCompany` for cards without a usable link.
    pub fn key_for(&self, fields: &PostingFields) -> Option<DedupKey> {
        match self {
            DedupStrategy::Link => fields
                .link
                .as_deref()
                .and_then(normalize_link)
                .map(|link| DedupKey::new(format!("link:{link}")))
                .or_else(|| DedupStrategy::TitleCompany.key_for(fields)),
            DedupStrategy::Title => {
                let title = fields.title.as_deref().map(normalize_key_fragment)?;
                (!title.is_empty()).then(|| DedupKey::new(format!("title:{title}")))
            }
            DedupStrategy::TitleCompany => {
                let title = fields.title.as_deref().map(normalize_key_fragment)?;
                if title.is_empty() {
                    return None;
                }
                let company = fields
                    .company_name
                    .as_deref()
                    .map(normalize_key_fragment)
                    .unwrap_or_default();
                Some(DedupKey::new(format!("title_company:{title}|{company}")))
            }
        }
    }
}

impl FromStr for DedupStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "link" => Ok(Self::Link),
            "title" => Ok(Self::Title),
            "title_company" | "title+company" | "title-company" => Ok(Self::TitleCompany),
            other => Err(format!("unknown dedup strategy `{other}` (expected link, title or title_company)")),
        }
    }
}

/// Collapses internal whitespace runs to single spaces and trims both ends.
pub fn collapse_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Lowercases and collapses whitespace. Alphanumerics survive, as do `+` and
/// `#` anywhere and `.` when it leads into a word, so `C++`, `C#` and `.NET`
/// keep distinct keys. Other punctuation separates words.
pub fn normalize_key_fragment(input: &str) -> String {
    let chars: Vec<char> = input.to_lowercase().chars().collect();
    let kept: String = chars
        .iter()
        .enumerate()
        .map(|(i, &c)| {
            let keep = c.is_alphanumeric()
                || c == '+'
                || c == '#'
                || (c == '.' && chars.get(i + 1).is_some_and(|next| next.is_alphanumeric()));
            if keep {
                c
            } else {
                ' '
            }
        })
        .collect();
    collapse_whitespace(&kept)
}

/// Query parameters that change between renders of the same posting.
const TRACKING_PARAMS: &[&str] = &[
    "trk",
    "trkinfo",
    "refid",
    "trackingid",
    "position",
    "pagenum",
    "original_referer",
    "currentjobid",
    "ebp",
    "fbclid",
    "gclid",
];

fn is_tracking_param(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    name.starts_with("utm_") || TRACKING_PARAMS.contains(&name.as_str())
}

/// Canonical form of a posting link. The fragment and tracking parameters are
/// dropped, the remaining query pairs are sorted and trailing slashes are
/// trimmed from the path. Scheme and host are case-folded, the path is not.
pub fn normalize_link(link: &str) -> Option<String> {
    let link = link.trim();
    let Ok(mut url) = Url::parse(link) else {
        // Relative links never reach the store; trim them and move on.
        let link = link.split('#').next().unwrap_or_default().trim_end_matches('/');
        return (!link.is_empty()).then(|| link.to_string());
    };

    url.set_fragment(None);
    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(name, _)| !is_tracking_param(name))
        .map(|(name, value)| (name.into_owned(), value.into_owned()))
        .collect();
    pairs.sort();
    url.set_query(None);
    if !pairs.is_empty() {
        url.query_pairs_mut().extend_pairs(&pairs);
    }

    let path = url.path().trim_end_matches('/').to_string();
    url.set_path(&path);
    Some(url.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn card(title: &str, company: &str, link: Option<&str>) -> PostingFields {
        PostingFields {
            title: FieldValue::present(title),
            company_name: FieldValue::present(company),
            link: link.map(ToString::to_string).into(),
            ..PostingFields::default()
        }
    }

    #[test]
    fn sentinel_is_distinct_from_empty_string() {
        let empty = FieldValue::present("");
        assert!(empty.is_present());
        assert_ne!(empty, FieldValue::Unavailable);

        let json = serde_json::to_value(&PostingFields {
            title: FieldValue::present(""),
            ..PostingFields::default()
        })
        .unwrap();
        assert_eq!(json["job_title"], serde_json::json!(""));
        assert_eq!(json["salary"], serde_json::Value::Null);
    }

    #[test]
    fn missing_json_keys_deserialize_as_unavailable() {
        let fields: PostingFields =
            serde_json::from_str(r#"{"job_title":"Rust Engineer","salary":null}"#).unwrap();
        assert_eq!(fields.title.as_deref(), Some("Rust Engineer"));
        assert!(fields.salary.is_unavailable());
        assert!(fields.description.is_unavailable());
        assert_eq!(fields.missing_count(), 9);
    }

    #[test]
    fn link_key_ignores_tracking_parameters() {
        let a = card(
            "Backend Developer",
            "Acme",
            Some("https://www.linkedin.com/jobs/view/backend-developer-at-acme-4023652314?refId=abc&trackingId=xyz"),
        );
        let b = card(
            "Backend Developer",
            "Acme",
            Some("https://www.linkedin.com/jobs/view/backend-developer-at-acme-4023652314/?refId=def"),
        );
        assert_eq!(DedupStrategy::Link.key_for(&a), DedupStrategy::Link.key_for(&b));
    }

    #[test]
    fn link_key_keeps_ids_carried_in_the_query_string() {
        let a = card("Rust Engineer", "Acme", Some("https://boards.example.com/viewjob?jk=aaa111&utm_source=feed"));
        let b = card("Rust Engineer", "Acme", Some("https://boards.example.com/viewjob?jk=bbb222"));
        let a_key = DedupStrategy::Link.key_for(&a).unwrap();
        assert_ne!(Some(a_key.clone()), DedupStrategy::Link.key_for(&b));
        assert_eq!(a_key.as_str(), "link:https://boards.example.com/viewjob?jk=aaa111");
    }

    #[test]
    fn link_normalization_sorts_query_and_keeps_path_case() {
        assert_eq!(
            normalize_link("HTTPS://Boards.Example.com/Jobs/AbC/?b=2&trk=x&a=1#apply").as_deref(),
            Some("https://boards.example.com/Jobs/AbC?a=1&b=2")
        );
        assert_eq!(normalize_link("  ").as_deref(), None);
        assert_eq!(normalize_link("/jobs/7/#top").as_deref(), Some("/jobs/7"));
    }

    #[test]
    fn link_key_keeps_same_title_at_different_companies_apart() {
        let a = card("React Developer", "Acme", Some("https://example.com/jobs/1"));
        let b = card("React Developer", "Globex", Some("https://example.com/jobs/2"));
        assert_ne!(DedupStrategy::Link.key_for(&a), DedupStrategy::Link.key_for(&b));
    }

    #[test]
    fn title_key_merges_same_title_at_different_companies() {
        // Known weakness of title-only dedup: distinct postings collapse into one key.
        let a = card("React Developer", "Acme", Some("https://example.com/jobs/1"));
        let b = card("React  developer", "Globex", Some("https://example.com/jobs/2"));
        assert_eq!(DedupStrategy::Title.key_for(&a), DedupStrategy::Title.key_for(&b));
    }

    #[test]
    fn title_company_key_separates_companies() {
        let a = card("React Developer", "Acme", None);
        let b = card("React Developer", "Globex", None);
        let c = card("react developer", "ACME", None);
        let strategy = DedupStrategy::TitleCompany;
        assert_ne!(strategy.key_for(&a), strategy.key_for(&b));
        assert_eq!(strategy.key_for(&a), strategy.key_for(&c));
    }

    #[test]
    fn title_key_keeps_language_punctuation() {
        let plus = card("C++ Developer", "Acme", None);
        let sharp = card("C# Developer", "Acme", None);
        let plain = card("C Developer", "Acme", None);
        let strategy = DedupStrategy::TitleCompany;
        assert_ne!(strategy.key_for(&plus), strategy.key_for(&sharp));
        assert_ne!(strategy.key_for(&plus), strategy.key_for(&plain));
        assert_ne!(strategy.key_for(&sharp), strategy.key_for(&plain));
        assert_eq!(normalize_key_fragment(".NET Engineer (Sr.)"), ".net engineer sr");
    }

    #[test]
    fn link_key_falls_back_to_title_company_without_link() {
        let fields = card("Data Engineer", "Initech", None);
        let key = DedupStrategy::Link.key_for(&fields).unwrap();
        assert_eq!(key.as_str(), "title_company:data engineer|initech");
    }

    #[test]
    fn key_is_absent_without_title_or_link() {
        let fields = PostingFields::default();
        assert!(DedupStrategy::Link.key_for(&fields).is_none());
        assert!(DedupStrategy::Title.key_for(&fields).is_none());
    }

    #[test]
    fn strategy_parses_from_config_strings() {
        assert_eq!("LINK".parse::<DedupStrategy>().unwrap(), DedupStrategy::Link);
        assert_eq!("title+company".parse::<DedupStrategy>().unwrap(), DedupStrategy::TitleCompany);
        assert!("company".parse::<DedupStrategy>().is_err());
    }

    #[test]
    fn whitespace_collapses_and_trims() {
        assert_eq!(collapse_whitespace("  Senior\n\t Rust   Engineer  "), "Senior Rust Engineer");
        assert_eq!(collapse_whitespace(" \n "), "");
    }
}
