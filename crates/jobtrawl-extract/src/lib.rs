//! Schema-driven extraction of postings from rendered markup.
//!
//! Extraction never fails because an optional node is missing: every field is
//! looked up independently and falls back to [`FieldValue::Unavailable`]. The
//! only hard errors are bad schemas (caught at compile time) and input that is
//! not markup at all.

use std::fs;
use std::path::Path;

use anyhow::Context;
use jobtrawl_core::{collapse_whitespace, FieldValue, PostingFields};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use url::Url;

pub const CRATE_NAME: &str = "jobtrawl-extract";

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("invalid selector `{selector}` in schema {schema}: {message}")]
    InvalidSelector {
        schema: String,
        selector: String,
        message: String,
    },
    #[error("malformed markup: {0}")]
    Malformed(String),
}

/// How a single field is located inside a card.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldRule {
    pub selector: String,
    /// Attribute to read instead of the element's text.
    #[serde(default)]
    pub attr: Option<String>,
    #[serde(default)]
    pub labelled: Option<LabelledItem>,
}

/// Narrows a rule to the item whose heading reads `text`. Used where a page
/// renders several criteria with identical markup and only the heading tells
/// them apart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelledItem {
    /// Repeating element holding one heading and its value.
    pub item: String,
    pub heading: String,
    /// Compared case-insensitively after whitespace is collapsed.
    pub text: String,
}

impl FieldRule {
    pub fn text(selector: &str) -> Self {
        Self {
            selector: selector.to_string(),
            attr: None,
            labelled: None,
        }
    }

    pub fn attr(selector: &str, attr: &str) -> Self {
        Self {
            selector: selector.to_string(),
            attr: Some(attr.to_string()),
            labelled: None,
        }
    }

    pub fn under_heading(mut self, item: &str, heading: &str, text: &str) -> Self {
        self.labelled = Some(LabelledItem {
            item: item.to_string(),
            heading: heading.to_string(),
            text: text.to_string(),
        });
        self
    }
}

/// Field rules by posting attribute. An absent rule always yields the sentinel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldRules {
    pub title: Option<FieldRule>,
    pub link: Option<FieldRule>,
    pub company_name: Option<FieldRule>,
    pub company_link: Option<FieldRule>,
    pub location: Option<FieldRule>,
    pub salary: Option<FieldRule>,
    pub employment_type: Option<FieldRule>,
    pub description: Option<FieldRule>,
    pub posted_date: Option<FieldRule>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionSchema {
    pub name: String,
    /// Container that must be present for the page to be considered well-formed.
    pub root: String,
    /// Repeating card inside the root. `None` treats the root as the only record.
    #[serde(default)]
    pub card: Option<String>,
    /// Constant written to every record's source attribute.
    #[serde(default)]
    pub source_name: Option<String>,
    #[serde(default)]
    pub fields: FieldRules,
}

impl ExtractionSchema {
    /// Search-results page of the public jobs board.
    pub fn linkedin_listing() -> Self {
        Self {
            name: "linkedin-listing".to_string(),
            root: "section.two-pane-serp-page__results-list".to_string(),
            card: Some("div.base-card.job-search-card".to_string()),
            source_name: Some("LinkedIn".to_string()),
            fields: FieldRules {
                title: Some(FieldRule::text("h3.base-search-card__title")),
                link: Some(FieldRule::attr("a.base-card__full-link", "href")),
                company_name: Some(FieldRule::text("a.hidden-nested-link")),
                company_link: Some(FieldRule::attr("a.hidden-nested-link", "href")),
                location: Some(FieldRule::text("span.job-search-card__location")),
                salary: Some(FieldRule::text("div.salary.compensation__salary")),
                employment_type: Some(FieldRule::text(
                    "li.job-details-jobs-unified-top-card__job-insight--highlight",
                )),
                description: Some(FieldRule::text("div.show-more-less-html__markup")),
                posted_date: Some(FieldRule::text(
                    "time.job-search-card__listdate, time.job-search-card__listdate--new",
                )),
            },
        }
    }

    /// Single posting page; only the detail-only attributes are read.
    pub fn linkedin_detail() -> Self {
        Self {
            name: "linkedin-detail".to_string(),
            root: "main".to_string(),
            card: None,
            source_name: None,
            fields: FieldRules {
                description: Some(FieldRule::text("div.description__text.description__text--rich")),
                employment_type: Some(
                    FieldRule::text("span.description__job-criteria-text--criteria").under_heading(
                        "li.description__job-criteria-item",
                        "h3.description__job-criteria-subheader",
                        "Employment type",
                    ),
                ),
                salary: Some(FieldRule::text("div.salary.compensation__salary")),
                ..FieldRules::default()
            },
        }
    }

    pub fn compile(&self) -> Result<CompiledSchema, ExtractError> {
        let rule = |rule: &Option<FieldRule>| -> Result<Option<CompiledField>, ExtractError> {
            let Some(r) = rule else {
                return Ok(None);
            };
            let labelled = match &r.labelled {
                Some(label) => Some(CompiledLabel {
                    item: self.parse_selector(&label.item)?,
                    heading: self.parse_selector(&label.heading)?,
                    text: collapse_whitespace(&label.text),
                }),
                None => None,
            };
            Ok(Some(CompiledField {
                selector: self.parse_selector(&r.selector)?,
                attr: r.attr.clone(),
                labelled,
            }))
        };

        Ok(CompiledSchema {
            name: self.name.clone(),
            root_css: self.root.clone(),
            root: self.parse_selector(&self.root)?,
            card: self.card.as_deref().map(|c| self.parse_selector(c)).transpose()?,
            source_name: self.source_name.clone(),
            fields: CompiledFields {
                title: rule(&self.fields.title)?,
                link: rule(&self.fields.link)?,
                company_name: rule(&self.fields.company_name)?,
                company_link: rule(&self.fields.company_link)?,
                location: rule(&self.fields.location)?,
                salary: rule(&self.fields.salary)?,
                employment_type: rule(&self.fields.employment_type)?,
                description: rule(&self.fields.description)?,
                posted_date: rule(&self.fields.posted_date)?,
            },
        })
    }

    fn parse_selector(&self, css: &str) -> Result<Selector, ExtractError> {
        Selector::parse(css).map_err(|e| ExtractError::InvalidSelector {
            schema: self.name.clone(),
            selector: css.to_string(),
            message: e.to_string(),
        })
    }
}

/// Listing and detail schemas used by one deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaSet {
    #[serde(default = "ExtractionSchema::linkedin_listing")]
    pub listing: ExtractionSchema,
    #[serde(default = "ExtractionSchema::linkedin_detail")]
    pub detail: ExtractionSchema,
}

impl Default for SchemaSet {
    fn default() -> Self {
        Self {
            listing: ExtractionSchema::linkedin_listing(),
            detail: ExtractionSchema::linkedin_detail(),
        }
    }
}

impl SchemaSet {
    pub fn from_yaml(text: &str) -> anyhow::Result<Self> {
        serde_yaml::from_str(text).context("parsing extraction schema YAML")
    }
}

pub fn load_schema_set(path: impl AsRef<Path>) -> anyhow::Result<SchemaSet> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    SchemaSet::from_yaml(&text).with_context(|| format!("loading schemas from {}", path.display()))
}

#[derive(Debug, Clone)]
struct CompiledField {
    selector: Selector,
    attr: Option<String>,
    labelled: Option<CompiledLabel>,
}

#[derive(Debug, Clone)]
struct CompiledLabel {
    item: Selector,
    heading: Selector,
    text: String,
}

impl CompiledLabel {
    fn matches(&self, item: ElementRef<'_>) -> bool {
        item.select(&self.heading)
            .next()
            .is_some_and(|h| collapse_whitespace(&h.text().collect::<String>()).eq_ignore_ascii_case(&self.text))
    }
}

#[derive(Debug, Clone)]
struct CompiledFields {
    title: Option<CompiledField>,
    link: Option<CompiledField>,
    company_name: Option<CompiledField>,
    company_link: Option<CompiledField>,
    location: Option<CompiledField>,
    salary: Option<CompiledField>,
    employment_type: Option<CompiledField>,
    description: Option<CompiledField>,
    posted_date: Option<CompiledField>,
}

/// Outcome of running a schema against one page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diagnostic {
    /// Root and at least one card matched. `missing_fields` counts sentinels substituted.
    Matched { cards: usize, missing_fields: usize },
    /// Root matched but contained no cards: a genuinely empty result page.
    EmptyResult,
    /// The root container is absent; the schema is probably stale.
    StructuralMismatch { root: String },
}

impl Diagnostic {
    pub fn is_structural_mismatch(&self) -> bool {
        matches!(self, Diagnostic::StructuralMismatch { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extraction {
    pub postings: Vec<PostingFields>,
    pub diagnostic: Diagnostic,
}

#[derive(Debug, Clone)]
pub struct CompiledSchema {
    name: String,
    root_css: String,
    root: Selector,
    card: Option<Selector>,
    source_name: Option<String>,
    fields: CompiledFields,
}

impl CompiledSchema {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Readiness probe for a render: true once the root container exists.
    pub fn root_present(&self, markup: &str) -> bool {
        Html::parse_document(markup).select(&self.root).next().is_some()
    }

    pub fn extract(&self, markup: &str) -> Result<Extraction, ExtractError> {
        self.extract_with_base(markup, None)
    }

    /// Like [`extract`](Self::extract), resolving relative `link` and
    /// `company_link` values against the URL the page was served from.
    pub fn extract_at(&self, markup: &str, page_url: &str) -> Result<Extraction, ExtractError> {
        let base = Url::parse(page_url).ok();
        if base.is_none() {
            debug!(schema = %self.name, page_url, "page url is not absolute; links kept as found");
        }
        self.extract_with_base(markup, base.as_ref())
    }

    fn extract_with_base(&self, markup: &str, base: Option<&Url>) -> Result<Extraction, ExtractError> {
        if markup.trim().is_empty() {
            return Err(ExtractError::Malformed("empty document".to_string()));
        }
        if !markup.contains('<') {
            return Err(ExtractError::Malformed("document contains no markup".to_string()));
        }

        let document = Html::parse_document(markup);
        let Some(root) = document.select(&self.root).next() else {
            debug!(schema = %self.name, root = %self.root_css, "root container not found");
            return Ok(Extraction {
                postings: Vec::new(),
                diagnostic: Diagnostic::StructuralMismatch {
                    root: self.root_css.clone(),
                },
            });
        };

        let postings: Vec<PostingFields> = match &self.card {
            Some(card) => root.select(card).map(|el| self.extract_fields(el, base)).collect(),
            None => vec![self.extract_fields(root, base)],
        };

        let diagnostic = if postings.is_empty() {
            Diagnostic::EmptyResult
        } else {
            Diagnostic::Matched {
                cards: postings.len(),
                missing_fields: postings.iter().map(PostingFields::missing_count).sum(),
            }
        };

        Ok(Extraction {
            postings,
            diagnostic,
        })
    }

    fn extract_fields(&self, scope: ElementRef<'_>, base: Option<&Url>) -> PostingFields {
        let f = &self.fields;
        PostingFields {
            title: field_value(scope, &f.title),
            link: resolve_link(field_value(scope, &f.link), base),
            company_name: field_value(scope, &f.company_name),
            company_link: resolve_link(field_value(scope, &f.company_link), base),
            source_name: self.source_name.clone().into(),
            location: field_value(scope, &f.location),
            salary: field_value(scope, &f.salary),
            employment_type: field_value(scope, &f.employment_type),
            description: field_value(scope, &f.description),
            posted_date: field_value(scope, &f.posted_date),
        }
    }
}

fn field_value(scope: ElementRef<'_>, rule: &Option<CompiledField>) -> FieldValue {
    let Some(rule) = rule else {
        return FieldValue::Unavailable;
    };
    let node = match &rule.labelled {
        Some(label) => scope
            .select(&label.item)
            .filter(|item| label.matches(*item))
            .find_map(|item| item.select(&rule.selector).next()),
        None => scope.select(&rule.selector).next(),
    };
    let Some(node) = node else {
        return FieldValue::Unavailable;
    };
    match &rule.attr {
        Some(attr) => node
            .value()
            .attr(attr)
            .map(|v| FieldValue::Present(collapse_whitespace(v)))
            .unwrap_or(FieldValue::Unavailable),
        None => FieldValue::Present(collapse_whitespace(&node.text().collect::<String>())),
    }
}

fn resolve_link(value: FieldValue, base: Option<&Url>) -> FieldValue {
    match (value, base) {
        (FieldValue::Present(raw), Some(base)) if !raw.is_empty() => match base.join(&raw) {
            Ok(url) => FieldValue::Present(url.into()),
            Err(_) => FieldValue::Present(raw),
        },
        (value, _) => value,
    }
}
