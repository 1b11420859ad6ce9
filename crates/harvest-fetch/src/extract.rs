//! Extractor
//!
//! Pure transformation from fetched content to a `Document`: boilerplate
//! and markup are stripped, whitespace and encoding normalised, and the
//! resulting text hashed so repeated content can be recognised.

use std::sync::LazyLock;

use harvest_core::{Classify, Document, ErrorClass, ExtractorConfig};
use regex::Regex;
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

use crate::FetchedPage;

/// Elements whose whole content is boilerplate
const BOILERPLATE_TAGS: &[&str] = &[
    "script", "style", "noscript", "template", "svg", "nav", "header", "footer", "aside", "form",
    "iframe",
];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExtractError {
    /// Too little text survived extraction
    #[error("Extracted text too short: {length} chars (minimum {minimum})")]
    EmptyContent { length: usize, minimum: usize },

    /// The same text was already processed in this run
    #[error("Duplicate content (hash {hash})")]
    DuplicateContent { hash: String },
}

impl Classify for ExtractError {
    fn class(&self) -> ErrorClass {
        ErrorClass::InputError
    }
}

static HTML_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)<\s*(!doctype|html|head|body|div|p|br|span|table|article|section|a\s)")
        .expect("valid regex")
});
static TITLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<title[^>]*>(.*?)</title\s*>").expect("valid regex"));
static COMMENTS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<!--.*?-->").expect("valid regex"));
static BOILERPLATE: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    BOILERPLATE_TAGS
        .iter()
        .map(|tag| Regex::new(&format!(r"(?is)<{tag}\b[^>]*>.*?</{tag}\s*>")).expect("valid regex"))
        .collect()
});
static LINK_FOOTNOTE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*\[\d+\]:.*$").expect("valid regex"));
static LINK_REFERENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[([^\]\n]*)\]\[\d+\]").expect("valid regex"));
static EMPHASIS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\*{1,2}([^*\n]+)\*{1,2}").expect("valid regex"));
static HEADING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^#{1,6}\s+").expect("valid regex"));

/// HTML/text to `Document` extractor
pub struct Extractor {
    config: ExtractorConfig,
}

impl Extractor {
    pub fn new(config: ExtractorConfig) -> Self {
        Self { config }
    }

    /// Build a document for `document_id` from a fetched page
    pub fn extract(&self, document_id: Uuid, page: &FetchedPage) -> Result<Document, ExtractError> {
        let decoded = clean_encoding(&page.content);

        let (text, title) = if self.looks_like_html(&decoded) {
            let title = self.title(&decoded);
            (self.html_to_text(&decoded), title)
        } else {
            (decoded, None)
        };

        let text = normalize_whitespace(&text);
        let length = text.chars().count();
        if length < self.config.min_text_length {
            return Err(ExtractError::EmptyContent {
                length,
                minimum: self.config.min_text_length,
            });
        }

        Ok(Document {
            id: document_id,
            source_url: page.url.clone(),
            fetched_at: page.fetched_at,
            content_hash: content_hash(&text),
            raw_text: text,
            status: page.status,
            title,
        })
    }

    fn looks_like_html(&self, content: &str) -> bool {
        HTML_MARKER.is_match(content)
    }

    fn title(&self, html: &str) -> Option<String> {
        let raw = TITLE.captures(html)?.get(1)?.as_str();
        let title = normalize_whitespace(&render(raw, self.config.render_width));
        let title = title.replace('\n', " ");
        (!title.is_empty()).then_some(title)
    }

    fn html_to_text(&self, html: &str) -> String {
        let mut html = COMMENTS.replace_all(html, " ").into_owned();
        for re in BOILERPLATE.iter() {
            html = re.replace_all(&html, " ").into_owned();
        }

        let text = render(&html, self.config.render_width);
        let text = LINK_FOOTNOTE.replace_all(&text, "");
        let text = LINK_REFERENCE.replace_all(&text, "$1");
        let text = EMPHASIS.replace_all(&text, "$1");
        HEADING.replace_all(&text, "").into_owned()
    }
}

impl Default for Extractor {
    fn default() -> Self {
        Self::new(ExtractorConfig::default())
    }
}

fn render(html: &str, width: usize) -> String {
    html2text::from_read(html.as_bytes(), width).unwrap_or_default()
}

/// Drop byte-order marks and control characters other than line breaks and tabs
fn clean_encoding(content: &str) -> String {
    content
        .chars()
        .filter(|c| *c != '\u{feff}')
        .map(|c| if c == '\r' { '\n' } else { c })
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect()
}

/// Collapse runs of spaces within lines and keep at most one blank line
pub fn normalize_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut blank_run = 0usize;

    for line in text.lines() {
        let collapsed = line.split_whitespace().collect::<Vec<_>>().join(" ");
        if collapsed.is_empty() {
            blank_run += 1;
            continue;
        }
        if !out.is_empty() {
            out.push('\n');
            if blank_run > 0 {
                out.push('\n');
            }
        }
        blank_run = 0;
        out.push_str(&collapsed);
    }

    out
}

/// Hex SHA-256 of the normalised text
pub fn content_hash(text: &str) -> String {
    format!("{:x}", Sha256::digest(text.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extractor(min: usize) -> Extractor {
        Extractor::new(ExtractorConfig {
            min_text_length: min,
            ..ExtractorConfig::default()
        })
    }

    #[test]
    fn test_strips_boilerplate_and_markup() {
        let html = r#"<!DOCTYPE html>
            <html><head><title>Acme &amp; Partners</title>
            <style>body { color: red; }</style>
            <script>var tracking = "Jon Smith";</script></head>
            <body>
              <nav><a href="/">Home</a> <a href="/about">About</a></nav>
              <article><p>Jon Smith works at Acme.</p>
              <p>He joined   the company in 2019.</p></article>
              <footer>Copyright Acme</footer>
            </body></html>"#;

        let page = FetchedPage::raw("https://acme.test/news", html);
        let doc = extractor(10).extract(Uuid::new_v4(), &page).unwrap();

        assert!(doc.raw_text.contains("Jon Smith works at Acme."));
        assert!(doc.raw_text.contains("He joined the company in 2019."));
        assert!(!doc.raw_text.contains("tracking"));
        assert!(!doc.raw_text.contains("color: red"));
        assert!(!doc.raw_text.contains("Copyright"));
        assert!(!doc.raw_text.contains("About"));
        assert_eq!(doc.title.as_deref(), Some("Acme & Partners"));
        assert_eq!(doc.source_url, "https://acme.test/news");
    }

    #[test]
    fn test_plain_text_passes_through() {
        let page = FetchedPage::raw("raw:memo", "Jon Smith works at Acme.\r\n\r\n\r\nJ. Smith agrees.");
        let doc = extractor(10).extract(Uuid::new_v4(), &page).unwrap();

        assert_eq!(doc.raw_text, "Jon Smith works at Acme.\n\nJ. Smith agrees.");
        assert_eq!(doc.title, None);
        assert_eq!(doc.status, 200);
    }

    #[test]
    fn test_short_content_is_empty() {
        let page = FetchedPage::raw("raw:tiny", "<html><body><p>Hi</p></body></html>");
        let err = extractor(40).extract(Uuid::new_v4(), &page).unwrap_err();

        assert!(matches!(err, ExtractError::EmptyContent { minimum: 40, .. }));
        assert_eq!(err.class(), ErrorClass::InputError);
    }

    #[test]
    fn test_hash_is_stable_over_whitespace_noise() {
        let a = FetchedPage::raw("a", "Jon Smith   works at Acme.  ");
        let b = FetchedPage::raw("b", "\u{feff}Jon Smith works\tat Acme.");
        let ex = extractor(5);

        let doc_a = ex.extract(Uuid::new_v4(), &a).unwrap();
        let doc_b = ex.extract(Uuid::new_v4(), &b).unwrap();
        assert_eq!(doc_a.content_hash, doc_b.content_hash);
        assert_eq!(doc_a.content_hash.len(), 64);
    }

    #[test]
    fn test_markup_patterns_compile() {
        assert_eq!(BOILERPLATE.len(), BOILERPLATE_TAGS.len());
        for re in [
            &*HTML_MARKER,
            &*TITLE,
            &*COMMENTS,
            &*LINK_FOOTNOTE,
            &*LINK_REFERENCE,
            &*EMPHASIS,
            &*HEADING,
        ] {
            assert!(!re.as_str().is_empty());
        }
        assert!(LINK_REFERENCE.is_match("[Acme][3]"));
        assert!(HEADING.is_match("## Team"));
    }

    #[test]
    fn test_normalize_whitespace() {
        assert_eq!(normalize_whitespace("  a   b \n\n\n\n c"), "a b\n\nc");
        assert_eq!(normalize_whitespace("\n\n"), "");
    }
}
