//! Text extraction from bookmark sources.
//!
//! - Files: PDF, DOCX, anything else read as lossy UTF-8
//! - URLs: single HTTP GET with a fixed timeout, markup stripped by regex
//!
//! Every failure is an `ExtractionError` scoped to one source; callers
//! decide whether to skip it.

use std::io::Read;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::ExtractionConfig;
use crate::document::SourceReference;

static TAG_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<[^<]+?>").expect("Failed to compile tag regex"));

/// A `<w:p>` element, either self-closing or with its content captured.
static DOCX_PARAGRAPH_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)<w:p(?:\s[^>]*)?/>|<w:p(?:\s[^>]*)?>(.*?)</w:p>")
        .expect("Failed to compile paragraph regex")
});

/// Text runs, tabs and breaks inside a paragraph, in document order.
static DOCX_RUN_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"<w:t(?:\s[^>]*)?>([^<]*)</w:t>|<w:tab(?:\s[^>]*)?/>|<w:(?:br|cr)(?:\s[^>]*)?/>")
        .expect("Failed to compile run regex")
});

/// Named and numeric character references.
static XML_ENTITY_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"&(lt|gt|quot|apos|amp|#[0-9]+|#[xX][0-9a-fA-F]+);")
        .expect("Failed to compile entity regex")
});

const DOCX_BODY: &str = "word/document.xml";

#[derive(Debug, thiserror::Error)]
pub enum ExtractionError {
    #[error("unsupported source: {0}")]
    Unsupported(String),

    #[error("failed to read file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse {format}: {reason}")]
    Parse { format: &'static str, reason: String },

    #[error("fetch failed: {0}")]
    Fetch(#[from] reqwest::Error),

    #[error("unexpected status {0}")]
    Status(reqwest::StatusCode),
}

pub trait TextExtractor: Send + Sync {
    fn extract(&self, source: &SourceReference) -> Result<String, ExtractionError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileKind {
    Pdf,
    Docx,
    Text,
}

pub struct Extractor {
    client: reqwest::blocking::Client,
}

impl Extractor {
    pub fn new(config: &ExtractionConfig) -> Result<Self, ExtractionError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.fetch_timeout_secs))
            .user_agent(config.user_agent.clone())
            .build()?;

        Ok(Self::with_client(client))
    }

    pub fn with_client(client: reqwest::blocking::Client) -> Self {
        Self { client }
    }

    pub fn extract_file(&self, path: &Path) -> Result<String, ExtractionError> {
        match Self::file_kind(path)? {
            FileKind::Pdf => Self::extract_pdf(path),
            FileKind::Docx => Self::extract_docx(path),
            FileKind::Text => {
                let bytes = std::fs::read(path)?;
                Ok(String::from_utf8_lossy(&bytes).into_owned())
            }
        }
    }

    pub fn extract_url(&self, url: &str) -> Result<String, ExtractionError> {
        let parsed =
            url::Url::parse(url).map_err(|e| ExtractionError::Unsupported(format!("{url}: {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ExtractionError::Unsupported(format!(
                "{url}: scheme '{}' is not fetchable",
                parsed.scheme()
            )));
        }

        log::debug!("fetching {url}");
        let response = self.client.get(parsed).send()?;
        let status = response.status();
        if !status.is_success() {
            return Err(ExtractionError::Status(status));
        }

        let body = response.text()?;
        Ok(strip_tags(&body))
    }

    /// Extension first; files without one are sniffed by content.
    fn file_kind(path: &Path) -> Result<FileKind, ExtractionError> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());

        let kind = match ext.as_deref() {
            Some("pdf") => FileKind::Pdf,
            Some("docx") => FileKind::Docx,
            Some(_) => FileKind::Text,
            None => match infer::get_from_path(path)? {
                Some(t) if t.mime_type() == "application/pdf" => FileKind::Pdf,
                Some(t) if t.extension() == "docx" => FileKind::Docx,
                _ => FileKind::Text,
            },
        };

        Ok(kind)
    }

    fn extract_pdf(path: &Path) -> Result<String, ExtractionError> {
        // surface unreadable files as io errors rather than parse errors
        std::fs::metadata(path)?;

        // pdf-extract panics on some malformed documents
        catch_parser_panic("pdf", || {
            pdf_extract::extract_text(path).map_err(|e| ExtractionError::Parse {
                format: "pdf",
                reason: e.to_string(),
            })
        })
    }

    fn extract_docx(path: &Path) -> Result<String, ExtractionError> {
        let parse_err = |reason: String| ExtractionError::Parse {
            format: "docx",
            reason,
        };

        let file = std::fs::File::open(path)?;
        let mut archive = zip::ZipArchive::new(file).map_err(|e| parse_err(e.to_string()))?;
        let mut body = archive
            .by_name(DOCX_BODY)
            .map_err(|e| parse_err(format!("{DOCX_BODY}: {e}")))?;

        let mut xml = String::new();
        body.read_to_string(&mut xml)?;

        Ok(docx_paragraphs(&xml).join("\n"))
    }
}

impl TextExtractor for Extractor {
    fn extract(&self, source: &SourceReference) -> Result<String, ExtractionError> {
        match source {
            SourceReference::Url(url) => self.extract_url(url),
            SourceReference::File(path) => self.extract_file(path),
        }
    }
}

/// Run a third-party parser, turning a panic into a parse error.
fn catch_parser_panic<T>(
    format: &'static str,
    parse: impl FnOnce() -> Result<T, ExtractionError>,
) -> Result<T, ExtractionError> {
    match std::panic::catch_unwind(AssertUnwindSafe(parse)) {
        Ok(result) => result,
        Err(panic_info) => {
            let msg = if let Some(s) = panic_info.downcast_ref::<String>() {
                s.clone()
            } else if let Some(s) = panic_info.downcast_ref::<&str>() {
                s.to_string()
            } else {
                "unknown panic".to_string()
            };
            log::error!("{} parser panicked: {}", format, msg);
            Err(ExtractionError::Parse {
                format,
                reason: format!("parser panicked: {msg}"),
            })
        }
    }
}

/// Best-effort markup removal. Not an HTML parser: scripts and styles keep
/// their bodies.
pub fn strip_tags(html: &str) -> String {
    TAG_REGEX.replace_all(html, "").into_owned()
}

fn docx_paragraphs(xml: &str) -> Vec<String> {
    DOCX_PARAGRAPH_REGEX
        .captures_iter(xml)
        .map(|para| {
            let Some(inner) = para.get(1) else {
                return String::new();
            };

            let mut text = String::new();
            for run in DOCX_RUN_REGEX.captures_iter(inner.as_str()) {
                match run.get(1) {
                    Some(t) => text.push_str(&unescape_xml(t.as_str())),
                    None if run[0].starts_with("<w:tab") => text.push('\t'),
                    None => text.push('\n'),
                }
            }
            text
        })
        .collect()
}

fn unescape_xml(s: &str) -> String {
    if !s.contains('&') {
        return s.to_string();
    }
    XML_ENTITY_REGEX
        .replace_all(s, |caps: &regex::Captures| {
            let entity = &caps[1];
            let decoded = match entity {
                "lt" => Some('<'),
                "gt" => Some('>'),
                "quot" => Some('"'),
                "apos" => Some('\''),
                "amp" => Some('&'),
                _ => entity
                    .strip_prefix("#x")
                    .or_else(|| entity.strip_prefix("#X"))
                    .and_then(|hex| u32::from_str_radix(hex, 16).ok())
                    .or_else(|| entity.strip_prefix('#').and_then(|dec| dec.parse().ok()))
                    .and_then(char::from_u32),
            };
            match decoded {
                Some(c) => c.to_string(),
                // unknown or invalid references stay as written
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}
