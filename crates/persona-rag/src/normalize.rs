//! Raw upload bytes to clean UTF-8 text.

use calamine::{open_workbook_auto_from_rs, Data, Reader};
use persona_core::limits::truncate_chars;
use persona_error::{PersonaError, Result};
use regex::Regex;
use std::io::Cursor;
use tracing::instrument;

pub const MIME_TEXT: &str = "text/plain";
pub const MIME_PDF: &str = "application/pdf";
pub const MIME_DOCX: &str = "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
pub const MIME_XLSX: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";
pub const MIME_XLS: &str = "application/vnd.ms-excel";
pub const MIME_HTML: &str = "text/html";

/// MIME types accepted for file upload.
pub const ACCEPTED_UPLOAD_TYPES: &[&str] = &[MIME_TEXT, MIME_PDF, MIME_DOCX, MIME_XLSX, MIME_XLS];

const PDF_NO_TEXT: &str = "Could not extract any text from this PDF. Please upload a searchable PDF (scanned images are not supported).";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Text,
    Pdf,
    Spreadsheet,
    /// No dedicated parser, decoded as raw text
    Docx,
    Html,
}

impl SourceKind {
    pub fn from_mime(mime: &str) -> Self {
        match essence(mime).as_str() {
            MIME_PDF => SourceKind::Pdf,
            MIME_XLSX | MIME_XLS => SourceKind::Spreadsheet,
            MIME_DOCX => SourceKind::Docx,
            MIME_HTML | "application/xhtml+xml" => SourceKind::Html,
            _ => SourceKind::Text,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            SourceKind::Text => "text",
            SourceKind::Pdf => "pdf",
            SourceKind::Spreadsheet => "spreadsheet",
            SourceKind::Docx => "docx",
            SourceKind::Html => "html",
        }
    }
}

fn essence(mime: &str) -> String {
    mime.split(';').next().unwrap_or("").trim().to_ascii_lowercase()
}

/// Canonical upload MIME type, or `None` when the upload must be rejected.
/// Generic or missing declared types fall back to the file extension.
pub fn resolve_upload_mime(declared: &str, filename: &str) -> Option<&'static str> {
    let declared = essence(declared);
    if let Some(m) = ACCEPTED_UPLOAD_TYPES.iter().find(|m| **m == declared) {
        return Some(m);
    }
    if matches!(declared.as_str(), "text/markdown" | "text/csv") {
        return Some(MIME_TEXT);
    }
    if !declared.is_empty() && declared != "application/octet-stream" {
        return None;
    }
    let ext = filename.rsplit_once('.')?.1.to_ascii_lowercase();
    match ext.as_str() {
        "txt" | "md" | "csv" => Some(MIME_TEXT),
        "pdf" => Some(MIME_PDF),
        "docx" => Some(MIME_DOCX),
        "xlsx" => Some(MIME_XLSX),
        "xls" => Some(MIME_XLS),
        _ => None,
    }
}

/// Converts raw bytes into text according to `mime`.
///
/// Only PDFs without text and empty HTML pages are hard failures; everything
/// else degrades to a lossy UTF-8 decode.
#[instrument(skip(bytes), fields(bytes = bytes.len()))]
pub async fn normalize(bytes: Vec<u8>, mime: &str, max_html_chars: usize) -> Result<String> {
    let kind = SourceKind::from_mime(mime);
    let text = match kind {
        SourceKind::Pdf => extract_pdf(bytes).await?,
        SourceKind::Spreadsheet => {
            let raw = bytes.clone();
            match tokio::task::spawn_blocking(move || spreadsheet_to_csv(raw)).await {
                Ok(Ok(text)) => text,
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "Spreadsheet parse failed, decoding as text");
                    decode_text(&bytes)
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Spreadsheet parser panicked, decoding as text");
                    decode_text(&bytes)
                }
            }
        }
        SourceKind::Html => html_to_text(&decode_text(&bytes), max_html_chars)?,
        SourceKind::Text | SourceKind::Docx => decode_text(&bytes),
    };
    tracing::debug!(kind = kind.label(), chars = text.len(), "Normalized document");
    Ok(text)
}

/// Lossy UTF-8 decode with NUL bytes removed.
pub fn decode_text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).replace('\0', "")
}

async fn extract_pdf(bytes: Vec<u8>) -> Result<String> {
    let extracted = tokio::task::spawn_blocking(move || pdf_extract::extract_text_from_mem(&bytes))
        .await;
    let text = match extracted {
        Ok(Ok(text)) => text,
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "PDF text extraction failed");
            String::new()
        }
        Err(e) => {
            tracing::warn!(error = %e, "PDF parser panicked");
            String::new()
        }
    };

    let cleaned = text
        .replace('\0', "")
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n");
    if cleaned.is_empty() {
        return Err(PersonaError::Extraction {
            source_kind: "pdf".to_string(),
            message: PDF_NO_TEXT.to_string(),
        });
    }
    Ok(cleaned)
}

fn cell_text(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        other => other.to_string().replace('\0', ""),
    }
}

/// Every sheet as CSV under a `## Sheet: <name>` header, sheets separated by a blank line.
fn spreadsheet_to_csv(bytes: Vec<u8>) -> Result<String> {
    let parse_err = |e: calamine::Error| PersonaError::Extraction {
        source_kind: "spreadsheet".to_string(),
        message: e.to_string(),
    };
    let mut workbook = open_workbook_auto_from_rs(Cursor::new(bytes)).map_err(parse_err)?;
    let names: Vec<String> = workbook.sheet_names().to_vec();

    let mut sheets = Vec::with_capacity(names.len());
    for name in &names {
        let range = workbook.worksheet_range(name).map_err(parse_err)?;
        let mut writer = csv::WriterBuilder::new()
            .flexible(true)
            .from_writer(Vec::new());
        for row in range.rows() {
            let cells: Vec<String> = row.iter().map(cell_text).collect();
            writer.write_record(&cells).map_err(|e| PersonaError::Extraction {
                source_kind: "spreadsheet".to_string(),
                message: e.to_string(),
            })?;
        }
        let csv_bytes = writer.into_inner().map_err(|e| PersonaError::Internal {
            message: "csv buffer".to_string(),
            details: Some(e.to_string()),
        })?;
        let body = String::from_utf8_lossy(&csv_bytes);
        sheets.push(format!("## Sheet: {}\n{}", name, body.trim_end()));
    }
    Ok(sheets.join("\n\n"))
}

fn regex(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| PersonaError::Internal {
        message: "invalid html filter pattern".to_string(),
        details: Some(e.to_string()),
    })
}

/// Visible body text of an HTML page: scripts, styles, noscript blocks and
/// comments removed, whitespace collapsed, capped at `max_chars`.
pub fn html_to_text(html: &str, max_chars: usize) -> Result<String> {
    let body = regex(r"(?is)<body\b[^>]*>(.*)</body\s*>")?
        .captures(html)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .unwrap_or(html);

    let mut cleaned = body.to_string();
    for pattern in [
        r"(?is)<script\b[^>]*>.*?</script\s*>",
        r"(?is)<style\b[^>]*>.*?</style\s*>",
        r"(?is)<noscript\b[^>]*>.*?</noscript\s*>",
        r"(?s)<!--.*?-->",
    ] {
        cleaned = regex(pattern)?.replace_all(&cleaned, " ").into_owned();
    }

    let rendered = html2text::from_read(cleaned.as_bytes(), 120);
    let collapsed = rendered.split_whitespace().collect::<Vec<_>>().join(" ");
    let text = truncate_chars(&collapsed, max_chars).to_string();
    if text.is_empty() {
        return Err(PersonaError::Extraction {
            source_kind: "html".to_string(),
            message: "No readable text was found on this page".to_string(),
        });
    }
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_text_strips_nul() {
        let text = normalize(b"hel\0lo\0 world".to_vec(), "text/plain", 100)
            .await
            .unwrap();
        assert_eq!(text, "hello world");
    }

    #[tokio::test]
    async fn test_invalid_utf8_is_lossy() {
        let text = normalize(vec![b'a', 0xff, b'b'], "text/plain", 100)
            .await
            .unwrap();
        assert!(text.starts_with('a'));
        assert!(text.ends_with('b'));
    }

    #[tokio::test]
    async fn test_pdf_without_text_is_rejected() {
        let err = normalize(b"%PDF-1.4 not really a pdf".to_vec(), MIME_PDF, 100)
            .await
            .unwrap_err();
        assert!(matches!(err, PersonaError::Extraction { .. }));
        assert!(err.user_message().contains("searchable PDF"));
        assert_eq!(err.to_http_status(), 422);
    }

    #[tokio::test]
    async fn test_broken_spreadsheet_falls_back_to_text() {
        let text = normalize(b"a,b\n1,2".to_vec(), MIME_XLSX, 100)
            .await
            .unwrap();
        assert_eq!(text, "a,b\n1,2");
    }

    #[tokio::test]
    async fn test_docx_passes_through() {
        let text = normalize(b"raw docx bytes".to_vec(), MIME_DOCX, 100)
            .await
            .unwrap();
        assert_eq!(text, "raw docx bytes");
    }

    #[test]
    fn test_html_strips_non_visible() {
        let html = r#"<html><head><title>T</title><style>body { color: red }</style></head>
            <body><script>var x = "hidden";</script><noscript>enable js</noscript>
            <!-- comment --><h1>Opening   hours</h1>
            <p>Mon-Fri
               9 to 5</p></body></html>"#;
        let text = html_to_text(html, 1000).unwrap();
        assert!(text.contains("Opening hours"));
        assert!(text.contains("Mon-Fri 9 to 5"));
        assert!(!text.contains("hidden"));
        assert!(!text.contains("color"));
        assert!(!text.contains("enable js"));
        assert!(!text.contains("comment"));
        assert!(!text.contains("  "));
    }

    #[test]
    fn test_html_cap_and_empty() {
        let html = format!("<body><p>{}</p></body>", "word ".repeat(100));
        assert_eq!(html_to_text(&html, 20).unwrap().chars().count(), 20);

        let err = html_to_text("<body><script>only()</script></body>", 100).unwrap_err();
        assert!(matches!(err, PersonaError::Extraction { .. }));
    }

    #[test]
    fn test_resolve_upload_mime() {
        assert_eq!(resolve_upload_mime("text/plain; charset=utf-8", "a.txt"), Some(MIME_TEXT));
        assert_eq!(resolve_upload_mime("application/octet-stream", "b.XLSX"), Some(MIME_XLSX));
        assert_eq!(resolve_upload_mime("", "report.pdf"), Some(MIME_PDF));
        assert_eq!(resolve_upload_mime("image/png", "x.png"), None);
        assert_eq!(resolve_upload_mime("image/png", "x.txt"), None);
        assert_eq!(resolve_upload_mime("application/octet-stream", "noext"), None);
    }
}
