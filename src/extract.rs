//! Multi-format text extraction (PDF, DOCX, plain text, Markdown).
//!
//! Callers supply bytes plus a format hint; this module returns normalized
//! UTF-8 text. Extraction is pure and synchronous, so the pipeline runs it on
//! the blocking thread pool.
//!
//! Normalization strips a leading byte-order mark and converts `\r\n` and
//! lone `\r` line endings to `\n`.

use std::io::Read;
use std::path::Path;

use crate::error::{Error, Result};

pub const MIME_PDF: &str = "application/pdf";
pub const MIME_DOCX: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
pub const MIME_TEXT: &str = "text/plain";
pub const MIME_MARKDOWN: &str = "text/markdown";

/// Maximum decompressed bytes to read from a single ZIP entry (zip-bomb protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

/// Document formats the extractor understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Pdf,
    Docx,
    Text,
    Markdown,
}

impl Format {
    /// Resolve a format hint: a MIME type, a short tag (`pdf`, `md`, ...),
    /// or a file name whose extension identifies the format.
    pub fn resolve(hint: &str) -> Result<Format> {
        let lowered = hint.trim().to_ascii_lowercase();
        let by_tag = match lowered.as_str() {
            MIME_PDF | "pdf" => Some(Format::Pdf),
            MIME_DOCX | "docx" => Some(Format::Docx),
            MIME_TEXT | "txt" | "text" => Some(Format::Text),
            MIME_MARKDOWN | "text/x-markdown" | "md" | "markdown" => Some(Format::Markdown),
            _ => None,
        };
        by_tag
            .or_else(|| Format::from_path(Path::new(&lowered)))
            .ok_or_else(|| Error::UnsupportedFormat(hint.to_string()))
    }

    /// Format implied by a path's extension, if any.
    pub fn from_path(path: &Path) -> Option<Format> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "pdf" => Some(Format::Pdf),
            "docx" => Some(Format::Docx),
            "txt" | "text" => Some(Format::Text),
            "md" | "markdown" => Some(Format::Markdown),
            _ => None,
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            Format::Pdf => "pdf",
            Format::Docx => "docx",
            Format::Text => "txt",
            Format::Markdown => "md",
        }
    }

    pub fn mime(&self) -> &'static str {
        match self {
            Format::Pdf => MIME_PDF,
            Format::Docx => MIME_DOCX,
            Format::Text => MIME_TEXT,
            Format::Markdown => MIME_MARKDOWN,
        }
    }
}

/// Converts raw document bytes into normalized plain text.
#[derive(Debug, Clone)]
pub struct Extractor {
    max_bytes: u64,
}

impl Extractor {
    pub fn new(max_bytes: u64) -> Self {
        Self { max_bytes }
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// Fails with [`Error::InputTooLarge`] when `size` exceeds the ceiling.
    pub fn check_size(&self, size: u64) -> Result<()> {
        if size > self.max_bytes {
            return Err(Error::InputTooLarge {
                size,
                limit: self.max_bytes,
            });
        }
        Ok(())
    }

    pub fn extract(&self, bytes: &[u8], format: Format) -> Result<String> {
        self.check_size(bytes.len() as u64)?;
        let raw = match format {
            Format::Pdf => extract_pdf(bytes)?,
            Format::Docx => extract_docx(bytes)?,
            Format::Text | Format::Markdown => decode_utf8(bytes)?,
        };
        Ok(normalize(&raw))
    }

    /// Resolve `hint` with [`Format::resolve`] and extract.
    pub fn extract_with_hint(&self, bytes: &[u8], hint: &str) -> Result<String> {
        self.extract(bytes, Format::resolve(hint)?)
    }
}

fn decode_utf8(bytes: &[u8]) -> Result<String> {
    std::str::from_utf8(bytes)
        .map(str::to_string)
        .map_err(|e| Error::CorruptInput(format!("invalid UTF-8: {}", e)))
}

/// Strip a BOM and normalize line endings to `\n`.
pub fn normalize(text: &str) -> String {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    text.replace("\r\n", "\n").replace('\r', "\n")
}

fn extract_pdf(bytes: &[u8]) -> Result<String> {
    pdf_extract::extract_text_from_mem(bytes)
        .map_err(|e| Error::CorruptInput(format!("PDF extraction failed: {}", e)))
}

fn docx_err(e: impl std::fmt::Display) -> Error {
    Error::CorruptInput(format!("DOCX extraction failed: {}", e))
}

fn extract_docx(bytes: &[u8]) -> Result<String> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes)).map_err(docx_err)?;
    let entry = archive
        .by_name("word/document.xml")
        .map_err(|_| docx_err("word/document.xml not found"))?;
    let mut doc_xml = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut doc_xml)
        .map_err(docx_err)?;
    if doc_xml.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(docx_err("word/document.xml exceeds size limit"));
    }
    extract_paragraphs(&doc_xml)
}

/// Collect `<w:t>` runs, one line per `<w:p>` paragraph.
fn extract_paragraphs(xml: &[u8]) -> Result<String> {
    use quick_xml::events::Event;

    let mut paragraphs: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut in_text = false;
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_text = true,
            Ok(Event::Text(te)) if in_text => {
                let text = te.unescape().map_err(docx_err)?;
                current.push_str(&text);
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => {
                    if !current.trim().is_empty() {
                        paragraphs.push(std::mem::take(&mut current));
                    }
                    current.clear();
                }
                _ => {}
            },
            Ok(Event::Empty(e)) if e.local_name().as_ref() == b"tab" => current.push('\t'),
            Ok(Event::Eof) => break,
            Err(e) => return Err(docx_err(e)),
            _ => {}
        }
        buf.clear();
    }
    if !current.trim().is_empty() {
        paragraphs.push(current);
    }
    Ok(paragraphs.join("\n"))
}
