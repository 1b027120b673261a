// Copyright 2025 Graphmem (https://github.com/graphmem)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Document decoding: `bytes -> plain text`, dispatched on the filename
//! extension. Supported formats: txt, md, html, csv, pdf, docx; anything
//! else is attempted as UTF-8 text.

use graphmem_core::error::{MemoryError, Result};
use lopdf::Document as PdfDocument;
use pulldown_cmark::{Event as MdEvent, Options as MdOptions, Parser as MdParser};
use regex::Regex;
use std::io::Read;
use std::sync::LazyLock;

static HTML_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<script.*?</script>|<style.*?</style>|<[^>]+>").expect("html pattern"));

static DOCX_TEXT_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<w:t[^>]*>([^<]*)</w:t>|<w:(?:p|br)\b[^>]*/?>").expect("docx pattern"));

/// Extension of a filename, lowercased, without the dot.
pub fn extension(filename: &str) -> String {
    filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_lowercase())
        .unwrap_or_default()
}

/// MIME content type guessed from the filename.
pub fn guess_content_type(filename: &str) -> &'static str {
    match extension(filename).as_str() {
        "pdf" => "application/pdf",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "md" => "text/markdown",
        "html" | "htm" => "text/html",
        "csv" => "text/csv",
        "json" => "application/json",
        "txt" => "text/plain",
        _ => "application/octet-stream",
    }
}

/// Decode a raw document into plain text.
pub fn decode_document(bytes: &[u8], filename: &str) -> Result<String> {
    let text = match extension(filename).as_str() {
        "pdf" => pdf_to_text(bytes)?,
        "docx" => docx_to_text(bytes)?,
        "md" => markdown_to_text(&utf8(bytes)),
        "html" | "htm" => html_to_text(&utf8(bytes)),
        _ => utf8(bytes),
    };

    if text.trim().is_empty() {
        return Err(MemoryError::invalid(format!(
            "no text could be extracted from '{}'",
            filename
        )));
    }
    Ok(text)
}

fn utf8(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// Text content of a PDF: `Tj`/`TJ` string operands of each page's content
/// stream, newline-separated.
fn pdf_to_text(bytes: &[u8]) -> Result<String> {
    let doc = PdfDocument::load_mem(bytes)
        .map_err(|e| MemoryError::invalid(format!("unreadable PDF: {}", e)))?;

    let mut out = String::new();
    for page_id in doc.get_pages().values() {
        let content_bytes = doc
            .get_page_content(*page_id)
            .map_err(|e| MemoryError::invalid(format!("unreadable PDF page: {}", e)))?;
        let content = lopdf::content::Content::decode(&content_bytes)
            .map_err(|e| MemoryError::invalid(format!("unreadable PDF content: {}", e)))?;
        for operation in content.operations {
            if operation.operator == "Tj" || operation.operator == "TJ" {
                for operand in operation.operands {
                    collect_pdf_strings(&operand, &mut out);
                }
            }
        }
    }
    Ok(out)
}

fn collect_pdf_strings(object: &lopdf::Object, out: &mut String) {
    match object {
        lopdf::Object::String(bytes, _) => {
            if let Ok(text) = std::str::from_utf8(bytes) {
                out.push_str(text);
                out.push('\n');
            }
        }
        lopdf::Object::Array(items) => {
            for item in items {
                collect_pdf_strings(item, out);
            }
        }
        _ => {}
    }
}

/// Markdown rendered down to its text content.
fn markdown_to_text(markdown: &str) -> String {
    let mut out = String::new();
    let parser = MdParser::new_ext(
        markdown,
        MdOptions::ENABLE_STRIKETHROUGH | MdOptions::ENABLE_TABLES,
    );
    for event in parser {
        match event {
            MdEvent::Text(text) => out.push_str(&text),
            MdEvent::Code(code) => out.push_str(&code),
            MdEvent::SoftBreak | MdEvent::HardBreak => out.push('\n'),
            MdEvent::End(_) => {
                if !out.ends_with('\n') {
                    out.push('\n');
                }
            }
            _ => {}
        }
    }
    out
}

/// HTML stripped to text: script/style blocks removed, tags dropped,
/// basic entities decoded.
fn html_to_text(html: &str) -> String {
    let stripped = HTML_TAG.replace_all(html, " ");
    stripped
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Text runs of a DOCX body (`word/document.xml` inside the zip container).
fn docx_to_text(bytes: &[u8]) -> Result<String> {
    let cursor = std::io::Cursor::new(bytes);
    let mut archive = zip::ZipArchive::new(cursor)
        .map_err(|e| MemoryError::invalid(format!("unreadable DOCX container: {}", e)))?;
    let mut document_xml = String::new();
    archive
        .by_name("word/document.xml")
        .map_err(|e| MemoryError::invalid(format!("DOCX has no document body: {}", e)))?
        .read_to_string(&mut document_xml)
        .map_err(|e| MemoryError::invalid(format!("unreadable DOCX body: {}", e)))?;

    let mut out = String::new();
    for caps in DOCX_TEXT_RUN.captures_iter(&document_xml) {
        match caps.get(1) {
            Some(text) => out.push_str(text.as_str()),
            // Paragraph and line-break markers become newlines.
            None => {
                if !out.ends_with('\n') {
                    out.push('\n');
                }
            }
        }
    }
    Ok(out
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_dispatch() {
        assert_eq!(extension("Contrat.PDF"), "pdf");
        assert_eq!(extension("notes.md"), "md");
        assert_eq!(extension("no_extension"), "");
        assert_eq!(guess_content_type("a.csv"), "text/csv");
        assert_eq!(guess_content_type("blob"), "application/octet-stream");
    }

    #[test]
    fn plain_text_passes_through() {
        let text = decode_document("Bonjour le monde.".as_bytes(), "note.txt").unwrap();
        assert_eq!(text, "Bonjour le monde.");
    }

    #[test]
    fn markdown_is_stripped() {
        let md = "# Titre\n\nDu **gras** et un [lien](https://example.com).\n";
        let text = decode_document(md.as_bytes(), "doc.md").unwrap();
        assert!(text.contains("Titre"));
        assert!(text.contains("gras"));
        assert!(!text.contains("**"));
        assert!(!text.contains("https://example.com"));
    }

    #[test]
    fn html_is_stripped() {
        let html = "<html><head><style>p{color:red}</style></head>\
                    <body><h1>Titre</h1><p>Un &amp; deux</p><script>evil()</script></body></html>";
        let text = decode_document(html.as_bytes(), "page.html").unwrap();
        assert!(text.contains("Titre"));
        assert!(text.contains("Un & deux"));
        assert!(!text.contains("evil"));
        assert!(!text.contains("color:red"));
    }

    #[test]
    fn empty_content_is_rejected() {
        assert!(decode_document(b"   ", "empty.txt").is_err());
    }

    #[test]
    fn docx_text_runs_are_extracted() {
        // Minimal in-memory DOCX: a zip with just word/document.xml.
        let xml = r#"<?xml version="1.0"?><w:document><w:body>
            <w:p><w:r><w:t>Premier paragraphe.</w:t></w:r></w:p>
            <w:p><w:r><w:t xml:space="preserve">Second </w:t></w:r><w:r><w:t>paragraphe.</w:t></w:r></w:p>
            </w:body></w:document>"#;
        let mut buffer = std::io::Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut buffer);
            writer
                .start_file("word/document.xml", zip::write::SimpleFileOptions::default())
                .unwrap();
            std::io::Write::write_all(&mut writer, xml.as_bytes()).unwrap();
            writer.finish().unwrap();
        }
        let text = decode_document(buffer.get_ref(), "doc.docx").unwrap();
        assert!(text.contains("Premier paragraphe."));
        assert!(text.contains("Second paragraphe."));
    }

    #[test]
    fn corrupt_pdf_is_an_invalid_argument() {
        let err = decode_document(b"not a pdf at all", "broken.pdf").unwrap_err();
        assert_eq!(err.kind(), "invalid_argument");
    }
}
