//! Document-to-text conversion for uploaded specifications.

use crate::error::{Error, Result};
use crate::sheet_import::cell_to_string;
use calamine::{open_workbook_auto, Reader};
use std::fs::{self, File};
use std::io::Read;
use std::path::Path;
use tracing::{debug, info, warn};
use zip::ZipArchive;

const W_NS: &str = "http://schemas.openxmlformats.org/wordprocessingml/2006/main";

/// Turns an uploaded file into plain UTF-8 text.
pub trait DocumentConverter: Send + Sync {
    fn convert(&self, path: &Path) -> Result<String>;
}

/// Dispatches on the file extension.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultConverter;

impl DocumentConverter for DefaultConverter {
    fn convert(&self, path: &Path) -> Result<String> {
        if !path.exists() {
            return Err(Error::NotFound(path.to_path_buf()));
        }
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_lowercase)
            .unwrap_or_default();

        let text = match extension.as_str() {
            "txt" => {
                let bytes = fs::read(path)?;
                String::from_utf8_lossy(&bytes).into_owned()
            }
            "pdf" => pdf_text(path)?,
            "xls" | "xlsx" => spreadsheet_text(path)?,
            "docx" => docx_text(path)?,
            "doc" => {
                return Err(Error::UnsupportedFormat(
                    "legacy .doc files are not supported, save the document as .docx".to_string(),
                ))
            }
            other => return Err(Error::UnsupportedFormat(format!(".{}", other))),
        };

        info!(
            "Converted {} to {} characters of text",
            path.display(),
            text.chars().count()
        );
        Ok(text)
    }
}

fn pdf_text(path: &Path) -> Result<String> {
    use lopdf::Document;

    let doc = Document::load(path)
        .map_err(|e| Error::UnsupportedFormat(format!("Failed to load PDF: {}", e)))?;

    let mut text = String::new();
    for (page_num, _) in doc.get_pages() {
        match doc.extract_text(&[page_num]) {
            Ok(content) => {
                text.push_str(&format!("--- Страница {} ---\n", page_num));
                text.push_str(content.trim_end());
                text.push_str("\n\n");
            }
            Err(e) => warn!("Skipping PDF page {}: {}", page_num, e),
        }
    }
    Ok(text)
}

fn spreadsheet_text(path: &Path) -> Result<String> {
    let mut workbook = open_workbook_auto(path)
        .map_err(|e| Error::UnsupportedFormat(format!("Failed to open spreadsheet: {}", e)))?;

    let mut blocks = Vec::new();
    for name in workbook.sheet_names() {
        let range = match workbook.worksheet_range(&name) {
            Ok(range) => range,
            Err(e) => {
                warn!("Skipping sheet '{}': {}", name, e);
                continue;
            }
        };

        let mut block = format!("=== Лист: {} ===\n", name);
        for row in range.rows() {
            let cells: Vec<String> = row
                .iter()
                .map(cell_to_string)
                .filter(|c| !c.is_empty())
                .collect();
            if !cells.is_empty() {
                block.push_str(&cells.join(" | "));
                block.push('\n');
            }
        }
        blocks.push(block);
    }
    Ok(blocks.join("\n"))
}

fn docx_text(path: &Path) -> Result<String> {
    let file = File::open(path)?;
    let mut archive = ZipArchive::new(file)
        .map_err(|e| Error::UnsupportedFormat(format!("Not a DOCX archive: {}", e)))?;

    let mut xml = String::new();
    archive
        .by_name("word/document.xml")
        .map_err(|e| Error::UnsupportedFormat(format!("DOCX without document body: {}", e)))?
        .read_to_string(&mut xml)?;

    let doc = roxmltree::Document::parse(&xml)
        .map_err(|e| Error::UnsupportedFormat(format!("Broken DOCX XML: {}", e)))?;

    let paragraphs: Vec<String> = doc
        .descendants()
        .filter(|n| n.has_tag_name((W_NS, "p")))
        .map(|p| {
            let mut line = String::new();
            for node in p.descendants() {
                if node.has_tag_name((W_NS, "t")) {
                    line.push_str(node.text().unwrap_or(""));
                } else if node.has_tag_name((W_NS, "tab")) {
                    line.push('\t');
                } else if node.has_tag_name((W_NS, "br")) {
                    line.push('\n');
                }
            }
            line
        })
        .filter(|line| !line.trim().is_empty())
        .collect();

    debug!("DOCX {}: {} paragraphs", path.display(), paragraphs.len());
    Ok(paragraphs.join("\n"))
}
