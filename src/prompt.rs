//! Prompt assembly: loads a main prompt with its template and glossary and
//! substitutes them, plus the document text, at the trailing placeholders.

use crate::error::{Error, Result};
use regex::Regex;
use serde_json::Value;
use std::path::Path;
use std::sync::LazyLock;
use tracing::debug;

const TEMPLATE_MARKER: &str = "JSON-шаблон параметров станка\n\n";
const GLOSSARY_MARKER: &str = "\nJSON-глоссарий\n\n";
const GLOSSARY_MARKER_BARE: &str = "JSON-глоссарий\n\n";
const TEXT_MARKER: &str = "\nТекст ТЗ\n";
const TEXT_MARKER_BARE: &str = "Текст ТЗ\n";

// Older prompt files used colon-style headings.
const LEGACY_TEMPLATE_MARKER: &str = "Шаблон JSON:\n\n";
const LEGACY_TEXT_MARKER: &str = "Текст ТЗ:\n\n";

static AUX_PLACEHOLDER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{текст ТЗ\}|Текст ТЗ:|Текст ТЗ\n").expect("placeholder pattern")
});

const PREVIEW_CHARS: usize = 200;

/// A loaded main prompt ready to receive document text.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    template: String,
    schema: Value,
    glossary: Value,
}

impl PromptBuilder {
    pub fn new(template: impl Into<String>, schema: Value, glossary: Value) -> Self {
        Self {
            template: template.into(),
            schema,
            glossary,
        }
    }

    /// Load the prompt text, schema template and glossary from disk.
    pub fn load(prompt_path: &Path, schema_path: &Path, glossary_path: &Path) -> Result<Self> {
        let template = load_prompt_text(prompt_path)?;
        let schema = load_json_file(schema_path)?;
        let glossary = load_json_file(glossary_path)?;
        Ok(Self::new(template, schema, glossary))
    }

    /// Substitute the last occurrence of each placeholder. Earlier mentions
    /// of the same headings in the instructions are left alone. All
    /// placeholders are located in the template first, so text inserted for
    /// one of them is never searched again.
    pub fn build(&self, document_text: &str) -> String {
        let schema_block = format!("JSON-шаблон параметров станка\n{}\n\n", pretty(&self.schema));
        let glossary_block = format!("JSON-глоссарий\n{}\n\n", pretty(&self.glossary));
        let text_block = format!("Текст ТЗ\n{}\n", document_text);
        let legacy_text_block = format!("Текст ТЗ\n{}\n\n", document_text);
        let template = self.template.as_str();
        let mut spans = Vec::new();

        if let Some(pos) = template.rfind(TEMPLATE_MARKER) {
            spans.push(Span::new(pos, TEMPLATE_MARKER.len(), &schema_block));
        }

        // The leading newline of the marker may be the tail of the previous
        // block, so only the heading itself is replaced.
        let glossary_at = template
            .rfind(GLOSSARY_MARKER)
            .map(|pos| pos + 1)
            .or_else(|| template.rfind(GLOSSARY_MARKER_BARE));
        if let Some(pos) = glossary_at {
            spans.push(Span::new(pos, GLOSSARY_MARKER_BARE.len(), &glossary_block));
        }

        let text_at = template.rfind(TEXT_MARKER).map(|pos| pos + 1).or_else(|| {
            template
                .ends_with(TEXT_MARKER_BARE)
                .then(|| template.len() - TEXT_MARKER_BARE.len())
        });
        if let Some(pos) = text_at {
            spans.push(Span::new(pos, TEXT_MARKER_BARE.len(), &text_block));
        }

        for (pos, _) in template.match_indices(LEGACY_TEMPLATE_MARKER) {
            spans.push(Span::new(pos, LEGACY_TEMPLATE_MARKER.len(), &schema_block));
        }
        for (pos, _) in template.match_indices(LEGACY_TEXT_MARKER) {
            spans.push(Span::new(pos, LEGACY_TEXT_MARKER.len(), &legacy_text_block));
        }

        let prompt = splice(template, spans);
        debug!("Built prompt of {} characters", prompt.chars().count());
        prompt
    }
}

/// A byte range of the template and the text that replaces it.
struct Span<'a> {
    start: usize,
    end: usize,
    replacement: &'a str,
}

impl<'a> Span<'a> {
    fn new(start: usize, len: usize, replacement: &'a str) -> Self {
        Self {
            start,
            end: start + len,
            replacement,
        }
    }
}

/// Stitch the template back together with every span replaced. A span that
/// overlaps an earlier one is dropped.
fn splice(template: &str, mut spans: Vec<Span<'_>>) -> String {
    spans.sort_by_key(|span| span.start);
    let mut out = String::with_capacity(template.len());
    let mut cursor = 0;
    for span in spans {
        if span.start < cursor {
            continue;
        }
        out.push_str(&template[cursor..span.start]);
        out.push_str(span.replacement);
        cursor = span.end;
    }
    out.push_str(&template[cursor..]);
    out
}

/// Fill an auxiliary prompt: every placeholder form is replaced by the
/// document text in one left-to-right pass.
pub fn substitute_document_text(template: &str, document_text: &str) -> String {
    AUX_PLACEHOLDER_RE
        .replace_all(template, |caps: &regex::Captures<'_>| {
            if caps[0].ends_with('\n') {
                format!("{}\n", document_text)
            } else {
                document_text.to_string()
            }
        })
        .into_owned()
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

/// Read a prompt file; a missing or blank file is an error.
pub fn load_prompt_text(path: &Path) -> Result<String> {
    if !path.exists() {
        return Err(Error::NotFound(path.to_path_buf()));
    }
    let text = std::fs::read_to_string(path)?;
    if text.trim().is_empty() {
        return Err(Error::Validation(format!(
            "Prompt file is empty: {}",
            path.display()
        )));
    }
    Ok(text)
}

/// Read a JSON file, reporting emptiness and parse errors with a preview.
pub fn load_json_file(path: &Path) -> Result<Value> {
    if !path.exists() {
        return Err(Error::NotFound(path.to_path_buf()));
    }
    let content = std::fs::read_to_string(path)?;
    let content = content.trim();
    if content.is_empty() {
        let size = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
        return Err(Error::Validation(format!(
            "{} is empty or whitespace only ({} bytes)",
            path.display(),
            size
        )));
    }

    serde_json::from_str(content).map_err(|e| {
        let preview: String = content.chars().take(PREVIEW_CHARS).collect();
        Error::Validation(format!(
            "Invalid JSON in {}: {}. First {} characters: {}",
            path.display(),
            e,
            PREVIEW_CHARS,
            preview
        ))
    })
}
