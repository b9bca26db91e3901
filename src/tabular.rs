//! Recovers a comma-delimited table from a model's free-text answer and
//! appends it to a workbook as a styled sheet.
//!
//! Extraction tries, in order: the contents of a fenced code block, the first
//! contiguous run of comma or pipe rows, and finally a loose `key: value`
//! record parse that is converted to CSV with headers chosen per record kind.

use crate::error::{Error, Result};
use crate::render::{set_thin_border, HEADER_FILL};
use regex::Regex;
use std::collections::HashSet;
use std::path::Path;
use std::sync::LazyLock;
use tracing::{debug, info, warn};
use umya_spreadsheet::{HorizontalAlignmentValues, VerticalAlignmentValues};

pub const NO_DATA_MESSAGE: &str = "Данные не найдены";
const RAW_PREVIEW_CHARS: usize = 1000;
const MIN_COLUMN_WIDTH: usize = 15;
const MAX_COLUMN_WIDTH: usize = 50;

static FENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```(?:[A-Za-z0-9_+-]*[ \t]*\r?\n)?(.*?)```").expect("fence pattern")
});
static COMMA_SPACING_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s*,\s*").expect("comma pattern"));
static KEY_VALUE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^["']?([^:]+?)["']?\s*:\s*(.+)$"#).expect("key-value pattern")
});

// ============================================================================
// Extraction
// ============================================================================

/// Recover CSV text from a model answer. Returns an empty string when nothing
/// table-like is found.
pub fn extract_table(text: &str) -> String {
    if text.trim().is_empty() {
        return String::new();
    }

    let body = strip_code_fence(text);

    let rows = delimited_run(&body);
    if !rows.is_empty() {
        debug!("Found {} delimited rows", rows.len());
        return rows.join("\n");
    }

    let records = parse_records(&body);
    if records.is_empty() {
        debug!("No table found in model answer");
        return String::new();
    }
    records_to_csv(&records)
}

fn strip_code_fence(text: &str) -> String {
    match FENCE_RE.captures(text).and_then(|c| c.get(1)) {
        Some(inner) => inner.as_str().trim().to_string(),
        None => text.trim().to_string(),
    }
}

enum LineKind {
    Row(String),
    Separator,
    Other,
}

/// Pipe rows are split on `|` before any comma handling, so commas inside a
/// cell stay in that cell.
fn classify_line(line: &str) -> LineKind {
    if is_pipe_row(line) {
        let inner = line.trim_matches('|');
        if inner.chars().all(|c| matches!(c, '-' | ':' | '|' | ' ' | '\t')) {
            return LineKind::Separator;
        }
        let cells: Vec<String> = inner.split('|').map(|c| c.trim().to_string()).collect();
        return LineKind::Row(csv_line(&cells));
    }

    if line.contains(',') {
        let stripped = line.replace('|', "");
        return LineKind::Row(COMMA_SPACING_RE.replace_all(stripped.trim(), ",").into_owned());
    }

    LineKind::Other
}

fn is_pipe_row(line: &str) -> bool {
    line.starts_with('|') && line.matches('|').count() >= 2
}

fn is_comment(line: &str) -> bool {
    line.starts_with('#') || line.starts_with("//")
}

/// First contiguous run of table rows. Blank and comment lines inside a run
/// are skipped; any other line ends it.
fn delimited_run(body: &str) -> Vec<String> {
    let mut rows = Vec::new();
    let mut in_run = false;

    for raw in body.lines() {
        let line = raw.trim();
        if line.is_empty() || is_comment(line) {
            continue;
        }
        match classify_line(line) {
            LineKind::Row(row) => {
                in_run = true;
                rows.push(row);
            }
            LineKind::Separator => in_run = true,
            LineKind::Other if in_run => break,
            LineKind::Other => {}
        }
    }

    rows
}

fn csv_line(cells: &[String]) -> String {
    cells.iter().map(|c| csv_field(c)).collect::<Vec<_>>().join(",")
}

/// Quote a field that contains a comma, quote or line break.
fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

// ============================================================================
// Key-value records
// ============================================================================

/// Ordered `key: value` pairs recovered from one JSON-ish object.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    fields: Vec<(String, String)>,
}

impl Record {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn set(&mut self, key: &str, value: String) {
        match self.fields.iter_mut().find(|(k, _)| k == key) {
            Some(field) => field.1 = value,
            None => self.fields.push((key.to_string(), value)),
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(k, _)| k.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Parse loose `key: value` lines. A closing `}` or `]` ends a record.
pub fn parse_records(body: &str) -> Vec<Record> {
    let mut records = Vec::new();
    let mut current = Record::default();

    for raw in body.lines() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        if matches!(line, "}" | "]" | "}," | "],") {
            if !current.is_empty() {
                records.push(std::mem::take(&mut current));
            }
            continue;
        }
        if line.starts_with('{') || line.starts_with('[') || is_comment(line) {
            continue;
        }
        if let Some(caps) = KEY_VALUE_RE.captures(line) {
            let key = caps[1].trim().trim_matches(|c| c == '"' || c == '\'');
            let value = clean_value(&caps[2]);
            current.set(key, value);
        }
    }

    if !current.is_empty() {
        records.push(current);
    }
    records
}

fn clean_value(raw: &str) -> String {
    let value = raw.trim().trim_end_matches(',').trim();
    if value.eq_ignore_ascii_case("null") {
        return String::new();
    }
    let unquoted = value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')));
    unquoted.unwrap_or(value).to_string()
}

/// What the recovered records describe; decides header names and order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Service,
    Tooling,
    SparePart,
    Generic,
}

/// Keys and values seen across a batch of records.
pub struct RecordBatch<'a> {
    records: &'a [Record],
    keys: Vec<&'a str>,
}

impl<'a> RecordBatch<'a> {
    pub fn new(records: &'a [Record]) -> Self {
        let mut seen = HashSet::new();
        let keys = records
            .iter()
            .flat_map(|r| r.keys())
            .filter(|k| seen.insert(*k))
            .collect();
        Self { records, keys }
    }

    fn has_key(&self, key: &str) -> bool {
        self.keys.iter().any(|k| *k == key)
    }

    fn has_key_containing(&self, needles: &[&str]) -> bool {
        self.keys.iter().any(|k| {
            let k = k.to_lowercase();
            needles.iter().any(|n| k.contains(n))
        })
    }

    fn any_value_contains(&self, key: &str, needles: &[&str]) -> bool {
        self.records.iter().any(|r| {
            let value = r.get(key).unwrap_or("").to_lowercase();
            needles.iter().any(|n| value.contains(n))
        })
    }
}

/// A named predicate over a record batch.
pub struct KindRule {
    pub kind: RecordKind,
    pub name: &'static str,
    pub matches: fn(&RecordBatch<'_>) -> bool,
}

const SERVICE_WORK: &[&str] = &[
    "монтаж",
    "обучение",
    "пусконаладка",
    "инжиниринг",
    "программирование",
];
const CLAMP_RANGE: &[&str] = &["диапазон", "зажима"];
const TOOLING_VALUES: &[&str] = &["инструмент", "оснастка", "патрон", "люнет"];

fn has_service_key(b: &RecordBatch<'_>) -> bool {
    b.has_key_containing(&["услуга", "service"])
}

fn describes_service_work(b: &RecordBatch<'_>) -> bool {
    b.has_key("description") && b.any_value_contains("type", SERVICE_WORK)
}

fn description_without_tooling(b: &RecordBatch<'_>) -> bool {
    b.has_key("description")
        && !b.has_key_containing(CLAMP_RANGE)
        && !(b.has_key_containing(&["тип"]) && b.any_value_contains("type", &["люнет", "патрон"]))
}

fn typed_tooling(b: &RecordBatch<'_>) -> bool {
    b.has_key_containing(&["тип", "type"])
        && (b.has_key_containing(CLAMP_RANGE) || b.any_value_contains("type", TOOLING_VALUES))
}

fn has_category_key(b: &RecordBatch<'_>) -> bool {
    b.has_key_containing(&["категория", "category"])
}

fn relative_cost_unit(b: &RecordBatch<'_>) -> bool {
    b.any_value_contains("unit", &["%", "стоимости"])
}

/// Evaluated in order; the first match wins.
pub const KIND_RULES: &[KindRule] = &[
    KindRule {
        kind: RecordKind::Service,
        name: "service key",
        matches: has_service_key,
    },
    KindRule {
        kind: RecordKind::Service,
        name: "service work type",
        matches: describes_service_work,
    },
    KindRule {
        kind: RecordKind::Service,
        name: "description without tooling markers",
        matches: description_without_tooling,
    },
    KindRule {
        kind: RecordKind::Tooling,
        name: "typed tooling",
        matches: typed_tooling,
    },
    KindRule {
        kind: RecordKind::SparePart,
        name: "category key",
        matches: has_category_key,
    },
    KindRule {
        kind: RecordKind::SparePart,
        name: "relative cost unit",
        matches: relative_cost_unit,
    },
];

pub fn infer_record_kind(records: &[Record]) -> RecordKind {
    let batch = RecordBatch::new(records);
    match KIND_RULES.iter().find(|rule| (rule.matches)(&batch)) {
        Some(rule) => {
            debug!("Record kind {:?} via rule '{}'", rule.kind, rule.name);
            rule.kind
        }
        None => RecordKind::Generic,
    }
}

/// Exact key renames shared by every kind. `name` is handled separately.
const HEADER_ALIASES: &[(&str, &str)] = &[
    ("ref", "Источник"),
    ("type", "Тип"),
    ("quantity", "Количество"),
    ("unit", "Единица"),
    ("article", "Артикул"),
    ("description", "Описание/условия"),
    ("описание", "Описание/условия"),
    ("условия", "Описание/условия"),
    ("источник", "Источник"),
    ("уверенность", "Уверенность"),
    ("примечание", "Примечание"),
    ("категория", "Категория"),
    ("наличие", "Наличие"),
    ("диапазон зажима", "Примечание"),
    ("услуга", "Услуга"),
];

pub fn header_for(key: &str, kind: RecordKind) -> String {
    if key == "name" {
        return match kind {
            RecordKind::Service => "Услуга",
            _ => "Наименование",
        }
        .to_string();
    }
    if kind == RecordKind::Tooling {
        let lower = key.to_lowercase();
        if CLAMP_RANGE.iter().any(|n| lower.contains(n)) {
            return "Примечание".to_string();
        }
    }
    HEADER_ALIASES
        .iter()
        .find(|(alias, _)| *alias == key)
        .map(|(_, header)| header.to_string())
        .unwrap_or_else(|| key.to_string())
}

fn header_priority(kind: RecordKind) -> &'static [&'static str] {
    match kind {
        RecordKind::Service => &["Услуга", "Описание/условия", "Источник", "Тип"],
        RecordKind::Tooling => &[
            "Наименование",
            "Количество",
            "Тип",
            "Примечание",
            "Источник",
            "Уверенность",
            "Единица",
        ],
        RecordKind::SparePart => &[
            "Наименование",
            "Количество",
            "Категория",
            "Источник",
            "Уверенность",
            "Единица",
        ],
        RecordKind::Generic => &[
            "Наименование",
            "Количество",
            "Тип",
            "Описание/условия",
            "Источник",
            "Уверенность",
            "Единица",
        ],
    }
}

/// Convert records to CSV: priority headers first, the rest alphabetical.
pub fn records_to_csv(records: &[Record]) -> String {
    let kind = infer_record_kind(records);
    let batch = RecordBatch::new(records);

    // header -> original keys, in first-seen order
    let mut sources: Vec<(String, Vec<&str>)> = Vec::new();
    for &key in &batch.keys {
        let header = header_for(key, kind);
        match sources.iter_mut().find(|(h, _)| *h == header) {
            Some((_, keys)) => keys.push(key),
            None => sources.push((header, vec![key])),
        }
    }

    let priority = header_priority(kind);
    let mut headers: Vec<&str> = priority
        .iter()
        .copied()
        .filter(|p| sources.iter().any(|(h, _)| h == p))
        .collect();
    let mut rest: Vec<&str> = sources
        .iter()
        .map(|(h, _)| h.as_str())
        .filter(|h| !priority.contains(h))
        .collect();
    rest.sort_unstable();
    headers.extend(rest);

    let mut lines = vec![csv_line(
        &headers.iter().map(|h| h.to_string()).collect::<Vec<_>>(),
    )];
    for record in records {
        let cells: Vec<String> = headers
            .iter()
            .map(|header| {
                sources
                    .iter()
                    .find(|(h, _)| h == header)
                    .and_then(|(_, keys)| keys.iter().find_map(|k| record.get(k)))
                    .unwrap_or("")
                    .to_string()
            })
            .collect();
        lines.push(csv_line(&cells));
    }
    lines.join("\n")
}

// ============================================================================
// Sheet append
// ============================================================================

/// Write `table` into `workbook` as sheet `sheet_name` and return the number of
/// data rows written. A sheet with the same name is replaced. A missing
/// workbook is created.
pub fn append_table_sheet(workbook: &Path, table: &str, sheet_name: &str) -> Result<usize> {
    let mut book = if workbook.exists() {
        umya_spreadsheet::reader::xlsx::read(workbook).map_err(|e| Error::conversion(workbook, e))?
    } else {
        info!("Workbook {} does not exist yet, creating it", workbook.display());
        umya_spreadsheet::new_file_empty_worksheet()
    };

    if book.get_sheet_by_name(sheet_name).is_some() {
        book.remove_sheet_by_name(sheet_name)
            .map_err(|e| Error::conversion(workbook, e))?;
    }
    let sheet = book
        .new_sheet(sheet_name)
        .map_err(|e| Error::conversion(workbook, e))?;

    let rows = match parse_csv(table) {
        Ok(rows) => rows,
        Err(e) => {
            warn!("Could not parse table for sheet '{}': {}", sheet_name, e);
            sheet
                .get_cell_mut("A1")
                .set_value_string(format!("Ошибка парсинга CSV: {}", e));
            sheet.get_cell_mut("A2").set_value_string("Исходный текст:");
            let preview: String = table.chars().take(RAW_PREVIEW_CHARS).collect();
            sheet.get_cell_mut("A3").set_value_string(preview);
            save(&book, workbook)?;
            return Ok(0);
        }
    };

    if rows.is_empty() {
        sheet.get_cell_mut("A1").set_value_string(NO_DATA_MESSAGE);
        sheet.get_style_mut("A1").get_font_mut().set_italic(true);
        save(&book, workbook)?;
        return Ok(0);
    }

    let width = rows.iter().map(Vec::len).max().unwrap_or(0);
    let mut column_chars = vec![0usize; width];

    for (r, row) in rows.iter().enumerate() {
        let row_index = r as u32 + 1;
        for (c, value) in row.iter().enumerate() {
            let col_index = c as u32 + 1;
            sheet.get_cell_mut((col_index, row_index)).set_value_string(value);
            column_chars[c] = column_chars[c].max(value.chars().count());

            let style = sheet.get_style_mut((col_index, row_index));
            set_thin_border(style);
            if r == 0 {
                style.set_background_color(HEADER_FILL);
                style.get_font_mut().set_bold(true);
                let alignment = style.get_alignment_mut();
                alignment.set_horizontal(HorizontalAlignmentValues::Center);
                alignment.set_vertical(VerticalAlignmentValues::Center);
            }
        }
    }

    for (c, chars) in column_chars.iter().enumerate() {
        let width = (chars + 2).clamp(MIN_COLUMN_WIDTH, MAX_COLUMN_WIDTH);
        sheet
            .get_column_dimension_mut(&column_letter(c as u32 + 1))
            .set_width(width as f64);
    }

    save(&book, workbook)?;
    let data_rows = rows.len() - 1;
    info!("Sheet '{}' written with {} data rows", sheet_name, data_rows);
    Ok(data_rows)
}

fn parse_csv(table: &str) -> std::result::Result<Vec<Vec<String>>, csv::Error> {
    if table.trim().is_empty() {
        return Ok(Vec::new());
    }
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(table.as_bytes());

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        rows.push(record.iter().map(|v| v.trim().to_string()).collect());
    }
    Ok(rows)
}

fn save(book: &umya_spreadsheet::Spreadsheet, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| Error::conversion(path, e))?;
    }
    umya_spreadsheet::writer::xlsx::write(book, path).map_err(|e| Error::conversion(path, e))
}

/// 1-based column index to letters: 1 -> A, 27 -> AA.
fn column_letter(mut index: u32) -> String {
    let mut letters = Vec::new();
    while index > 0 {
        let rem = (index - 1) % 26;
        letters.push((b'A' + rem as u8) as char);
        index = (index - 1) / 26;
    }
    letters.iter().rev().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use calamine::{open_workbook, Reader, Xlsx};

    fn sheet_rows(path: &Path, name: &str) -> Vec<Vec<String>> {
        let mut workbook: Xlsx<_> = open_workbook(path).unwrap();
        let range = workbook.worksheet_range(name).unwrap();
        range
            .rows()
            .map(|row| row.iter().map(|c| c.to_string()).collect())
            .collect()
    }

    #[test]
    fn test_fenced_csv() {
        let text = "Вот таблица:\n```csv\nНаименование, Количество\nРезец , 2\n```\nГотово.";
        assert_eq!(extract_table(text), "Наименование,Количество\nРезец,2");
    }

    #[test]
    fn test_run_skips_comments_and_stops_at_prose() {
        let text = "Инструмент:\nname,quantity\n# комментарий\n\nРезец,2\nИтого два резца.\nлишнее,1";
        assert_eq!(extract_table(text), "name,quantity\nРезец,2");
    }

    #[test]
    fn test_pipe_table() {
        let text = "| Наименование | Количество |\n|---|---|\n| Патрон | 1 |\n| Люнет | 2 |";
        assert_eq!(
            extract_table(text),
            "Наименование,Количество\nПатрон,1\nЛюнет,2"
        );
    }

    #[test]
    fn test_pipe_cell_with_comma_stays_one_cell() {
        let text = "```\n| Наименование | Количество |\n|---|---|\n| Резец, проходной | 2 |\n| Сверло | 4 |\n```";
        assert_eq!(
            extract_table(text),
            "Наименование,Количество\n\"Резец, проходной\",2\nСверло,4"
        );
    }

    #[test]
    fn test_three_key_value_records_give_three_rows() {
        let text = "{\nname: Резец проходной\nquantity: 2\n}\n{\nname: Сверло\nquantity: 4\n}\n{\nname: Метчик М12\nquantity: 10\n}";
        let table = extract_table(text);
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], "Наименование,Количество");
        assert_eq!(lines[3], "Метчик М12,10");
    }

    #[test]
    fn test_empty_and_prose_only() {
        assert_eq!(extract_table(""), "");
        assert_eq!(extract_table("   \n "), "");
        assert_eq!(extract_table("Ничего не найдено"), "");
    }

    #[test]
    fn test_key_value_fallback_for_services() {
        let text = r#"{
  name: "Пусконаладка"
  description: "На площадке заказчика"
  ref: "п. 5.2"
}
{
  name: "Обучение"
  description: null
  ref: "п. 5.3"
}"#;
        assert_eq!(
            extract_table(text),
            "Услуга,Описание/условия,Источник\nПусконаладка,На площадке заказчика,п. 5.2\nОбучение,,п. 5.3"
        );
    }

    #[test]
    fn test_key_value_fallback_for_tooling() {
        let records = parse_records(
            "{\nname: Патрон\ntype: патрон трёхкулачковый\nдиапазон зажима: 20-250 мм\nquantity: 1\n}",
        );
        assert_eq!(infer_record_kind(&records), RecordKind::Tooling);
        assert_eq!(
            records_to_csv(&records),
            "Наименование,Количество,Тип,Примечание\nПатрон,1,патрон трёхкулачковый,20-250 мм"
        );
    }

    #[test]
    fn test_record_kind_rules() {
        let spare = parse_records("{\nname: Фильтр\nкатегория: расходники\n}");
        assert_eq!(infer_record_kind(&spare), RecordKind::SparePart);

        let percent = parse_records("{\nname: Комплект ЗИП\nunit: % от стоимости\n}");
        assert_eq!(infer_record_kind(&percent), RecordKind::SparePart);

        let service = parse_records("{\nname: Монтаж\nservice: да\n}");
        assert_eq!(infer_record_kind(&service), RecordKind::Service);

        let generic = parse_records("{\nname: Станок\nquantity: 1\n}");
        assert_eq!(infer_record_kind(&generic), RecordKind::Generic);

        // A steady rest with a description is tooling, not a service.
        let steady_rest = parse_records(
            "{\nname: Люнет\ntype: люнет\nтип крепления: на станине\ndescription: самоцентрирующий\n}",
        );
        assert_eq!(infer_record_kind(&steady_rest), RecordKind::Tooling);
    }

    #[test]
    fn test_csv_quoting() {
        let records = parse_records("{\nname: Резец, проходной\nquantity: 2\n}");
        assert_eq!(
            records_to_csv(&records),
            "Наименование,Количество\n\"Резец, проходной\",2"
        );
    }

    #[test]
    fn test_column_letter() {
        assert_eq!(column_letter(1), "A");
        assert_eq!(column_letter(26), "Z");
        assert_eq!(column_letter(27), "AA");
    }

    #[test]
    fn test_append_creates_and_replaces_sheet() {
        let dir = tempfile::tempdir().unwrap();
        let workbook = dir.path().join("out.xlsx");

        let rows = append_table_sheet(&workbook, "Наименование,Количество\nРезец,2", "Инструмент")
            .unwrap();
        assert_eq!(rows, 1);

        let rows = append_table_sheet(
            &workbook,
            "Наименование,Количество\nРезец,2\nСверло,4",
            "Инструмент",
        )
        .unwrap();
        assert_eq!(rows, 2);

        let workbook_sheets: Xlsx<_> = open_workbook(&workbook).unwrap();
        let names = workbook_sheets.sheet_names();
        assert_eq!(names.iter().filter(|n| *n == "Инструмент").count(), 1);

        assert_eq!(
            sheet_rows(&workbook, "Инструмент"),
            vec![
                vec!["Наименование".to_string(), "Количество".to_string()],
                vec!["Резец".to_string(), "2".to_string()],
                vec!["Сверло".to_string(), "4".to_string()],
            ]
        );
    }

    #[test]
    fn test_append_empty_table_writes_placeholder() {
        let dir = tempfile::tempdir().unwrap();
        let workbook = dir.path().join("out.xlsx");
        let rows = append_table_sheet(&workbook, "", "ЗИП").unwrap();
        assert_eq!(rows, 0);
        assert_eq!(
            sheet_rows(&workbook, "ЗИП"),
            vec![vec![NO_DATA_MESSAGE.to_string()]]
        );
    }
}
