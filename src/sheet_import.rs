//! Reverse of the renderer: reads a schema-layout worksheet back into an empty
//! template and its glossary.
//!
//! Column A carries the row name, D the unit, E the level (1 section,
//! 2 subsection, 3 parameter) and F a list of synonyms for the glossary.
//! The importer tracks at most two ancestors, so a subsection nested inside
//! another subsection is flattened under its section on the way back.

use crate::error::{Error, Result};
use crate::tree::{
    is_parameter, save_json, GlossaryEntry, GlossaryTree, NodeKind, Parameter, SchemaTree, Tree,
    UNIT_KEY,
};
use calamine::{open_workbook_auto, Data, Reader};
use serde::Serialize;
use serde_json::{Map, Value};
use std::path::Path;
use tracing::{debug, info, warn};

const NAME_COLUMN: usize = 0;
const UNIT_COLUMN: usize = 3;
const LEVEL_COLUMN: usize = 4;
const MATCH_COLUMN: usize = 5;

/// Cell text of the columns the importer reads, already trimmed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawRow {
    pub number: usize,
    pub name: String,
    pub unit: String,
    pub level: String,
    pub matches: String,
}

/// One accepted worksheet row with its resolved path.
#[derive(Debug, Clone, PartialEq)]
pub struct SheetItem {
    pub row: usize,
    pub name: String,
    pub kind: NodeKind,
    pub unit: Option<String>,
    pub matches: Option<Vec<String>>,
    pub path: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ImportStats {
    pub sections: usize,
    pub subsections: usize,
    pub parameters_in_sheet: usize,
    pub parameters_in_template: usize,
    pub parameters_in_glossary: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchemaImport {
    pub template: Value,
    pub glossary: Value,
    pub stats: ImportStats,
}

#[derive(Debug, Clone, Copy)]
pub struct ImportOptions {
    /// Merge into an existing template file instead of replacing it.
    pub preserve_existing: bool,
    /// Compute the result without writing any file.
    pub dry_run: bool,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            preserve_existing: true,
            dry_run: false,
        }
    }
}

// ============================================================================
// Reading
// ============================================================================

/// Read the first worksheet of `path` into raw rows.
pub fn read_raw_rows(path: &Path) -> Result<Vec<RawRow>> {
    if !path.exists() {
        return Err(Error::NotFound(path.to_path_buf()));
    }

    let mut workbook = open_workbook_auto(path)
        .map_err(|e| Error::Extraction(format!("Cannot open {}: {}", path.display(), e)))?;
    let range = workbook
        .worksheet_range_at(0)
        .ok_or_else(|| Error::Extraction(format!("{} has no worksheets", path.display())))?
        .map_err(|e| Error::Extraction(format!("Cannot read first sheet: {}", e)))?;

    // The range starts at the first used cell, not necessarily A1.
    let (first_row, first_col) = range.start().unwrap_or((0, 0));
    let cell = |row: &[Data], column: usize| -> String {
        (column as u32)
            .checked_sub(first_col)
            .and_then(|offset| row.get(offset as usize))
            .map(|c| cell_to_string(c).trim().to_string())
            .unwrap_or_default()
    };

    Ok(range
        .rows()
        .enumerate()
        .map(|(index, row)| RawRow {
            number: first_row as usize + index + 1,
            name: cell(row, NAME_COLUMN),
            unit: cell(row, UNIT_COLUMN),
            level: cell(row, LEVEL_COLUMN),
            matches: cell(row, MATCH_COLUMN),
        })
        .collect())
}

/// Render a cell as text; whole floats lose their trailing ".0".
pub(crate) fn cell_to_string(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.clone(),
        Data::Int(i) => i.to_string(),
        Data::Float(f) => {
            if f.fract() == 0.0 && f.abs() < i64::MAX as f64 {
                format!("{}", *f as i64)
            } else {
                format!("{}", f)
            }
        }
        Data::Bool(b) => b.to_string(),
        Data::DateTime(dt) => dt.as_f64().to_string(),
        Data::DateTimeIso(s) | Data::DurationIso(s) => s.clone(),
        Data::Error(e) => format!("#ERR:{:?}", e),
    }
}

/// Resolve each row's path with a two-slot ancestor stack.
///
/// Rows without a name or without an integer level are skipped. Fails when
/// named rows exist but none of them has a level, which means column E is
/// missing rather than sparse.
pub fn items_from_rows(rows: &[RawRow]) -> Result<Vec<SheetItem>> {
    let mut stack: Vec<String> = Vec::new();
    let mut items = Vec::new();
    let mut named = 0usize;
    let mut levelled = 0usize;

    for row in rows {
        if row.name.is_empty() {
            continue;
        }
        named += 1;

        let Ok(level) = row.level.parse::<i64>() else {
            debug!("Row {} has no level, skipping", row.number);
            continue;
        };
        levelled += 1;

        let Some(kind) = NodeKind::from_level(level) else {
            debug!("Row {} has unsupported level {}, skipping", row.number, level);
            continue;
        };

        let path = match kind {
            NodeKind::Section => {
                stack = vec![row.name.clone()];
                stack.clone()
            }
            NodeKind::Subsection => {
                stack = match stack.first() {
                    Some(section) => vec![section.clone(), row.name.clone()],
                    None => vec![row.name.clone()],
                };
                stack.clone()
            }
            NodeKind::Parameter => {
                if stack.is_empty() {
                    warn!("Parameter '{}' on row {} has no parent section, skipping", row.name, row.number);
                    continue;
                }
                let mut path = stack.clone();
                path.push(row.name.clone());
                path
            }
        };

        items.push(SheetItem {
            row: row.number,
            name: row.name.clone(),
            kind,
            unit: non_empty(&row.unit),
            matches: parse_match_list(&row.matches),
            path,
        });
    }

    if named > 0 && levelled == 0 {
        return Err(Error::Extraction(
            "No row carries a level in column E; the sheet is not in schema layout".to_string(),
        ));
    }

    Ok(items)
}

fn non_empty(text: &str) -> Option<String> {
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

/// Split a synonym cell on newlines, else semicolons, else commas.
pub fn parse_match_list(text: &str) -> Option<Vec<String>> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }

    let parts: Vec<String> = if text.contains('\n') {
        text.split('\n').map(str::to_string).collect()
    } else if text.contains(';') {
        text.split(';').map(str::to_string).collect()
    } else if text.contains(',') {
        text.split(',').map(str::to_string).collect()
    } else {
        vec![text.to_string()]
    };

    let parts: Vec<String> = parts
        .into_iter()
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect();

    (!parts.is_empty()).then_some(parts)
}

// ============================================================================
// Building
// ============================================================================

pub fn build_template(items: &[SheetItem]) -> SchemaTree {
    let mut tree = Tree::new();
    for item in items.iter().filter(|i| i.kind == NodeKind::Parameter) {
        tree.insert_leaf(&item.path, Parameter::with_unit(item.unit.clone()));
    }
    tree
}

pub fn build_glossary(items: &[SheetItem]) -> GlossaryTree {
    let mut tree = Tree::new();
    for item in items.iter().filter(|i| i.kind == NodeKind::Parameter) {
        tree.insert_leaf(
            &item.path,
            GlossaryEntry {
                matches: item.matches.clone(),
                unit: item.unit.clone(),
            },
        );
    }
    tree
}

/// Merge a freshly built template with an existing one.
///
/// The fresh structure wins, existing parameter values are kept, and a
/// non-empty fresh unit overrides the existing unit. Keys present only in the
/// existing template are appended after the fresh ones.
pub fn merge_with_existing(fresh: &Value, existing: &Value) -> Value {
    match (fresh.as_object(), existing.as_object()) {
        (Some(fresh), Some(existing)) => Value::Object(merge_maps(fresh, existing)),
        _ => fresh.clone(),
    }
}

fn merge_maps(fresh: &Map<String, Value>, existing: &Map<String, Value>) -> Map<String, Value> {
    let mut merged = fresh.clone();

    for (key, old) in existing {
        let Some(new) = merged.get(key) else {
            merged.insert(key.clone(), old.clone());
            continue;
        };

        let replacement = if is_parameter(old) {
            Some(keep_value_refresh_unit(old, new))
        } else {
            match (new.as_object(), old.as_object()) {
                (Some(new), Some(old)) => Some(Value::Object(merge_maps(new, old))),
                _ => None,
            }
        };

        if let Some(value) = replacement {
            merged.insert(key.clone(), value);
        }
    }

    merged
}

fn keep_value_refresh_unit(old: &Value, new: &Value) -> Value {
    let mut kept = old.clone();
    let fresh_unit = new
        .get(UNIT_KEY)
        .filter(|u| !u.is_null() && u.as_str() != Some(""));

    if let (Some(map), Some(unit)) = (kept.as_object_mut(), fresh_unit) {
        let key = if !map.contains_key(UNIT_KEY) && map.contains_key("unit") {
            "unit"
        } else {
            UNIT_KEY
        };
        map.insert(key.to_string(), unit.clone());
    }
    kept
}

// ============================================================================
// Entry points
// ============================================================================

/// Build a template and glossary from the worksheet at `path`, optionally
/// merging the template into `existing`.
pub fn import_workbook(path: &Path, existing: Option<&Value>) -> Result<SchemaImport> {
    let rows = read_raw_rows(path)?;
    let items = items_from_rows(&rows)?;

    let fresh = build_template(&items).to_json();
    let template = match existing {
        Some(existing) => merge_with_existing(&fresh, existing),
        None => fresh,
    };
    let glossary = build_glossary(&items).to_json();

    let count = |kind| items.iter().filter(|i| i.kind == kind).count();
    let stats = ImportStats {
        sections: count(NodeKind::Section),
        subsections: count(NodeKind::Subsection),
        parameters_in_sheet: count(NodeKind::Parameter),
        parameters_in_template: SchemaTree::from_json(&template).count(NodeKind::Parameter),
        parameters_in_glossary: SchemaTree::from_json(&glossary).count(NodeKind::Parameter),
    };

    info!(
        "Imported {}: {} sections, {} subsections, {} parameters",
        path.display(),
        stats.sections,
        stats.subsections,
        stats.parameters_in_sheet
    );

    Ok(SchemaImport {
        template,
        glossary,
        stats,
    })
}

/// Import `sheet` and write the template and glossary next to each other.
pub fn import_to_files(
    sheet: &Path,
    template_path: &Path,
    glossary_path: &Path,
    options: ImportOptions,
) -> Result<ImportStats> {
    let existing = if options.preserve_existing && template_path.exists() {
        let text = std::fs::read_to_string(template_path)?;
        match serde_json::from_str::<Value>(&text) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Existing template {} is not valid JSON, replacing it: {}", template_path.display(), e);
                None
            }
        }
    } else {
        None
    };

    let import = import_workbook(sheet, existing.as_ref())?;

    if options.dry_run {
        info!("Dry run, nothing written");
        return Ok(import.stats);
    }

    save_json(template_path, &import.template)?;
    save_json(glossary_path, &import.glossary)?;
    info!(
        "Wrote {} and {}",
        template_path.display(),
        glossary_path.display()
    );
    Ok(import.stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::render_workbook;
    use serde_json::json;

    fn row(number: usize, name: &str, level: &str, unit: &str, matches: &str) -> RawRow {
        RawRow {
            number,
            name: name.to_string(),
            unit: unit.to_string(),
            level: level.to_string(),
            matches: matches.to_string(),
        }
    }

    #[test]
    fn test_parse_match_list_separators() {
        assert_eq!(
            parse_match_list("длина\nL ;x"),
            Some(vec!["длина".to_string(), "L ;x".to_string()])
        );
        assert_eq!(
            parse_match_list("a; b;;c"),
            Some(vec!["a".to_string(), "b".to_string(), "c".to_string()])
        );
        assert_eq!(
            parse_match_list("a, b"),
            Some(vec!["a".to_string(), "b".to_string()])
        );
        assert_eq!(parse_match_list("одно"), Some(vec!["одно".to_string()]));
        assert_eq!(parse_match_list("  "), None);
        assert_eq!(parse_match_list(" ; ; "), None);
    }

    #[test]
    fn test_items_from_rows_paths() {
        let rows = vec![
            row(1, "Геометрия", "1", "", ""),
            row(2, "Длина", "3", "мм", "длина; L"),
            row(3, "Шпиндель", "2", "", ""),
            row(4, "Мощность", "3", "кВт", ""),
            row(5, "", "3", "", ""),
            row(6, "Примечание без уровня", "", "", ""),
            row(7, "Глубже", "4", "", ""),
        ];
        let items = items_from_rows(&rows).unwrap();
        let paths: Vec<Vec<String>> = items.iter().map(|i| i.path.clone()).collect();
        assert_eq!(
            paths,
            vec![
                vec!["Геометрия".to_string()],
                vec!["Геометрия".to_string(), "Длина".to_string()],
                vec!["Геометрия".to_string(), "Шпиндель".to_string()],
                vec![
                    "Геометрия".to_string(),
                    "Шпиндель".to_string(),
                    "Мощность".to_string()
                ],
            ]
        );
        assert_eq!(items[1].unit.as_deref(), Some("мм"));
        assert_eq!(
            items[1].matches,
            Some(vec!["длина".to_string(), "L".to_string()])
        );
    }

    #[test]
    fn test_nested_subsection_is_flattened() {
        let rows = vec![
            row(1, "S", "1", "", ""),
            row(2, "Sub1", "2", "", ""),
            row(3, "Sub2", "2", "", ""),
            row(4, "P", "3", "", ""),
        ];
        let items = items_from_rows(&rows).unwrap();
        assert_eq!(items[3].path, vec!["S", "Sub2", "P"]);
    }

    #[test]
    fn test_orphan_parameter_is_skipped() {
        let rows = vec![row(1, "P", "3", "", ""), row(2, "S", "1", "", "")];
        let items = items_from_rows(&rows).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].kind, NodeKind::Section);
    }

    #[test]
    fn test_missing_level_column_is_an_error() {
        let rows = vec![row(1, "A", "", "", ""), row(2, "B", "x", "", "")];
        assert!(matches!(items_from_rows(&rows), Err(Error::Extraction(_))));
        assert!(items_from_rows(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_glossary_parity() {
        let rows = vec![
            row(1, "S", "1", "", ""),
            row(2, "P1", "3", "мм", "a;b"),
            row(3, "Sub", "2", "", ""),
            row(4, "P2", "3", "", ""),
        ];
        let items = items_from_rows(&rows).unwrap();
        let template = build_template(&items);
        let glossary = build_glossary(&items);
        assert_eq!(template.leaf_paths(), glossary.leaf_paths());
        assert_eq!(
            glossary.to_json(),
            json!({"S": {
                "P1": {"match": ["a", "b"], "unit": "мм"},
                "Sub": {"P2": {"match": null, "unit": null}}
            }})
        );
    }

    #[test]
    fn test_merge_keeps_values_and_refreshes_units() {
        let fresh = json!({
            "S": {
                "P": {"значение": null, "единица": "м", "источник": null, "уверенность": null, "комментарий": null},
                "Q": {"значение": null, "единица": null, "источник": null, "уверенность": null, "комментарий": null}
            }
        });
        let existing = json!({
            "S": {
                "Q": {"значение": 7, "единица": "кг"},
                "P": {"значение": 1200, "единица": "мм"},
                "Старый": {"значение": "да"}
            },
            "Удалённая секция": {}
        });

        let merged = merge_with_existing(&fresh, &existing);
        assert_eq!(
            merged,
            json!({
                "S": {
                    "P": {"значение": 1200, "единица": "м"},
                    "Q": {"значение": 7, "единица": "кг"},
                    "Старый": {"значение": "да"}
                },
                "Удалённая секция": {}
            })
        );
        let keys: Vec<&String> = merged["S"].as_object().unwrap().keys().collect();
        assert_eq!(keys, vec!["P", "Q", "Старый"]);
    }

    #[test]
    fn test_import_missing_file() {
        let result = import_workbook(Path::new("/nonexistent/sheet.xlsx"), None);
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[test]
    fn test_render_import_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let sheet = dir.path().join("schema.xlsx");
        let original = json!({
            "Геометрия": {
                "Длина": {"значение": 1200, "единица": "мм", "источник": "п. 2.1", "уверенность": "высокая", "комментарий": null},
                "Шпиндель": {
                    "Мощность": {"значение": "15", "единица": "кВт", "источник": null, "уверенность": null, "комментарий": null}
                }
            },
            "Комплектация": {
                "Патрон": {"значение": "да", "единица": null, "источник": null, "уверенность": null, "комментарий": "в комплекте"}
            }
        });

        render_workbook(&original, &sheet).unwrap();
        let import = import_workbook(&sheet, Some(&original)).unwrap();

        assert_eq!(import.template, original);
        assert_eq!(
            import.stats,
            ImportStats {
                sections: 2,
                subsections: 1,
                parameters_in_sheet: 3,
                parameters_in_template: 3,
                parameters_in_glossary: 3,
            }
        );
    }

    #[test]
    fn test_import_without_existing_gives_empty_parameters() {
        let dir = tempfile::tempdir().unwrap();
        let sheet = dir.path().join("geometry.xlsx");
        render_workbook(
            &json!({"Геометрия": {"Длина": {"значение": 1200, "единица": "мм"}}}),
            &sheet,
        )
        .unwrap();

        let import = import_workbook(&sheet, None).unwrap();
        let expected = json!({
            "Геометрия": {
                "Длина": {
                    "значение": null,
                    "единица": "мм",
                    "источник": null,
                    "уверенность": null,
                    "комментарий": null
                }
            }
        });
        assert_eq!(import.template, expected);
        assert_eq!(
            serde_json::to_string(&import.template).unwrap(),
            serde_json::to_string(&expected).unwrap()
        );
    }

    #[test]
    fn test_render_is_idempotent_through_import() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("first.xlsx");
        let second = dir.path().join("second.xlsx");
        let template = json!({
            "A": {
                "P1": {"значение": null, "единица": "мм"},
                "Sub": {"P2": {"значение": null, "единица": null}}
            },
            "B": {"P3": {"значение": null, "единица": "шт"}}
        });

        render_workbook(&template, &first).unwrap();
        let imported = import_workbook(&first, None).unwrap();
        render_workbook(&imported.template, &second).unwrap();

        let first_items = items_from_rows(&read_raw_rows(&first).unwrap()).unwrap();
        let second_items = items_from_rows(&read_raw_rows(&second).unwrap()).unwrap();
        assert_eq!(first_items, second_items);
    }

    #[test]
    fn test_import_to_files_dry_run_and_write() {
        let dir = tempfile::tempdir().unwrap();
        let sheet = dir.path().join("schema.xlsx");
        let template_path = dir.path().join("TZ_test.json");
        let glossary_path = dir.path().join("glossary_test.json");
        render_workbook(&json!({"S": {"P": {"значение": null, "единица": "мм"}}}), &sheet).unwrap();

        let options = ImportOptions {
            preserve_existing: true,
            dry_run: true,
        };
        let stats = import_to_files(&sheet, &template_path, &glossary_path, options).unwrap();
        assert_eq!(stats.parameters_in_sheet, 1);
        assert!(!template_path.exists());

        std::fs::write(&template_path, r#"{"S": {"P": {"значение": 5, "единица": "см"}}}"#).unwrap();
        import_to_files(&sheet, &template_path, &glossary_path, ImportOptions::default()).unwrap();

        let written: Value =
            serde_json::from_str(&std::fs::read_to_string(&template_path).unwrap()).unwrap();
        assert_eq!(written, json!({"S": {"P": {"значение": 5, "единица": "мм"}}}));
        assert!(glossary_path.exists());
    }
}
