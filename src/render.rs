//! Renders a filled template into the seven-column "ТЗ" worksheet.
//!
//! Columns: A name, B value, C confidence, D unit, E level (hidden), F comment,
//! G source. Sections and subsections are shaded and bold; filled parameter
//! values are highlighted.

use crate::error::{Error, Result};
use crate::tree::{NodeKind, SchemaTree};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use umya_spreadsheet::{
    Border, HorizontalAlignmentValues, VerticalAlignmentValues, Worksheet,
};

pub const MAIN_SHEET_NAME: &str = "ТЗ";

pub(crate) const HEADER_FILL: &str = "FFD3D3D3";
const VALUE_FILL: &str = "FFFFFFE0";
const COLUMN_COUNT: u32 = 7;
const LEVEL_COLUMN: &str = "E";
const COLUMN_WIDTHS: [(&str, f64); 7] = [
    ("A", 60.0),
    ("B", 30.0),
    ("C", 15.0),
    ("D", 15.0),
    ("E", 10.0),
    ("F", 50.0),
    ("G", 40.0),
];

/// One worksheet row in schema layout.
#[derive(Debug, Clone, PartialEq)]
pub struct SheetRow {
    pub name: String,
    pub value: Option<Value>,
    pub confidence: Option<String>,
    pub unit: Option<String>,
    pub level: u8,
    pub comment: Option<String>,
    pub source: Option<String>,
    /// Filled parameter whose value cell gets the highlight fill.
    pub highlight: bool,
}

impl SheetRow {
    fn is_group(&self) -> bool {
        self.level < NodeKind::Parameter.level()
    }
}

/// Flatten a tree into rows, one per node, in pre-order.
pub fn schema_rows(tree: &SchemaTree) -> Vec<SheetRow> {
    tree.rows()
        .into_iter()
        .map(|row| match row.leaf {
            Some(param) => SheetRow {
                name: row.name.to_string(),
                value: (!param.value.is_null()).then(|| param.value.clone()),
                confidence: param.confidence.clone(),
                unit: param.unit.clone(),
                level: row.kind.level(),
                comment: param.comment.clone(),
                source: param.source.clone(),
                highlight: param.has_value(),
            },
            None => SheetRow {
                name: row.name.to_string(),
                value: None,
                confidence: None,
                unit: None,
                level: row.kind.level(),
                comment: None,
                source: None,
                highlight: false,
            },
        })
        .collect()
}

/// Render filled template JSON to `output`, creating parent directories.
pub fn render_workbook(filled: &Value, output: &Path) -> Result<PathBuf> {
    render_tree(&SchemaTree::from_json(filled), output)
}

pub fn render_tree(tree: &SchemaTree, output: &Path) -> Result<PathBuf> {
    if tree.is_empty() {
        warn!("Rendering an empty template to {}", output.display());
    }
    let rows = schema_rows(tree);

    let mut book = umya_spreadsheet::new_file_empty_worksheet();
    let sheet = book
        .new_sheet(MAIN_SHEET_NAME)
        .map_err(|e| Error::conversion(output, e))?;
    write_rows(sheet, &rows);

    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent).map_err(|e| Error::conversion(output, e))?;
    }
    umya_spreadsheet::writer::xlsx::write(&book, output)
        .map_err(|e| Error::conversion(output, e))?;

    debug!("Rendered {} rows to {}", rows.len(), output.display());
    Ok(output.to_path_buf())
}

fn write_rows(sheet: &mut Worksheet, rows: &[SheetRow]) {
    for (index, row) in rows.iter().enumerate() {
        let r = index as u32 + 1;

        sheet.get_cell_mut((1, r)).set_value_string(&row.name);
        match &row.value {
            Some(Value::Number(n)) => match n.as_f64() {
                Some(number) => {
                    sheet.get_cell_mut((2, r)).set_value_number(number);
                }
                None => {
                    sheet.get_cell_mut((2, r)).set_value_string(n.to_string());
                }
            },
            Some(Value::String(s)) => {
                sheet.get_cell_mut((2, r)).set_value_string(s);
            }
            Some(other) => {
                sheet.get_cell_mut((2, r)).set_value_string(other.to_string());
            }
            None => {}
        }
        if let Some(confidence) = &row.confidence {
            sheet.get_cell_mut((3, r)).set_value_string(confidence);
        }
        if let Some(unit) = &row.unit {
            sheet.get_cell_mut((4, r)).set_value_string(unit);
        }
        sheet.get_cell_mut((5, r)).set_value_number(f64::from(row.level));
        if let Some(comment) = &row.comment {
            sheet.get_cell_mut((6, r)).set_value_string(comment);
        }
        if let Some(source) = &row.source {
            sheet.get_cell_mut((7, r)).set_value_string(source);
        }

        for col in 1..=COLUMN_COUNT {
            // C, D and E are short codes and read better centred.
            let centred = matches!(col, 3..=5);
            let style = sheet.get_style_mut((col, r));
            set_thin_border(style);
            let alignment = style.get_alignment_mut();
            alignment.set_vertical(VerticalAlignmentValues::Center);
            if centred {
                alignment.set_horizontal(HorizontalAlignmentValues::Center);
            } else {
                alignment.set_wrap_text(true);
            }

            if row.is_group() {
                style.set_background_color(HEADER_FILL);
                style.get_font_mut().set_bold(true);
            }
        }

        if row.highlight {
            sheet.get_style_mut((2, r)).set_background_color(VALUE_FILL);
        }
    }

    for (column, width) in COLUMN_WIDTHS {
        sheet.get_column_dimension_mut(column).set_width(width);
    }
    sheet.get_column_dimension_mut(LEVEL_COLUMN).set_hidden(true);
}

pub(crate) fn set_thin_border(style: &mut umya_spreadsheet::Style) {
    let borders = style.get_borders_mut();
    borders.get_left_mut().set_border_style(Border::BORDER_THIN);
    borders.get_right_mut().set_border_style(Border::BORDER_THIN);
    borders.get_top_mut().set_border_style(Border::BORDER_THIN);
    borders.get_bottom_mut().set_border_style(Border::BORDER_THIN);
}

#[cfg(test)]
mod tests {
    use super::*;
    use calamine::{open_workbook, Data, Reader, Xlsx};
    use serde_json::json;

    fn read_columns(path: &Path) -> Vec<(String, String)> {
        let mut workbook: Xlsx<_> = open_workbook(path).unwrap();
        let range = workbook.worksheet_range(MAIN_SHEET_NAME).unwrap();
        range
            .rows()
            .map(|row| {
                let name = row.first().map(|c| c.to_string()).unwrap_or_default();
                let level = match row.get(4) {
                    Some(Data::Float(f)) => format!("{}", *f as i64),
                    Some(Data::Int(i)) => i.to_string(),
                    Some(other) => other.to_string(),
                    None => String::new(),
                };
                (name, level)
            })
            .collect()
    }

    #[test]
    fn test_schema_rows_single_parameter() {
        let tree = SchemaTree::from_json(&json!({
            "Геометрия": {"Длина": {"значение": 1200, "единица": "мм"}}
        }));
        let rows = schema_rows(&tree);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].name, "Геометрия");
        assert_eq!(rows[0].level, 1);
        assert_eq!(rows[1].name, "Длина");
        assert_eq!(rows[1].value, Some(json!(1200)));
        assert_eq!(rows[1].unit.as_deref(), Some("мм"));
        assert_eq!(rows[1].level, 3);
        assert!(rows[1].highlight);
    }

    #[test]
    fn test_empty_value_not_highlighted() {
        let tree = SchemaTree::from_json(&json!({
            "S": {"P": {"значение": "", "единица": null}, "Q": {"значение": null}}
        }));
        let rows = schema_rows(&tree);
        assert!(!rows[1].highlight);
        assert!(!rows[2].highlight);
    }

    #[test]
    fn test_render_writes_rows_and_levels() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("nested").join("out.xlsx");
        let filled = json!({
            "Геометрия": {
                "Длина": {"значение": 1200, "единица": "мм"},
                "Шпиндель": {"Мощность": {"значение": "15", "единица": "кВт"}}
            }
        });

        let written = render_workbook(&filled, &output).unwrap();
        assert_eq!(written, output);

        let columns = read_columns(&output);
        assert_eq!(
            columns,
            vec![
                ("Геометрия".to_string(), "1".to_string()),
                ("Длина".to_string(), "3".to_string()),
                ("Шпиндель".to_string(), "2".to_string()),
                ("Мощность".to_string(), "3".to_string()),
            ]
        );
    }

    #[test]
    fn test_render_non_object_produces_empty_sheet() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("empty.xlsx");
        render_workbook(&json!("not a template"), &output).unwrap();
        assert!(output.exists());
    }
}
