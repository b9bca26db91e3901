//! Scenarios: named step configurations persisted as JSON files, one per id.
//!
//! File paths inside a scenario are relative to the project base directory.

use crate::error::{Error, Result};
use crate::render::MAIN_SHEET_NAME;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// One pipeline step. Declaration order is execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Main,
    Instrument,
    Tooling,
    Services,
    SpareParts,
}

/// What a step does to the result workbook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputContract {
    /// Writes the filled JSON and creates the workbook.
    CreatesWorkbook,
    /// Appends one sheet to the workbook, creating it if needed.
    AppendsSheet,
}

impl StepKind {
    pub const ALL: [StepKind; 5] = [
        Self::Main,
        Self::Instrument,
        Self::Tooling,
        Self::Services,
        Self::SpareParts,
    ];

    pub fn key(self) -> &'static str {
        match self {
            Self::Main => "main",
            Self::Instrument => "instrument",
            Self::Tooling => "tooling",
            Self::Services => "services",
            Self::SpareParts => "spare_parts",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Main => "Обработка основного промпта (технические характеристики)",
            Self::Instrument => "Извлечение инструмента",
            Self::Tooling => "Извлечение оснастки",
            Self::Services => "Извлечение услуг",
            Self::SpareParts => "Извлечение ЗИП",
        }
    }

    pub fn sheet_name(self) -> &'static str {
        match self {
            Self::Main => MAIN_SHEET_NAME,
            Self::Instrument => "Инструмент",
            Self::Tooling => "Оснастка",
            Self::Services => "Услуги",
            Self::SpareParts => "ЗИП",
        }
    }

    /// Conventional prompt file name under `prompts/<machine_type>/`.
    pub fn prompt_file_name(self) -> &'static str {
        match self {
            Self::Main => "основной.txt",
            Self::Instrument => "инструмент.txt",
            Self::Tooling => "оснастка.txt",
            Self::Services => "услуги.txt",
            Self::SpareParts => "зип.txt",
        }
    }

    pub fn output_contract(self) -> OutputContract {
        match self {
            Self::Main => OutputContract::CreatesWorkbook,
            _ => OutputContract::AppendsSheet,
        }
    }

    fn from_prompt_file_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.prompt_file_name() == name)
    }
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.key())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PromptSlot {
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    /// Main step only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tz_template: Option<String>,
    /// Main step only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub glossary: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScenarioPrompts {
    pub main: PromptSlot,
    pub instrument: PromptSlot,
    pub tooling: PromptSlot,
    pub services: PromptSlot,
    pub spare_parts: PromptSlot,
}

impl ScenarioPrompts {
    pub fn slot(&self, step: StepKind) -> &PromptSlot {
        match step {
            StepKind::Main => &self.main,
            StepKind::Instrument => &self.instrument,
            StepKind::Tooling => &self.tooling,
            StepKind::Services => &self.services,
            StepKind::SpareParts => &self.spare_parts,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    #[serde(default)]
    pub id: String,
    pub name: String,
    pub machine_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub prompts: ScenarioPrompts,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
    /// Fields this service does not interpret, kept on rewrite.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Scenario {
    /// Parse scenario JSON; shape errors become validation errors.
    pub fn from_value(value: Value) -> Result<Self> {
        serde_json::from_value(value).map_err(|e| Error::Validation(format!("Invalid scenario: {}", e)))
    }

    /// Enabled steps in execution order.
    pub fn enabled_steps(&self) -> Vec<StepKind> {
        StepKind::ALL
            .into_iter()
            .filter(|s| self.prompts.slot(*s).enabled)
            .collect()
    }
}

/// Directory-backed scenario CRUD plus discovery of prompt, template and
/// glossary files.
pub struct ScenarioStore {
    dir: PathBuf,
    base_dir: PathBuf,
    data_dir: PathBuf,
}

impl ScenarioStore {
    pub fn open(dir: &Path, base_dir: &Path, data_dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            base_dir: base_dir.to_path_buf(),
            data_dir: data_dir.to_path_buf(),
        })
    }

    /// Resolve a scenario-relative path.
    pub fn resolve(&self, relative: &str) -> PathBuf {
        self.base_dir.join(relative)
    }

    fn file_for(&self, id: &str) -> Result<PathBuf> {
        if !is_safe_id(id) {
            return Err(Error::Validation(format!("Invalid scenario id: {:?}", id)));
        }
        Ok(self.dir.join(format!("{}.json", id)))
    }

    /// All readable scenarios sorted by name. Broken files are logged and skipped.
    pub fn list(&self) -> Vec<Scenario> {
        let mut scenarios: Vec<Scenario> = json_files(&self.dir)
            .into_iter()
            .filter_map(|path| match read_scenario(&path) {
                Ok(s) => Some(s),
                Err(e) => {
                    warn!("Skipping scenario {}: {}", path.display(), e);
                    None
                }
            })
            .collect();
        scenarios.sort_by(|a, b| a.name.cmp(&b.name));
        scenarios
    }

    pub fn get(&self, id: &str) -> Option<Scenario> {
        let path = self.file_for(id).ok()?;
        if !path.exists() {
            return None;
        }
        match read_scenario(&path) {
            Ok(s) => Some(s),
            Err(e) => {
                warn!("Cannot read scenario {}: {}", path.display(), e);
                None
            }
        }
    }

    pub fn create(&self, mut scenario: Scenario) -> Result<Scenario> {
        if scenario.id.trim().is_empty() {
            scenario.id = self.generate_id(&scenario.name);
        }
        let now = Utc::now().to_rfc3339();
        scenario.created_at.get_or_insert_with(|| now.clone());
        scenario.updated_at = Some(now);

        self.validate(&scenario)?;
        self.save(&scenario)?;
        info!("Created scenario {}", scenario.id);
        Ok(scenario)
    }

    /// Shallow-merge `patch` into an existing scenario. The id never changes.
    pub fn update(&self, id: &str, patch: Value) -> Result<Option<Scenario>> {
        let Some(existing) = self.get(id) else {
            return Ok(None);
        };
        let Value::Object(patch) = patch else {
            return Err(Error::Validation("Scenario update must be an object".to_string()));
        };

        let mut merged = match serde_json::to_value(&existing)? {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        merged.extend(patch);
        merged.insert("id".to_string(), Value::String(id.to_string()));
        merged.insert("updated_at".to_string(), Value::String(Utc::now().to_rfc3339()));

        let scenario = Scenario::from_value(Value::Object(merged))?;
        self.validate(&scenario)?;
        self.save(&scenario)?;
        info!("Updated scenario {}", id);
        Ok(Some(scenario))
    }

    pub fn delete(&self, id: &str) -> Result<bool> {
        let path = self.file_for(id)?;
        if !path.exists() {
            return Ok(false);
        }
        fs::remove_file(&path)?;
        info!("Deleted scenario {}", id);
        Ok(true)
    }

    fn save(&self, scenario: &Scenario) -> Result<()> {
        let path = self.file_for(&scenario.id)?;
        let text = serde_json::to_string_pretty(scenario)?;
        fs::write(&path, text).map_err(|e| Error::conversion(&path, e))
    }

    /// Check required fields and that every referenced file exists.
    pub fn validate(&self, scenario: &Scenario) -> Result<()> {
        for (field, value) in [
            ("id", &scenario.id),
            ("name", &scenario.name),
            ("machine_type", &scenario.machine_type),
        ] {
            if value.trim().is_empty() {
                return Err(Error::Validation(format!("Missing required field: {}", field)));
            }
        }

        for step in StepKind::ALL {
            let slot = scenario.prompts.slot(step);
            if !slot.enabled {
                continue;
            }

            let file = slot.file.as_deref().ok_or_else(|| {
                Error::Validation(format!("Enabled step {} has no prompt file", step))
            })?;
            self.require_file(file, "Prompt file")?;

            if step == StepKind::Main {
                let template = slot.tz_template.as_deref().ok_or_else(|| {
                    Error::Validation("Main step is missing tz_template".to_string())
                })?;
                let glossary = slot.glossary.as_deref().ok_or_else(|| {
                    Error::Validation("Main step is missing glossary".to_string())
                })?;
                self.require_file(template, "Template file")?;
                self.require_file(glossary, "Glossary file")?;
            }
        }
        Ok(())
    }

    fn require_file(&self, relative: &str, what: &str) -> Result<()> {
        let path = self.resolve(relative);
        if path.exists() {
            Ok(())
        } else {
            Err(Error::Validation(format!("{} not found: {}", what, path.display())))
        }
    }

    /// Prompt files found under `prompts/`, grouped by step.
    pub fn available_prompts(&self, machine_type: Option<&str>) -> BTreeMap<StepKind, Vec<String>> {
        let mut result: BTreeMap<StepKind, Vec<String>> =
            StepKind::ALL.into_iter().map(|s| (s, Vec::new())).collect();
        let prompts_dir = self.data_dir.join("prompts");

        let machine_dirs: Vec<PathBuf> = match machine_type {
            Some(machine) => vec![prompts_dir.join(machine)],
            None => sorted_entries(&prompts_dir)
                .into_iter()
                .filter(|p| p.is_dir())
                .collect(),
        };

        for dir in machine_dirs {
            for path in sorted_entries(&dir) {
                let step = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .and_then(StepKind::from_prompt_file_name);
                if let Some(step) = step {
                    result.entry(step).or_default().push(self.relative(&path));
                }
            }
        }
        result
    }

    /// `TZ*.json` files in the data directory.
    pub fn available_templates(&self) -> Vec<String> {
        self.data_files("TZ")
    }

    /// `glossary*.json` files in the data directory.
    pub fn available_glossaries(&self) -> Vec<String> {
        self.data_files("glossary")
    }

    fn data_files(&self, prefix: &str) -> Vec<String> {
        json_files(&self.data_dir)
            .into_iter()
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with(prefix))
            })
            .map(|p| self.relative(&p))
            .collect()
    }

    fn relative(&self, path: &Path) -> String {
        path.strip_prefix(&self.base_dir)
            .unwrap_or(path)
            .to_string_lossy()
            .into_owned()
    }

    /// Transliterated, underscore-normalised id that no stored scenario uses yet.
    pub fn generate_id(&self, name: &str) -> String {
        let base = slugify(name);
        let base = if base.is_empty() {
            "scenario".to_string()
        } else {
            base
        };

        let mut id = base.clone();
        let mut counter = 1;
        while self.dir.join(format!("{}.json", id)).exists() {
            id = format!("{}_{}", base, counter);
            counter += 1;
        }
        id
    }
}

fn read_scenario(path: &Path) -> Result<Scenario> {
    let text = fs::read_to_string(path)?;
    let value: Value = serde_json::from_str(&text)?;
    Scenario::from_value(value)
}

fn sorted_entries(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut paths: Vec<PathBuf> = entries.filter_map(|e| e.ok()).map(|e| e.path()).collect();
    paths.sort();
    paths
}

fn json_files(dir: &Path) -> Vec<PathBuf> {
    sorted_entries(dir)
        .into_iter()
        .filter(|p| p.is_file() && p.extension().is_some_and(|e| e == "json"))
        .collect()
}

fn is_safe_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_alphanumeric() || c == '_' || c == '-')
}

fn transliterate(c: char) -> Option<&'static str> {
    Some(match c {
        'а' => "a",
        'б' => "b",
        'в' => "v",
        'г' => "g",
        'д' => "d",
        'е' => "e",
        'ё' => "yo",
        'ж' => "zh",
        'з' => "z",
        'и' => "i",
        'й' => "y",
        'к' => "k",
        'л' => "l",
        'м' => "m",
        'н' => "n",
        'о' => "o",
        'п' => "p",
        'р' => "r",
        'с' => "s",
        'т' => "t",
        'у' => "u",
        'ф' => "f",
        'х' => "h",
        'ц' => "ts",
        'ч' => "ch",
        'ш' => "sh",
        'щ' => "sch",
        'ъ' | 'ь' => "",
        'ы' => "y",
        'э' => "e",
        'ю' => "yu",
        'я' => "ya",
        _ => return None,
    })
}

fn slugify(name: &str) -> String {
    let mut slug = String::new();
    for c in name.to_lowercase().chars() {
        if let Some(latin) = transliterate(c) {
            slug.push_str(latin);
        } else if c.is_alphanumeric() {
            slug.push(c);
        } else if matches!(c, ' ' | '-' | '_') && !slug.ends_with('_') {
            slug.push('_');
        }
    }
    slug.trim_matches('_').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Fixture {
        _dir: tempfile::TempDir,
        store: ScenarioStore,
        base: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().to_path_buf();
        let data = base.join("data");
        let prompts = data.join("prompts").join("lathe");
        fs::create_dir_all(&prompts).unwrap();
        fs::write(prompts.join("основной.txt"), "main").unwrap();
        fs::write(prompts.join("инструмент.txt"), "instrument").unwrap();
        fs::write(prompts.join("readme.txt"), "ignored").unwrap();
        fs::write(data.join("TZ_lathe.json"), "{}").unwrap();
        fs::write(data.join("glossary_lathe.json"), "{}").unwrap();
        fs::write(data.join("other.json"), "{}").unwrap();

        let store = ScenarioStore::open(&data.join("scenarios"), &base, &data).unwrap();
        Fixture {
            _dir: dir,
            store,
            base,
        }
    }

    fn lathe_scenario() -> Value {
        json!({
            "name": "Токарный станок 16К20",
            "machine_type": "lathe",
            "prompts": {
                "main": {
                    "enabled": true,
                    "file": "data/prompts/lathe/основной.txt",
                    "tz_template": "data/TZ_lathe.json",
                    "glossary": "data/glossary_lathe.json"
                },
                "instrument": {"enabled": true, "file": "data/prompts/lathe/инструмент.txt"},
                "tooling": {"enabled": false},
                "services": {"enabled": false},
                "spare_parts": {"enabled": false}
            },
            "owner": "ОГТ"
        })
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Токарный станок 16К20"), "tokarnyy_stanok_16k20");
        assert_eq!(slugify("  Фрезерный -- ЧПУ  "), "frezernyy_chpu");
        assert_eq!(slugify("!!!"), "");
    }

    #[test]
    fn test_create_get_list_delete() {
        let f = fixture();
        let created = f
            .store
            .create(Scenario::from_value(lathe_scenario()).unwrap())
            .unwrap();
        assert_eq!(created.id, "tokarnyy_stanok_16k20");
        assert!(created.created_at.is_some());
        assert_eq!(created.extra.get("owner"), Some(&json!("ОГТ")));

        let again = f
            .store
            .create(Scenario::from_value(lathe_scenario()).unwrap())
            .unwrap();
        assert_eq!(again.id, "tokarnyy_stanok_16k20_1");

        let loaded = f.store.get(&created.id).unwrap();
        assert_eq!(loaded.enabled_steps(), vec![StepKind::Main, StepKind::Instrument]);
        assert_eq!(f.store.list().len(), 2);

        assert!(f.store.delete(&again.id).unwrap());
        assert!(!f.store.delete(&again.id).unwrap());
        assert_eq!(f.store.list().len(), 1);
    }

    #[test]
    fn test_update_keeps_id() {
        let f = fixture();
        let created = f
            .store
            .create(Scenario::from_value(lathe_scenario()).unwrap())
            .unwrap();

        let updated = f
            .store
            .update(&created.id, json!({"id": "hijack", "name": "Новое имя"}))
            .unwrap()
            .unwrap();
        assert_eq!(updated.id, created.id);
        assert_eq!(updated.name, "Новое имя");
        assert!(f.store.update("missing", json!({})).unwrap().is_none());
    }

    #[test]
    fn test_validation_errors() {
        let f = fixture();

        let mut missing_slot = lathe_scenario();
        missing_slot["prompts"].as_object_mut().unwrap().remove("services");
        assert!(matches!(
            Scenario::from_value(missing_slot),
            Err(Error::Validation(_))
        ));

        let mut no_enabled = lathe_scenario();
        no_enabled["prompts"]["tooling"] = json!({"file": "x.txt"});
        assert!(Scenario::from_value(no_enabled).is_err());

        let mut missing_file = Scenario::from_value(lathe_scenario()).unwrap();
        missing_file.id = "x".to_string();
        missing_file.prompts.main.glossary = Some("data/nope.json".to_string());
        let err = f.store.validate(&missing_file).unwrap_err();
        assert!(err.to_string().contains("Glossary file not found"));

        let mut no_template = Scenario::from_value(lathe_scenario()).unwrap();
        no_template.id = "x".to_string();
        no_template.prompts.main.tz_template = None;
        assert!(f.store.validate(&no_template).is_err());
    }

    #[test]
    fn test_unsafe_ids_are_rejected() {
        let f = fixture();
        assert!(f.store.get("../secrets").is_none());
        assert!(f.store.delete("../secrets").is_err());
    }

    #[test]
    fn test_discovery() {
        let f = fixture();
        let prompts = f.store.available_prompts(None);
        assert_eq!(
            prompts[&StepKind::Main],
            vec!["data/prompts/lathe/основной.txt".to_string()]
        );
        assert_eq!(prompts[&StepKind::Instrument].len(), 1);
        assert!(prompts[&StepKind::Tooling].is_empty());
        assert!(f.store.available_prompts(Some("mill"))[&StepKind::Main].is_empty());

        assert_eq!(f.store.available_templates(), vec!["data/TZ_lathe.json".to_string()]);
        assert_eq!(
            f.store.available_glossaries(),
            vec!["data/glossary_lathe.json".to_string()]
        );
        assert!(f.base.join("data/other.json").exists());
    }
}
