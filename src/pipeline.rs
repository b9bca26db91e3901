//! Scenario pipeline: runs the enabled steps of a scenario in order against one
//! document text and threads the result workbook between them.
//!
//! A failed step is recorded and the next step still runs. Cancellation is
//! polled before every step; files already written stay on disk.

use crate::error::{Error, Result};
use crate::llm::{LlmClient, Usage};
use crate::prompt::{load_prompt_text, substitute_document_text, PromptBuilder};
use crate::render::render_workbook;
use crate::scenario::{OutputContract, Scenario, StepKind};
use crate::status::{Cancellation, Detached, ProgressSink, StatusUpdate, TaskState, CANCELLED_MESSAGE};
use crate::tabular::{append_table_sheet, extract_table};
use crate::tree::save_json;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Serialize)]
pub struct MainOutput {
    pub json_file: String,
    pub json_path: PathBuf,
    pub json_size: u64,
    /// None when the workbook could not be rendered; the JSON is still kept.
    pub excel_file: Option<String>,
    pub excel_path: Option<PathBuf>,
    pub excel_size: Option<u64>,
    pub usage: Usage,
    pub prompt_size: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SheetOutput {
    pub sheet_added: bool,
    pub sheet_name: String,
    pub rows: usize,
    pub usage: Usage,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum StepOutput {
    Main(MainOutput),
    Sheet(SheetOutput),
}

/// One entry of the pipeline error list.
#[derive(Debug, Clone, Serialize)]
pub struct StepFailure {
    /// None for failures outside any step (setup, cancellation before start).
    pub step: Option<StepKind>,
    pub cancelled: bool,
    pub message: String,
}

impl StepFailure {
    fn step(step: StepKind, error: &Error) -> Self {
        Self {
            step: Some(step),
            cancelled: false,
            message: error.to_string(),
        }
    }

    fn cancelled(before: Option<StepKind>) -> Self {
        Self {
            step: before,
            cancelled: true,
            message: CANCELLED_MESSAGE.to_string(),
        }
    }
}

impl fmt::Display for StepFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.step {
            Some(step) => write!(f, "{}: {}", step, self.message),
            None => f.write_str(&self.message),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineResult {
    pub success: bool,
    pub state: TaskState,
    pub results: BTreeMap<StepKind, StepOutput>,
    pub errors: Vec<StepFailure>,
    /// Workbook the steps wrote to, if any step got that far.
    pub workbook: Option<PathBuf>,
    /// SHA-256 of the document text, hex encoded.
    pub source_hash: String,
}

impl PipelineResult {
    fn new(source_hash: String) -> Self {
        Self {
            success: false,
            state: TaskState::Processing,
            results: BTreeMap::new(),
            errors: Vec::new(),
            workbook: None,
            source_hash,
        }
    }

    pub fn main_output(&self) -> Option<&MainOutput> {
        match self.results.get(&StepKind::Main) {
            Some(StepOutput::Main(main)) => Some(main),
            _ => None,
        }
    }
}

pub struct ScenarioPipeline<'a> {
    scenario: &'a Scenario,
    llm: &'a dyn LlmClient,
    progress: &'a dyn ProgressSink,
    cancel: &'a dyn Cancellation,
    base_dir: &'a Path,
    output_dir: &'a Path,
}

impl<'a> ScenarioPipeline<'a> {
    /// `base_dir` resolves the scenario's relative file paths; artifacts go to
    /// `output_dir`.
    pub fn new(
        scenario: &'a Scenario,
        llm: &'a dyn LlmClient,
        base_dir: &'a Path,
        output_dir: &'a Path,
    ) -> Self {
        Self {
            scenario,
            llm,
            progress: &Detached,
            cancel: &Detached,
            base_dir,
            output_dir,
        }
    }

    pub fn with_progress(mut self, progress: &'a dyn ProgressSink) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_cancellation(mut self, cancel: &'a dyn Cancellation) -> Self {
        self.cancel = cancel;
        self
    }

    /// Run every enabled step. Artifacts are named `{prefix}_filled.*`, so the
    /// caller must pass a prefix unique to this run.
    pub async fn execute(&self, document_text: &str, prefix: &str) -> PipelineResult {
        let mut result = PipelineResult::new(hex_digest(document_text));
        let steps = self.scenario.enabled_steps();
        let total = steps.len();

        info!(
            "Running scenario '{}' with {} steps: {:?}",
            self.scenario.id, total, steps
        );
        // Checked before the first report, which moves the task to processing.
        if self.cancel.is_cancelled() {
            return self.cancelled(result, None);
        }

        self.progress.report(
            StatusUpdate::new()
                .state(TaskState::Processing)
                .stage("scenario_start")
                .steps(0, total)
                .progress(0)
                .message(format!("Сценарий: {}", self.scenario.name)),
        );

        if total == 0 {
            result.errors.push(StepFailure {
                step: None,
                cancelled: false,
                message: "Scenario has no enabled steps".to_string(),
            });
            return self.finish(result, total);
        }

        if let Err(e) = fs::create_dir_all(self.output_dir) {
            let e = Error::conversion(self.output_dir, e);
            error!("{}", e);
            result.errors.push(StepFailure {
                step: None,
                cancelled: false,
                message: e.to_string(),
            });
            return self.finish(result, total);
        }

        let mut workbook: Option<PathBuf> = None;

        for (index, step) in steps.into_iter().enumerate() {
            if self.cancel.is_cancelled() {
                info!("Scenario '{}' cancelled before step {}", self.scenario.id, step);
                result.workbook = workbook;
                return self.cancelled(result, Some(step));
            }

            self.progress.report(
                StatusUpdate::new()
                    .stage(format!("{}_prompt", step.key()))
                    .steps(index + 1, total)
                    .progress((index * 100 / total) as u8)
                    .message(format!("Шаг {}/{}: {}", index + 1, total, step.label())),
            );
            info!("Step {}/{}: {}", index + 1, total, step);

            let outcome = match step.output_contract() {
                OutputContract::CreatesWorkbook => {
                    self.run_main(document_text, prefix).await.map(|main| {
                        if let Some(path) = &main.excel_path {
                            workbook = Some(path.clone());
                        }
                        StepOutput::Main(main)
                    })
                }
                OutputContract::AppendsSheet => {
                    let path = workbook
                        .get_or_insert_with(|| self.workbook_path(prefix))
                        .clone();
                    self.run_auxiliary(step, document_text, &path)
                        .await
                        .map(StepOutput::Sheet)
                }
            };

            match outcome {
                Ok(output) => {
                    result.results.insert(step, output);
                    if step != StepKind::Main {
                        refresh_excel_size(&mut result.results);
                    }
                }
                Err(e) => {
                    error!("Step {} failed: {}", step, e);
                    result.errors.push(StepFailure::step(step, &e));
                }
            }
        }

        result.workbook = workbook.filter(|p| p.exists());
        self.finish(result, total)
    }

    async fn run_main(&self, document_text: &str, prefix: &str) -> Result<MainOutput> {
        let slot = &self.scenario.prompts.main;
        let prompt_file = required(slot.file.as_deref(), "prompt file")?;
        let template = required(slot.tz_template.as_deref(), "tz_template")?;
        let glossary = required(slot.glossary.as_deref(), "glossary")?;

        let builder = PromptBuilder::load(
            &self.base_dir.join(prompt_file),
            &self.base_dir.join(template),
            &self.base_dir.join(glossary),
        )?;
        let prompt = builder.build(document_text);
        let prompt_size = prompt.chars().count();
        self.progress
            .report(StatusUpdate::new().prompt_size(prompt_size));

        let completion = self.llm.complete_json(&prompt).await?;
        self.progress
            .report(StatusUpdate::new().usage(completion.usage));

        let json_file = format!("{}_filled.json", prefix);
        let json_path = self.output_dir.join(&json_file);
        save_json(&json_path, &completion.json)?;
        info!("Filled template saved to {}", json_path.display());

        let excel_path = match render_workbook(&completion.json, &self.workbook_path(prefix)) {
            Ok(path) => Some(path),
            Err(e) => {
                warn!("Workbook render failed, keeping JSON only: {}", e);
                None
            }
        };

        Ok(MainOutput {
            json_file,
            json_size: file_size(&json_path).unwrap_or(0),
            json_path,
            excel_file: excel_path.as_ref().and_then(|p| file_name(p)),
            excel_size: excel_path.as_deref().and_then(file_size),
            excel_path,
            usage: completion.usage,
            prompt_size,
        })
    }

    async fn run_auxiliary(
        &self,
        step: StepKind,
        document_text: &str,
        workbook: &Path,
    ) -> Result<SheetOutput> {
        let slot = self.scenario.prompts.slot(step);
        let prompt_file = required(slot.file.as_deref(), "prompt file")?;
        let template = load_prompt_text(&self.base_dir.join(prompt_file))?;
        let prompt = substitute_document_text(&template, document_text);

        let completion = self.llm.complete_text(&prompt).await?;
        let table = extract_table(&completion.text);
        if table.is_empty() {
            info!("Step {} returned no table", step);
        }

        let rows = append_table_sheet(workbook, &table, step.sheet_name())?;
        Ok(SheetOutput {
            sheet_added: true,
            sheet_name: step.sheet_name().to_string(),
            rows,
            usage: completion.usage,
        })
    }

    fn workbook_path(&self, prefix: &str) -> PathBuf {
        self.output_dir.join(format!("{}_filled.xlsx", prefix))
    }

    fn cancelled(&self, mut result: PipelineResult, before: Option<StepKind>) -> PipelineResult {
        result.errors.push(StepFailure::cancelled(before));
        result.success = false;
        result.state = TaskState::Cancelled;
        self.progress.report(
            StatusUpdate::new()
                .state(TaskState::Cancelled)
                .stage("cancelled")
                .message(CANCELLED_MESSAGE),
        );
        result
    }

    fn finish(&self, mut result: PipelineResult, total: usize) -> PipelineResult {
        result.success = result.errors.is_empty();
        result.state = if result.success {
            TaskState::Completed
        } else {
            TaskState::Error
        };

        let message = if result.success {
            "Обработка завершена".to_string()
        } else {
            format!("Обработка завершена с ошибками: {}", result.errors.len())
        };
        info!(
            "Scenario '{}' finished: {} steps ok, {} failed",
            self.scenario.id,
            result.results.len(),
            result.errors.len()
        );
        self.progress.report(
            StatusUpdate::new()
                .state(result.state)
                .stage("completed")
                .steps(total, total)
                .progress(100)
                .message(message),
        );
        result
    }
}

fn required<'s>(value: Option<&'s str>, what: &str) -> Result<&'s str> {
    value.ok_or_else(|| Error::Validation(format!("Scenario step is missing its {}", what)))
}

fn refresh_excel_size(results: &mut BTreeMap<StepKind, StepOutput>) {
    if let Some(StepOutput::Main(main)) = results.get_mut(&StepKind::Main) {
        if let Some(path) = &main.excel_path {
            main.excel_size = file_size(path);
        }
    }
}

fn file_size(path: &Path) -> Option<u64> {
    fs::metadata(path).ok().map(|m| m.len())
}

fn file_name(path: &Path) -> Option<String> {
    path.file_name().map(|n| n.to_string_lossy().into_owned())
}

fn hex_digest(text: &str) -> String {
    format!("{:x}", Sha256::digest(text.as_bytes()))
}
