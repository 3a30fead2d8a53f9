//! The lint engine.
//!
//! Debounced editor events land on a queue; a drain task turns each into
//! a per-URI job that runs every matching recipe, decodes tool output
//! into diagnostics, and publishes them. A newer job for the same URI
//! aborts the older one, which kills its child process; an aborted or
//! signal-killed job publishes nothing.

use std::collections::{HashMap, HashSet};
use std::process::Stdio;

use serde_json::Value;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tower_lsp::lsp_types::{
    Diagnostic, DiagnosticSeverity, MessageType, NumberOrString, Position, Range, Url,
};

use ferry_core::config::ToolRecipe;
use ferry_core::errorformat::{ErrorFormat, DEFAULT_FORMATS};
use ferry_core::jsonq::Filter;
use ferry_core::{rootmarker, shell_command, template};

use crate::backend::Backend;
use crate::documents::word_at;
use crate::uri::{tool_path_to_uri, uri_to_path};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LintEvent {
    Open,
    Change,
    Save,
}

/// One debounced unit of work for the queue.
#[derive(Debug, Clone)]
pub struct LintRequest {
    pub uri: Url,
    pub event: LintEvent,
}

#[derive(Error, Debug)]
pub enum LintJobError {
    #[error("document not found: {0}")]
    DocumentNotFound(Url),

    #[error("only file URIs can be linted: {0}")]
    InvalidUri(Url),

    #[error("lint job cancelled")]
    Cancelled,
}

/// Names a linter treats as "the stdin buffer" instead of a real file.
fn is_stdin_sentinel(name: &str) -> bool {
    matches!(name, "stdin" | "-" | "<text>" | "<stdin>")
}

fn severity_from(level: i32) -> DiagnosticSeverity {
    match level {
        2 => DiagnosticSeverity::WARNING,
        3 => DiagnosticSeverity::INFORMATION,
        4 => DiagnosticSeverity::HINT,
        _ => DiagnosticSeverity::ERROR,
    }
}

/// Drain the lint queue, one cancellable job per URI at a time.
pub(crate) fn spawn_lint_loop(
    backend: Backend,
    mut rx: UnboundedReceiver<LintRequest>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut running: HashMap<Url, JoinHandle<()>> = HashMap::new();
        while let Some(request) = rx.recv().await {
            running.retain(|_, handle| !handle.is_finished());
            if let Some(previous) = running.remove(&request.uri) {
                previous.abort();
            }
            let job = backend.clone();
            let uri = request.uri.clone();
            running.insert(
                uri,
                tokio::spawn(async move { job.run_lint_job(request).await }),
            );
        }
        for handle in running.into_values() {
            handle.abort();
        }
    })
}

impl Backend {
    async fn run_lint_job(&self, request: LintRequest) {
        let version = {
            let documents = self.documents.lock().await;
            documents.get(&request.uri).map(|doc| doc.version)
        };

        match self.lint(&request.uri, request.event).await {
            Ok(results) => {
                for (uri, diagnostics) in results {
                    self.client
                        .publish_diagnostics(uri, diagnostics, version)
                        .await;
                }
            }
            Err(LintJobError::Cancelled) => {}
            Err(e) => tracing::warn!(uri = %request.uri, error = %e, "lint job failed"),
        }
    }

    /// Run every matching recipe for `uri` and collect diagnostics per
    /// target URI. The active document is always present in the result,
    /// so an empty run still clears its previous diagnostics.
    pub async fn lint(
        &self,
        uri: &Url,
        event: LintEvent,
    ) -> Result<HashMap<Url, Vec<Diagnostic>>, LintJobError> {
        let snapshot = {
            let documents = self.documents.lock().await;
            documents
                .snapshot(uri)
                .map_err(|_| LintJobError::DocumentNotFound(uri.clone()))?
        };
        let fname_path = uri_to_path(uri).ok_or_else(|| LintJobError::InvalidUri(uri.clone()))?;
        let fname = fname_path.to_string_lossy().replace('\\', "/");

        let (recipes, global_markers) = {
            let config = self.config.read().await;
            let mut selected: Vec<ToolRecipe> = Vec::new();
            for recipe in config.language_recipes(&snapshot.language_id) {
                if recipe.require_marker
                    && rootmarker::match_root_path(&fname_path, &recipe.root_markers).is_none()
                {
                    continue;
                }
                match event {
                    LintEvent::Open if !recipe.lint_after_open => continue,
                    LintEvent::Change if recipe.lint_on_save => continue,
                    _ => {}
                }
                if !recipe.lint_command.is_empty() {
                    selected.push(recipe.clone());
                }
            }
            for recipe in config.wildcard_recipes() {
                if !recipe.lint_command.is_empty() {
                    selected.push(recipe.clone());
                }
            }
            (selected, config.root_markers.clone())
        };

        if recipes.is_empty() {
            tracing::debug!(
                language = %snapshot.language_id,
                "no lint configuration for language"
            );
            return Ok(HashMap::new());
        }

        let root_path = self.root_path.read().await.clone();
        let folders = self.folders.read().await.clone();

        let mut results: HashMap<Url, Vec<Diagnostic>> = HashMap::new();
        results.insert(uri.clone(), Vec::new());
        let mut published: HashSet<Url> = HashSet::new();
        let mut any_workspace = false;

        for recipe in &recipes {
            // Seed previously published URIs with empty lists so files
            // whose findings went away get cleared.
            if recipe.lint_workspace {
                any_workspace = true;
                let last = self.last_published.lock().await;
                if let Some(uris) = last.get(&snapshot.language_id) {
                    for prior in uris {
                        results.entry(prior.clone()).or_default();
                    }
                }
            }

            let mut command = recipe.lint_command.clone();
            if !recipe.lint_stdin && !recipe.lint_workspace && !command.contains("${INPUT}") {
                command.push_str(" ${INPUT}");
            }
            let root = rootmarker::find_root_path(
                &fname_path,
                &recipe.root_markers,
                &global_markers,
                &folders,
                root_path.as_deref(),
            );
            let root_str = root
                .as_deref()
                .map(|p| p.to_string_lossy().replace('\\', "/"))
                .unwrap_or_default();
            let command = template::replace_input_placeholders(&command, &fname, &root_str);

            // Compile decoders up front so a bad configuration skips the
            // recipe without spawning anything.
            let json_filter = if recipe.lint_jq.is_empty() {
                None
            } else {
                match Filter::parse(&recipe.lint_jq) {
                    Ok(filter) => Some(filter),
                    Err(e) => {
                        tracing::error!(filter = %recipe.lint_jq, error = %e, "invalid lint-jq filter");
                        continue;
                    }
                }
            };
            let formats = if recipe.lint_formats.is_empty() {
                DEFAULT_FORMATS.clone()
            } else {
                recipe.lint_formats.clone()
            };
            let errorformat = match ErrorFormat::parse(&formats) {
                Ok(ef) => ef,
                Err(e) => {
                    tracing::error!(error = %e, "invalid lint-formats");
                    continue;
                }
            };

            let (shell, flag) = shell_command();
            let mut invocation = tokio::process::Command::new(shell);
            invocation
                .arg(flag)
                .arg(&command)
                .stdin(if recipe.lint_stdin {
                    Stdio::piped()
                } else {
                    Stdio::null()
                })
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true);
            if let Some(root) = &root {
                invocation.current_dir(root);
            }
            for (name, value) in recipe.env_pairs() {
                invocation.env(name, value);
            }

            let mut child = match invocation.spawn() {
                Ok(child) => child,
                Err(e) => {
                    tracing::error!(command = %command, error = %e, "failed to spawn lint command");
                    continue;
                }
            };
            if let Some(mut stdin) = child.stdin.take() {
                let text = snapshot.text.clone();
                tokio::spawn(async move {
                    let _ = stdin.write_all(text.as_bytes()).await;
                });
            }
            let output = match child.wait_with_output().await {
                Ok(output) => output,
                Err(e) => {
                    tracing::error!(command = %command, error = %e, "failed to collect lint output");
                    continue;
                }
            };

            // No exit code means the child died to a signal: this job has
            // been superseded, so it must not publish anything.
            if output.status.code().is_none() {
                return Err(LintJobError::Cancelled);
            }

            // Most lint tools exit non-zero when they report findings, so
            // a zero exit usually means the output is usage text rather
            // than results. Recipes that legitimately exit zero have to
            // opt in.
            if output.status.success() && !recipe.lint_ignore_exit_code {
                self.client
                    .log_message(
                        MessageType::ERROR,
                        format!(
                            "command `{command}` exit with zero. probably you forgot to \
                             specify `lint-ignore-exit-code: true`."
                        ),
                    )
                    .await;
                continue;
            }

            let mut combined = output.stdout;
            combined.extend_from_slice(&output.stderr);
            let output_text = String::from_utf8_lossy(&combined).into_owned();
            tracing::debug!(command = %command, output = %output_text, "lint command finished");

            if let Some(filter) = &json_filter {
                if let Ok(json) = serde_json::from_str::<Value>(&output_text) {
                    for record in filter.apply(&json) {
                        if let Some((diag_uri, diagnostic)) =
                            json_record_to_diagnostic(&record, uri, root.as_deref())
                        {
                            results.entry(diag_uri).or_default().push(diagnostic);
                        }
                    }
                    continue;
                }
                // Unparseable JSON falls back to the line decoder.
            }

            let prefix = if recipe.prefix.is_empty() {
                String::new()
            } else {
                format!("[{}] ", recipe.prefix)
            };
            let source = (!recipe.lint_source.is_empty()).then(|| recipe.lint_source.clone());

            for mut entry in errorformat.scan(&output_text) {
                if recipe.lint_stdin && is_stdin_sentinel(&entry.filename) {
                    entry.filename = fname.clone();
                } else {
                    entry.filename = entry.filename.replace('\\', "/");
                }

                // Columns are expected one-based; linters reporting
                // zero-based columns get corrected here.
                if recipe.lint_offset_columns > 0 && entry.col > 0 {
                    entry.col += recipe.lint_offset_columns;
                }
                if entry.lnum == 0 {
                    entry.lnum = 1;
                }

                let line = (entry.lnum as i64 - 1 - recipe.lint_offset as i64).max(0) as u32;

                let mut word = String::new();
                if entry.col == 0 {
                    entry.col = 1;
                } else {
                    word = word_at(
                        &snapshot.text,
                        Position {
                            line,
                            character: entry.col - 1,
                        },
                    );
                }

                if !recipe.lint_category_map.is_empty() {
                    if let Some(kind) = entry.kind {
                        entry.kind = recipe
                            .lint_category_map
                            .get(&kind.to_string())
                            .and_then(|mapped| mapped.chars().next());
                    }
                }

                let mut level = if recipe.lint_severity != 0 {
                    recipe.lint_severity
                } else {
                    1
                };
                match entry.kind {
                    Some('E' | 'e') => level = 1,
                    Some('W' | 'w') => level = 2,
                    Some('I' | 'i') => level = 3,
                    Some('N' | 'n') => level = 4,
                    _ => {}
                }

                let diag_uri = if entry.filename.is_empty() {
                    uri.clone()
                } else {
                    tool_path_to_uri(&entry.filename, root.as_deref()).unwrap_or_else(|| uri.clone())
                };
                if diag_uri != *uri && !recipe.lint_workspace {
                    continue;
                }
                if recipe.lint_workspace {
                    published.insert(diag_uri.clone());
                }

                // Findings in other files carry a zero-width range: the
                // word under the cursor belongs to the active buffer.
                let width = if diag_uri == *uri {
                    word.chars().count() as u32
                } else {
                    0
                };

                let diagnostic = Diagnostic {
                    range: Range {
                        start: Position {
                            line,
                            character: entry.col - 1,
                        },
                        end: Position {
                            line,
                            character: entry.col - 1 + width,
                        },
                    },
                    severity: Some(severity_from(level)),
                    code: (entry.number != 0)
                        .then(|| NumberOrString::String(entry.number.to_string())),
                    source: source.clone(),
                    message: format!("{prefix}{}", entry.message),
                    ..Diagnostic::default()
                };
                results.entry(diag_uri).or_default().push(diagnostic);
            }
        }

        if any_workspace {
            self.last_published
                .lock()
                .await
                .insert(snapshot.language_id.clone(), published);
        }

        Ok(results)
    }
}

/// Convert one JSON-query output object into a routed diagnostic.
/// Objects missing a required key are skipped.
fn json_record_to_diagnostic(
    record: &Value,
    active_uri: &Url,
    root: Option<&std::path::Path>,
) -> Option<(Url, Diagnostic)> {
    let object = record.as_object()?;
    let file = object.get("file")?.as_str()?;
    let message = object.get("message")?.as_str()?;
    let severity_name = object.get("severity")?.as_str()?;
    let range = object.get("range")?;

    let position = |which: &str| -> Option<Position> {
        let node = range.get(which)?;
        Some(Position {
            line: node.get("line")?.as_u64()? as u32,
            character: node.get("character")?.as_u64()? as u32,
        })
    };
    let range = Range {
        start: position("start")?,
        end: position("end")?,
    };

    let level = match severity_name.to_lowercase().as_str() {
        "warning" => 2,
        "information" | "info" => 3,
        "hint" => 4,
        _ => 1,
    };

    let uri = if file.is_empty() {
        active_uri.clone()
    } else {
        tool_path_to_uri(file, root).unwrap_or_else(|| active_uri.clone())
    };

    let code = object
        .get("rule")
        .and_then(Value::as_str)
        .filter(|rule| !rule.is_empty())
        .map(|rule| NumberOrString::String(rule.to_string()));

    Some((
        uri,
        Diagnostic {
            range,
            severity: Some(severity_from(level)),
            code,
            message: message.to_string(),
            ..Diagnostic::default()
        },
    ))
}
