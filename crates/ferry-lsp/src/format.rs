//! The format engine.
//!
//! Formatters chain: each recipe receives the previous recipe's output
//! and the last successful output is diffed against the original buffer
//! to produce the edit list. A failing recipe logs and drops out of the
//! chain without aborting it.

use std::process::Stdio;

use serde_json::{json, Map, Value};
use tokio::io::AsyncWriteExt;
use tower_lsp::jsonrpc;
use tower_lsp::lsp_types::{FormattingOptions, FormattingProperty, Range, TextEdit, Url};

use ferry_core::config::ToolRecipe;
use ferry_core::{rootmarker, shell_command, template};

use crate::backend::{internal_error, invalid_params, Backend};
use crate::edits::compute_edits;
use crate::uri::uri_to_path;

impl Backend {
    /// Entry point for both whole-document and range formatting. While
    /// the format debounce gate is armed, requests return empty edits.
    pub async fn range_format_request(
        &self,
        uri: &Url,
        range: Option<Range>,
        options: &FormattingOptions,
    ) -> jsonrpc::Result<Option<Vec<TextEdit>>> {
        let delay = self.config.read().await.format_debounce.0;
        if !self.format_gate.try_acquire(delay) {
            tracing::debug!("format request dropped by debounce gate");
            return Ok(Some(Vec::new()));
        }
        self.range_format(uri, range, options).await
    }

    async fn range_format(
        &self,
        uri: &Url,
        range: Option<Range>,
        options: &FormattingOptions,
    ) -> jsonrpc::Result<Option<Vec<TextEdit>>> {
        let snapshot = {
            let documents = self.documents.lock().await;
            documents
                .snapshot(uri)
                .map_err(invalid_params)?
        };
        let fname_path = uri_to_path(uri)
            .ok_or_else(|| invalid_params(format!("not a file URI: {uri}")))?;
        let fname = fname_path.to_string_lossy().replace('\\', "/");

        let (recipes, global_markers) = {
            let config = self.config.read().await;
            let mut selected: Vec<ToolRecipe> = Vec::new();
            for recipe in config.language_recipes(&snapshot.language_id) {
                if recipe.format_command.is_empty() {
                    continue;
                }
                if recipe.require_marker
                    && rootmarker::match_root_path(&fname_path, &recipe.root_markers).is_none()
                {
                    continue;
                }
                selected.push(recipe.clone());
            }
            for recipe in config.wildcard_recipes() {
                if !recipe.format_command.is_empty() {
                    selected.push(recipe.clone());
                }
            }
            (selected, config.root_markers.clone())
        };

        if recipes.is_empty() {
            tracing::debug!(
                language = %snapshot.language_id,
                "format for language not supported"
            );
            return Err(internal_error(format!(
                "format for LanguageID not supported: {}",
                snapshot.language_id
            )));
        }

        let server_root = self.root_path.read().await.clone();
        let server_root_str = server_root
            .as_deref()
            .map(|p| p.to_string_lossy().replace('\\', "/"))
            .unwrap_or_default();
        let folders = self.folders.read().await.clone();
        let options_map = formatting_options_map(options);

        let original = snapshot.text.clone();
        let mut text = snapshot.text;
        let mut formatted = false;

        for recipe in &recipes {
            let cwd = rootmarker::find_root_path(
                &fname_path,
                &recipe.root_markers,
                &global_markers,
                &folders,
                server_root.as_deref(),
            );

            let output = if recipe.format_inplace {
                // Sync the disk with unsaved edits first, let the tool
                // mutate the file, then read the result back.
                if let Err(e) = tokio::fs::write(&fname_path, &text).await {
                    tracing::error!(file = %fname, error = %e, "failed to write buffer for in-place format");
                    continue;
                }

                let command = template::replace_input_placeholders(
                    &recipe.format_command,
                    &fname,
                    &server_root_str,
                );
                match self.run_formatter(recipe, &command, cwd.as_deref(), None).await {
                    Ok(_) => {}
                    Err(detail) => {
                        tracing::warn!(command = %command, detail = %detail, "in-place formatter reported failure");
                    }
                }

                match tokio::fs::read_to_string(&fname_path).await {
                    Ok(contents) => contents,
                    Err(e) => {
                        tracing::error!(file = %fname, error = %e, "failed to read in-place format result");
                        continue;
                    }
                }
            } else {
                let mut command = recipe.format_command.clone();
                if !recipe.format_stdin && !command.contains("${INPUT}") {
                    command.push_str(" ${INPUT}");
                }
                command =
                    template::replace_input_placeholders(&command, &fname, &server_root_str);
                command = template::apply_options(&command, &options_map);

                if let Some(range) = range.filter(|_| recipe.format_can_range) {
                    let char_start = template::convert_row_col_to_index(
                        &text,
                        range.start.line as usize,
                        range.start.character as usize,
                    );
                    let char_end = template::convert_row_col_to_index(
                        &text,
                        range.end.line as usize,
                        range.end.character as usize,
                    );
                    let bindings = [
                        ("charStart", char_start as i64),
                        ("charEnd", char_end as i64),
                        ("rowStart", range.start.line as i64),
                        ("colStart", range.start.character as i64),
                        ("rowEnd", range.end.line as i64),
                        ("colEnd", range.end.character as i64),
                    ];
                    for (name, value) in bindings {
                        command = template::apply_option(&command, name, &json!(value));
                    }
                }
                command = template::strip_unfilled(&command);

                let stdin = recipe.format_stdin.then(|| text.clone());
                match self
                    .run_formatter(recipe, &command, cwd.as_deref(), stdin)
                    .await
                {
                    Ok(stdout) => stdout,
                    Err(detail) => {
                        tracing::warn!(command = %command, detail = %detail, "formatter failed");
                        continue;
                    }
                }
            };

            formatted = true;
            text = output.replace('\r', "");
        }

        if formatted {
            tracing::debug!("format succeeded");
            Ok(Some(compute_edits(&original, &text)))
        } else {
            Err(internal_error(format!(
                "format for LanguageID not supported: {}",
                snapshot.language_id
            )))
        }
    }

    /// Run one formatter command, returning its stdout on success and a
    /// failure description otherwise.
    async fn run_formatter(
        &self,
        recipe: &ToolRecipe,
        command: &str,
        cwd: Option<&std::path::Path>,
        stdin_text: Option<String>,
    ) -> Result<String, String> {
        let (shell, flag) = shell_command();
        let mut invocation = tokio::process::Command::new(shell);
        invocation
            .arg(flag)
            .arg(command)
            .stdin(if stdin_text.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = cwd {
            invocation.current_dir(cwd);
        }
        for (name, value) in recipe.env_pairs() {
            invocation.env(name, value);
        }

        let mut child = invocation.spawn().map_err(|e| e.to_string())?;
        if let Some(text) = stdin_text {
            if let Some(mut stdin) = child.stdin.take() {
                tokio::spawn(async move {
                    let _ = stdin.write_all(text.as_bytes()).await;
                });
            }
        }
        let output = child.wait_with_output().await.map_err(|e| e.to_string())?;
        if !output.status.success() {
            return Err(String::from_utf8_lossy(&output.stderr).trim().to_string());
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Flatten `FormattingOptions` into the open name/value dictionary the
/// command template binds against.
fn formatting_options_map(options: &FormattingOptions) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert("tabSize".to_string(), json!(options.tab_size));
    map.insert("insertSpaces".to_string(), json!(options.insert_spaces));
    if let Some(v) = options.trim_trailing_whitespace {
        map.insert("trimTrailingWhitespace".to_string(), json!(v));
    }
    if let Some(v) = options.insert_final_newline {
        map.insert("insertFinalNewline".to_string(), json!(v));
    }
    if let Some(v) = options.trim_final_newlines {
        map.insert("trimFinalNewlines".to_string(), json!(v));
    }
    for (name, property) in &options.properties {
        let value = match property {
            FormattingProperty::Bool(b) => json!(b),
            FormattingProperty::Number(n) => json!(n),
            FormattingProperty::String(s) => json!(s),
        };
        map.insert(name.clone(), value);
    }
    map
}
