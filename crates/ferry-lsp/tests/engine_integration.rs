//! End-to-end engine tests driving real shell commands.
//!
//! These exercise the lint and format pipelines the way an editor session
//! would: open a document through the backend, run the engine, check the
//! diagnostics or edits that come out.

#![cfg(unix)]

use std::path::Path;

use tower_lsp::lsp_types::*;
use tower_lsp::{LanguageServer, LspService};

use ferry_core::config::{Config, ToolRecipe};
use ferry_lsp::{Backend, LintEvent, LintJobError};

fn backend_with(config: Config) -> &'static Backend {
    let (service, socket) = LspService::new(move |client| Backend::new(client, config));
    // The service and socket must outlive the backend handle the tests
    // poke at; leaking them is fine for a test process.
    std::mem::forget(socket);
    let service: &'static LspService<Backend> = Box::leak(Box::new(service));
    service.inner()
}

fn lint_recipe(command: &str) -> ToolRecipe {
    ToolRecipe {
        lint_command: command.to_string(),
        ..ToolRecipe::default()
    }
}

fn config_with_recipe(language: &str, recipe: ToolRecipe) -> Config {
    let mut config = Config::default();
    config.languages.insert(language.to_string(), vec![recipe]);
    config
}

async fn open(backend: &Backend, uri: &Url, language: &str, text: &str) {
    backend
        .did_open(DidOpenTextDocumentParams {
            text_document: TextDocumentItem {
                uri: uri.clone(),
                language_id: language.to_string(),
                version: 1,
                text: text.to_string(),
            },
        })
        .await;
}

async fn initialize_with_root(backend: &Backend, root: &Path) {
    let params = InitializeParams {
        root_uri: Some(Url::from_file_path(root).unwrap()),
        ..InitializeParams::default()
    };
    backend.initialize(params).await.unwrap();
}

#[tokio::test]
async fn test_stdin_linter_with_errorformat() {
    let recipe = ToolRecipe {
        lint_command: r"printf 'stdin:1:4: error: bad\n'; exit 1".to_string(),
        lint_stdin: true,
        lint_formats: vec!["%f:%l:%c: %trror: %m".to_string()],
        ..ToolRecipe::default()
    };
    let backend = backend_with(config_with_recipe("python", recipe));

    let dir = tempfile::tempdir().unwrap();
    let uri = Url::from_file_path(dir.path().join("foo.py")).unwrap();
    open(backend, &uri, "python", "badword here\nsecond line\n").await;

    let results = backend.lint(&uri, LintEvent::Change).await.unwrap();
    let diagnostics = &results[&uri];
    assert_eq!(diagnostics.len(), 1);

    let diag = &diagnostics[0];
    assert_eq!(diag.severity, Some(DiagnosticSeverity::ERROR));
    assert_eq!(diag.message, "bad");
    assert_eq!(diag.range.start, Position { line: 0, character: 3 });
    // The range widens over the word under the reported column.
    assert_eq!(diag.range.end, Position { line: 0, character: 3 + 7 });
}

#[tokio::test]
async fn test_json_linter_with_query() {
    let payload = concat!(
        r#"{"generalDiagnostics":[{"file":"/x.py","severity":"warning","#,
        r#""message":"m","range":{"start":{"line":2,"character":0},"#,
        r#""end":{"line":2,"character":2}},"rule":"R1"}]}"#
    );
    let recipe = ToolRecipe {
        lint_command: format!("printf '%s' '{payload}'; exit 1"),
        lint_jq: ".generalDiagnostics[] | {file, message, severity, range, rule}".to_string(),
        ..ToolRecipe::default()
    };
    let backend = backend_with(config_with_recipe("python", recipe));

    let dir = tempfile::tempdir().unwrap();
    let uri = Url::from_file_path(dir.path().join("active.py")).unwrap();
    open(backend, &uri, "python", "x\n").await;

    let results = backend.lint(&uri, LintEvent::Change).await.unwrap();
    let target = Url::parse("file:///x.py").unwrap();
    let diagnostics = &results[&target];
    assert_eq!(diagnostics.len(), 1);

    let diag = &diagnostics[0];
    assert_eq!(diag.severity, Some(DiagnosticSeverity::WARNING));
    assert_eq!(diag.code, Some(NumberOrString::String("R1".to_string())));
    assert_eq!(diag.message, "m");
    assert_eq!(diag.range.start.line, 2);

    // The active document still gets its (empty) publication.
    assert!(results[&uri].is_empty());
}

#[tokio::test]
async fn test_zero_exit_without_optin_discards_output() {
    // The tool "succeeds" but the recipe did not set
    // lint-ignore-exit-code, so its output is treated as usage text.
    let recipe = lint_recipe(r"printf 'foo.py:1:1: finding\n'");
    let backend = backend_with(config_with_recipe("python", recipe));

    let dir = tempfile::tempdir().unwrap();
    let uri = Url::from_file_path(dir.path().join("foo.py")).unwrap();
    open(backend, &uri, "python", "text\n").await;

    let results = backend.lint(&uri, LintEvent::Change).await.unwrap();
    assert_eq!(results.len(), 1);
    assert!(results[&uri].is_empty());
}

#[tokio::test]
async fn test_zero_exit_with_optin_keeps_output() {
    let recipe = ToolRecipe {
        lint_command: "printf '%s:2:5:W: warned\\n' \"${INPUT}\"".to_string(),
        lint_formats: vec!["%f:%l:%c:%t: %m".to_string()],
        lint_ignore_exit_code: true,
        ..ToolRecipe::default()
    };
    let backend = backend_with(config_with_recipe("python", recipe));

    let dir = tempfile::tempdir().unwrap();
    let uri = Url::from_file_path(dir.path().join("foo.py")).unwrap();
    open(backend, &uri, "python", "first\nwordhere\n").await;

    let results = backend.lint(&uri, LintEvent::Change).await.unwrap();
    let diagnostics = &results[&uri];
    assert_eq!(diagnostics.len(), 1);
    assert_eq!(diagnostics[0].severity, Some(DiagnosticSeverity::WARNING));
    assert_eq!(diagnostics[0].range.start, Position { line: 1, character: 4 });
}

#[tokio::test]
async fn test_child_killed_by_signal_cancels_job() {
    // The tool killing itself stands in for cancellation killing the
    // process group: no exit code, no publication.
    let recipe = lint_recipe("kill -9 $$");
    let backend = backend_with(config_with_recipe("python", recipe));

    let dir = tempfile::tempdir().unwrap();
    let uri = Url::from_file_path(dir.path().join("foo.py")).unwrap();
    open(backend, &uri, "python", "text\n").await;

    let err = backend.lint(&uri, LintEvent::Change).await.unwrap_err();
    assert!(matches!(err, LintJobError::Cancelled));
}

#[tokio::test]
async fn test_lint_prefix_source_and_severity_default() {
    let recipe = ToolRecipe {
        lint_command: r"printf 'foo.md:3:plain finding\n'; exit 1".to_string(),
        prefix: "mdl".to_string(),
        lint_source: "markdownlint".to_string(),
        lint_severity: 2,
        ..ToolRecipe::default()
    };
    let backend = backend_with(config_with_recipe("markdown", recipe));

    let dir = tempfile::tempdir().unwrap();
    let uri = Url::from_file_path(dir.path().join("foo.md")).unwrap();
    initialize_with_root(backend, dir.path()).await;
    open(backend, &uri, "markdown", "# title\n").await;

    let results = backend.lint(&uri, LintEvent::Change).await.unwrap();
    let diagnostics = &results[&uri];
    assert_eq!(diagnostics.len(), 1);
    assert_eq!(diagnostics[0].message, "[mdl] plain finding");
    assert_eq!(diagnostics[0].source, Some("markdownlint".to_string()));
    // No type letter in the format, so the recipe default applies.
    assert_eq!(diagnostics[0].severity, Some(DiagnosticSeverity::WARNING));
}

#[tokio::test]
async fn test_workspace_lint_clears_stale_uris() {
    let dir = tempfile::tempdir().unwrap();
    let control = dir.path().join(".lint-output");
    std::fs::write(&control, "a.md:1:first\nb.md:2:second\n").unwrap();

    let recipe = ToolRecipe {
        lint_command: "cat .lint-output; exit 1".to_string(),
        lint_workspace: true,
        ..ToolRecipe::default()
    };
    let backend = backend_with(config_with_recipe("markdown", recipe));
    initialize_with_root(backend, dir.path()).await;

    let uri_a = Url::from_file_path(dir.path().join("a.md")).unwrap();
    let uri_b = Url::from_file_path(dir.path().join("b.md")).unwrap();
    open(backend, &uri_a, "markdown", "content\n").await;

    let first = backend.lint(&uri_a, LintEvent::Save).await.unwrap();
    assert_eq!(first[&uri_a].len(), 1);
    assert_eq!(first[&uri_b].len(), 1);

    // The next run no longer reports b.md; its publication is cleared.
    std::fs::write(&control, "a.md:1:still here\n").unwrap();
    let second = backend.lint(&uri_a, LintEvent::Save).await.unwrap();
    assert_eq!(second[&uri_a].len(), 1);
    assert!(second[&uri_b].is_empty());
}

#[tokio::test]
async fn test_cross_file_entries_dropped_without_workspace() {
    let dir = tempfile::tempdir().unwrap();
    let recipe = ToolRecipe {
        lint_command: r"printf 'other.py:1:nope\n'; exit 1".to_string(),
        ..ToolRecipe::default()
    };
    let backend = backend_with(config_with_recipe("python", recipe));
    initialize_with_root(backend, dir.path()).await;

    let uri = Url::from_file_path(dir.path().join("active.py")).unwrap();
    open(backend, &uri, "python", "x\n").await;

    let results = backend.lint(&uri, LintEvent::Change).await.unwrap();
    assert_eq!(results.len(), 1);
    assert!(results[&uri].is_empty());
}

#[tokio::test]
async fn test_event_policy_filters_recipes() {
    // lint-after-open is off by default, so an Open event runs nothing;
    // lint-on-save restricts Change events.
    let recipe = ToolRecipe {
        lint_command: r"printf 'f.py:1:found\n'; exit 1".to_string(),
        lint_on_save: true,
        ..ToolRecipe::default()
    };
    let backend = backend_with(config_with_recipe("python", recipe));

    let dir = tempfile::tempdir().unwrap();
    let uri = Url::from_file_path(dir.path().join("f.py")).unwrap();
    open(backend, &uri, "python", "x\n").await;

    let on_open = backend.lint(&uri, LintEvent::Open).await.unwrap();
    assert!(on_open.is_empty());
    let on_change = backend.lint(&uri, LintEvent::Change).await.unwrap();
    assert!(on_change.is_empty());

    let on_save = backend.lint(&uri, LintEvent::Save).await.unwrap();
    assert_eq!(on_save[&uri].len(), 1);
}

#[tokio::test]
async fn test_offsets_and_category_map() {
    // The tool reports one-based line 3 / column 4 with category letter X;
    // lint-offset shifts the line origin, lint-offset-columns corrects a
    // zero-based column convention, and the category map rewrites X to W
    // before severity classification.
    let mut category_map = std::collections::HashMap::new();
    category_map.insert("X".to_string(), "W".to_string());
    let recipe = ToolRecipe {
        lint_command: r"printf 'f.py:3:4:X:msg\n'; exit 1".to_string(),
        lint_stdin: true,
        lint_formats: vec!["%f:%l:%c:%t:%m".to_string()],
        lint_offset: 1,
        lint_offset_columns: 2,
        lint_category_map: category_map,
        ..ToolRecipe::default()
    };
    let backend = backend_with(config_with_recipe("python", recipe));

    let dir = tempfile::tempdir().unwrap();
    let uri = Url::from_file_path(dir.path().join("f.py")).unwrap();
    open(backend, &uri, "python", "first\nsecondword\n").await;

    let results = backend.lint(&uri, LintEvent::Change).await.unwrap();
    // "f.py" is not a stdin sentinel and resolves relative to no root, so
    // the entry routes back to the active document only if the URIs line
    // up; with no root it falls back to the active document.
    let diagnostics = &results[&uri];
    assert_eq!(diagnostics.len(), 1);
    let diag = &diagnostics[0];
    // line = 3 - 1 - offset(1) = 1; column = (4 + 2) - 1 = 5.
    assert_eq!(diag.range.start, Position { line: 1, character: 5 });
    assert_eq!(diag.severity, Some(DiagnosticSeverity::WARNING));
    assert_eq!(diag.message, "msg");
}

#[tokio::test]
async fn test_invalid_error_format_skips_recipe() {
    let recipe = ToolRecipe {
        lint_command: r"printf 'x\n'; exit 1".to_string(),
        lint_formats: vec!["%q:%l".to_string()],
        ..ToolRecipe::default()
    };
    let backend = backend_with(config_with_recipe("python", recipe));

    let dir = tempfile::tempdir().unwrap();
    let uri = Url::from_file_path(dir.path().join("f.py")).unwrap();
    open(backend, &uri, "python", "x\n").await;

    // The bad recipe is skipped, not fatal: the active document still
    // gets its clearing publication.
    let results = backend.lint(&uri, LintEvent::Change).await.unwrap();
    assert_eq!(results.len(), 1);
    assert!(results[&uri].is_empty());
}

#[tokio::test]
async fn test_chained_formatters_stdin_then_inplace() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("doc.txt");
    std::fs::write(&file, "stale disk content").unwrap();
    let uri = Url::from_file_path(&file).unwrap();

    let upper = ToolRecipe {
        format_command: "tr 'a-z' 'A-Z'".to_string(),
        format_stdin: true,
        ..ToolRecipe::default()
    };
    let append = ToolRecipe {
        format_command: r"printf '!' >> ${INPUT}".to_string(),
        format_inplace: true,
        ..ToolRecipe::default()
    };
    let mut config = Config::default();
    config
        .languages
        .insert("plaintext".to_string(), vec![upper, append]);
    let backend = backend_with(config);
    initialize_with_root(backend, dir.path()).await;
    open(backend, &uri, "plaintext", "abc").await;

    let edits = backend
        .range_format_request(&uri, None, &FormattingOptions::default())
        .await
        .unwrap()
        .expect("edits expected");

    // The edits rewrite the buffer to what the pipeline left on disk.
    assert_eq!(edits.len(), 1);
    assert_eq!(edits[0].new_text, "ABC!");
    assert_eq!(std::fs::read_to_string(&file).unwrap(), "ABC!");
}

#[tokio::test]
async fn test_format_without_recipes_is_unsupported() {
    let backend = backend_with(Config::default());
    let dir = tempfile::tempdir().unwrap();
    let uri = Url::from_file_path(dir.path().join("doc.txt")).unwrap();
    open(backend, &uri, "plaintext", "abc").await;

    let err = backend
        .range_format_request(&uri, None, &FormattingOptions::default())
        .await
        .unwrap_err();
    assert!(err.message.contains("not supported"));
}

#[tokio::test]
async fn test_failing_formatter_falls_through_chain() {
    let dir = tempfile::tempdir().unwrap();
    let uri = Url::from_file_path(dir.path().join("doc.txt")).unwrap();

    let broken = ToolRecipe {
        format_command: "exit 3".to_string(),
        format_stdin: true,
        ..ToolRecipe::default()
    };
    let reverse = ToolRecipe {
        format_command: "rev | tr -d '\\n'".to_string(),
        format_stdin: true,
        ..ToolRecipe::default()
    };
    let mut config = Config::default();
    config
        .languages
        .insert("plaintext".to_string(), vec![broken, reverse]);
    let backend = backend_with(config);
    open(backend, &uri, "plaintext", "abc").await;

    let edits = backend
        .range_format_request(&uri, None, &FormattingOptions::default())
        .await
        .unwrap()
        .expect("second formatter should still run");
    assert_eq!(edits.len(), 1);
    assert_eq!(edits[0].new_text, "cba");
}

#[tokio::test]
async fn test_format_option_binding() {
    let dir = tempfile::tempdir().unwrap();
    let uri = Url::from_file_path(dir.path().join("doc.txt")).unwrap();

    // The formatter echoes its bound flag, making the substitution
    // visible in the output.
    let recipe = ToolRecipe {
        format_command: r"printf 'indent=%s' '${width:tabSize}' | tr -d ' '".to_string(),
        format_stdin: true,
        ..ToolRecipe::default()
    };
    let backend = backend_with(config_with_recipe("plaintext", recipe));
    open(backend, &uri, "plaintext", "ignored").await;

    let options = FormattingOptions {
        tab_size: 8,
        insert_spaces: true,
        ..FormattingOptions::default()
    };
    let edits = backend
        .range_format_request(&uri, None, &options)
        .await
        .unwrap()
        .expect("edits expected");
    assert_eq!(edits[0].new_text, "indent=width8");
}
