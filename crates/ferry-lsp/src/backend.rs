//! The dispatch router: LSP methods in, engine calls out.
//!
//! `Backend` owns every piece of shared state and implements the
//! tower-lsp `LanguageServer` trait. For document-targeted methods a
//! configured passthrough child is consulted first; everything else runs
//! through the local engines.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tower_lsp::jsonrpc;
use tower_lsp::lsp_types::*;
use tower_lsp::{Client, LanguageServer};

use ferry_core::config::{CommandDef, Config, ConfigUpdate};
use ferry_core::{shell_command, template};

use crate::debounce::{FormatGate, LintDebouncer};
use crate::documents::DocumentStore;
use crate::lint::{LintEvent, LintRequest};
use crate::passthrough::PassthroughServer;
use crate::uri::uri_to_path;

/// Booleans the editor may send in `initializationOptions` to gate which
/// capabilities the server advertises.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InitializationOptions {
    pub document_formatting: Option<bool>,
    pub document_range_formatting: Option<bool>,
    pub hover: Option<bool>,
    pub document_symbol: Option<bool>,
    pub code_action: Option<bool>,
    pub completion: Option<bool>,
    pub definition: Option<bool>,
}

#[derive(Clone)]
pub struct Backend {
    pub(crate) client: Client,
    pub(crate) config: Arc<RwLock<Config>>,
    pub(crate) documents: Arc<Mutex<DocumentStore>>,
    pub(crate) root_path: Arc<RwLock<Option<PathBuf>>>,
    pub(crate) folders: Arc<RwLock<Vec<PathBuf>>>,
    init_options: Arc<RwLock<InitializationOptions>>,
    /// Per language, the URIs the most recent workspace-scoped lint
    /// published diagnostics for. Used to clear stale publications.
    pub(crate) last_published: Arc<Mutex<HashMap<String, HashSet<Url>>>>,
    passthrough: Arc<Mutex<HashMap<String, Arc<PassthroughServer>>>>,
    lint_debouncer: Arc<LintDebouncer>,
    pub(crate) format_gate: Arc<FormatGate>,
    lint_loop: Arc<StdMutex<Option<JoinHandle<()>>>>,
}

impl Backend {
    /// Create the backend and start its lint queue drain task.
    pub fn new(client: Client, config: Config) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let backend = Self {
            client,
            config: Arc::new(RwLock::new(config)),
            documents: Arc::new(Mutex::new(DocumentStore::default())),
            root_path: Arc::new(RwLock::new(None)),
            folders: Arc::new(RwLock::new(Vec::new())),
            init_options: Arc::new(RwLock::new(InitializationOptions::default())),
            last_published: Arc::new(Mutex::new(HashMap::new())),
            passthrough: Arc::new(Mutex::new(HashMap::new())),
            lint_debouncer: Arc::new(LintDebouncer::new(tx)),
            format_gate: Arc::new(FormatGate::new()),
            lint_loop: Arc::new(StdMutex::new(None)),
        };
        let handle = crate::lint::spawn_lint_loop(backend.clone(), rx);
        *backend.lint_loop.lock().unwrap() = Some(handle);
        backend
    }

    pub(crate) async fn trigger_lint(&self, uri: Url, event: LintEvent) {
        let delay = self.config.read().await.lint_debounce.0;
        self.lint_debouncer.trigger(delay, LintRequest { uri, event });
    }

    /// The passthrough child for a document's language, spawning it on
    /// first use and respawning after a crash.
    pub(crate) async fn passthrough_for(&self, uri: &Url) -> Option<Arc<PassthroughServer>> {
        let language_id = {
            let documents = self.documents.lock().await;
            documents.get(uri)?.language_id.clone()
        };
        let pt_config = {
            let config = self.config.read().await;
            config
                .language_recipes(&language_id)
                .iter()
                .find_map(|recipe| recipe.passthrough.clone())?
        };

        let key = format!("{language_id}:{}", pt_config.command);
        let spawn_error;
        {
            let mut servers = self.passthrough.lock().await;
            if let Some(server) = servers.get(&key) {
                if server.is_alive() {
                    return Some(Arc::clone(server));
                }
                servers.remove(&key);
            }
            match PassthroughServer::spawn(&language_id, &pt_config, self.client.clone()) {
                Ok(server) => {
                    servers.insert(key, Arc::clone(&server));
                    return Some(server);
                }
                Err(e) => spawn_error = e,
            }
        }

        tracing::error!(language = %language_id, error = %spawn_error, "passthrough spawn failed");
        self.client
            .log_message(
                MessageType::ERROR,
                format!("Failed to create passthrough server: {spawn_error}"),
            )
            .await;
        None
    }

    /// Forward a request to the document's passthrough child, if any.
    /// `None` means "no passthrough, handle locally".
    async fn forward_request<P: Serialize, R: DeserializeOwned>(
        &self,
        uri: &Url,
        method: &str,
        params: &P,
    ) -> Option<jsonrpc::Result<R>> {
        let server = self.passthrough_for(uri).await?;
        let raw = match serde_json::to_value(params) {
            Ok(raw) => raw,
            Err(e) => return Some(Err(internal_error(e))),
        };
        Some(match server.request(method, raw).await {
            Ok(value) => serde_json::from_value(value).map_err(internal_error),
            Err(e) => Err(internal_error(e)),
        })
    }

    /// Forward a notification; returns true when a passthrough child took
    /// the event and local handling should be skipped.
    async fn forward_notify<P: Serialize>(&self, uri: &Url, method: &str, params: &P) -> bool {
        let Some(server) = self.passthrough_for(uri).await else {
            return false;
        };
        let Ok(raw) = serde_json::to_value(params) else {
            return false;
        };
        if let Err(e) = server.notify(method, raw).await {
            tracing::warn!(method, error = %e, "passthrough forward failed");
        }
        true
    }

    async fn add_folder(&self, folder: PathBuf) {
        let mut folders = self.folders.write().await;
        if !folders.contains(&folder) {
            folders.push(folder);
        }
    }

    /// Commands available to a document: the global list plus the ones on
    /// its language's recipes.
    async fn commands_for(&self, uri: Option<&Url>) -> Vec<CommandDef> {
        let language_id = match uri {
            Some(uri) => {
                let documents = self.documents.lock().await;
                documents.get(uri).map(|doc| doc.language_id.clone())
            }
            None => None,
        };

        let config = self.config.read().await;
        let mut commands = config.commands.clone();
        if let Some(language_id) = language_id {
            for recipe in config.language_recipes(&language_id) {
                commands.extend(recipe.commands.iter().cloned());
            }
        }
        commands
    }

    /// Handler for the `workspace/workspaceFolders` request, registered as
    /// a custom method because the trait has no slot for it.
    pub async fn workspace_folders_request(&self) -> jsonrpc::Result<Option<Vec<WorkspaceFolder>>> {
        let folders = self.folders.read().await;
        let list: Vec<WorkspaceFolder> = folders
            .iter()
            .filter_map(|path| {
                let uri = Url::from_file_path(path).ok()?;
                Some(WorkspaceFolder {
                    name: path
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default(),
                    uri,
                })
            })
            .collect();
        Ok(Some(list))
    }
}

pub(crate) fn internal_error(message: impl std::fmt::Display) -> jsonrpc::Error {
    let mut error = jsonrpc::Error::internal_error();
    error.message = message.to_string().into();
    error
}

pub(crate) fn invalid_params(message: impl std::fmt::Display) -> jsonrpc::Error {
    jsonrpc::Error::invalid_params(message.to_string())
}

#[tower_lsp::async_trait]
impl LanguageServer for Backend {
    async fn initialize(&self, params: InitializeParams) -> jsonrpc::Result<InitializeResult> {
        if let Some(root_uri) = params.root_uri {
            if let Ok(path) = root_uri.to_file_path() {
                *self.root_path.write().await = Some(path.clone());
                self.add_folder(path).await;
            }
        }
        if let Some(folders) = params.workspace_folders {
            for folder in folders {
                if let Ok(path) = folder.uri.to_file_path() {
                    self.add_folder(path).await;
                }
            }
        }

        if let Some(raw) = params.initialization_options {
            match serde_json::from_value::<InitializationOptions>(raw) {
                Ok(options) => *self.init_options.write().await = options,
                Err(e) => tracing::warn!(error = %e, "ignoring malformed initializationOptions"),
            }
        }

        let config = self.config.read().await;
        let options = self.init_options.read().await;

        let formatting = options
            .document_formatting
            .unwrap_or_else(|| config.any_recipe(|r| !r.format_command.is_empty()));
        let range_formatting = options.document_range_formatting.unwrap_or_else(|| {
            config.any_recipe(|r| !r.format_command.is_empty() && r.format_can_range)
        });
        let hover = options.hover.unwrap_or_else(|| {
            config.any_recipe(|r| !r.hover_command.is_empty() || r.passthrough.is_some())
        });
        let symbols = options.document_symbol.unwrap_or_else(|| {
            config.any_recipe(|r| !r.symbol_command.is_empty() || r.passthrough.is_some())
        });
        let completion = options.completion.unwrap_or_else(|| {
            config.any_recipe(|r| !r.completion_command.is_empty() || r.passthrough.is_some())
        });
        let commands: Vec<String> = config
            .commands
            .iter()
            .chain(config.languages.values().flatten().flat_map(|r| &r.commands))
            .map(|c| c.title.clone())
            .collect();
        let code_action = options.code_action.unwrap_or(!commands.is_empty());
        let definition = options.definition.unwrap_or_else(|| {
            config.provide_definition || config.any_recipe(|r| r.passthrough.is_some())
        });

        Ok(InitializeResult {
            capabilities: ServerCapabilities {
                text_document_sync: Some(TextDocumentSyncCapability::Kind(
                    TextDocumentSyncKind::FULL,
                )),
                document_formatting_provider: formatting.then_some(OneOf::Left(true)),
                document_range_formatting_provider: range_formatting.then_some(OneOf::Left(true)),
                hover_provider: hover.then_some(HoverProviderCapability::Simple(true)),
                document_symbol_provider: symbols.then_some(OneOf::Left(true)),
                definition_provider: definition.then_some(OneOf::Left(true)),
                completion_provider: completion.then(|| CompletionOptions {
                    resolve_provider: Some(false),
                    trigger_characters: (!config.trigger_chars.is_empty())
                        .then(|| config.trigger_chars.clone()),
                    ..CompletionOptions::default()
                }),
                code_action_provider: code_action
                    .then_some(CodeActionProviderCapability::Simple(true)),
                execute_command_provider: (!commands.is_empty()).then(|| ExecuteCommandOptions {
                    commands,
                    ..ExecuteCommandOptions::default()
                }),
                workspace: Some(WorkspaceServerCapabilities {
                    workspace_folders: Some(WorkspaceFoldersServerCapabilities {
                        supported: Some(true),
                        change_notifications: Some(OneOf::Left(true)),
                    }),
                    file_operations: None,
                }),
                ..ServerCapabilities::default()
            },
            server_info: Some(ServerInfo {
                name: "ferry-ls".to_string(),
                version: Some(env!("CARGO_PKG_VERSION").to_string()),
            }),
        })
    }

    async fn initialized(&self, _: InitializedParams) {
        let language_count = self.config.read().await.languages.len();
        self.client
            .log_message(
                MessageType::INFO,
                format!("ferry-ls initialized with {language_count} language configurations"),
            )
            .await;
    }

    async fn shutdown(&self) -> jsonrpc::Result<()> {
        self.lint_debouncer.stop();
        if let Some(handle) = self.lint_loop.lock().unwrap().take() {
            handle.abort();
        }
        let servers: Vec<_> = {
            let mut map = self.passthrough.lock().await;
            map.drain().map(|(_, server)| server).collect()
        };
        for server in servers {
            server.shutdown().await;
        }
        Ok(())
    }

    async fn did_open(&self, params: DidOpenTextDocumentParams) {
        let uri = params.text_document.uri;
        {
            let mut documents = self.documents.lock().await;
            documents.open(
                uri.clone(),
                params.text_document.language_id,
                params.text_document.version,
            );
            let _ = documents.update(&uri, params.text_document.text, None);
        }
        self.trigger_lint(uri, LintEvent::Open).await;
    }

    async fn did_change(&self, params: DidChangeTextDocumentParams) {
        let uri = params.text_document.uri.clone();
        if self
            .forward_notify(&uri, "textDocument/didChange", &params)
            .await
        {
            return;
        }

        // Full sync: the last change carries the whole document.
        let Some(change) = params.content_changes.into_iter().next_back() else {
            return;
        };
        let updated = {
            let mut documents = self.documents.lock().await;
            documents.update(&uri, change.text, Some(params.text_document.version))
        };
        match updated {
            Ok(()) => self.trigger_lint(uri, LintEvent::Change).await,
            Err(e) => tracing::warn!(error = %e, "didChange for unknown document"),
        }
    }

    async fn did_save(&self, params: DidSaveTextDocumentParams) {
        let uri = params.text_document.uri.clone();
        if self
            .forward_notify(&uri, "textDocument/didSave", &params)
            .await
        {
            return;
        }
        self.trigger_lint(uri, LintEvent::Save).await;
    }

    async fn did_close(&self, params: DidCloseTextDocumentParams) {
        let uri = params.text_document.uri.clone();
        self.forward_notify(&uri, "textDocument/didClose", &params)
            .await;
        self.documents.lock().await.close(&uri);
        self.client.publish_diagnostics(uri, Vec::new(), None).await;
    }

    async fn formatting(
        &self,
        params: DocumentFormattingParams,
    ) -> jsonrpc::Result<Option<Vec<TextEdit>>> {
        let uri = params.text_document.uri.clone();
        if let Some(result) = self
            .forward_request(&uri, "textDocument/formatting", &params)
            .await
        {
            return result;
        }
        self.range_format_request(&uri, None, &params.options).await
    }

    async fn range_formatting(
        &self,
        params: DocumentRangeFormattingParams,
    ) -> jsonrpc::Result<Option<Vec<TextEdit>>> {
        let uri = params.text_document.uri.clone();
        if let Some(result) = self
            .forward_request(&uri, "textDocument/rangeFormatting", &params)
            .await
        {
            return result;
        }
        self.range_format_request(&uri, Some(params.range), &params.options)
            .await
    }

    async fn hover(&self, params: HoverParams) -> jsonrpc::Result<Option<Hover>> {
        let uri = params
            .text_document_position_params
            .text_document
            .uri
            .clone();
        if let Some(result) = self
            .forward_request(&uri, "textDocument/hover", &params)
            .await
        {
            return result;
        }
        Ok(None)
    }

    async fn completion(
        &self,
        params: CompletionParams,
    ) -> jsonrpc::Result<Option<CompletionResponse>> {
        let uri = params.text_document_position.text_document.uri.clone();
        if let Some(result) = self
            .forward_request(&uri, "textDocument/completion", &params)
            .await
        {
            return result;
        }
        Ok(None)
    }

    async fn goto_definition(
        &self,
        params: GotoDefinitionParams,
    ) -> jsonrpc::Result<Option<GotoDefinitionResponse>> {
        let uri = params
            .text_document_position_params
            .text_document
            .uri
            .clone();
        if let Some(result) = self
            .forward_request(&uri, "textDocument/definition", &params)
            .await
        {
            return result;
        }
        Ok(None)
    }

    async fn document_symbol(
        &self,
        params: DocumentSymbolParams,
    ) -> jsonrpc::Result<Option<DocumentSymbolResponse>> {
        let uri = params.text_document.uri.clone();
        if let Some(result) = self
            .forward_request(&uri, "textDocument/documentSymbol", &params)
            .await
        {
            return result;
        }
        Ok(None)
    }

    async fn code_action(
        &self,
        params: CodeActionParams,
    ) -> jsonrpc::Result<Option<CodeActionResponse>> {
        let uri = params.text_document.uri.clone();
        if let Some(result) = self
            .forward_request(&uri, "textDocument/codeAction", &params)
            .await
        {
            return result;
        }

        let commands = self.commands_for(Some(&uri)).await;
        if commands.is_empty() {
            return Ok(None);
        }
        let actions = commands
            .into_iter()
            .map(|def| {
                CodeActionOrCommand::Command(Command {
                    title: def.title.clone(),
                    command: def.title,
                    arguments: Some(vec![Value::String(uri.to_string())]),
                })
            })
            .collect();
        Ok(Some(actions))
    }

    async fn execute_command(
        &self,
        params: ExecuteCommandParams,
    ) -> jsonrpc::Result<Option<Value>> {
        let argument_uri = params
            .arguments
            .first()
            .and_then(Value::as_str)
            .and_then(|s| Url::parse(s).ok());

        let commands = self.commands_for(argument_uri.as_ref()).await;
        let Some(def) = commands.into_iter().find(|c| c.title == params.command) else {
            return Err(invalid_params(format!(
                "command not found: {}",
                params.command
            )));
        };

        let root = self.root_path.read().await.clone();
        let mut command = def.command;
        if let Some(path) = argument_uri.as_ref().and_then(uri_to_path) {
            command = template::replace_input_placeholders(
                &command,
                &path.to_string_lossy().replace('\\', "/"),
                &root
                    .as_deref()
                    .map(|p| p.to_string_lossy().into_owned())
                    .unwrap_or_default(),
            );
        }
        command = template::strip_unfilled(&command);

        let (shell, flag) = shell_command();
        let mut invocation = tokio::process::Command::new(shell);
        invocation.arg(flag).arg(&command).kill_on_drop(true);
        if let Some(root) = &root {
            invocation.current_dir(root);
        }

        tracing::debug!(command = %command, "running workspace command");
        match invocation.output().await {
            Ok(output) if output.status.success() => Ok(None),
            Ok(output) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                self.client
                    .log_message(
                        MessageType::ERROR,
                        format!("command `{command}` failed: {}", stderr.trim()),
                    )
                    .await;
                Err(internal_error(format!("command failed: {command}")))
            }
            Err(e) => Err(internal_error(e)),
        }
    }

    async fn did_change_configuration(&self, params: DidChangeConfigurationParams) {
        match serde_json::from_value::<ConfigUpdate>(params.settings) {
            Ok(update) => {
                let mut config = self.config.write().await;
                config.merge_update(update);
                tracing::info!("configuration updated");
            }
            Err(e) => {
                self.client
                    .log_message(
                        MessageType::WARNING,
                        format!("Failed to parse configuration update: {e}"),
                    )
                    .await;
            }
        }
    }

    async fn did_change_workspace_folders(&self, params: DidChangeWorkspaceFoldersParams) {
        for folder in params.event.added {
            if let Ok(path) = folder.uri.to_file_path() {
                self.add_folder(path).await;
            }
        }
        let removed: Vec<PathBuf> = params
            .event
            .removed
            .iter()
            .filter_map(|f| f.uri.to_file_path().ok())
            .collect();
        if !removed.is_empty() {
            let mut folders = self.folders.write().await;
            folders.retain(|f| !removed.contains(f));
        }
    }
}
