//! # ferry-lsp
//!
//! LSP frontend for ferry, the generic external-tool language server.
//!
//! ferry owns no language intelligence of its own: editors speak LSP to
//! it, and it orchestrates whatever command-line linters and formatters
//! the configuration names — debouncing editor events, feeding buffers to
//! child processes, parsing their output into diagnostics and edits, and
//! cancelling work the editor has already superseded.
//!
//! The server communicates over stdin/stdout; see `ferry-cli` for the
//! binary entry point.

mod backend;
mod codec;
mod debounce;
mod documents;
mod edits;
mod format;
mod lint;
mod passthrough;
mod uri;

pub use backend::{Backend, InitializationOptions};
pub use documents::{word_at, Document, DocumentError, DocumentSnapshot, DocumentStore};
pub use edits::compute_edits;
pub use lint::{LintEvent, LintJobError, LintRequest};

use ferry_core::Config;
use tower_lsp::{LspService, Server};

/// Serve LSP over stdin/stdout until the client disconnects.
pub async fn start_server(config: Config) -> anyhow::Result<()> {
    let stdin = tokio::io::stdin();
    let stdout = tokio::io::stdout();

    let (service, socket) = LspService::build(move |client| Backend::new(client, config))
        .custom_method(
            "workspace/workspaceFolders",
            Backend::workspace_folders_request,
        )
        .finish();
    Server::new(stdin, stdout, socket).serve(service).await;
    Ok(())
}
