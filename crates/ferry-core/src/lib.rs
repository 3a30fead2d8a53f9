//! # ferry-core
//!
//! Core engine for the ferry language server.
//!
//! ferry bridges LSP editor clients to arbitrary external command-line
//! tools. This crate holds everything that does not need an editor
//! connection:
//!
//! - the configuration/registry model mapping language ids to tool recipes
//! - the error-format mini-language for parsing tool output line-by-line
//! - the JSON-query filter for tools that emit JSON
//! - the command-substitution template applied to tool command lines
//! - the workspace root resolver
//! - the tool availability probe

pub mod config;
pub mod errorformat;
pub mod jsonq;
pub mod probe;
pub mod rootmarker;
pub mod template;

pub use config::{CommandDef, Config, ConfigError, ConfigUpdate, PassthroughConfig, ToolRecipe};
pub use config::{Duration, WILDCARD_LANGUAGE};
pub use errorformat::{Entry, ErrorFormat, ErrorFormatError};
pub use jsonq::{Filter, JsonQueryError};
pub use probe::{check_tool, ProbeError};
pub use rootmarker::{find_root_path, match_root_path};

/// Shell invocation for a command line on the current platform.
///
/// Tool commands are a single shell string, so they always go through the
/// platform shell rather than being split into argv ourselves.
pub fn shell_command() -> (&'static str, &'static str) {
    if cfg!(windows) {
        ("cmd", "/c")
    } else {
        ("sh", "-c")
    }
}
