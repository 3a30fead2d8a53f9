//! Server configuration: tool recipes, the language registry, durations.
//!
//! The YAML file uses kebab-case keys; `workspace/didChangeConfiguration`
//! payloads use camelCase. Both deserialize into the same structs via serde
//! aliases, so a dynamic update can replace any subset of the file form.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize, Serializer};
use thiserror::Error;

/// Language id under which recipes apply to every language.
pub const WILDCARD_LANGUAGE: &str = "=";

/// Configuration schema version this server understands.
pub const CONFIG_VERSION: u32 = 2;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {path}")]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file: {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("unsupported configuration version {found}, expected {CONFIG_VERSION}")]
    UnsupportedVersion { found: u32 },

    #[error("invalid duration {value:?}: {reason}")]
    InvalidDuration { value: String, reason: String },
}

/// A wall-clock duration written as `<integer><unit>` with units
/// `ns`, `us`, `ms`, `s`, `m`, `h`. Compound forms like `1m30s` are
/// accepted. A bare integer is taken as nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Duration(pub std::time::Duration);

impl Duration {
    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidDuration {
            value: value.to_string(),
            reason: reason.to_string(),
        };

        let s = value.trim();
        if s.is_empty() {
            return Err(invalid("empty string"));
        }

        let mut total = std::time::Duration::ZERO;
        let mut rest = s;
        while !rest.is_empty() {
            let digits = rest.len() - rest.trim_start_matches(|c: char| c.is_ascii_digit()).len();
            if digits == 0 {
                return Err(invalid("expected a number"));
            }
            let (num, tail) = rest.split_at(digits);
            let n: u64 = num
                .parse()
                .map_err(|_| invalid("number out of range"))?;

            let units = tail.len() - tail.trim_start_matches(|c: char| !c.is_ascii_digit()).len();
            let (unit, tail) = tail.split_at(units);
            rest = tail;

            let scaled = match unit {
                "ns" => std::time::Duration::from_nanos(n),
                "us" | "\u{b5}s" => std::time::Duration::from_micros(n),
                "ms" => std::time::Duration::from_millis(n),
                "s" => std::time::Duration::from_secs(n),
                "m" => std::time::Duration::from_secs(n * 60),
                "h" => std::time::Duration::from_secs(n * 3600),
                "" => return Err(invalid("missing unit")),
                other => return Err(invalid(&format!("unknown unit {other:?}"))),
            };
            total += scaled;
        }

        Ok(Duration(total))
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }
}

impl From<Duration> for std::time::Duration {
    fn from(d: Duration) -> Self {
        d.0
    }
}

impl fmt::Display for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let nanos = self.0.as_nanos();
        if nanos == 0 {
            write!(f, "0s")
        } else if nanos % 1_000_000_000 == 0 {
            write!(f, "{}s", nanos / 1_000_000_000)
        } else if nanos % 1_000_000 == 0 {
            write!(f, "{}ms", nanos / 1_000_000)
        } else if nanos % 1_000 == 0 {
            write!(f, "{}us", nanos / 1_000)
        } else {
            write!(f, "{nanos}ns")
        }
    }
}

impl Serialize for Duration {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Duration {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct DurationVisitor;

        impl Visitor<'_> for DurationVisitor {
            type Value = Duration;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a duration string like \"100ms\" or an integer nanosecond count")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Duration, E> {
                Duration::parse(v).map_err(E::custom)
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Duration, E> {
                Ok(Duration(std::time::Duration::from_nanos(v)))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Duration, E> {
                if v < 0 {
                    return Err(E::custom("negative duration"));
                }
                Ok(Duration(std::time::Duration::from_nanos(v as u64)))
            }
        }

        deserializer.deserialize_any(DurationVisitor)
    }
}

/// A named command surfaced as a code action and runnable through
/// `workspace/executeCommand`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", default)]
pub struct CommandDef {
    pub title: String,
    pub command: String,
}

/// Child language server to forward selected methods to.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PassthroughConfig {
    pub command: String,
    pub args: Vec<String>,
}

/// One external tool and its integration options.
///
/// A recipe can lint, format, or both; unrelated field groups stay at
/// their defaults. Recipes are ordered per language and run in order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ToolRecipe {
    /// Short tag prepended to every diagnostic message as `[prefix] `.
    pub prefix: String,
    #[serde(alias = "rootMarkers")]
    pub root_markers: Vec<String>,
    /// Skip this recipe entirely when none of its root markers match.
    #[serde(alias = "requireMarker")]
    pub require_marker: bool,
    /// Extra environment, `NAME=value` entries.
    pub env: Vec<String>,

    #[serde(alias = "lintCommand")]
    pub lint_command: String,
    #[serde(alias = "lintStdin")]
    pub lint_stdin: bool,
    #[serde(alias = "lintFormats")]
    pub lint_formats: Vec<String>,
    #[serde(alias = "lintIgnoreExitCode")]
    pub lint_ignore_exit_code: bool,
    /// Remaps the parser's type letter before severity classification.
    #[serde(alias = "lintCategoryMap")]
    pub lint_category_map: HashMap<String, String>,
    #[serde(alias = "lintSource")]
    pub lint_source: String,
    /// Default severity (1=Error .. 4=Hint) when the type letter decides
    /// nothing; 0 means unset.
    #[serde(alias = "lintSeverity")]
    pub lint_severity: i32,
    #[serde(alias = "lintOffset")]
    pub lint_offset: u32,
    #[serde(alias = "lintOffsetColumns")]
    pub lint_offset_columns: u32,
    /// Diagnostics may target other files; previously published URIs are
    /// tracked so fixed files get their diagnostics cleared.
    #[serde(alias = "lintWorkspace")]
    pub lint_workspace: bool,
    #[serde(alias = "lintAfterOpen")]
    pub lint_after_open: bool,
    #[serde(alias = "lintOnSave")]
    pub lint_on_save: bool,
    /// JSON-query filter over the tool's stdout; supersedes `lint-formats`.
    #[serde(alias = "lintJq")]
    pub lint_jq: String,

    #[serde(alias = "formatCommand")]
    pub format_command: String,
    #[serde(alias = "formatStdin")]
    pub format_stdin: bool,
    #[serde(alias = "formatCanRange")]
    pub format_can_range: bool,
    /// The formatter mutates the file on disk instead of writing stdout.
    #[serde(alias = "formatInplace")]
    pub format_inplace: bool,

    #[serde(alias = "hoverCommand")]
    pub hover_command: String,
    #[serde(alias = "hoverStdin")]
    pub hover_stdin: bool,
    #[serde(alias = "completionCommand")]
    pub completion_command: String,
    #[serde(alias = "completionStdin")]
    pub completion_stdin: bool,
    #[serde(alias = "symbolCommand")]
    pub symbol_command: String,
    #[serde(alias = "symbolStdin")]
    pub symbol_stdin: bool,
    #[serde(alias = "symbolFormats")]
    pub symbol_formats: Vec<String>,

    #[serde(alias = "checkInstalled")]
    pub check_installed: String,
    pub install: String,

    pub commands: Vec<CommandDef>,
    pub passthrough: Option<PassthroughConfig>,
}

impl ToolRecipe {
    /// Extra environment parsed into key/value pairs; malformed entries
    /// (no `=`) are dropped.
    pub fn env_pairs(&self) -> Vec<(String, String)> {
        self.env
            .iter()
            .filter_map(|entry| {
                entry
                    .split_once('=')
                    .map(|(k, v)| (k.to_string(), v.to_string()))
            })
            .collect()
    }

    /// A human-readable handle for log and probe output.
    pub fn display_name(&self) -> &str {
        if !self.lint_command.is_empty() {
            &self.lint_command
        } else if !self.format_command.is_empty() {
            &self.format_command
        } else if !self.check_installed.is_empty() {
            &self.check_installed
        } else {
            "(unnamed tool)"
        }
    }
}

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Config {
    pub version: u32,
    #[serde(alias = "logFile")]
    pub log_file: String,
    #[serde(alias = "logLevel")]
    pub log_level: u32,
    #[serde(alias = "rootMarkers")]
    pub root_markers: Vec<String>,
    #[serde(alias = "triggerChars")]
    pub trigger_chars: Vec<String>,
    #[serde(alias = "lintDebounce")]
    pub lint_debounce: Duration,
    #[serde(alias = "formatDebounce")]
    pub format_debounce: Duration,
    pub commands: Vec<CommandDef>,
    /// Language id to ordered recipe list. The key `"="` holds wildcard
    /// recipes applying to every language.
    pub languages: HashMap<String, Vec<ToolRecipe>>,
    /// Named recipes that only participate in the availability probe.
    pub tools: HashMap<String, ToolRecipe>,
    #[serde(alias = "provideDefinition")]
    pub provide_definition: bool,
}

impl Config {
    /// Load and validate a YAML configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config =
            serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Load the file if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        // Version 1 configs had a different language map shape; only v2
        // semantics are implemented. 0 means the key was omitted.
        if self.version != 0 && self.version != CONFIG_VERSION {
            return Err(ConfigError::UnsupportedVersion {
                found: self.version,
            });
        }
        Ok(())
    }

    /// Recipes registered for a concrete language id (wildcard excluded).
    pub fn language_recipes(&self, language_id: &str) -> &[ToolRecipe] {
        self.languages
            .get(language_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Recipes under the wildcard id, applying to every language.
    pub fn wildcard_recipes(&self) -> &[ToolRecipe] {
        self.language_recipes(WILDCARD_LANGUAGE)
    }

    /// Every recipe with its registry name, for the availability probe.
    pub fn all_recipes(&self) -> impl Iterator<Item = (&str, &ToolRecipe)> {
        self.languages
            .iter()
            .flat_map(|(id, recipes)| recipes.iter().map(move |r| (id.as_str(), r)))
            .chain(self.tools.iter().map(|(name, r)| (name.as_str(), r)))
    }

    /// True when any recipe (language or wildcard) satisfies `pred`.
    pub fn any_recipe(&self, pred: impl Fn(&ToolRecipe) -> bool) -> bool {
        self.languages.values().flatten().any(pred)
    }

    /// Apply a dynamic configuration update, replacing only the fields
    /// present in the payload.
    pub fn merge_update(&mut self, update: ConfigUpdate) {
        if let Some(log_level) = update.log_level {
            self.log_level = log_level;
        }
        if let Some(root_markers) = update.root_markers {
            self.root_markers = root_markers;
        }
        if let Some(trigger_chars) = update.trigger_chars {
            self.trigger_chars = trigger_chars;
        }
        if let Some(lint_debounce) = update.lint_debounce {
            self.lint_debounce = lint_debounce;
        }
        if let Some(format_debounce) = update.format_debounce {
            self.format_debounce = format_debounce;
        }
        if let Some(commands) = update.commands {
            self.commands = commands;
        }
        if let Some(languages) = update.languages {
            self.languages = languages;
        }
        if let Some(provide_definition) = update.provide_definition {
            self.provide_definition = provide_definition;
        }
    }
}

/// Partial configuration carried by `workspace/didChangeConfiguration`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConfigUpdate {
    pub log_level: Option<u32>,
    pub root_markers: Option<Vec<String>>,
    pub trigger_chars: Option<Vec<String>>,
    pub lint_debounce: Option<Duration>,
    pub format_debounce: Option<Duration>,
    pub commands: Option<Vec<CommandDef>>,
    pub languages: Option<HashMap<String, Vec<ToolRecipe>>>,
    pub provide_definition: Option<bool>,
}
