//! Open-document tracking.
//!
//! The store is mutated only from the dispatch path; lint and format jobs
//! take a [`DocumentSnapshot`] under the lock and work on that copy.

use std::collections::HashMap;

use thiserror::Error;
use tower_lsp::lsp_types::{Position, Url};

#[derive(Error, Debug)]
pub enum DocumentError {
    #[error("document not found: {0}")]
    NotFound(Url),
}

/// One open buffer. Text starts empty on open; the editor sends content
/// in both the open and change notifications.
#[derive(Debug, Clone, Default)]
pub struct Document {
    pub language_id: String,
    pub text: String,
    pub version: i32,
}

/// A copy of a document's state captured at job start.
#[derive(Debug, Clone)]
pub struct DocumentSnapshot {
    pub language_id: String,
    pub text: String,
    pub version: i32,
}

#[derive(Debug, Default)]
pub struct DocumentStore {
    files: HashMap<Url, Document>,
}

impl DocumentStore {
    pub fn open(&mut self, uri: Url, language_id: String, version: i32) {
        self.files.insert(
            uri,
            Document {
                language_id,
                text: String::new(),
                version,
            },
        );
    }

    pub fn update(
        &mut self,
        uri: &Url,
        text: String,
        version: Option<i32>,
    ) -> Result<(), DocumentError> {
        let doc = self
            .files
            .get_mut(uri)
            .ok_or_else(|| DocumentError::NotFound(uri.clone()))?;
        doc.text = text;
        if let Some(version) = version {
            doc.version = version;
        }
        Ok(())
    }

    pub fn close(&mut self, uri: &Url) {
        self.files.remove(uri);
    }

    pub fn get(&self, uri: &Url) -> Option<&Document> {
        self.files.get(uri)
    }

    pub fn contains(&self, uri: &Url) -> bool {
        self.files.contains_key(uri)
    }

    pub fn snapshot(&self, uri: &Url) -> Result<DocumentSnapshot, DocumentError> {
        self.files
            .get(uri)
            .map(|doc| DocumentSnapshot {
                language_id: doc.language_id.clone(),
                text: doc.text.clone(),
                version: doc.version,
            })
            .ok_or_else(|| DocumentError::NotFound(uri.clone()))
    }
}

/// Character classes for word extraction. Letters, digits, CJK and `_`
/// form words; whitespace and punctuation break them.
fn char_class(c: char) -> u8 {
    if c.is_whitespace() {
        1
    } else if c.is_alphanumeric() || c == '_' {
        2
    } else {
        3
    }
}

/// The word under `pos`, with `pos.character` counted in UTF-16 code
/// units as LSP positions are. Returns an empty string out of range.
pub fn word_at(text: &str, pos: Position) -> String {
    let Some(line) = text.split('\n').nth(pos.line as usize) else {
        return String::new();
    };

    // Each UTF-16 unit carries the class of the character it encodes, so
    // the scan below can run over code-unit indices directly.
    let mut units: Vec<u16> = Vec::with_capacity(line.len());
    let mut classes: Vec<u8> = Vec::with_capacity(line.len());
    let mut chars: Vec<char> = Vec::with_capacity(line.len());
    let mut buf = [0u16; 2];
    for c in line.chars() {
        for unit in c.encode_utf16(&mut buf) {
            units.push(*unit);
            classes.push(char_class(c));
            chars.push(c);
        }
    }

    let character = pos.character as usize;
    if character > units.len() {
        return String::new();
    }

    let mut start = 0;
    let mut end = units.len();
    let mut prev_class = 0u8;
    for i in 0..units.len() {
        let class = classes[i];
        if class != prev_class {
            if i <= character {
                start = i;
            } else {
                if chars[i] == '_' {
                    continue;
                }
                end = i;
                break;
            }
        }
        prev_class = class;
    }

    String::from_utf16_lossy(&units[start..end])
}
