//! The command-substitution mini-language for tool command lines.
//!
//! Commands are shell strings with placeholders:
//!
//! - `${INPUT}`    absolute path, forward slashes, parentheses escaped
//! - `${FILENAME}` OS-native path
//! - `${FILEEXT}`  extension without the dot
//! - `${ROOT}`     resolved workspace root
//! - `${flag:opt}` emits `flag <value>` when option `opt` is present;
//!   with a boolean option, `flag` alone when true
//! - `${flag=opt}` same, emitting `flag=<value>`
//! - `${flag:!opt}` / `${flag=!opt}` negated boolean variants
//!
//! After all bindings, any remaining `${...}` is stripped, so substituting
//! an already-substituted command is a no-op.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

/// Substitute the file/root placeholders into `command`.
pub fn replace_input_placeholders(command: &str, fname: &str, root: &str) -> String {
    let ext = std::path::Path::new(fname)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("");

    command
        .replace("${INPUT}", &escape_parens(fname))
        .replace("${FILEEXT}", ext)
        .replace("${FILENAME}", &escape_parens(&native_path(fname)))
        .replace("${ROOT}", &escape_parens(root))
}

/// Parentheses are significant to the shell the command runs under.
fn escape_parens(path: &str) -> String {
    path.replace('(', r"\(").replace(')', r"\)")
}

fn native_path(path: &str) -> String {
    if cfg!(windows) {
        path.replace('/', "\\")
    } else {
        path.to_string()
    }
}

/// Apply one named option to every binding placeholder referencing it.
pub fn apply_option(command: &str, name: &str, value: &Value) -> String {
    let key = regex::escape(name);
    let space = Regex::new(&format!(r"\$\{{([^:}}]+):{key}\}}")).expect("static pattern");
    let equals = Regex::new(&format!(r"\$\{{([^=}}]+)={key}\}}")).expect("static pattern");
    let neg_space = Regex::new(&format!(r"\$\{{([^:}}]+):!{key}\}}")).expect("static pattern");
    let neg_equals = Regex::new(&format!(r"\$\{{([^=}}]+)=!{key}\}}")).expect("static pattern");

    match value {
        Value::Bool(true) => {
            let command = space.replace_all(command, "$1");
            equals.replace_all(&command, "$1").into_owned()
        }
        Value::Bool(false) => {
            let command = neg_space.replace_all(command, "$1");
            neg_equals.replace_all(&command, "$1").into_owned()
        }
        Value::Null => command.to_string(),
        other => {
            let text = scalar_text(other);
            let command = space.replace_all(command, format!("$1 {text}").as_str());
            equals
                .replace_all(&command, format!("$1={text}").as_str())
                .into_owned()
        }
    }
}

/// Apply a whole option mapping (an open dictionary of scalars).
pub fn apply_options(command: &str, options: &serde_json::Map<String, Value>) -> String {
    let mut command = command.to_string();
    for (name, value) in options {
        command = apply_option(&command, name, value);
    }
    command
}

/// Erase every placeholder no binding filled.
pub fn strip_unfilled(command: &str) -> String {
    static UNFILLED: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"\$\{[^}]*\}").expect("static pattern"));
    UNFILLED.replace_all(command, "").into_owned()
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Byte index of a zero-based row/column position, counting one byte per
/// newline. Out-of-range rows and columns clamp to the nearest line edge.
pub fn convert_row_col_to_index(text: &str, row: usize, col: usize) -> usize {
    let lines: Vec<&str> = text.split('\n').collect();
    let row = row.min(lines.len().saturating_sub(1));
    let col = col.min(lines[row].len());

    lines[..row].iter().map(|l| l.len() + 1).sum::<usize>() + col
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_input_placeholders() {
        let out = replace_input_placeholders(
            "lint --root ${ROOT} ${INPUT}",
            "/src/app/main.py",
            "/src/app",
        );
        assert_eq!(out, "lint --root /src/app /src/app/main.py");
    }

    #[test]
    fn test_fileext_without_dot() {
        let out = replace_input_placeholders("tool --ext ${FILEEXT}", "/a/b/file.tar.gz", "/a");
        assert_eq!(out, "tool --ext gz");
        let out = replace_input_placeholders("tool --ext=${FILEEXT}", "/a/Makefile", "/a");
        assert_eq!(out, "tool --ext=");
    }

    #[test]
    fn test_parens_escaped() {
        let out = replace_input_placeholders("cat ${INPUT}", "/tmp/a(1).txt", "/tmp");
        assert_eq!(out, r"cat /tmp/a\(1\).txt");
    }

    #[test]
    fn test_scalar_option_space_and_equals() {
        let command = "fmt ${--tab-width:tabSize} ${--indent=tabSize}";
        let out = apply_option(command, "tabSize", &json!(4));
        assert_eq!(out, "fmt --tab-width 4 --indent=4");
    }

    #[test]
    fn test_bool_option_true_emits_flag_alone() {
        let command = "fmt ${--single-quote:singleQuote} ${--no-single-quote:!singleQuote}";
        let out = strip_unfilled(&apply_option(command, "singleQuote", &json!(true)));
        assert_eq!(out.trim(), "fmt --single-quote");
    }

    #[test]
    fn test_bool_option_false_emits_negated_flag() {
        let command = "fmt ${--single-quote:singleQuote} ${--no-single-quote:!singleQuote}";
        let out = strip_unfilled(&apply_option(command, "singleQuote", &json!(false)));
        assert!(out.contains("--no-single-quote"));
        assert!(!out.contains("--single-quote "));
        assert!(!out.contains("${"));
    }

    #[test]
    fn test_string_option() {
        let out = apply_option("fmt ${--style=style}", "style", &json!("google"));
        assert_eq!(out, "fmt --style=google");
    }

    #[test]
    fn test_unknown_options_stripped() {
        let out = strip_unfilled("fmt ${--mystery:neverBound} text");
        assert_eq!(out, "fmt  text");
    }

    #[test]
    fn test_substitution_is_idempotent() {
        let options = {
            let mut m = serde_json::Map::new();
            m.insert("tabSize".to_string(), json!(2));
            m.insert("insertSpaces".to_string(), json!(true));
            m
        };
        let command = "fmt ${--tab:tabSize} ${--spaces:insertSpaces} ${--junk:ghost}";
        let once = strip_unfilled(&apply_options(command, &options));
        let twice = strip_unfilled(&apply_options(&once, &options));
        assert_eq!(once, twice);
    }

    #[test]
    fn test_row_col_to_index() {
        let text = "abc\ndefg\nhi";
        assert_eq!(convert_row_col_to_index(text, 0, 0), 0);
        assert_eq!(convert_row_col_to_index(text, 0, 3), 3);
        assert_eq!(convert_row_col_to_index(text, 1, 2), 6);
        assert_eq!(convert_row_col_to_index(text, 2, 0), 9);
        // Clamping beyond the last line and column.
        assert_eq!(convert_row_col_to_index(text, 9, 0), 9);
        assert_eq!(convert_row_col_to_index(text, 2, 99), 11);
    }
}
