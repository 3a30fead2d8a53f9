//! Minimal text-edit computation between two buffer states.
//!
//! The format engine pipes the whole document through external tools and
//! gets a whole document back; editors want a small edit list. A
//! line-based diff turns the before/after pair into replacements keyed by
//! zero-based line positions.

use similar::{ChangeTag, DiffTag, TextDiff};
use tower_lsp::lsp_types::{Position, Range, TextEdit};

/// Compute the edits transforming `old` into `new`.
pub fn compute_edits(old: &str, new: &str) -> Vec<TextEdit> {
    let diff = TextDiff::from_lines(old, new);
    let mut edits = Vec::new();

    for op in diff.ops() {
        if op.tag() == DiffTag::Equal {
            continue;
        }
        let new_text: String = diff
            .iter_changes(op)
            .filter(|change| change.tag() == ChangeTag::Insert)
            .map(|change| change.value().to_string())
            .collect();
        let old_range = op.old_range();
        edits.push(TextEdit {
            range: Range {
                start: Position {
                    line: old_range.start as u32,
                    character: 0,
                },
                end: Position {
                    line: old_range.end as u32,
                    character: 0,
                },
            },
            new_text,
        });
    }

    edits
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Reference application of line-based edits, for checking that the
    /// computed edits actually transform old into new.
    fn apply_edits(text: &str, edits: &[TextEdit]) -> String {
        let mut line_starts = vec![0usize];
        for (i, b) in text.bytes().enumerate() {
            if b == b'\n' {
                line_starts.push(i + 1);
            }
        }
        let offset_of = |pos: &Position| -> usize {
            line_starts
                .get(pos.line as usize)
                .copied()
                .unwrap_or(text.len())
        };

        let mut sorted: Vec<&TextEdit> = edits.iter().collect();
        sorted.sort_by_key(|e| offset_of(&e.range.start));

        let mut out = String::new();
        let mut cursor = 0usize;
        for edit in sorted {
            let start = offset_of(&edit.range.start);
            let end = offset_of(&edit.range.end);
            out.push_str(&text[cursor..start]);
            out.push_str(&edit.new_text);
            cursor = end;
        }
        out.push_str(&text[cursor..]);
        out
    }

    fn assert_roundtrip(old: &str, new: &str) {
        let edits = compute_edits(old, new);
        assert_eq!(apply_edits(old, &edits), new, "edits for {old:?} -> {new:?}");
    }

    #[test]
    fn test_identical_text_no_edits() {
        assert!(compute_edits("a\nb\n", "a\nb\n").is_empty());
    }

    #[test]
    fn test_single_line_change() {
        let edits = compute_edits("a\nb\nc\n", "a\nB\nc\n");
        assert_eq!(edits.len(), 1);
        assert_eq!(edits[0].range.start.line, 1);
        assert_eq!(edits[0].range.end.line, 2);
        assert_eq!(edits[0].new_text, "B\n");
        assert_roundtrip("a\nb\nc\n", "a\nB\nc\n");
    }

    #[test]
    fn test_insertion() {
        let edits = compute_edits("a\nc\n", "a\nb\nc\n");
        assert_eq!(edits.len(), 1);
        assert_eq!(edits[0].range.start, edits[0].range.end);
        assert_roundtrip("a\nc\n", "a\nb\nc\n");
    }

    #[test]
    fn test_deletion() {
        let edits = compute_edits("a\nb\nc\n", "a\nc\n");
        assert_eq!(edits.len(), 1);
        assert_eq!(edits[0].new_text, "");
        assert_roundtrip("a\nb\nc\n", "a\nc\n");
    }

    #[test]
    fn test_full_rewrite() {
        assert_roundtrip("abc", "ABC!");
        assert_roundtrip("abc\n", "xyz\nextra\n");
    }

    #[test]
    fn test_missing_trailing_newline() {
        assert_roundtrip("one\ntwo", "one\ntwo\n");
        assert_roundtrip("one\ntwo\n", "one\ntwo");
    }

    #[test]
    fn test_untouched_lines_not_in_edits() {
        let old = "keep\nold1\nkeep\nold2\nkeep\n";
        let new = "keep\nnew1\nkeep\nnew2\nkeep\n";
        let edits = compute_edits(old, new);
        assert_eq!(edits.len(), 2);
        assert_roundtrip(old, new);
    }
}
