//! Classification of complete Markdown source lines.
//!
//! The block scanner only ever looks at one line at a time, so everything
//! here is a pure function of a single line (plus, for fences, the marker
//! that opened them).

use std::sync::OnceLock;

use regex::Regex;

/// Column width a tab expands to when measuring indentation.
const TAB_WIDTH: usize = 4;

/// Indentation at which a line stops being able to open most blocks.
pub(crate) const CODE_INDENT: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FenceMarker {
    pub(crate) ch: char,
    pub(crate) len: usize,
    pub(crate) info: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ListMarker {
    pub(crate) ordered: bool,
    /// Bullet character for unordered lists, `.` or `)` for ordered ones.
    pub(crate) delimiter: char,
    pub(crate) start: Option<u64>,
    pub(crate) content_indent: usize,
    pub(crate) empty: bool,
}

impl ListMarker {
    pub(crate) fn same_list(&self, other: &ListMarker) -> bool {
        self.ordered == other.ordered && self.delimiter == other.delimiter
    }

    /// Whether an item with this marker may interrupt a running paragraph.
    pub(crate) fn can_interrupt_paragraph(&self) -> bool {
        !self.empty && (!self.ordered || self.start == Some(1))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum LineStart {
    Blank,
    IndentedCode,
    ThematicBreak,
    AtxHeading { level: u8 },
    FenceOpen(FenceMarker),
    Blockquote,
    ListItem(ListMarker),
    HtmlOpen,
    Text,
}

impl LineStart {
    pub(crate) fn is_text(&self) -> bool {
        matches!(self, LineStart::Text)
    }
}

fn cached(cell: &'static OnceLock<Option<Regex>>, pattern: &str) -> Option<&'static Regex> {
    cell.get_or_init(|| Regex::new(pattern).ok()).as_ref()
}

fn atx_regex() -> Option<&'static Regex> {
    static CELL: OnceLock<Option<Regex>> = OnceLock::new();
    cached(&CELL, r"^ {0,3}(#{1,6})(?:[ \t]|$)")
}

fn thematic_regex() -> Option<&'static Regex> {
    static CELL: OnceLock<Option<Regex>> = OnceLock::new();
    cached(
        &CELL,
        r"^ {0,3}(?:(?:\*[ \t]*){3,}|(?:-[ \t]*){3,}|(?:_[ \t]*){3,})$",
    )
}

fn fence_regex() -> Option<&'static Regex> {
    static CELL: OnceLock<Option<Regex>> = OnceLock::new();
    cached(&CELL, r"^ {0,3}(`{3,}|~{3,})(.*)$")
}

fn list_regex() -> Option<&'static Regex> {
    static CELL: OnceLock<Option<Regex>> = OnceLock::new();
    cached(&CELL, r"^( {0,3})([-+*]|\d{1,9}[.)])([ \t]+|$)")
}

fn setext_regex() -> Option<&'static Regex> {
    static CELL: OnceLock<Option<Regex>> = OnceLock::new();
    cached(&CELL, r"^ {0,3}(=+|-+)[ \t]*$")
}

fn html_regex() -> Option<&'static Regex> {
    static CELL: OnceLock<Option<Regex>> = OnceLock::new();
    cached(&CELL, r"^ {0,3}<(?:[A-Za-z][A-Za-z0-9-]*(?:[ \t>/]|$)|/[A-Za-z]|!--)")
}

fn separator_cell_regex() -> Option<&'static Regex> {
    static CELL: OnceLock<Option<Regex>> = OnceLock::new();
    cached(&CELL, r"^:?-+:?$")
}

pub(crate) fn is_blank(line: &str) -> bool {
    line.trim().is_empty()
}

/// Indentation width of `line`, expanding tabs.
pub(crate) fn indent_width(line: &str) -> usize {
    let mut width = 0;
    for ch in line.chars() {
        match ch {
            ' ' => width += 1,
            '\t' => width += TAB_WIDTH - (width % TAB_WIDTH),
            _ => break,
        }
    }
    width
}

/// Removes up to `columns` columns of leading indentation.
pub(crate) fn strip_indent(line: &str, columns: usize) -> &str {
    let mut width = 0;
    for (offset, ch) in line.char_indices() {
        if width >= columns {
            return &line[offset..];
        }
        match ch {
            ' ' => width += 1,
            '\t' => width += TAB_WIDTH - (width % TAB_WIDTH),
            _ => return &line[offset..],
        }
    }
    ""
}

pub(crate) fn classify(line: &str) -> LineStart {
    if is_blank(line) {
        return LineStart::Blank;
    }
    if indent_width(line) >= CODE_INDENT {
        return LineStart::IndentedCode;
    }
    if thematic_regex().is_some_and(|regex| regex.is_match(line)) {
        return LineStart::ThematicBreak;
    }
    if let Some(captures) = atx_regex().and_then(|regex| regex.captures(line)) {
        let level = captures.get(1).map_or(1, |hashes| hashes.as_str().len());
        return LineStart::AtxHeading {
            level: level as u8,
        };
    }
    if let Some(marker) = fence_open(line) {
        return LineStart::FenceOpen(marker);
    }
    if line.trim_start().starts_with('>') {
        return LineStart::Blockquote;
    }
    if let Some(marker) = list_marker(line) {
        return LineStart::ListItem(marker);
    }
    if html_regex().is_some_and(|regex| regex.is_match(line)) {
        return LineStart::HtmlOpen;
    }
    LineStart::Text
}

pub(crate) fn fence_open(line: &str) -> Option<FenceMarker> {
    let captures = fence_regex()?.captures(line)?;
    let fence = captures.get(1)?.as_str();
    let info = captures.get(2).map_or("", |info| info.as_str()).trim();
    let ch = fence.chars().next()?;
    if ch == '`' && info.contains('`') {
        return None;
    }
    Some(FenceMarker {
        ch,
        len: fence.len(),
        info: (!info.is_empty()).then(|| info.to_string()),
    })
}

pub(crate) fn is_fence_close(line: &str, marker: &FenceMarker) -> bool {
    if indent_width(line) >= CODE_INDENT {
        return false;
    }
    let trimmed = line.trim();
    let run = trimmed.chars().take_while(|ch| *ch == marker.ch).count();
    run >= marker.len && run == trimmed.chars().count()
}

pub(crate) fn list_marker(line: &str) -> Option<ListMarker> {
    let captures = list_regex()?.captures(line)?;
    let indent = captures.get(1)?.as_str().len();
    let marker = captures.get(2)?.as_str();
    let spacing = captures.get(3).map_or(0, |spacing| spacing.as_str().len());
    let rest = &line[captures.get(0)?.end()..];
    let empty = rest.trim().is_empty();

    let delimiter = marker.chars().last()?;
    let ordered = marker.len() > 1 || delimiter.is_ascii_digit();
    let start = if ordered {
        marker[..marker.len() - 1].parse::<u64>().ok()
    } else {
        None
    };
    let padding = if empty || spacing > CODE_INDENT {
        1
    } else {
        spacing.max(1)
    };

    Some(ListMarker {
        ordered,
        delimiter,
        start,
        content_indent: indent + marker.len() + padding,
        empty,
    })
}

/// Heading level of a setext underline (`===` is 1, `---` is 2).
pub(crate) fn setext_level(line: &str) -> Option<u8> {
    let captures = setext_regex()?.captures(line)?;
    let underline = captures.get(1)?.as_str();
    Some(if underline.starts_with('=') { 1 } else { 2 })
}

/// Whether `line` contains a `|` that is not backslash-escaped.
pub(crate) fn has_pipe(line: &str) -> bool {
    count_unescaped_pipes(line) > 0
}

fn count_unescaped_pipes(line: &str) -> usize {
    let mut escaped = false;
    let mut count = 0;
    for ch in line.chars() {
        match ch {
            '\\' if !escaped => {
                escaped = true;
                continue;
            }
            '|' if !escaped => count += 1,
            _ => {}
        }
        escaped = false;
    }
    count
}

/// Splits a table row into trimmed cells, honouring escaped pipes and
/// dropping the optional leading and trailing pipe.
pub(crate) fn split_cells(line: &str) -> Vec<String> {
    let trimmed = line.trim();
    let mut cells = Vec::new();
    let mut current = String::new();
    let mut escaped = false;
    for ch in trimmed.chars() {
        if escaped {
            current.push(ch);
            escaped = false;
            continue;
        }
        match ch {
            '\\' => {
                current.push(ch);
                escaped = true;
            }
            '|' => cells.push(std::mem::take(&mut current)),
            _ => current.push(ch),
        }
    }
    cells.push(current);

    if trimmed.starts_with('|') && !cells.is_empty() {
        cells.remove(0);
    }
    if trimmed.ends_with('|') && !trimmed.ends_with("\\|") && !cells.is_empty() {
        cells.pop();
    }
    cells.into_iter().map(|cell| cell.trim().to_string()).collect()
}

/// Column count of a table delimiter row, if `line` is one.
pub(crate) fn table_separator_columns(line: &str) -> Option<usize> {
    if indent_width(line) >= CODE_INDENT || !line.contains('|') {
        return None;
    }
    let regex = separator_cell_regex()?;
    let cells = split_cells(line);
    if cells.is_empty() || !cells.iter().all(|cell| regex.is_match(cell)) {
        return None;
    }
    Some(cells.len())
}

/// Column count of a line that could head a table.
pub(crate) fn table_header_columns(line: &str) -> Option<usize> {
    if indent_width(line) >= CODE_INDENT || !has_pipe(line) {
        return None;
    }
    Some(split_cells(line).len())
}

#[cfg(test)]
mod tests {
    use super::{
        classify, fence_open, indent_width, is_fence_close, list_marker, setext_level,
        split_cells, strip_indent, table_header_columns, table_separator_columns, LineStart,
    };

    #[test]
    fn classifies_block_starts() {
        assert_eq!(classify(""), LineStart::Blank);
        assert_eq!(classify("   \t"), LineStart::Blank);
        assert_eq!(classify("## Title"), LineStart::AtxHeading { level: 2 });
        assert_eq!(classify("#"), LineStart::AtxHeading { level: 1 });
        assert_eq!(classify("#hashtag"), LineStart::Text);
        assert_eq!(classify("---"), LineStart::ThematicBreak);
        assert_eq!(classify("* * *"), LineStart::ThematicBreak);
        assert_eq!(classify("> quoted"), LineStart::Blockquote);
        assert_eq!(classify("    code"), LineStart::IndentedCode);
        assert_eq!(classify("<div>"), LineStart::HtmlOpen);
        assert_eq!(classify("a < b"), LineStart::Text);
        assert!(matches!(classify("- item"), LineStart::ListItem(_)));
        assert!(matches!(classify("```rust"), LineStart::FenceOpen(_)));
    }

    #[test]
    fn fence_markers_track_character_length_and_info() {
        let marker = fence_open("````rust title").expect("fence");
        assert_eq!(marker.ch, '`');
        assert_eq!(marker.len, 4);
        assert_eq!(marker.info.as_deref(), Some("rust title"));

        assert!(!is_fence_close("```", &marker));
        assert!(is_fence_close("`````", &marker));
        assert!(!is_fence_close("~~~~", &marker));
        assert!(!is_fence_close("```` x", &marker));
        assert!(fence_open("``` a`b").is_none());
        assert_eq!(fence_open("~~~").and_then(|marker| marker.info), None);
    }

    #[test]
    fn list_markers_record_kind_and_content_indent() {
        let bullet = list_marker("- item").expect("bullet");
        assert!(!bullet.ordered);
        assert_eq!(bullet.delimiter, '-');
        assert_eq!(bullet.content_indent, 2);

        let ordered = list_marker("  12) item").expect("ordered");
        assert!(ordered.ordered);
        assert_eq!(ordered.delimiter, ')');
        assert_eq!(ordered.start, Some(12));
        assert_eq!(ordered.content_indent, 6);
        assert!(!ordered.can_interrupt_paragraph());

        let empty = list_marker("-").expect("empty item");
        assert!(empty.empty);
        assert!(!empty.can_interrupt_paragraph());
        assert!(list_marker("-item").is_none());
    }

    #[test]
    fn setext_underlines_map_to_levels() {
        assert_eq!(setext_level("==="), Some(1));
        assert_eq!(setext_level("  --  "), Some(2));
        assert_eq!(setext_level("-=-"), None);
    }

    #[test]
    fn table_rows_split_on_unescaped_pipes() {
        assert_eq!(split_cells("| a | b |"), vec!["a", "b"]);
        assert_eq!(split_cells("a | b"), vec!["a", "b"]);
        assert_eq!(split_cells(r"| a \| b | c |"), vec![r"a \| b", "c"]);
        assert_eq!(table_header_columns("| a | b | c |"), Some(3));
        assert_eq!(table_header_columns(r"a \| b"), None);
        assert_eq!(table_header_columns("plain"), None);
    }

    #[test]
    fn separator_rows_require_dashes_and_a_pipe() {
        assert_eq!(table_separator_columns("| --- | :-: | --: |"), Some(3));
        assert_eq!(table_separator_columns("---|---"), Some(2));
        assert_eq!(table_separator_columns("---"), None);
        assert_eq!(table_separator_columns("| a | b |"), None);
    }

    #[test]
    fn indentation_expands_tabs() {
        assert_eq!(indent_width("\tx"), 4);
        assert_eq!(indent_width("  \tx"), 4);
        assert_eq!(strip_indent("    - x", 2), "  - x");
        assert_eq!(strip_indent("  x", 4), "x");
    }
}
