//! Line-oriented block scanner.
//!
//! Complete lines are folded into at most one open block; a block is closed
//! only once a later line (or the end of input) proves where it ends. The
//! scanner never revisits a closed block.

use super::lines::{
    classify, indent_width, is_blank, is_fence_close, setext_level, strip_indent,
    table_header_columns, table_separator_columns, FenceMarker, LineStart, ListMarker,
    CODE_INDENT,
};
use super::BlockKind;

#[derive(Debug, Clone, PartialEq, Eq)]
enum OpenKind {
    Paragraph,
    /// A paragraph turned into a heading by its underline; always closed.
    Setext { level: u8 },
    Fence(FenceMarker),
    IndentedCode,
    List {
        marker: ListMarker,
        content_indent: usize,
        nested_fence: Option<FenceMarker>,
    },
    Blockquote,
    Table,
    Html,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct OpenBlock {
    kind: OpenKind,
    lines: Vec<String>,
    /// Blank lines seen after the last content line of a block that may
    /// still continue past them.
    pending_blanks: usize,
}

impl OpenBlock {
    fn new(kind: OpenKind, line: &str) -> Self {
        Self {
            kind,
            lines: vec![line.to_string()],
            pending_blanks: 0,
        }
    }

    fn push(&mut self, line: &str) {
        for _ in 0..self.pending_blanks {
            self.lines.push(String::new());
        }
        self.pending_blanks = 0;
        self.lines.push(line.to_string());
    }

    fn block_kind(&self) -> BlockKind {
        match &self.kind {
            OpenKind::Paragraph => BlockKind::Paragraph,
            OpenKind::Setext { level } => BlockKind::Heading { level: *level },
            OpenKind::Fence(marker) => BlockKind::CodeFence {
                info: marker.info.clone(),
            },
            OpenKind::IndentedCode => BlockKind::IndentedCode,
            OpenKind::List { marker, .. } => BlockKind::List {
                ordered: marker.ordered,
            },
            OpenKind::Blockquote => BlockKind::Blockquote,
            OpenKind::Table => BlockKind::Table,
            OpenKind::Html => BlockKind::Html,
        }
    }

    fn into_source(self) -> ScannedBlock {
        ScannedBlock {
            kind: self.block_kind(),
            source: self.lines.join("\n"),
        }
    }
}

/// A block's kind and Markdown source, before rendering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ScannedBlock {
    pub(crate) kind: BlockKind,
    pub(crate) source: String,
}

/// The not-yet-closed end of the document as it should be shown right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TailView {
    pub(crate) block: ScannedBlock,
    /// Whether the view includes the incomplete trailing line.
    pub(crate) provisional: bool,
}

enum Step {
    /// The line was absorbed and the block stays open.
    Kept,
    /// The line was absorbed (or dropped) and the block is complete.
    Complete,
    /// The block is complete and the line must start something new.
    Interrupted,
}

#[derive(Debug, Default)]
pub(crate) struct BlockScanner {
    closed: Vec<ScannedBlock>,
    open: Option<OpenBlock>,
}

impl BlockScanner {
    pub(crate) fn closed(&self) -> &[ScannedBlock] {
        &self.closed
    }

    /// Folds one complete line (without its newline) into the document.
    pub(crate) fn push_line(&mut self, line: &str) {
        if let Some(mut open) = self.open.take() {
            match self.extend(&mut open, line) {
                Step::Kept => {
                    self.open = Some(open);
                    return;
                }
                Step::Complete => {
                    self.close(open);
                    return;
                }
                Step::Interrupted => self.close(open),
            }
        }
        self.start(line);
    }

    /// Closes whatever block is still open.
    pub(crate) fn finish(&mut self) {
        if let Some(open) = self.open.take() {
            self.close(open);
        }
    }

    /// What the open end of the document looks like with `partial` as the
    /// incomplete trailing line.
    pub(crate) fn tail_view(&self, partial: &str) -> Option<TailView> {
        let partial = partial.strip_suffix('\r').unwrap_or(partial);
        match &self.open {
            Some(open) => {
                if !is_blank(partial) && continues(open, partial) {
                    let mut lines = open.lines.clone();
                    lines.extend(std::iter::repeat(String::new()).take(open.pending_blanks));
                    lines.push(partial.to_string());
                    Some(TailView {
                        block: ScannedBlock {
                            kind: open.block_kind(),
                            source: lines.join("\n"),
                        },
                        provisional: true,
                    })
                } else {
                    Some(TailView {
                        block: open.clone().into_source(),
                        provisional: awaits_table_separator(open),
                    })
                }
            }
            None if is_blank(partial) => None,
            None => Some(TailView {
                block: ScannedBlock {
                    kind: provisional_kind(partial),
                    source: partial.to_string(),
                },
                provisional: true,
            }),
        }
    }

    fn close(&mut self, open: OpenBlock) {
        self.closed.push(open.into_source());
    }

    fn close_single(&mut self, kind: BlockKind, line: &str) {
        self.closed.push(ScannedBlock {
            kind,
            source: line.to_string(),
        });
    }

    fn start(&mut self, line: &str) {
        match classify(line) {
            LineStart::Blank => {}
            LineStart::IndentedCode => {
                self.open = Some(OpenBlock::new(OpenKind::IndentedCode, line));
            }
            LineStart::ThematicBreak => self.close_single(BlockKind::ThematicBreak, line),
            LineStart::AtxHeading { level } => {
                self.close_single(BlockKind::Heading { level }, line)
            }
            LineStart::FenceOpen(marker) => {
                self.open = Some(OpenBlock::new(OpenKind::Fence(marker), line));
            }
            LineStart::Blockquote => {
                self.open = Some(OpenBlock::new(OpenKind::Blockquote, line));
            }
            LineStart::ListItem(marker) => {
                let content_indent = marker.content_indent;
                let nested_fence = item_fence_open(line, content_indent);
                self.open = Some(OpenBlock::new(
                    OpenKind::List {
                        marker,
                        content_indent,
                        nested_fence,
                    },
                    line,
                ));
            }
            LineStart::HtmlOpen => {
                self.open = Some(OpenBlock::new(OpenKind::Html, line));
            }
            LineStart::Text => {
                self.open = Some(OpenBlock::new(OpenKind::Paragraph, line));
            }
        }
    }

    fn extend(&mut self, open: &mut OpenBlock, line: &str) -> Step {
        match open.kind {
            OpenKind::Paragraph => self.extend_paragraph(open, line),
            OpenKind::Setext { .. } => Step::Interrupted,
            OpenKind::Fence(ref marker) => {
                let closing = is_fence_close(line, marker);
                open.push(line);
                if closing {
                    Step::Complete
                } else {
                    Step::Kept
                }
            }
            OpenKind::IndentedCode => {
                if is_blank(line) {
                    open.pending_blanks += 1;
                    Step::Kept
                } else if indent_width(line) >= CODE_INDENT {
                    open.push(line);
                    Step::Kept
                } else {
                    Step::Interrupted
                }
            }
            OpenKind::List { .. } => extend_list(open, line),
            OpenKind::Blockquote => {
                if is_blank(line) {
                    return Step::Complete;
                }
                let start = classify(line);
                if start == LineStart::Blockquote || start.is_text() {
                    open.push(line);
                    Step::Kept
                } else {
                    Step::Interrupted
                }
            }
            OpenKind::Table => {
                if is_blank(line) {
                    return Step::Complete;
                }
                if classify(line).is_text() {
                    open.push(line);
                    Step::Kept
                } else {
                    Step::Interrupted
                }
            }
            OpenKind::Html => {
                if is_blank(line) {
                    Step::Complete
                } else {
                    open.push(line);
                    Step::Kept
                }
            }
        }
    }

    fn extend_paragraph(&mut self, open: &mut OpenBlock, line: &str) -> Step {
        if is_blank(line) {
            return Step::Complete;
        }

        if let Some(columns) = table_separator_columns(line) {
            let header_columns = open.lines.last().and_then(|last| table_header_columns(last));
            if header_columns == Some(columns) {
                let header = open.lines.pop().unwrap_or_default();
                let table = OpenBlock {
                    kind: OpenKind::Table,
                    lines: vec![header, line.to_string()],
                    pending_blanks: 0,
                };
                let leading = std::mem::replace(open, table);
                if !leading.lines.is_empty() {
                    self.close(leading);
                }
                return Step::Kept;
            }
        }

        if let Some(level) = setext_level(line) {
            open.push(line);
            open.kind = OpenKind::Setext { level };
            return Step::Complete;
        }

        match classify(line) {
            LineStart::Text | LineStart::IndentedCode | LineStart::HtmlOpen => {
                open.push(line);
                Step::Kept
            }
            LineStart::ListItem(marker) if !marker.can_interrupt_paragraph() => {
                open.push(line);
                Step::Kept
            }
            _ => Step::Interrupted,
        }
    }
}

fn extend_list(open: &mut OpenBlock, line: &str) -> Step {
    let OpenKind::List {
        marker,
        content_indent,
        nested_fence,
    } = &mut open.kind
    else {
        return Step::Interrupted;
    };

    if let Some(fence) = nested_fence.as_ref() {
        let closing = is_fence_close(strip_indent(line, *content_indent), fence);
        if closing {
            *nested_fence = None;
        }
        open.push(line);
        return Step::Kept;
    }

    if is_blank(line) {
        open.pending_blanks += 1;
        return Step::Kept;
    }

    if indent_width(line) >= *content_indent {
        *nested_fence = nested_fence_open(line, *content_indent);
        open.push(line);
        return Step::Kept;
    }

    let start = classify(line);
    if let LineStart::ListItem(item) = &start {
        if item.same_list(marker) {
            *content_indent = item.content_indent;
            *nested_fence = item_fence_open(line, item.content_indent);
            open.push(line);
            return Step::Kept;
        }
    }

    if open.pending_blanks == 0 && start.is_text() {
        open.push(line);
        return Step::Kept;
    }

    open.pending_blanks = 0;
    Step::Interrupted
}

/// A fence opened by the content of a list line, if any.
fn nested_fence_open(line: &str, content_indent: usize) -> Option<FenceMarker> {
    match classify(strip_indent(line, content_indent)) {
        LineStart::FenceOpen(marker) => Some(marker),
        _ => None,
    }
}

/// A fence opened right after a list item's marker.
fn item_fence_open(line: &str, content_indent: usize) -> Option<FenceMarker> {
    let content = line
        .char_indices()
        .nth(content_indent)
        .map_or("", |(offset, _)| &line[offset..]);
    match classify(content) {
        LineStart::FenceOpen(marker) => Some(marker),
        _ => None,
    }
}

/// Whether an incomplete trailing line would extend `open` rather than
/// start a block of its own.
fn continues(open: &OpenBlock, partial: &str) -> bool {
    match &open.kind {
        OpenKind::Fence(_) | OpenKind::Html => true,
        OpenKind::Table => false,
        OpenKind::IndentedCode => indent_width(partial) >= CODE_INDENT,
        OpenKind::Blockquote => {
            let start = classify(partial);
            start == LineStart::Blockquote || start.is_text()
        }
        OpenKind::Setext { .. } => false,
        OpenKind::Paragraph => match classify(partial) {
            LineStart::Text | LineStart::IndentedCode | LineStart::HtmlOpen => true,
            LineStart::ListItem(marker) => !marker.can_interrupt_paragraph(),
            _ => setext_level(partial).is_some(),
        },
        OpenKind::List {
            marker,
            content_indent,
            nested_fence,
        } => {
            if nested_fence.is_some() || indent_width(partial) >= *content_indent {
                return true;
            }
            match classify(partial) {
                LineStart::ListItem(item) => item.same_list(marker),
                LineStart::Text => open.pending_blanks == 0,
                _ => false,
            }
        }
    }
}

/// Best guess at what an incomplete line will become. Never a table: a
/// table needs its separator row, which cannot be on the same line.
/// A paragraph whose last line could be a table header may still turn into a
/// table once the next line arrives.
fn awaits_table_separator(open: &OpenBlock) -> bool {
    open.kind == OpenKind::Paragraph
        && open.pending_blanks == 0
        && open
            .lines
            .last()
            .and_then(|line| table_header_columns(line))
            .is_some()
}

fn provisional_kind(partial: &str) -> BlockKind {
    match classify(partial) {
        LineStart::AtxHeading { level } => BlockKind::Heading { level },
        LineStart::FenceOpen(marker) => BlockKind::CodeFence { info: marker.info },
        LineStart::ListItem(marker) => BlockKind::List {
            ordered: marker.ordered,
        },
        LineStart::Blockquote => BlockKind::Blockquote,
        LineStart::ThematicBreak => BlockKind::ThematicBreak,
        LineStart::IndentedCode => BlockKind::IndentedCode,
        LineStart::HtmlOpen => BlockKind::Html,
        LineStart::Blank | LineStart::Text => BlockKind::Paragraph,
    }
}
