//! Incremental Markdown rendering.
//!
//! [`IncrementalRenderer`] turns a growing Markdown document into a sequence
//! of [`RenderPatch`]es over a list of [`RenderedBlock`]s. Block HTML comes
//! from the `markdown` crate with GitHub-flavored options; block structure is
//! decided line by line so that a half-received table or code fence is never
//! shown as something it is not.

mod blocks;
mod html;
mod lines;
mod renderer;

use serde::{Deserialize, Serialize};

pub use renderer::IncrementalRenderer;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlockKind {
    Paragraph,
    Heading { level: u8 },
    CodeFence { info: Option<String> },
    IndentedCode,
    List { ordered: bool },
    Table,
    Blockquote,
    ThematicBreak,
    Html,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnAlign {
    None,
    Left,
    Center,
    Right,
}

/// Structured view of a table block. `rows[0]` is the header row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableShape {
    pub alignments: Vec<ColumnAlign>,
    pub rows: Vec<Vec<String>>,
}

impl TableShape {
    pub fn header(&self) -> Option<&[String]> {
        self.rows.first().map(Vec::as_slice)
    }

    pub fn body(&self) -> &[Vec<String>] {
        self.rows.get(1..).unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedBlock {
    pub kind: BlockKind,
    /// Markdown source of this block alone, without a trailing newline.
    pub source: String,
    pub html: String,
    pub table: Option<TableShape>,
    /// Set when the block includes a line that has not been completed yet.
    pub provisional: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RenderPatch {
    AppendBlock { index: usize, block: RenderedBlock },
    ReplaceBlock { index: usize, block: RenderedBlock },
    FinalizeBlock { index: usize },
}

impl RenderPatch {
    pub fn index(&self) -> usize {
        match self {
            RenderPatch::AppendBlock { index, .. }
            | RenderPatch::ReplaceBlock { index, .. }
            | RenderPatch::FinalizeBlock { index } => *index,
        }
    }

    pub fn block(&self) -> Option<&RenderedBlock> {
        match self {
            RenderPatch::AppendBlock { block, .. } | RenderPatch::ReplaceBlock { block, .. } => {
                Some(block)
            }
            RenderPatch::FinalizeBlock { .. } => None,
        }
    }
}

/// Renders a complete document in one pass.
pub fn render_document(text: &str) -> Vec<RenderPatch> {
    let mut renderer = IncrementalRenderer::new();
    let mut patches = renderer.feed(text);
    patches.extend(renderer.finalize());
    patches
}

/// Applies `patches` to a block list the way a host would.
///
/// Useful for hosts that keep a plain `Vec` and for checking patch streams.
pub fn apply_patches(blocks: &mut Vec<RenderedBlock>, patches: &[RenderPatch]) {
    for patch in patches {
        match patch {
            RenderPatch::AppendBlock { index, block } | RenderPatch::ReplaceBlock { index, block } => {
                if *index < blocks.len() {
                    blocks[*index] = block.clone();
                } else {
                    blocks.push(block.clone());
                }
            }
            RenderPatch::FinalizeBlock { .. } => {}
        }
    }
}
