use super::blocks::{BlockScanner, ScannedBlock, TailView};
use super::html::{render_html, table_shape};
use super::{BlockKind, RenderPatch, RenderedBlock};

/// Incremental Markdown renderer for one growing document.
///
/// Text arrives in arbitrary fragments through [`feed`](Self::feed); each call
/// returns the patches that bring the host's copy of the document up to date.
/// The host only ever holds closed blocks plus at most one open block at the
/// end, so patches never touch anything but the last block.
#[derive(Debug, Default)]
pub struct IncrementalRenderer {
    scanner: BlockScanner,
    partial: String,
    rendered: Vec<RenderedBlock>,
    sent_finalized: usize,
    sent_tail: Option<RenderedBlock>,
    finished: bool,
}

impl IncrementalRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_finalized(&self) -> bool {
        self.finished
    }

    /// Appends `delta` to the document.
    pub fn feed(&mut self, delta: &str) -> Vec<RenderPatch> {
        if self.finished {
            tracing::debug!(len = delta.len(), "ignoring markdown delta after finalize");
            return Vec::new();
        }
        if delta.is_empty() {
            return Vec::new();
        }

        self.partial.push_str(delta);
        while let Some(newline) = self.partial.find('\n') {
            let rest = self.partial.split_off(newline + 1);
            let mut line = std::mem::replace(&mut self.partial, rest);
            line.truncate(newline);
            if line.ends_with('\r') {
                line.pop();
            }
            self.scanner.push_line(&line);
        }
        self.sync()
    }

    /// Closes every open block, treating the trailing partial line as
    /// complete. Calling it again is a no-op.
    pub fn finalize(&mut self) -> Vec<RenderPatch> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;

        let line = std::mem::take(&mut self.partial);
        if !line.is_empty() {
            self.scanner.push_line(line.strip_suffix('\r').unwrap_or(&line));
        }
        self.scanner.finish();

        let mut patches = self.sync();
        if let Some(stale) = self.sent_tail.take() {
            // Shown but never confirmed by a closed block; freeze it as-is.
            let index = self.sent_finalized;
            self.rendered.push(stale);
            self.sent_finalized += 1;
            patches.push(RenderPatch::FinalizeBlock { index });
        }
        patches
    }

    /// The document as the host currently sees it.
    pub fn blocks(&self) -> Vec<RenderedBlock> {
        let mut blocks = self.rendered[..self.sent_finalized].to_vec();
        blocks.extend(self.sent_tail.clone());
        blocks
    }

    fn sync(&mut self) -> Vec<RenderPatch> {
        let mut patches = Vec::new();

        for scanned in &self.scanner.closed()[self.rendered.len()..] {
            self.rendered.push(render_block(scanned, false));
        }

        while self.sent_finalized < self.rendered.len() {
            let index = self.sent_finalized;
            let block = &self.rendered[index];
            match self.sent_tail.take() {
                Some(shown) if &shown == block => {}
                Some(_) => patches.push(RenderPatch::ReplaceBlock {
                    index,
                    block: block.clone(),
                }),
                None => patches.push(RenderPatch::AppendBlock {
                    index,
                    block: block.clone(),
                }),
            }
            patches.push(RenderPatch::FinalizeBlock { index });
            self.sent_finalized += 1;
        }

        if self.finished {
            return patches;
        }

        let index = self.sent_finalized;
        let Some(TailView { block, provisional }) = self.scanner.tail_view(&self.partial) else {
            return patches;
        };
        let block = render_block(&block, provisional);
        if self.sent_tail.as_ref() != Some(&block) {
            patches.push(if self.sent_tail.is_some() {
                RenderPatch::ReplaceBlock {
                    index,
                    block: block.clone(),
                }
            } else {
                RenderPatch::AppendBlock {
                    index,
                    block: block.clone(),
                }
            });
            self.sent_tail = Some(block);
        }
        patches
    }
}

fn render_block(scanned: &ScannedBlock, provisional: bool) -> RenderedBlock {
    let table = match scanned.kind {
        BlockKind::Table => table_shape(&scanned.source),
        _ => None,
    };
    RenderedBlock {
        kind: scanned.kind.clone(),
        html: render_html(&scanned.source),
        source: scanned.source.clone(),
        table,
        provisional,
    }
}
