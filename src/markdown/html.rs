use markdown::mdast::{self, AlignKind};
use markdown::{to_html_with_options, to_mdast, Options, ParseOptions};

use super::{ColumnAlign, TableShape};

/// Renders one block's source to HTML with GitHub-flavored options.
///
/// Generation is best-effort: on failure the source is shown as an escaped
/// paragraph instead.
pub(crate) fn render_html(source: &str) -> String {
    match to_html_with_options(source, &Options::gfm()) {
        Ok(html) => html,
        Err(message) => {
            tracing::debug!(%message, "markdown html generation failed; using plain text");
            plain_paragraph(source)
        }
    }
}

fn plain_paragraph(source: &str) -> String {
    format!("<p>{}</p>\n", escape_html(source))
}

pub(crate) fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(ch),
        }
    }
    out
}

/// Extracts the header, body rows and column alignment of the first table in
/// `source`.
pub(crate) fn table_shape(source: &str) -> Option<TableShape> {
    let root = to_mdast(source, &ParseOptions::gfm()).ok()?;
    let nodes = match root {
        mdast::Node::Root(root) => root.children,
        other => vec![other],
    };
    nodes.into_iter().find_map(|node| match node {
        mdast::Node::Table(table) => Some(shape_from_table(&table)),
        _ => None,
    })
}

fn shape_from_table(table: &mdast::Table) -> TableShape {
    let alignments = table
        .align
        .iter()
        .map(|align| match align {
            AlignKind::Left => ColumnAlign::Left,
            AlignKind::Right => ColumnAlign::Right,
            AlignKind::Center => ColumnAlign::Center,
            AlignKind::None => ColumnAlign::None,
        })
        .collect();

    let rows = table
        .children
        .iter()
        .filter_map(|row| match row {
            mdast::Node::TableRow(row) => Some(
                row.children
                    .iter()
                    .map(|cell| match cell {
                        mdast::Node::TableCell(cell) => plain_text_from_nodes(&cell.children),
                        other => plain_text_from_nodes(std::slice::from_ref(other)),
                    })
                    .collect::<Vec<_>>(),
            ),
            _ => None,
        })
        .collect();

    TableShape { alignments, rows }
}

fn plain_text_from_nodes(nodes: &[mdast::Node]) -> String {
    let mut out = String::new();
    for node in nodes {
        match node {
            mdast::Node::Text(text) => out.push_str(&text.value),
            mdast::Node::InlineCode(code) => out.push_str(&code.value),
            mdast::Node::Strong(strong) => out.push_str(&plain_text_from_nodes(&strong.children)),
            mdast::Node::Emphasis(emphasis) => {
                out.push_str(&plain_text_from_nodes(&emphasis.children))
            }
            mdast::Node::Delete(delete) => out.push_str(&plain_text_from_nodes(&delete.children)),
            mdast::Node::Link(link) => out.push_str(&plain_text_from_nodes(&link.children)),
            mdast::Node::Html(html) => out.push_str(&html.value),
            mdast::Node::Image(image) => out.push_str(&image.alt),
            _ => {}
        }
    }
    out
}
