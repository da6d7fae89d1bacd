//! Text summary builder for CLI output.
//!
//! Formats run reports and output port values as human-readable lines.

use crate::model::{CollectedOutputs, OutputPort, PortData, PortValue, RunReport};
use crate::port;

/// Pre-formatted lines for text output.
pub(crate) struct TextSummary {
    pub lines: Vec<String>,
}

/// How leaf values are rendered in a port listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ValueStyle {
    Values,
    References,
}

/// Build the post-run summary: exit code, console output and outputs.
pub(crate) fn build_run_summary(report: &RunReport, style: ValueStyle) -> TextSummary {
    let mut lines = Vec::new();

    match report.exit_code {
        Some(code) => lines.push(format!("Exitcode: {code}")),
        None => lines.push(format!("Run {} without an exit code", report.status)),
    }
    if !report.stdout.is_empty() {
        lines.push(format!("Stdout:\n{}", report.stdout.trim_end()));
    }
    if !report.stderr.is_empty() {
        lines.push(format!("Stderr:\n{}", report.stderr.trim_end()));
    }

    match &report.outputs {
        CollectedOutputs::Ports { ports } => {
            lines.push("Outputs:".to_string());
            for p in ports {
                lines.push(format!("          {}", port_line(p, style)));
            }
        }
        CollectedOutputs::Bundle { .. } | CollectedOutputs::NotCollected => {}
    }

    TextSummary { lines }
}

/// One-line rendering: `name (depth) -> value`.
pub(crate) fn port_line(p: &OutputPort, style: ValueStyle) -> String {
    format!("{} ({}) -> {}", p.name, p.depth, render_data(&p.data, style))
}

pub(crate) fn render_data(node: &PortData, style: ValueStyle) -> String {
    match node {
        PortData::Value(v) => render_value(v, style),
        PortData::List(items) => {
            let parts: Vec<String> = items.iter().map(|i| render_data(i, style)).collect();
            format!("[{}]", parts.join(", "))
        }
    }
}

pub(crate) fn render_value(v: &PortValue, style: ValueStyle) -> String {
    match (v, style) {
        (PortValue::Error { message }, _) => format!("ERROR: {message}"),
        (PortValue::Reference { uri, .. }, _) => uri.clone(),
        (PortValue::Inline { .. }, ValueStyle::References) => "(inline)".to_string(),
        (PortValue::Inline { content_type, data }, ValueStyle::Values) => {
            match v.string_data() {
                Some(s) => s.to_string(),
                None => format!("<{} bytes of {content_type}>", data.len()),
            }
        }
    }
}

/// Detailed block for one leaf, with its payload when fetched.
pub(crate) fn leaf_block(index: &[usize], v: &PortValue, data: Option<&[u8]>) -> Vec<String> {
    let mut lines = Vec::new();
    if !index.is_empty() {
        let idx: Vec<String> = index.iter().map(|i| i.to_string()).collect();
        lines.push(format!(" Index:        {}", idx.join(",")));
    }
    if let Some(message) = v.error() {
        lines.push(format!(" Error:        {message}"));
        return lines;
    }
    lines.push(format!(
        " Reference:    {}",
        v.reference().unwrap_or("(inline)")
    ));
    lines.push(format!(
        " Content type: {}",
        v.content_type().unwrap_or("-")
    ));
    lines.push(format!(" Data size:    {}", v.size()));
    if let Some(bytes) = data {
        lines.push(" Data: <<".to_string());
        lines.push(String::from_utf8_lossy(bytes).into_owned());
        lines.push(">>".to_string());
    }
    lines
}

/// Header line for a port, with its total size when requested.
pub(crate) fn port_header(p: &OutputPort, with_size: bool) -> String {
    if with_size {
        format!(
            "{} (depth {}, {} bytes) {{",
            p.name,
            p.depth,
            port::total_size(p)
        )
    } else {
        format!("{} (depth {}) {{", p.name, p.depth)
    }
}
