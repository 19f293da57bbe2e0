use std::fmt::Write;

use serde::Serialize;

use crate::format::{format_bytes, format_rate, truncate_unicode};
use crate::system::process::{ProcessNode, ProcessTree};
use crate::system::snapshot::SystemSnapshot;

const NAME_WIDTH: usize = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

impl OutputFormat {
    /// Unknown names fall back to text.
    pub fn from_config(name: &str) -> Self {
        if name.eq_ignore_ascii_case("json") {
            OutputFormat::Json
        } else {
            OutputFormat::Text
        }
    }
}

/// What to print for each cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReportScope {
    /// Header plus the whole tree.
    Tree,
    /// Header plus the top CPU consumers.
    TopCpu,
}

pub fn render(
    format: OutputFormat,
    scope: ReportScope,
    tree: &ProcessTree,
    snapshot: &SystemSnapshot,
) -> serde_json::Result<String> {
    match format {
        OutputFormat::Text => Ok(render_text(scope, tree, snapshot)),
        OutputFormat::Json => render_json(scope, tree, snapshot),
    }
}

pub fn render_text(scope: ReportScope, tree: &ProcessTree, snapshot: &SystemSnapshot) -> String {
    let mut out = String::new();
    write_header(&mut out, snapshot);
    match scope {
        ReportScope::TopCpu => {
            for node in tree.top_cpu_nodes() {
                write_row(&mut out, 0, node);
            }
        }
        ReportScope::Tree => {
            for (depth, node) in tree.walk_depth_first() {
                write_row(&mut out, depth, node);
            }
        }
    }
    out
}

fn write_header(out: &mut String, snapshot: &SystemSnapshot) {
    let stats = &snapshot.stats;
    let _ = writeln!(
        out,
        "cycle {}  processes {} (+{} -{}){}",
        snapshot.generation,
        snapshot.process_count,
        snapshot.created,
        snapshot.removed,
        if snapshot.truncated { "  [truncated]" } else { "" },
    );
    let _ = writeln!(
        out,
        "memory {} / {}  commit {} / {}  disk {:.1}%",
        format_bytes(stats.used_physical()),
        format_bytes(stats.total_physical),
        format_bytes(stats.committed()),
        format_bytes(stats.commit_limit),
        stats.disk_active_percent,
    );
    for drive in &stats.drives {
        let _ = writeln!(
            out,
            "drive {}  {} free of {}",
            drive.label,
            format_bytes(drive.free_bytes),
            format_bytes(drive.total_bytes),
        );
    }
}

fn write_row(out: &mut String, depth: usize, node: &ProcessNode) {
    let indent = "  ".repeat(depth);
    let name = truncate_unicode(&node.name, NAME_WIDTH.saturating_sub(indent.len()).max(8));
    let _ = writeln!(
        out,
        "{indent}{name} ({pid}){svc}  {cpu:.1}%  {mem}  {io}",
        pid = node.pid(),
        svc = if node.is_service { " [svc]" } else { "" },
        cpu = node.cpu_percent,
        mem = format_bytes(node.memory_bytes),
        io = format_rate(node.io_bytes_per_sec),
    );
}

#[derive(Serialize)]
struct Row<'a> {
    depth: usize,
    #[serde(flatten)]
    node: &'a ProcessNode,
}

#[derive(Serialize)]
struct CycleReport<'a> {
    snapshot: &'a SystemSnapshot,
    processes: Vec<Row<'a>>,
}

/// One JSON document per cycle, on a single line.
pub fn render_json(
    scope: ReportScope,
    tree: &ProcessTree,
    snapshot: &SystemSnapshot,
) -> serde_json::Result<String> {
    let processes = match scope {
        ReportScope::TopCpu => tree.top_cpu_nodes().map(|node| Row { depth: 0, node }).collect(),
        ReportScope::Tree => tree
            .walk_depth_first()
            .into_iter()
            .map(|(depth, node)| Row { depth, node })
            .collect(),
    };
    serde_json::to_string(&CycleReport {
        snapshot,
        processes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_format_from_config() {
        assert_eq!(OutputFormat::from_config("json"), OutputFormat::Json);
        assert_eq!(OutputFormat::from_config("JSON"), OutputFormat::Json);
        assert_eq!(OutputFormat::from_config("text"), OutputFormat::Text);
        assert_eq!(OutputFormat::from_config("yaml"), OutputFormat::Text);
    }
}
