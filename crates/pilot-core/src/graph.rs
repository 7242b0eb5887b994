//! DOT generation for the manifest dependency graph.
//!
//! Pure string output so the graph CLI can be tested without
//! graphviz; rendering to an image lives in the runtime crate.

use std::fmt::Write as _;

use crate::manifest::ProcessManifest;

/// Render the dependency graph as graphviz DOT.
///
/// Nodes follow manifest declaration order, edges run dependency →
/// dependent. With `detailed`, node labels carry the command line,
/// readiness strategy, and shutdown policy.
pub fn to_dot(manifest: &ProcessManifest, detailed: bool) -> String {
    let mut out = String::from("digraph process_pilot {\n");
    out.push_str("    rankdir=LR;\n");
    out.push_str("    node [shape=box, fontname=\"monospace\"];\n");

    for spec in manifest.specs() {
        let label = if detailed {
            let mut command = spec.path.clone();
            for arg in &spec.args {
                command.push(' ');
                command.push_str(arg);
            }
            let ready = spec.ready_strategy.as_deref().unwrap_or("none");
            format!(
                "{}\\n{}\\nready: {}\\non exit: {}",
                spec.name, command, ready, spec.shutdown_strategy
            )
        } else {
            spec.name.clone()
        };
        let _ = writeln!(
            out,
            "    \"{}\" [label=\"{}\"];",
            escape(&spec.name),
            escape_label(&label)
        );
    }

    for spec in manifest.specs() {
        for dep in &spec.dependencies {
            let _ = writeln!(out, "    \"{}\" -> \"{}\";", escape(dep), escape(&spec.name));
        }
    }

    out.push_str("}\n");
    out
}

fn escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

fn escape_label(s: &str) -> String {
    // Already-encoded "\n" separators must survive, so only quotes
    // are escaped here.
    s.replace('"', "\\\"")
}
