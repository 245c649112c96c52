//! `remora hierarchy`: print the ancestor tree of a class.

use crate::output::StyledOutput;
use anyhow::Context;
use remora_remap::{classpath_repo, ClassRepoFederation, InheritanceGraph, Namespace, PlatformRepo};
use rustc_hash::FxHashSet;
use std::path::PathBuf;
use std::sync::Arc;

pub fn execute(classpath: &[PathBuf], class: &str, out: &mut StyledOutput) -> anyhow::Result<()> {
    let graph = graph(classpath)?;
    let class = class.replace('.', "/");
    if !graph.is_known(&class) {
        anyhow::bail!("Class not found on classpath: {}", class);
    }

    for (depth, name) in tree(&graph, &class) {
        out.plain(&"  ".repeat(depth));
        match graph.is_interface(&name) {
            Some(true) => out.info(&name),
            Some(false) => out.plain(&name),
            None => out.warning(&name),
        }
        out.newline();
    }
    Ok(())
}

/// Classpath entries first, then the JDK
fn graph(classpath: &[PathBuf]) -> anyhow::Result<InheritanceGraph> {
    let federation = Arc::new(ClassRepoFederation::new());
    for entry in classpath {
        let repo = classpath_repo(entry).with_context(|| format!("Failed to open classpath entry {}", entry.display()))?;
        federation.add_repo(repo);
    }
    federation.set_platform(Arc::new(PlatformRepo::open(Namespace::new(""), &[])));
    Ok(InheritanceGraph::new(federation))
}

/// Depth-first ancestor walk; each class is listed once
fn tree(graph: &InheritanceGraph, class: &str) -> Vec<(usize, String)> {
    let mut seen = FxHashSet::default();
    let mut lines = Vec::new();
    let mut stack = vec![(0, class.to_string())];
    while let Some((depth, name)) = stack.pop() {
        if !seen.insert(name.clone()) {
            continue;
        }
        let parents = graph.parents_of(&name);
        stack.extend(parents.iter().rev().map(|parent| (depth + 1, parent.clone())));
        lines.push((depth, name));
    }
    lines
}
