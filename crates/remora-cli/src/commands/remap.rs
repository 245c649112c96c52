//! `remora remap`: rewrite class files into the target naming scheme.

use super::files::collect_class_files;
use crate::output::StyledOutput;
use anyhow::Context;
use remora_classfile::peek_class_name;
use remora_remap::{
    classpath_repo, dump, srg, ClassDefiner, ClassRepoFederation, DefineError, Direction, DirectoryRepo,
    MappingTable, RemapConfig, Remapper,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

pub struct RemapArgs {
    pub mappings: PathBuf,
    pub prefix: Option<String>,
    pub config: Option<PathBuf>,
    pub classpath: Vec<PathBuf>,
    pub direction: Option<Direction>,
    pub dump: Option<PathBuf>,
    pub report: Option<PathBuf>,
    pub input: PathBuf,
    pub output: PathBuf,
}

/// Writes classes the engine defines (stubs, the bridge) into the output tree
pub struct DiskDefiner {
    root: PathBuf,
}

impl DiskDefiner {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ClassDefiner for DiskDefiner {
    fn define_class(&self, name: &str, bytes: &[u8]) -> Result<(), DefineError> {
        let path = dump::try_dump(&self.root, name, bytes).map_err(|e| DefineError::Failed {
            name: name.to_string(),
            reason: e.to_string(),
        })?;
        debug!(class = name, path = %path.display(), "defined class on disk");
        Ok(())
    }
}

/// Outcome of one `remap` run, written with `--report`
#[derive(Debug, Default, Serialize)]
pub struct RemapReport {
    pub direction: String,
    pub bridge: String,
    pub classes: Vec<ClassEntry>,
    pub stubs: Vec<String>,
    pub failures: Vec<FailureEntry>,
}

#[derive(Debug, Serialize)]
pub struct ClassEntry {
    pub input: String,
    pub output: String,
}

#[derive(Debug, Serialize)]
pub struct FailureEntry {
    pub path: PathBuf,
    pub error: String,
}

pub fn execute(args: RemapArgs, out: &mut StyledOutput) -> anyhow::Result<()> {
    let report = run(&args)?;

    if let Some(path) = &args.report {
        let json = serde_json::to_string_pretty(&report)?;
        std::fs::write(path, json).with_context(|| format!("Failed to write report {}", path.display()))?;
    }

    out.success("Remapped ");
    out.plain(&format!("{} classes ({})", report.classes.len(), report.direction));
    out.newline();
    if !report.stubs.is_empty() {
        out.warning("Stubbed ");
        out.plain(&report.stubs.join(", "));
        out.newline();
    }
    for failure in &report.failures {
        out.error("Failed ");
        out.plain(&format!("{}: {}", failure.path.display(), failure.error));
        out.newline();
    }

    if !report.failures.is_empty() {
        anyhow::bail!("{} classes failed to remap", report.failures.len());
    }
    Ok(())
}

/// Rewrite every input class into `args.output`
pub fn run(args: &RemapArgs) -> anyhow::Result<RemapReport> {
    let config = load_config(args)?;
    let mapping = srg::load(&args.mappings)
        .with_context(|| format!("Failed to load mappings {}", args.mappings.display()))?;

    let federation = Arc::new(ClassRepoFederation::new());
    if args.input.is_dir() {
        federation.add_repo(Arc::new(DirectoryRepo::new(&args.input)));
    }
    for entry in &args.classpath {
        let repo = classpath_repo(entry).with_context(|| format!("Failed to open classpath entry {}", entry.display()))?;
        federation.add_repo(repo);
    }

    std::fs::create_dir_all(&args.output)
        .with_context(|| format!("Failed to create output directory {}", args.output.display()))?;

    let direction = config.direction;
    let remapper = Remapper::builder(config, MappingTable::new(mapping))
        .federation(federation)
        .definer(Arc::new(DiskDefiner::new(&args.output)))
        .build()
        .context("Failed to build remapper")?;

    let mut report = RemapReport {
        direction: direction.to_string(),
        bridge: remapper.bridge_name().to_string(),
        ..RemapReport::default()
    };

    let files = collect_class_files(&args.input)?;
    info!(classes = files.len(), "remapping");
    for path in files {
        match remap_file(&remapper, &path, &args.output) {
            Ok(entry) => report.classes.push(entry),
            Err(err) => report.failures.push(FailureEntry {
                path,
                error: format!("{:#}", err),
            }),
        }
    }
    report.stubs = remapper.stubs().synthesized();
    Ok(report)
}

/// Configuration file (or `--prefix`, or the environment alone), then
/// command-line flags, then `REMORA_DUMP` / `REMORA_INTERNAL_PREFIX`
fn load_config(args: &RemapArgs) -> anyhow::Result<RemapConfig> {
    let mut config = match (&args.config, &args.prefix) {
        (Some(path), _) => {
            RemapConfig::load(path).with_context(|| format!("Failed to load config {}", path.display()))?
        }
        (None, Some(prefix)) => RemapConfig::new(prefix.as_str()),
        (None, None) => RemapConfig::from_env().context("An internal prefix is required (--prefix or --config)")?,
    };
    if let Some(prefix) = &args.prefix {
        config.internal_prefix = prefix.clone();
    }
    if let Some(direction) = args.direction {
        config.direction = direction;
    }
    if let Some(dump) = &args.dump {
        config.dump_dir = Some(dump.clone());
    }
    config.overlay_env();
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn remap_file(remapper: &Remapper, path: &Path, output: &Path) -> anyhow::Result<ClassEntry> {
    let bytes = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let input = peek_class_name(&bytes).with_context(|| format!("Not a class file: {}", path.display()))?;
    let rewritten = remapper.rewrite(&bytes)?;
    let name = peek_class_name(&rewritten).context("Rewritten class has no name")?;
    dump::try_dump(output, &name, &rewritten).with_context(|| format!("Failed to write {}", name))?;
    debug!(from = %input, to = %name, "wrote class");
    Ok(ClassEntry { input, output: name })
}
