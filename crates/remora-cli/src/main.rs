//! Remora command-line tool
//!
//! Rewrites JVM class files between an internal naming scheme and a public
//! one, and inspects class hierarchies on a classpath.

mod commands;
mod output;

use clap::{Parser, Subcommand};
use remora_remap::Direction;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "remora")]
#[command(about = "JVM class-file symbol remapper", long_about = None)]
#[command(version)]
struct Cli {
    /// Colored output: auto, always, never
    #[arg(long, global = true)]
    color: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Rewrite a class file or a directory of class files
    Remap {
        /// SRG/CSRG mapping file (internal to public)
        #[arg(short, long)]
        mappings: PathBuf,
        /// Internal namespace prefix, e.g. net/minecraft/
        #[arg(short, long)]
        prefix: Option<String>,
        /// Engine configuration (remora.toml)
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Extra class directories used for hierarchy lookups
        #[arg(long = "classpath")]
        classpath: Vec<PathBuf>,
        /// Mapping direction: to-public or to-internal
        #[arg(short, long)]
        direction: Option<Direction>,
        /// Write a copy of every rewritten class here
        #[arg(long)]
        dump: Option<PathBuf>,
        /// Write a JSON report of the run
        #[arg(long)]
        report: Option<PathBuf>,
        /// Class file or directory to rewrite
        input: PathBuf,
        /// Output directory
        #[arg(short, long, default_value = "remapped")]
        output: PathBuf,
    },

    /// Print the ancestors of a class
    Hierarchy {
        /// Class directories to search
        #[arg(long = "classpath", required = true)]
        classpath: Vec<PathBuf>,
        /// Internal class name, slashed or dotted
        class: String,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "remora=info".into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let mut out = output::StyledOutput::new(output::resolve_color_choice(cli.color.as_deref()));

    match cli.command {
        Commands::Remap {
            mappings,
            prefix,
            config,
            classpath,
            direction,
            dump,
            report,
            input,
            output,
        } => commands::remap::execute(
            commands::remap::RemapArgs {
                mappings,
                prefix,
                config,
                classpath,
                direction,
                dump,
                report,
                input,
                output,
            },
            &mut out,
        ),

        Commands::Hierarchy { classpath, class } => commands::hierarchy::execute(&classpath, &class, &mut out),
    }
}
