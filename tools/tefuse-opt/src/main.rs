use std::fs;
use std::io::{self, Read, Write};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tefuse::{parse_graph, FuserConfig, Graph, Pipeline};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Runs the tensor-expression fuser over a text IR graph and prints the result.
#[derive(Parser, Debug)]
#[command(name = "tefuse-opt", version, about, long_about = None)]
struct Cli {
    /// Graph in text form. Reads stdin when omitted or `-`.
    #[arg(value_name = "INPUT")]
    input: Option<PathBuf>,

    /// Write the result here instead of stdout.
    #[arg(short, long, value_name = "OUTPUT")]
    output: Option<PathBuf>,

    /// JSON file with fuser settings; flags below override it.
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Smallest group worth materializing.
    #[arg(long)]
    min_group_size: Option<usize>,

    /// Allow groups on CPU tensors.
    #[arg(long, conflicts_with = "no_cpu_fusion")]
    cpu_fusion: bool,

    /// Never group CPU tensors.
    #[arg(long)]
    no_cpu_fusion: bool,

    /// Never group CUDA tensors.
    #[arg(long)]
    no_gpu_fusion: bool,

    /// Leave dead nodes in place.
    #[arg(long)]
    skip_dce: bool,

    /// Lint the graph after every pass.
    #[arg(long)]
    verify: bool,

    /// Emit the graph as JSON instead of text.
    #[arg(long)]
    json: bool,
}

impl Cli {
    fn fuser_config(&self) -> Result<FuserConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let text = fs::read_to_string(path)
                    .with_context(|| format!("reading {}", path.display()))?;
                FuserConfig::from_json(&text)
                    .with_context(|| format!("parsing {}", path.display()))?
            }
            None => FuserConfig::from_env(),
        };
        if let Some(size) = self.min_group_size {
            config = config.with_min_group_size(size);
        }
        if self.cpu_fusion {
            config = config.with_cpu_fusion(true);
        }
        if self.no_cpu_fusion {
            config = config.with_cpu_fusion(false);
        }
        if self.no_gpu_fusion {
            config = config.with_gpu_fusion(false);
        }
        config.validate()?;
        Ok(config)
    }
}

fn read_input(path: Option<&PathBuf>) -> Result<String> {
    match path {
        Some(path) if path.as_os_str() != "-" => {
            fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
        }
        _ => {
            let mut text = String::new();
            io::stdin()
                .read_to_string(&mut text)
                .context("reading stdin")?;
            Ok(text)
        }
    }
}

fn render(graph: &Graph, json: bool) -> Result<String> {
    if json {
        let mut text = graph.to_json().context("serializing graph")?;
        text.push('\n');
        Ok(text)
    } else {
        Ok(graph.to_string())
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = cli.fuser_config()?;
    let source = read_input(cli.input.as_ref())?;
    if source.trim().is_empty() {
        bail!("no graph given");
    }
    let mut graph = parse_graph(&source).context("parsing graph")?;

    let pipeline = Pipeline::tensorexpr(config, cli.skip_dce);
    let stats = pipeline.run(&mut graph, cli.verify)?;
    info!(
        groups = stats.groups_created,
        fused = stats.nodes_fused,
        rejected_small = stats.rejected_small,
        erased = stats.erased_nodes,
        "fusion finished"
    );

    let rendered = render(&graph, cli.json)?;
    match &cli.output {
        Some(path) => fs::write(path, rendered)
            .with_context(|| format!("writing {}", path.display()))?,
        None => io::stdout()
            .write_all(rendered.as_bytes())
            .context("writing stdout")?,
    }
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into()),
        )
        .with_writer(io::stderr)
        .init();

    if let Err(err) = run(Cli::parse()) {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}
