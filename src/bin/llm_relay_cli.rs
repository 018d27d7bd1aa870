//! llm-relay CLI: 缓存清理、Token 估算、分块预览与配置查看的命令行工具
//!
//! Usage:
//!   llm-relay-cli cache-clear <l1|l2|l3|all>              Clear cache tier(s)
//!   llm-relay-cli estimate <file>                         Estimate tokens against the budget
//!   llm-relay-cli chunk <file> [--target N] [--overlap N] Show the chunk plan
//!   llm-relay-cli config                                  Print the effective configuration

use anyhow::{bail, Context};
use llm_relay::cache::{CacheLevel, MultiLevelCache};
use llm_relay::{Pipeline, PipelineConfig};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

const EXIT_USAGE: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let (config_path, args) = match split_config_flag(args) {
        Ok(v) => v,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::from(EXIT_USAGE);
        }
    };

    let Some(command) = args.first() else {
        print_usage();
        return ExitCode::from(EXIT_USAGE);
    };

    let result = match command.as_str() {
        "cache-clear" => {
            // A bad level is a usage error, not a runtime failure.
            let level = match args.get(1).map(|s| s.parse::<CacheLevel>()) {
                Some(Ok(level)) => level,
                Some(Err(e)) => {
                    eprintln!("Error: {e}");
                    eprintln!("Valid levels: l1, l2, l3, all");
                    return ExitCode::from(EXIT_USAGE);
                }
                None => {
                    eprintln!("Usage: llm-relay-cli cache-clear <l1|l2|l3|all>");
                    return ExitCode::from(EXIT_USAGE);
                }
            };
            cmd_cache_clear(config_path.as_deref(), level).await
        }
        "estimate" => cmd_estimate(config_path.as_deref(), &args[1..]).await,
        "chunk" => cmd_chunk(config_path.as_deref(), &args[1..]).await,
        "config" => cmd_config(config_path.as_deref()),
        "version" | "--version" | "-V" => {
            cmd_version();
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {other}");
            eprintln!();
            print_usage();
            return ExitCode::from(EXIT_USAGE);
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn print_usage() {
    println!(
        r#"llm-relay-cli: LLM 请求管线命令行工具

USAGE:
    llm-relay-cli [--config <path>] <COMMAND> [OPTIONS]

COMMANDS:
    cache-clear <l1|l2|l3|all>              Clear one cache tier or all of them
    estimate <file>                         Estimate tokens and check the prompt budget
    chunk <file> [--target N] [--overlap N] Show how a file would be chunked
    config                                  Print the effective configuration as YAML
    version                                 Show version information
    help                                    Show this help message

ENVIRONMENT:
    LLM_RELAY_*                             Override configuration values
    RUST_LOG                                Log filter (default: info)"#
    );
}

fn cmd_version() {
    println!("llm-relay-cli {}", env!("CARGO_PKG_VERSION"));
}

/// Pull the global `--config <path>` out of the argument list.
fn split_config_flag(args: Vec<String>) -> anyhow::Result<(Option<PathBuf>, Vec<String>)> {
    let mut path = None;
    let mut rest = Vec::with_capacity(args.len());
    let mut iter = args.into_iter();
    while let Some(arg) = iter.next() {
        if arg == "--config" {
            match iter.next() {
                Some(p) => path = Some(PathBuf::from(p)),
                None => bail!("--config requires a path"),
            }
        } else {
            rest.push(arg);
        }
    }
    Ok((path, rest))
}

fn flag_value(args: &[String], name: &str) -> anyhow::Result<Option<usize>> {
    for (i, arg) in args.iter().enumerate() {
        if arg == name {
            let raw = args
                .get(i + 1)
                .with_context(|| format!("{name} requires a value"))?;
            let n = raw
                .parse::<usize>()
                .with_context(|| format!("{name} expects a non-negative integer, got '{raw}'"))?;
            return Ok(Some(n));
        }
    }
    Ok(None)
}

fn load_config(path: Option<&Path>) -> anyhow::Result<PipelineConfig> {
    PipelineConfig::load(path).context("failed to load configuration")
}

async fn read_input(args: &[String]) -> anyhow::Result<(String, String)> {
    let file = args
        .iter()
        .find(|a| !a.starts_with("--"))
        .context("missing <file> argument")?;
    let content = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("cannot read {file}"))?;
    Ok((file.clone(), content))
}

async fn cmd_cache_clear(config_path: Option<&Path>, level: CacheLevel) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let cache = MultiLevelCache::new(config.cache_config())?;
    let (l1, l2, l3) = cache.len().await?;
    cache.clear(level).await?;
    println!("Cleared cache level '{level}' (entries before: l1={l1}, l2={l2}, l3={l3})");
    Ok(())
}

async fn cmd_estimate(config_path: Option<&Path>, args: &[String]) -> anyhow::Result<()> {
    let (file, content) = read_input(args).await?;
    let pipeline = Pipeline::from_config(load_config(config_path)?)?;
    let tokens = pipeline.estimate(&content);
    let budget = pipeline.budget();

    println!("File:       {file}");
    println!("Tokenizer:  {}", pipeline.estimator().tokenizer_name());
    println!("Characters: {}", content.chars().count());
    println!("Tokens:     {tokens}");
    println!(
        "Budget:     {} ({} context - {} reserved)",
        budget.available(),
        budget.context_window,
        budget.response_reserve
    );
    if budget.fits(tokens) {
        println!("Fits:       yes");
    } else {
        println!("Fits:       no ({} tokens over)", budget.overflow(tokens));
    }
    Ok(())
}

async fn cmd_chunk(config_path: Option<&Path>, args: &[String]) -> anyhow::Result<()> {
    let mut config = load_config(config_path)?;
    if let Some(target) = flag_value(args, "--target")? {
        config.chunking.target_chunk_tokens = target;
    }
    if let Some(overlap) = flag_value(args, "--overlap")? {
        config.chunking.chunk_overlap_tokens = overlap;
    }
    // Skip the flag values when locating the file argument.
    let positional: Vec<String> = args
        .iter()
        .enumerate()
        .filter(|(i, a)| {
            !a.starts_with("--")
                && !(*i > 0 && matches!(args[i - 1].as_str(), "--target" | "--overlap"))
        })
        .map(|(_, a)| a.clone())
        .collect();
    let (file, content) = read_input(&positional).await?;

    let pipeline = Pipeline::from_config(config)?;
    let chunking = &pipeline.config().chunking;
    let chunks = pipeline.chunk(&content);

    println!(
        "{file}: {} tokens, target {} overlap {}, {} chunk(s)",
        pipeline.estimate(&content),
        chunking.target_chunk_tokens,
        chunking.chunk_overlap_tokens,
        chunks.total()
    );
    for chunk in chunks {
        println!(
            "  [{}/{}] {}..{}  ~{} tokens",
            chunk.index + 1,
            chunk.total,
            chunk.start,
            chunk.end,
            pipeline.estimate(&chunk.text)
        );
    }
    Ok(())
}

fn cmd_config(config_path: Option<&Path>) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    print!("{}", config.to_yaml()?);
    Ok(())
}
