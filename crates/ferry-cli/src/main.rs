//! ferry-ls — a language server powered by external command-line tools.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use colored::Colorize;

use ferry_core::{check_tool, Config};

const NAME: &str = "ferry-ls";

#[derive(Parser)]
#[command(name = NAME)]
#[command(about = "A generic language server driving external linters and formatters")]
#[command(disable_version_flag = true)]
struct Cli {
    /// Path to config.yaml
    #[arg(short = 'c', value_name = "PATH")]
    config: Option<PathBuf>,

    /// Dump the resolved configuration to stdout and exit
    #[arg(short = 'd', long = "dump")]
    dump: bool,

    /// Log file path (defaults to the config's log-file)
    #[arg(long)]
    logfile: Option<PathBuf>,

    /// Log verbosity, 0 (errors only) to 5 (wire traces)
    #[arg(long, default_value_t = 1)]
    loglevel: u32,

    /// Run quieter
    #[arg(short = 'q', long = "quiet")]
    quiet: bool,

    /// Print name and version
    #[arg(short = 'v', long = "version")]
    version: bool,

    /// Check that every configured tool is installed
    #[arg(long)]
    check_deps: bool,

    /// Install missing tool dependencies, then check
    #[arg(long)]
    install_deps: bool,
}

fn main() {
    let cli = Cli::parse();

    if cli.version {
        println!(
            "{NAME} {} (rev: {})",
            env!("CARGO_PKG_VERSION"),
            option_env!("FERRY_BUILD_REV").unwrap_or("HEAD"),
        );
        return;
    }

    if let Err(e) = run(cli) {
        eprintln!("{} {e:#}", "Error:".red().bold());
        process::exit(1);
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let config_path = resolve_config_path(cli.config.as_deref())?;
    let config = Config::load_or_default(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    if cli.dump {
        print!("{}", serde_yaml::to_string(&config)?);
        return Ok(());
    }

    let loglevel = if config.log_level > 0 {
        config.log_level
    } else {
        cli.loglevel
    };
    let logfile = cli
        .logfile
        .clone()
        .or_else(|| (!config.log_file.is_empty()).then(|| PathBuf::from(&config.log_file)));
    init_logging(logfile.as_deref(), loglevel, cli.quiet)?;

    if cli.check_deps || cli.install_deps {
        return check_dependencies(&config, cli.install_deps);
    }

    tracing::info!("{NAME}: reading on stdin, writing on stdout");
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(ferry_lsp::start_server(config))?;
    tracing::info!("{NAME}: connection closed");
    Ok(())
}

/// `-c PATH` must exist; without the flag, the platform config directory
/// is used (and created) with a missing file meaning default config.
fn resolve_config_path(flag: Option<&std::path::Path>) -> anyhow::Result<PathBuf> {
    if let Some(path) = flag {
        anyhow::ensure!(path.exists(), "config file not found: {}", path.display());
        return Ok(path.to_path_buf());
    }

    let base = dirs::config_dir().context("no configuration directory for this platform")?;
    let dir = base.join(NAME);
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("creating config directory {}", dir.display()))?;
    Ok(dir.join("config.yaml"))
}

fn init_logging(
    logfile: Option<&std::path::Path>,
    loglevel: u32,
    quiet: bool,
) -> anyhow::Result<()> {
    if quiet {
        return Ok(());
    }

    let filter = match loglevel {
        0 => "error",
        1 => "warn",
        2 => "info",
        3 => "debug",
        _ => "trace",
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false);
    match logfile {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {}", path.display()))?;
            builder.with_writer(Arc::new(file)).init();
        }
        // The protocol owns stdout, so fallback logging goes to stderr.
        None => builder.with_writer(std::io::stderr).init(),
    }
    Ok(())
}

/// Probe every configured tool; any failure makes the process exit 1.
fn check_dependencies(config: &Config, install: bool) -> anyhow::Result<()> {
    let mut failures = 0usize;
    let mut checked = 0usize;

    for (name, recipe) in config.all_recipes() {
        if recipe.check_installed.is_empty() {
            continue;
        }
        checked += 1;
        let tool = format!("{name} ({})", recipe.display_name());
        match check_tool(recipe, &tool, install) {
            Ok(()) => println!("{} {tool}", "ok".green()),
            Err(e) => {
                failures += 1;
                eprintln!("{} {e}", "missing:".red().bold());
            }
        }
    }

    if failures > 0 {
        anyhow::bail!("{failures} of {checked} tool checks failed");
    }
    println!("All tool dependencies checked successfully.");
    Ok(())
}
