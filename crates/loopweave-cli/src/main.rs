//! LoopWeave CLI - The `loopweave` command.
//!
//! Plays interactive audio narratives on the terminal: linear scenarios
//! (`run`) and decision trees (`tree`). Every new loop is started in phase
//! with one that is already playing.
//!
//! # Architecture
//!
//! - **loopweave-core**: Looper state machine, sync scheduling, scenario model, config
//! - **director**: Walks scenarios and trees, turning listener input into session calls
//! - **playback**: File-backed resources (log-only monitor, or rodio with `speaker`)
//! - **console**: Stdin reader thread so loops keep cycling while waiting for input

mod console;
mod director;
mod playback;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use console::Console;
use director::Director;
use loopweave_core::{wav, Config, DecisionTree, Scenario, Session, SyncMode, SyncPolicy, SystemClock};
use playback::FileResources;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

/// LoopWeave - Phase-locked loops for interactive audio stories
#[derive(Parser, Debug)]
#[command(name = "loopweave")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Interactive audio narratives with phase-locked loops", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Play a linear scenario
    Run(PlayArgs),

    /// Walk a decision tree
    Tree(PlayArgs),

    /// Print a decision tree as a Graphviz graph
    Graph {
        /// Path to the tree JSON file
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },

    /// Print the length of WAV files
    Probe {
        #[arg(value_name = "FILE", required = true)]
        files: Vec<PathBuf>,
    },

    /// Show the effective configuration
    Config {
        /// Write a commented default configuration file
        #[arg(long)]
        init: bool,

        /// Overwrite an existing file with --init
        #[arg(long)]
        force: bool,

        /// Configuration file to use instead of the default location
        #[arg(long, value_name = "FILE")]
        config: Option<PathBuf>,
    },

    /// Show version information
    Version,
}

#[derive(clap::Args, Debug)]
struct PlayArgs {
    /// Scenario or tree JSON file
    #[arg(value_name = "FILE")]
    file: PathBuf,

    /// Directory containing the audio files (default: next to FILE)
    #[arg(short, long, value_name = "DIR")]
    sounds: Option<PathBuf>,

    /// Configuration file to use instead of the default location
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Reference selection: global-latest or nearest-prior-step
    #[arg(long, value_name = "POLICY")]
    policy: Option<SyncPolicy>,

    /// How waiting loops learn the reference boundary: event or poll
    #[arg(long, value_name = "MODE")]
    sync_mode: Option<SyncMode>,

    /// Play through the audio device (requires the `speaker` feature)
    #[arg(long)]
    speaker: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    match args.command {
        Commands::Run(play) => {
            let scenario = Scenario::load(&play.file)
                .with_context(|| format!("Failed to load scenario: {}", play.file.display()))?;
            log::info!("Loaded scenario with {} steps", scenario.len());
            with_session(&play, SyncPolicy::NearestPriorStep, |director, _| {
                director.run_scenario(&scenario)
            })
        }
        Commands::Tree(play) => {
            let tree = DecisionTree::load(&play.file)
                .with_context(|| format!("Failed to load tree: {}", play.file.display()))?;
            for (node, target) in tree.dangling_links() {
                log::warn!("Node \"{}\" links to missing node \"{}\"", node, target);
            }
            log::info!("Loaded tree with {} nodes", tree.len());
            with_session(&play, SyncPolicy::GlobalLatest, |director, config| {
                director.run_tree(&tree, &config.sounds.extension)
            })
        }
        Commands::Graph { file } => {
            let tree = DecisionTree::load(&file)
                .with_context(|| format!("Failed to load tree: {}", file.display()))?;
            print!("{}", tree.to_dot());
            Ok(())
        }
        Commands::Probe { files } => probe(&files),
        Commands::Config {
            init,
            force,
            config,
        } => show_config(init, force, config),
        Commands::Version => {
            println!("loopweave {}", env!("CARGO_PKG_VERSION"));
            println!();
            println!("Interactive audio narratives with phase-locked loops");
            println!();
            println!(
                "Audio output: {}",
                if cfg!(feature = "speaker") {
                    "monitor, speaker"
                } else {
                    "monitor"
                }
            );
            Ok(())
        }
    }
}

/// Load the configuration file and apply command-line overrides.
fn effective_config(play: &PlayArgs, default_policy: SyncPolicy) -> Result<Config> {
    let mut config = load_config(play.config.as_deref())?;
    if let Some(policy) = play.policy {
        config.sync.policy = Some(policy);
    }
    if let Some(mode) = play.sync_mode {
        config.sync.mode = mode;
    }
    if let Some(dir) = &play.sounds {
        config.sounds.dir = Some(dir.clone());
    }
    config.sync.policy.get_or_insert(default_policy);
    Ok(config)
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("Failed to load config: {}", path.display())),
        None => Ok(Config::load_or_default()),
    }
}

fn sounds_dir(config: &Config, scenario_file: &Path) -> PathBuf {
    config.sounds.dir.clone().unwrap_or_else(|| {
        scenario_file
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    })
}

fn with_session(
    play: &PlayArgs,
    default_policy: SyncPolicy,
    body: impl FnOnce(&mut Director<'_>, &Config) -> Result<()>,
) -> Result<()> {
    let config = effective_config(play, default_policy)?;
    let dir = sounds_dir(&config, &play.file);
    log::info!(
        "Sounds from {} (sync {} mode, {})",
        dir.display(),
        config.sync.mode,
        config.sync.policy.unwrap_or(default_policy)
    );

    let (backend, _output) = playback::open(play.speaker)?;
    let mut session = Session::with_config(
        SystemClock::new(),
        FileResources::new(dir, backend, config.sounds.unreadable_length()),
        &config,
    );

    let shutdown = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&shutdown))
        .context("Failed to install Ctrl-C handler")?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&shutdown))
        .context("Failed to install SIGTERM handler")?;

    let console = Console::stdin();
    let mut director = Director::new(&mut session, &console, &shutdown);
    body(&mut director, &config)?;

    if shutdown.load(std::sync::atomic::Ordering::Relaxed) {
        log::info!("Interrupted");
    }
    Ok(())
}

fn probe(files: &[PathBuf]) -> Result<()> {
    let mut failed = 0;
    for file in files {
        match wav::probe_duration(file) {
            Ok(duration) => println!("{}\t{:.3}s", file.display(), duration.as_secs_f64()),
            Err(e) => {
                eprintln!("{}\t{}", file.display(), e);
                failed += 1;
            }
        }
    }
    if failed > 0 {
        anyhow::bail!("{} of {} files could not be read", failed, files.len());
    }
    Ok(())
}

fn show_config(init: bool, force: bool, path: Option<PathBuf>) -> Result<()> {
    let path = match path {
        Some(path) => path,
        None => Config::config_path()?,
    };

    if init {
        if path.exists() && !force {
            anyhow::bail!(
                "Config file already exists at {} (use --force to overwrite)",
                path.display()
            );
        }
        Config::write_default_config_file(&path)?;
        println!("Wrote default configuration to {}", path.display());
        return Ok(());
    }

    let config = if path.exists() {
        println!("# {}", path.display());
        Config::load_from(&path)
            .with_context(|| format!("Failed to load config: {}", path.display()))?
    } else {
        println!("# defaults ({} does not exist)", path.display());
        Config::default()
    };
    print!("{}", config.to_toml()?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn play_args(argv: &[&str]) -> PlayArgs {
        let args = Args::try_parse_from(argv).unwrap();
        match args.command {
            Commands::Run(play) | Commands::Tree(play) => play,
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_overrides_take_precedence() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("config.toml");
        std::fs::write(
            &config_path,
            "[sync]\nmode = \"event\"\npolicy = \"global-latest\"\n",
        )
        .unwrap();

        let play = play_args(&[
            "loopweave",
            "run",
            "story.json",
            "--config",
            config_path.to_str().unwrap(),
            "--policy",
            "nearest-prior-step",
            "--sync-mode",
            "poll",
        ]);
        let config = effective_config(&play, SyncPolicy::GlobalLatest).unwrap();
        assert_eq!(config.sync.policy, Some(SyncPolicy::NearestPriorStep));
        assert_eq!(config.sync.mode, SyncMode::Poll);
    }

    #[test]
    fn test_default_policy_per_command() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("empty.toml");
        std::fs::write(&config_path, "").unwrap();

        let play = play_args(&[
            "loopweave",
            "tree",
            "tree.json",
            "-c",
            config_path.to_str().unwrap(),
        ]);
        let config = effective_config(&play, SyncPolicy::GlobalLatest).unwrap();
        assert_eq!(config.sync.policy, Some(SyncPolicy::GlobalLatest));
        assert_eq!(config.sync.mode, SyncMode::Event);
    }

    #[test]
    fn test_sounds_dir_defaults_to_scenario_dir() {
        let config = Config::default();
        assert_eq!(
            sounds_dir(&config, Path::new("stories/night/story.json")),
            PathBuf::from("stories/night")
        );

        let play = play_args(&["loopweave", "run", "story.json", "--sounds", "/srv/audio"]);
        let mut config = Config::default();
        config.sounds.dir = play.sounds.clone();
        assert_eq!(sounds_dir(&config, &play.file), PathBuf::from("/srv/audio"));
    }

    #[test]
    fn test_invalid_policy_is_rejected() {
        assert!(Args::try_parse_from(["loopweave", "run", "x.json", "--policy", "latest"]).is_err());
    }

    #[test]
    fn test_missing_config_file_is_an_error() {
        let play = play_args(&["loopweave", "run", "x.json", "--config", "/nonexistent/loopweave.toml"]);
        assert!(effective_config(&play, SyncPolicy::GlobalLatest).is_err());
    }
}
