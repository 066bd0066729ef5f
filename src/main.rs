use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use homedir::my_home;
use indicatif::{ProgressBar, ProgressStyle};

use gendex::semantic::{load_embedder, RebuildEvent};
use gendex::{Config, Engine, FsTreeSource, NoteSource, RebuildMode, UnitSource};

mod cli;

use cli::{Command, ModeArgs, SettingsArgs, DIR_ENV};

const DEFAULT_DIR_NAME: &str = ".gendex";
const DEFAULT_NOTES_PATH: &str = ".gendex/notes.jsonl";

fn index_dir(arg: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    if let Some(dir) = arg {
        return Ok(dir);
    }
    if let Some(dir) = std::env::var_os(DIR_ENV).filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir));
    }
    Ok(std::env::current_dir()
        .context("could not determine current directory")?
        .join(DEFAULT_DIR_NAME))
}

fn default_notes_path() -> anyhow::Result<PathBuf> {
    let home = my_home()
        .context("could not determine home directory")?
        .context("home directory path is empty")?;
    Ok(home.join(DEFAULT_NOTES_PATH))
}

fn open_engine(dir: &Path, model: Option<String>) -> anyhow::Result<Engine> {
    std::fs::create_dir_all(dir).with_context(|| format!("could not create {:?}", dir))?;

    let engine = match model {
        None => Engine::load(dir),
        Some(model) => {
            let config = Config::load_with(dir)?;
            let embedder = load_embedder(
                &model,
                dir.to_path_buf(),
                Some(Duration::from_secs(config.download_timeout_secs)),
            )?;
            Engine::open(dir, embedder)
        }
    };
    engine.with_context(|| format!("could not open index at {:?}", dir))
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn progress_bar(hidden: bool) -> ProgressBar {
    if hidden {
        return ProgressBar::hidden();
    }
    let bar = ProgressBar::new(0);
    if let Ok(style) =
        ProgressStyle::with_template("{spinner} [{elapsed_precise}] {bar:40} {pos}/{len} {msg}")
    {
        bar.set_style(style);
    }
    bar
}

fn rebuild(
    engine: Engine,
    mode: ModeArgs,
    root: Option<PathBuf>,
    notes: Option<Option<PathBuf>>,
    no_progress: bool,
) -> anyhow::Result<()> {
    let mode = if mode.full {
        RebuildMode::Full
    } else {
        RebuildMode::Incremental
    };

    let source: Arc<dyn UnitSource> = match notes {
        Some(path) => {
            let path = match path {
                Some(path) => path,
                None => default_notes_path()?,
            };
            log::info!("indexing notes from {:?}", path);
            Arc::new(NoteSource::new(&path))
        }
        None => {
            let root = match root {
                Some(root) => root,
                None => std::env::current_dir().context("could not determine current directory")?,
            };
            log::info!("indexing tree at {:?}", root);
            Arc::new(FsTreeSource::new(&root, engine.dir()))
        }
    };

    let bar = progress_bar(no_progress);
    let events_bar = bar.clone();
    let engine = Arc::new(engine);
    let handle = engine.spawn_rebuild(mode, source, move |event| match event {
        RebuildEvent::Started { total_units, .. } => events_bar.set_length(total_units as u64),
        RebuildEvent::Progress {
            processed_units,
            current_unit,
            ..
        } => {
            events_bar.set_position(processed_units as u64);
            events_bar.set_message(current_unit);
        }
        RebuildEvent::StateChanged { state } => log::debug!("rebuild state: {:?}", state),
        RebuildEvent::Completed { .. } | RebuildEvent::Error { .. } => events_bar.finish_and_clear(),
    })?;

    let cancel = handle.cancel_flag();
    ctrlc::set_handler(move || {
        log::warn!("interrupted, cancelling rebuild");
        cancel.cancel();
    })
    .context("failed to set Ctrl+C handler")?;

    let summary = handle.join().context("rebuild failed")?;
    print_json(&summary)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = cli::Args::parse();
    let dir = index_dir(args.dir)?;

    match args.command {
        Command::Rebuild {
            mode,
            root,
            notes,
            no_progress,
        } => {
            let engine = open_engine(&dir, args.model)?;
            rebuild(engine, mode, root, notes, no_progress)
        }

        Command::Query {
            text,
            k,
            min_confidence,
        } => {
            let engine = open_engine(&dir, args.model)?;
            let response = engine.query(&text, k, min_confidence)?;
            print_json(&response)
        }

        Command::Settings { action } => {
            let engine = open_engine(&dir, args.model)?;
            match action {
                SettingsArgs::Get {} => print_json(&engine.get_settings()),
                SettingsArgs::Set {
                    confidence_threshold,
                } => print_json(&engine.set_settings(confidence_threshold)?),
            }
        }

        Command::Status {} => {
            let engine = open_engine(&dir, args.model)?;
            print_json(&engine.status()?)
        }

        Command::Verify {} => {
            let engine = open_engine(&dir, args.model)?;
            let report = engine.verify()?;
            print_json(&report)?;
            if !report.ok {
                bail!("index at {:?} failed verification", dir);
            }
            Ok(())
        }

        Command::Clean { yes } => {
            if !yes {
                bail!("refusing to remove every generation without --yes");
            }
            let engine = open_engine(&dir, args.model)?;
            print_json(&engine.clean()?)
        }
    }
}
