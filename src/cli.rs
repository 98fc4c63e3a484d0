//! CLI for Quill
//!
//! - `serve`: run the canvas WebSocket server
//! - `play`: reveal a sequence of document versions in the terminal
//! - `export`: export a saved conversation's documents
//! - `snapshots`: list or delete saved conversations

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use quill_canvas::{
    CanvasNotification, CanvasPersistence, CanvasSessionManager, ElementKind, ExportFormat,
    TokioScheduler,
};
use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;

use crate::config::AppConfig;

/// Versioned canvas document engine
#[derive(Parser, Debug)]
#[command(name = "quill")]
#[command(about = "Versioned canvas documents with typewriter reveal")]
#[command(version)]
pub struct Cli {
    /// Emit logs as JSON
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the server
    Serve,
    /// Reveal each file as the next cumulative version of one document
    Play {
        /// Version files, oldest first
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Characters per tick (overrides config)
        #[arg(long)]
        speed: Option<usize>,
        /// Write the final document as Markdown here
        #[arg(long)]
        export: Option<PathBuf>,
    },
    /// Export every document of a saved conversation
    Export {
        /// Conversation ID
        conversation_id: String,
        /// Output format
        #[arg(long, value_enum, default_value_t = Format::Markdown)]
        format: Format,
        /// Output directory; prints to stdout when omitted
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// List saved conversations
    Snapshots {
        /// Delete this conversation's snapshot instead
        #[arg(long)]
        delete: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum Format {
    Markdown,
    Html,
}

impl From<Format> for ExportFormat {
    fn from(format: Format) -> Self {
        match format {
            Format::Markdown => ExportFormat::Markdown,
            Format::Html => ExportFormat::Html,
        }
    }
}

/// Run the CLI command
pub async fn run(cli: Cli, config: AppConfig) -> Result<()> {
    match cli.command {
        Some(Commands::Serve) => crate::server::run(config).await,
        Some(Commands::Play {
            files,
            speed,
            export,
        }) => play(config, &files, speed, export.as_deref()).await,
        Some(Commands::Export {
            conversation_id,
            format,
            out,
        }) => export(config, &conversation_id, format.into(), out.as_deref()).await,
        Some(Commands::Snapshots { delete }) => snapshots(config, delete.as_deref()).await,
        None => {
            let mut cmd = <Cli as clap::CommandFactory>::command();
            cmd.print_help()?;
            println!();
            Ok(())
        }
    }
}

async fn play(
    mut config: AppConfig,
    files: &[PathBuf],
    speed: Option<usize>,
    export_to: Option<&Path>,
) -> Result<()> {
    if let Some(speed) = speed {
        config.canvas.reveal.chars_per_tick = speed;
        config.canvas.validate()?;
    }
    let scheduler = Arc::new(TokioScheduler::current()?);
    let manager = CanvasSessionManager::new(config.canvas, scheduler);
    let mut rx = manager.subscribe();

    let title = files
        .first()
        .and_then(|f| f.file_stem())
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "document".to_string());
    let element = manager.create_element("cli", ElementKind::Document, title);

    let mut stdout = std::io::stdout();
    for file in files {
        let content = std::fs::read_to_string(file)
            .with_context(|| format!("Failed to read {}", file.display()))?;
        let appended = manager.append_content(element, content, file.display().to_string())?;
        if appended.delta.is_fallback() && appended.version > 1 {
            write!(stdout, "\n\n--- {} rewrites the document ---\n\n", file.display())?;
        } else {
            write!(stdout, "{}", appended.delta.separator)?;
        }
        stdout.flush()?;

        let mut printed = 0;
        loop {
            match rx.recv().await {
                Ok(CanvasNotification::RevealProgress {
                    version, revealed, ..
                }) if version == appended.version => {
                    if let Some(new) = revealed.get(printed..) {
                        write!(stdout, "{new}")?;
                        stdout.flush()?;
                    }
                    printed = revealed.len();
                }
                Ok(CanvasNotification::RevealComplete { version, .. })
                    if version == appended.version =>
                {
                    break
                }
                Ok(_) => {}
                Err(RecvError::Lagged(_)) => {
                    if !manager.reveal().is_running(element) {
                        break;
                    }
                }
                Err(RecvError::Closed) => bail!("notification bus closed"),
            }
        }
    }
    writeln!(stdout)?;

    if let Some(path) = export_to {
        let document = manager.export_all(element, ExportFormat::Markdown)?;
        std::fs::write(path, document.body)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        println!("Exported {}", path.display());
    }
    Ok(())
}

async fn export(
    config: AppConfig,
    conversation_id: &str,
    format: ExportFormat,
    out: Option<&Path>,
) -> Result<()> {
    let store = crate::server::open_store(&config).await?;
    let Some(snapshot) = store.load(conversation_id).await? else {
        bail!("No saved conversation '{conversation_id}'");
    };

    let scheduler = Arc::new(TokioScheduler::current()?);
    let manager = CanvasSessionManager::new(config.canvas, scheduler);
    manager.store().load_snapshot(snapshot);

    if let Some(dir) = out {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }
    let element_ids: Vec<Uuid> = manager
        .store()
        .elements_for(conversation_id, false)
        .iter()
        .map(|e| e.id)
        .collect();
    for element_id in element_ids {
        let document = match manager.export_all(element_id, format) {
            Ok(document) => document,
            Err(quill_canvas::Error::EmptyElement(_)) => continue,
            Err(e) => return Err(e.into()),
        };
        match out {
            Some(dir) => {
                let path = dir.join(&document.file_name);
                std::fs::write(&path, &document.body)
                    .with_context(|| format!("Failed to write {}", path.display()))?;
                println!("{}", path.display());
            }
            None => println!("{}", document.body),
        }
    }
    Ok(())
}

async fn snapshots(config: AppConfig, delete: Option<&str>) -> Result<()> {
    let store = crate::server::open_store(&config).await?;
    if let Some(conversation_id) = delete {
        if store.delete(conversation_id).await? {
            println!("Deleted {conversation_id}");
        } else {
            println!("No saved conversation '{conversation_id}'");
        }
        return Ok(());
    }

    let summaries = store.list().await?;
    if summaries.is_empty() {
        println!("No saved conversations");
    }
    for summary in summaries {
        println!(
            "{}\t{} element(s)\t{}",
            summary.conversation_id,
            summary.element_count,
            summary.saved_at.to_rfc3339()
        );
    }
    Ok(())
}
