// QueryGIS Desktop - console shell
//
// Line-oriented stand-in for the dock panel: type a request, see the
// transcript grow.

use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use query_gis_core::{ChannelProgress, ChatRole, InMemoryProject, ProgressEvent, TranscriptEntry};
use query_gis_desktop::{
    ConfigService, FirstRunMarker, QueryOrchestrator, QueryStatus, SettingsStore,
};

#[derive(Parser)]
#[command(name = "query-gis")]
#[command(about = "Ask questions about a GIS project in plain language", long_about = None)]
struct Cli {
    /// Project description (JSON snapshot of layers and features)
    #[arg(short, long)]
    project: PathBuf,

    /// Config file (defaults to ~/.query-gis/config.json)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Run a single query and exit
    #[arg(short, long)]
    query: Option<String>,
}

const HELP: &str = "\
Commands:
  /run [n]       run the last (or n-th) code entry of the transcript
  /key <key>     store the backend API key
  /auto on|off   execute returned code automatically
  /quit          leave
Anything else is sent as a query.";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let config_service = match &cli.config {
        Some(path) => ConfigService::open(path)?,
        None => ConfigService::new()?,
    };
    let config = config_service.get_config().clone();

    let project = InMemoryProject::from_json_file(&cli.project)
        .with_context(|| format!("loading project {}", cli.project.display()))?;

    let (progress, mut events) = ChannelProgress::new();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                ProgressEvent::Warning { .. } => eprintln!("  ! {}", event.label()),
                _ => eprintln!("  … {}", event.label()),
            }
        }
    });

    let settings = Arc::new(SettingsStore::new()?);
    let marker = FirstRunMarker::new()?;
    if !marker.is_complete() {
        println!("Welcome to QueryGIS. Store your API key with /key <key>.");
        marker.mark_complete()?;
    }

    let mut orchestrator =
        QueryOrchestrator::from_config(&config, Arc::new(project), Arc::new(progress))?
            .with_settings_store(settings.clone());
    let mut printed = 0;

    if let Some(query) = cli.query {
        let key = settings.get_api_key()?.unwrap_or_default();
        run_query(&mut orchestrator, &query, &key).await;
        print_new_entries(&orchestrator, &mut printed);
        return Ok(());
    }

    println!("{}", HELP);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush()?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match line.split_once(' ').unwrap_or((line, "")) {
            ("/quit", _) => break,
            ("/help", _) => println!("{}", HELP),
            ("/key", key) => match settings.set_api_key(key) {
                Ok(()) => println!("API key stored."),
                Err(e) => println!("{}", e),
            },
            ("/auto", "on") => {
                orchestrator.set_auto_run(true);
                println!("Auto-run on.");
            }
            ("/auto", "off") => {
                orchestrator.set_auto_run(false);
                println!("Auto-run off.");
            }
            ("/auto", _) => println!("Usage: /auto on|off"),
            ("/run", which) => match pick_code(&orchestrator, which.trim()) {
                Some(code) => {
                    if let Err(e) = orchestrator.run_code(&code).await {
                        println!("{}", e);
                    }
                }
                None => println!("No code entry to run."),
            },
            _ => {
                let key = settings.get_api_key()?.unwrap_or_default();
                run_query(&mut orchestrator, line, &key).await;
            }
        }
        print_new_entries(&orchestrator, &mut printed);
    }

    Ok(())
}

async fn run_query(orchestrator: &mut QueryOrchestrator, query: &str, api_key: &str) {
    match orchestrator.submit(query, api_key).await {
        Ok(outcome) => {
            tracing::debug!("run {} ended on attempt {}", outcome.run_id, outcome.attempt);
            if let QueryStatus::CodeReady { .. } = outcome.status {
                println!("(auto-run is off; use /run to execute)");
            }
        }
        Err(e) => println!("{}", e),
    }
}

/// The last code entry, or the n-th one counting from 1.
fn pick_code(orchestrator: &QueryOrchestrator, which: &str) -> Option<String> {
    let code: Vec<&TranscriptEntry> = orchestrator
        .transcript()
        .entries()
        .iter()
        .filter(|e| e.role == ChatRole::Assistant)
        .collect();
    let entry = match which.parse::<usize>() {
        Ok(n) if n >= 1 => code.get(n - 1),
        _ => code.last(),
    };
    entry.map(|e| e.text.clone())
}

fn print_new_entries(orchestrator: &QueryOrchestrator, printed: &mut usize) {
    let entries = orchestrator.transcript().entries();
    for entry in &entries[(*printed).min(entries.len())..] {
        match entry.role {
            ChatRole::User => {}
            ChatRole::Assistant => println!("```python\n{}\n```", entry.text),
            ChatRole::AssistantPrint => println!("{}", entry.text),
        }
    }
    *printed = entries.len();
}
