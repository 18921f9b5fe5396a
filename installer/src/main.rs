//! Command-line front end: detect packages in a source, ask, install.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;

use acinstaller_lib::{
    app_dirs, logger, Confirmation, EntryCandidate, InstallParams, InstallationManager,
    InstallerSettings, JobOutcome, JobState,
};

#[derive(Debug, Parser)]
#[command(name = "acinstaller", version, about = "Install content packages into a game folder")]
struct Cli {
    /// Archive, folder or single file to install
    source: PathBuf,

    /// Game folder; overrides the settings file
    #[arg(long)]
    game_root: Option<PathBuf>,

    /// Settings file (defaults to the application data folder)
    #[arg(long)]
    settings: Option<PathBuf>,

    #[arg(long)]
    password: Option<String>,

    /// Expected MD5 or SHA-256 of the source file
    #[arg(long)]
    checksum: Option<String>,

    /// Track the install as a removable generic mod
    #[arg(long)]
    generic_mod: bool,

    /// Car for skins that come without their car folder
    #[arg(long)]
    car_id: Option<String>,

    /// Install everything with default options without asking
    #[arg(short, long)]
    yes: bool,

    /// List detected packages and stop
    #[arg(long)]
    dry_run: bool,
}

async fn prompt(question: String) -> Result<String> {
    tokio::task::spawn_blocking(move || -> Result<String> {
        print!("{}", question);
        io::stdout().flush()?;
        let mut line = String::new();
        io::stdin().lock().read_line(&mut line)?;
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    })
    .await
    .context("Prompt task failed")?
}

fn print_candidates(candidates: &[EntryCandidate]) {
    for candidate in candidates {
        let entry = &candidate.entry;
        println!("  [{}] {}", candidate.index, candidate.headline);
        if let Some(version) = &entry.version {
            println!("      version {}", version);
        }
        match (&candidate.destination, &candidate.destination_error) {
            (Some(destination), _) => println!(
                "      -> {} ({})",
                destination.display(),
                candidate.default_option.display_name()
            ),
            (None, Some(error)) => println!("      cannot install: {}", error),
            (None, None) => {}
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let settings_path = cli.settings.clone().unwrap_or_else(app_dirs::get_settings_path);
    let mut settings = InstallerSettings::load_or_default(&settings_path)?;
    if let Some(root) = cli.game_root.clone() {
        settings.content_root = root;
    }
    logger::init(&settings.logging);

    let mut params = InstallParams {
        checksum: cli.checksum.clone(),
        password: cli.password.clone(),
        as_generic_mod: cli.generic_mod,
        car_id_hint: cli.car_id.clone(),
        ..InstallParams::default()
    };
    if params.display_name.is_none() {
        params.display_name = cli
            .source
            .file_name()
            .map(|name| name.to_string_lossy().into_owned());
    }

    let manager = InstallationManager::new(settings);
    let job = manager.submit(&cli.source, params);
    let mut updates = job.subscribe();
    let mut answered_confirmation = false;

    loop {
        let snapshot = updates.borrow_and_update().clone();
        match &snapshot.state {
            JobState::PasswordRequired { incorrect } => {
                if *incorrect {
                    println!("Password is incorrect.");
                }
                let password = prompt(format!("Password for {}: ", snapshot.display_name)).await?;
                job.provide_password(password);
            }
            JobState::WaitingForConfirmation if !answered_confirmation => {
                answered_confirmation = true;
                println!("Found in {}:", snapshot.display_name);
                print_candidates(&snapshot.candidates);
                for extra in &snapshot.extra_options {
                    println!("  extra: {} ({})", extra.display_name, extra.description);
                }
                if cli.dry_run {
                    job.cancel();
                } else if cli.yes || prompt("Install? [y/N] ".to_string()).await?.eq_ignore_ascii_case("y") {
                    job.confirm(Confirmation::accept_defaults(&snapshot.candidates));
                } else {
                    job.cancel();
                }
            }
            JobState::Finished(outcome) => {
                return Ok(match outcome {
                    JobOutcome::Succeeded { installed, skipped } => {
                        println!("Installed: {}", installed.join(", "));
                        for message in skipped {
                            println!("Skipped: {}", message);
                        }
                        ExitCode::SUCCESS
                    }
                    JobOutcome::Empty => {
                        println!("Nothing to install in {}", snapshot.display_name);
                        ExitCode::SUCCESS
                    }
                    JobOutcome::Failed { report } => {
                        eprintln!("Installation failed: {}", report);
                        ExitCode::FAILURE
                    }
                    JobOutcome::Cancelled => {
                        println!("Cancelled");
                        ExitCode::from(2)
                    }
                });
            }
            _ => {}
        }
        if updates.changed().await.is_err() {
            return Ok(ExitCode::FAILURE);
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
