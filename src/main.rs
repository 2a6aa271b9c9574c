use anyhow::Result;
use clap::{Parser, Subcommand};
use log::{info, warn};
use std::fmt::Display;
use std::path::PathBuf;
use std::sync::Arc;

use galaxy_client::config::{Settings, SettingsStore, SettingsUpdate};
use galaxy_client::error::{RetryAction, UserFacing};
use galaxy_client::installer::InstallState;
use galaxy_client::launcher::{LaunchOption, Runner};
use galaxy_client::ClientContext;

#[derive(Parser)]
#[command(name = "galaxy-client")]
#[command(about = "Library, installation and launch manager for your owned games", long_about = None)]
struct Cli {
    /// Settings file to use instead of the default location
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Log in with username and password
    Login { username: String, password: String },
    /// Log in with an authorization code from the login page
    Oauth { code: String },
    /// Forget the stored session
    Logout,
    /// Show the session state
    Status,
    /// Refresh the library from the service
    Sync,
    /// List the library
    List,
    /// Search the library by name
    Search { query: String },
    /// Install a title and follow its progress (Ctrl-C cancels)
    Install {
        title_id: String,
        /// Directory to install into; defaults to the first install root
        #[arg(long)]
        dir: Option<PathBuf>,
    },
    /// Return a cancelled or failed title to not installed
    Dismiss { title_id: String },
    /// Remove an installed title
    Uninstall { title_id: String },
    /// Report installed files that are missing
    Verify { title_id: String },
    /// Start an installed title
    Launch { title_id: String },
    /// Set launch options of a title (`--key=value`, `-flag` or `ENV=value`)
    Options {
        title_id: String,
        #[arg(allow_hyphen_values = true)]
        options: Vec<String>,
    },
    /// List the Wine, Proton and wrapper installations found
    Runners,
    /// Choose how a title is started: native, wine, proton, wrapper or auto
    Runner {
        title_id: String,
        kind: String,
        /// Program of a wine, proton or wrapper runner
        path: Option<PathBuf>,
    },
    /// Show or change settings
    Settings {
        /// Add an install root directory
        #[arg(long)]
        add_root: Option<PathBuf>,
        /// Number of installs running at the same time
        #[arg(long)]
        max_concurrent: Option<usize>,
        /// Automatic retries after network failures
        #[arg(long)]
        max_retries: Option<u32>,
        /// Keep partial downloads for resuming
        #[arg(long)]
        resume_partial: Option<bool>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    let settings_path = cli.settings.unwrap_or_else(Settings::config_path);
    let settings = match Settings::load_from(&settings_path) {
        Ok(settings) => settings,
        Err(e) => {
            warn!("Error loading settings: {:#}", e);
            Settings::default()
        }
    };
    if !settings_path.exists() {
        settings.save_to(&settings_path)?;
    }

    let store = Arc::new(SettingsStore::new(settings, settings_path));
    let ctx = ClientContext::open(store)?;

    match cli.command {
        Commands::Login { username, password } => {
            let session = ctx.login(&username, &password).await.map_err(user_error)?;
            println!("Logged in as {}", session.user_id.as_deref().unwrap_or(&username));
        }
        Commands::Oauth { code } => {
            ctx.login_with_oauth(&code).await.map_err(user_error)?;
            println!("Logged in");
        }
        Commands::Logout => {
            ctx.logout();
            println!("Logged out");
        }
        Commands::Status => {
            let session = ctx.get_session();
            println!("Session: {:?}", session.state);
            if let Some(user_id) = session.user_id {
                println!("User: {}", user_id);
            }
        }
        Commands::Sync => {
            let diff = ctx.sync_library().await.map_err(user_error)?;
            for record in &diff.added {
                println!("+ {} ({})", record.name, record.id);
            }
            for record in &diff.changed {
                println!("~ {} ({})", record.name, record.id);
            }
            for id in &diff.removed {
                println!("- {}", id);
            }
            println!(
                "{} added, {} changed, {} removed",
                diff.added.len(),
                diff.changed.len(),
                diff.removed.len()
            );
        }
        Commands::List => {
            for record in ctx.get_catalog() {
                println!("{:<16} {:<40} {}", record.id, record.name, record.install_state);
            }
        }
        Commands::Search { query } => {
            for record in &ctx.search_local(&query) {
                println!("{:<16} {}", record.id, record.name);
            }
        }
        Commands::Install { title_id, dir } => {
            let dir = match dir.or_else(|| ctx.default_install_root()) {
                Some(dir) => dir,
                None => anyhow::bail!("No install directory configured"),
            };
            install(&ctx, &title_id, dir).await?;
        }
        Commands::Dismiss { title_id } => {
            ctx.dismiss(&title_id).map_err(user_error)?;
        }
        Commands::Uninstall { title_id } => {
            ctx.uninstall(&title_id).await.map_err(user_error)?;
            println!("Uninstalled {}", title_id);
        }
        Commands::Verify { title_id } => {
            let missing = ctx.check_installation(&title_id).map_err(user_error)?;
            if missing.is_empty() {
                println!("All files present");
            } else {
                for path in &missing {
                    println!("missing: {}", path.display());
                }
                anyhow::bail!("{} files are missing, reinstall the game", missing.len());
            }
        }
        Commands::Launch { title_id } => {
            let handle = ctx.launch(&title_id).map_err(user_error)?;
            match handle.pid {
                Some(pid) => println!("Started {} (pid {})", title_id, pid),
                None => println!("Started {}", title_id),
            }
        }
        Commands::Options { title_id, options } => {
            let options = options.iter().map(|o| parse_option(o)).collect();
            if ctx.set_launch_options(&title_id, options).is_none() {
                anyhow::bail!("{} is not in your library", title_id);
            }
        }
        Commands::Runners => {
            for runner in ctx.available_runners() {
                println!("{}", runner);
            }
        }
        Commands::Runner {
            title_id,
            kind,
            path,
        } => {
            let runner = parse_runner(&kind, path)?;
            if ctx.set_runner(&title_id, runner).is_none() {
                anyhow::bail!("{} is not in your library", title_id);
            }
        }
        Commands::Settings {
            add_root,
            max_concurrent,
            max_retries,
            resume_partial,
        } => {
            let install_root_directories = add_root.map(|root| {
                let mut roots = ctx.get_settings().install_root_directories;
                if !roots.contains(&root) {
                    roots.push(root);
                }
                roots
            });

            let settings = ctx.update_settings(SettingsUpdate {
                install_root_directories,
                max_concurrent_downloads: max_concurrent,
                max_retries,
                resume_partial,
                ..Default::default()
            })?;
            println!("{}", toml::to_string_pretty(&settings)?);
        }
    }

    Ok(())
}

/// Install a title, printing progress until the job ends
async fn install(ctx: &ClientContext, title_id: &str, dir: PathBuf) -> Result<()> {
    let mut progress = ctx.subscribe_progress(title_id);
    let job = ctx.request_install(title_id, &dir).map_err(user_error)?;

    info!("Installing {} into {}", title_id, job.snapshot().install_path.display());

    loop {
        tokio::select! {
            event = progress.recv() => match event {
                Some(event) => {
                    println!(
                        "{:<12} {:>12} / {} bytes",
                        event.state.to_string(),
                        event.bytes_downloaded,
                        event.bytes_total
                    );
                    if event.state.is_terminal() {
                        break;
                    }
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                println!("Cancelling...");
                job.cancel();
            }
        }
    }

    let snapshot = job.wait().await;
    match snapshot.state {
        InstallState::Installed => {
            println!("Installed into {}", snapshot.install_path.display());
            Ok(())
        }
        InstallState::Failed(e) => Err(user_error(e)),
        state => {
            // Cancelled is a neutral outcome
            println!("Install {}", state);
            Ok(())
        }
    }
}

/// `--key=value`, `-flag`, or `NAME=value`
fn parse_option(raw: &str) -> LaunchOption {
    match raw.split_once('=') {
        Some((key, value)) => LaunchOption::new(key, value),
        None => LaunchOption::new(raw, ""),
    }
}

/// Runner from its kind and program path; `auto` clears the choice
fn parse_runner(kind: &str, path: Option<PathBuf>) -> Result<Option<Runner>> {
    let needs_path = |path: Option<PathBuf>| {
        path.ok_or_else(|| anyhow::anyhow!("a {} runner needs the path of its program", kind))
    };

    let runner = match kind {
        "auto" => None,
        "native" => Some(Runner::Native),
        "wine" => Some(Runner::Wine {
            path: needs_path(path)?,
        }),
        "proton" => Some(Runner::Proton {
            path: needs_path(path)?,
        }),
        "wrapper" => Some(Runner::Wrapper {
            path: needs_path(path)?,
        }),
        other => anyhow::bail!("unknown runner kind: {}", other),
    };

    Ok(runner)
}

/// Turn an error into its user-facing message with a hint
fn user_error<E: UserFacing + Display>(e: E) -> anyhow::Error {
    let hint = match e.retry_action() {
        Some(RetryAction::Retry) => " Try again.",
        Some(RetryAction::Reauthenticate) => " Run `galaxy-client login` first.",
        Some(RetryAction::FreeSpaceAndRetry) => " Free some disk space and try again.",
        None => "",
    };
    anyhow::anyhow!("{}{} ({})", e.user_message(), hint, e)
}
