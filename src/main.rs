use booth_cloud::LoginFlow;
use booth_store::LocalStore;
use clap::{Parser, Subcommand};
use photobooth_sync::{
    BackendKind, BoothConfig, MergeStrategy, SignInOutcome, SyncError, SyncEvent,
    SyncOrchestrator,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_CONFIG: &str = "photobooth.toml";

#[derive(Parser)]
#[command(version, about = "Photobooth sync - local-first storage with cloud push/pull", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to the configuration file (defaults to ./photobooth.toml if present)
    #[arg(long, short, env = "PHOTOBOOTH_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show identity, sync status and local counts
    Status,
    /// Sign in with email and password
    Login {
        #[arg(long)]
        email: String,
        #[arg(long, env = "PHOTOBOOTH_PASSWORD")]
        password: String,
    },
    /// Create an account and push local sessions to it
    Signup {
        #[arg(long)]
        email: String,
        #[arg(long, env = "PHOTOBOOTH_PASSWORD")]
        password: String,
        #[arg(long)]
        name: Option<String>,
    },
    /// Sign in to Nextcloud by approving the booth in a browser
    NextcloudLogin {
        /// Nextcloud server URL (defaults to backend.base_url)
        #[arg(long)]
        server: Option<String>,
    },
    /// Sign out; local photos and sessions are kept
    Logout,
    /// Retry everything in the offline queue once
    Drain,
    /// Reconcile local and cloud data after signing in
    Merge {
        /// merge, replace-with-cloud or keep-local
        #[arg(long, default_value = "merge")]
        strategy: MergeStrategy,
    },
    /// List what the cloud holds, without changing local data
    Pull,
    /// Print remote session changes as they happen
    Watch {
        /// Stop after this many seconds
        #[arg(long, default_value_t = 300)]
        seconds: u64,
    },
}

fn load_config(path: Option<PathBuf>) -> Result<BoothConfig, SyncError> {
    match path {
        Some(path) => BoothConfig::load(path),
        None if std::path::Path::new(DEFAULT_CONFIG).exists() => BoothConfig::load(DEFAULT_CONFIG),
        None => {
            log::info!("No configuration file, using defaults");
            Ok(BoothConfig::default())
        }
    }
}

fn open_orchestrator(config: &BoothConfig) -> Result<Arc<SyncOrchestrator>, SyncError> {
    if let Some(parent) = config.storage.path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let store = Arc::new(LocalStore::open(&config.storage.path, config.store_config())?);
    let remote = config.build_backend()?;
    Ok(Arc::new(SyncOrchestrator::new(
        store,
        remote,
        config.sync.clone(),
    )?))
}

fn report_sign_in(outcome: SignInOutcome) {
    match outcome {
        SignInOutcome::Ready { sessions } => println!("Signed in, {} sessions on this booth", sessions),
        SignInOutcome::MergeRequired => println!(
            "Signed in. This booth already has data; run `merge --strategy <merge|replace-with-cloud|keep-local>`"
        ),
    }
}

async fn run(cli: Cli) -> Result<(), SyncError> {
    let config = load_config(cli.config)?;
    let sync = open_orchestrator(&config)?;
    if config.backend.kind.keeps_accounts() {
        sync.restore().await?;
    } else {
        log::warn!("The memory backend starts empty on every run; cached sign-in is not verified");
    }

    match cli.command {
        Commands::Status => {
            match sync.current_user() {
                Some(user) => println!("Signed in as {}", user.email),
                None => println!("Not signed in"),
            }
            println!("Status:    {}", sync.status());
            println!("Queued:    {}", sync.queue_len()?);
            println!("Sessions:  {}", sync.store().sessions()?.len());
            println!("Photos:    {}", sync.store().photos()?.len());
            println!(
                "Last sync: {}",
                sync.last_sync()?.unwrap_or_else(|| "never".to_string())
            );
        }
        Commands::Login { email, password } => {
            report_sign_in(sync.sign_in(&email, &password).await?);
        }
        Commands::Signup {
            email,
            password,
            name,
        } => {
            report_sign_in(sync.sign_up(&email, &password, name.as_deref()).await?);
        }
        Commands::NextcloudLogin { server } => {
            if config.backend.kind != BackendKind::Nextcloud {
                return Err(SyncError::Config(
                    "nextcloud-login needs backend.kind = \"nextcloud\"".to_string(),
                ));
            }
            let server = server.unwrap_or_else(|| config.backend.base_url.clone());
            let flow = LoginFlow::new(server);
            let init = flow.initiate().await?;
            println!("Open this URL to approve the booth:\n  {}", init.login);

            let result = flow.wait_for_approval(&init, 150, 2).await?;
            report_sign_in(sync.adopt_credential(result.into_credential()).await?);
        }
        Commands::Logout => {
            sync.sign_out().await?;
            println!("Signed out");
        }
        Commands::Drain => match sync.drain_queue().await {
            Some(report) => println!(
                "{} synced, {} dropped, {} still queued",
                report.succeeded, report.dropped, report.remaining
            ),
            None => println!("Nothing drained (not signed in or already draining)"),
        },
        Commands::Merge { strategy } => {
            let report = sync.merge_local_and_cloud_data(strategy).await?;
            println!(
                "Merged ({}): {} sessions, {} pushed, {} photos queued",
                report.strategy, report.sessions, report.sessions_pushed, report.photos_queued
            );
        }
        Commands::Pull => {
            for session in sync.pull_sessions().await? {
                println!(
                    "session {}  {}  updated {}",
                    session.id,
                    session.name,
                    session.updated_at.as_deref().unwrap_or("-")
                );
            }
            for photo in sync.pull_photos(None).await? {
                println!(
                    "photo   {}  {}  {}",
                    photo.id,
                    photo.created_at,
                    photo.cloud_url.as_deref().unwrap_or("-")
                );
            }
        }
        Commands::Watch { seconds } => {
            let mut events = sync.subscribe();
            if !sync.setup_realtime_sync() {
                return Err(SyncError::Other(
                    "Realtime sync is not available (sign in, and use a backend with a change feed)"
                        .to_string(),
                ));
            }

            let watch = async {
                while let Ok(event) = events.recv().await {
                    match event {
                        SyncEvent::CloudSessionChanged { session_id, kind } => {
                            println!("{:?}: {}", kind, session_id)
                        }
                        SyncEvent::CloudSessionDeleted { session_id } => {
                            println!("Deleted: {}", session_id)
                        }
                        SyncEvent::ReauthRequired => {
                            println!("Sign-in expired");
                            break;
                        }
                        _ => {}
                    }
                }
            };
            let _ = tokio::time::timeout(Duration::from_secs(seconds), watch).await;
            sync.stop_realtime_sync();
        }
    }

    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        log::error!("{}", e);
        eprintln!("{}", e.user_message());
        std::process::exit(1);
    }
}
