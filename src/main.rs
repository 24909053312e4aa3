use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use uuid::Uuid;

use autohunt::adapters::{EmailAlertsAdapter, EmailConfig, PlatformAdapter, RemoteOkAdapter, RemotiveAdapter};
use autohunt::ai::{self, AiClient};
use autohunt::applicant::{ApplicantConfig, AutoApplicant};
use autohunt::browser::WebDriverBrowser;
use autohunt::engine::{DiscoveryEngine, JobFilters};
use autohunt::messaging::{MessagingChannel, SendGridChannel, TwilioChannel, TwilioKind};
use autohunt::models::{JobStatus, SearchQuery};
use autohunt::notify::NotificationManager;
use autohunt::scheduler::{RunOutcome, Scheduler};
use autohunt::store::{DocumentStore, SqliteStore};
use autohunt::tasks;

#[derive(Parser)]
#[command(name = "autohunt")]
#[command(about = "Job search automation - discover, score, auto-apply, and get notified")]
struct Cli {
    /// User namespace to operate on
    #[arg(long, global = true, default_value = "default")]
    user: String,

    /// AI model for scoring and form mapping
    #[arg(long, global = true, default_value = "sonnet")]
    model: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Search all configured platforms now
    Search {
        /// Keywords to match against postings
        keywords: Vec<String>,

        /// Only remote positions
        #[arg(long)]
        remote: bool,

        /// Preferred location
        #[arg(short, long)]
        location: Option<String>,

        /// Cap results per platform
        #[arg(long)]
        limit: Option<usize>,
    },

    /// List tracked jobs
    List {
        /// Filter by pipeline status
        #[arg(short, long)]
        status: Option<String>,

        /// Minimum match score (0-100)
        #[arg(long)]
        min_score: Option<u8>,

        /// Filter by platform
        #[arg(short, long)]
        platform: Option<String>,
    },

    /// Show job details
    Show {
        /// Job ID
        job_id: Uuid,
    },

    /// Move a job through the pipeline
    Status {
        /// Job ID
        job_id: Uuid,

        /// New status (discovered, saved, applying, applied, screening,
        /// interview, offer, rejected)
        status: String,
    },

    /// Apply to a job now (bypasses auto-apply rules)
    Apply {
        /// Job ID
        job_id: Uuid,
    },

    /// Run the background scheduler until interrupted
    Run,

    /// Inspect and control scheduled tasks
    Tasks {
        #[command(subcommand)]
        command: TaskCommands,
    },

    /// Notification inbox
    Notifications {
        #[command(subcommand)]
        command: NotificationCommands,
    },
}

#[derive(Subcommand)]
enum TaskCommands {
    /// Show all tasks and their last results
    List,

    /// Execute a task immediately
    Run {
        /// Task name
        name: String,
    },

    /// Let a task's timer fire again
    Enable {
        /// Task name
        name: String,
    },

    /// Stop a task's timer (run-now still works)
    Disable {
        /// Task name
        name: String,
    },
}

#[derive(Subcommand)]
enum NotificationCommands {
    /// List notifications, newest first
    List {
        /// Only unread
        #[arg(long)]
        unread: bool,

        /// Max entries
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Mark notifications as read
    Read {
        /// Notification IDs
        ids: Vec<Uuid>,
    },

    /// Show the unread count
    Unread,
}

struct Services {
    store: Arc<dyn DocumentStore>,
    engine: Arc<DiscoveryEngine>,
    email_engine: Option<Arc<DiscoveryEngine>>,
    applicant: Arc<AutoApplicant>,
    notifier: Arc<NotificationManager>,
}

fn build_channels() -> Vec<Arc<dyn MessagingChannel>> {
    let mut channels: Vec<Arc<dyn MessagingChannel>> = Vec::new();
    match TwilioChannel::from_env(TwilioKind::Sms) {
        Ok(channel) => channels.push(Arc::new(channel)),
        Err(_) => tracing::debug!("twilio not configured, sms channel off"),
    }
    if let (Ok(sid), Ok(token), Ok(from)) = (
        std::env::var("TWILIO_ACCOUNT_SID"),
        std::env::var("TWILIO_AUTH_TOKEN"),
        std::env::var("TWILIO_WHATSAPP_FROM"),
    ) {
        channels.push(Arc::new(TwilioChannel::new(
            sid,
            token,
            from,
            TwilioKind::WhatsApp,
        )));
    }
    match SendGridChannel::from_env() {
        Ok(channel) => channels.push(Arc::new(channel)),
        Err(_) => tracing::debug!("sendgrid not configured, email channel off"),
    }
    channels
}

fn build_services(model: &str) -> Result<Services> {
    let store: Arc<dyn DocumentStore> = Arc::new(SqliteStore::open()?);

    let spec = ai::resolve_model(model)?;
    let ai: Arc<dyn AiClient> = Arc::from(ai::create_client(&spec)?);

    let channels = build_channels();
    let notifier = Arc::new(NotificationManager::new(store.clone(), channels.clone()));

    let adapters: Vec<Arc<dyn PlatformAdapter>> = vec![
        Arc::new(RemoteOkAdapter::new()),
        Arc::new(RemotiveAdapter::new()),
    ];
    let engine = Arc::new(DiscoveryEngine::new(
        store.clone(),
        ai.clone(),
        adapters,
        notifier.clone(),
    ));

    // Email ingestion only activates when an inbox is configured.
    let email_engine = match (
        std::env::var("EMAIL_USERNAME"),
        std::env::var("EMAIL_PASSWORD_FILE"),
    ) {
        (Ok(username), Ok(password_file)) => {
            let config = EmailConfig::from_gmail_password_file(
                &username,
                std::path::Path::new(&password_file),
            )?;
            let adapter: Arc<dyn PlatformAdapter> = Arc::new(EmailAlertsAdapter::new(config, 7));
            Some(Arc::new(DiscoveryEngine::new(
                store.clone(),
                ai.clone(),
                vec![adapter],
                notifier.clone(),
            )))
        }
        _ => None,
    };

    let applicant = Arc::new(AutoApplicant::new(
        store.clone(),
        ai,
        Arc::new(WebDriverBrowser::from_env()),
        channels,
        notifier.clone(),
        ApplicantConfig::default(),
    ));

    Ok(Services {
        store,
        engine,
        email_engine,
        applicant,
        notifier,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "autohunt=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let services = build_services(&cli.model)?;
    let user = cli.user.as_str();

    match cli.command {
        Commands::Search {
            keywords,
            remote,
            location,
            limit,
        } => {
            let query = SearchQuery {
                keywords,
                location,
                remote: remote.then_some(true),
                limit,
            };
            let outcome = services
                .engine
                .search_jobs(user, &query)
                .await
                .context("search failed")?;

            println!(
                "{} result(s), {} new, across {} platform(s):",
                outcome.total_results,
                outcome.new_jobs,
                outcome.platform_results.len()
            );
            for result in &outcome.platform_results {
                match &result.error {
                    Some(error) => println!("  {:<12} failed: {}", result.platform, error),
                    None => println!("  {:<12} {} result(s)", result.platform, result.count),
                }
            }
            if !outcome.jobs.is_empty() {
                println!();
                print_job_table(&outcome.jobs);
            }
        }

        Commands::List {
            status,
            min_score,
            platform,
        } => {
            let status = status
                .as_deref()
                .map(str::parse::<JobStatus>)
                .transpose()?;
            let jobs = services
                .engine
                .list_jobs(
                    user,
                    &JobFilters {
                        status,
                        min_score,
                        platform,
                    },
                )
                .await?;
            if jobs.is_empty() {
                println!("No jobs found.");
            } else {
                print_job_table(&jobs);
            }
        }

        Commands::Show { job_id } => {
            let job = services.engine.get_job(user, job_id).await?;
            println!("{} at {}", job.title, job.company);
            println!("Status: {}    Score: {}%", job.status, job.match_score);
            println!("Platform: {} ({})", job.platform, job.external_id);
            if let Some(location) = &job.location {
                println!("Location: {}{}", location, if job.remote { " (remote)" } else { "" });
            }
            if let (Some(min), Some(max)) = (job.pay_min, job.pay_max) {
                println!("Pay: ${min} - ${max}");
            }
            if let Some(url) = &job.url {
                println!("URL: {url}");
            }
            if let Some(analysis) = &job.analysis {
                if !analysis.strengths.is_empty() {
                    println!("Strengths: {}", analysis.strengths.join(", "));
                }
                if !analysis.concerns.is_empty() {
                    println!("Concerns: {}", analysis.concerns.join(", "));
                }
            }
            if !job.description.is_empty() {
                println!("\n{}", textwrap::fill(&job.description, 78));
            }
        }

        Commands::Status { job_id, status } => {
            let status: JobStatus = status.parse()?;
            let job = services.engine.update_job_status(user, job_id, status).await?;
            println!("{} -> {}", job.title, job.status);
        }

        Commands::Apply { job_id } => {
            let application = services.applicant.apply_to_job(user, job_id).await?;
            println!(
                "Application {} via {:?}: {:?}",
                application.id, application.method, application.status
            );
            if let Some(confirmation) = &application.confirmation {
                println!("  {confirmation}");
            }
            if let Some(error) = &application.error {
                println!("  error: {error}");
            }
            if let Some(key) = &application.screenshot_key {
                let url = services.store.presigned_url(key, 3600).await?;
                println!("  screenshot: {url}");
            }
        }

        Commands::Run => {
            let registry = tasks::standard_registry(
                user,
                services.engine.clone(),
                services.email_engine.clone(),
                services.applicant.clone(),
                services.notifier.clone(),
                services.store.clone(),
            );
            let scheduler = Scheduler::new(services.store.clone(), registry).await?;
            scheduler.start();
            println!("Scheduler running; press Ctrl-C to stop.");
            tokio::signal::ctrl_c().await.context("signal handler")?;
            scheduler.shutdown();
            println!("Stopped.");
        }

        Commands::Tasks { command } => {
            let registry = tasks::standard_registry(
                user,
                services.engine.clone(),
                services.email_engine.clone(),
                services.applicant.clone(),
                services.notifier.clone(),
                services.store.clone(),
            );
            let scheduler = Scheduler::new(services.store.clone(), registry).await?;

            match command {
                TaskCommands::List => {
                    println!("{:<22} {:<9} {:<21} RESULT", "TASK", "ENABLED", "LAST RUN");
                    for status in scheduler.status() {
                        let last_run = status
                            .last_run_at
                            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                            .unwrap_or_else(|| "-".to_string());
                        let result = match &status.last_result {
                            Some(run) if run.success => format!("ok: {}", run.detail),
                            Some(run) => format!("error: {}", run.detail),
                            None => "-".to_string(),
                        };
                        println!(
                            "{:<22} {:<9} {:<21} {}",
                            status.name, status.enabled, last_run, result
                        );
                    }
                }
                TaskCommands::Run { name } => match scheduler.run_now(&name).await? {
                    RunOutcome::Completed(run) if run.success => {
                        println!("{name}: {}", run.detail)
                    }
                    RunOutcome::Completed(run) => println!("{name} failed: {}", run.detail),
                    RunOutcome::AlreadyRunning => println!("{name} is already running"),
                },
                TaskCommands::Enable { name } => {
                    scheduler.enable(&name).await?;
                    println!("Enabled {name}.");
                }
                TaskCommands::Disable { name } => {
                    scheduler.disable(&name).await?;
                    println!("Disabled {name}.");
                }
            }
        }

        Commands::Notifications { command } => match command {
            NotificationCommands::List { unread, limit } => {
                let notifications = services
                    .notifier
                    .list(user, unread, Some(limit))
                    .await?;
                if notifications.is_empty() {
                    println!("No notifications.");
                }
                for notification in notifications {
                    println!(
                        "{} [{}] {}  {}\n    {}",
                        if notification.read { " " } else { "*" },
                        notification.created_at.format("%Y-%m-%d %H:%M"),
                        notification.id,
                        notification.title,
                        textwrap::fill(&notification.message, 74).replace('\n', "\n    "),
                    );
                }
            }
            NotificationCommands::Read { ids } => {
                let marked = services.notifier.mark_as_read(user, &ids).await?;
                println!("Marked {marked} notification(s) as read.");
            }
            NotificationCommands::Unread => {
                println!("{}", services.notifier.unread_count(user).await?);
            }
        },
    }

    Ok(())
}

fn print_job_table(jobs: &[autohunt::models::Job]) {
    println!(
        "{:<36} {:<11} {:>5} {:<28} {:<18} {:<10}",
        "ID", "STATUS", "SCORE", "TITLE", "COMPANY", "PLATFORM"
    );
    println!("{}", "-".repeat(112));
    for job in jobs {
        println!(
            "{:<36} {:<11} {:>4}% {:<28} {:<18} {:<10}",
            job.id,
            job.status.to_string(),
            job.match_score,
            truncate(&job.title, 26),
            truncate(&job.company, 16),
            job.platform
        );
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{cut}...")
    }
}
