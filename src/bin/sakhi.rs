//! sakhi CLI: run the answer pipeline and inspect jobs.

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use sakhi_rs::config::Config;
use sakhi_rs::db::PgJobStore;
use sakhi_rs::dispatcher::Dispatcher;
use sakhi_rs::llm::{LlmWorker, anthropic_client};
use sakhi_rs::machine::JobMachine;
use sakhi_rs::model::{Job, JobFilter, JobId, JobState, SessionId};
use sakhi_rs::reconciler::Session;
use sakhi_rs::store::JobStore;
use sakhi_rs::telemetry::init_telemetry;
use sakhi_rs::worker::Runner;
use secrecy::ExposeSecret;

#[derive(Parser)]
#[command(name = "sakhi", about = "Legal-assistance query pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the dispatcher and LLM worker daemon
    Serve {
        /// Maximum jobs answered at once (overrides SAKHI_MAX_CONCURRENT)
        #[arg(long)]
        max_concurrent: Option<usize>,
    },
    /// Ask a question and wait for the answer
    Ask {
        question: String,
        /// Chat session to file the question under (defaults to a new one)
        #[arg(long)]
        session: Option<String>,
        /// Seconds to wait for the answer
        #[arg(long, default_value_t = 120)]
        timeout: u64,
    },
    /// Job operations
    Jobs {
        #[command(subcommand)]
        action: JobsAction,
    },
}

#[derive(Subcommand)]
enum JobsAction {
    /// List jobs
    List {
        /// Filter by state
        #[arg(long)]
        state: Option<String>,
        /// Filter by session
        #[arg(long)]
        session: Option<String>,
        /// Maximum jobs to show
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Show a job
    Show {
        /// Job ID (full UUID or prefix)
        id: String,
    },
    /// Return a timed-out claim to pending
    Reclaim {
        /// Job ID (full UUID or prefix); omit with --expired
        id: Option<String>,
        /// Reclaim every expired claim
        #[arg(long)]
        expired: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    let store = PgJobStore::connect(config.database_url.expose_secret()).await?;
    store.migrate().await?;
    let store: Arc<dyn JobStore> = Arc::new(store);
    let machine = JobMachine::new(Arc::clone(&store), config.machine_config());

    match cli.command {
        Command::Serve { max_concurrent } => {
            cmd_serve(&config, store, machine, max_concurrent).await
        }
        Command::Ask {
            question,
            session,
            timeout,
        } => cmd_ask(&config, store, machine, question, session, timeout).await,
        Command::Jobs { action } => match action {
            JobsAction::List {
                state,
                session,
                limit,
            } => cmd_jobs_list(&machine, state, session, limit).await,
            JobsAction::Show { id } => cmd_jobs_show(&machine, id).await,
            JobsAction::Reclaim { id, expired } => cmd_jobs_reclaim(&machine, id, expired).await,
        },
    }
}

async fn cmd_serve(
    config: &Config,
    store: Arc<dyn JobStore>,
    machine: JobMachine,
    max_concurrent: Option<usize>,
) -> anyhow::Result<()> {
    let _guard = init_telemetry(config.telemetry_config("sakhi"))?;

    let client = anthropic_client(config.require_anthropic_api_key()?)?;
    let worker = LlmWorker::new(client, config.model.clone());

    let dispatcher = Dispatcher::start(store, config.dispatcher_config()).await?;

    let mut runner_config = config.runner_config();
    if let Some(n) = max_concurrent {
        runner_config.max_concurrent = n.max(1);
    }
    let runner =
        Runner::new(machine, Arc::new(worker), runner_config).with_dispatcher(dispatcher.clone());

    let r = runner.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        r.shutdown();
    });

    runner.run().await?;
    dispatcher.shutdown().await;
    Ok(())
}

async fn cmd_ask(
    config: &Config,
    store: Arc<dyn JobStore>,
    machine: JobMachine,
    question: String,
    session: Option<String>,
    timeout: u64,
) -> anyhow::Result<()> {
    let session_id = match session {
        Some(s) => s.parse::<SessionId>()?,
        None => SessionId::new(),
    };

    let dispatcher = Dispatcher::start(store, config.dispatcher_config()).await?;
    let session = Session::open(session_id, machine, dispatcher.clone(), config.session_config())
        .await?;

    let id = session.submit_local(question)?;
    println!("Session:  {session_id}");
    println!("Job:      {id}");

    let entry = tokio::time::timeout(Duration::from_secs(timeout), session.wait_for(id)).await;
    session.close();
    dispatcher.shutdown().await;

    let entry = match entry {
        Ok(entry) => entry?,
        Err(_) => anyhow::bail!("no answer within {timeout}s; check with `sakhi jobs show {id}`"),
    };

    println!("Status:   {}", entry.status);
    println!("---");
    if let Some(result) = entry.result {
        println!("{result}");
    }
    if let Some(error) = entry.error {
        println!("Error: {error}");
    }
    Ok(())
}

async fn cmd_jobs_list(
    machine: &JobMachine,
    state: Option<String>,
    session: Option<String>,
    limit: usize,
) -> anyhow::Result<()> {
    let mut filter = JobFilter::default().limit(limit);
    if let Some(s) = state {
        filter = filter.with_state(s.parse::<JobState>()?);
    }
    if let Some(s) = session {
        filter.session_id = Some(s.parse::<SessionId>()?);
    }

    let jobs = machine.list(&filter).await?;
    if jobs.is_empty() {
        println!("No jobs found.");
        return Ok(());
    }

    println!(
        "{:<8}  {:<10}  {:<3}  {:<40}  CREATED",
        "ID", "STATE", "TRY", "QUESTION"
    );
    println!("{}", "-".repeat(90));

    for job in &jobs {
        let short_id = &job.id.to_string()[..8];
        let question: String = job.input.chars().take(40).collect();
        println!(
            "{:<8}  {:<10}  {:<3}  {:<40}  {}",
            short_id,
            job.state,
            job.attempts,
            question,
            job.created_at.format("%Y-%m-%d %H:%M")
        );
    }

    println!("\n{} job(s)", jobs.len());
    Ok(())
}

/// Resolve a full id or a unique prefix.
async fn resolve_id(machine: &JobMachine, id_str: &str) -> anyhow::Result<JobId> {
    if id_str.len() >= 36 {
        return Ok(id_str.parse::<JobId>()?);
    }
    let jobs = machine.list(&JobFilter::default()).await?;
    let matches: Vec<&Job> = jobs
        .iter()
        .filter(|job| job.id.to_string().starts_with(id_str))
        .collect();
    match matches.len() {
        0 => anyhow::bail!("no job matching prefix '{id_str}'"),
        1 => Ok(matches[0].id),
        n => anyhow::bail!("{n} jobs match prefix '{id_str}', be more specific"),
    }
}

async fn cmd_jobs_show(machine: &JobMachine, id_str: String) -> anyhow::Result<()> {
    let id = resolve_id(machine, &id_str).await?;
    let job = machine.get(id).await?;

    println!("ID:         {}", job.id);
    println!("Session:    {}", job.session_id);
    println!("State:      {}", job.state);
    println!("Attempts:   {}", job.attempts);
    println!("Created:    {}", job.created_at);
    println!("Updated:    {}", job.updated_at);
    println!("Question:   {}", job.input);
    if let Some(ref result) = job.result {
        println!("---");
        println!("{result}");
    }
    if let Some(ref error) = job.error {
        println!("Error:      {error}");
    }
    Ok(())
}

async fn cmd_jobs_reclaim(
    machine: &JobMachine,
    id: Option<String>,
    expired: bool,
) -> anyhow::Result<()> {
    match (id, expired) {
        (Some(id_str), false) => {
            let id = resolve_id(machine, &id_str).await?;
            let job = machine.reclaim(id).await?;
            println!("Reclaimed: {} (attempts: {})", job.id, job.attempts);
        }
        (None, true) => {
            let jobs = machine.reclaim_expired().await?;
            for job in &jobs {
                println!("Reclaimed: {} (attempts: {})", job.id, job.attempts);
            }
            println!("{} job(s) reclaimed", jobs.len());
        }
        _ => anyhow::bail!("pass either a job id or --expired"),
    }
    Ok(())
}
