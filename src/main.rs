#![allow(missing_docs)]

//! Hexis control CLI.
//!
//! Subcommands read and write the control plane: workers, status, config,
//! instance lifecycle, consent certificates, and tool administration.
//! Exit codes: 0 success, 1 domain failure, 2 usage error, 130 interrupt.

use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};

use hexis::config::{db_dsn_from_env, PostgresSettings, WorkerMode};
use hexis::consent::ConsentManager;
use hexis::instance::{self, InstanceApiError, InstanceRegistry};
use hexis::store::Store;
use hexis::tools::config::{load_tools_config, save_tools_config};
use hexis::tools::McpServerConfig;

#[derive(Parser)]
#[command(name = "hexis", version, about = "Persistent cognitive agent runtime")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run background workers.
    Worker {
        /// Which loops to run.
        #[arg(long, default_value = "both")]
        mode: String,
    },
    /// Show gate predicates and queue depth.
    Status,
    /// Apply the schema and mark the agent configured.
    Init {
        /// Objectives text stored under agent.objectives.
        #[arg(long)]
        objectives: Option<String>,
    },
    /// Show or validate stored configuration.
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Run a quick end-to-end sanity check against the substrate.
    Demo,
    /// Manage instances.
    Instance {
        #[command(subcommand)]
        command: InstanceCommand,
    },
    /// Manage consent certificates.
    Consents {
        #[command(subcommand)]
        command: ConsentsCommand,
    },
    /// Manage tool configuration.
    Tools {
        #[command(subcommand)]
        command: ToolsCommand,
    },
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Print the config table.
    Show,
    /// Validate required keys and environment references.
    Validate,
}

#[derive(Subcommand)]
enum InstanceCommand {
    /// Create a new instance (substrate + schema + registry entry).
    Create {
        name: String,
        #[arg(long, default_value = "")]
        description: String,
    },
    /// List all instances.
    List,
    /// Switch the current instance.
    Use { name: String },
    /// Show the current instance.
    Current,
    /// Delete an instance (asks the agent for permission first).
    Delete {
        name: String,
        /// Override a refusal.
        #[arg(long)]
        force: bool,
        /// Reason presented to the agent.
        #[arg(long)]
        reason: Option<String>,
    },
    /// Clone an instance.
    Clone {
        source: String,
        target: String,
        #[arg(long, default_value = "")]
        description: String,
    },
    /// Import an existing database as an instance.
    Import {
        name: String,
        #[arg(long)]
        database: Option<String>,
        #[arg(long, default_value = "")]
        description: String,
    },
}

#[derive(Subcommand)]
enum ConsentsCommand {
    /// List all consent certificates (latest per model).
    List,
    /// Show the latest certificate for a model.
    Show { provider: String, model_id: String },
    /// Request consent from a model.
    Request { provider: String, model_id: String },
    /// Revoke consent for a model.
    Revoke {
        provider: String,
        model_id: String,
        #[arg(long, default_value = "operator request")]
        reason: String,
    },
}

#[derive(Subcommand)]
enum ToolsCommand {
    /// List all registered tools.
    List,
    /// Enable a tool.
    Enable { name: String },
    /// Disable a tool.
    Disable { name: String },
    /// Set an API key (value or env:VAR reference).
    SetApiKey { key: String, value: String },
    /// Override a tool's energy cost.
    SetCost { name: String, cost: i32 },
    /// Add an MCP server.
    AddMcp {
        name: String,
        command: String,
        #[arg(trailing_var_arg = true)]
        args: Vec<String>,
    },
    /// Remove an MCP server.
    RemoveMcp { name: String },
    /// Show the tools configuration.
    Status,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Worker { mode } => run_worker(&mode).await,
        Command::Status => run_status().await,
        Command::Init { objectives } => run_init(objectives.as_deref()).await,
        Command::Config { command } => run_config(command).await,
        Command::Demo => run_demo().await,
        Command::Instance { command } => run_instance(command).await,
        Command::Consents { command } => run_consents(command).await,
        Command::Tools { command } => run_tools(command).await,
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(1)
        }
    }
}

async fn connect_store() -> anyhow::Result<Store> {
    let wait = Duration::from_secs(PostgresSettings::from_env().wait_seconds);
    Ok(Store::connect(&db_dsn_from_env(), wait).await?)
}

async fn run_worker(mode: &str) -> anyhow::Result<ExitCode> {
    let mode: WorkerMode = mode.parse()?;
    let logs_dir = instance::hexis_home().join("logs");
    let _guard = hexis::logging::init_worker(&logs_dir)?;

    let store = connect_store().await?;
    hexis::worker::run_workers(store, mode).await?;
    Ok(ExitCode::SUCCESS)
}

async fn run_status() -> anyhow::Result<ExitCode> {
    hexis::logging::init_cli();
    let store = connect_store().await?;

    let configured = store.is_agent_configured().await?;
    let terminated = store.is_agent_terminated().await?;
    let heartbeat_due = store.should_run_heartbeat().await?;
    let maintenance_due = store.should_run_maintenance().await?;
    let state = store.heartbeat_state().await?;
    let pending = hexis::broker::CallBroker::new(store.clone())
        .pending_count()
        .await?;

    println!("configured:        {configured}");
    println!("terminated:        {terminated}");
    println!("heartbeat due:     {heartbeat_due}");
    println!("maintenance due:   {maintenance_due}");
    println!(
        "energy:            {}/{}",
        state.current_energy, state.max_energy
    );
    println!("pending calls:     {pending}");
    if let Some(at) = state.last_heartbeat_at {
        println!("last heartbeat:    {at}");
    }
    Ok(ExitCode::SUCCESS)
}

async fn run_init(objectives: Option<&str>) -> anyhow::Result<ExitCode> {
    hexis::logging::init_cli();
    let store = connect_store().await?;
    store.apply_embedded_schema().await?;

    if let Some(objectives) = objectives {
        store
            .set_config(
                "agent.objectives",
                &serde_json::json!(objectives),
                "Agent objectives",
            )
            .await?;
    }
    store
        .set_config(
            "agent.is_configured",
            &serde_json::json!(true),
            "Initial configuration complete",
        )
        .await?;

    println!("agent configured");
    Ok(ExitCode::SUCCESS)
}

async fn run_config(command: ConfigCommand) -> anyhow::Result<ExitCode> {
    hexis::logging::init_cli();
    let store = connect_store().await?;

    match command {
        ConfigCommand::Show => {
            for (key, value) in store.list_config().await? {
                println!("{key} = {value}");
            }
            Ok(ExitCode::SUCCESS)
        }
        ConfigCommand::Validate => {
            let mut failures = 0u32;
            for key in ["agent.is_configured", "llm.heartbeat"] {
                if store.get_config(key).await?.is_none() {
                    eprintln!("missing config key: {key}");
                    failures = failures.saturating_add(1);
                }
            }
            let config = load_tools_config(&store).await?;
            for (name, value) in &config.api_keys {
                if let Some(env_name) = value.strip_prefix("env:") {
                    if std::env::var(env_name).is_err() {
                        eprintln!("api key '{name}' references unset env var {env_name}");
                        failures = failures.saturating_add(1);
                    }
                }
            }
            if failures > 0 {
                return Ok(ExitCode::from(1));
            }
            println!("configuration valid");
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn run_demo() -> anyhow::Result<ExitCode> {
    hexis::logging::init_cli();
    let store = connect_store().await?;
    store.apply_embedded_schema().await?;

    let context = store.gather_turn_context().await?;
    println!("turn context: {context}");
    let state = store.heartbeat_state().await?;
    println!("energy {}/{}", state.current_energy, state.max_energy);
    println!("demo OK");
    Ok(ExitCode::SUCCESS)
}

async fn run_instance(command: InstanceCommand) -> anyhow::Result<ExitCode> {
    hexis::logging::init_cli();
    instance::auto_import_default().await.ok();

    match command {
        InstanceCommand::Create { name, description } => {
            let config = instance::create_instance(&name, &description, None)
                .await
                .map_err(anyhow::Error::from)?;
            println!("created instance '{}' (database {})", config.name, config.database);
            Ok(ExitCode::SUCCESS)
        }
        InstanceCommand::List => {
            let registry = InstanceRegistry::open_default()?;
            let current = registry.get_current();
            for config in registry.list_all() {
                let marker = if current.as_deref() == Some(config.name.as_str()) {
                    "*"
                } else {
                    " "
                };
                println!(
                    "{marker} {:<20} {}@{}:{}/{}  {}",
                    config.name, config.user, config.host, config.port, config.database,
                    config.description
                );
            }
            Ok(ExitCode::SUCCESS)
        }
        InstanceCommand::Use { name } => {
            let mut registry = InstanceRegistry::open_default()?;
            registry.set_current(&name)?;
            println!("current instance: {name}");
            Ok(ExitCode::SUCCESS)
        }
        InstanceCommand::Current => {
            let registry = InstanceRegistry::open_default()?;
            match registry.get_current() {
                Some(name) => println!("{name}"),
                None => println!("(no current instance)"),
            }
            Ok(ExitCode::SUCCESS)
        }
        InstanceCommand::Delete {
            name,
            force,
            reason,
        } => match instance::delete_instance(&name, force, reason.as_deref(), true).await {
            Ok(outcome) => {
                if let Some(path) = outcome.record_path {
                    println!("termination record: {}", path.display());
                }
                println!("instance '{name}' deleted");
                Ok(ExitCode::SUCCESS)
            }
            Err(InstanceApiError::DeletionRefused { review }) => {
                eprintln!("agent declined deletion.");
                eprintln!("reasoning: {}", review.reasoning);
                for action in &review.alternative_actions {
                    eprintln!("alternative: {}", action.action);
                }
                eprintln!("re-run with --force to override.");
                Ok(ExitCode::from(1))
            }
            Err(e) => Err(e.into()),
        },
        InstanceCommand::Clone {
            source,
            target,
            description,
        } => {
            let config = instance::clone_instance(&source, &target, &description)
                .await
                .map_err(anyhow::Error::from)?;
            println!("cloned '{source}' into '{}'", config.name);
            Ok(ExitCode::SUCCESS)
        }
        InstanceCommand::Import {
            name,
            database,
            description,
        } => {
            let config = instance::import_instance(&name, database.as_deref(), &description)
                .await
                .map_err(anyhow::Error::from)?;
            println!("imported instance '{}' (database {})", config.name, config.database);
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn run_consents(command: ConsentsCommand) -> anyhow::Result<ExitCode> {
    hexis::logging::init_cli();
    let manager = ConsentManager::open_default()?;

    match command {
        ConsentsCommand::List => {
            for certificate in manager.list_consents() {
                println!(
                    "{:<40} {:<8} revoked={} at {}",
                    certificate.model.certificate_prefix(),
                    certificate.decision,
                    certificate.revoked,
                    certificate.timestamp,
                );
            }
            Ok(ExitCode::SUCCESS)
        }
        ConsentsCommand::Show { provider, model_id } => {
            match manager.get_consent(&provider, &model_id) {
                Some(certificate) => {
                    println!("{}", serde_json::to_string_pretty(&certificate)?);
                    Ok(ExitCode::SUCCESS)
                }
                None => {
                    eprintln!("no consent found for {provider}/{model_id}");
                    Ok(ExitCode::from(1))
                }
            }
        }
        ConsentsCommand::Request { provider, model_id } => {
            let binding = hexis::llm::LlmBinding {
                provider: provider.clone(),
                model: model_id.clone(),
                endpoint: std::env::var("OPENAI_BASE_URL").ok(),
                api_key: None,
                api_key_env: None,
            };
            let llm = hexis::llm::resolve_provider(&binding)
                .map_err(|e| anyhow::anyhow!("cannot reach model: {e}"))?;
            let model =
                hexis::consent::ModelInfo::new(provider, model_id.clone(), model_id);
            let certificate = hexis::consent::request_consent(
                &model,
                llm.as_ref(),
                hexis::calls::prompts::CONSENT_TEXT,
            )
            .await;
            let path = manager.save_consent(&certificate)?;
            println!("decision: {}", certificate.decision);
            println!("certificate: {}", path.display());
            Ok(ExitCode::SUCCESS)
        }
        ConsentsCommand::Revoke {
            provider,
            model_id,
            reason,
        } => {
            manager.revoke_consent(&provider, &model_id, &reason)?;
            println!("consent revoked for {provider}/{model_id}");
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn run_tools(command: ToolsCommand) -> anyhow::Result<ExitCode> {
    hexis::logging::init_cli();
    let store = connect_store().await?;

    match command {
        ToolsCommand::List => {
            let registry = hexis::tools::create_default_registry(store);
            for name in registry.list_names() {
                println!("{name}");
            }
            Ok(ExitCode::SUCCESS)
        }
        ToolsCommand::Enable { name } => {
            let mut config = load_tools_config(&store).await?;
            config.disabled.retain(|t| t != &name);
            if let Some(enabled) = &mut config.enabled {
                if !enabled.contains(&name) {
                    enabled.push(name.clone());
                }
            }
            save_tools_config(&store, &config).await?;
            println!("enabled {name}");
            Ok(ExitCode::SUCCESS)
        }
        ToolsCommand::Disable { name } => {
            let mut config = load_tools_config(&store).await?;
            if !config.disabled.contains(&name) {
                config.disabled.push(name.clone());
            }
            if let Some(enabled) = &mut config.enabled {
                enabled.retain(|t| t != &name);
            }
            save_tools_config(&store, &config).await?;
            println!("disabled {name}");
            Ok(ExitCode::SUCCESS)
        }
        ToolsCommand::SetApiKey { key, value } => {
            let mut config = load_tools_config(&store).await?;
            config.api_keys.insert(key.clone(), value);
            save_tools_config(&store, &config).await?;
            println!("set api key '{key}'");
            Ok(ExitCode::SUCCESS)
        }
        ToolsCommand::SetCost { name, cost } => {
            let mut config = load_tools_config(&store).await?;
            config.costs.insert(name.clone(), cost);
            save_tools_config(&store, &config).await?;
            println!("set cost for '{name}' to {cost}");
            Ok(ExitCode::SUCCESS)
        }
        ToolsCommand::AddMcp {
            name,
            command,
            args,
        } => {
            let mut config = load_tools_config(&store).await?;
            config.mcp_servers.push(McpServerConfig {
                name: name.clone(),
                command,
                args,
                env: std::collections::HashMap::new(),
                enabled: true,
            });
            save_tools_config(&store, &config).await?;
            println!("added MCP server '{name}'");
            Ok(ExitCode::SUCCESS)
        }
        ToolsCommand::RemoveMcp { name } => {
            let mut config = load_tools_config(&store).await?;
            config.mcp_servers.retain(|s| s.name != name);
            save_tools_config(&store, &config).await?;
            println!("removed MCP server '{name}'");
            Ok(ExitCode::SUCCESS)
        }
        ToolsCommand::Status => {
            let config = load_tools_config(&store).await?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(ExitCode::SUCCESS)
        }
    }
}
