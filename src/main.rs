use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Map, Value};
use tracing::info;
use uuid::Uuid;

use survey_bridge::commands::{BatchProcessor, SalesforceUpdater};
use survey_bridge::comms::local_api;
use survey_bridge::config::Settings;
use survey_bridge::export::csv::{run_stamp, write_outcomes};
use survey_bridge::export::extract::{extract_ids_from_path, DEFAULT_ID_KEY, DEFAULT_METADATA_COLUMN};
use survey_bridge::security::auth::{AuthFlow, Authenticator};
use survey_bridge::security::token_cache::SessionCache;
use survey_bridge::transport::rest::SalesforceClient;
use survey_bridge::transport::{UpdateOutcome, UpdateRequest};
use survey_bridge::utils;
use survey_bridge::workflow::{run_sync, SyncPlan};

#[derive(Parser)]
#[command(name = "survey-bridge", version, about = "Salesforce record updates and SASSIE survey hand-off")]
struct AppCli {
    /// Authentication flow: jwt, password or web (defaults to SF_AUTH_FLOW, then jwt)
    #[arg(long, global = true)]
    flow: Option<AuthFlow>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Authenticate and print the session's instance
    Login,
    /// PATCH one record by id
    Update {
        #[arg(long)]
        object: String,
        #[arg(long)]
        id: String,
        /// Field assignment, FIELD=VALUE; VALUE is parsed as JSON when it can be
        #[arg(long = "set", value_parser = parse_assignment, required = true)]
        set: Vec<(String, Value)>,
    },
    /// PATCH one record found by a natural key
    UpdateBy {
        #[arg(long)]
        object: String,
        #[arg(long)]
        key_field: String,
        #[arg(long)]
        key_value: String,
        #[arg(long = "set", value_parser = parse_assignment, required = true)]
        set: Vec<(String, Value)>,
    },
    /// Apply a JSON array of updates in rate-limited groups
    Batch {
        #[arg(long)]
        input: PathBuf,
    },
    /// Run a sync plan end to end
    Sync {
        #[arg(long)]
        plan: PathBuf,
    },
    /// Print survey ids found in an exported CSV
    ExtractIds {
        #[arg(long)]
        input: PathBuf,
        #[arg(long, default_value = DEFAULT_METADATA_COLUMN)]
        column: String,
        #[arg(long, default_value = DEFAULT_ID_KEY)]
        key: String,
    },
    /// Start the HTTP trigger server
    Serve {
        #[arg(long, env = "PORT", default_value_t = 8080)]
        port: u16,
    },
}

fn parse_assignment(raw: &str) -> Result<(String, Value), String> {
    let (field, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected FIELD=VALUE, got {raw:?}"))?;
    let field = field.trim();
    if field.is_empty() {
        return Err(format!("empty field name in {raw:?}"));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((field.to_string(), value))
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn connect(settings: &Settings) -> Result<SalesforceClient> {
    let authenticator = Authenticator::new(settings.credentials.clone())?;
    let session = authenticator.obtain_session(settings.flow).await?;
    Ok(SalesforceClient::new(session, &settings.api_version, settings.http_timeout)?)
}

fn finish_single(outcome: UpdateOutcome) -> Result<()> {
    print_json(&outcome)?;
    if !outcome.success {
        anyhow::bail!("update failed");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    utils::logging::init();

    let args = AppCli::parse();

    match args.command {
        Commands::ExtractIds { input, column, key } => {
            let extraction = extract_ids_from_path(&input, &column, &key)?;
            for id in &extraction.ids {
                println!("{id}");
            }
        }
        Commands::Login => {
            let settings = Settings::from_env(args.flow)?;
            let authenticator = Authenticator::new(settings.credentials.clone())?;
            let session = authenticator.obtain_session(settings.flow).await?;
            print_json(&json!({
                "flow": session.flow,
                "instanceUrl": session.instance_url,
                "issuedAt": session.issued_at,
            }))?;
        }
        Commands::Update { object, id, set } => {
            let settings = Settings::from_env(args.flow)?;
            let updater = SalesforceUpdater::new(connect(&settings).await?);
            let fields: Map<String, Value> = set.into_iter().collect();
            finish_single(updater.update_record(&object, &id, fields, Map::new()).await)?;
        }
        Commands::UpdateBy {
            object,
            key_field,
            key_value,
            set,
        } => {
            let settings = Settings::from_env(args.flow)?;
            let updater = SalesforceUpdater::new(connect(&settings).await?);
            let fields: Map<String, Value> = set.into_iter().collect();
            let outcome = updater
                .update_by_natural_key(&object, &key_field, &key_value, fields, Map::new())
                .await;
            finish_single(outcome)?;
        }
        Commands::Batch { input } => {
            let settings = Settings::from_env(args.flow)?;
            let content = std::fs::read_to_string(&input)
                .with_context(|| format!("reading {}", input.display()))?;
            let requests: Vec<UpdateRequest> = serde_json::from_str(&content)
                .with_context(|| format!("parsing updates in {}", input.display()))?;

            let updater = SalesforceUpdater::new(connect(&settings).await?);
            let report = BatchProcessor::new(updater, settings.batch).run(requests).await;
            let files = write_outcomes(&settings.output_dir, &report, &run_stamp(Uuid::new_v4()))?;
            print_json(&json!({"summary": report.summary(), "files": files}))?;
        }
        Commands::Sync { plan } => {
            let settings = Settings::from_env(args.flow)?;
            let plan = SyncPlan::from_file(&plan)?;
            let authenticator = Authenticator::new(settings.credentials.clone())?;
            let sessions = SessionCache::new(authenticator, settings.flow, &settings.api_version);
            let summary = run_sync(&settings, &sessions, &plan).await?;
            print_json(&summary)?;
        }
        Commands::Serve { port } => {
            let settings = Settings::from_env(args.flow)?;
            info!("Starting trigger server on port {port}");
            local_api::serve(settings, port).await?;
        }
    }

    Ok(())
}
