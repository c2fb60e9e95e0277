//! `user-patch` command line entry point.
//!
//! Runs user lookups, creation, patching, history and revert against the
//! SQLite store named in the config (or `--db`). Every command prints the
//! JSON response body on stdout and exits non-zero on failure.
//!
//! ## Commands
//!
//! - `user-patch get <ID>`
//! - `user-patch find <EMAIL>`
//! - `user-patch create '<FIELDS JSON>'` (or `@file.json`)
//! - `user-patch patch <ID> '<PATCH JSON>'` (or `@patch.json`)
//! - `user-patch history <ID>`
//! - `user-patch revert <AUDIT_ID>`

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use user_patch::service::{outcome_body, respond};
use user_patch::{CorrelationId, PatchEngineConfig, SqliteStore, SystemClock, UserService};
use uuid::Uuid;

/// Patch user records and inspect their audit trail
#[derive(Debug, Parser)]
#[command(name = "user-patch", version)]
struct Cli {
    /// Database file (overrides `db_path` from the config)
    #[arg(long, global = true, value_name = "PATH")]
    db: Option<PathBuf>,

    /// Config file (overrides USER_PATCH_CONFIG)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Correlation id for this request (generated when omitted)
    #[arg(long, global = true, value_name = "ID")]
    correlation_id: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Show a user by id
    Get { id: String },

    /// Show a user by email
    Find { email: String },

    /// Create a user from a JSON object of fields
    Create {
        /// JSON object, or `@path` to read it from a file
        fields: String,
    },

    /// Apply a JSON Patch document to a user
    Patch {
        id: String,

        /// JSON Patch array, or `@path` to read it from a file
        patch: String,
    },

    /// List the audit trail of a user, oldest first
    History { id: String },

    /// Undo a recorded change by applying its inverse patch
    Revert { audit_id: Uuid },
}

/// Inline argument, or file contents when prefixed with `@`
fn read_arg(arg: &str) -> anyhow::Result<String> {
    match arg.strip_prefix('@') {
        Some(path) => {
            std::fs::read_to_string(path).with_context(|| format!("failed to read {path}"))
        }
        None => Ok(arg.to_string()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => PatchEngineConfig::load_from_path(path),
        None => PatchEngineConfig::load(),
    }
    .context("failed to load config")?;

    let db_path = cli.db.clone().unwrap_or_else(|| config.resolved_db_path());
    let store = SqliteStore::open(&db_path)
        .with_context(|| format!("failed to open user store at {}", db_path.display()))?;
    let service = UserService::new(Arc::new(store), Arc::new(SystemClock), &config);

    let correlation_id = cli
        .correlation_id
        .clone()
        .map(CorrelationId::from)
        .unwrap_or_else(CorrelationId::generate);
    let started = Instant::now();

    let response = match cli.command {
        Command::Get { id } => {
            tracing::info!(operation = "get", entity_id = %id, correlation_id = %correlation_id, "API call");
            respond(
                "get",
                &correlation_id,
                started,
                service
                    .get_user_by_id(&id)
                    .await
                    .map_err(|e| e.with_correlation(correlation_id.as_str())),
                200,
            )
        }
        Command::Find { email } => {
            tracing::info!(operation = "find", correlation_id = %correlation_id, "API call");
            respond(
                "find",
                &correlation_id,
                started,
                service
                    .get_user_by_email(&email)
                    .await
                    .map_err(|e| e.with_correlation(correlation_id.as_str())),
                200,
            )
        }
        Command::Create { fields } => {
            tracing::info!(operation = "create", correlation_id = %correlation_id, "API call");
            let fields: Map<String, Value> = serde_json::from_str(&read_arg(&fields)?)
                .context("user fields must be a JSON object")?;
            respond(
                "create",
                &correlation_id,
                started,
                service.create_user(fields, &correlation_id).await,
                201,
            )
        }
        Command::Patch { id, patch } => {
            tracing::info!(operation = "patch", entity_id = %id, correlation_id = %correlation_id, "API call");
            let patch = read_arg(&patch)?;
            respond(
                "patch",
                &correlation_id,
                started,
                service
                    .patch_user(&id, patch.as_bytes(), &correlation_id)
                    .await
                    .map(|outcome| outcome_body(&outcome)),
                200,
            )
        }
        Command::History { id } => {
            tracing::info!(operation = "history", entity_id = %id, correlation_id = %correlation_id, "API call");
            respond(
                "history",
                &correlation_id,
                started,
                service
                    .history(&id)
                    .await
                    .map_err(|e| e.with_correlation(correlation_id.as_str())),
                200,
            )
        }
        Command::Revert { audit_id } => {
            tracing::info!(operation = "revert", audit_id = %audit_id, correlation_id = %correlation_id, "API call");
            respond(
                "revert",
                &correlation_id,
                started,
                service
                    .revert(&audit_id, &correlation_id)
                    .await
                    .map(|outcome| outcome_body(&outcome)),
                200,
            )
        }
    };

    println!("{}", serde_json::to_string_pretty(&response.body)?);
    if !response.is_success() {
        std::process::exit(1);
    }
    Ok(())
}
