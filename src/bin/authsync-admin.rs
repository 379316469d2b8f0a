//! Operator tool for the identity provider and the event streams.
//!
//! Usage:
//!   authsync-admin create-user --username NAME --email ADDR [--first-name F] [--last-name L]
//!   authsync-admin list-users
//!   authsync-admin bootstrap-streams [--group NAME]
//!
//! The password for `create-user` is read from AUTHSYNC_NEW_USER_PASSWORD so it
//! never shows up in shell history.

use anyhow::Context;
use clap::{Parser, Subcommand};

use authsync_api::{
    config::KeycloakConfig,
    models::identity::RegisterRequest,
    services::{
        identity::IdentityClient,
        notifier::{bootstrap_streams, StreamBootstrap},
    },
};

#[derive(Parser)]
#[command(name = "authsync-admin", about = "Operator commands for the authsync service")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create an enabled user at the identity provider
    CreateUser {
        #[arg(long)]
        username: String,
        #[arg(long)]
        email: String,
        #[arg(long, default_value = "")]
        first_name: String,
        #[arg(long, default_value = "")]
        last_name: String,
    },
    /// List every user of the service realm
    ListUsers,
    /// Create the event streams and their consumer group
    BootstrapStreams {
        /// Consumer group (defaults to EVENT_CONSUMER_GROUP)
        #[arg(long)]
        group: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args = Args::parse();

    match args.command {
        Command::CreateUser {
            username,
            email,
            first_name,
            last_name,
        } => {
            let password = std::env::var("AUTHSYNC_NEW_USER_PASSWORD")
                .context("AUTHSYNC_NEW_USER_PASSWORD must hold the new user's password")?;
            let request = RegisterRequest {
                user_name: username,
                password,
                email,
                first_name,
                last_name,
            };
            request.validate().map_err(anyhow::Error::msg)?;

            let client = identity_client()?;
            let id = client.create_user(&request).await?;
            tracing::info!(username = %request.user_name, provider_id = %id.0, "user created");
        }
        Command::ListUsers => {
            let client = identity_client()?;
            let users = client.list_users().await?;
            for user in &users {
                println!(
                    "{}\t{}\t{}\t{}",
                    user.id,
                    user.username,
                    user.email.as_deref().unwrap_or("-"),
                    if user.enabled { "enabled" } else { "disabled" }
                );
            }
            tracing::info!("{} user(s)", users.len());
        }
        Command::BootstrapStreams { group } => {
            let redis_url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into());
            let group = group
                .or_else(|| std::env::var("EVENT_CONSUMER_GROUP").ok())
                .unwrap_or_else(|| "user-management-group".into());

            let client = redis::Client::open(redis_url.as_str())?;
            let mut conn = client.get_multiplexed_async_connection().await?;

            let mut failed = 0;
            for (topic, outcome) in bootstrap_streams(&mut conn, &group).await {
                match outcome {
                    StreamBootstrap::Created => println!("{topic}: created"),
                    StreamBootstrap::AlreadyExists => println!("{topic}: already exists"),
                    StreamBootstrap::Failed(reason) => {
                        failed += 1;
                        println!("{topic}: failed ({reason})");
                    }
                }
            }
            if failed > 0 {
                anyhow::bail!("{failed} stream(s) could not be bootstrapped");
            }
        }
    }

    Ok(())
}

/// Only the provider settings are needed here, so DATABASE_URL stays optional.
fn identity_client() -> anyhow::Result<IdentityClient> {
    IdentityClient::new(KeycloakConfig::from_env()?, std::time::Duration::from_secs(10))
}
