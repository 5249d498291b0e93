use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::info;

use calbridge::accounts::LinkRequest;
use calbridge::calendar::{CalendarClient, CalendarService};
use calbridge::config::{load_config, CalbridgeConfig};
use calbridge::credentials::{CredentialStore, Keystore};
use calbridge::tools::server;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber; protocol traffic owns stdout
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "calbridge=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = args.first().map(String::as_str).unwrap_or("serve");

    let config = match flag_value(&args, "--config") {
        Some(path) => load_config(&path)
            .map_err(|e| anyhow::anyhow!("Failed to load config {}: {}", path, e))?,
        None => CalbridgeConfig::default(),
    };

    let store = Arc::new(CredentialStore::new(&config.database.path)?);
    let keystore = Arc::new(Keystore::with_params(store.clone(), config.kdf.params()));

    match command {
        "serve" => {
            let client = CalendarClient::new(
                config.calendar.api_base_url.clone(),
                config.calendar.token_url.clone(),
                config.calendar.resolved_client_id().unwrap_or_default(),
                config.calendar.resolved_client_secret().unwrap_or_default(),
            );
            let service = Arc::new(CalendarService::new(
                store,
                keystore,
                client,
                password_from_env_or_flag(&args),
            ));
            info!("calbridge serving on stdio, db={}", config.database.path);
            server::serve(service).await
        }
        "lock" => {
            let password = require_password(&args)?;
            let hint = flag_value(&args, "--hint");
            keystore.lock(&password, hint.as_deref())?;
            println!("Key store locked.");
            Ok(())
        }
        "rotate" => {
            let old = flag_value(&args, "--old-password")
                .or_else(|| std::env::var("CALBRIDGE_OLD_PASSWORD").ok())
                .context("rotate requires --old-password or CALBRIDGE_OLD_PASSWORD")?;
            let new = flag_value(&args, "--new-password")
                .or_else(|| std::env::var("CALBRIDGE_NEW_PASSWORD").ok())
                .context("rotate requires --new-password or CALBRIDGE_NEW_PASSWORD")?;
            let hint = flag_value(&args, "--hint");
            keystore.rotate(&old, &new, hint.as_deref())?;
            println!("Password rotated.");
            Ok(())
        }
        "status" => {
            let status = keystore.status()?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
        "link-account" => {
            let email = flag_value(&args, "--email").context("link-account requires --email")?;
            let external_user_id = flag_value(&args, "--external-user-id")
                .context("link-account requires --external-user-id")?;
            let refresh_token = flag_value(&args, "--refresh-token")
                .context("link-account requires --refresh-token")?;
            let display_name = flag_value(&args, "--display-name");

            let account = store.link_account(&LinkRequest {
                external_user_id,
                email,
                display_name,
                scopes: flag_value(&args, "--scopes")
                    .map(|s| s.split(',').map(str::to_string).collect())
                    .unwrap_or_default(),
            })?;
            let dek = keystore.current_key(password_from_env_or_flag(&args).as_deref())?;
            store.store_secret(&account.id, &refresh_token, dek.as_ref().map(|d| &d[..]))?;
            println!("Linked account {} ({})", account.email, account.id);
            Ok(())
        }
        "list-accounts" => {
            for account in store.list_accounts()? {
                println!(
                    "{}  {}  {}",
                    account.id,
                    account.email,
                    account.display_name.as_deref().unwrap_or("-")
                );
            }
            Ok(())
        }
        "remove-account" => {
            let id = flag_value(&args, "--id").context("remove-account requires --id")?;
            if store.remove_account(&id)? {
                println!("Removed account {}", id);
            } else {
                println!("No account with id {}", id);
            }
            Ok(())
        }
        other => bail!(
            "Unknown command: {}. Commands: serve, lock, rotate, status, \
             link-account, list-accounts, remove-account",
            other
        ),
    }
}

fn flag_value(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

fn password_from_env_or_flag(args: &[String]) -> Option<String> {
    flag_value(args, "--password").or_else(|| std::env::var("CALBRIDGE_PASSWORD").ok())
}

fn require_password(args: &[String]) -> Result<String> {
    password_from_env_or_flag(args).context("a password is required: --password or CALBRIDGE_PASSWORD")
}
