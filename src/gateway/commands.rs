// Command handlers for the gateway CLI

use crate::gateway::cli::GatewayCommand;
use crate::gateway::config::GatewayConfig;
use crate::gateway::credentials::SignedTokenValidator;
use crate::gateway::model::{GroupId, Recipient, StoredMessage, TimeRange, UserId, FILE_MARKER};
use crate::gateway::server::{self, Gateway};
use crate::gateway::storage::{Directory, Repository, SqliteStore};
use anyhow::{Context, Result};
use std::path::Path;

/// Execute a gateway command
pub async fn execute_command(config_path: Option<&Path>, command: GatewayCommand) -> Result<()> {
    let mut config = GatewayConfig::load(config_path)?;

    match command {
        GatewayCommand::Serve { listen, data_dir } => {
            if let Some(listen) = listen {
                config.server.listen_addr = listen;
            }
            if let Some(data_dir) = data_dir {
                config.storage.data_dir = data_dir;
            }
            handle_serve(config).await
        }
        GatewayCommand::AddUser { username } => handle_add_user(&config, username),
        GatewayCommand::CreateGroup { name, created_by, member } => {
            handle_create_group(&config, name, created_by, member)
        }
        GatewayCommand::IssueToken { username, ttl_hours } => {
            handle_issue_token(&config, username, ttl_hours)
        }
        GatewayCommand::History { user, peer, group, hours } => {
            handle_history(&config, user, peer, group, hours)
        }
    }
}

fn open_store(config: &GatewayConfig) -> Result<SqliteStore> {
    SqliteStore::new(&config.storage.data_dir).with_context(|| {
        format!(
            "Failed to open store in {}",
            config.storage.data_dir.display()
        )
    })
}

async fn handle_serve(config: GatewayConfig) -> Result<()> {
    let gateway = Gateway::from_config(&config)?;
    let listener = server::bind(&config.server.listen_addr).await?;

    println!("Gateway listening on ws://{}", config.server.listen_addr);
    println!("  Data: {}", config.storage.data_dir.display());
    println!("  Uploads: {}", config.storage.upload_dir().display());
    println!("\nPress Ctrl+C to stop the gateway");

    gateway
        .run(listener, async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    println!("\nGateway stopped");
    Ok(())
}

fn handle_add_user(config: &GatewayConfig, username: String) -> Result<()> {
    let store = open_store(config)?;

    if store.find_user_by_username(&username)?.is_some() {
        anyhow::bail!("User '{}' already exists", username);
    }

    let identity = store.create_user(&username)?;
    println!("✓ User '{}' created with id {}", identity.username, identity.id);
    Ok(())
}

fn handle_create_group(
    config: &GatewayConfig,
    name: String,
    created_by: i64,
    members: Vec<i64>,
) -> Result<()> {
    let store = open_store(config)?;

    let creator = UserId(created_by);
    if store.display_name(creator)?.is_none() {
        anyhow::bail!("User {} not found", created_by);
    }

    let members: Vec<UserId> = members.into_iter().map(UserId).collect();
    let group = store
        .create_group(&name, creator, &members)
        .context("Failed to create group")?;

    println!("✓ Group '{}' created with id {}", group.name, group.id);
    println!("  Members: {:?}", store.group_members(group.id)?.iter().map(|m| m.0).collect::<Vec<_>>());
    Ok(())
}

fn handle_issue_token(config: &GatewayConfig, username: String, ttl_hours: Option<i64>) -> Result<()> {
    let store = open_store(config)?;

    let identity = store
        .find_user_by_username(&username)?
        .with_context(|| format!("User '{}' not found", username))?;

    let hours = ttl_hours.unwrap_or(config.auth.token_ttl_hours);
    let validator =
        SignedTokenValidator::new(&config.auth.token_secret).context("Invalid auth.token_secret")?;

    println!("{}", validator.issue(&identity, hours.saturating_mul(3600)));
    Ok(())
}

fn handle_history(
    config: &GatewayConfig,
    user: i64,
    peer: Option<i64>,
    group: Option<i64>,
    hours: i64,
) -> Result<()> {
    let store = open_store(config)?;
    let range = TimeRange::last_hours(hours);

    let messages = match (peer, group) {
        (Some(peer), _) => store.messages_between(UserId(user), UserId(peer), range)?,
        (None, Some(group)) => {
            store
                .find_group(GroupId(group))?
                .with_context(|| format!("Group {} not found", group))?;
            store.group_messages(GroupId(group), range)?
        }
        (None, None) => anyhow::bail!("Either --peer or --group is required"),
    };

    if messages.is_empty() {
        println!("No messages in the last {} hours", hours);
        return Ok(());
    }

    for message in &messages {
        println!("{}", render(&store, message)?);
    }

    println!("\n{} message(s)", messages.len());
    Ok(())
}

fn render(store: &SqliteStore, message: &StoredMessage) -> Result<String> {
    let sender = store
        .display_name(message.sender_id)?
        .unwrap_or_else(|| message.sender_id.to_string());

    let target = match message.recipient {
        Recipient::User(id) => store.display_name(id)?.unwrap_or_else(|| id.to_string()),
        Recipient::Group(id) => format!("group {}", id),
    };

    let body = match message.attachment_id {
        Some(id) if message.content == FILE_MARKER => match store.get_attachment(id)? {
            Some(file) => format!("[file {} ({}, {} bytes)]", file.declared_name, file.mime_type, file.byte_size),
            None => format!("[file #{} missing]", id),
        },
        _ => message.content.clone(),
    };

    Ok(format!(
        "[{}] {} -> {}: {}",
        message.timestamp.format("%Y-%m-%d %H:%M:%S"),
        sender,
        target,
        body
    ))
}
