//! Subcommand execution

use std::{io::Write, path::Path};

use anyhow::{Context, bail};
use serde_json::Value;
use tracing::{info, warn};
use waypoint_client::{RegistryClient, RegistryClientExt, RegistryError, ShutdownSignal, kv};

use crate::cli::Command;

/// Run one subcommand against `client`, writing results to `out`.
///
/// `shutdown` ends a running `watch`.
pub async fn run<W: Write>(
    client: &dyn RegistryClient,
    command: Command,
    shutdown: &ShutdownSignal,
    out: &mut W,
) -> anyhow::Result<()> {
    match command {
        Command::Alive => {
            if !client.is_alive().await {
                bail!(
                    "{} registry at {} is not reachable",
                    client.registry_type(),
                    client.config().registry_url()
                );
            }
            writeln!(out, "alive")?;
        }
        Command::Register => {
            client.register().await?;
            writeln!(out, "registered {}", client.config().service_key)?;
        }
        Command::Unregister => {
            client.unregister().await?;
            writeln!(out, "unregistered {}", client.config().service_key)?;
        }
        Command::Endpoint { service } => {
            let endpoint = client.get_service_endpoint(&service).await?;
            if endpoint.is_empty() {
                bail!("no endpoint registered for {}", service);
            }
            writeln!(out, "{} {}:{}", endpoint.service_id, endpoint.host, endpoint.port)?;
        }
        Command::Endpoints => {
            for endpoint in client.get_all_service_endpoints().await? {
                writeln!(out, "{} {}:{}", endpoint.service_id, endpoint.host, endpoint.port)?;
            }
        }
        Command::Available { service } => {
            client.is_service_available(&service).await?;
            writeln!(out, "{} is available", service)?;
        }
        Command::HasConfig => {
            writeln!(out, "{}", client.has_configuration().await?)?;
        }
        Command::Get { name } => match client.get_configuration_value(&name).await? {
            Some(value) => writeln!(out, "{}", String::from_utf8_lossy(&value))?,
            None => bail!("no value stored for {}", name),
        },
        Command::Put { name, value } => {
            client
                .put_configuration_value(&name, value.as_bytes())
                .await?;
        }
        Command::Push { file, overwrite } => {
            let tree = read_document(&file)?;
            client.put_configuration_tree(&tree, overwrite).await?;
            info!(file = %file.display(), overwrite, "Pushed configuration");
        }
        Command::Dump { json } => {
            let mut pairs = client.get_configuration_pairs().await?;
            if json {
                let tree = kv::unflatten(&pairs)?;
                writeln!(out, "{}", serde_json::to_string_pretty(&tree)?)?;
            } else {
                pairs.sort_by(|a, b| a.key.cmp(&b.key));
                for pair in pairs {
                    writeln!(out, "{} = {}", pair.key, pair.value)?;
                }
            }
        }
        Command::Watch { key } => {
            let watch = match client.watch_until::<Value>(&key, shutdown).await {
                Ok(watch) => watch,
                // Interrupted before the watch started
                Err(RegistryError::Closed) if shutdown.is_shutdown() => return Ok(()),
                Err(e) => return Err(e.into()),
            };
            let (mut updates, mut errors) = watch.into_parts();
            loop {
                tokio::select! {
                    update = updates.recv() => match update {
                        Some(value) => {
                            writeln!(out, "{}", value)?;
                            out.flush()?;
                        }
                        None => break,
                    },
                    Some(err) = errors.recv() => warn!(error = %err, "Watch error"),
                }
            }
        }
    }

    Ok(())
}

/// Parse a configuration document, choosing the format by file extension
pub fn read_document(path: &Path) -> anyhow::Result<Value> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;

    let is_json = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("json"));

    if is_json {
        serde_json::from_str(&content).with_context(|| format!("invalid JSON in {}", path.display()))
    } else {
        let document: toml::Value = toml::from_str(&content)
            .with_context(|| format!("invalid TOML in {}", path.display()))?;
        Ok(kv::toml_to_json(&document))
    }
}
