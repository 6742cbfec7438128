// Queue settings loading
//
// Built-in defaults are overlaid by entries from a TOML file: a queue named
// in the file replaces the default of the same name, new names are added.

use anyhow::{Context, Result};
use conveyor_durable::{default_queues, QueueConfig};
use serde::Deserialize;
use std::path::Path;

/// Root config structure
#[derive(Debug, Deserialize)]
pub struct QueuesConfigFile {
    #[serde(default)]
    pub queues: Vec<QueueConfig>,
}

/// Load queue settings, merged over the built-in defaults
pub fn load_queue_configs(path: Option<&Path>) -> Result<Vec<QueueConfig>> {
    let overrides = match path {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read queues config: {}", path.display()))?;
            parse_queues_config(&content)
                .with_context(|| format!("Failed to parse queues config: {}", path.display()))?
        }
        None => vec![],
    };
    Ok(merge_queue_configs(default_queues(), overrides))
}

fn parse_queues_config(content: &str) -> Result<Vec<QueueConfig>> {
    let file: QueuesConfigFile = toml::from_str(content)?;
    for queue in &file.queues {
        anyhow::ensure!(!queue.name.trim().is_empty(), "queue name must not be empty");
        anyhow::ensure!(queue.concurrency > 0, "queue '{}': concurrency must be positive", queue.name);
        anyhow::ensure!(queue.attempts > 0, "queue '{}': attempts must be positive", queue.name);
    }
    Ok(file.queues)
}

fn merge_queue_configs(defaults: Vec<QueueConfig>, overrides: Vec<QueueConfig>) -> Vec<QueueConfig> {
    let mut merged = defaults;
    for queue in overrides {
        match merged.iter_mut().find(|q| q.name == queue.name) {
            Some(existing) => *existing = queue,
            None => merged.push(queue),
        }
    }
    merged
}
