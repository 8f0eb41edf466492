use std::path::PathBuf;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::json;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

use super::{DataFlow, DataFlowContext, FlowOutcome};
use crate::cli::config::StorageSettings;
use crate::error::{Result, SpiderError};

/// Create the storage stage named by `storage_type`
pub fn create_storage(storage_type: &str, settings: &StorageSettings) -> Result<Box<dyn DataFlow>> {
    match storage_type {
        "console" => Ok(Box::new(ConsoleStorage)),
        "json_file" => Ok(Box::new(JsonFileStorage::new(settings.output_dir.clone()))),
        _ => Err(SpiderError::Config(format!("Unsupported storage type: {}", storage_type))),
    }
}

/// Prints extracted records to stdout
pub struct ConsoleStorage;

#[async_trait]
impl DataFlow for ConsoleStorage {
    fn name(&self) -> &str {
        "console_storage"
    }

    async fn handle(&self, context: &mut DataFlowContext) -> anyhow::Result<FlowOutcome> {
        for (name, records) in context.all_data() {
            for record in records {
                println!("{} {}: {}", context.request.url, name, record);
            }
        }
        Ok(FlowOutcome::Continue)
    }
}

/// Appends extracted records as JSON lines to `<output_dir>/<crawl id>.jsonl`
pub struct JsonFileStorage {
    output_dir: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileStorage {
    pub fn new(output_dir: PathBuf) -> Self {
        Self {
            output_dir,
            lock: Mutex::new(()),
        }
    }

    fn file_for(&self, owner: &str) -> PathBuf {
        self.output_dir.join(format!("{}.jsonl", owner))
    }
}

#[async_trait]
impl DataFlow for JsonFileStorage {
    fn name(&self) -> &str {
        "json_file_storage"
    }

    async fn initialize(&mut self) -> anyhow::Result<()> {
        fs::create_dir_all(&self.output_dir)
            .await
            .context(format!("Failed to create output directory: {}", self.output_dir.display()))?;
        Ok(())
    }

    async fn handle(&self, context: &mut DataFlowContext) -> anyhow::Result<FlowOutcome> {
        if !context.has_data() {
            return Ok(FlowOutcome::Continue);
        }

        let mut lines = String::new();
        for (name, records) in context.all_data() {
            for record in records {
                let line = json!({
                    "url": context.request.url.as_str(),
                    "name": name,
                    "record": record,
                });
                lines.push_str(&line.to_string());
                lines.push('\n');
            }
        }

        let path = self.file_for(context.request.owner());
        let _guard = self.lock.lock().await;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .context(format!("Failed to open output file: {}", path.display()))?;
        file.write_all(lines.as_bytes())
            .await
            .context(format!("Failed to write output file: {}", path.display()))?;
        file.flush().await?;

        debug!("Stored records of {} in {}", context.request.url, path.display());
        Ok(FlowOutcome::Continue)
    }
}
