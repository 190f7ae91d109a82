use async_trait::async_trait;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;

use crate::errors::BurnerError;

#[derive(Debug, Clone, Default)]
pub struct IndexOpts {
    pub metric_name: String,
    pub job_name: Option<String>,
}

/// Bulk document sink. Only the contract matters to the engine; alert
/// records and job summaries go through here.
#[async_trait]
pub trait Indexer: Send + Sync {
    async fn index(&self, docs: &[serde_json::Value], opts: &IndexOpts) -> Result<(), BurnerError>;
}

/// Discards everything; the default when no indexing backend is configured.
pub struct NoopIndexer;

#[async_trait]
impl Indexer for NoopIndexer {
    async fn index(&self, docs: &[serde_json::Value], opts: &IndexOpts) -> Result<(), BurnerError> {
        debug!("discarding {} {} doc(s)", docs.len(), opts.metric_name);
        Ok(())
    }
}

/// Appends documents as ndjson, one file per metric name, under a base
/// directory.
pub struct LocalIndexer {
    directory: PathBuf,
}

impl LocalIndexer {
    pub fn new(directory: PathBuf) -> Self {
        LocalIndexer { directory }
    }
}

#[async_trait]
impl Indexer for LocalIndexer {
    async fn index(&self, docs: &[serde_json::Value], opts: &IndexOpts) -> Result<(), BurnerError> {
        tokio::fs::create_dir_all(&self.directory)
            .await
            .map_err(|e| BurnerError::Config {
                raw_error_message: format!("cannot create index directory: {e}"),
            })?;

        let path = self.directory.join(format!("{}.json", opts.metric_name));
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| BurnerError::Config {
                raw_error_message: format!("cannot open {}: {e}", path.display()),
            })?;

        let mut buffer = Vec::new();
        for doc in docs {
            serde_json::to_writer(&mut buffer, doc).map_err(|e| BurnerError::Config {
                raw_error_message: e.to_string(),
            })?;
            buffer.push(b'\n');
        }
        file.write_all(&buffer).await.map_err(|e| BurnerError::Config {
            raw_error_message: format!("cannot write {}: {e}", path.display()),
        })?;

        info!("indexed {} doc(s) into {}", docs.len(), path.display());
        Ok(())
    }
}
