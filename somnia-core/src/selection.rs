//! Remembered model selection
//!
//! The chosen inference model survives restarts. The session loads it once
//! at start and saves it whenever the selection changes; nothing else reads
//! or writes the file.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shellexpand::tilde;
use std::path::PathBuf;
use thiserror::Error;

#[async_trait]
pub trait SelectionStore: Send + Sync {
    /// The saved model id, `None` when nothing was saved yet.
    async fn load(&self) -> Result<Option<String>, SelectionError>;

    async fn save(&self, model_id: &str) -> Result<(), SelectionError>;
}

#[derive(Error, Debug)]
pub enum SelectionError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt selection file {path}: {source}")]
    Corrupt {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SelectionFile {
    model_id: String,
    saved_at: chrono::DateTime<chrono::Utc>,
}

/// JSON file store, `~` in the path is expanded.
#[derive(Debug, Clone)]
pub struct FileSelectionStore {
    path: PathBuf,
}

impl FileSelectionStore {
    pub fn new(path: &str) -> Self {
        Self {
            path: PathBuf::from(tilde(path).into_owned()),
        }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    fn display(&self) -> String {
        self.path.display().to_string()
    }
}

#[async_trait]
impl SelectionStore for FileSelectionStore {
    async fn load(&self) -> Result<Option<String>, SelectionError> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(SelectionError::Io {
                    path: self.display(),
                    source,
                })
            }
        };

        let file: SelectionFile =
            serde_json::from_slice(&raw).map_err(|source| SelectionError::Corrupt {
                path: self.display(),
                source,
            })?;
        let model_id = file.model_id.trim().to_string();
        Ok(if model_id.is_empty() { None } else { Some(model_id) })
    }

    async fn save(&self, model_id: &str) -> Result<(), SelectionError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| SelectionError::Io {
                    path: parent.display().to_string(),
                    source,
                })?;
        }

        let file = SelectionFile {
            model_id: model_id.to_string(),
            saved_at: chrono::Utc::now(),
        };
        let bytes = serde_json::to_vec_pretty(&file).map_err(|source| SelectionError::Corrupt {
            path: self.display(),
            source,
        })?;
        tokio::fs::write(&self.path, bytes)
            .await
            .map_err(|source| SelectionError::Io {
                path: self.display(),
                source,
            })?;

        tracing::debug!(path = %self.display(), model = model_id, "Model selection saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn temp_path() -> String {
        std::env::temp_dir()
            .join(format!("somnia-selection-{}", Uuid::new_v4()))
            .join("selection.json")
            .display()
            .to_string()
    }

    #[tokio::test]
    async fn test_missing_file_loads_as_none() {
        let store = FileSelectionStore::new(&temp_path());
        assert_eq!(store.load().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let store = FileSelectionStore::new(&temp_path());
        store.save("dream-model-large").await.unwrap();
        assert_eq!(store.load().await.unwrap().as_deref(), Some("dream-model-large"));

        store.save("dream-model-small").await.unwrap();
        assert_eq!(store.load().await.unwrap().as_deref(), Some("dream-model-small"));

        if let Some(dir) = store.path().parent() {
            let _ = tokio::fs::remove_dir_all(dir).await;
        }
    }

    #[tokio::test]
    async fn test_corrupt_file_is_reported() {
        let path = temp_path();
        let store = FileSelectionStore::new(&path);
        let dir = store.path().parent().unwrap().to_path_buf();
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(store.path(), b"{not json").await.unwrap();

        assert!(matches!(store.load().await, Err(SelectionError::Corrupt { .. })));
        let _ = tokio::fs::remove_dir_all(dir).await;
    }

    #[test]
    fn test_tilde_is_expanded() {
        let store = FileSelectionStore::new("~/somnia/selection.json");
        assert!(!store.path().display().to_string().starts_with('~'));
    }
}
