use super::Container;
use crate::util::errors::{Error, Result};
use async_trait::async_trait;
use std::{io::ErrorKind, path::PathBuf};

/// A directory on a filesystem reachable from the operator.
#[derive(Debug, Clone)]
pub struct LocalContainer {
    root: PathBuf,
}

impl LocalContainer {
    pub fn new(path: &str) -> Self {
        Self { root: PathBuf::from(path) }
    }

    async fn walk(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut pending = vec![self.root.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(storage_error(&dir, e)),
            };
            while let Some(entry) = entries.next_entry().await.map_err(|e| storage_error(&dir, e))? {
                let path = entry.path();
                let file_type = entry.file_type().await.map_err(|e| storage_error(&path, e))?;
                if file_type.is_dir() {
                    pending.push(path);
                } else if let Ok(relative) = path.strip_prefix(&self.root) {
                    let key = relative
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy())
                        .collect::<Vec<_>>()
                        .join("/");
                    keys.push(key);
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}

fn storage_error(path: &std::path::Path, e: std::io::Error) -> Error {
    Error::StorageError(format!("{}: {}", path.display(), e))
}

#[async_trait]
impl Container for LocalContainer {
    async fn put(&self, key: &str, data: Vec<u8>) -> Result<()> {
        let path = self.root.join(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| storage_error(parent, e))?;
        }
        tokio::fs::write(&path, data).await.map_err(|e| storage_error(&path, e))
    }

    async fn items(&self, prefix: &str, cursor: Option<String>, limit: usize) -> Result<(Vec<String>, Option<String>)> {
        let mut matching = self
            .walk()
            .await?
            .into_iter()
            .filter(|key| key.starts_with(prefix))
            .filter(|key| cursor.as_ref().map_or(true, |c| key > c));

        let page: Vec<String> = matching.by_ref().take(limit).collect();
        let next = match matching.next() {
            Some(_) => page.last().cloned(),
            None => None,
        };
        Ok((page, next))
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let path = self.root.join(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(storage_error(&path, e)),
        }
    }
}
