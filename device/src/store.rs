use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tokio::{io::AsyncWriteExt, sync::Mutex};
use tracing::{info, warn};

use thermolink_common::{Configuration, TelemetryMessage};

const CONFIG_FILE: &str = "config.json";
const OUTBOX_FILE: &str = "outbox.json";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("i/o error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{} is corrupt: {source}", path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Durable JSON documents under the data directory.
#[derive(Clone)]
pub struct ConfigStore {
    config_path: Arc<PathBuf>,
    outbox_path: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

impl ConfigStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            config_path: Arc::new(data_dir.join(CONFIG_FILE)),
            outbox_path: Arc::new(data_dir.join(OUTBOX_FILE)),
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn config_path(&self) -> &Path {
        self.config_path.as_path()
    }

    /// `Ok(None)` when no document has been written yet.
    pub async fn load(&self) -> Result<Option<Configuration>, StoreError> {
        let _guard = self.lock.lock().await;
        read_json(self.config_path.as_path()).await
    }

    /// Loads the document, writing defaults on first boot. A corrupt document
    /// is only replaced when `regenerate` is set.
    pub async fn load_or_init(&self, regenerate: bool) -> Result<Configuration, StoreError> {
        let existing = if regenerate {
            warn!("regenerating {} with defaults", self.config_path.display());
            None
        } else {
            self.load().await?
        };

        let mut config = match existing {
            Some(config) => config,
            None => {
                let config = Configuration::default();
                self.save(&config).await?;
                info!("wrote default configuration to {}", self.config_path.display());
                config
            }
        };
        config.sanitize();
        Ok(config)
    }

    pub async fn save(&self, config: &Configuration) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        write_json_atomic(self.config_path.as_path(), config).await
    }

    /// Returns undelivered telemetry left by the previous run and removes the
    /// file so it is restored only once.
    pub async fn take_outbox(&self) -> Result<Vec<TelemetryMessage>, StoreError> {
        let _guard = self.lock.lock().await;
        let path = self.outbox_path.as_path();
        let messages = read_json::<Vec<TelemetryMessage>>(path)
            .await?
            .unwrap_or_default();

        match tokio::fs::remove_file(path).await {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(source) => {
                return Err(StoreError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        }
        Ok(messages)
    }

    pub async fn save_outbox(&self, messages: &[TelemetryMessage]) -> Result<(), StoreError> {
        if messages.is_empty() {
            return Ok(());
        }
        let _guard = self.lock.lock().await;
        write_json_atomic(self.outbox_path.as_path(), &messages).await
    }
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    match tokio::fs::read(path).await {
        Ok(raw) => serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|source| StoreError::Corrupt {
                path: path.to_path_buf(),
                source,
            }),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(source) => Err(StoreError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Writes and syncs a sibling temp file, renames it over `path`, then syncs
/// the directory so the rename itself survives a power cut. A crash at any
/// point leaves either the previous document or the new one.
async fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), StoreError> {
    let io_err = |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
    }

    let payload = serde_json::to_vec_pretty(value).map_err(|source| StoreError::Corrupt {
        path: path.to_path_buf(),
        source,
    })?;

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let mut file = tokio::fs::File::create(&tmp).await.map_err(io_err)?;
    file.write_all(&payload).await.map_err(io_err)?;
    file.sync_all().await.map_err(io_err)?;
    drop(file);

    tokio::fs::rename(&tmp, path).await.map_err(io_err)?;
    if let Some(parent) = path.parent() {
        sync_dir(parent).await.map_err(io_err)?;
    }
    Ok(())
}

#[cfg(unix)]
async fn sync_dir(dir: &Path) -> std::io::Result<()> {
    let dir = if dir.as_os_str().is_empty() {
        Path::new(".")
    } else {
        dir
    };
    tokio::fs::File::open(dir).await?.sync_all().await
}

#[cfg(not(unix))]
async fn sync_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}
