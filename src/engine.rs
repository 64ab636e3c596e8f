//! The public engine handle.
//!
//! [`Engine::start`] spawns the serializer task and returns a cheap,
//! cloneable handle. Every method submits one operation and awaits its
//! reply; `upload_item` resolves only once the upload reached a terminal
//! state. Secrets are hashed here, on the caller's task, so the serializer
//! never burns time on argon2.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::io::AsyncRead;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;

use crate::auth;
use crate::download::DownloadStream;
use crate::error::{EngineError, Result};
use crate::state_machine::{Command, StateMachine};
use crate::storage::{clean_name, FileItem, Folder};

/// Ambient time source. Injected so tests can steer expiry and stall
/// decisions without sleeping.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The wall clock; the default for production.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Construction-time knobs of the engine.
#[derive(Clone)]
pub struct EngineConfig {
    /// Snapshot file the registry persists to.
    pub data_file: PathBuf,
    /// Root of the completed-file layout: `{storage_dir}/{folder}/{item}`.
    pub storage_dir: PathBuf,
    /// Where in-flight uploads are staged.
    pub tmp_dir: PathBuf,
    /// Cadence of the sweep-and-persist tick.
    pub update_interval: Duration,
    /// Cadence of the persist-only tick.
    pub autosave_interval: Duration,
    /// Uploads quiet for longer than this are cancelled by the sweeper.
    pub stall_timeout: Duration,
    pub clock: Arc<dyn Clock>,
}

impl EngineConfig {
    pub fn new(
        data_file: impl Into<PathBuf>,
        storage_dir: impl Into<PathBuf>,
        tmp_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            data_file: data_file.into(),
            storage_dir: storage_dir.into(),
            tmp_dir: tmp_dir.into(),
            update_interval: Duration::from_secs(60),
            autosave_interval: Duration::from_secs(120),
            stall_timeout: Duration::from_secs(15 * 60),
            clock: Arc::new(SystemClock),
        }
    }
}

/// Handle to a running engine. Clones share the same serializer.
#[derive(Debug, Clone)]
pub struct Engine {
    commands: mpsc::UnboundedSender<Command>,
    free_slot: Arc<Notify>,
}

impl Engine {
    /// Create the on-disk directories, load the snapshot and spawn the
    /// serializer. The engine stops when [`Engine::shutdown`] is called or
    /// every handle and open download stream is gone.
    pub async fn start(config: EngineConfig) -> io::Result<(Engine, JoinHandle<()>)> {
        tokio::fs::create_dir_all(&config.storage_dir).await?;
        tokio::fs::create_dir_all(&config.tmp_dir).await?;
        if let Some(parent) = config.data_file.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let free_slot = Arc::new(Notify::new());
        let machine = StateMachine::new(config, command_rx, Arc::clone(&free_slot));
        let task = tokio::spawn(machine.run());
        Ok((
            Engine {
                commands: command_tx,
                free_slot,
            },
            task,
        ))
    }

    async fn submit<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(build(reply_tx))
            .map_err(|_| EngineError::Stopped)?;
        reply_rx.await.map_err(|_| EngineError::Stopped)
    }

    /// Folder snapshot copies; private folders only when asked for.
    pub async fn list_folders(&self, include_private: bool) -> Result<Vec<Folder>> {
        self.submit(|reply| Command::ListFolders {
            include_private,
            reply,
        })
        .await
    }

    pub async fn get_folder(&self, name: &str) -> Result<Option<Folder>> {
        let name = name.to_string();
        self.submit(|reply| Command::GetFolder { name, reply }).await
    }

    /// Register a folder. `create_date` is assigned by the engine; a
    /// non-empty password is hashed before it crosses into the serializer.
    pub async fn create_folder(&self, mut folder: Folder) -> Result<()> {
        if clean_name(&folder.name).is_empty() {
            return Err(EngineError::EmptyName);
        }
        folder.password = match folder.password.take().filter(|p| !p.is_empty()) {
            Some(plain) => Some(hash_secret(&plain)?),
            None => None,
        };
        self.submit(|reply| Command::CreateFolder { folder, reply })
            .await?
    }

    /// Replace a folder's policy. The stored `create_date` and (unless
    /// `replace_users`) the users mapping are preserved. A submitted
    /// password is re-hashed only when it differs from the stored hash,
    /// since admin forms echo the stored form back.
    pub async fn update_folder(&self, mut folder: Folder, replace_users: bool) -> Result<()> {
        folder.password = match folder.password.take().filter(|p| !p.is_empty()) {
            Some(submitted) => {
                let stored = self
                    .get_folder(&folder.name)
                    .await?
                    .and_then(|f| f.password);
                if stored.as_deref() == Some(submitted.as_str()) {
                    Some(submitted)
                } else {
                    Some(hash_secret(&submitted)?)
                }
            }
            None => None,
        };
        self.submit(|reply| Command::UpdateFolder {
            folder,
            replace_users,
            reply,
        })
        .await?
    }

    /// Remove a folder, its items, its limiter buckets and its on-disk
    /// directory.
    pub async fn remove_folder(&self, name: &str) -> Result<()> {
        let name = name.to_string();
        self.submit(|reply| Command::RemoveFolder { name, reply })
            .await?
    }

    /// Append a password to a login of the folder, creating the login if
    /// needed. The password is stored as an Argon2id hash.
    pub async fn add_login(&self, folder: &str, login: &str, password: &str) -> Result<()> {
        if folder.is_empty() || login.is_empty() {
            return Err(EngineError::EmptyName);
        }
        let password_hash = hash_secret(password)?;
        let (folder, login) = (folder.to_string(), login.to_string());
        self.submit(|reply| Command::AddLogin {
            folder,
            login,
            password_hash,
            reply,
        })
        .await?
    }

    /// Delete a login. Removing the last login clears the users mapping.
    pub async fn remove_login(&self, folder: &str, login: &str) -> Result<()> {
        let (folder, login) = (folder.to_string(), login.to_string());
        self.submit(|reply| Command::RemoveLogin {
            folder,
            login,
            reply,
        })
        .await?
    }

    /// Check the folder's shared secret. A folder without one is open.
    pub async fn verify_password(&self, folder: &str, password: &str) -> Result<bool> {
        let fd = self
            .get_folder(folder)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("folder {folder:?}")))?;
        Ok(match fd.password {
            None => true,
            Some(hash) => auth::verify_password(password, &hash),
        })
    }

    /// True when the login exists and the password matches any of its
    /// stored hashes.
    pub async fn verify_login(&self, folder: &str, login: &str, password: &str) -> Result<bool> {
        let fd = self
            .get_folder(folder)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("folder {folder:?}")))?;
        Ok(fd
            .users
            .as_ref()
            .and_then(|users| users.get(login))
            .map(|hashes| hashes.iter().any(|h| auth::verify_password(password, h)))
            .unwrap_or(false))
    }

    /// Completed items; with `include_uploading`, in-flight uploads are
    /// appended with their current progress.
    pub async fn list_items(
        &self,
        folder: &str,
        include_uploading: bool,
    ) -> Result<Vec<FileItem>> {
        let folder = folder.to_string();
        self.submit(|reply| Command::ListItems {
            folder,
            include_uploading,
            reply,
        })
        .await?
    }

    pub async fn get_item(&self, folder: &str, name: &str) -> Result<FileItem> {
        let (folder, name) = (folder.to_string(), name.to_string());
        self.submit(|reply| Command::GetItem {
            folder,
            name,
            reply,
        })
        .await?
    }

    /// Delete a completed item and its stored file.
    pub async fn remove_item(&self, folder: &str, name: &str) -> Result<()> {
        check_item_name(name)?;
        let (folder, name) = (folder.to_string(), name.to_string());
        self.submit(|reply| Command::RemoveItem {
            folder,
            name,
            reply,
        })
        .await?
    }

    /// Open a stored file for reading. The returned stream is paced by the
    /// folder's download rate and holds one active-read slot until dropped.
    pub async fn open_item(&self, folder: &str, name: &str) -> Result<DownloadStream> {
        if folder.is_empty() {
            return Err(EngineError::EmptyName);
        }
        check_item_name(name)?;
        let (folder, name) = (folder.to_string(), name.to_string());
        let commands = self.commands.clone();
        self.submit(|reply| Command::OpenItem {
            folder,
            name,
            commands,
            reply,
        })
        .await?
    }

    /// Stream a new item into a folder. Resolves when the upload reaches a
    /// terminal state: stored, failed, or cancelled by the sweeper.
    pub async fn upload_item(
        &self,
        folder: &str,
        item: FileItem,
        source: impl AsyncRead + Send + Unpin + 'static,
    ) -> Result<()> {
        if folder.is_empty() {
            return Err(EngineError::EmptyName);
        }
        check_item_name(&item.name)?;
        if item.size == 0 {
            return Err(EngineError::Validation(
                "content length must be greater than zero".to_string(),
            ));
        }
        let folder = folder.to_string();
        self.submit(|reply| Command::UploadItem {
            folder,
            item,
            source: Box::new(source),
            reply,
        })
        .await?
    }

    /// Resolves when the next upload reaches a terminal state and frees
    /// its folder slot.
    pub async fn upload_slot_released(&self) {
        self.free_slot.notified().await;
    }

    /// Stop the serializer: queued operations run, the snapshot persists,
    /// in-flight uploads resolve with [`EngineError::Stopped`].
    pub async fn shutdown(&self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .commands
            .send(Command::Shutdown { reply: reply_tx })
            .is_ok()
        {
            let _ = reply_rx.await;
        }
    }
}

fn hash_secret(plain: &str) -> Result<String> {
    auth::hash_password(plain).map_err(|e| EngineError::Validation(e.to_string()))
}

/// Item names address files directly under their folder; anything that
/// cleaning would alter (separators, dot segments, padding) is rejected.
fn check_item_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(EngineError::EmptyName);
    }
    if clean_name(name) != name {
        return Err(EngineError::Validation(format!(
            "invalid file name {name:?}"
        )));
    }
    Ok(())
}
