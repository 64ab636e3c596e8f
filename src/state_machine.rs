//! The single-writer core of the drop server.
//!
//! One task owns the folder registry, the in-flight upload set, the
//! rate-limiter maps and the active-read counters. Every mutation arrives
//! as a [`Command`] over one channel and runs to completion before the next
//! is dequeued, so admission checks are atomic without any locking. The
//! same loop multiplexes upload events from pipelines, the periodic sweep
//! tick and the autosave tick.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use tokio::fs::File;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use uuid::Uuid;

use crate::download::DownloadStream;
use crate::engine::EngineConfig;
use crate::error::{EngineError, Result};
use crate::limiter::{RateLimiters, ThrottledReader};
use crate::storage::{FileItem, Folder, Registry, Snapshot};
use crate::upload::{remove_temp_file, ByteSource, Pipeline, Upload, UploadEvent};

/// Operations submitted to the serializer. Reply channels carry the result
/// back to the caller; `UploadItem`'s reply is answered by the pipeline
/// once the upload is terminal.
pub(crate) enum Command {
    ListFolders {
        include_private: bool,
        reply: oneshot::Sender<Vec<Folder>>,
    },
    GetFolder {
        name: String,
        reply: oneshot::Sender<Option<Folder>>,
    },
    CreateFolder {
        folder: Folder,
        reply: oneshot::Sender<Result<()>>,
    },
    UpdateFolder {
        folder: Folder,
        replace_users: bool,
        reply: oneshot::Sender<Result<()>>,
    },
    RemoveFolder {
        name: String,
        reply: oneshot::Sender<Result<()>>,
    },
    AddLogin {
        folder: String,
        login: String,
        password_hash: String,
        reply: oneshot::Sender<Result<()>>,
    },
    RemoveLogin {
        folder: String,
        login: String,
        reply: oneshot::Sender<Result<()>>,
    },
    ListItems {
        folder: String,
        include_uploading: bool,
        reply: oneshot::Sender<Result<Vec<FileItem>>>,
    },
    GetItem {
        folder: String,
        name: String,
        reply: oneshot::Sender<Result<FileItem>>,
    },
    RemoveItem {
        folder: String,
        name: String,
        reply: oneshot::Sender<Result<()>>,
    },
    OpenItem {
        folder: String,
        name: String,
        /// The engine's own command channel, handed to the stream so its
        /// drop can release the read slot.
        commands: mpsc::UnboundedSender<Command>,
        reply: oneshot::Sender<Result<DownloadStream>>,
    },
    UploadItem {
        folder: String,
        item: FileItem,
        source: ByteSource,
        reply: oneshot::Sender<Result<()>>,
    },
    /// A download stream closed; give its folder slot back.
    ReleaseRead { folder: String },
    Shutdown { reply: oneshot::Sender<()> },
}

pub(crate) struct StateMachine {
    config: EngineConfig,
    registry: Registry,
    uploads: Vec<Upload>,
    limiters: RateLimiters,
    active_reads: HashMap<String, u32>,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedReceiver<UploadEvent>,
    event_tx: mpsc::UnboundedSender<UploadEvent>,
    free_slot: Arc<Notify>,
}

impl StateMachine {
    pub(crate) fn new(
        config: EngineConfig,
        commands: mpsc::UnboundedReceiver<Command>,
        free_slot: Arc<Notify>,
    ) -> Self {
        let (event_tx, events) = mpsc::unbounded_channel();
        Self {
            config,
            registry: Registry::default(),
            uploads: Vec::new(),
            limiters: RateLimiters::new(),
            active_reads: HashMap::new(),
            commands,
            events,
            event_tx,
            free_slot,
        }
    }

    pub(crate) async fn run(mut self) {
        self.startup().await;

        let mut update = interval_at(
            Instant::now() + self.config.update_interval,
            self.config.update_interval,
        );
        update.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut autosave = interval_at(
            Instant::now() + self.config.autosave_interval,
            self.config.autosave_interval,
        );
        autosave.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.drain().await;
                        self.persist().await;
                        tracing::info!("file server stopped");
                        let _ = reply.send(());
                        return;
                    }
                    Some(command) => self.handle_command(command).await,
                    // Every handle and stream is gone; nothing can reach
                    // the engine anymore.
                    None => {
                        self.persist().await;
                        return;
                    }
                },
                event = self.events.recv() => {
                    if let Some(event) = event {
                        self.handle_event(event).await;
                    }
                }
                _ = update.tick() => {
                    self.sweep().await;
                    self.persist().await;
                }
                _ = autosave.tick() => self.persist().await,
            }
        }
    }

    async fn startup(&mut self) {
        match Snapshot::load(&self.config.data_file).await {
            Ok(snapshot) => {
                self.registry = Registry::from_snapshot(snapshot);
                tracing::info!(
                    folders = self.registry.folder_names().len(),
                    "loaded registry snapshot"
                );
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::info!("no snapshot found, starting with an empty registry");
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to load snapshot, starting with an empty registry");
            }
        }

        // Uploads never persist; temp files left by an interrupted run are
        // unreachable and only waste disk.
        if let Ok(mut dir) = tokio::fs::read_dir(&self.config.tmp_dir).await {
            while let Ok(Some(entry)) = dir.next_entry().await {
                if entry.file_name().to_string_lossy().starts_with("drop-") {
                    tracing::info!(path = %entry.path().display(), "removing stale temp file");
                    remove_temp_file(&entry.path()).await;
                }
            }
        }

        for name in self.registry.folder_names() {
            self.configure_limiters(&name);
        }
        self.persist().await;
    }

    /// Run the commands that were already queued when shutdown arrived.
    async fn drain(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            match command {
                Command::Shutdown { reply } => {
                    let _ = reply.send(());
                }
                command => self.handle_command(command).await,
            }
        }
        while let Ok(event) = self.events.try_recv() {
            self.handle_event(event).await;
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::ListFolders {
                include_private,
                reply,
            } => {
                let _ = reply.send(self.registry.folders(include_private));
            }
            Command::GetFolder { name, reply } => {
                let _ = reply.send(self.registry.folder(&name).cloned());
            }
            Command::CreateFolder { folder, reply } => {
                let _ = reply.send(self.create_folder(folder).await);
            }
            Command::UpdateFolder {
                folder,
                replace_users,
                reply,
            } => {
                let _ = reply.send(self.update_folder(folder, replace_users).await);
            }
            Command::RemoveFolder { name, reply } => {
                let _ = reply.send(self.remove_folder(&name).await);
            }
            Command::AddLogin {
                folder,
                login,
                password_hash,
                reply,
            } => {
                let _ = reply.send(self.add_login(&folder, login, password_hash).await);
            }
            Command::RemoveLogin {
                folder,
                login,
                reply,
            } => {
                let _ = reply.send(self.remove_login(&folder, &login).await);
            }
            Command::ListItems {
                folder,
                include_uploading,
                reply,
            } => {
                let _ = reply.send(self.list_items(&folder, include_uploading));
            }
            Command::GetItem {
                folder,
                name,
                reply,
            } => {
                let _ = reply.send(self.get_item(&folder, &name));
            }
            Command::RemoveItem {
                folder,
                name,
                reply,
            } => {
                let _ = reply.send(self.remove_item(&folder, &name).await);
            }
            Command::OpenItem {
                folder,
                name,
                commands,
                reply,
            } => {
                let _ = reply.send(self.open_item(&folder, &name, commands).await);
            }
            Command::UploadItem {
                folder,
                item,
                source,
                reply,
            } => match self.check_admission(&folder, &item) {
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
                Ok(()) => {
                    let pipeline = self.admit(folder, item, source, reply);
                    tokio::spawn(pipeline.run());
                }
            },
            Command::ReleaseRead { folder } => self.release_read(&folder),
            Command::Shutdown { reply } => {
                // Only reachable from drain(); run() intercepts it.
                let _ = reply.send(());
            }
        }
    }

    async fn create_folder(&mut self, mut folder: Folder) -> Result<()> {
        folder.create_date = self.config.clock.now();
        let name = self.registry.create_folder(folder)?;
        self.configure_limiters(&name);
        tracing::info!(folder = %name, "created folder");
        self.persist_checked().await
    }

    async fn update_folder(&mut self, folder: Folder, replace_users: bool) -> Result<()> {
        let name = folder.name.clone();
        self.registry.update_folder(folder, replace_users)?;
        self.configure_limiters(&name);
        self.persist_checked().await
    }

    async fn remove_folder(&mut self, name: &str) -> Result<()> {
        self.registry.remove_folder(name)?;
        self.limiters.remove(name);
        self.active_reads.remove(name);
        let dir = self.config.storage_dir.join(name);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        tracing::info!(folder = %name, "removed folder");
        self.persist_checked().await
    }

    async fn add_login(&mut self, folder: &str, login: String, hash: String) -> Result<()> {
        let fd = self
            .registry
            .folder_mut(folder)
            .ok_or_else(|| EngineError::NotFound(format!("folder {folder:?}")))?;
        fd.users
            .get_or_insert_with(HashMap::new)
            .entry(login)
            .or_default()
            .push(hash);
        self.persist_checked().await
    }

    async fn remove_login(&mut self, folder: &str, login: &str) -> Result<()> {
        let fd = self
            .registry
            .folder_mut(folder)
            .ok_or_else(|| EngineError::NotFound(format!("folder {folder:?}")))?;
        if let Some(users) = fd.users.as_mut() {
            users.remove(login);
            if users.is_empty() {
                fd.users = None;
            }
        }
        self.persist_checked().await
    }

    fn list_items(&self, folder: &str, include_uploading: bool) -> Result<Vec<FileItem>> {
        if self.registry.folder(folder).is_none() {
            return Err(EngineError::NotFound(format!("folder {folder:?}")));
        }
        let mut items = self.registry.items(folder).to_vec();
        if include_uploading {
            items.extend(
                self.uploads
                    .iter()
                    .filter(|u| u.folder == folder)
                    .map(|u| u.item.clone()),
            );
        }
        Ok(items)
    }

    fn get_item(&self, folder: &str, name: &str) -> Result<FileItem> {
        if self.registry.folder(folder).is_none() {
            return Err(EngineError::NotFound(format!("folder {folder:?}")));
        }
        self.registry
            .item(folder, name)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("file {name:?} in folder {folder:?}")))
    }

    async fn remove_item(&mut self, folder: &str, name: &str) -> Result<()> {
        self.registry.remove_item(folder, name)?;
        let path = self.config.storage_dir.join(folder).join(name);
        tokio::fs::remove_file(&path).await?;
        self.persist_checked().await
    }

    async fn open_item(
        &mut self,
        folder: &str,
        name: &str,
        commands: mpsc::UnboundedSender<Command>,
    ) -> Result<DownloadStream> {
        let fd = self
            .registry
            .folder(folder)
            .ok_or_else(|| EngineError::NotFound(format!("folder {folder:?}")))?;
        let cap = fd.max_active_reads.unwrap_or(0);
        if self.registry.item(folder, name).is_none() {
            return Err(EngineError::NotFound(format!(
                "file {name:?} in folder {folder:?}"
            )));
        }
        let active = self.active_reads.get(folder).copied().unwrap_or(0);
        if cap > 0 && active >= cap {
            return Err(EngineError::ConcurrencyExceeded);
        }
        *self.active_reads.entry(folder.to_string()).or_insert(0) += 1;

        let path = self.config.storage_dir.join(folder).join(name);
        match File::open(&path).await {
            Ok(file) => {
                let reader = ThrottledReader::new(file, self.limiters.read_bucket(folder));
                Ok(DownloadStream::new(reader, folder.to_string(), commands))
            }
            Err(e) => {
                // A failed open must not hold the slot it reserved.
                self.release_read(folder);
                Err(e.into())
            }
        }
    }

    fn release_read(&mut self, folder: &str) {
        if let Some(active) = self.active_reads.get_mut(folder) {
            *active = active.saturating_sub(1);
            if *active == 0 {
                self.active_reads.remove(folder);
            }
        }
    }

    /// All admission checks for `upload_item`, in order: folder existence,
    /// write concurrency, (folder, name) uniqueness across completed and
    /// in-flight, per-file size, file count, total size. In-flight uploads
    /// count with their declared sizes.
    fn check_admission(&self, folder: &str, item: &FileItem) -> Result<()> {
        let fd = self
            .registry
            .folder(folder)
            .ok_or_else(|| EngineError::NotFound(format!("folder {folder:?}")))?;

        let in_flight = self.uploads.iter().filter(|u| u.folder == folder).count() as u64;
        if let Some(cap) = fd.max_active_writes.filter(|c| *c > 0) {
            if in_flight >= cap as u64 {
                return Err(EngineError::ConcurrencyExceeded);
            }
        }

        if self.registry.has_item(folder, &item.name)
            || self
                .uploads
                .iter()
                .any(|u| u.folder == folder && u.item.name == item.name)
        {
            return Err(EngineError::Duplicate(item.name.clone()));
        }

        if let Some(limit) = fd.max_file_size.filter(|m| *m > 0) {
            if item.size > limit {
                return Err(EngineError::TooLarge { limit });
            }
        }

        if let Some(limit) = fd.max_file_count.filter(|m| *m > 0) {
            let current = self.registry.items(folder).len() as u64 + in_flight;
            if current + 1 > limit {
                return Err(EngineError::CountExceeded { limit });
            }
        }

        if let Some(limit) = fd.max_total_size.filter(|m| *m > 0) {
            let used = self.registry.total_size(folder)
                + self
                    .uploads
                    .iter()
                    .filter(|u| u.folder == folder)
                    .map(|u| u.item.size)
                    .sum::<u64>();
            if used + item.size > limit {
                return Err(EngineError::TotalExceeded {
                    needed: item.size,
                    available: limit.saturating_sub(used),
                });
            }
        }

        Ok(())
    }

    /// Record the upload and build its pipeline. The caller's reply channel
    /// moves into the pipeline, which answers it when the upload is
    /// terminal.
    fn admit(
        &mut self,
        folder: String,
        mut item: FileItem,
        source: ByteSource,
        reply: oneshot::Sender<Result<()>>,
    ) -> Pipeline {
        let now = self.config.clock.now();
        item.path = "/".to_string();
        item.uploaded = 0;
        item.create_date = now;

        let tmp_path = self.config.tmp_dir.join(format!("drop-{}", Uuid::new_v4()));
        let (verdict_tx, verdict_rx) = mpsc::channel(1);
        let throttled = ThrottledReader::new(source, self.limiters.write_bucket(&folder));

        self.uploads.push(Upload {
            folder: folder.clone(),
            item: item.clone(),
            tmp_path: tmp_path.clone(),
            last_active: now,
            verdict: verdict_tx,
        });
        tracing::info!(folder = %folder, file = %item.name, size = item.size, "admitted upload");

        Pipeline {
            folder,
            item,
            tmp_path,
            source: Box::new(throttled),
            events: self.event_tx.clone(),
            verdict: verdict_rx,
            reply,
            clock: self.config.clock.clone(),
        }
    }

    async fn handle_event(&mut self, event: UploadEvent) {
        match event {
            UploadEvent::Progress {
                folder,
                name,
                uploaded,
                at,
            } => {
                if let Some(upload) = self
                    .uploads
                    .iter_mut()
                    .find(|u| u.folder == folder && u.item.name == name)
                {
                    // Newer last_active wins; stale events are dropped.
                    if at > upload.last_active {
                        upload.last_active = at;
                        upload.item.uploaded = uploaded;
                    }
                }
            }
            UploadEvent::Done {
                folder,
                name,
                uploaded,
                error,
            } => {
                let Some(pos) = self
                    .uploads
                    .iter()
                    .position(|u| u.folder == folder && u.item.name == name)
                else {
                    // Already cancelled by the sweeper.
                    return;
                };
                let upload = self.uploads.remove(pos);
                self.free_slot.notify_waiters();
                match error {
                    Some(e) => {
                        tracing::error!(folder = %upload.folder, file = %upload.item.name, error = %e, "upload failed");
                        remove_temp_file(&upload.tmp_path).await;
                        let _ = upload.verdict.try_send(Err(e));
                    }
                    None => self.finalize_upload(upload, uploaded).await,
                }
            }
        }
    }

    /// Move a finished temp file into the folder's storage directory and
    /// record the item. Any failure is forwarded to the waiting uploader.
    async fn finalize_upload(&mut self, mut upload: Upload, uploaded: u64) {
        if self.registry.has_item(&upload.folder, &upload.item.name) {
            remove_temp_file(&upload.tmp_path).await;
            let _ = upload
                .verdict
                .try_send(Err(EngineError::Duplicate(upload.item.name.clone())));
            return;
        }

        let dir = self.config.storage_dir.join(&upload.folder);
        if let Err(e) = tokio::fs::create_dir_all(&dir).await {
            tracing::error!(folder = %upload.folder, error = %e, "failed to create storage directory");
            remove_temp_file(&upload.tmp_path).await;
            let _ = upload.verdict.try_send(Err(e.into()));
            return;
        }

        let dest = dir.join(&upload.item.name);
        if let Err(e) = tokio::fs::rename(&upload.tmp_path, &dest).await {
            tracing::error!(folder = %upload.folder, file = %upload.item.name, error = %e, "failed to finalize upload");
            remove_temp_file(&upload.tmp_path).await;
            let _ = upload.verdict.try_send(Err(e.into()));
            return;
        }

        upload.item.uploaded = uploaded;
        upload.item.create_date = self.config.clock.now();
        if let Err(e) = self.registry.add_item(&upload.folder, upload.item.clone()) {
            // The folder vanished between admission and completion.
            if let Err(rm) = tokio::fs::remove_file(&dest).await {
                tracing::error!(path = %dest.display(), error = %rm, "failed to clean up orphaned file");
            }
            let _ = upload.verdict.try_send(Err(e));
            return;
        }

        tracing::info!(folder = %upload.folder, file = %upload.item.name, size = uploaded, "stored uploaded file");
        let result = self.persist_checked().await;
        let _ = upload.verdict.try_send(result);
    }

    /// The update tick: cancel stalled uploads, expire old items.
    async fn sweep(&mut self) {
        let now = self.config.clock.now();
        let stall = self.config.stall_timeout;

        let mut kept = Vec::with_capacity(self.uploads.len());
        for upload in self.uploads.drain(..) {
            let stalled = now
                .signed_duration_since(upload.last_active)
                .to_std()
                .map(|age| age > stall)
                .unwrap_or(false);
            if stalled {
                tracing::info!(folder = %upload.folder, file = %upload.item.name, "cancelling stalled upload");
                remove_temp_file(&upload.tmp_path).await;
                let _ = upload.verdict.try_send(Err(EngineError::Cancelled));
            } else {
                kept.push(upload);
            }
        }
        self.uploads = kept;

        for (folder, item) in self.registry.drain_expired(now) {
            tracing::info!(folder = %folder, file = %item.name, "lifetime exceeded, removing file");
            let path = self.config.storage_dir.join(&folder).join(&item.name);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::error!(path = %path.display(), error = %e, "failed to remove expired file");
                }
            }
        }
    }

    fn configure_limiters(&mut self, name: &str) {
        let rates = self
            .registry
            .folder(name)
            .map(|f| (f.read_rate.unwrap_or(0), f.write_rate.unwrap_or(0)));
        if let Some((read, write)) = rates {
            self.limiters.set_read_rate(name, read);
            self.limiters.set_write_rate(name, write);
        }
    }

    async fn persist(&mut self) {
        if let Err(e) = self.persist_checked().await {
            tracing::error!(error = %e, "failed to save registry snapshot");
        }
    }

    async fn persist_checked(&self) -> Result<()> {
        self.registry
            .to_snapshot()
            .save(&self.config.data_file)
            .await
            .map_err(EngineError::from)
    }
}
