//! The streaming upload pipeline.
//!
//! After admission the serializer spawns one pipeline task per upload. The
//! pipeline owns the temp file and the (throttled) source stream; it never
//! touches shared state. It reports back with [`UploadEvent`]s: a progress
//! event every second while bytes flow, then exactly one terminal event on
//! EOF or error. The serializer answers on the upload's completion channel
//! with the final verdict, which the pipeline forwards to the API caller.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;

use crate::engine::Clock;
use crate::error::EngineError;
use crate::storage::FileItem;

/// Any readable byte stream handed to `upload_item`.
pub type ByteSource = Box<dyn AsyncRead + Send + Unpin>;

const COPY_CHUNK: usize = 64 * 1024;
const PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

/// Serializer-side record of an in-flight transfer. Keyed by
/// (folder, item name); holds the sender half of the completion channel.
#[derive(Debug)]
pub(crate) struct Upload {
    pub folder: String,
    pub item: FileItem,
    pub tmp_path: PathBuf,
    pub last_active: DateTime<Utc>,
    pub verdict: mpsc::Sender<Result<(), EngineError>>,
}

/// Signals from a pipeline to the serializer.
#[derive(Debug)]
pub(crate) enum UploadEvent {
    /// Bytes are still flowing. Applied only when `at` is newer than the
    /// stored activity timestamp, which tolerates out-of-order delivery.
    Progress {
        folder: String,
        name: String,
        uploaded: u64,
        at: DateTime<Utc>,
    },
    /// The source reached EOF or failed; the pipeline is done writing.
    Done {
        folder: String,
        name: String,
        uploaded: u64,
        error: Option<EngineError>,
    },
}

enum TransferOutcome {
    /// The copy ran to EOF or a local failure; a terminal event is due.
    Finished {
        uploaded: u64,
        error: Option<EngineError>,
    },
    /// The serializer answered mid-copy (stall cancellation or shutdown);
    /// the verdict is already in hand and no event must be sent.
    Resolved(Result<(), EngineError>),
}

pub(crate) struct Pipeline {
    pub folder: String,
    pub item: FileItem,
    pub tmp_path: PathBuf,
    pub source: ByteSource,
    pub events: mpsc::UnboundedSender<UploadEvent>,
    pub verdict: mpsc::Receiver<Result<(), EngineError>>,
    pub reply: oneshot::Sender<Result<(), EngineError>>,
    pub clock: Arc<dyn Clock>,
}

impl Pipeline {
    pub(crate) async fn run(mut self) {
        let verdict = match self.transfer().await {
            TransferOutcome::Resolved(verdict) => {
                // The serializer already dropped this upload and its temp
                // file; removal here is idempotent.
                remove_temp_file(&self.tmp_path).await;
                verdict
            }
            TransferOutcome::Finished { uploaded, error } => {
                let sent = self.events.send(UploadEvent::Done {
                    folder: self.folder.clone(),
                    name: self.item.name.clone(),
                    uploaded,
                    error,
                });
                if sent.is_ok() {
                    self.verdict
                        .recv()
                        .await
                        .unwrap_or(Err(EngineError::Stopped))
                } else {
                    remove_temp_file(&self.tmp_path).await;
                    Err(EngineError::Stopped)
                }
            }
        };
        let _ = self.reply.send(verdict);
    }

    /// Copy the source into the temp file, never reading past the declared
    /// size, emitting a progress event every second.
    async fn transfer(&mut self) -> TransferOutcome {
        let mut file = match File::create(&self.tmp_path).await {
            Ok(f) => f,
            Err(e) => {
                return TransferOutcome::Finished {
                    uploaded: 0,
                    error: Some(e.into()),
                }
            }
        };

        let mut uploaded: u64 = 0;
        let mut buf = vec![0u8; COPY_CHUNK];
        let mut ticker = tokio::time::interval(PROGRESS_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await; // the first tick is immediate

        loop {
            let want = (self.item.size - uploaded).min(buf.len() as u64) as usize;
            if want == 0 {
                break;
            }
            tokio::select! {
                verdict = self.verdict.recv() => {
                    return TransferOutcome::Resolved(
                        verdict.unwrap_or(Err(EngineError::Stopped)),
                    );
                }
                _ = ticker.tick() => {
                    let _ = self.events.send(UploadEvent::Progress {
                        folder: self.folder.clone(),
                        name: self.item.name.clone(),
                        uploaded,
                        at: self.clock.now(),
                    });
                }
                read = self.source.read(&mut buf[..want]) => match read {
                    Ok(0) => {
                        return TransferOutcome::Finished {
                            uploaded,
                            error: Some(EngineError::Io(format!(
                                "stream ended after {uploaded} of {} bytes",
                                self.item.size
                            ))),
                        };
                    }
                    Ok(n) => {
                        if let Err(e) = file.write_all(&buf[..n]).await {
                            return TransferOutcome::Finished {
                                uploaded,
                                error: Some(e.into()),
                            };
                        }
                        uploaded += n as u64;
                    }
                    Err(e) => {
                        return TransferOutcome::Finished {
                            uploaded,
                            error: Some(EngineError::Io(e.to_string())),
                        };
                    }
                },
            }
        }

        if let Err(e) = file.flush().await {
            return TransferOutcome::Finished {
                uploaded,
                error: Some(e.into()),
            };
        }
        TransferOutcome::Finished {
            uploaded,
            error: None,
        }
    }
}

/// Delete an upload's temp file. Both the sweeper and the pipeline may try;
/// a missing file is fine.
pub(crate) async fn remove_temp_file(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to remove temp file");
        }
    }
}
