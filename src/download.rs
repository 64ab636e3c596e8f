//! The download-side stream handed out by `open_item`.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::fs::File;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::mpsc;

use crate::limiter::ThrottledReader;
use crate::state_machine::Command;

/// A throttled reader over a stored file that occupies one of its folder's
/// active-read slots. Dropping the stream releases the slot by messaging
/// the serializer; the stream only holds the folder name and a channel, so
/// the engine always outlives its streams.
#[derive(Debug)]
pub struct DownloadStream {
    inner: ThrottledReader<File>,
    folder: String,
    commands: mpsc::UnboundedSender<Command>,
}

impl DownloadStream {
    pub(crate) fn new(
        inner: ThrottledReader<File>,
        folder: String,
        commands: mpsc::UnboundedSender<Command>,
    ) -> Self {
        Self {
            inner,
            folder,
            commands,
        }
    }
}

impl AsyncRead for DownloadStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl Drop for DownloadStream {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::ReleaseRead {
            folder: std::mem::take(&mut self.folder),
        });
    }
}
