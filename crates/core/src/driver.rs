use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::events::UploadEvent;
use crate::file::FullMsgId;
use crate::media::{FileLoadResult, MediaDescriptor};
use crate::strategy::{RequestId, UploadStrategy};
use crate::uploader::Uploader;
use crate::{Error, Result};

pub type Completions<R> = mpsc::UnboundedReceiver<(RequestId, Result<R>)>;

#[derive(Debug)]
pub enum Command {
    UploadMedia {
        msg_id: FullMsgId,
        media: MediaDescriptor,
    },
    Upload {
        msg_id: FullMsgId,
        result: FileLoadResult,
    },
    Cancel(FullMsgId),
    Pause(FullMsgId),
    Unpause,
    Confirm(FullMsgId),
    Subscribe(oneshot::Sender<mpsc::UnboundedReceiver<UploadEvent>>),
}

/// Cheap handle to an uploader running on its own task.
#[derive(Debug, Clone)]
pub struct UploaderHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl UploaderHandle {
    fn send(&self, command: Command) -> Result<()> {
        self.commands.send(command).map_err(|_| Error::Stopped)
    }

    pub fn upload_media(&self, msg_id: FullMsgId, media: MediaDescriptor) -> Result<()> {
        self.send(Command::UploadMedia { msg_id, media })
    }

    pub fn upload(&self, msg_id: FullMsgId, result: FileLoadResult) -> Result<()> {
        self.send(Command::Upload { msg_id, result })
    }

    pub fn cancel(&self, msg_id: FullMsgId) -> Result<()> {
        self.send(Command::Cancel(msg_id))
    }

    pub fn pause(&self, msg_id: FullMsgId) -> Result<()> {
        self.send(Command::Pause(msg_id))
    }

    pub fn unpause(&self) -> Result<()> {
        self.send(Command::Unpause)
    }

    pub fn confirm(&self, msg_id: FullMsgId) -> Result<()> {
        self.send(Command::Confirm(msg_id))
    }

    pub async fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<UploadEvent>> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Subscribe(tx))?;
        rx.await.map_err(|_| Error::Stopped)
    }
}

pub fn spawn_uploader<S>(
    uploader: Uploader<S>,
    completions: Completions<S::Response>,
    send_interval: Duration,
    shutdown: CancellationToken,
) -> (UploaderHandle, JoinHandle<()>)
where
    S: UploadStrategy + Send + 'static,
    S::Response: Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(run_uploader(
        uploader,
        rx,
        completions,
        send_interval,
        shutdown,
    ));
    (UploaderHandle { commands: tx }, task)
}

/// Serializes every entry point of the uploader onto one task. Returns when
/// `shutdown` fires or every [`UploaderHandle`] is dropped.
pub async fn run_uploader<S: UploadStrategy>(
    mut uploader: Uploader<S>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    mut completions: Completions<S::Response>,
    send_interval: Duration,
    shutdown: CancellationToken,
) {
    let mut tick = tokio::time::interval(send_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(
        event = "driver.start",
        strategy = uploader.strategy().name(),
        "driver.start"
    );

    loop {
        let busy = uploader.current().is_some() || uploader.queued() > 0;
        let idle = uploader.idle_deadline();

        tokio::select! {
            _ = shutdown.cancelled() => break,
            cmd = commands.recv() => match cmd {
                Some(cmd) => apply(&mut uploader, cmd),
                None => break,
            },
            Some((request, response)) = completions.recv() => {
                uploader.on_response(request, response);
            }
            _ = tick.tick(), if busy => uploader.send_next(),
            _ = wait_until(idle), if idle.is_some() => uploader.on_idle_timeout(),
        }
    }

    info!(
        event = "driver.stop",
        strategy = uploader.strategy().name(),
        queued = uploader.queued(),
        "driver.stop"
    );
}

fn apply<S: UploadStrategy>(uploader: &mut Uploader<S>, command: Command) {
    debug!(
        event = "driver.command",
        command = command_name(&command),
        "driver.command"
    );
    match command {
        Command::UploadMedia { msg_id, media } => uploader.upload_media(msg_id, media),
        Command::Upload { msg_id, result } => uploader.upload(msg_id, result),
        Command::Cancel(msg_id) => uploader.cancel(msg_id),
        Command::Pause(msg_id) => uploader.pause(msg_id),
        Command::Unpause => uploader.unpause(),
        Command::Confirm(msg_id) => uploader.confirm(msg_id),
        Command::Subscribe(reply) => {
            let _ = reply.send(uploader.subscribe());
        }
    }
}

fn command_name(command: &Command) -> &'static str {
    match command {
        Command::UploadMedia { .. } => "upload_media",
        Command::Upload { .. } => "upload",
        Command::Cancel(_) => "cancel",
        Command::Pause(_) => "pause",
        Command::Unpause => "unpause",
        Command::Confirm(_) => "confirm",
        Command::Subscribe(_) => "subscribe",
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => {
            tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await
        }
        None => std::future::pending().await,
    }
}
