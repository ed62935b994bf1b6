//! A live session: step channel, playback queue and router wired together.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::avatar::AvatarDriver;
use crate::channel::StepChannel;
use crate::config::LiveConfig;
use crate::error::Result;
use crate::playback::{AudioSink, ClipDecoder, PlaybackQueue};
use crate::router::StepRouter;

/// Owns everything needed to follow one performance.
///
/// Dropping the session disconnects and cancels the router without waiting;
/// [`LiveSession::shutdown`] does the same but waits for a clean close.
pub struct LiveSession {
    channel: Arc<StepChannel>,
    queue: Arc<PlaybackQueue>,
    router_cancel: CancellationToken,
    router_task: Option<JoinHandle<()>>,
}

impl LiveSession {
    /// Build the pipeline and connect. Must be called within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`crate::LiveError::Config`] if the stream URL is invalid.
    pub fn start(
        config: &LiveConfig,
        decoder: Arc<dyn ClipDecoder>,
        sink: Box<dyn AudioSink>,
        driver: Arc<dyn AvatarDriver>,
    ) -> Result<Self> {
        let channel = Arc::new(StepChannel::from_config(config)?);
        let queue = Arc::new(PlaybackQueue::new(&config.playback, decoder, sink));
        let router = StepRouter::new(
            Arc::clone(&queue),
            driver,
            config.avatar.character_name.clone(),
        );

        // Subscribe before connecting so no state change or step is missed.
        let steps = channel.subscribe();
        let playback = queue.subscribe();
        let router_cancel = CancellationToken::new();
        let router_task = tokio::spawn(router.run(
            steps,
            playback,
            channel.state(),
            router_cancel.clone(),
        ));

        info!("live session connecting to {}", channel.url());
        channel.connect();

        Ok(Self {
            channel,
            queue,
            router_cancel,
            router_task: Some(router_task),
        })
    }

    pub fn channel(&self) -> &StepChannel {
        &self.channel
    }

    pub fn queue(&self) -> &PlaybackQueue {
        &self.queue
    }

    /// Close the connection, silence playback and wait for the router to exit.
    pub async fn shutdown(mut self) {
        self.channel.shutdown().await;
        self.queue.stop().await;
        self.router_cancel.cancel();
        if let Some(task) = self.router_task.take() {
            let _ = task.await;
        }
        info!("live session closed");
    }
}

impl Drop for LiveSession {
    fn drop(&mut self) {
        self.channel.disconnect();
        self.router_cancel.cancel();
        if let Some(task) = self.router_task.take() {
            task.abort();
        }
    }
}
