use futures::future::BoxFuture;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Duration, sleep};

/// Whether the heartbeat loop should keep ticking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickControl {
    Continue,
    Stop,
}

/// Background worker driving periodic lock renewal for one session.
pub struct HeartbeatWorker {
    stop_tx: Option<oneshot::Sender<()>>,
    join_handle: Option<JoinHandle<()>>,
}

impl HeartbeatWorker {
    /// Asks the loop to exit after any tick in progress. Does not wait, so it
    /// is safe to call from inside a tick.
    pub fn request_stop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        self.join_handle.take();
    }

    /// Signals the worker to stop and waits for it to finish.
    pub async fn stop(mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(join_handle) = self.join_handle.take() {
            let _ = join_handle.await;
        }
    }

    pub fn is_running(&self) -> bool {
        self.join_handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

impl Drop for HeartbeatWorker {
    fn drop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
    }
}

/// Spawns a loop that calls `tick` every `interval` until stopped or until a
/// tick returns [`TickControl::Stop`].
pub fn spawn_heartbeat<F>(interval: Duration, mut tick: F) -> HeartbeatWorker
where
    F: FnMut() -> BoxFuture<'static, TickControl> + Send + 'static,
{
    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
    let interval = interval.max(Duration::from_millis(1));

    let join_handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut stop_rx => {
                    break;
                }
                _ = sleep(interval) => {
                    if tick().await == TickControl::Stop {
                        break;
                    }
                }
            }
        }
    });

    HeartbeatWorker {
        stop_tx: Some(stop_tx),
        join_handle: Some(join_handle),
    }
}
