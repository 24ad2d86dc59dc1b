//! Task spawning capability
//!
//! Decode work runs off the render thread. The host picks where: plain OS
//! threads, the tokio blocking pool, or a manual queue in tests.

/// Unit of work handed to a spawner
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Host capability that runs tasks concurrently with the caller
pub trait TaskSpawner: Send + Sync {
    fn spawn(&self, task: Task);
}

/// One OS thread per task
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSpawner;

impl TaskSpawner for ThreadSpawner {
    fn spawn(&self, task: Task) {
        let spawned = std::thread::Builder::new()
            .name("marionette-decode".into())
            .spawn(task);
        if let Err(e) = spawned {
            // The decoder watchdog reports the task as failed
            tracing::error!(error = %e, "failed to spawn decode thread");
        }
    }
}

/// Runs tasks on a tokio runtime's blocking pool
#[derive(Debug, Clone)]
pub struct TokioSpawner {
    handle: tokio::runtime::Handle,
}

impl TokioSpawner {
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        TokioSpawner { handle }
    }

    /// Spawner bound to the runtime the caller is running in
    ///
    /// Returns `None` outside a tokio runtime.
    pub fn current() -> Option<Self> {
        tokio::runtime::Handle::try_current().ok().map(Self::new)
    }
}

impl TaskSpawner for TokioSpawner {
    fn spawn(&self, task: Task) {
        // Detached; results come back over the decoder channel
        drop(self.handle.spawn_blocking(task));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_thread_spawner_runs_task() {
        let (tx, rx) = mpsc::channel();
        ThreadSpawner.spawn(Box::new(move || {
            let _ = tx.send(42u32);
        }));
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok(42));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_tokio_spawner_runs_task() {
        let spawner = TokioSpawner::current().expect("inside runtime");
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        spawner.spawn(Box::new(move || {
            let _ = tx.send("decoded");
        }));
        assert_eq!(rx.recv().await, Some("decoded"));
    }
}
