use std::future::Future;

use tokio::{
    sync::{
        mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
        oneshot,
    },
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct BackgroundSpawner {
    err_sender: UnboundedSender<crate::Error>,
    token: CancellationToken,
}

impl BackgroundSpawner {
    pub fn spawn(&self, task: impl Future<Output = crate::Result<()>> + Send + 'static) {
        let err_sender = self.err_sender.clone();
        let token = self.token.clone();
        let mut task = tokio::spawn(task);
        tokio::spawn(async move {
            let result = tokio::select! {
                result = &mut task => result,
                () = token.cancelled() => {
                    task.abort();
                    task.await
                }
            };
            let err = match result {
                Err(err) if !err.is_cancelled() => err.into(),
                Ok(Err(err)) => err,
                _ => return,
            };
            if let Err(err) = err_sender.send(err) {
                warn!("background error after monitor shutdown: {}", err.0)
            }
        });
    }
}

#[derive(Debug)]
pub struct BackgroundMonitor {
    err_sender: UnboundedSender<crate::Error>,
    err_receiver: UnboundedReceiver<crate::Error>,
    token: CancellationToken,
}

impl Default for BackgroundMonitor {
    fn default() -> Self {
        let (err_sender, err_receiver) = unbounded_channel();
        Self {
            err_sender,
            err_receiver,
            token: CancellationToken::new(),
        }
    }
}

impl BackgroundMonitor {
    pub fn spawner(&self) -> BackgroundSpawner {
        BackgroundSpawner {
            err_sender: self.err_sender.clone(),
            token: self.token.clone(),
        }
    }

    /// Resolves with the first error of any spawned task.
    pub async fn wait(&mut self) -> crate::Result<()> {
        match self.err_receiver.recv().await {
            Some(err) => {
                self.token.cancel();
                Err(err)
            }
            None => Ok(()),
        }
    }

    /// Cancels every spawned task and waits until all of them are gone.
    ///
    /// All spawners handed out must be dropped before, otherwise this never
    /// returns.
    pub async fn shutdown(self) -> crate::Result<()> {
        let Self {
            err_sender,
            mut err_receiver,
            token,
        } = self;
        token.cancel();
        drop(err_sender);
        let mut result = Ok(());
        while let Some(err) = err_receiver.recv().await {
            if result.is_ok() {
                result = Err(err)
            }
        }
        result
    }
}

/// Handle of a long-lived role (a resolver replica, a workload service)
/// running in the background.
///
/// Three transitions are observable independently: started (on return of
/// `start`), ready (`ready`) and completed with a result (`join`/`stop`).
#[derive(Debug)]
pub struct Worker {
    name: String,
    token: CancellationToken,
    done: CancellationToken,
    ready: Option<oneshot::Receiver<()>>,
    handle: JoinHandle<crate::Result<()>>,
}

/// The worker side of a [`Worker`].
#[derive(Debug)]
pub struct Lifecycle {
    token: CancellationToken,
    ready: Option<oneshot::Sender<()>>,
}

impl Lifecycle {
    pub fn ready(&mut self) {
        if let Some(ready) = self.ready.take() {
            // the handle may be gone already, nobody to notify then
            let _ = ready.send(());
        }
    }

    pub async fn stopped(&self) {
        self.token.cancelled().await
    }
}

impl Worker {
    pub fn start<F, T>(name: impl Into<String>, session: F) -> Self
    where
        F: FnOnce(Lifecycle) -> T,
        T: Future<Output = crate::Result<()>> + Send + 'static,
    {
        let token = CancellationToken::new();
        let done = CancellationToken::new();
        let (ready_sender, ready) = oneshot::channel();
        let session = session(Lifecycle {
            token: token.clone(),
            ready: Some(ready_sender),
        });
        let handle = tokio::spawn({
            let done = done.clone();
            async move {
                let result = session.await;
                done.cancel();
                result
            }
        });
        Self {
            name: name.into(),
            token,
            done,
            ready: Some(ready),
            handle,
        }
    }

    /// Waits until the worker reports it has finished its own bootstrap.
    ///
    /// Fails if the worker completes without ever becoming ready; the cause
    /// is then available from `join`.
    pub async fn ready(&mut self) -> crate::Result<()> {
        let Some(ready) = self.ready.take() else {
            return Ok(());
        };
        ready
            .await
            .map_err(|_| crate::err!("{} exited before ready", self.name))
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Resolves once the worker has completed, without taking its result.
    pub fn finished(&self) -> impl Future<Output = ()> + Send + 'static {
        let done = self.done.clone();
        async move { done.cancelled().await }
    }

    /// Requests shutdown and waits until the worker has fully exited.
    pub async fn stop(self) -> crate::Result<()> {
        self.token.cancel();
        self.join().await
    }

    pub async fn join(self) -> crate::Result<()> {
        let result = match self.handle.await {
            Ok(result) => result,
            Err(err) => Err(err.into()),
        };
        result.map_err(|err| err.context(format!("worker {}", self.name)))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn ready_then_stop() {
        let mut worker = Worker::start("test", |mut lifecycle| async move {
            lifecycle.ready();
            lifecycle.stopped().await;
            Ok::<_, crate::Error>(())
        });
        worker.ready().await.unwrap();
        assert!(!worker.is_finished());
        worker.stop().await.unwrap();
    }

    #[tokio::test]
    async fn exit_before_ready() {
        let mut worker = Worker::start("test", |_| async {
            Err::<(), _>(crate::err!("bind fail"))
        });
        assert!(worker.ready().await.is_err());
        let err = worker.join().await.unwrap_err();
        assert_eq!(err.root_cause().to_string(), "bind fail");
    }

    #[tokio::test]
    async fn monitor_surfaces_first_error() {
        let mut monitor = BackgroundMonitor::default();
        let spawner = monitor.spawner();
        spawner.spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok::<_, crate::Error>(())
        });
        spawner.spawn(async { Err::<(), _>(crate::err!("boom")) });
        assert_eq!(monitor.wait().await.unwrap_err().to_string(), "boom");
        drop(spawner);
        monitor.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_cancels() {
        let monitor = BackgroundMonitor::default();
        let spawner = monitor.spawner();
        let (sender, receiver) = oneshot::channel::<()>();
        spawner.spawn(async move {
            let _sender = sender;
            std::future::pending::<()>().await;
            Ok::<_, crate::Error>(())
        });
        drop(spawner);
        monitor.shutdown().await.unwrap();
        // task dropped, so its captured sender too
        assert!(receiver.await.is_err());
    }
}
