use std::{future::Future, sync::Arc, time::Duration};

use tokio::{
    sync::watch,
    task::{JoinError, JoinHandle},
    time::{Instant, MissedTickBehavior},
};
use tracing::{debug, info};

use crate::controller::Controller;

#[derive(Debug)]
pub struct ShutdownError {
    task: &'static str,
    source: JoinError,
}

impl std::fmt::Display for ShutdownError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} task did not stop cleanly: {}", self.task, self.source)
    }
}

impl std::error::Error for ShutdownError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

/// The running node-sync and report tasks.
pub struct Service {
    shutdown: watch::Sender<bool>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl Service {
    /// Spawns both periodic tasks. The first tick of each fires one interval from now;
    /// the initial sync is expected to have run through [`Controller::start`].
    pub fn spawn(controller: Arc<Controller>, interval: Duration) -> Self {
        let (shutdown, rx) = watch::channel(false);

        let sync = {
            let controller = controller.clone();
            spawn_periodic("node-sync", interval, rx.clone(), move || {
                let controller = controller.clone();
                async move { controller.sync_tick().await }
            })
        };
        let report = spawn_periodic("report", interval, rx, move || {
            let controller = controller.clone();
            async move { controller.report_tick().await }
        });

        info!(interval_secs = interval.as_secs(), "periodic tasks started");
        Self {
            shutdown,
            tasks: vec![("node-sync", sync), ("report", report)],
        }
    }

    /// Signals both tasks and waits for them. A tick in flight runs to completion first.
    pub async fn close(self) -> Result<(), ShutdownError> {
        let _ = self.shutdown.send(true);
        let mut first_err = None;
        for (task, handle) in self.tasks {
            if let Err(source) = handle.await {
                first_err.get_or_insert(ShutdownError { task, source });
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

fn spawn_periodic<F, Fut>(
    name: &'static str,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => tick().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!(task = name, "periodic task stopped");
    })
}
