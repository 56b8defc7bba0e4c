//! Background maintenance worker
//!
//! Flushes that leave shards over the L0 threshold post a `Compact` task;
//! the worker compacts and then collects garbage. One thread, fed through a
//! crossbeam channel, holding only a weak reference to the store so a
//! dropped store simply ends the loop.
//!
//! ```text
//! writer threads          channel                 maintenance thread
//!     |                      |                          |
//!     +- flush() ----------->| Compact ---------------->| store.compact()
//!     |                      |                          | store.collect_garbage()
//!     +- drop(worker) ------>| Shutdown --------------->| exit
//! ```

use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::{debug, error, info};

use crate::error::{GraphError, Result};
use crate::storage::multi_shard::MultiShardStore;

/// Work items for the maintenance thread.
#[derive(Debug)]
pub enum MaintenanceTask {
    Compact,
    CollectGarbage,
    /// Answered once every task queued before it has run
    Sync { response_tx: Sender<()> },
    Shutdown,
}

/// Handle to the maintenance thread. Dropping it stops the thread.
pub struct MaintenanceWorker {
    task_tx: Sender<MaintenanceTask>,
    worker_handle: Option<JoinHandle<()>>,
}

impl MaintenanceWorker {
    /// Start the worker and route the store's compaction requests to it.
    pub fn spawn(store: &Arc<MultiShardStore>) -> Result<Self> {
        let (task_tx, task_rx) = unbounded::<MaintenanceTask>();
        let weak = Arc::downgrade(store);

        let worker_handle = thread::Builder::new()
            .name("cgstore-maintenance".into())
            .spawn(move || worker_loop(weak, task_rx))?;

        store.attach_maintenance(task_tx.clone());
        Ok(Self {
            task_tx,
            worker_handle: Some(worker_handle),
        })
    }

    pub fn schedule(&self, task: MaintenanceTask) -> Result<()> {
        self.task_tx
            .send(task)
            .map_err(|_| GraphError::Compaction("maintenance worker stopped".into()))
    }

    /// Block until every task queued so far has been processed.
    pub fn sync(&self) -> Result<()> {
        let (response_tx, response_rx) = unbounded();
        self.schedule(MaintenanceTask::Sync { response_tx })?;
        response_rx
            .recv()
            .map_err(|_| GraphError::Compaction("maintenance worker stopped".into()))
    }

    pub fn sender(&self) -> Sender<MaintenanceTask> {
        self.task_tx.clone()
    }
}

impl Drop for MaintenanceWorker {
    fn drop(&mut self) {
        let _ = self.task_tx.send(MaintenanceTask::Shutdown);
        if let Some(handle) = self.worker_handle.take() {
            let _ = handle.join();
        }
    }
}

fn worker_loop(store: Weak<MultiShardStore>, task_rx: Receiver<MaintenanceTask>) {
    debug!("maintenance worker started");

    while let Ok(task) = task_rx.recv() {
        let Some(store) = store.upgrade() else {
            break;
        };
        match task {
            MaintenanceTask::Compact => {
                // несколько flush подряд - одна компакция
                let mut extra = Vec::new();
                while let Ok(next) = task_rx.try_recv() {
                    match next {
                        MaintenanceTask::Compact => {}
                        other => extra.push(other),
                    }
                }
                match store.compact() {
                    Ok(result) if !result.shards_compacted.is_empty() => {
                        info!(shards = ?result.shards_compacted, "background compaction done");
                        if let Err(e) = store.collect_garbage() {
                            error!(error = %e, "background GC failed");
                        }
                    }
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "background compaction failed"),
                }
                for task in extra {
                    if !run_simple(&store, task) {
                        return;
                    }
                }
            }
            other => {
                if !run_simple(&store, other) {
                    break;
                }
            }
        }
    }

    debug!("maintenance worker stopped");
}

/// Run a non-compaction task. Returns false on shutdown.
fn run_simple(store: &MultiShardStore, task: MaintenanceTask) -> bool {
    match task {
        MaintenanceTask::Compact => {
            if let Err(e) = store.compact() {
                error!(error = %e, "background compaction failed");
            }
        }
        MaintenanceTask::CollectGarbage => match store.collect_garbage() {
            Ok(report) => debug!(files = report.files_removed, "background GC done"),
            Err(e) => error!(error = %e, "background GC failed"),
        },
        MaintenanceTask::Sync { response_tx } => {
            let _ = response_tx.send(());
        }
        MaintenanceTask::Shutdown => return false,
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::storage::NodeRecord;

    fn config() -> StoreConfig {
        let mut config = StoreConfig::default().with_shard_count(1);
        config.compaction.segment_threshold = 2;
        config.background_maintenance = true;
        config
    }

    #[test]
    fn test_worker_compacts_after_flushes() {
        let store = Arc::new(MultiShardStore::ephemeral(config()).unwrap());
        let worker = MaintenanceWorker::spawn(&store).unwrap();

        for i in 1..=3u128 {
            store
                .upsert("src/a.js", NodeRecord::new(i, "FUNCTION", format!("f{}", i), "src/a.js"))
                .unwrap();
            store.flush().unwrap();
        }
        worker.sync().unwrap();

        let snap = store.snapshot();
        assert!(snap.manifest().last_compaction.is_some());
        for i in 1..=3u128 {
            assert!(store.get(i).unwrap().is_some());
        }
    }

    #[test]
    fn test_worker_stops_on_drop() {
        let store = Arc::new(MultiShardStore::ephemeral(config()).unwrap());
        let worker = MaintenanceWorker::spawn(&store).unwrap();
        let tx = worker.sender();
        drop(worker);
        // поток завершён - отправка в пустоту не паникует
        let _ = tx.send(MaintenanceTask::Compact);
    }
}
