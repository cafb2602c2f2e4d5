//! Queue bookkeeping shared by both scheduling stages.

use std::collections::VecDeque;
use std::path::Path;

use tokio::task::JoinHandle;
use tracing::{error, warn};

use crate::registry::TaskRegistry;
use crate::task::TaskStatus;

/// A job that has been handed to a worker.
#[derive(Debug)]
pub struct RunningJob {
    pub index: usize,
    /// Position of the execution slot in the device list; always 0 for
    /// single-pool stages.
    pub slot: usize,
    handle: JoinHandle<()>,
}

/// The wait/running/done/error sets of one stage.
///
/// Only the driver touches these; workers only ever see their own task.
#[derive(Debug, Default)]
pub struct StageQueues {
    wait: VecDeque<usize>,
    running: Vec<RunningJob>,
    done: Vec<usize>,
    error: Vec<usize>,
}

impl StageQueues {
    pub fn seeded(indices: impl IntoIterator<Item = usize>) -> Self {
        Self {
            wait: indices.into_iter().collect(),
            ..Default::default()
        }
    }

    pub fn enqueue(&mut self, index: usize) {
        self.wait.push_back(index);
    }

    pub fn wait(&self) -> &VecDeque<usize> {
        &self.wait
    }

    pub fn running(&self) -> impl Iterator<Item = &RunningJob> {
        self.running.iter()
    }

    pub fn done(&self) -> &[usize] {
        &self.done
    }

    pub fn error(&self) -> &[usize] {
        &self.error
    }

    pub fn in_flight(&self) -> usize {
        self.running.len()
    }

    pub fn in_flight_on(&self, slot: usize) -> usize {
        self.running.iter().filter(|job| job.slot == slot).count()
    }

    /// Nothing waiting and nothing running.
    pub fn is_idle(&self) -> bool {
        self.wait.is_empty() && self.running.is_empty()
    }

    /// How many of the four sets hold `index`.
    pub fn membership(&self, index: usize) -> usize {
        self.wait.iter().filter(|&&i| i == index).count()
            + self.running.iter().filter(|job| job.index == index).count()
            + self.done.iter().filter(|&&i| i == index).count()
            + self.error.iter().filter(|&&i| i == index).count()
    }

    pub(crate) fn pop_wait(&mut self) -> Option<usize> {
        self.wait.pop_front()
    }

    pub(crate) fn start(&mut self, index: usize, slot: usize, handle: JoinHandle<()>) {
        self.running.push(RunningJob {
            index,
            slot,
            handle,
        });
    }

    pub(crate) fn reject(&mut self, index: usize) {
        self.error.push(index);
    }

    #[cfg(test)]
    pub(crate) fn mark_done(&mut self, index: usize) {
        self.done.push(index);
    }

    /// Move finished jobs out of running, in scan order, into done (if the
    /// task reached `success`) or error. A task that ends up in error without
    /// a terminal status, e.g. because its worker panicked, is forced to
    /// `failure`. Returns the newly done indices.
    pub(crate) async fn reclaim(
        &mut self,
        registry: &TaskRegistry,
        success: TaskStatus,
        failure: TaskStatus,
    ) -> Vec<usize> {
        let (finished, running): (Vec<_>, Vec<_>) = std::mem::take(&mut self.running)
            .into_iter()
            .partition(|job| job.handle.is_finished());
        self.running = running;

        let mut newly_done = Vec::new();
        for job in finished {
            let index = job.index;
            if let Err(e) = job.handle.await {
                error!(index, "worker did not complete: {e}");
            }
            let Some(shared) = registry.get(index) else {
                self.error.push(index);
                continue;
            };
            let mut task = shared.lock().await;
            if task.status == success {
                self.done.push(index);
                newly_done.push(index);
                continue;
            }
            if !task.status.is_terminal() {
                warn!(
                    source = %task.source.display(),
                    status = %task.status,
                    "worker left the task unfinished, marking it {failure}"
                );
                task.status = failure;
            }
            self.error.push(index);
        }
        newly_done
    }
}

/// Size of the file at `path`, or `None` if there is no such file.
pub(crate) async fn file_size(path: &Path) -> Option<u64> {
    tokio::fs::metadata(path)
        .await
        .ok()
        .filter(|md| md.is_file())
        .map(|md| md.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Task;
    use std::path::PathBuf;

    #[tokio::test]
    async fn reclaim_splits_by_final_status_in_scan_order() {
        let mut ok = Task::new(PathBuf::from("/a"), PathBuf::from("/a.far"), 1);
        ok.status = TaskStatus::DnagenDone;
        let mut bad = Task::new(PathBuf::from("/b"), PathBuf::from("/b.far"), 1);
        bad.status = TaskStatus::DnagenError;
        let mut late = Task::new(PathBuf::from("/c"), PathBuf::from("/c.far"), 1);
        late.status = TaskStatus::DnagenDone;
        let registry = TaskRegistry::from_tasks([ok, bad, late]);

        let mut queues = StageQueues::default();
        queues.start(1, 0, tokio::spawn(async {}));
        queues.start(0, 0, tokio::spawn(async {}));
        queues.start(2, 0, tokio::spawn(std::future::pending::<()>()));
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let newly_done = queues
            .reclaim(&registry, TaskStatus::DnagenDone, TaskStatus::DnagenError)
            .await;
        assert_eq!(newly_done, vec![0]);
        assert_eq!(queues.done(), &[0]);
        assert_eq!(queues.error(), &[1]);
        assert_eq!(queues.in_flight(), 1);
        for index in 0..3 {
            assert_eq!(queues.membership(index), 1);
        }
    }

    #[tokio::test]
    async fn panicked_worker_forces_the_failure_status() {
        let mut task = Task::new(PathBuf::from("/a"), PathBuf::from("/a.far"), 1);
        task.status = TaskStatus::CompressRunning;
        let registry = TaskRegistry::from_tasks([task]);

        let mut queues = StageQueues::default();
        queues.start(0, 0, tokio::spawn(async { panic!("encoder crashed") }));
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let newly_done = queues
            .reclaim(&registry, TaskStatus::CompressDone, TaskStatus::CompressError)
            .await;
        assert!(newly_done.is_empty());
        assert!(queues.done().is_empty());
        assert_eq!(queues.error(), &[0]);
        assert_eq!(registry.status(0).await, Some(TaskStatus::CompressError));
    }

    #[tokio::test]
    async fn missing_files_have_no_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.far");
        assert_eq!(file_size(&path).await, None);
        std::fs::write(&path, b"abcd").unwrap();
        assert_eq!(file_size(&path).await, Some(4));
        assert_eq!(file_size(dir.path()).await, None);
    }
}
