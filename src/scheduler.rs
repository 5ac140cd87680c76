// Settle Node: multi-contract settlement engine for tokenized assets.
//
// Written in 2022 by
//     The Settle Node developers.
//
// Copyright (C) 2022 by the Settle Node developers, Switzerland.
//
// You should have received a copy of the MIT License along with this software.
// If not, see <https://opensource.org/licenses/MIT>.

//! Run-job-at-time-T scheduling consumed by the transfer state machine for
//! pending-transfer deadlines. One worker thread owns the clock; scheduling
//! and cancellation are synchronous against a shared job table.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use bitcoin::Txid;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};

use crate::protocol::Timestamp;

/// Identity of a scheduled job. Re-scheduling the same key replaces the
/// previous job.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct JobKey {
    pub kind: &'static str,
    pub txid: Txid,
}

impl std::fmt::Display for JobKey {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind, self.txid)
    }
}

/// A one-shot callback with an absolute deadline.
pub trait Job: Send {
    fn fire_at(&self) -> Timestamp;
    fn execute(self: Box<Self>);
}

/// Scheduler errors.
#[derive(Clone, PartialEq, Eq, Debug, Display, Error)]
#[display(doc_comments)]
pub enum SchedulerError {
    /// no job scheduled under this key.
    NotFound,
}

struct JobTable {
    jobs: HashMap<JobKey, Box<dyn Job>>,
    stopping: bool,
}

/// Deadline scheduler with a single firing thread.
pub struct Scheduler {
    table: Arc<Mutex<JobTable>>,
    ping: Sender<()>,
    worker: Option<JoinHandle<()>>,
}

impl Scheduler {
    pub fn start() -> Scheduler {
        let table = Arc::new(Mutex::new(JobTable {
            jobs: HashMap::new(),
            stopping: false,
        }));
        let (ping, wake) = bounded::<()>(1);
        let worker_table = Arc::clone(&table);
        let worker = std::thread::Builder::new()
            .name(s!("scheduler"))
            .spawn(move || run(worker_table, wake))
            .expect("unable to spawn the scheduler thread");
        Scheduler {
            table,
            ping,
            worker: Some(worker),
        }
    }

    /// Schedules `job` under `key`, replacing any job already scheduled
    /// under the same key.
    pub fn schedule_job(&self, key: JobKey, job: Box<dyn Job>) {
        trace!("Scheduling job {} at {}", key, job.fire_at());
        let mut table = self.table.lock().expect("scheduler mutex poisoned");
        table.jobs.insert(key, job);
        drop(table);
        let _ = self.ping.try_send(());
    }

    /// Cancels the job under `key`. An absent job is a notice, not a
    /// failure; re-cancelling is harmless.
    pub fn cancel_job(&self, key: &JobKey) -> Result<(), SchedulerError> {
        let mut table = self.table.lock().expect("scheduler mutex poisoned");
        match table.jobs.remove(key) {
            Some(_) => {
                trace!("Cancelled job {}", key);
                Ok(())
            }
            None => Err(SchedulerError::NotFound),
        }
    }

    /// Stops the worker thread after the current firing round.
    pub fn stop(mut self) {
        {
            let mut table = self.table.lock().expect("scheduler mutex poisoned");
            table.stopping = true;
        }
        let _ = self.ping.try_send(());
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn run(table: Arc<Mutex<JobTable>>, wake: Receiver<()>) {
    loop {
        let now = Timestamp::now();
        let mut due = vec![];
        let wait;
        {
            let mut locked = table.lock().expect("scheduler mutex poisoned");
            if locked.stopping {
                return;
            }
            let due_keys: Vec<JobKey> = locked
                .jobs
                .iter()
                .filter(|(_, job)| job.fire_at() <= now)
                .map(|(key, _)| key.clone())
                .collect();
            for key in due_keys {
                if let Some(job) = locked.jobs.remove(&key) {
                    due.push((key, job));
                }
            }
            wait = locked
                .jobs
                .values()
                .map(|job| job.fire_at().nanos().saturating_sub(now.nanos()))
                .min()
                .map(Duration::from_nanos)
                .unwrap_or_else(|| Duration::from_secs(1));
        }

        for (key, job) in due {
            debug!("Firing scheduled job {}", key);
            job.execute();
        }

        match wake.recv_timeout(wait) {
            Ok(()) | Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use bitcoin::hashes::Hash;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingJob {
        fire_at: Timestamp,
        counter: Arc<AtomicUsize>,
    }

    impl Job for CountingJob {
        fn fire_at(&self) -> Timestamp {
            self.fire_at
        }

        fn execute(self: Box<Self>) {
            self.counter.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn due_job_fires_once() {
        let scheduler = Scheduler::start();
        let counter = Arc::new(AtomicUsize::new(0));
        let key = JobKey {
            kind: "transfer-timeout",
            txid: Txid::hash(b"job"),
        };
        scheduler.schedule_job(
            key.clone(),
            Box::new(CountingJob {
                fire_at: Timestamp::now(),
                counter: Arc::clone(&counter),
            }),
        );
        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        // already fired: cancel reports an absent job
        assert_eq!(scheduler.cancel_job(&key), Err(SchedulerError::NotFound));
        scheduler.stop();
    }

    #[test]
    fn cancelled_job_does_not_fire() {
        let scheduler = Scheduler::start();
        let counter = Arc::new(AtomicUsize::new(0));
        let key = JobKey {
            kind: "transfer-timeout",
            txid: Txid::hash(b"cancelled"),
        };
        scheduler.schedule_job(
            key.clone(),
            Box::new(CountingJob {
                fire_at: Timestamp::now().plus_secs(3600),
                counter: Arc::clone(&counter),
            }),
        );
        scheduler.cancel_job(&key).unwrap();
        assert_eq!(scheduler.cancel_job(&key), Err(SchedulerError::NotFound));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        scheduler.stop();
    }
}
