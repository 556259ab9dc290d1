use crate::channel::{ExecutionChannel, ExecutionOutcome, Host};
use crate::job::Job;
use crate::notify::{LogNotifier, Notifier};
use crate::parse::parse_outcome;
use crate::probe::{admit_hosts, ProbeConfig};
use crossbeam_queue::SegQueue;
use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Sender};
use std::thread;
use std::time::{Duration, Instant};
use sweep_core::{OutcomeCounts, ResultRecord, ResultSet, UNKNOWN_ERROR_PREFIX};
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("no hosts configured")]
    NoHosts,
    #[error("no host passed the health probe ({probed} probed)")]
    NoHostsAvailable { probed: usize },
}

#[derive(Debug, Clone)]
pub struct BatchReport {
    /// One record per job, in job order.
    pub results: ResultSet,
    pub admitted_hosts: Vec<String>,
    pub jobs_per_host: BTreeMap<String, usize>,
    pub counts: OutcomeCounts,
    pub elapsed: Duration,
}

struct Completion {
    index: usize,
    host: String,
    record: ResultRecord,
}

/// Fans jobs out over one worker per admitted host and joins every outcome.
pub struct Scheduler {
    channel: Box<dyn ExecutionChannel>,
    hosts: Vec<Host>,
    probe: Option<ProbeConfig>,
    notifier: Box<dyn Notifier>,
}

impl Scheduler {
    /// Repeated host names are dropped so each host gets a single worker.
    pub fn new(channel: Box<dyn ExecutionChannel>, hosts: Vec<Host>) -> Self {
        let mut seen = BTreeSet::new();
        let hosts = hosts
            .into_iter()
            .filter(|h| seen.insert(h.name.clone()))
            .collect();
        Self {
            channel,
            hosts,
            probe: None,
            notifier: Box::new(LogNotifier),
        }
    }

    pub fn with_probe(mut self, probe: ProbeConfig) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn with_notifier(mut self, notifier: Box<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Hosts that pass the health probe, or every host when no probe is set.
    pub fn admitted_hosts(&self) -> Result<Vec<Host>, SchedulerError> {
        if self.hosts.is_empty() {
            return Err(SchedulerError::NoHosts);
        }
        let admitted = match &self.probe {
            Some(probe) => admit_hosts(self.channel.as_ref(), &self.hosts, probe),
            None => self.hosts.clone(),
        };
        if admitted.is_empty() {
            return Err(SchedulerError::NoHostsAvailable {
                probed: self.hosts.len(),
            });
        }
        Ok(admitted)
    }

    pub fn run(&self, jobs: Vec<Job>) -> Result<BatchReport, SchedulerError> {
        let admitted = self.admitted_hosts()?;
        let host_names = admitted.iter().map(|h| h.name.clone()).collect::<Vec<_>>();
        let total = jobs.len();
        let configurations = jobs
            .iter()
            .map(|j| j.configuration.clone())
            .collect::<Vec<_>>();

        self.notifier.batch_started(total, &host_names);
        let started = Instant::now();

        let queue = SegQueue::new();
        for entry in jobs.into_iter().enumerate() {
            queue.push(entry);
        }
        let progress = AtomicUsize::new(0);
        let mut slots: Vec<Option<ResultRecord>> = (0..total).map(|_| None).collect();
        let mut jobs_per_host: BTreeMap<String, usize> = BTreeMap::new();

        let (tx, rx) = mpsc::channel::<Completion>();
        thread::scope(|scope| {
            let handles = admitted
                .iter()
                .map(|host| {
                    let tx = tx.clone();
                    let channel = self.channel.as_ref();
                    let queue = &queue;
                    let progress = &progress;
                    scope.spawn(move || worker(host, channel, queue, tx, progress, total))
                })
                .collect::<Vec<_>>();
            drop(tx);

            for _ in 0..total {
                let Ok(done) = rx.recv() else {
                    break;
                };
                *jobs_per_host.entry(done.host).or_insert(0) += 1;
                slots[done.index] = Some(done.record);
            }

            for (host, handle) in admitted.iter().zip(handles) {
                if handle.join().is_err() {
                    error!(host = %host, "worker crashed");
                }
            }
        });

        // Anything a dead worker left in the queue still gets its row.
        while let Some((index, job)) = queue.pop() {
            warn!(configuration = %job.configuration, "job never claimed by a worker");
            slots[index] = Some(ResultRecord::failure(
                job.configuration,
                format!("{}no worker left to run the job", UNKNOWN_ERROR_PREFIX),
            ));
        }
        let results = slots
            .into_iter()
            .zip(configurations)
            .map(|(slot, configuration)| {
                slot.unwrap_or_else(|| {
                    ResultRecord::failure(
                        configuration,
                        format!("{}worker exited before reporting", UNKNOWN_ERROR_PREFIX),
                    )
                })
            })
            .collect::<ResultSet>();

        let counts = results.counts();
        let elapsed = started.elapsed();
        self.notifier.batch_finished(&counts, elapsed);

        Ok(BatchReport {
            results,
            admitted_hosts: host_names,
            jobs_per_host,
            counts,
            elapsed,
        })
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}

fn worker(
    host: &Host,
    channel: &dyn ExecutionChannel,
    queue: &SegQueue<(usize, Job)>,
    tx: Sender<Completion>,
    progress: &AtomicUsize,
    total: usize,
) {
    while let Some((index, job)) = queue.pop() {
        let input = job.input_payload();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            channel.execute(host, &job.command, &input, job.timeout)
        }))
        .unwrap_or_else(|payload| ExecutionOutcome::TransportError {
            message: format!("worker crashed: {}", panic_message(payload.as_ref())),
        });
        let kind = outcome.kind();
        let record = parse_outcome(&job, outcome);
        let done = progress.fetch_add(1, Ordering::SeqCst) + 1;
        info!(host = %host, outcome = kind, done = done, total = total, "job finished");
        let completion = Completion {
            index,
            host: host.name.clone(),
            record,
        };
        if tx.send(completion).is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::LocalChannel;
    use crate::job::jobs_for;
    use std::sync::{Arc, Mutex};
    use sweep_core::{ConfigValue, Configuration};

    const PROBE: &str = "probe-idle";

    /// Answers probes from a table and runs jobs with a per-host delay.
    struct FakeCluster {
        idle: BTreeMap<&'static str, &'static str>,
        delay_ms: BTreeMap<&'static str, u64>,
        panic_on: Option<i64>,
        in_flight: Arc<Mutex<BTreeMap<String, usize>>>,
        peak: Arc<Mutex<BTreeMap<String, usize>>>,
    }

    impl FakeCluster {
        fn new() -> Self {
            Self {
                idle: BTreeMap::new(),
                delay_ms: BTreeMap::new(),
                panic_on: None,
                in_flight: Arc::default(),
                peak: Arc::default(),
            }
        }

        fn host(mut self, name: &'static str, idle: &'static str, delay_ms: u64) -> Self {
            self.idle.insert(name, idle);
            self.delay_ms.insert(name, delay_ms);
            self
        }
    }

    impl ExecutionChannel for FakeCluster {
        fn execute(
            &self,
            host: &Host,
            command: &str,
            input: &[u8],
            _timeout: Duration,
        ) -> ExecutionOutcome {
            if command == PROBE {
                return ExecutionOutcome::Success {
                    stdout: format!("{}\n", self.idle.get(host.name.as_str()).unwrap_or(&"0")),
                    stderr: String::new(),
                };
            }
            let configs: Vec<Configuration> =
                serde_json::from_slice(input).expect("one-element array on stdin");
            if let (Some(target), Some(ConfigValue::Int(n))) =
                (self.panic_on, configs[0].get("instance"))
            {
                if *n == target {
                    panic!("lost connection to {}", host);
                }
            }
            let delay = self.delay_ms.get(host.name.as_str()).copied().unwrap_or(0);
            {
                let mut in_flight = self.in_flight.lock().expect("in flight");
                let now = in_flight.entry(host.name.clone()).or_insert(0);
                *now += 1;
                let mut peak = self.peak.lock().expect("peak");
                let top = peak.entry(host.name.clone()).or_insert(0);
                *top = (*top).max(*now);
            }
            thread::sleep(Duration::from_millis(delay));
            if let Some(now) = self.in_flight.lock().expect("in flight").get_mut(&host.name) {
                *now -= 1;
            }
            ExecutionOutcome::Success {
                stdout: format!("progress\n#\n[{{\"success\":true,\"host\":\"{}\"}}]\n", host),
                stderr: String::new(),
            }
        }
    }

    #[derive(Clone, Default)]
    struct RecordingNotifier {
        events: Arc<Mutex<Vec<String>>>,
    }

    impl Notifier for RecordingNotifier {
        fn batch_started(&self, job_count: usize, hosts: &[String]) {
            if let Ok(mut events) = self.events.lock() {
                events.push(format!("started {} {}", job_count, hosts.join(",")));
            }
        }

        fn batch_finished(&self, counts: &OutcomeCounts, _elapsed: Duration) {
            if let Ok(mut events) = self.events.lock() {
                events.push(format!("finished {}", counts.total));
            }
        }
    }

    fn instances(n: i64) -> Vec<Job> {
        let configs = (0..n)
            .map(|i| [("instance", ConfigValue::Int(i))].into_iter().collect())
            .collect::<Vec<Configuration>>();
        jobs_for(&configs, "searkt", Duration::from_secs(5))
    }

    fn probe() -> ProbeConfig {
        ProbeConfig {
            command: PROBE.to_string(),
            ..ProbeConfig::default()
        }
    }

    fn hosts(names: &[&str]) -> Vec<Host> {
        names.iter().map(|n| Host::new(*n)).collect()
    }

    #[test]
    fn repeated_host_gets_a_single_worker() {
        let cluster = FakeCluster::new().host("ai1", "99", 20).host("ai2", "99", 20);
        let peak = Arc::clone(&cluster.peak);
        let scheduler = Scheduler::new(Box::new(cluster), hosts(&["ai1", "ai1", "ai2", "ai1"]))
            .with_probe(probe());

        let report = scheduler.run(instances(8)).expect("run");
        assert_eq!(report.admitted_hosts, vec!["ai1", "ai2"]);
        assert!(report.jobs_per_host.len() <= 2);
        assert_eq!(report.jobs_per_host.values().sum::<usize>(), 8);
        let peak = peak.lock().expect("peak").clone();
        assert_eq!(peak.get("ai1"), Some(&1));
        assert_eq!(peak.get("ai2"), Some(&1));
    }

    #[test]
    fn busy_host_is_excluded_and_every_job_completes() {
        let cluster = FakeCluster::new()
            .host("ai1", "99", 1)
            .host("ai2", "95", 15)
            .host("ai3", "20", 0);
        let notifier = RecordingNotifier::default();
        let scheduler = Scheduler::new(Box::new(cluster), hosts(&["ai1", "ai2", "ai3"]))
            .with_probe(probe())
            .with_notifier(Box::new(notifier.clone()));

        let report = scheduler.run(instances(9)).expect("run");
        assert_eq!(report.admitted_hosts, vec!["ai1", "ai2"]);
        assert!(report.jobs_per_host.keys().all(|h| h != "ai3"));
        assert!(report.jobs_per_host.len() <= 2);
        assert_eq!(report.jobs_per_host.values().sum::<usize>(), 9);
        assert_eq!(report.results.len(), 9);
        assert_eq!(report.counts.succeeded, 9);
        for (i, record) in report.results.records().iter().enumerate() {
            assert_eq!(record.configuration.get("instance"), Some(&ConfigValue::Int(i as i64)));
        }

        let events = notifier.events.lock().expect("events").clone();
        assert_eq!(events, vec!["started 9 ai1,ai2", "finished 9"]);
    }

    #[test]
    fn no_idle_host_aborts_before_dispatch() {
        let cluster = FakeCluster::new().host("ai1", "10", 0).host("ai2", "50", 0);
        let notifier = RecordingNotifier::default();
        let scheduler = Scheduler::new(Box::new(cluster), hosts(&["ai1", "ai2"]))
            .with_probe(probe())
            .with_notifier(Box::new(notifier.clone()));
        let err = scheduler.run(instances(3)).expect_err("must abort");
        assert_eq!(err, SchedulerError::NoHostsAvailable { probed: 2 });
        assert!(notifier.events.lock().expect("events").is_empty());
    }

    #[test]
    fn empty_host_list_is_rejected() {
        let scheduler = Scheduler::new(Box::new(FakeCluster::new()), Vec::new());
        assert_eq!(scheduler.run(instances(1)).err(), Some(SchedulerError::NoHosts));
    }

    #[test]
    fn crashing_channel_becomes_transport_error_row() {
        let mut cluster = FakeCluster::new().host("ai1", "99", 0);
        cluster.panic_on = Some(2);
        let scheduler = Scheduler::new(Box::new(cluster), hosts(&["ai1"]));
        let report = scheduler.run(instances(4)).expect("run");
        assert_eq!(report.results.len(), 4);
        let crashed = &report.results.records()[2];
        assert!(!crashed.success);
        let msg = crashed.error_message.as_deref().unwrap_or("");
        assert!(msg.starts_with(UNKNOWN_ERROR_PREFIX), "{}", msg);
        assert!(msg.contains("lost connection"), "{}", msg);
        assert_eq!(report.counts.succeeded, 3);
        assert_eq!(report.counts.failed, 1);
    }

    #[test]
    fn never_ending_job_yields_one_timeout_row() {
        let configs: Vec<Configuration> = vec![[("instance", 0i64)].into_iter().collect()];
        let jobs = jobs_for(&configs, "sleep 30", Duration::from_millis(200));
        let scheduler = Scheduler::new(Box::new(LocalChannel), hosts(&["localhost"]));
        let report = scheduler.run(jobs).expect("run");
        assert_eq!(report.results.len(), 1);
        assert_eq!(
            report.results.records()[0].error_message.as_deref(),
            Some("timeout")
        );
        assert_eq!(report.counts.timed_out, 1);
    }

    #[test]
    fn local_executable_round_trip() {
        let configs: Vec<Configuration> = (0..3)
            .map(|i| [("instance", i as i64)].into_iter().collect())
            .collect();
        let command = concat!(
            "read line; echo \"got $line\"; ",
            "echo '#'; echo '[{\"success\":true,\"pathLength\":4}]'"
        );
        let jobs = jobs_for(&configs, command, Duration::from_secs(10));
        let scheduler = Scheduler::new(Box::new(LocalChannel), hosts(&["w1", "w2"]));
        let report = scheduler.run(jobs).expect("run");
        assert_eq!(report.counts.succeeded, 3);
        assert!(report
            .results
            .records()
            .iter()
            .all(|r| r.fields["pathLength"] == serde_json::json!(4)));
    }

    #[test]
    fn empty_batch_still_notifies_once() {
        let notifier = RecordingNotifier::default();
        let scheduler = Scheduler::new(Box::new(FakeCluster::new()), hosts(&["ai1"]))
            .with_notifier(Box::new(notifier.clone()));
        let report = scheduler.run(Vec::new()).expect("run");
        assert!(report.results.is_empty());
        let events = notifier.events.lock().expect("events").clone();
        assert_eq!(events, vec!["started 0 ai1", "finished 0"]);
    }
}
