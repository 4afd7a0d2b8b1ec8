//! Simulation controller.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use uuid::Uuid;

use latchkey_common::OwnerId;
use latchkey_limiter::RateLimiterManager;
use latchkey_lock::{DistributedLock, LockClient, LockConfig};
use latchkey_store::InMemoryStore;

use crate::metrics::{Outcome, ScenarioRecorder, ScenarioReport};
use crate::scenario::{Scenario, ScenarioKind};

/// Wait budget of every contended acquisition.
const ACQUIRE_BUDGET: Duration = Duration::from_secs(10);
/// Gap between fair-lock arrivals, long enough for each to enqueue.
const ARRIVAL_GAP: Duration = Duration::from_millis(25);
/// Lease taken by the holder that disappears.
const ABANDONED_LEASE: Duration = Duration::from_millis(500);
const BUCKET_CAPACITY: u64 = 10;
const BUCKET_RATE: f64 = 20.0;

/// Controls the simulation.
///
/// Every worker gets its own [`LockClient`] or [`RateLimiterManager`], so
/// workers behave like separate processes sharing one store.
#[derive(Clone)]
pub struct SimulationController {
    /// Concurrent workers per scenario.
    workers: usize,
    /// Operations per worker.
    rounds: u32,
    store: Arc<InMemoryStore>,
    /// Keeps resource names of separate runs apart.
    run_id: Uuid,
    /// Random number generator.
    rng: Arc<Mutex<StdRng>>,
    /// Observations of the scenario in progress.
    recorder: Arc<Mutex<ScenarioRecorder>>,
}

impl SimulationController {
    /// Create a new simulation controller.
    pub fn new(workers: usize, rounds: u32, store_latency: Duration, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };

        Self {
            workers: workers.max(1),
            rounds: rounds.max(1),
            store: Arc::new(InMemoryStore::new().with_latency(store_latency)),
            run_id: Uuid::new_v4(),
            rng: Arc::new(Mutex::new(rng)),
            recorder: Arc::new(Mutex::new(ScenarioRecorder::new())),
        }
    }

    /// Run a scenario, failing if any coordination guarantee was broken.
    pub async fn run_scenario(&self, scenario: &Scenario) -> anyhow::Result<ScenarioReport> {
        info!("Running scenario: {} - {}", scenario.name, scenario.description);

        *self.recorder.lock().await = ScenarioRecorder::new();
        let resource = format!("{}-{}", scenario.name, self.run_id);
        let started = Instant::now();

        match scenario.kind {
            ScenarioKind::MutexContention => self.mutex_contention(&resource).await?,
            ScenarioKind::FairOrder => self.fair_order(&resource).await?,
            ScenarioKind::ReadWrite => self.read_write(&resource).await?,
            ScenarioKind::RateLimit => self.rate_limit(&resource).await?,
            ScenarioKind::LeaseExpiry => self.lease_expiry(&resource).await?,
        }

        let report = self
            .recorder
            .lock()
            .await
            .report(&scenario.name, started.elapsed());
        info!(
            scenario = %report.scenario,
            elapsed_ms = report.elapsed_ms,
            granted = report.granted.count,
            timed_out = report.timed_out.count,
            grant_rate = report.grant_rate(),
            mean_wait_ms = report.granted.mean_ms,
            p50_wait_ms = report.granted.p50_ms,
            p99_wait_ms = report.granted.p99_ms,
            max_wait_ms = report.granted.max_ms,
            violations = report.violations.len(),
            "Scenario finished"
        );

        if !report.passed() {
            anyhow::bail!(
                "Scenario {} observed {} violations: {}",
                scenario.name,
                report.violations.len(),
                report.violations.join("; ")
            );
        }

        Ok(report)
    }

    async fn mutex_contention(&self, name: &str) -> anyhow::Result<()> {
        let inside = Arc::new(AtomicUsize::new(0));
        let mut tasks = Vec::with_capacity(self.workers);

        for worker in 0..self.workers {
            let client = self.client()?;
            let sim = self.clone();
            let inside = inside.clone();
            let name = name.to_string();

            tasks.push(tokio::spawn(async move {
                let lock = client.mutex(&name);
                let owner = client.owner(format!("worker-{}", worker));

                for _ in 0..sim.rounds {
                    if !sim.timed_lock(&lock, &owner).await? {
                        continue;
                    }
                    if inside.fetch_add(1, Ordering::SeqCst) != 0 {
                        sim.violation("two workers inside the mutex").await;
                    }
                    sim.pause(5).await;
                    inside.fetch_sub(1, Ordering::SeqCst);
                    lock.unlock(&owner).await?;
                }

                client.shutdown();
                Ok::<_, anyhow::Error>(())
            }));
        }

        join_workers(tasks).await
    }

    async fn fair_order(&self, name: &str) -> anyhow::Result<()> {
        let gatekeeper = self.client()?;
        let gate = gatekeeper.fair_lock(name);
        let holder = gatekeeper.owner("gatekeeper");
        gate.lock(&holder).await?;

        let order = Arc::new(Mutex::new(Vec::with_capacity(self.workers)));
        let mut tasks = Vec::with_capacity(self.workers);

        for worker in 0..self.workers {
            let client = self.client()?;
            let sim = self.clone();
            let order = order.clone();
            let name = name.to_string();

            tasks.push(tokio::spawn(async move {
                let lock = client.fair_lock(&name);
                let owner = client.owner(format!("worker-{}", worker));

                if sim.timed_lock(&lock, &owner).await? {
                    order.lock().await.push(worker);
                    sim.pause(3).await;
                    lock.unlock(&owner).await?;
                }

                client.shutdown();
                Ok::<_, anyhow::Error>(())
            }));

            tokio::time::sleep(ARRIVAL_GAP).await;
        }

        debug!(queued = gate.queue().await?.len(), "Releasing fair lock gate");
        gate.unlock(&holder).await?;
        join_workers(tasks).await?;
        gatekeeper.shutdown();

        let order = order.lock().await;
        info!(order = ?*order, "Fair lock grant order");
        if order.windows(2).any(|pair| pair[0] > pair[1]) {
            self.violation("fair lock served out of arrival order").await;
        }

        Ok(())
    }

    async fn read_write(&self, name: &str) -> anyhow::Result<()> {
        let readers = Arc::new(AtomicUsize::new(0));
        let writers = Arc::new(AtomicUsize::new(0));
        let mut tasks = Vec::with_capacity(self.workers);

        for worker in 0..self.workers {
            let client = self.client()?;
            let sim = self.clone();
            let readers = readers.clone();
            let writers = writers.clone();
            let name = name.to_string();

            tasks.push(tokio::spawn(async move {
                let rw = client.read_write_lock(&name);
                let owner = client.owner(format!("worker-{}", worker));

                for _ in 0..sim.rounds {
                    if worker % 4 == 0 {
                        let lock = rw.write_lock();
                        if !sim.timed_lock(&lock, &owner).await? {
                            continue;
                        }
                        let concurrent_writers = writers.fetch_add(1, Ordering::SeqCst);
                        if concurrent_writers != 0 || readers.load(Ordering::SeqCst) != 0 {
                            sim.violation("writer shares the read-write lock").await;
                        }
                        sim.pause(5).await;
                        writers.fetch_sub(1, Ordering::SeqCst);
                        lock.unlock(&owner).await?;
                    } else {
                        let lock = rw.read_lock();
                        if !sim.timed_lock(&lock, &owner).await? {
                            continue;
                        }
                        readers.fetch_add(1, Ordering::SeqCst);
                        if writers.load(Ordering::SeqCst) != 0 {
                            sim.violation("reader inside while a writer holds the lock").await;
                        }
                        sim.pause(5).await;
                        readers.fetch_sub(1, Ordering::SeqCst);
                        lock.unlock(&owner).await?;
                    }
                }

                client.shutdown();
                Ok::<_, anyhow::Error>(())
            }));
        }

        join_workers(tasks).await
    }

    async fn rate_limit(&self, name: &str) -> anyhow::Result<()> {
        let granted = Arc::new(AtomicU64::new(0));
        let started = Instant::now();
        let mut tasks = Vec::with_capacity(self.workers);

        for _ in 0..self.workers {
            let manager = RateLimiterManager::new(self.store.clone());
            let sim = self.clone();
            let granted = granted.clone();
            let name = name.to_string();

            tasks.push(tokio::spawn(async move {
                let limiter = manager
                    .create_if_absent(BUCKET_CAPACITY, BUCKET_RATE, &name)
                    .await?;

                for _ in 0..sim.rounds {
                    let attempt = Instant::now();
                    let outcome = if limiter.try_acquire(1, Duration::from_millis(50)).await? {
                        granted.fetch_add(1, Ordering::SeqCst);
                        Outcome::Granted
                    } else {
                        Outcome::TimedOut
                    };
                    sim.recorder.lock().await.record(outcome, attempt.elapsed());
                    sim.pause(10).await;
                }

                debug!(metrics = ?manager.metrics().snapshot(), "Limiter worker done");
                Ok::<_, anyhow::Error>(())
            }));
        }

        join_workers(tasks).await?;

        let granted = granted.load(Ordering::SeqCst);
        let budget = BUCKET_CAPACITY as f64 + BUCKET_RATE * started.elapsed().as_secs_f64();
        info!(granted, budget, "Rate limit budget");
        if granted as f64 > budget {
            self.violation("token bucket granted more than its budget").await;
        }

        Ok(())
    }

    async fn lease_expiry(&self, name: &str) -> anyhow::Result<()> {
        let crashed = self.client()?;
        let ghost = crashed.owner("crashed");
        crashed
            .mutex(name)
            .lock_with_lease(&ghost, ABANDONED_LEASE)
            .await?;
        drop(crashed);

        let survivor = self.client()?;
        let lock = survivor.mutex(name);
        let owner = survivor.owner("survivor");

        if lock.try_lock(&owner, Duration::ZERO, None).await? {
            self.violation("lock granted while the abandoned lease was live")
                .await;
            lock.unlock(&owner).await?;
        }

        if self.timed_lock(&lock, &owner).await? {
            lock.unlock(&owner).await?;
        } else {
            self.violation("abandoned lease never expired").await;
        }

        survivor.shutdown();
        Ok(())
    }

    fn client(&self) -> anyhow::Result<LockClient> {
        Ok(LockClient::new(self.store.clone(), LockConfig::from_env())?)
    }

    /// Try to lock within [`ACQUIRE_BUDGET`], recording the wait.
    async fn timed_lock<L>(&self, lock: &L, owner: &OwnerId) -> anyhow::Result<bool>
    where
        L: DistributedLock + ?Sized,
    {
        let started = Instant::now();
        let granted = lock.try_lock(owner, ACQUIRE_BUDGET, None).await?;

        let outcome = if granted {
            Outcome::Granted
        } else {
            Outcome::TimedOut
        };
        self.recorder.lock().await.record(outcome, started.elapsed());
        Ok(granted)
    }

    /// Sleep between 1 and `max_ms` milliseconds.
    async fn pause(&self, max_ms: u64) {
        let ms = self.rng.lock().await.gen_range(1..=max_ms);
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    async fn violation(&self, what: &str) {
        error!("Violation: {}", what);
        self.recorder.lock().await.violation(what);
    }
}

async fn join_workers(tasks: Vec<JoinHandle<anyhow::Result<()>>>) -> anyhow::Result<()> {
    for result in join_all(tasks).await {
        result??;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_every_scenario_holds_its_guarantees() {
        let controller = SimulationController::new(4, 3, Duration::from_millis(1), Some(7));

        for scenario in Scenario::all() {
            let report = controller.run_scenario(&scenario).await.unwrap();
            assert!(report.passed(), "{}: {:?}", scenario.name, report.violations);
            assert!(report.granted.count > 0, "{}", scenario.name);
        }
    }
}
