//! Startup load and the jittered background refresh loop.
//!
//! The first fetch blocks startup. After that the table is re-fetched at an
//! interval drawn uniformly from `[min, max]`, re-drawn after every attempt,
//! so replicas started together drift apart. A failed fetch leaves the
//! store untouched; stale policy keeps being served until the next success.

use super::source::RuleSource;
use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{info, warn};
use ztgate_core::{FetchError, PolicyStore};

/// Pause between startup attempts, multiplied by the attempt number.
const INITIAL_BACKOFF: Duration = Duration::from_millis(500);

/// Result of one scheduled refresh.
#[derive(Debug)]
pub struct RefreshOutcome {
    /// New store version on success.
    pub result: Result<u64, FetchError>,
    /// When the next attempt is due.
    pub next_at: Instant,
}

pub struct PolicyRefresher {
    store: Arc<PolicyStore>,
    source: Arc<dyn RuleSource>,
    min: Duration,
    max: Duration,
}

impl PolicyRefresher {
    /// `min` and `max` are swapped if given in the wrong order.
    pub fn new(store: Arc<PolicyStore>, source: Arc<dyn RuleSource>, min: Duration, max: Duration) -> Self {
        let (min, max) = if min <= max { (min, max) } else { (max, min) };
        Self {
            store,
            source,
            min,
            max,
        }
    }

    pub fn store(&self) -> &Arc<PolicyStore> {
        &self.store
    }

    /// Fetch once and swap the whole table in.
    pub async fn refresh_once(&self) -> Result<u64, FetchError> {
        let table = self.source.fetch().await?;
        let rule_sets = table.compile(SystemTime::now());
        let identities = rule_sets.len();
        let rules: usize = rule_sets.values().map(|s| s.len()).sum();
        let version = self.store.replace_all(rule_sets);
        info!(version, identities, rules, "policy refreshed");
        Ok(version)
    }

    /// Blocking startup fetch, retried up to `attempts` times.
    pub async fn initial_load(&self, attempts: u32) -> Result<u64, FetchError> {
        let attempts = attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.refresh_once().await {
                Ok(version) => return Ok(version),
                Err(e) if attempt < attempts => {
                    warn!(attempt, attempts, error = %e, "initial policy fetch failed, retrying");
                    tokio::time::sleep(INITIAL_BACKOFF * attempt).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// A fresh interval in `[min, max]`.
    pub fn next_interval<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        let min = self.min.as_millis() as u64;
        let max = self.max.as_millis() as u64;
        Duration::from_millis(rng.gen_range(min..=max))
    }

    /// One scheduled refresh. Failures are logged and otherwise absorbed.
    pub async fn tick(&self) -> RefreshOutcome {
        let result = self.refresh_once().await;
        if let Err(ref e) = result {
            warn!(
                error = %e,
                version = self.store.version(),
                "policy refresh failed, serving last known-good snapshot"
            );
        }
        let interval = self.next_interval(&mut rand::thread_rng());
        RefreshOutcome {
            result,
            next_at: Instant::now() + interval,
        }
    }

    /// Refresh until `shutdown` flips to `true`.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut next_at = Instant::now() + self.next_interval(&mut rand::thread_rng());
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep_until(next_at) => {
                    next_at = self.tick().await.next_at;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("policy refresher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::Mutex;
    use ztgate_core::RuleTable;

    /// Hands out queued results, one per fetch.
    struct ScriptedSource {
        script: Mutex<Vec<Result<RuleTable, FetchError>>>,
    }

    impl ScriptedSource {
        fn new(mut script: Vec<Result<RuleTable, FetchError>>) -> Arc<Self> {
            script.reverse();
            Arc::new(Self {
                script: Mutex::new(script),
            })
        }
    }

    impl RuleSource for ScriptedSource {
        fn fetch(&self) -> Pin<Box<dyn Future<Output = Result<RuleTable, FetchError>> + Send + '_>> {
            let next = self
                .script
                .lock()
                .unwrap()
                .pop()
                .unwrap_or(Err(FetchError::Transport("script exhausted".into())));
            Box::pin(async move { next })
        }
    }

    fn table(json: &str) -> RuleTable {
        serde_json::from_str(json).unwrap()
    }

    fn allow_example() -> RuleTable {
        table(r#"{"rules":{"u1":{"domains":[{"pattern":"example.com","priority":1,"action":"allow"}]}}}"#)
    }

    fn refresher(source: Arc<dyn RuleSource>) -> PolicyRefresher {
        PolicyRefresher::new(
            Arc::new(PolicyStore::new()),
            source,
            Duration::from_secs(30),
            Duration::from_secs(90),
        )
    }

    #[tokio::test]
    async fn failed_refresh_keeps_snapshot() {
        let source = ScriptedSource::new(vec![Ok(allow_example()), Err(FetchError::Status(500))]);
        let r = refresher(source);
        let engine = ztgate_core::PolicyEngine::new(r.store().clone());

        let v1 = r.refresh_once().await.unwrap();
        assert!(engine.check("u1", "example.com"));

        let outcome = r.tick().await;
        assert!(matches!(outcome.result, Err(FetchError::Status(500))));
        assert_eq!(r.store().version(), v1);
        assert!(engine.check("u1", "example.com"));
        assert!(!engine.check("u2", "example.com"));
    }

    #[tokio::test]
    async fn next_tick_is_jittered_within_bounds() {
        let source = ScriptedSource::new(vec![Err(FetchError::Status(503))]);
        let r = refresher(source);

        let before = Instant::now();
        let outcome = r.tick().await;
        let after = Instant::now();
        assert!(outcome.next_at >= before + Duration::from_secs(30));
        assert!(outcome.next_at <= after + Duration::from_secs(90));
    }

    #[test]
    fn intervals_vary() {
        let r = refresher(ScriptedSource::new(vec![]));
        let mut rng = rand::thread_rng();
        let samples: Vec<Duration> = (0..64).map(|_| r.next_interval(&mut rng)).collect();
        assert!(samples
            .iter()
            .all(|d| *d >= Duration::from_secs(30) && *d <= Duration::from_secs(90)));
        assert!(samples.iter().any(|d| *d != samples[0]));
    }

    #[tokio::test]
    async fn initial_load_retries_then_succeeds() {
        let source = ScriptedSource::new(vec![
            Err(FetchError::Transport("refused".into())),
            Ok(allow_example()),
        ]);
        let r = refresher(source);
        r.initial_load(3).await.unwrap();
        assert_eq!(r.store().identity_count(), 1);
    }

    #[tokio::test]
    async fn initial_load_gives_up() {
        let source = ScriptedSource::new(vec![
            Err(FetchError::Status(502)),
            Err(FetchError::Status(502)),
        ]);
        let r = refresher(source);
        assert!(r.initial_load(2).await.is_err());
        assert_eq!(r.store().identity_count(), 0);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let r = Arc::new(refresher(ScriptedSource::new(vec![])));
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(r.run(rx));
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
