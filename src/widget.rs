use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use crossbeam_channel::{bounded, unbounded};
use parking_lot::{Condvar, Mutex};

use crate::embed::SlotContent;
use crate::links;
use crate::log::debug_log;
use crate::render::PlaceholderSpec;

#[derive(Debug, thiserror::Error)]
pub enum WidgetError {
    #[error("widget: script load failed: {0}")]
    LoadFailed(String),
    #[error("widget: readiness wait timed out")]
    Timeout,
}

/// Outcome of one tweet materialization attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum TweetOutcome {
    Rendered(String),
    Unavailable,
    TimedOut,
    ApiError(String),
}

/// Provider script seam. The real implementation injects the provider's
/// widget script into the host document; tests stub it.
pub trait WidgetScript: Send + Sync {
    /// Inject the script and block until its load signal fires.
    fn inject(&self) -> Result<()>;
    /// Whether the embed-creation entry point is callable yet. Scripts can
    /// finish loading before they finish initializing.
    fn embed_ready(&self) -> bool;
    /// Materialize one tweet. `Ok(Some(html))` rendered, `Ok(None)` means
    /// the provider had no content for that id.
    fn create_tweet(&self, tweet_id: &str) -> Result<Option<String>>;
}

#[derive(Debug, Clone)]
pub struct Config {
    /// How long concurrent callers wait for the in-flight load attempt.
    pub ready_timeout: Duration,
    /// Grace delay before rechecking a loaded-but-not-callable script.
    pub ready_grace: Duration,
    /// Per-batch budget for tweet materializations.
    pub tweet_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ready_timeout: Duration::from_secs(6),
            ready_grace: Duration::from_millis(500),
            tweet_timeout: Duration::from_secs(40),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GateState {
    Idle,
    Loading,
    Ready,
}

struct GateInner {
    state: GateState,
    attempt: u64,
}

/// Process-wide readiness gate and tweet batch driver. The script is
/// injected at most once per attempt; a failed attempt resets the gate so a
/// later call may retry, and rejects every waiter queued for that attempt.
pub struct WidgetLoader {
    cfg: Config,
    script: Arc<dyn WidgetScript>,
    gate: Mutex<GateInner>,
    gate_cond: Condvar,
    /// Slot ids already handled. Sticky across passes so no placeholder is
    /// ever retried against the provider.
    processed: Mutex<HashSet<String>>,
}

impl WidgetLoader {
    pub fn new(script: Arc<dyn WidgetScript>, cfg: Config) -> Self {
        Self {
            cfg,
            script,
            gate: Mutex::new(GateInner {
                state: GateState::Idle,
                attempt: 0,
            }),
            gate_cond: Condvar::new(),
            processed: Mutex::new(HashSet::new()),
        }
    }

    /// Wait for the provider to be ready, loading it if nobody has yet.
    /// Exactly one caller runs the injection; the rest block on the gate.
    pub fn ensure_ready(&self) -> Result<(), WidgetError> {
        let mut gate = self.gate.lock();
        match gate.state {
            GateState::Ready => return Ok(()),
            GateState::Loading => {
                let attempt = gate.attempt;
                let deadline = Instant::now() + self.cfg.ready_timeout;
                while gate.state == GateState::Loading && gate.attempt == attempt {
                    if self
                        .gate_cond
                        .wait_until(&mut gate, deadline)
                        .timed_out()
                    {
                        return Err(WidgetError::Timeout);
                    }
                }
                return match gate.state {
                    GateState::Ready => Ok(()),
                    _ => Err(WidgetError::LoadFailed(
                        "shared load attempt failed".into(),
                    )),
                };
            }
            GateState::Idle => {
                gate.state = GateState::Loading;
                gate.attempt += 1;
            }
        }
        drop(gate);

        let result = self.bootstrap();
        let mut gate = self.gate.lock();
        gate.state = if result.is_ok() {
            GateState::Ready
        } else {
            GateState::Idle
        };
        self.gate_cond.notify_all();
        result
    }

    fn bootstrap(&self) -> Result<(), WidgetError> {
        self.script
            .inject()
            .map_err(|err| WidgetError::LoadFailed(format!("{err:#}")))?;
        if self.script.embed_ready() {
            return Ok(());
        }
        // Loaded but not yet initialized: one grace recheck.
        thread::sleep(self.cfg.ready_grace);
        if self.script.embed_ready() {
            Ok(())
        } else {
            Err(WidgetError::LoadFailed(
                "embed entry point never became callable".into(),
            ))
        }
    }

    pub fn is_processed(&self, slot_id: &str) -> bool {
        self.processed.lock().contains(slot_id)
    }

    /// Materialize a batch of tweet placeholders. Each distinct tweet id is
    /// sent to the provider once even when duplicated across slots; every
    /// slot sharing the id receives the shared outcome. Returns the content
    /// to apply per slot id; already-processed slots are skipped.
    pub fn process_batch(&self, slots: &[PlaceholderSpec]) -> Vec<(String, SlotContent)> {
        let pending: Vec<&PlaceholderSpec> = {
            let processed = self.processed.lock();
            slots
                .iter()
                .filter(|spec| !processed.contains(&spec.slot_id))
                .collect()
        };
        if pending.is_empty() {
            return Vec::new();
        }

        if let Err(err) = self.ensure_ready() {
            debug_log(format!("widget: bootstrap failed, degrading batch: {err}"));
            let mut processed = self.processed.lock();
            return pending
                .into_iter()
                .map(|spec| {
                    processed.insert(spec.slot_id.clone());
                    (spec.slot_id.clone(), fallback_link(spec))
                })
                .collect();
        }

        let mut unique_ids = Vec::new();
        let mut seen = HashSet::new();
        for spec in &pending {
            if seen.insert(spec.resource.clone()) {
                unique_ids.push(spec.resource.clone());
            }
        }

        // Each id races the provider against the budget on its own thread;
        // a straggler provider call is abandoned by its racing thread once
        // the timeout fires, so every send arrives within the budget.
        let (tx, rx) = unbounded();
        for tweet_id in &unique_ids {
            let tx = tx.clone();
            let script = self.script.clone();
            let tweet_id = tweet_id.clone();
            let timeout = self.cfg.tweet_timeout;
            thread::spawn(move || {
                let outcome = create_tweet_with_timeout(script, &tweet_id, timeout);
                let _ = tx.send((tweet_id, outcome));
            });
        }
        drop(tx);

        let mut outcomes: HashMap<String, TweetOutcome> = HashMap::new();
        for (tweet_id, outcome) in rx {
            outcomes.insert(tweet_id, outcome);
        }

        let mut processed = self.processed.lock();
        pending
            .into_iter()
            .map(|spec| {
                let outcome = outcomes
                    .get(&spec.resource)
                    .cloned()
                    .unwrap_or(TweetOutcome::TimedOut);
                processed.insert(spec.slot_id.clone());
                (spec.slot_id.clone(), content_for(spec, &outcome))
            })
            .collect()
    }
}

/// Script seam for environments with no host document to inject into.
/// Every batch degrades to author link-outs.
pub struct DisabledScript;

impl WidgetScript for DisabledScript {
    fn inject(&self) -> Result<()> {
        Err(anyhow::anyhow!("widget: no host document to inject into"))
    }

    fn embed_ready(&self) -> bool {
        false
    }

    fn create_tweet(&self, _tweet_id: &str) -> Result<Option<String>> {
        Ok(None)
    }
}

/// Materialize one tweet, racing the provider call against a bounded wait.
pub fn create_tweet_with_timeout(
    script: Arc<dyn WidgetScript>,
    tweet_id: &str,
    timeout: Duration,
) -> TweetOutcome {
    let (tx, rx) = bounded(1);
    let id = tweet_id.to_string();
    thread::spawn(move || {
        let _ = tx.send(script.create_tweet(&id));
    });
    match rx.recv_timeout(timeout) {
        Ok(Ok(Some(html))) => TweetOutcome::Rendered(html),
        Ok(Ok(None)) => TweetOutcome::Unavailable,
        Ok(Err(err)) => TweetOutcome::ApiError(format!("{err:#}")),
        Err(_) => TweetOutcome::TimedOut,
    }
}

fn tweet_url(spec: &PlaceholderSpec) -> String {
    if spec.original_url.is_empty() {
        format!("https://twitter.com/i/status/{}", spec.resource)
    } else {
        spec.original_url.clone()
    }
}

fn fallback_link(spec: &PlaceholderSpec) -> SlotContent {
    let label = match links::tweet_author(&spec.original_url) {
        Some(author) => format!("View Tweet by @{author}"),
        None => "View Tweet".into(),
    };
    SlotContent::LinkOut {
        url: tweet_url(spec),
        label,
    }
}

fn content_for(spec: &PlaceholderSpec, outcome: &TweetOutcome) -> SlotContent {
    match outcome {
        TweetOutcome::Rendered(html) => SlotContent::Tweet { html: html.clone() },
        TweetOutcome::Unavailable => SlotContent::LinkOut {
            url: tweet_url(spec),
            label: "Tweet unavailable".into(),
        },
        TweetOutcome::TimedOut => SlotContent::LinkOut {
            url: tweet_url(spec),
            label: "Tweet took too long to load".into(),
        },
        TweetOutcome::ApiError(_) => SlotContent::LinkOut {
            url: tweet_url(spec),
            label: "Tweet failed to load".into(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::links::EmbedKind;
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct StubScript {
        injects: AtomicUsize,
        creates: AtomicUsize,
        fail_first_inject: AtomicBool,
        inject_delay: Duration,
        create_delay: Duration,
        tweet_html: Option<String>,
    }

    impl StubScript {
        fn ok() -> Self {
            Self {
                injects: AtomicUsize::new(0),
                creates: AtomicUsize::new(0),
                fail_first_inject: AtomicBool::new(false),
                inject_delay: Duration::ZERO,
                create_delay: Duration::ZERO,
                tweet_html: Some("<blockquote>hi</blockquote>".into()),
            }
        }
    }

    impl WidgetScript for StubScript {
        fn inject(&self) -> Result<()> {
            self.injects.fetch_add(1, Ordering::SeqCst);
            thread::sleep(self.inject_delay);
            if self.fail_first_inject.swap(false, Ordering::SeqCst) {
                return Err(anyhow!("network down"));
            }
            Ok(())
        }

        fn embed_ready(&self) -> bool {
            true
        }

        fn create_tweet(&self, _tweet_id: &str) -> Result<Option<String>> {
            self.creates.fetch_add(1, Ordering::SeqCst);
            thread::sleep(self.create_delay);
            Ok(self.tweet_html.clone())
        }
    }

    fn tweet_spec(slot_id: &str, tweet_id: &str) -> PlaceholderSpec {
        PlaceholderSpec {
            slot_id: slot_id.into(),
            kind: EmbedKind::Tweet,
            resource: tweet_id.into(),
            start_time: None,
            original_url: format!("https://twitter.com/someone/status/{tweet_id}"),
            attachment: None,
        }
    }

    #[test]
    fn concurrent_callers_share_one_injection() {
        let script = Arc::new(StubScript {
            inject_delay: Duration::from_millis(150),
            ..StubScript::ok()
        });
        let loader = Arc::new(WidgetLoader::new(script.clone(), Config::default()));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let loader = loader.clone();
            handles.push(thread::spawn(move || loader.ensure_ready()));
        }
        for handle in handles {
            assert!(handle.join().unwrap().is_ok());
        }
        assert_eq!(script.injects.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failed_load_leaves_gate_retryable() {
        let script = Arc::new(StubScript {
            fail_first_inject: AtomicBool::new(true),
            ..StubScript::ok()
        });
        let loader = WidgetLoader::new(script.clone(), Config::default());
        assert!(matches!(
            loader.ensure_ready(),
            Err(WidgetError::LoadFailed(_))
        ));
        assert!(loader.ensure_ready().is_ok());
        assert_eq!(script.injects.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn never_callable_script_fails_after_grace() {
        struct NeverReady;
        impl WidgetScript for NeverReady {
            fn inject(&self) -> Result<()> {
                Ok(())
            }
            fn embed_ready(&self) -> bool {
                false
            }
            fn create_tweet(&self, _tweet_id: &str) -> Result<Option<String>> {
                Ok(None)
            }
        }
        let loader = WidgetLoader::new(
            Arc::new(NeverReady),
            Config {
                ready_grace: Duration::from_millis(10),
                ..Config::default()
            },
        );
        assert!(matches!(
            loader.ensure_ready(),
            Err(WidgetError::LoadFailed(_))
        ));
    }

    #[test]
    fn batch_dedups_tweet_ids_and_marks_processed() {
        let script = Arc::new(StubScript::ok());
        let loader = WidgetLoader::new(script.clone(), Config::default());
        let specs = vec![
            tweet_spec("s1", "111"),
            tweet_spec("s2", "111"),
            tweet_spec("s3", "222"),
        ];

        let applied = loader.process_batch(&specs);
        assert_eq!(applied.len(), 3);
        assert_eq!(script.creates.load(Ordering::SeqCst), 2);
        assert!(applied
            .iter()
            .all(|(_, content)| matches!(content, SlotContent::Tweet { .. })));

        // Processed marks are sticky: a second pass does nothing.
        let again = loader.process_batch(&specs);
        assert!(again.is_empty());
        assert_eq!(script.creates.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn bootstrap_failure_degrades_to_author_links() {
        struct Broken;
        impl WidgetScript for Broken {
            fn inject(&self) -> Result<()> {
                Err(anyhow!("blocked"))
            }
            fn embed_ready(&self) -> bool {
                false
            }
            fn create_tweet(&self, _tweet_id: &str) -> Result<Option<String>> {
                Ok(None)
            }
        }
        let loader = WidgetLoader::new(Arc::new(Broken), Config::default());
        let applied = loader.process_batch(&[tweet_spec("s1", "333")]);
        assert_eq!(applied.len(), 1);
        match &applied[0].1 {
            SlotContent::LinkOut { url, label } => {
                assert!(url.contains("333"));
                assert_eq!(label, "View Tweet by @someone");
            }
            other => panic!("expected link-out, got {other:?}"),
        }
        assert!(loader.is_processed("s1"));
    }

    #[test]
    fn slow_tweet_times_out() {
        let script = Arc::new(StubScript {
            create_delay: Duration::from_millis(400),
            ..StubScript::ok()
        });
        let loader = WidgetLoader::new(
            script,
            Config {
                tweet_timeout: Duration::from_millis(50),
                ..Config::default()
            },
        );
        let applied = loader.process_batch(&[tweet_spec("s1", "444")]);
        assert!(matches!(
            &applied[0].1,
            SlotContent::LinkOut { label, .. } if label.contains("too long")
        ));
    }

    #[test]
    fn single_tweet_timeout_race() {
        let script = Arc::new(StubScript {
            create_delay: Duration::from_millis(400),
            ..StubScript::ok()
        });
        let outcome =
            create_tweet_with_timeout(script, "555", Duration::from_millis(50));
        assert_eq!(outcome, TweetOutcome::TimedOut);
    }
}
