//! Token-budget rate limiting — sliding-window limiters and the key pool.
//!
//! One `TokenBudgetLimiter` per API key tracks tokens recorded in the last
//! 60 seconds. Before a call, `wait_for_budget` blocks until the window has
//! headroom; after a call, `record` logs actual usage. The `ApiKeyPool`
//! picks the least-loaded key per request so N keys reach ~N× throughput.
//!
//! Rate-limit accounting counts *all* input tokens — fresh, cache-read,
//! and cache-creation — because the provider meters every request token
//! against TPM regardless of cache hits. Caching reduces cost, not
//! rate-limit consumption.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::errors::LlmError;

/// Sliding window length.
const WINDOW: Duration = Duration::from_secs(60);

/// Fraction of the per-minute budget we allow before throttling.
const HEADROOM: f64 = 0.90;

/// Longest single sleep while throttled, so we re-check periodically.
const MAX_WAIT: Duration = Duration::from_secs(15);

/// Callback fired on every throttle wait:
/// `(wait_secs, input_used, input_tpm, output_used, output_tpm)`.
pub type PacingCallback = dyn Fn(f64, u64, u64, u64, u64) + Send + Sync;

#[derive(Debug, Default)]
struct History {
    entries: VecDeque<(Instant, u64, u64)>,
}

impl History {
    fn purge_old(&mut self, now: Instant) {
        while let Some(&(ts, _, _)) = self.entries.front() {
            if now.duration_since(ts) >= WINDOW {
                self.entries.pop_front();
            } else {
                break;
            }
        }
    }

    fn usage(&mut self, now: Instant) -> (u64, u64) {
        self.purge_old(now);
        let input = self.entries.iter().map(|e| e.1).sum();
        let output = self.entries.iter().map(|e| e.2).sum();
        (input, output)
    }
}

/// Sliding-window rate limiter tracking tokens per minute for one key.
pub struct TokenBudgetLimiter {
    input_tpm: u64,
    output_tpm: u64,
    history: Mutex<History>,
}

impl TokenBudgetLimiter {
    pub fn new(input_tpm: u64, output_tpm: u64) -> Self {
        Self {
            input_tpm,
            output_tpm,
            history: Mutex::new(History::default()),
        }
    }

    pub fn input_tpm(&self) -> u64 {
        self.input_tpm
    }

    /// Current (input, output) usage inside the window.
    pub async fn current_usage(&self) -> (u64, u64) {
        self.history.lock().await.usage(Instant::now())
    }

    /// Block until the minute window has budget for another call.
    ///
    /// Throttling is based only on *recorded* usage from prior calls. With
    /// no history at all the call proceeds immediately — we never block on
    /// an estimate alone (the bootstrapping rule; blocking on estimates
    /// would deadlock the first oversized call).
    pub async fn wait_for_budget(
        &self,
        estimated_input: u64,
        on_wait: Option<&PacingCallback>,
        cancel: Option<&CancellationToken>,
    ) -> Result<(), LlmError> {
        let mut history = self.history.lock().await;
        loop {
            let now = Instant::now();
            let (input_used, output_used) = history.usage(now);

            if history.entries.is_empty() {
                return Ok(());
            }

            let input_ok =
                ((input_used + estimated_input) as f64) < self.input_tpm as f64 * HEADROOM;
            let output_ok = (output_used as f64) < self.output_tpm as f64 * HEADROOM;
            if input_ok && output_ok {
                return Ok(());
            }

            // Sleep until the oldest entry ages out, capped so we re-check.
            let oldest = history.entries.front().map(|e| e.0).unwrap_or(now);
            let until_expiry = (oldest + WINDOW).saturating_duration_since(now);
            let wait = until_expiry.max(Duration::from_secs(1)).min(MAX_WAIT);

            if let Some(cb) = on_wait {
                cb(
                    wait.as_secs_f64(),
                    input_used,
                    self.input_tpm,
                    output_used,
                    self.output_tpm,
                );
            }
            tracing::info!(
                wait_secs = wait.as_secs_f64(),
                input_used,
                input_tpm = self.input_tpm,
                output_used,
                output_tpm = self.output_tpm,
                "token budget limiter: waiting"
            );

            match cancel {
                Some(token) => {
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        _ = token.cancelled() => return Err(LlmError::Cancelled),
                    }
                }
                None => tokio::time::sleep(wait).await,
            }
        }
    }

    /// Record actual token usage from a completed call. Never called for
    /// failed calls — the limiter only ever sees real spend.
    pub async fn record(&self, input_tokens: u64, output_tokens: u64) {
        let mut history = self.history.lock().await;
        history
            .entries
            .push_back((Instant::now(), input_tokens, output_tokens));
    }
}

/// A pool of keyed limiters. `best_key` returns the key whose limiter has
/// the most remaining input budget in the current window.
pub struct ApiKeyPool {
    keys: Vec<String>,
    limiters: Vec<Arc<TokenBudgetLimiter>>,
}

impl ApiKeyPool {
    /// Build a pool from keys, deduplicating while preserving order.
    /// Empty keys are dropped; at least one non-empty key is required.
    pub fn new(api_keys: &[String], input_tpm: u64, output_tpm: u64) -> Result<Self, LlmError> {
        let mut seen = std::collections::HashSet::new();
        let mut keys = Vec::new();
        for key in api_keys {
            if !key.is_empty() && seen.insert(key.clone()) {
                keys.push(key.clone());
            }
        }
        if keys.is_empty() {
            return Err(LlmError::Transport(
                "at least one non-empty API key is required".into(),
            ));
        }
        let limiters = keys
            .iter()
            .map(|_| Arc::new(TokenBudgetLimiter::new(input_tpm, output_tpm)))
            .collect();
        Ok(Self { keys, limiters })
    }

    pub fn key_count(&self) -> usize {
        self.keys.len()
    }

    /// The (key, limiter) pair with the most available input budget.
    pub async fn best_key(&self) -> (String, Arc<TokenBudgetLimiter>) {
        let mut best_idx = 0;
        let mut best_available = i128::MIN;
        for (idx, limiter) in self.limiters.iter().enumerate() {
            let (input_used, _) = limiter.current_usage().await;
            let available = limiter.input_tpm as i128 - input_used as i128;
            if available > best_available {
                best_available = available;
                best_idx = idx;
            }
        }
        (self.keys[best_idx].clone(), Arc::clone(&self.limiters[best_idx]))
    }

    /// Total (input, output) usage across all keys in the window.
    pub async fn aggregate_usage(&self) -> (u64, u64) {
        let mut total_in = 0;
        let mut total_out = 0;
        for limiter in &self.limiters {
            let (i, o) = limiter.current_usage().await;
            total_in += i;
            total_out += o;
        }
        (total_in, total_out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_bootstrap_rule_no_history_never_blocks() {
        let limiter = TokenBudgetLimiter::new(1000, 100);
        // Estimate wildly over the budget: with no history we proceed.
        limiter
            .wait_for_budget(1_000_000, None, None)
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocks_until_window_entry_ages_out() {
        let limiter = TokenBudgetLimiter::new(1000, 1000);
        // 95% of the input budget recorded — next call must wait.
        limiter.record(950, 0).await;

        let waits = Arc::new(AtomicU32::new(0));
        let waits_cb = Arc::clone(&waits);
        let on_wait = move |_: f64, _: u64, _: u64, _: u64, _: u64| {
            waits_cb.fetch_add(1, Ordering::SeqCst);
        };

        limiter.wait_for_budget(100, Some(&on_wait), None).await.unwrap();
        // Paused time auto-advances; the limiter had to sleep at least once
        // before the 60s window reclaimed the entry.
        assert!(waits.load(Ordering::SeqCst) >= 1);
        let (input_used, _) = limiter.current_usage().await;
        assert_eq!(input_used, 0, "entry should have aged out");
    }

    #[tokio::test]
    async fn test_proceeds_under_headroom() {
        let limiter = TokenBudgetLimiter::new(1000, 1000);
        limiter.record(100, 50).await;
        // 100 + 200 = 300 < 900 (90% headroom) — no wait needed.
        limiter.wait_for_budget(200, None, None).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_between_wait_iterations() {
        let limiter = Arc::new(TokenBudgetLimiter::new(1000, 1000));
        limiter.record(950, 0).await;

        let token = CancellationToken::new();
        token.cancel();
        let err = limiter
            .wait_for_budget(100, None, Some(&token))
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::Cancelled));
    }

    #[tokio::test]
    async fn test_pool_dedupes_and_rejects_empty() {
        let pool = ApiKeyPool::new(
            &["k1".into(), "k1".into(), "".into(), "k2".into()],
            1000,
            100,
        )
        .unwrap();
        assert_eq!(pool.key_count(), 2);

        assert!(ApiKeyPool::new(&["".into()], 1000, 100).is_err());
        assert!(ApiKeyPool::new(&[], 1000, 100).is_err());
    }

    #[tokio::test]
    async fn test_pool_picks_least_loaded_key() {
        let pool = ApiKeyPool::new(&["k1".into(), "k2".into()], 1000, 100).unwrap();

        // Load k1 heavily.
        let (first_key, first_limiter) = pool.best_key().await;
        assert_eq!(first_key, "k1");
        first_limiter.record(800, 0).await;

        let (second_key, _) = pool.best_key().await;
        assert_eq!(second_key, "k2");
    }

    #[tokio::test]
    async fn test_aggregate_usage_sums_keys() {
        let pool = ApiKeyPool::new(&["k1".into(), "k2".into()], 1000, 100).unwrap();
        let (_, l1) = pool.best_key().await;
        l1.record(100, 10).await;
        let (_, l2) = pool.best_key().await;
        l2.record(200, 20).await;

        let (input, output) = pool.aggregate_usage().await;
        assert_eq!(input, 300);
        assert_eq!(output, 30);
    }
}
