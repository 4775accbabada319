//! Cost ledger — token accounting, the spend-cap circuit breaker, and
//! pre-phase estimation.
//!
//! Every recorded sub-agent usage adds (fresh + cache-read + cache-creation)
//! input and output tokens to the build's running totals, bucketed by model
//! family. Money is `rust_decimal::Decimal` throughout; rates are per-token
//! dollar fractions. Crossing the warn fraction emits `cost_warning` once;
//! crossing the cap emits `cost_exceeded` and returns the fatal
//! `CostCapExceeded` error that unwinds to the conductor.

use rust_decimal::Decimal;
use rust_decimal::prelude::*;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

use crate::errors::BuildError;
use crate::events::{Broadcaster, BuildEvent};
use crate::llm::StreamUsage;
use crate::manifest::{Chunk, ManifestEntry};
use crate::store::{BuildStore, PhaseCost};

/// (input $/token, output $/token) keyed by model prefix.
fn pricing_table() -> &'static [(&'static str, (Decimal, Decimal))] {
    static TABLE: std::sync::OnceLock<Vec<(&'static str, (Decimal, Decimal))>> =
        std::sync::OnceLock::new();
    TABLE.get_or_init(|| {
        vec![
            ("claude-opus-4", (Decimal::new(15, 6), Decimal::new(75, 6))),
            ("claude-sonnet-4", (Decimal::new(3, 6), Decimal::new(15, 6))),
            ("claude-3-5-sonnet", (Decimal::new(3, 6), Decimal::new(15, 6))),
            ("claude-haiku", (Decimal::new(1, 6), Decimal::new(5, 6))),
        ]
    })
}

/// Unknown models are priced at Opus rates — the conservative choice.
pub fn token_rates(model: &str) -> (Decimal, Decimal) {
    for (prefix, rates) in pricing_table() {
        if model.starts_with(prefix) {
            return *rates;
        }
    }
    (Decimal::new(15, 6), Decimal::new(75, 6))
}

/// Map a model name to its UI bucket.
pub fn model_bucket(model: &str) -> &'static str {
    let lower = model.to_lowercase();
    if lower.contains("opus") {
        "opus"
    } else if lower.contains("haiku") {
        "haiku"
    } else {
        "sonnet"
    }
}

/// Price one usage record.
pub fn usage_cost(usage: &StreamUsage) -> Decimal {
    let (input_rate, output_rate) = token_rates(&usage.model);
    Decimal::from(usage.total_input()) * input_rate
        + Decimal::from(usage.output_tokens) * output_rate
}

#[derive(Default)]
struct LedgerState {
    running_cost: Decimal,
    api_calls: u64,
    tokens_in: u64,
    tokens_out: u64,
    warned: bool,
    last_ticker: Option<Instant>,
    model_tokens: HashMap<&'static str, (u64, u64)>,
}

/// Per-build spend accounting and the cap circuit breaker.
pub struct CostLedger {
    build_id: Uuid,
    user_id: Uuid,
    cap: Option<Decimal>,
    warn_pct: u8,
    ticker_interval: Duration,
    broadcaster: Arc<dyn Broadcaster>,
    store: Arc<dyn BuildStore>,
    state: Mutex<LedgerState>,
}

impl CostLedger {
    pub fn new(
        build_id: Uuid,
        user_id: Uuid,
        cap_usd: Option<f64>,
        warn_pct: u8,
        ticker_interval: Duration,
        broadcaster: Arc<dyn Broadcaster>,
        store: Arc<dyn BuildStore>,
    ) -> Self {
        let cap = cap_usd
            .filter(|c| *c > 0.0)
            .and_then(Decimal::from_f64);
        Self {
            build_id,
            user_id,
            cap,
            warn_pct,
            ticker_interval,
            broadcaster,
            store,
            state: Mutex::new(LedgerState::default()),
        }
    }

    pub fn cap(&self) -> Option<Decimal> {
        self.cap
    }

    pub async fn running_cost(&self) -> Decimal {
        self.state.lock().await.running_cost
    }

    /// (api_calls, tokens_in, tokens_out) so far.
    pub async fn totals(&self) -> (u64, u64, u64) {
        let state = self.state.lock().await;
        (state.api_calls, state.tokens_in, state.tokens_out)
    }

    /// Record one completed sub-agent call: persist the phase cost, add to
    /// the running totals, tick/warn as configured, and trip the breaker
    /// when the cap is crossed.
    pub async fn record_usage(&self, phase: &str, usage: &StreamUsage) -> Result<(), BuildError> {
        let cost = usage_cost(usage);
        let input_total = usage.total_input();

        self.store
            .record_phase_cost(
                self.build_id,
                PhaseCost {
                    phase: phase.to_string(),
                    input_tokens: input_total,
                    output_tokens: usage.output_tokens,
                    model: usage.model.clone(),
                    cost_usd: cost,
                },
            )
            .await?;

        let (should_tick, should_warn, breach) = {
            let mut state = self.state.lock().await;
            state.running_cost += cost;
            state.api_calls += 1;
            state.tokens_in += input_total;
            state.tokens_out += usage.output_tokens;
            let bucket = state.model_tokens.entry(model_bucket(&usage.model)).or_default();
            bucket.0 += input_total;
            bucket.1 += usage.output_tokens;

            let now = Instant::now();
            let should_tick = match state.last_ticker {
                Some(last) => now.duration_since(last) >= self.ticker_interval,
                None => true,
            };
            if should_tick {
                state.last_ticker = Some(now);
            }

            let mut should_warn = false;
            let mut breach = false;
            if let Some(cap) = self.cap {
                let warn_at = cap * Decimal::from(self.warn_pct) / Decimal::from(100u8);
                if state.running_cost >= warn_at && !state.warned {
                    state.warned = true;
                    should_warn = true;
                }
                breach = state.running_cost >= cap;
            }
            (should_tick, should_warn, breach)
        };

        if should_tick {
            self.emit_ticker().await;
        }
        if should_warn {
            self.emit_warning().await;
        }
        if breach {
            return Err(self.trip_breaker().await);
        }
        Ok(())
    }

    async fn emit_ticker(&self) {
        let state = self.state.lock().await;
        let pct_used = self
            .cap
            .filter(|c| !c.is_zero())
            .and_then(|c| (state.running_cost / c * Decimal::from(100u8)).to_f64())
            .unwrap_or(0.0);
        let model_tokens: Value = state
            .model_tokens
            .iter()
            .map(|(bucket, (input, output))| {
                (
                    bucket.to_string(),
                    json!({"input": input, "output": output, "total": input + output}),
                )
            })
            .collect::<serde_json::Map<String, Value>>()
            .into();

        let event = BuildEvent::CostTicker {
            total_cost_usd: state.running_cost.round_dp(6).to_string(),
            api_calls: state.api_calls,
            tokens_in: state.tokens_in,
            tokens_out: state.tokens_out,
            spend_cap: self.cap.map(|c| c.to_string()),
            pct_used: (pct_used * 10.0).round() / 10.0,
            model_tokens,
        };
        drop(state);
        self.broadcaster.send(self.user_id, event).await;
    }

    async fn emit_warning(&self) {
        let Some(cap) = self.cap else { return };
        let running = self.running_cost().await;
        let pct = (running / cap * Decimal::from(100u8))
            .to_f64()
            .unwrap_or(0.0);
        self.broadcaster
            .send(
                self.user_id,
                BuildEvent::CostWarning {
                    total_cost_usd: running.round_dp(6).to_string(),
                    spend_cap: cap.to_string(),
                    pct_used: (pct * 10.0).round() / 10.0,
                    message: format!(
                        "Build has reached {}% of ${cap:.2} spend cap",
                        pct.round()
                    ),
                },
            )
            .await;
    }

    /// Emit `cost_exceeded` and produce the fatal error. The conductor
    /// owns the failed transition; nothing below it catches this.
    async fn trip_breaker(&self) -> BuildError {
        let cap = self.cap.unwrap_or_default();
        let running = self.running_cost().await;
        self.broadcaster
            .send(
                self.user_id,
                BuildEvent::CostExceeded {
                    total_cost_usd: running.round_dp(6).to_string(),
                    spend_cap: cap.to_string(),
                    message: format!(
                        "Build stopped — cost ${running:.2} exceeded ${cap:.2} spend cap"
                    ),
                },
            )
            .await;
        BuildError::CostCapExceeded {
            spent: running.round_dp(2).to_string(),
            cap: cap.round_dp(2).to_string(),
        }
    }
}

/// Project a phase's execution cost before builders run. Deliberately
/// conservative so the user is never surprised: Coder at Opus rates over
/// estimated lines, planner and audit overhead at Sonnet rates, all
/// multiplied by a 1.3 retry/fix margin.
pub fn estimate_phase_cost(
    manifest: &[ManifestEntry],
    chunks: &[Chunk],
    spent_so_far: Decimal,
    cap: Option<Decimal>,
) -> Value {
    let total_files = manifest.len() as u64;
    let total_lines: u64 = manifest.iter().map(|e| e.estimated_lines as u64).sum();
    let num_chunks = chunks.len() as u64;

    let (opus_in, opus_out) = token_rates("claude-opus-4");
    let (sonnet_in, sonnet_out) = token_rates("claude-sonnet-4");

    // Coder: ~2K input + ~1.2 output tokens per estimated line, Opus rates.
    let coder_cost = Decimal::from(total_files * 2_000) * opus_in
        + Decimal::from(total_lines) * Decimal::new(12, 1) * opus_out;

    // Planner overhead: ~800 in + 400 out per chunk, Sonnet rates.
    let planner_cost = Decimal::from(num_chunks * 800) * sonnet_in
        + Decimal::from(num_chunks * 400) * sonnet_out;

    // Audit: ~1K in + 500 out per file, Sonnet rates.
    let audit_cost = Decimal::from(total_files * 1_000) * sonnet_in
        + Decimal::from(total_files * 500) * sonnet_out;

    let estimated = coder_cost + planner_cost + audit_cost;
    let estimated_high = estimated * Decimal::new(13, 1);

    let remaining = cap.map(|c| (c - spent_so_far).round_dp(4).to_string());

    json!({
        "files": total_files,
        "estimated_lines": total_lines,
        "chunks": num_chunks,
        "estimated_cost_low_usd": estimated.round_dp(4).to_string(),
        "estimated_cost_high_usd": estimated_high.round_dp(4).to_string(),
        "spent_so_far_usd": spent_so_far.round_dp(4).to_string(),
        "spend_cap_usd": cap.map(|c| c.to_string()),
        "remaining_budget_usd": remaining,
        "breakdown": {
            "coder_opus": coder_cost.round_dp(4).to_string(),
            "planning_sonnet": planner_cost.round_dp(4).to_string(),
            "audit_sonnet": audit_cost.round_dp(4).to_string(),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ChannelBroadcaster;
    use crate::manifest::FileAction;
    use crate::store::MemoryBuildStore;
    use rust_decimal_macros::dec;

    fn usage(model: &str, input: u64, output: u64) -> StreamUsage {
        StreamUsage {
            input_tokens: input,
            output_tokens: output,
            cache_read_input_tokens: 0,
            cache_creation_input_tokens: 0,
            model: model.to_string(),
        }
    }

    fn make_ledger(
        cap: Option<f64>,
    ) -> (Arc<ChannelBroadcaster>, Arc<MemoryBuildStore>, CostLedger, Uuid) {
        let broadcaster = Arc::new(ChannelBroadcaster::new());
        let store = Arc::new(MemoryBuildStore::new());
        let build_id = Uuid::new_v4();
        let user_id = Uuid::new_v4();
        let ledger = CostLedger::new(
            build_id,
            user_id,
            cap,
            80,
            Duration::from_secs(0),
            broadcaster.clone(),
            store.clone(),
        );
        (broadcaster, store, ledger, user_id)
    }

    #[test]
    fn test_token_rates_by_prefix() {
        assert_eq!(token_rates("claude-opus-4-20250514").0, dec!(0.000015));
        assert_eq!(token_rates("claude-sonnet-4-20250514").1, dec!(0.000015));
        // Unknown models get the conservative Opus rates.
        assert_eq!(token_rates("mystery-model").0, dec!(0.000015));
    }

    #[test]
    fn test_model_buckets() {
        assert_eq!(model_bucket("claude-opus-4-20250514"), "opus");
        assert_eq!(model_bucket("claude-haiku-3"), "haiku");
        assert_eq!(model_bucket("claude-sonnet-4"), "sonnet");
        assert_eq!(model_bucket("anything-else"), "sonnet");
    }

    #[test]
    fn test_usage_cost_is_exact_decimal() {
        let cost = usage_cost(&usage("claude-opus-4-20250514", 1_000, 1_000));
        assert_eq!(cost, dec!(0.090));
    }

    #[test]
    fn test_usage_cost_prices_cache_buckets() {
        let mut u = usage("claude-opus-4-20250514", 100, 0);
        u.cache_read_input_tokens = 400;
        u.cache_creation_input_tokens = 500;
        assert_eq!(usage_cost(&u), dec!(0.015));
    }

    #[tokio::test]
    async fn test_record_accumulates_and_persists() {
        let (_b, store, ledger, _user) = make_ledger(Some(100.0));
        ledger
            .record_usage("Phase 1", &usage("claude-opus-4-20250514", 1_000, 500))
            .await
            .unwrap();
        ledger
            .record_usage("Phase 1", &usage("claude-sonnet-4-20250514", 2_000, 100))
            .await
            .unwrap();

        let (calls, tokens_in, tokens_out) = ledger.totals().await;
        assert_eq!(calls, 2);
        assert_eq!(tokens_in, 3_000);
        assert_eq!(tokens_out, 600);

        let costs = store.phase_costs(ledger.build_id).await;
        assert_eq!(costs.len(), 2);
        assert_eq!(costs[0].phase, "Phase 1");
    }

    #[tokio::test]
    async fn test_warning_fires_once() {
        let (broadcaster, _s, ledger, user) = make_ledger(Some(0.10));
        let mut rx = broadcaster.subscribe(user).await;

        // 0.0525 of a 0.10 cap (52%) — no warning yet.
        ledger
            .record_usage("Phase 1", &usage("claude-opus-4-20250514", 1_000, 500))
            .await
            .unwrap();
        // +0.03 — 82%, warning fires.
        ledger
            .record_usage("Phase 1", &usage("claude-opus-4-20250514", 2_000, 0))
            .await
            .unwrap();
        // Another record at 80%+ must not warn again (still under cap).
        ledger
            .record_usage("Phase 1", &usage("claude-sonnet-4-20250514", 100, 0))
            .await
            .unwrap();

        let mut warnings = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, BuildEvent::CostWarning { .. }) {
                warnings += 1;
            }
        }
        assert_eq!(warnings, 1);
    }

    #[tokio::test]
    async fn test_cap_breach_emits_and_raises() {
        let (broadcaster, _s, ledger, user) = make_ledger(Some(0.05));
        let mut rx = broadcaster.subscribe(user).await;

        let err = ledger
            .record_usage("Phase 1", &usage("claude-opus-4-20250514", 1_000, 1_000))
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::CostCapExceeded { .. }));

        let mut saw_exceeded = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, BuildEvent::CostExceeded { .. }) {
                saw_exceeded = true;
            }
        }
        assert!(saw_exceeded);
    }

    #[tokio::test]
    async fn test_no_cap_never_trips() {
        let (_b, _s, ledger, _user) = make_ledger(None);
        ledger
            .record_usage("Phase 1", &usage("claude-opus-4-20250514", 1_000_000, 1_000_000))
            .await
            .unwrap();
        assert!(ledger.cap().is_none());
    }

    #[test]
    fn test_estimate_breakdown_and_margin() {
        let manifest = vec![
            ManifestEntry::new("a.py", FileAction::Create, "models", 100),
            ManifestEntry::new("b.py", FileAction::Create, "routes", 100),
        ];
        let chunks = vec![Chunk::new("core", vec!["a.py".into(), "b.py".into()])];

        let estimate = estimate_phase_cost(&manifest, &chunks, dec!(1.0), Some(dec!(10.0)));
        assert_eq!(estimate["files"], 2);
        assert_eq!(estimate["estimated_lines"], 200);
        assert_eq!(estimate["chunks"], 1);
        assert_eq!(estimate["remaining_budget_usd"], "9.0000");

        let low: f64 = estimate["estimated_cost_low_usd"]
            .as_str()
            .unwrap()
            .parse()
            .unwrap();
        let high: f64 = estimate["estimated_cost_high_usd"]
            .as_str()
            .unwrap()
            .parse()
            .unwrap();
        // Rounded to 4dp, so allow a loose margin check.
        assert!((high / low - 1.3).abs() < 0.01);
    }
}
