//! Tick and emergency orchestration.
//!
//! The controller is the only component that writes to the exchange.
//! A single async mutex serializes tick execution with emergency
//! handling; everything observable (cooldown clock, write latch) lives
//! behind that same lock.

use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::exchange::{
    EmergencySignal, ExchangeAdapter, ExchangeError, Position, SubscriptionSink,
};
use crate::history::{AccountSnapshot, AdjustmentRecord, HistorySink, LiquidationRecord};
use crate::notify::{Alert, Notifier};
use crate::risk::{
    EventDetector, LiquidationAssessment, LiquidationPlanner, RebalanceOutcome,
    RebalancePlanner, RiskEstimator, TargetAllocator,
};

/// Controller knobs lifted out of the full configuration.
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    /// Percent margin rate below which a position gets an emergency top-up
    pub emergency_margin_rate: Decimal,
    /// Smallest margin move worth executing
    pub min_adjustment_usdt: Decimal,
    /// Plan partial closes but never submit them
    pub liquidation_dry_run: bool,
}

/// What a liquidation evaluation did this tick.
#[derive(Debug, Clone, PartialEq)]
pub enum LiquidationReport {
    Disabled,
    InCooldown { remaining: Duration },
    NoGap,
    DryRun { planned: usize },
    Executed {
        success: u32,
        fail: u32,
        released: Decimal,
    },
}

/// Per-tick outcome summary.
#[derive(Debug, Default)]
pub struct TickReport {
    pub position_count: usize,
    pub rebalance: Option<RebalanceOutcome>,
    pub emergency_topups: Vec<String>,
    pub liquidation: Option<LiquidationReport>,
}

/// Result of driving one tick.
#[derive(Debug)]
pub enum TickOutcome {
    Completed(TickReport),
    /// Another tick or emergency held the lock; nothing ran.
    Skipped,
    /// A snapshot fetch failed; the tick was abandoned.
    Aborted(String),
}

struct ControllerState {
    /// Wall time of the last successful liquidation; never persisted
    last_liquidation: Option<Instant>,
    /// Cleared on auth failure, restored by the next successful fetch
    writes_enabled: bool,
}

/// Single writer for all exchange side effects.
pub struct Controller {
    exchange: Arc<dyn ExchangeAdapter>,
    stream: Arc<dyn SubscriptionSink>,
    history: Arc<dyn HistorySink>,
    notifier: Arc<dyn Notifier>,
    estimator: Arc<RiskEstimator>,
    allocator: TargetAllocator,
    rebalancer: RebalancePlanner,
    liquidator: LiquidationPlanner,
    detector: EventDetector,
    settings: ControllerSettings,
    state: Mutex<ControllerState>,
}

impl Controller {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        exchange: Arc<dyn ExchangeAdapter>,
        stream: Arc<dyn SubscriptionSink>,
        history: Arc<dyn HistorySink>,
        notifier: Arc<dyn Notifier>,
        estimator: Arc<RiskEstimator>,
        rebalancer: RebalancePlanner,
        liquidator: LiquidationPlanner,
        detector: EventDetector,
        settings: ControllerSettings,
    ) -> Self {
        Self {
            exchange,
            stream,
            history,
            notifier,
            estimator,
            allocator: TargetAllocator::new(),
            rebalancer,
            liquidator,
            detector,
            settings,
            state: Mutex::new(ControllerState {
                last_liquidation: None,
                writes_enabled: true,
            }),
        }
    }

    /// Run one full tick, waiting for the lock if necessary.
    pub async fn tick(&self) -> TickOutcome {
        let mut state = self.state.lock().await;
        self.tick_locked(&mut state).await
    }

    /// Run one tick unless a tick or emergency is already in progress,
    /// in which case skip rather than queue.
    pub async fn try_tick(&self) -> TickOutcome {
        match self.state.try_lock() {
            Ok(mut state) => self.tick_locked(&mut state).await,
            Err(_) => TickOutcome::Skipped,
        }
    }

    /// Focused top-up for one symbol, serialized with ticks. Never
    /// issues decreases on other positions; the tick path owns
    /// cross-position rebalancing.
    pub async fn handle_emergency(&self, symbol: &str) -> Option<Decimal> {
        let mut state = self.state.lock().await;

        let mut positions = match self.exchange.list_positions().await {
            Ok(positions) => positions,
            Err(e) => {
                self.fetch_failed(&mut state, "positions", &e);
                return None;
            }
        };
        let mut available = match self.exchange.available_derivatives_balance().await {
            Ok(balance) => balance,
            Err(e) => {
                self.fetch_failed(&mut state, "balance", &e);
                return None;
            }
        };
        state.writes_enabled = true;

        self.top_up(&mut positions, &mut available, symbol).await
    }

    /// Streaming entry point. Updates the last-price table, and on a
    /// spike shortens the weight-cache window and runs the emergency
    /// path for the affected symbol.
    pub async fn on_price(&self, symbol: &str, price: Decimal) {
        let Some(EmergencySignal::PriceSpike { symbol, from, to }) =
            self.detector.observe_price(symbol, price)
        else {
            return;
        };

        info!(%symbol, %from, %to, "price spike, preempting schedule");
        self.estimator.note_spike();
        self.handle_emergency(&symbol).await;
    }

    async fn tick_locked(&self, state: &mut ControllerState) -> TickOutcome {
        let mut positions = match self.exchange.list_positions().await {
            Ok(positions) => positions,
            Err(e) => return self.abort_tick(state, "positions", e),
        };
        let mut available = match self.exchange.available_derivatives_balance().await {
            Ok(balance) => balance,
            Err(e) => return self.abort_tick(state, "balance", e),
        };
        state.writes_enabled = true;

        let mut report = TickReport {
            position_count: positions.len(),
            ..TickReport::default()
        };

        if positions.is_empty() {
            debug!("no open positions");
            self.record_snapshot(&positions, available);
            self.stream.subscribe(Default::default()).await;
            return TickOutcome::Completed(report);
        }

        // The simulated cross-margin pool: everything attached plus
        // everything free.
        let total_margin: Decimal = positions.iter().map(|p| p.margin).sum();
        let budget = total_margin + available;

        let mut weights = HashMap::new();
        for position in &positions {
            if weights.contains_key(&position.symbol) {
                continue;
            }
            let weight = self.estimator.weight(&position.symbol).await;
            weights.insert(
                position.symbol.clone(),
                Decimal::from_f64(weight).unwrap_or(Decimal::ONE),
            );
        }

        let targets = self.allocator.allocate(&positions, budget, &weights);
        let plans = self.rebalancer.plan(&positions, &targets);

        if !plans.is_empty() && state.writes_enabled {
            let outcome = self
                .rebalancer
                .execute(self.exchange.as_ref(), self.history.as_ref(), &positions, &plans)
                .await;

            // Track executed moves locally so the emergency and
            // liquidation phases see post-rebalance margins without a
            // second fetch.
            for record in &outcome.records {
                if let Some(position) =
                    positions.iter_mut().find(|p| p.symbol == record.symbol)
                {
                    position.margin += record.delta;
                }
                available -= record.delta;
            }

            self.notifier.notify(&Alert::RebalanceSummary {
                success_count: outcome.success_count,
                fail_count: outcome.fail_count,
                total_moved: outcome.total_moved,
            });
            report.rebalance = Some(outcome);
        }

        for signal in self.detector.scan_snapshot(&positions, available) {
            match signal {
                EmergencySignal::PositionBelowThreshold { symbol } => {
                    if self
                        .top_up(&mut positions, &mut available, &symbol)
                        .await
                        .is_some()
                    {
                        report.emergency_topups.push(symbol);
                    }
                }
                EmergencySignal::AccountBelowWarning { rate } => {
                    self.notifier.notify(&Alert::AccountWarning { rate });
                }
                EmergencySignal::PriceSpike { .. } => {}
            }
        }

        report.liquidation = Some(self.evaluate_liquidation(state, &positions, available).await);

        self.record_snapshot(&positions, available);
        self.stream.subscribe(self.detector.high_risk(&positions)).await;

        TickOutcome::Completed(report)
    }

    async fn evaluate_liquidation(
        &self,
        state: &mut ControllerState,
        positions: &[Position],
        available: Decimal,
    ) -> LiquidationReport {
        let since_last = state.last_liquidation.map(|at| at.elapsed());
        let assessment = self.liquidator.assess(positions, available, since_last);

        let (gap, plans) = match assessment {
            LiquidationAssessment::Disabled => return LiquidationReport::Disabled,
            LiquidationAssessment::InCooldown { remaining } => {
                debug!(?remaining, "liquidation in cooldown");
                return LiquidationReport::InCooldown { remaining };
            }
            LiquidationAssessment::NoGap => return LiquidationReport::NoGap,
            LiquidationAssessment::Planned { gap, plans } => (gap, plans),
        };

        if self.settings.liquidation_dry_run {
            for plan in &plans {
                self.record_liquidation(plan, true);
            }
            self.notifier.notify(&Alert::LiquidationPending {
                symbols: plans.iter().map(|p| p.symbol.clone()).collect(),
                gap,
            });
            return LiquidationReport::DryRun {
                planned: plans.len(),
            };
        }

        let mut success = 0;
        let mut fail = 0;
        let mut released = Decimal::ZERO;

        for plan in &plans {
            let full_symbol = self.exchange.full_symbol(&plan.symbol);
            if self
                .exchange
                .close_position(&full_symbol, plan.side, plan.close_quantity)
                .await
            {
                success += 1;
                released += plan.estimated_released;
                self.record_liquidation(plan, false);
                self.notifier.notify(&Alert::LiquidationExecuted {
                    symbol: plan.symbol.clone(),
                    close_quantity: plan.close_quantity,
                    estimated_released: plan.estimated_released,
                });
            } else {
                warn!(symbol = %plan.symbol, "partial close failed");
                fail += 1;
            }
        }

        if success > 0 {
            state.last_liquidation = Some(Instant::now());
        }

        LiquidationReport::Executed {
            success,
            fail,
            released,
        }
    }

    /// Top a position up toward twice the emergency rate, bounded by
    /// the available balance and the minimum adjustment.
    async fn top_up(
        &self,
        positions: &mut [Position],
        available: &mut Decimal,
        symbol: &str,
    ) -> Option<Decimal> {
        let position = positions.iter_mut().find(|p| p.symbol == symbol)?;
        let margin_rate = position.margin_rate();

        let target_rate = self.settings.emergency_margin_rate * dec!(2);
        let target_margin = position.notional() * target_rate / dec!(100);
        let needed = target_margin - position.margin;
        if needed <= Decimal::ZERO {
            return None;
        }

        let delta = needed.min(*available);
        if delta <= Decimal::ZERO || delta < self.settings.min_adjustment_usdt {
            debug!(%symbol, %needed, available = %*available, "top-up below threshold");
            return None;
        }

        let full_symbol = self.exchange.full_symbol(symbol);
        if !self.exchange.adjust_margin(&full_symbol, delta).await {
            warn!(%symbol, %delta, "emergency top-up failed");
            return None;
        }

        position.margin += delta;
        *available -= delta;

        let record = AdjustmentRecord {
            timestamp: chrono::Utc::now(),
            symbol: symbol.to_string(),
            delta,
            margin_after: position.margin,
        };
        if let Err(e) = self.history.record_adjustment(&record) {
            warn!(error = %e, "history sink rejected top-up record");
        }

        self.notifier.notify(&Alert::EmergencyTopUp {
            symbol: symbol.to_string(),
            delta,
            margin_rate,
        });

        info!(%symbol, %delta, "emergency top-up executed");
        Some(delta)
    }

    fn record_liquidation(&self, plan: &crate::risk::PartialClose, dry_run: bool) {
        let record = LiquidationRecord {
            timestamp: chrono::Utc::now(),
            symbol: plan.symbol.clone(),
            close_quantity: plan.close_quantity,
            estimated_released: plan.estimated_released,
            dry_run,
        };
        if let Err(e) = self.history.record_liquidation(&record) {
            warn!(error = %e, "history sink rejected liquidation record");
        }
    }

    fn record_snapshot(&self, positions: &[Position], available: Decimal) {
        let total_margin: Decimal = positions.iter().map(|p| p.margin).sum();
        let total_equity: Decimal = positions
            .iter()
            .map(|p| p.margin + p.unrealized_pnl)
            .sum::<Decimal>()
            + available;

        let snapshot = AccountSnapshot {
            timestamp: chrono::Utc::now(),
            total_margin,
            available_balance: available,
            total_equity,
            position_count: positions.len() as u32,
        };
        if let Err(e) = self.history.record_snapshot(&snapshot) {
            warn!(error = %e, "history sink rejected snapshot");
        }
    }

    fn fetch_failed(&self, state: &mut ControllerState, scope: &str, error: &ExchangeError) {
        if matches!(error, ExchangeError::Auth(_)) {
            state.writes_enabled = false;
        }
        self.notifier.notify(&Alert::RetryExhausted {
            scope: scope.to_string(),
            detail: error.to_string(),
        });
        warn!(%scope, %error, "snapshot fetch failed");
    }

    fn abort_tick(
        &self,
        state: &mut ControllerState,
        scope: &str,
        error: ExchangeError,
    ) -> TickOutcome {
        self.fetch_failed(state, scope, &error);
        TickOutcome::Aborted(format!("{} fetch failed: {}", scope, error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        EmergencyConfig, LiquidationConfig, RebalanceConfig, VolatilityConfig,
    };
    use crate::exchange::{MockExchange, PositionSide, RecordedCall};
    use crate::history::MemoryHistory;
    use crate::notify::MemoryNotifier;
    use async_trait::async_trait;
    use std::collections::BTreeSet;
    use std::sync::Mutex as StdMutex;

    struct RecordingSink {
        sets: StdMutex<Vec<BTreeSet<String>>>,
    }

    impl RecordingSink {
        fn new() -> Self {
            Self {
                sets: StdMutex::new(Vec::new()),
            }
        }

        fn last(&self) -> Option<BTreeSet<String>> {
            self.sets.lock().unwrap().last().cloned()
        }
    }

    #[async_trait]
    impl SubscriptionSink for RecordingSink {
        async fn subscribe(&self, symbols: BTreeSet<String>) {
            self.sets.lock().unwrap().push(symbols);
        }
    }

    struct Harness {
        mock: Arc<MockExchange>,
        history: Arc<MemoryHistory>,
        notifier: Arc<MemoryNotifier>,
        sink: Arc<RecordingSink>,
        controller: Arc<Controller>,
    }

    fn harness(
        overrides: HashMap<String, f64>,
        liquidation: LiquidationConfig,
        dry_run: bool,
    ) -> Harness {
        let mock = Arc::new(MockExchange::new());
        let history = Arc::new(MemoryHistory::new());
        let notifier = Arc::new(MemoryNotifier::new());
        let sink = Arc::new(RecordingSink::new());

        let estimator = Arc::new(RiskEstimator::new(
            mock.clone(),
            &VolatilityConfig {
                weight_overrides: overrides,
                ..VolatilityConfig::default()
            },
        ));

        let controller = Arc::new(Controller::new(
            mock.clone(),
            sink.clone(),
            history.clone(),
            notifier.clone(),
            estimator,
            RebalancePlanner::new(RebalanceConfig {
                min_adjustment_usdt: dec!(50),
                min_deviation_pct: dec!(5),
            }),
            LiquidationPlanner::new(liquidation),
            EventDetector::new(EmergencyConfig {
                emergency_margin_rate: dec!(2),
                price_spike_pct: dec!(5),
                account_margin_rate_warning: dec!(150),
            }),
            ControllerSettings {
                emergency_margin_rate: dec!(2),
                min_adjustment_usdt: dec!(50),
                liquidation_dry_run: dry_run,
            },
        ));

        Harness {
            mock,
            history,
            notifier,
            sink,
            controller,
        }
    }

    fn disabled_liquidation() -> LiquidationConfig {
        LiquidationConfig::default()
    }

    fn position(
        symbol: &str,
        quantity: Decimal,
        price: Decimal,
        margin: Decimal,
    ) -> Position {
        Position {
            symbol: symbol.to_string(),
            side: PositionSide::Long,
            quantity,
            entry_price: price,
            current_price: price,
            margin,
            leverage: 10,
            unrealized_pnl: Decimal::ZERO,
        }
    }

    fn adjust_deltas(mock: &MockExchange) -> Vec<(String, Decimal)> {
        mock.calls()
            .into_iter()
            .filter_map(|call| match call {
                RecordedCall::AdjustMargin { full_symbol, delta } => {
                    Some((full_symbol, delta))
                }
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_tick_rebalances_decreases_first() {
        let h = harness(
            HashMap::from([("BTC".to_string(), 1.0), ("ETH".to_string(), 1.2)]),
            disabled_liquidation(),
            true,
        );
        h.mock.set_positions(vec![
            position("BTC", dec!(0.5), dec!(50000), dec!(400)),
            position("ETH", dec!(10), dec!(3000), dec!(400)),
        ]);
        h.mock.set_available(Decimal::ZERO);

        let outcome = h.controller.tick().await;

        let TickOutcome::Completed(report) = outcome else {
            panic!("expected Completed");
        };
        let rebalance = report.rebalance.expect("rebalance ran");
        assert_eq!(rebalance.success_count, 2);
        assert_eq!(rebalance.fail_count, 0);

        let deltas = adjust_deltas(&h.mock);
        assert_eq!(deltas.len(), 2);
        // BTC decrease first, ETH increase second
        assert_eq!(deltas[0].0, "tBTCF0:USTF0");
        assert!(deltas[0].1 < Decimal::ZERO);
        assert!((deltas[0].1.abs() - dec!(72.1311)).abs() < dec!(0.001));
        assert_eq!(deltas[1].0, "tETHF0:USTF0");
        assert!((deltas[1].1 - dec!(72.1311)).abs() < dec!(0.001));

        assert_eq!(h.history.adjustments.lock().unwrap().len(), 2);
        assert_eq!(h.history.snapshots.lock().unwrap().len(), 1);
        assert!(h
            .notifier
            .alerts
            .lock()
            .unwrap()
            .iter()
            .any(|a| matches!(a, Alert::RebalanceSummary { success_count: 2, .. })));
    }

    #[tokio::test]
    async fn test_tick_aborts_on_fetch_failure() {
        let h = harness(HashMap::new(), disabled_liquidation(), true);
        h.mock.set_positions(vec![position("BTC", dec!(1), dec!(50000), dec!(400))]);
        h.mock.set_fail_positions(true);

        let outcome = h.controller.tick().await;

        assert!(matches!(outcome, TickOutcome::Aborted(_)));
        assert!(adjust_deltas(&h.mock).is_empty());
        assert!(h.history.snapshots.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_positions_still_snapshots() {
        let h = harness(HashMap::new(), disabled_liquidation(), true);
        h.mock.set_available(dec!(1000));

        let outcome = h.controller.tick().await;

        assert!(matches!(outcome, TickOutcome::Completed(_)));
        assert_eq!(h.history.snapshots.lock().unwrap().len(), 1);
        assert_eq!(h.sink.last(), Some(BTreeSet::new()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_tick_is_skipped() {
        let h = harness(
            HashMap::from([("BTC".to_string(), 1.0), ("ETH".to_string(), 1.2)]),
            disabled_liquidation(),
            true,
        );
        h.mock.set_positions(vec![
            position("BTC", dec!(0.5), dec!(50000), dec!(400)),
            position("ETH", dec!(10), dec!(3000), dec!(400)),
        ]);
        h.mock.set_write_latency(Duration::from_millis(50));

        let controller = h.controller.clone();
        let running = tokio::spawn(async move { controller.tick().await });

        // Let the first tick reach its write
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = h.controller.try_tick().await;
        assert!(matches!(second, TickOutcome::Skipped));

        assert!(matches!(
            running.await.unwrap(),
            TickOutcome::Completed(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_emergencies_do_not_double_spend() {
        let h = harness(HashMap::new(), disabled_liquidation(), true);
        h.mock
            .set_positions(vec![position("BTC", dec!(1), dec!(50000), dec!(500))]);
        h.mock.set_available(dec!(5000));
        h.mock.set_write_latency(Duration::from_millis(20));

        let c1 = h.controller.clone();
        let c2 = h.controller.clone();
        let t1 = tokio::spawn(async move { c1.handle_emergency("BTC").await });
        let t2 = tokio::spawn(async move { c2.handle_emergency("BTC").await });
        let (r1, r2) = (t1.await.unwrap(), t2.await.unwrap());

        // Exactly one handler topped up; the second saw the repaired
        // margin rate and did nothing.
        assert_eq!(adjust_deltas(&h.mock).len(), 1);
        assert!(r1.is_some() ^ r2.is_some());
    }

    #[tokio::test]
    async fn test_emergency_topup_clamps_to_available() {
        let h = harness(HashMap::new(), disabled_liquidation(), true);
        // notional 50000, margin 500 -> rate 1%; target 4% needs 1500 more
        h.mock
            .set_positions(vec![position("BTC", dec!(1), dec!(50000), dec!(500))]);
        h.mock.set_available(dec!(1500));

        let delta = h.controller.handle_emergency("BTC").await;

        assert_eq!(delta, Some(dec!(1500)));
        assert_eq!(h.history.adjustments.lock().unwrap().len(), 1);
        assert!(h
            .notifier
            .alerts
            .lock()
            .unwrap()
            .iter()
            .any(|a| matches!(a, Alert::EmergencyTopUp { .. })));
    }

    #[tokio::test]
    async fn test_emergency_topup_honors_min_adjustment() {
        let h = harness(HashMap::new(), disabled_liquidation(), true);
        h.mock
            .set_positions(vec![position("BTC", dec!(1), dec!(50000), dec!(500))]);
        h.mock.set_available(dec!(30));

        let delta = h.controller.handle_emergency("BTC").await;

        assert_eq!(delta, None);
        assert!(adjust_deltas(&h.mock).is_empty());
    }

    #[tokio::test]
    async fn test_emergency_ignores_healthy_position() {
        let h = harness(HashMap::new(), disabled_liquidation(), true);
        // rate 5% -- already above 2x emergency rate
        h.mock
            .set_positions(vec![position("BTC", dec!(1), dec!(50000), dec!(2500))]);
        h.mock.set_available(dec!(5000));

        assert_eq!(h.controller.handle_emergency("BTC").await, None);
    }

    fn doge_liquidation(enabled: bool) -> LiquidationConfig {
        LiquidationConfig {
            enabled,
            dry_run: true,
            max_single_close_pct: dec!(25),
            cooldown_seconds: 30,
            safety_margin_multiplier: dec!(3),
            maintenance_margin_rate: dec!(0.005),
            priority: HashMap::from([("default".to_string(), 100)]),
        }
    }

    #[tokio::test]
    async fn test_dry_run_plans_but_never_closes() {
        let h = harness(HashMap::new(), doge_liquidation(true), true);
        // notional 1000, min_safe 15, margin 10, available 0 -> gap 5
        h.mock
            .set_positions(vec![position("DOGE", dec!(10000), dec!(0.1), dec!(10))]);

        let TickOutcome::Completed(report) = h.controller.tick().await else {
            panic!("expected Completed");
        };

        assert_eq!(
            report.liquidation,
            Some(LiquidationReport::DryRun { planned: 1 })
        );
        assert!(!h
            .mock
            .calls()
            .iter()
            .any(|c| matches!(c, RecordedCall::ClosePosition { .. })));
        assert!(h
            .notifier
            .alerts
            .lock()
            .unwrap()
            .iter()
            .any(|a| matches!(a, Alert::LiquidationPending { .. })));

        let records = h.history.liquidations.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].dry_run);
        assert_eq!(records[0].close_quantity, dec!(2500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_blocks_second_liquidation() {
        let mut config = doge_liquidation(true);
        config.dry_run = false;
        let h = harness(HashMap::new(), config, false);
        h.mock
            .set_positions(vec![position("DOGE", dec!(10000), dec!(0.1), dec!(10))]);

        let TickOutcome::Completed(first) = h.controller.tick().await else {
            panic!("expected Completed");
        };
        assert!(matches!(
            first.liquidation,
            Some(LiquidationReport::Executed { success: 1, .. })
        ));

        // 10 seconds later the gap persists but the cooldown holds
        tokio::time::advance(Duration::from_secs(10)).await;
        let TickOutcome::Completed(second) = h.controller.tick().await else {
            panic!("expected Completed");
        };
        assert!(matches!(
            second.liquidation,
            Some(LiquidationReport::InCooldown { .. })
        ));

        let closes = h
            .mock
            .calls()
            .iter()
            .filter(|c| matches!(c, RecordedCall::ClosePosition { .. }))
            .count();
        assert_eq!(closes, 1);
    }

    #[tokio::test]
    async fn test_high_risk_symbols_published() {
        let h = harness(HashMap::new(), disabled_liquidation(), true);
        // 3% margin rate: healthy for emergencies, but under the 4%
        // watch threshold
        h.mock
            .set_positions(vec![position("BTC", dec!(1), dec!(50000), dec!(1500))]);
        h.mock.set_available(Decimal::ZERO);

        let _ = h.controller.tick().await;

        let set = h.sink.last().expect("subscription published");
        assert!(set.contains("BTC"));
    }

    #[tokio::test]
    async fn test_spike_triggers_emergency_path() {
        let h = harness(HashMap::new(), disabled_liquidation(), true);
        h.mock
            .set_positions(vec![position("BTC", dec!(1), dec!(50000), dec!(500))]);
        h.mock.set_available(dec!(5000));

        // Baseline, then a 6% drop
        h.controller.on_price("BTC", dec!(50000)).await;
        h.controller.on_price("BTC", dec!(47000)).await;

        // The spike preempted the schedule and topped the position up
        assert_eq!(adjust_deltas(&h.mock).len(), 1);
    }
}
