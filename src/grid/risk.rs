//! Risk manager - drawdown and volatility gate
//!
//! The manager never touches orders. It only answers whether new orders may
//! be placed, and resumes automatically once both limits clear.

use std::collections::VecDeque;

use log::{info, warn};

use super::config::RiskConfig;
use super::types::{PauseReason, RiskState};

/// One observation period
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriceBar {
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

impl PriceBar {
    pub fn new(high: f64, low: f64, close: f64) -> Self {
        Self { high, low, close }
    }

    /// Bar for a single price observation
    pub fn flat(price: f64) -> Self {
        Self::new(price, price, price)
    }

    /// max(high - low, |high - prev_close|, |low - prev_close|)
    pub fn true_range(&self, prev_close: f64) -> f64 {
        (self.high - self.low)
            .max((self.high - prev_close).abs())
            .max((self.low - prev_close).abs())
    }
}

/// Fixed-size rolling window of bars
#[derive(Debug, Clone)]
pub struct PriceHistory {
    bars: VecDeque<PriceBar>,
    capacity: usize,
}

impl PriceHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2);
        Self {
            bars: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Window sized for an ATR period (twice the period)
    pub fn for_atr_period(atr_period: usize) -> Self {
        Self::new(atr_period.saturating_mul(2))
    }

    pub fn push_bar(&mut self, bar: PriceBar) {
        if self.bars.len() == self.capacity {
            self.bars.pop_front();
        }
        self.bars.push_back(bar);
    }

    pub fn push_price(&mut self, price: f64) {
        self.push_bar(PriceBar::flat(price));
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn latest_close(&self) -> Option<f64> {
        self.bars.back().map(|b| b.close)
    }

    /// Average true range over the last `period` bars.
    ///
    /// Needs `period + 1` bars since every true range uses the previous close.
    pub fn atr(&self, period: usize) -> Option<f64> {
        if period == 0 || self.bars.len() < period + 1 {
            return None;
        }

        let start = self.bars.len() - period;
        let sum: f64 = (start..self.bars.len())
            .map(|i| self.bars[i].true_range(self.bars[i - 1].close))
            .sum();
        Some(sum / period as f64)
    }
}

/// Tracks equity peak, drawdown and volatility, and decides pausing
#[derive(Debug, Clone)]
pub struct RiskManager {
    config: RiskConfig,
    state: RiskState,
    max_drawdown_seen: f64,
    pauses: u32,
    drawdown_warned: bool,
}

impl RiskManager {
    pub fn new(config: RiskConfig) -> Self {
        Self {
            config,
            state: RiskState::unrestricted(),
            max_drawdown_seen: 0.0,
            pauses: 0,
            drawdown_warned: false,
        }
    }

    /// Recompute the risk state from current equity and recent prices
    pub fn evaluate(&mut self, equity_now: f64, history: &PriceHistory) -> RiskState {
        let peak = if self.state.peak_equity > 0.0 {
            self.state.peak_equity.max(equity_now)
        } else {
            equity_now
        };
        let drawdown = if peak > 0.0 {
            ((peak - equity_now) / peak).max(0.0)
        } else {
            0.0
        };
        self.max_drawdown_seen = self.max_drawdown_seen.max(drawdown);

        let warn_level = self.config.max_drawdown * self.config.drawdown_warning_ratio;
        if drawdown > warn_level && drawdown <= self.config.max_drawdown {
            if !self.drawdown_warned {
                warn!(
                    "Drawdown {:.2}% approaching limit {:.2}%",
                    drawdown * 100.0,
                    self.config.max_drawdown * 100.0
                );
                self.drawdown_warned = true;
            }
        } else if drawdown <= warn_level {
            self.drawdown_warned = false;
        }

        let volatility = history.atr(self.config.atr_period);

        let reason = if drawdown > self.config.max_drawdown {
            Some(PauseReason::Drawdown {
                drawdown,
                limit: self.config.max_drawdown,
            })
        } else {
            self.volatility_breach(volatility, history.latest_close())
        };

        let was_paused = self.state.paused;
        self.state = RiskState {
            peak_equity: peak,
            current_drawdown: drawdown,
            current_volatility: volatility,
            paused: reason.is_some(),
            pause_reason: reason,
        };

        match (was_paused, reason) {
            (false, Some(reason)) => {
                self.pauses += 1;
                warn!("Risk pause: {}", reason);
            }
            (true, None) => info!("Risk limits cleared, resuming order placement"),
            _ => {}
        }

        self.state
    }

    /// ATR above `atr_threshold` percent of the latest close
    fn volatility_breach(&self, atr: Option<f64>, close: Option<f64>) -> Option<PauseReason> {
        if !self.config.volatility_pause {
            return None;
        }
        let (atr, close) = (atr?, close?);
        let threshold = self.config.atr_threshold * close / 100.0;
        (atr > threshold).then_some(PauseReason::Volatility { atr, threshold })
    }

    pub fn state(&self) -> RiskState {
        self.state
    }

    pub fn is_paused(&self) -> bool {
        self.state.paused
    }

    /// Largest drawdown observed so far
    pub fn max_drawdown_seen(&self) -> f64 {
        self.max_drawdown_seen
    }

    /// Number of transitions into the paused state
    pub fn pause_count(&self) -> u32 {
        self.pauses
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max_drawdown: f64, atr_period: usize) -> RiskConfig {
        RiskConfig {
            max_drawdown,
            atr_period,
            ..RiskConfig::default()
        }
    }

    #[test]
    fn test_true_range_uses_previous_close() {
        let bar = PriceBar::new(105.0, 101.0, 103.0);
        assert_eq!(bar.true_range(100.0), 5.0);
        assert_eq!(bar.true_range(104.0), 4.0);
        assert_eq!(bar.true_range(110.0), 9.0);
    }

    #[test]
    fn test_history_window_is_bounded() {
        let mut history = PriceHistory::for_atr_period(3);
        for p in 0..20 {
            history.push_price(100.0 + p as f64);
        }
        assert_eq!(history.len(), 6);
        assert_eq!(history.latest_close(), Some(119.0));
    }

    #[test]
    fn test_atr_needs_period_plus_one_bars() {
        let mut history = PriceHistory::for_atr_period(3);
        history.push_price(100.0);
        history.push_price(101.0);
        history.push_price(103.0);
        assert_eq!(history.atr(3), None);

        history.push_price(100.0);
        // TRs: 1, 2, 3
        assert!((history.atr(3).unwrap() - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_drawdown_sequence() {
        let mut risk = RiskManager::new(config(0.15, 14));
        let history = PriceHistory::for_atr_period(14);

        let expected = [(0.0, false), (0.10, false), (0.05, false), (0.20, true), (0.0, false)];
        for (equity, (drawdown, paused)) in [100.0, 90.0, 95.0, 80.0, 100.0].iter().zip(expected) {
            let state = risk.evaluate(*equity, &history);
            assert!((state.peak_equity - 100.0).abs() < 1e-12);
            assert!((state.current_drawdown - drawdown).abs() < 1e-12, "equity {}", equity);
            assert_eq!(state.paused, paused, "equity {}", equity);
        }

        assert!((risk.max_drawdown_seen() - 0.20).abs() < 1e-12);
        assert_eq!(risk.pause_count(), 1);
    }

    #[test]
    fn test_drawdown_pause_reason() {
        let mut risk = RiskManager::new(config(0.05, 14));
        let history = PriceHistory::for_atr_period(14);

        risk.evaluate(1000.0, &history);
        let state = risk.evaluate(900.0, &history);

        assert!(state.paused);
        assert!(matches!(state.pause_reason, Some(PauseReason::Drawdown { .. })));
    }

    #[test]
    fn test_peak_tracks_new_highs() {
        let mut risk = RiskManager::new(config(0.05, 14));
        let history = PriceHistory::for_atr_period(14);

        risk.evaluate(100.0, &history);
        risk.evaluate(120.0, &history);
        let state = risk.evaluate(114.0, &history);

        assert!((state.peak_equity - 120.0).abs() < 1e-12);
        assert!((state.current_drawdown - 0.05).abs() < 1e-12);
    }

    #[test]
    fn test_volatility_pause_and_resume() {
        let mut risk = RiskManager::new(config(0.5, 3));
        let mut history = PriceHistory::for_atr_period(3);

        // Swings of 4 on a ~100 price: ATR 4 > 2% of close
        for p in [100.0, 104.0, 100.0, 104.0] {
            history.push_price(p);
        }
        let state = risk.evaluate(1000.0, &history);
        assert!(state.paused);
        assert!(matches!(state.pause_reason, Some(PauseReason::Volatility { .. })));

        // Calm bars push the swings out of the ATR window
        for p in [104.2, 104.4, 104.6] {
            history.push_price(p);
        }
        let state = risk.evaluate(1000.0, &history);
        assert!(!state.paused);
        assert!(state.current_volatility.unwrap() < 1.0);
    }

    #[test]
    fn test_volatility_pause_can_be_disabled() {
        let mut risk = RiskManager::new(RiskConfig {
            volatility_pause: false,
            ..config(0.5, 3)
        });
        let mut history = PriceHistory::for_atr_period(3);
        for p in [100.0, 110.0, 100.0, 110.0] {
            history.push_price(p);
        }

        let state = risk.evaluate(1000.0, &history);
        assert!(!state.paused);
        assert!(state.current_volatility.is_some());
    }
}
