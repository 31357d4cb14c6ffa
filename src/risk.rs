use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskLimits {
    /// Drawdown against the peak-equity watermark, in percent (e.g. 5.0).
    pub max_drawdown_percent: f64,
    /// Absolute daily loss cap in quote currency.
    pub max_daily_loss: f64,
    /// Maximum position notional.
    pub max_position: f64,
    /// Cooldown applied after a loss/drawdown breach.
    pub cooldown_ms: i64,
}

/// Outcome of a trade-entry gate check.
#[derive(Debug, Clone, PartialEq)]
pub enum RiskVerdict {
    Allowed,
    Denied { reason: String },
}

impl RiskVerdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RiskVerdict::Allowed)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RiskSnapshot {
    pub peak_equity: f64,
    pub current_equity: f64,
    pub daily_pnl: f64,
    pub daily_reset_key: String,
    pub cooling_until: Option<i64>,
    pub total_trades: u64,
    pub win_trades: u64,
    pub loss_trades: u64,
    pub sum_win: f64,
    pub sum_loss: f64,
}

/// Gatekeeper for all trade entry decisions. Rules are evaluated in a fixed
/// order: daily rollover, cooldown, daily loss, drawdown, position cap. Only
/// the loss rules arm the cooldown; the position cap denies without it.
pub struct RiskController {
    limits: RiskLimits,
    peak_equity: f64,
    current_equity: f64,
    daily_pnl: f64,
    daily_reset_key: String,
    cooling_until: Option<i64>,
    total_trades: u64,
    win_trades: u64,
    loss_trades: u64,
    sum_win: f64,
    sum_loss: f64,
}

fn utc_date_key(now_ms: i64) -> String {
    Utc.timestamp_millis_opt(now_ms)
        .single()
        .map(|dt| dt.date_naive().to_string())
        .unwrap_or_default()
}

impl RiskController {
    pub fn new(limits: RiskLimits, initial_equity: f64, now_ms: i64) -> Self {
        Self {
            limits,
            peak_equity: initial_equity,
            current_equity: initial_equity,
            daily_pnl: 0.0,
            daily_reset_key: utc_date_key(now_ms),
            cooling_until: None,
            total_trades: 0,
            win_trades: 0,
            loss_trades: 0,
            sum_win: 0.0,
            sum_loss: 0.0,
        }
    }

    pub fn check_can_trade(&mut self, now_ms: i64, position_notional: f64) -> RiskVerdict {
        // 1. Daily rollover.
        let today = utc_date_key(now_ms);
        if today != self.daily_reset_key {
            log::info!(
                "[RISK] UTC day rolled over ({} -> {}), closing daily pnl at {:.4}",
                self.daily_reset_key, today, self.daily_pnl
            );
            self.daily_pnl = 0.0;
            self.daily_reset_key = today;
        }

        // 2. Cooldown.
        if let Some(until) = self.cooling_until {
            if until > now_ms {
                let remaining_s = (until - now_ms) as f64 / 1000.0;
                return RiskVerdict::Denied {
                    reason: format!("cooling down, {:.0}s remaining", remaining_s),
                };
            }
            self.cooling_until = None;
        }

        // 3. Daily loss.
        if self.daily_pnl <= -self.limits.max_daily_loss {
            self.cooling_until = Some(now_ms + self.limits.cooldown_ms);
            log::warn!(
                "[RISK] daily loss limit hit: pnl {:.4} <= -{:.4}, cooling {}ms",
                self.daily_pnl, self.limits.max_daily_loss, self.limits.cooldown_ms
            );
            return RiskVerdict::Denied {
                reason: "daily loss limit".to_string(),
            };
        }

        // 4. Drawdown against the peak-equity watermark.
        if self.peak_equity > 0.0 {
            let drawdown_pct = (self.peak_equity - self.current_equity) / self.peak_equity * 100.0;
            if drawdown_pct >= self.limits.max_drawdown_percent {
                self.cooling_until = Some(now_ms + self.limits.cooldown_ms);
                log::warn!(
                    "[RISK] drawdown {:.2}% >= {:.2}% (peak {:.2}, current {:.2}), cooling {}ms",
                    drawdown_pct, self.limits.max_drawdown_percent,
                    self.peak_equity, self.current_equity, self.limits.cooldown_ms
                );
                return RiskVerdict::Denied {
                    reason: format!("max drawdown ({:.2}%)", drawdown_pct),
                };
            }
        }

        // 5. Position cap — denies without arming the cooldown.
        if position_notional >= self.limits.max_position {
            return RiskVerdict::Denied {
                reason: format!(
                    "position cap: {:.2} >= {:.2}",
                    position_notional, self.limits.max_position
                ),
            };
        }

        RiskVerdict::Allowed
    }

    /// Accumulates a realized trade result into the daily pnl, equity and
    /// win/loss stats.
    pub fn record_pnl(&mut self, net: f64) {
        self.daily_pnl += net;
        self.current_equity += net;
        if self.current_equity > self.peak_equity {
            self.peak_equity = self.current_equity;
        }
        self.total_trades += 1;
        if net >= 0.0 {
            self.win_trades += 1;
            self.sum_win += net;
        } else {
            self.loss_trades += 1;
            self.sum_loss += net.abs();
        }
    }

    /// Overwrites equity with the exchange's figure so internal accounting
    /// cannot drift from reality.
    pub fn update_equity(&mut self, equity: f64) {
        self.current_equity = equity;
        if equity > self.peak_equity {
            self.peak_equity = equity;
        }
    }

    pub fn daily_pnl(&self) -> f64 {
        self.daily_pnl
    }

    pub fn cooling_until(&self) -> Option<i64> {
        self.cooling_until
    }

    pub fn snapshot(&self) -> RiskSnapshot {
        RiskSnapshot {
            peak_equity: self.peak_equity,
            current_equity: self.current_equity,
            daily_pnl: self.daily_pnl,
            daily_reset_key: self.daily_reset_key.clone(),
            cooling_until: self.cooling_until,
            total_trades: self.total_trades,
            win_trades: self.win_trades,
            loss_trades: self.loss_trades,
            sum_win: self.sum_win,
            sum_loss: self.sum_loss,
        }
    }
}
