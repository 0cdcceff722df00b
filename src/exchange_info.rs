// =============================================================================
// Exchange info — per-venue account snapshot and the combined risk view
// =============================================================================
//
// `VenueAccountInfo` carries one venue's margin, positions and thresholds;
// `CombinedSnapshot` merges same-symbol positions across venues into the
// hedged view the engines gate against.  All risk predicates live here so
// every consumer applies identical thresholds.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::chance_searcher::FundingOpportunity;
use crate::config::VenueRiskLimits;
use crate::types::{Position, Side};

// -----------------------------------------------------------------------------
// Per-venue info
// -----------------------------------------------------------------------------

/// One venue's account state at snapshot time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenueAccountInfo {
    pub exchange_code: String,
    pub taker_fee_rate: f64,
    pub maker_fee_rate: f64,
    pub limits: VenueRiskLimits,
    pub total_margin: f64,
    pub available_margin: f64,
    pub maintenance_margin_ratio: f64,
    pub positions: Vec<Position>,
    /// Seconds spent fetching this venue's data.
    pub time_cost_sec: f64,
}

impl VenueAccountInfo {
    /// Gross notional across all positions.
    pub fn total_notional(&self) -> f64 {
        self.positions.iter().map(|p| p.notional.abs()).sum()
    }

    pub fn leverage(&self) -> f64 {
        if self.total_margin != 0.0 {
            self.total_notional() / self.total_margin
        } else {
            0.0
        }
    }

    /// Fraction of margin currently committed (cross mode).
    pub fn cross_margin_usage(&self) -> f64 {
        if self.total_margin != 0.0 {
            1.0 - self.available_margin / self.total_margin
        } else {
            0.0
        }
    }

    pub fn total_funding_fee(&self) -> f64 {
        self.positions.iter().map(|p| p.funding_fee).sum()
    }

    pub fn total_unrealized_pnl(&self) -> f64 {
        self.positions.iter().map(|p| p.unrealized_pnl).sum()
    }

    pub fn position_for(&self, symbol: &str) -> Option<&Position> {
        self.positions.iter().find(|p| p.symbol == symbol)
    }

    /// Largest notional a new position may take on this venue.
    pub fn max_open_notional_value(&self) -> f64 {
        self.available_margin * self.limits.safe_leverage
    }

    /// Whether this venue can absorb additional exposure.
    pub fn can_add_position(&self) -> bool {
        self.leverage() < self.limits.safe_leverage
            && self.maintenance_margin_ratio < self.limits.safe_maintenance_margin_ratio
            && self.cross_margin_usage() < self.limits.safe_margin_usage
            && self.total_margin > 100.0
            && self.available_margin > 200.0
            && self.max_open_notional_value() > 200.0
    }

    /// Risk alert reason when any danger threshold is breached.
    pub fn should_notify_risk(&self) -> Option<String> {
        let leverage = self.leverage();
        if leverage >= self.limits.danger_leverage {
            return Some(format!("{}: leverage too high ({leverage:.2})", self.exchange_code));
        }
        if self.maintenance_margin_ratio >= self.limits.danger_maintenance_margin_ratio {
            return Some(format!(
                "{}: maintenance margin ratio too high ({:.2}%)",
                self.exchange_code,
                self.maintenance_margin_ratio * 100.0
            ));
        }
        let usage = self.cross_margin_usage();
        if usage >= self.limits.danger_margin_usage {
            return Some(format!(
                "{}: margin usage too high ({:.2}%)",
                self.exchange_code,
                usage * 100.0
            ));
        }
        None
    }

    /// Hard risk state: position must be reduced regardless of spread.
    pub fn should_force_reduce(&self) -> bool {
        self.leverage() >= self.limits.force_reduce_leverage
            || self.maintenance_margin_ratio >= self.limits.force_reduce_maintenance_margin_ratio
    }
}

// -----------------------------------------------------------------------------
// Merged positions
// -----------------------------------------------------------------------------

/// Same-symbol positions across venues folded into one hedged view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergedPosition {
    pub symbol: String,
    /// Net signed amount across venues — the hedge imbalance.
    pub total_amount: f64,
    /// Hedged notional: half the gross across both legs.
    pub notional: f64,
    /// Signed notional sum (zero for a perfect hedge).
    pub total_notional: f64,
    pub total_unrealized_pnl: f64,
    pub total_funding_fee: f64,
    pub venues: Vec<String>,
    pub position_sides: Vec<Option<Side>>,
    pub hold_amounts: Vec<f64>,
    /// Entry price used to express the imbalance in USD.
    pub refer_price: f64,
    /// Locked-in entry spread: -Σ entry·amount across legs.
    pub spread_profit: f64,
    pub spread_profit_rate: f64,
    /// Σ over legs of (BUY: -rate, SELL: +rate), in APY.
    pub funding_profit_rate_apy: f64,
}

impl MergedPosition {
    /// USD value of the hedge imbalance at the reference price.
    pub fn imbalance_usd(&self) -> f64 {
        self.total_amount * self.refer_price
    }
}

/// Fold positions from every venue into per-symbol merged entries,
/// ordered by hedged notional descending.
pub fn merge_positions(infos: &[VenueAccountInfo]) -> Vec<MergedPosition> {
    use std::collections::HashMap;

    let mut map: HashMap<String, MergedPosition> = HashMap::new();

    for info in infos {
        for pos in &info.positions {
            let entry = map.entry(pos.symbol.clone()).or_insert_with(|| MergedPosition {
                symbol: pos.symbol.clone(),
                total_amount: 0.0,
                notional: 0.0,
                total_notional: 0.0,
                total_unrealized_pnl: 0.0,
                total_funding_fee: 0.0,
                venues: Vec::new(),
                position_sides: Vec::new(),
                hold_amounts: Vec::new(),
                refer_price: 0.0,
                spread_profit: 0.0,
                spread_profit_rate: 0.0,
                funding_profit_rate_apy: 0.0,
            });

            entry.total_notional += pos.notional;
            entry.notional += pos.notional.abs();
            entry.total_unrealized_pnl += pos.unrealized_pnl;
            entry.total_funding_fee += pos.funding_fee;
            entry.venues.push(info.exchange_code.clone());
            entry.position_sides.push(pos.position_side());
            entry.hold_amounts.push(pos.amount);
            entry.total_amount += pos.amount;
            entry.refer_price = pos.entry_price;
            if pos.entry_price != 0.0 && pos.amount != 0.0 {
                entry.spread_profit += -pos.entry_price * pos.amount;
            }

            let rate = pos.funding_rate.unwrap_or(0.0);
            match pos.position_side() {
                Some(Side::Buy) => entry.funding_profit_rate_apy -= rate,
                Some(Side::Sell) => entry.funding_profit_rate_apy += rate,
                None => {}
            }
        }
    }

    let mut merged: Vec<MergedPosition> = map
        .into_values()
        .map(|mut m| {
            m.spread_profit_rate = if m.notional != 0.0 {
                m.spread_profit / m.notional
            } else {
                0.0
            };
            // One hedged leg, not the gross of both.
            m.notional /= 2.0;
            m
        })
        .collect();

    merged.sort_by(|a, b| {
        b.notional
            .abs()
            .partial_cmp(&a.notional.abs())
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    merged
}

// -----------------------------------------------------------------------------
// Combined snapshot
// -----------------------------------------------------------------------------

/// Imbalance above which the combined view raises a risk alert (USD).
const IMBALANCE_NOTIFY_USD: f64 = 200.0;

/// The multi-venue view broadcast to every engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CombinedSnapshot {
    pub exchange_infos: Vec<VenueAccountInfo>,
    pub merged_positions: Vec<MergedPosition>,
    pub funding_opportunities: Vec<FundingOpportunity>,
    pub update_time: DateTime<Utc>,
    pub time_cost_sec: f64,
}

impl CombinedSnapshot {
    pub fn build(
        infos: Vec<VenueAccountInfo>,
        opportunities: Vec<FundingOpportunity>,
        time_cost_sec: f64,
    ) -> Self {
        let merged = merge_positions(&infos);
        Self {
            exchange_infos: infos,
            merged_positions: merged,
            funding_opportunities: opportunities,
            update_time: Utc::now(),
            time_cost_sec,
        }
    }

    pub fn total_margin(&self) -> f64 {
        self.exchange_infos.iter().map(|e| e.total_margin).sum()
    }

    pub fn total_available_margin(&self) -> f64 {
        self.exchange_infos.iter().map(|e| e.available_margin).sum()
    }

    pub fn total_notional(&self) -> f64 {
        self.exchange_infos.iter().map(|e| e.total_notional()).sum()
    }

    pub fn total_leverage(&self) -> f64 {
        let margin = self.total_margin();
        if margin != 0.0 {
            self.total_notional() / margin
        } else {
            0.0
        }
    }

    pub fn total_unrealized_pnl(&self) -> f64 {
        self.exchange_infos.iter().map(|e| e.total_unrealized_pnl()).sum()
    }

    pub fn total_funding_fee(&self) -> f64 {
        self.exchange_infos.iter().map(|e| e.total_funding_fee()).sum()
    }

    /// Symbols with at least one open position anywhere.
    pub fn holding_symbols(&self) -> Vec<String> {
        self.merged_positions.iter().map(|m| m.symbol.clone()).collect()
    }

    pub fn venue_info(&self, exchange_code: &str) -> Option<&VenueAccountInfo> {
        self.exchange_infos.iter().find(|e| e.exchange_code == exchange_code)
    }

    /// Positions for `symbol` on the listed venues, ordered like `codes`;
    /// `None` marks a venue holding nothing.
    pub fn symbol_positions(&self, symbol: &str, codes: &[String]) -> Vec<Option<Position>> {
        codes
            .iter()
            .map(|code| {
                self.venue_info(code)
                    .and_then(|info| info.position_for(symbol).cloned())
            })
            .collect()
    }

    /// Net signed amount for `symbol` across the listed venues.
    pub fn imbalance_amount(&self, symbol: &str, codes: &[String]) -> f64 {
        self.symbol_positions(symbol, codes)
            .iter()
            .flatten()
            .map(|p| p.amount)
            .sum()
    }

    /// Imbalance in USD, valued at each leg's entry price.
    pub fn imbalance_value(&self, symbol: &str, codes: &[String]) -> f64 {
        self.symbol_positions(symbol, codes)
            .iter()
            .flatten()
            .map(|p| p.amount * p.entry_price)
            .sum()
    }

    /// Tightest per-venue opening headroom across the listed venues.
    pub fn max_open_notional_value(&self, codes: &[String]) -> Option<f64> {
        self.exchange_infos
            .iter()
            .filter(|e| codes.is_empty() || codes.contains(&e.exchange_code))
            .map(|e| e.max_open_notional_value())
            .min_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
    }

    /// Whether adding is allowed on every one of the listed venues.
    pub fn can_add_position(&self, codes: &[String]) -> bool {
        self.exchange_infos
            .iter()
            .filter(|e| codes.contains(&e.exchange_code))
            .all(|e| e.can_add_position())
    }

    /// Combined risk alert: imbalanced hedges plus per-venue breaches.
    pub fn should_notify_risk(&self) -> Option<String> {
        let mut reasons = Vec::new();

        for merged in &self.merged_positions {
            let imbalance = merged.imbalance_usd();
            if imbalance.abs() > IMBALANCE_NOTIFY_USD && merged.venues.len() > 1 {
                reasons.push(format!("{}: hedge imbalance ${imbalance:.2}", merged.symbol));
            }
        }
        for info in &self.exchange_infos {
            if let Some(reason) = info.should_notify_risk() {
                reasons.push(reason);
            }
        }

        if reasons.is_empty() {
            None
        } else {
            Some(reasons.join("\n"))
        }
    }

    /// Any member venue demanding reduction flags the whole snapshot.
    pub fn should_force_reduce(&self) -> bool {
        self.exchange_infos.iter().any(VenueAccountInfo::should_force_reduce)
    }

    /// Expected funding profit per year across all hedged positions (USD).
    pub fn estimated_annual_funding_profit(&self) -> f64 {
        self.merged_positions
            .iter()
            .map(|m| m.notional * m.funding_profit_rate_apy)
            .sum()
    }
}

impl std::fmt::Display for CombinedSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "combined: margin ${:.2} (avail ${:.2}) leverage {:.2}",
            self.total_margin(),
            self.total_available_margin(),
            self.total_leverage()
        )?;
        for info in &self.exchange_infos {
            writeln!(
                f,
                "  {}: margin ${:.2} leverage {:.2} usage {:.1}% mmr {:.1}% positions {}",
                info.exchange_code,
                info.total_margin,
                info.leverage(),
                info.cross_margin_usage() * 100.0,
                info.maintenance_margin_ratio * 100.0,
                info.positions.len()
            )?;
        }
        for merged in &self.merged_positions {
            writeln!(
                f,
                "  {} ${:.0} funding {:.2}%/y imbalance {:.6} pnl ${:.2} [{}]",
                merged.symbol,
                merged.notional,
                merged.funding_profit_rate_apy * 100.0,
                merged.total_amount,
                merged.total_unrealized_pnl,
                merged.venues.join(",")
            )?;
        }
        for opp in &self.funding_opportunities {
            writeln!(
                f,
                "  opportunity {} {:.2}%/y {}-{}",
                opp.pair,
                opp.funding_profit_rate * 100.0,
                opp.exchange1,
                opp.exchange2
            )?;
        }
        write!(
            f,
            "  est. annual funding ${:.2} | {} | {:.2}s",
            self.estimated_annual_funding_profit(),
            self.update_time.format("%Y-%m-%d %H:%M:%S"),
            self.time_cost_sec
        )
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn position(venue: &str, symbol: &str, amount: f64, entry: f64, funding_rate: f64) -> Position {
        Position {
            venue_code: venue.to_string(),
            pair: format!("{symbol}USDT"),
            symbol: symbol.to_string(),
            amount,
            entry_price: entry,
            notional: amount * entry,
            unrealized_pnl: 0.0,
            funding_fee: 0.0,
            mark_price: entry,
            adl: 0,
            liquidation_price: 0.0,
            funding_rate: Some(funding_rate),
        }
    }

    fn info(code: &str, margin: f64, available: f64, mmr: f64, positions: Vec<Position>) -> VenueAccountInfo {
        VenueAccountInfo {
            exchange_code: code.to_string(),
            taker_fee_rate: 0.0004,
            maker_fee_rate: 0.0002,
            limits: VenueRiskLimits::default(),
            total_margin: margin,
            available_margin: available,
            maintenance_margin_ratio: mmr,
            positions,
            time_cost_sec: 0.0,
        }
    }

    #[test]
    fn can_add_position_requires_every_margin_gate() {
        let healthy = info("paper1", 10_000.0, 8_000.0, 0.05, vec![]);
        assert!(healthy.can_add_position());

        // Margin too small.
        assert!(!info("paper1", 90.0, 80.0, 0.05, vec![]).can_add_position());
        // Available margin too small.
        assert!(!info("paper1", 10_000.0, 150.0, 0.05, vec![]).can_add_position());
        // Leverage at the safe cap.
        let over = info(
            "paper1",
            1_000.0,
            900.0,
            0.05,
            vec![position("paper1", "BTC", 40.0, 100.0, 0.0)],
        );
        assert!(over.leverage() >= over.limits.safe_leverage);
        assert!(!over.can_add_position());
    }

    #[test]
    fn force_reduce_trips_on_leverage_or_mmr() {
        let lim = VenueRiskLimits::default();
        let calm = info("paper1", 10_000.0, 9_000.0, 0.05, vec![]);
        assert!(!calm.should_force_reduce());

        let hot_mmr = info("paper1", 10_000.0, 9_000.0, lim.force_reduce_maintenance_margin_ratio, vec![]);
        assert!(hot_mmr.should_force_reduce());

        let hot_lev = info(
            "paper1",
            1_000.0,
            100.0,
            0.05,
            vec![position("paper1", "BTC", 120.0, 100.0, 0.0)],
        );
        assert!(hot_lev.leverage() >= lim.force_reduce_leverage);
        assert!(hot_lev.should_force_reduce());
    }

    #[test]
    fn merge_folds_hedged_legs() {
        let infos = vec![
            info("paper1", 10_000.0, 9_000.0, 0.05, vec![position("paper1", "BTC", 0.6, 100.0, 0.10)]),
            info("paper2", 10_000.0, 9_000.0, 0.05, vec![position("paper2", "BTC", -0.5, 101.0, 0.02)]),
        ];
        let merged = merge_positions(&infos);
        assert_eq!(merged.len(), 1);
        let m = &merged[0];
        assert!((m.total_amount - 0.1).abs() < 1e-12);
        // Hedged notional: (|60| + |50.5|) / 2
        assert!((m.notional - (60.0 + 50.5) / 2.0).abs() < 1e-9);
        // spread_profit = -(100*0.6) - (101*-0.5) = -60 + 50.5
        assert!((m.spread_profit - (-60.0 + 50.5)).abs() < 1e-9);
        // BUY leg pays 10% APY, SELL leg earns 2% APY.
        assert!((m.funding_profit_rate_apy - (-0.10 + 0.02)).abs() < 1e-12);
        assert_eq!(m.venues.len(), 2);
    }

    #[test]
    fn combined_notify_flags_large_imbalance() {
        let infos = vec![
            info("paper1", 10_000.0, 9_000.0, 0.05, vec![position("paper1", "BTC", 5.0, 100.0, 0.0)]),
            info("paper2", 10_000.0, 9_000.0, 0.05, vec![position("paper2", "BTC", -2.0, 100.0, 0.0)]),
        ];
        let snapshot = CombinedSnapshot::build(infos, vec![], 0.1);
        let reason = snapshot.should_notify_risk().unwrap();
        assert!(reason.contains("BTC"));
        assert!(reason.contains("imbalance"));
    }

    #[test]
    fn combined_force_reduce_follows_any_member() {
        let hot = info("paper1", 10_000.0, 9_000.0, 0.95, vec![]);
        let calm = info("paper2", 10_000.0, 9_000.0, 0.05, vec![]);
        let snapshot = CombinedSnapshot::build(vec![hot, calm], vec![], 0.0);
        assert!(snapshot.should_force_reduce());
    }

    #[test]
    fn symbol_positions_preserve_code_order_with_gaps() {
        let infos = vec![
            info("paper1", 10_000.0, 9_000.0, 0.05, vec![]),
            info("paper2", 10_000.0, 9_000.0, 0.05, vec![position("paper2", "BTC", -0.5, 100.0, 0.0)]),
        ];
        let snapshot = CombinedSnapshot::build(infos, vec![], 0.0);
        let codes = vec!["paper1".to_string(), "paper2".to_string()];
        let positions = snapshot.symbol_positions("BTC", &codes);
        assert!(positions[0].is_none());
        assert!(positions[1].is_some());
        assert!((snapshot.imbalance_amount("BTC", &codes) + 0.5).abs() < 1e-12);
        assert!((snapshot.imbalance_value("BTC", &codes) + 50.0).abs() < 1e-9);
    }

    #[test]
    fn max_open_notional_takes_the_tightest_venue() {
        let infos = vec![
            info("paper1", 10_000.0, 1_000.0, 0.05, vec![]),
            info("paper2", 10_000.0, 5_000.0, 0.05, vec![]),
        ];
        let snapshot = CombinedSnapshot::build(infos, vec![], 0.0);
        let lim = VenueRiskLimits::default();
        let codes = vec!["paper1".to_string(), "paper2".to_string()];
        let headroom = snapshot.max_open_notional_value(&codes).unwrap();
        assert!((headroom - 1_000.0 * lim.safe_leverage).abs() < 1e-9);
    }
}
