//! 仓位状态
//! 仓位是引擎的核心聚合：数量账目、止损棘轮、生命周期迁移都收敛在这里。
//! 所有修改都发生在仓位自己的执行锁内（见monitor模块）。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::error::EngineError;
use crate::core::types::{
    CloseReason, LifecycleState, PositionSide, PositionSpec, PositionView, Result, StopMode,
    StopState, PRICE_EPSILON, QTY_EPSILON,
};

/// 一笔受管理的仓位
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: String,
    pub spec: PositionSpec,
    /// 计划入场价（限价单）或入场成交后采用的实际均价
    pub entry_price: Option<f64>,
    /// 实际工作数量：入场成交前为计划数量，成交后采用交易所回报的成交数量
    pub base_qty: f64,
    pub entry_filled: bool,
    pub entry_fill_price: Option<f64>,
    /// 止盈与止损方向累计入账的成交数量
    pub filled_qty: f64,
    pub stop: StopState,
    /// 各止盈档位是否已全部成交
    pub tp_filled: Vec<bool>,
    /// 保本抬升只执行一次
    pub breakeven_armed: bool,
    pub stop_filled: bool,
    /// 上次移动止损时观察到的价格，追踪步长以此为基准
    pub trail_anchor: Option<f64>,
    pub state: LifecycleState,
    pub close_reason: Option<CloseReason>,
    /// 外部撤销请求标记，由仓位自己的轮询周期在下次持锁时观察
    #[serde(default)]
    pub cancel_requested: bool,
    /// 杠杆是否已尝试设置过
    #[serde(default)]
    pub leverage_applied: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Position {
    pub fn new(id: String, spec: PositionSpec) -> Self {
        let now = Utc::now();
        let tp_count = spec.tp_levels.len();
        Self {
            entry_price: spec.entry_price,
            base_qty: spec.quantity,
            stop: StopState {
                price: spec.stop_price,
                mode: StopMode::Fixed,
            },
            tp_filled: vec![false; tp_count],
            id,
            spec,
            entry_filled: false,
            entry_fill_price: None,
            filled_qty: 0.0,
            breakeven_armed: false,
            stop_filled: false,
            trail_anchor: None,
            state: LifecycleState::PendingEntry,
            close_reason: None,
            cancel_requested: false,
            leverage_applied: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn side(&self) -> PositionSide {
        self.spec.side
    }

    pub fn symbol(&self) -> &str {
        &self.spec.symbol
    }

    /// 剩余未平数量
    pub fn remaining_qty(&self) -> f64 {
        (self.base_qty - self.filled_qty).max(0.0)
    }

    /// 止盈/追踪计算使用的入场参考价
    pub fn entry_reference(&self) -> Option<f64> {
        self.entry_fill_price.or(self.entry_price)
    }

    /// 第level档止盈的触发价
    pub fn tp_trigger_price(&self, level: usize) -> Option<f64> {
        let entry = self.entry_reference()?;
        let offset = self.spec.tp_levels.get(level)?.price_offset_pct / 100.0;
        Some(match self.side() {
            PositionSide::Long => entry * (1.0 + offset),
            PositionSide::Short => entry * (1.0 - offset),
        })
    }

    /// 第level档止盈的下单数量，不超过剩余数量
    pub fn tp_quantity(&self, level: usize) -> f64 {
        let close_pct = self
            .spec
            .tp_levels
            .get(level)
            .map(|l| l.close_pct)
            .unwrap_or(0.0);
        (self.base_qty * close_pct / 100.0).min(self.remaining_qty())
    }

    /// 棘轮检查：新止损价必须朝降低风险的方向移动
    pub fn ratchet_ok(&self, new_price: f64) -> bool {
        match self.side() {
            PositionSide::Long => new_price > self.stop.price + PRICE_EPSILON,
            PositionSide::Short => new_price < self.stop.price - PRICE_EPSILON,
        }
    }

    /// 入场订单完全成交
    pub fn mark_entry_filled(&mut self, filled_qty: f64, avg_price: Option<f64>) {
        self.entry_filled = true;
        if filled_qty > QTY_EPSILON {
            self.base_qty = filled_qty;
        }
        let price = avg_price.or(self.entry_price);
        self.entry_fill_price = price;
        if self.entry_price.is_none() {
            // 市价入场采用成交均价作为入场参考
            self.entry_price = price;
        }
        // 追踪基准从入场价起算
        if self.trail_anchor.is_none() {
            self.trail_anchor = price;
        }
        if self.state == LifecycleState::PendingEntry {
            self.state = LifecycleState::Open;
        }
        self.touch();
    }

    /// 入账一笔平仓方向的新增成交
    /// 剩余数量为负说明本地账目已损坏，上抛Fatal由监控冻结仓位
    pub fn credit_exit_fill(&mut self, delta: f64) -> Result<()> {
        if delta <= 0.0 {
            return Ok(());
        }
        self.filled_qty += delta;
        self.touch();
        if self.base_qty - self.filled_qty < -QTY_EPSILON {
            return Err(EngineError::Corrupted(format!(
                "仓位 {} 平仓数量超出开仓数量: filled={:.8} base={:.8}",
                self.id, self.filled_qty, self.base_qty
            )));
        }
        Ok(())
    }

    /// 依据成交情况刷新生命周期（Open -> PartiallyClosed）
    pub fn refresh_lifecycle(&mut self) {
        if self.state == LifecycleState::Open
            && self.tp_filled.iter().any(|f| *f)
            && self.remaining_qty() > QTY_EPSILON
        {
            self.state = LifecycleState::PartiallyClosed;
            self.touch();
        }
    }

    /// 迁移到终态
    pub fn transition_terminal(&mut self, state: LifecycleState, reason: Option<CloseReason>) {
        debug_assert!(state.is_terminal());
        self.state = state;
        if reason.is_some() {
            self.close_reason = reason;
        }
        self.touch();
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// 对外只读视图
    pub fn view(&self) -> PositionView {
        PositionView {
            id: self.id.clone(),
            symbol: self.spec.symbol.clone(),
            side: self.side(),
            entry_price: self.entry_reference(),
            base_qty: self.base_qty,
            filled_qty: self.filled_qty,
            remaining_qty: self.remaining_qty(),
            stop: self.stop,
            state: self.state,
            tp_filled: self.tp_filled.clone(),
            close_reason: self.close_reason,
            updated_at: self.updated_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::TpLevel;

    fn long_position() -> Position {
        Position::new(
            "POS-test".to_string(),
            PositionSpec {
                symbol: "BTC/USDT".to_string(),
                side: PositionSide::Long,
                quantity: 100.0,
                entry_price: Some(100.0),
                leverage: 5,
                tp_levels: vec![
                    TpLevel {
                        price_offset_pct: 2.0,
                        close_pct: 50.0,
                    },
                    TpLevel {
                        price_offset_pct: 4.0,
                        close_pct: 30.0,
                    },
                    TpLevel {
                        price_offset_pct: 6.0,
                        close_pct: 20.0,
                    },
                ],
                stop_price: 97.0,
            },
        )
    }

    #[test]
    fn test_tp_trigger_prices() {
        let pos = long_position();
        assert!((pos.tp_trigger_price(0).unwrap() - 102.0).abs() < 1e-9);
        assert!((pos.tp_trigger_price(1).unwrap() - 104.0).abs() < 1e-9);
        assert!((pos.tp_trigger_price(2).unwrap() - 106.0).abs() < 1e-9);
        assert!(pos.tp_trigger_price(3).is_none());
    }

    #[test]
    fn test_tp_quantity_capped_by_remaining() {
        let mut pos = long_position();
        assert!((pos.tp_quantity(0) - 50.0).abs() < 1e-9);
        pos.credit_exit_fill(90.0).unwrap();
        // 第二档本应30，但只剩10
        assert!((pos.tp_quantity(1) - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_ratchet_long() {
        let pos = long_position();
        assert!(pos.ratchet_ok(98.0));
        assert!(!pos.ratchet_ok(97.0));
        assert!(!pos.ratchet_ok(95.0));
    }

    #[test]
    fn test_ratchet_short() {
        let mut pos = long_position();
        pos.spec.side = PositionSide::Short;
        pos.spec.entry_price = Some(100.0);
        pos.entry_price = Some(100.0);
        pos.stop.price = 103.0;
        assert!(pos.ratchet_ok(102.0));
        assert!(!pos.ratchet_ok(103.0));
        assert!(!pos.ratchet_ok(105.0));
    }

    #[test]
    fn test_overfill_is_fatal() {
        let mut pos = long_position();
        pos.credit_exit_fill(60.0).unwrap();
        let err = pos.credit_exit_fill(50.0).unwrap_err();
        assert!(matches!(err, EngineError::Corrupted(_)));
    }

    #[test]
    fn test_entry_fill_adopts_reported_quantity() {
        let mut pos = long_position();
        pos.mark_entry_filled(99.5, Some(100.2));
        assert!(pos.entry_filled);
        assert_eq!(pos.state, LifecycleState::Open);
        assert!((pos.base_qty - 99.5).abs() < 1e-9);
        assert_eq!(pos.entry_fill_price, Some(100.2));
        assert_eq!(pos.trail_anchor, Some(100.2));
    }

    #[test]
    fn test_market_entry_adopts_fill_price() {
        let mut pos = long_position();
        pos.spec.entry_price = None;
        pos.entry_price = None;
        pos.mark_entry_filled(100.0, Some(101.3));
        assert_eq!(pos.entry_price, Some(101.3));
        assert_eq!(pos.entry_reference(), Some(101.3));
    }

    #[test]
    fn test_lifecycle_partial_close() {
        let mut pos = long_position();
        pos.mark_entry_filled(100.0, Some(100.0));
        pos.credit_exit_fill(50.0).unwrap();
        pos.tp_filled[0] = true;
        pos.refresh_lifecycle();
        assert_eq!(pos.state, LifecycleState::PartiallyClosed);
    }
}
