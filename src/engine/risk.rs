//! 风控决策
//! 纯函数：输入仓位状态、最新价与在途订单情况，输出下一步动作。
//! 每次调用最多产生一个动作，规则按优先级互斥，避免同一轮内
//! 发出相互冲突的变更（例如既移动止损又平仓）。

use crate::core::config::RiskParams;
use crate::core::types::{CloseReason, PositionSide, StopMode, QTY_EPSILON};
use crate::engine::position::Position;

/// 决策结果
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    None,
    /// 挂出第N档止盈（0起）
    PlaceTp(usize),
    /// 移动止损
    MoveStop { price: f64, mode: StopMode },
    /// 平仓
    Close(CloseReason),
}

/// 在途订单概况，由订单台账在决策前汇总
#[derive(Debug, Clone, Default)]
pub struct OrderOutlook {
    pub entry_live: bool,
    pub tp_live: Vec<bool>,
    pub stop_live: bool,
}

impl OrderOutlook {
    fn tp_is_live(&self, level: usize) -> bool {
        self.tp_live.get(level).copied().unwrap_or(false)
    }
}

/// 计算下一步动作
/// 规则优先级：入场失效 > 保本抬升 > 追踪移动 > 挂止盈 > 终结平仓。
/// 仓位已无可保护的剩余数量时，止损移动与挂单规则不再适用，
/// 直接落到终结判定。
pub fn decide(
    position: &Position,
    last_price: f64,
    outlook: &OrderOutlook,
    params: &RiskParams,
) -> Action {
    // 规则1：入场未成交时只检查失效阈值
    if !position.entry_filled {
        if let Some(entry) = position.entry_price {
            if entry > 0.0 {
                let excursion_pct = (last_price - entry).abs() / entry * 100.0;
                if excursion_pct > params.invalidation_pct {
                    return Action::Close(CloseReason::EntryInvalidated);
                }
            }
        }
        // 入场成交前其余规则均不可能适用
        return Action::None;
    }

    let position_alive = position.remaining_qty() > QTY_EPSILON && !position.stop_filled;

    // 规则2：首次止盈成交后抬升止损到保本位，只执行一次
    if position_alive && !position.breakeven_armed && position.tp_filled.iter().any(|f| *f) {
        if let Some(entry) = position.entry_reference() {
            let buffer = params.breakeven_buffer_pct / 100.0;
            let breakeven = match position.side() {
                PositionSide::Long => entry * (1.0 + buffer),
                PositionSide::Short => entry * (1.0 - buffer),
            };
            // 保本位劣于当前止损时退化为模式翻转，棘轮不放宽
            let target = if position.ratchet_ok(breakeven) {
                breakeven
            } else {
                position.stop.price
            };
            return Action::MoveStop {
                price: target,
                mode: StopMode::BreakEvenArmed,
            };
        }
    }

    // 规则3：保本/追踪模式下，价格自上次移动后再有利推进一个步长则继续追踪
    if position_alive
        && matches!(
            position.stop.mode,
            StopMode::BreakEvenArmed | StopMode::Trailing
        )
    {
        if let Some(anchor) = position.trail_anchor {
            if anchor > 0.0 {
                let advance_pct =
                    position.side().favorable_delta(anchor, last_price) / anchor * 100.0;
                if advance_pct >= params.trailing_step_pct {
                    let distance = params.trailing_distance_pct / 100.0;
                    let new_stop = match position.side() {
                        PositionSide::Long => last_price * (1.0 - distance),
                        PositionSide::Short => last_price * (1.0 + distance),
                    };
                    // 计算结果若放宽止损则视为无操作
                    if position.ratchet_ok(new_stop) {
                        return Action::MoveStop {
                            price: new_stop,
                            mode: StopMode::Trailing,
                        };
                    }
                }
            }
        }
    }

    // 规则4：最新价越过未触发档位的触发价则挂出该档止盈
    if position_alive {
        for level in 0..position.spec.tp_levels.len() {
            let already_filled = position.tp_filled.get(level).copied().unwrap_or(false);
            if already_filled || outlook.tp_is_live(level) {
                continue;
            }
            let Some(trigger) = position.tp_trigger_price(level) else {
                continue;
            };
            let crossed = match position.side() {
                PositionSide::Long => last_price >= trigger,
                PositionSide::Short => last_price <= trigger,
            };
            if crossed && position.tp_quantity(level) > QTY_EPSILON {
                return Action::PlaceTp(level);
            }
        }
    }

    // 规则5：止损成交或数量归零即终结
    if position.stop_filled {
        return Action::Close(CloseReason::StopHit);
    }
    if position.remaining_qty() <= QTY_EPSILON {
        return Action::Close(CloseReason::AllTpsFilled);
    }

    Action::None
}
