use chrono::{DateTime, Utc};
/// 统一的类型定义模块
/// 仓位、订单、状态事件相关的数据结构
use serde::{Deserialize, Serialize};

use crate::core::error::EngineError;

// ============= 基础类型定义 =============

/// 结果类型别名
pub type Result<T> = std::result::Result<T, EngineError>;

/// 数量比较精度
pub const QTY_EPSILON: f64 = 1e-9;

/// 价格比较精度
pub const PRICE_EPSILON: f64 = 1e-9;

/// 仓位方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    /// 开仓订单方向
    pub fn entry_order_side(&self) -> OrderSide {
        match self {
            PositionSide::Long => OrderSide::Buy,
            PositionSide::Short => OrderSide::Sell,
        }
    }

    /// 平仓订单方向（与仓位相反）
    pub fn exit_order_side(&self) -> OrderSide {
        match self {
            PositionSide::Long => OrderSide::Sell,
            PositionSide::Short => OrderSide::Buy,
        }
    }

    /// 从from到to的有利方向变动量（多头向上为正，空头向下为正）
    pub fn favorable_delta(&self, from: f64, to: f64) -> f64 {
        match self {
            PositionSide::Long => to - from,
            PositionSide::Short => from - to,
        }
    }
}

impl std::fmt::Display for PositionSide {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            PositionSide::Long => write!(f, "long"),
            PositionSide::Short => write!(f, "short"),
        }
    }
}

/// 订单方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// 订单用途
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderKind {
    /// 入场订单
    Entry,
    /// 分批止盈订单，内部保存0起的档位序号
    TakeProfit(u8),
    /// 止损订单
    StopLoss,
    /// 手动平仓的市价清仓订单
    Close,
}

impl OrderKind {
    pub fn label(&self) -> String {
        match self {
            OrderKind::Entry => "entry".to_string(),
            OrderKind::TakeProfit(level) => format!("tp{}", level + 1),
            OrderKind::StopLoss => "sl".to_string(),
            OrderKind::Close => "close".to_string(),
        }
    }
}

impl std::fmt::Display for OrderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// 订单状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Pending,
    Open,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
}

impl OrderStatus {
    /// 是否已进入终态（不会再有新的成交）
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Rejected
        )
    }
}

// ============= 仓位参数 =============

/// 单个止盈档位
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TpLevel {
    /// 触发价相对入场价的偏移比例（百分数，恒为正）
    pub price_offset_pct: f64,
    /// 该档平掉的仓位比例（百分数，按实际开仓数量计）
    pub close_pct: f64,
}

/// 外部提交的仓位参数
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionSpec {
    pub symbol: String,
    pub side: PositionSide,
    pub quantity: f64,
    /// 入场限价；为空时按市价入场
    #[serde(default)]
    pub entry_price: Option<f64>,
    #[serde(default = "default_leverage")]
    pub leverage: u32,
    pub tp_levels: Vec<TpLevel>,
    pub stop_price: f64,
}

fn default_leverage() -> u32 {
    1
}

impl PositionSpec {
    /// 参数校验，不合法的参数在入口处同步拒绝
    pub fn validate(&self) -> Result<()> {
        if self.symbol.trim().is_empty() {
            return Err(EngineError::InvalidSpec("交易对不能为空".to_string()));
        }
        if self.quantity <= 0.0 {
            return Err(EngineError::InvalidSpec(format!(
                "数量必须大于0: {}",
                self.quantity
            )));
        }
        if !(1..=100).contains(&self.leverage) {
            return Err(EngineError::InvalidSpec(format!(
                "杠杆必须在1-100之间: {}",
                self.leverage
            )));
        }
        if let Some(entry) = self.entry_price {
            if entry <= 0.0 {
                return Err(EngineError::InvalidSpec(format!(
                    "入场价必须大于0: {}",
                    entry
                )));
            }
            // 止损必须位于入场价的保护侧
            let protective = match self.side {
                PositionSide::Long => self.stop_price < entry,
                PositionSide::Short => self.stop_price > entry,
            };
            if !protective {
                return Err(EngineError::InvalidSpec(format!(
                    "止损价 {} 未处于 {} 仓位入场价 {} 的保护侧",
                    self.stop_price, self.side, entry
                )));
            }
        }
        if self.stop_price <= 0.0 {
            return Err(EngineError::InvalidSpec(format!(
                "止损价必须大于0: {}",
                self.stop_price
            )));
        }
        if self.tp_levels.is_empty() || self.tp_levels.len() > 3 {
            return Err(EngineError::InvalidSpec(format!(
                "止盈档位数量必须为1-3个: {}",
                self.tp_levels.len()
            )));
        }
        let mut total_close_pct = 0.0;
        let mut last_offset = 0.0;
        for (i, level) in self.tp_levels.iter().enumerate() {
            if level.price_offset_pct <= last_offset {
                return Err(EngineError::InvalidSpec(format!(
                    "止盈档位{}的价格偏移必须严格递增",
                    i + 1
                )));
            }
            if level.close_pct <= 0.0 || level.close_pct > 100.0 {
                return Err(EngineError::InvalidSpec(format!(
                    "止盈档位{}的平仓比例必须在(0, 100]之间: {}",
                    i + 1,
                    level.close_pct
                )));
            }
            last_offset = level.price_offset_pct;
            total_close_pct += level.close_pct;
        }
        if total_close_pct > 100.0 + f64::EPSILON {
            return Err(EngineError::InvalidSpec(format!(
                "止盈总比例不能超过100%: {:.2}%",
                total_close_pct
            )));
        }
        Ok(())
    }
}

// ============= 止损与生命周期 =============

/// 止损工作模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopMode {
    /// 初始固定止损
    Fixed,
    /// 已抬升到保本位
    BreakEvenArmed,
    /// 跟随价格移动
    Trailing,
}

/// 止损状态
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StopState {
    pub price: f64,
    pub mode: StopMode,
}

/// 仓位生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleState {
    /// 入场订单未成交
    PendingEntry,
    /// 入场已成交，尚无止盈成交
    Open,
    /// 至少一档止盈成交，剩余数量大于0
    PartiallyClosed,
    /// 剩余数量归零（终态）
    Closed,
    /// 入场从未成交即撤销（终态）
    Cancelled,
    /// 本地状态损坏，已冻结等待人工处理（终态，不再自动操作）
    Faulted,
}

impl LifecycleState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LifecycleState::Closed | LifecycleState::Cancelled | LifecycleState::Faulted
        )
    }
}

/// 平仓原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloseReason {
    /// 入场前价格偏离超过失效阈值
    EntryInvalidated,
    /// 止损触发
    StopHit,
    /// 全部止盈档位成交
    AllTpsFilled,
    /// 外部请求平仓
    Manual,
}

// ============= 状态事件 =============

/// 仓位状态变更事件，创建后不再修改
#[derive(Debug, Clone, Serialize)]
pub struct StatusUpdate {
    pub position_id: String,
    pub timestamp: DateTime<Utc>,
    pub event: StatusEvent,
}

impl StatusUpdate {
    pub fn new(position_id: impl Into<String>, event: StatusEvent) -> Self {
        Self {
            position_id: position_id.into(),
            timestamp: Utc::now(),
            event,
        }
    }
}

/// 事件内容
#[derive(Debug, Clone, Serialize)]
pub enum StatusEvent {
    Created {
        symbol: String,
        side: PositionSide,
        quantity: f64,
    },
    EntryFilled {
        price: f64,
        quantity: f64,
    },
    TpFilled {
        /// 0起的档位序号
        level: u8,
        quantity: f64,
    },
    StopMoved {
        from: f64,
        to: f64,
        mode: StopMode,
    },
    OrderRejected {
        kind: OrderKind,
        reason: String,
    },
    Closed {
        reason: CloseReason,
    },
    Cancelled,
    Faulted {
        detail: String,
    },
}

// ============= 对外快照 =============

/// 仓位只读视图，供看板等外部协作方消费
#[derive(Debug, Clone, Serialize)]
pub struct PositionView {
    pub id: String,
    pub symbol: String,
    pub side: PositionSide,
    pub entry_price: Option<f64>,
    pub base_qty: f64,
    pub filled_qty: f64,
    pub remaining_qty: f64,
    pub stop: StopState,
    pub state: LifecycleState,
    pub tp_filled: Vec<bool>,
    pub close_reason: Option<CloseReason>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_spec() -> PositionSpec {
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
        }
    }

    #[test]
    fn test_valid_spec() {
        assert!(base_spec().validate().is_ok());
    }

    #[test]
    fn test_tp_sum_over_100_rejected() {
        let mut spec = base_spec();
        spec.tp_levels[0].close_pct = 70.0; // 70 + 30 + 20 = 120
        let err = spec.validate().unwrap_err();
        assert!(matches!(err, EngineError::InvalidSpec(_)));
    }

    #[test]
    fn test_zero_quantity_rejected() {
        let mut spec = base_spec();
        spec.quantity = 0.0;
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_stop_on_wrong_side_rejected() {
        let mut spec = base_spec();
        spec.stop_price = 105.0; // 多头止损必须低于入场价
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_offsets_must_increase() {
        let mut spec = base_spec();
        spec.tp_levels[1].price_offset_pct = 2.0;
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_market_entry_skips_stop_side_check() {
        let mut spec = base_spec();
        spec.entry_price = None;
        spec.stop_price = 97.0;
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_favorable_delta() {
        assert_eq!(PositionSide::Long.favorable_delta(100.0, 103.0), 3.0);
        assert_eq!(PositionSide::Short.favorable_delta(100.0, 97.0), 3.0);
    }
}
