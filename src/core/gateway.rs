use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::types::{OrderSide, OrderStatus, Result};

/// 网关订单类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GatewayOrderType {
    Market,
    Limit,
    StopMarket,
}

/// 提交给交易所的订单请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayOrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: GatewayOrderType,
    pub quantity: f64,
    /// 限价单价格
    pub price: Option<f64>,
    /// 条件单触发价
    pub stop_price: Option<f64>,
    /// 只减仓标记，平仓方向订单一律携带
    pub reduce_only: bool,
    pub client_order_id: String,
}

/// 下单回执
#[derive(Debug, Clone)]
pub struct OrderAck {
    pub exchange_order_id: String,
    pub status: OrderStatus,
    pub filled_qty: f64,
}

/// 交易所侧的订单权威状态
#[derive(Debug, Clone)]
pub struct OrderState {
    pub exchange_order_id: String,
    pub status: OrderStatus,
    pub filled_qty: f64,
    pub avg_price: Option<f64>,
}

/// 交易所网关接口
/// 引擎消费的唯一外部交易能力，实现方负责传输层细节
#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    /// 网关名称
    fn name(&self) -> &str;

    /// 下单
    async fn place_order(&self, request: GatewayOrderRequest) -> Result<OrderAck>;

    /// 撤单
    async fn cancel_order(&self, symbol: &str, exchange_order_id: &str) -> Result<()>;

    /// 查询订单权威状态
    async fn fetch_order(&self, symbol: &str, exchange_order_id: &str) -> Result<OrderState>;

    /// 查询最新成交价
    async fn fetch_price(&self, symbol: &str) -> Result<f64>;

    /// 设置杠杆（仅期货）
    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<()>;
}
