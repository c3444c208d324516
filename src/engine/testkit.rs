//! 测试用内存网关
//! 以可脚本化的价格驱动订单成交：限价单在价格越过时成交，
//! 条件市价单在触发价被穿越时成交，并支持注入瞬时故障与拒单。

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::core::error::EngineError;
use crate::core::gateway::{
    ExchangeGateway, GatewayOrderRequest, GatewayOrderType, OrderAck, OrderState,
};
use crate::core::types::{OrderSide, OrderStatus, Result};

#[derive(Debug, Clone)]
struct FakeOrder {
    request: GatewayOrderRequest,
    status: OrderStatus,
    filled_qty: f64,
    fill_price: Option<f64>,
}

#[derive(Default)]
struct FakeState {
    last_price: f64,
    orders: HashMap<String, FakeOrder>,
    seq: u64,
    placed: Vec<GatewayOrderRequest>,
    fetch_failures: u32,
    price_failures: u32,
    reject_next: Option<String>,
    leverage_calls: Vec<(String, u32)>,
}

/// 脚本化的假交易所
pub struct FakeGateway {
    state: Mutex<FakeState>,
}

impl FakeGateway {
    pub fn new(initial_price: f64) -> Self {
        Self {
            state: Mutex::new(FakeState {
                last_price: initial_price,
                ..Default::default()
            }),
        }
    }

    pub async fn set_price(&self, price: f64) {
        self.state.lock().await.last_price = price;
    }

    /// 接下来n次订单查询返回瞬时错误
    pub async fn inject_fetch_failures(&self, n: u32) {
        self.state.lock().await.fetch_failures = n;
    }

    /// 接下来n次行情查询返回瞬时错误
    pub async fn inject_price_failures(&self, n: u32) {
        self.state.lock().await.price_failures = n;
    }

    /// 下一笔订单被交易所拒绝
    pub async fn reject_next_place(&self, reason: &str) {
        self.state.lock().await.reject_next = Some(reason.to_string());
    }

    pub async fn placed_count(&self) -> usize {
        self.state.lock().await.placed.len()
    }

    pub async fn leverage_calls(&self) -> Vec<(String, u32)> {
        self.state.lock().await.leverage_calls.clone()
    }
}

/// 价格是否已越过订单的成交条件
fn crossed(request: &GatewayOrderRequest, last_price: f64) -> bool {
    match request.order_type {
        GatewayOrderType::Market => true,
        GatewayOrderType::Limit => match (request.side, request.price) {
            (OrderSide::Buy, Some(price)) => last_price <= price,
            (OrderSide::Sell, Some(price)) => last_price >= price,
            _ => false,
        },
        GatewayOrderType::StopMarket => match (request.side, request.stop_price) {
            (OrderSide::Buy, Some(stop)) => last_price >= stop,
            (OrderSide::Sell, Some(stop)) => last_price <= stop,
            _ => false,
        },
    }
}

fn evaluate_fill(order: &mut FakeOrder, last_price: f64) {
    if order.status.is_terminal() {
        return;
    }
    if crossed(&order.request, last_price) {
        order.status = OrderStatus::Filled;
        order.filled_qty = order.request.quantity;
        order.fill_price = Some(match order.request.order_type {
            GatewayOrderType::Limit => order.request.price.unwrap_or(last_price),
            _ => last_price,
        });
    }
}

#[async_trait]
impl ExchangeGateway for FakeGateway {
    fn name(&self) -> &str {
        "fake"
    }

    async fn place_order(&self, request: GatewayOrderRequest) -> Result<OrderAck> {
        let mut state = self.state.lock().await;
        if let Some(reason) = state.reject_next.take() {
            return Err(EngineError::OrderRejected(reason));
        }

        state.seq += 1;
        let exchange_order_id = format!("EX-{}", state.seq);
        state.placed.push(request.clone());
        state.orders.insert(
            exchange_order_id.clone(),
            FakeOrder {
                request,
                status: OrderStatus::Open,
                filled_qty: 0.0,
                fill_price: None,
            },
        );

        Ok(OrderAck {
            exchange_order_id,
            status: OrderStatus::Open,
            filled_qty: 0.0,
        })
    }

    async fn cancel_order(&self, _symbol: &str, exchange_order_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let last_price = state.last_price;
        let order = state
            .orders
            .get_mut(exchange_order_id)
            .ok_or_else(|| EngineError::OrderNotFound(exchange_order_id.to_string()))?;

        // 已越过成交条件的订单视为成交在先，撤销已来不及
        evaluate_fill(order, last_price);
        if order.status == OrderStatus::Filled {
            return Err(EngineError::OrderNotFound(exchange_order_id.to_string()));
        }
        order.status = OrderStatus::Cancelled;
        Ok(())
    }

    async fn fetch_order(&self, _symbol: &str, exchange_order_id: &str) -> Result<OrderState> {
        let mut state = self.state.lock().await;
        if state.fetch_failures > 0 {
            state.fetch_failures -= 1;
            return Err(EngineError::Timeout("fetch_order".to_string()));
        }
        let last_price = state.last_price;
        let order = state
            .orders
            .get_mut(exchange_order_id)
            .ok_or_else(|| EngineError::OrderNotFound(exchange_order_id.to_string()))?;

        evaluate_fill(order, last_price);
        Ok(OrderState {
            exchange_order_id: exchange_order_id.to_string(),
            status: order.status,
            filled_qty: order.filled_qty,
            avg_price: order.fill_price,
        })
    }

    async fn fetch_price(&self, _symbol: &str) -> Result<f64> {
        let mut state = self.state.lock().await;
        if state.price_failures > 0 {
            state.price_failures -= 1;
            return Err(EngineError::Timeout("fetch_price".to_string()));
        }
        Ok(state.last_price)
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<()> {
        self.state
            .lock()
            .await
            .leverage_calls
            .push((symbol.to_string(), leverage));
        Ok(())
    }
}
