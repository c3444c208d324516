//! 纸面交易网关
//! 行情从内部网关透传，订单在本地模拟：限价单在价格越过委托价时
//! 成交，条件市价单在触发价被穿越时成交。整个引擎在该网关上原样
//! 运行，不触碰真实账户。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::core::error::EngineError;
use crate::core::gateway::{
    ExchangeGateway, GatewayOrderRequest, GatewayOrderType, OrderAck, OrderState,
};
use crate::core::types::{OrderSide, OrderStatus, Result};

#[derive(Debug, Clone)]
struct PaperOrder {
    request: GatewayOrderRequest,
    status: OrderStatus,
    filled_qty: f64,
    fill_price: Option<f64>,
}

#[derive(Default)]
struct PaperBook {
    orders: HashMap<String, PaperOrder>,
    seq: u64,
    last_price: HashMap<String, f64>,
}

/// 纸面交易网关
pub struct PaperGateway {
    price_source: Arc<dyn ExchangeGateway>,
    book: Mutex<PaperBook>,
}

impl PaperGateway {
    pub fn new(price_source: Arc<dyn ExchangeGateway>) -> Self {
        Self {
            price_source,
            book: Mutex::new(PaperBook::default()),
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

    fn evaluate_fill(order: &mut PaperOrder, last_price: f64) {
        if order.status.is_terminal() {
            return;
        }
        if Self::crossed(&order.request, last_price) {
            order.status = OrderStatus::Filled;
            order.filled_qty = order.request.quantity;
            order.fill_price = Some(match order.request.order_type {
                GatewayOrderType::Limit => order.request.price.unwrap_or(last_price),
                _ => last_price,
            });
            log::info!(
                "📝 纸面成交: {} {} {:.8} @ {:.4}",
                order.request.symbol,
                order.request.client_order_id,
                order.filled_qty,
                order.fill_price.unwrap_or(last_price)
            );
        }
    }
}

#[async_trait]
impl ExchangeGateway for PaperGateway {
    fn name(&self) -> &str {
        "paper"
    }

    async fn place_order(&self, request: GatewayOrderRequest) -> Result<OrderAck> {
        let mut book = self.book.lock().await;
        book.seq += 1;
        let exchange_order_id = format!("PAPER-{}", book.seq);
        log::info!(
            "📝 纸面下单: {} {} {:?} {:.8}",
            request.symbol,
            request.client_order_id,
            request.order_type,
            request.quantity
        );
        book.orders.insert(
            exchange_order_id.clone(),
            PaperOrder {
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

    async fn cancel_order(&self, symbol: &str, exchange_order_id: &str) -> Result<()> {
        let mut book = self.book.lock().await;
        let last_price = book.last_price.get(symbol).copied();
        let order = book
            .orders
            .get_mut(exchange_order_id)
            .ok_or_else(|| EngineError::OrderNotFound(exchange_order_id.to_string()))?;

        // 已越过成交条件的订单视为成交在先
        if let Some(price) = last_price {
            Self::evaluate_fill(order, price);
        }
        if order.status == OrderStatus::Filled {
            return Err(EngineError::OrderNotFound(exchange_order_id.to_string()));
        }
        order.status = OrderStatus::Cancelled;
        Ok(())
    }

    async fn fetch_order(&self, symbol: &str, exchange_order_id: &str) -> Result<OrderState> {
        let mut book = self.book.lock().await;
        let last_price = book.last_price.get(symbol).copied();
        let order = book
            .orders
            .get_mut(exchange_order_id)
            .ok_or_else(|| EngineError::OrderNotFound(exchange_order_id.to_string()))?;

        if let Some(price) = last_price {
            Self::evaluate_fill(order, price);
        }
        Ok(OrderState {
            exchange_order_id: exchange_order_id.to_string(),
            status: order.status,
            filled_qty: order.filled_qty,
            avg_price: order.fill_price,
        })
    }

    async fn fetch_price(&self, symbol: &str) -> Result<f64> {
        let price = self.price_source.fetch_price(symbol).await?;
        self.book
            .lock()
            .await
            .last_price
            .insert(symbol.to_string(), price);
        Ok(price)
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<()> {
        log::info!("📝 纸面杠杆设置: {} {}x", symbol, leverage);
        Ok(())
    }
}
