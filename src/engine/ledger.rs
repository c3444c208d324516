//! 订单台账
//! 仓位发出的每一笔订单的权威本地记录。台账负责三件事：
//! 同类订单的幂等保护、向交易所提交/撤销、以及把交易所的
//! 权威状态对账回本地仓位账目（新增成交只入账一次）。

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::core::error::EngineError;
use crate::core::gateway::{ExchangeGateway, GatewayOrderRequest, GatewayOrderType, OrderState};
use crate::core::retry::{retry_transient, RetryConfig};
use crate::core::types::{OrderKind, OrderSide, OrderStatus, Result, QTY_EPSILON};
use crate::engine::position::Position;
use crate::engine::risk::OrderOutlook;
use crate::utils::generate_client_order_id;

/// 一笔订单的本地记录
/// filled_qty 表示已对账入账的成交数量，入账以此为基准算增量
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRecord {
    pub id: String,
    pub position_id: String,
    pub kind: OrderKind,
    pub symbol: String,
    pub side: OrderSide,
    pub requested_qty: f64,
    pub price: Option<f64>,
    pub exchange_order_id: Option<String>,
    pub status: OrderStatus,
    pub filled_qty: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 下单意图，由监控周期构造
#[derive(Debug, Clone)]
pub struct OrderIntent {
    pub kind: OrderKind,
    pub side: OrderSide,
    pub order_type: GatewayOrderType,
    pub quantity: f64,
    pub price: Option<f64>,
    pub stop_price: Option<f64>,
    pub reduce_only: bool,
}

/// 订单台账
pub struct OrderLedger {
    gateway: Arc<dyn ExchangeGateway>,
    retry: RetryConfig,
    records: RwLock<HashMap<String, OrderRecord>>,
    /// (仓位, 用途) -> 在途订单，保证同类订单最多一笔未完结
    active: RwLock<HashMap<(String, OrderKind), String>>,
}

impl OrderLedger {
    pub fn new(gateway: Arc<dyn ExchangeGateway>, retry: RetryConfig) -> Self {
        Self {
            gateway,
            retry,
            records: RwLock::new(HashMap::new()),
            active: RwLock::new(HashMap::new()),
        }
    }

    /// 提交一笔订单
    /// 同一(仓位, 用途)存在未完结订单时拒绝重复提交
    pub async fn issue(&self, position: &Position, intent: OrderIntent) -> Result<OrderRecord> {
        let key = (position.id.clone(), intent.kind);
        {
            let active = self.active.read().await;
            let records = self.records.read().await;
            if let Some(record_id) = active.get(&key) {
                if let Some(record) = records.get(record_id) {
                    if !record.status.is_terminal() {
                        return Err(EngineError::DuplicateOrder {
                            position_id: position.id.clone(),
                            kind: intent.kind.label(),
                        });
                    }
                }
            }
        }

        let client_order_id = generate_client_order_id(&intent.kind);
        let request = GatewayOrderRequest {
            symbol: position.symbol().to_string(),
            side: intent.side,
            order_type: intent.order_type,
            quantity: intent.quantity,
            price: intent.price,
            stop_price: intent.stop_price,
            reduce_only: intent.reduce_only,
            client_order_id: client_order_id.clone(),
        };

        let now = Utc::now();
        let mut record = OrderRecord {
            id: client_order_id,
            position_id: position.id.clone(),
            kind: intent.kind,
            symbol: position.symbol().to_string(),
            side: intent.side,
            requested_qty: intent.quantity,
            price: intent.price.or(intent.stop_price),
            exchange_order_id: None,
            status: OrderStatus::Pending,
            filled_qty: 0.0,
            created_at: now,
            updated_at: now,
        };

        let retry = self.retry.clone();
        let ack = retry_transient("place_order", &retry, || {
            self.gateway.place_order(request.clone())
        })
        .await;

        match ack {
            Ok(ack) => {
                record.exchange_order_id = Some(ack.exchange_order_id);
                // 成交数量一律由对账回路入账，回执状态最多记为已挂出
                record.status = match ack.status {
                    OrderStatus::Rejected => OrderStatus::Rejected,
                    OrderStatus::Cancelled => OrderStatus::Cancelled,
                    _ => OrderStatus::Open,
                };
                record.updated_at = Utc::now();

                let mut records = self.records.write().await;
                records.insert(record.id.clone(), record.clone());
                drop(records);
                if !record.status.is_terminal() {
                    self.active.write().await.insert(key, record.id.clone());
                }
                log::info!(
                    "📤 订单已提交: {} {} {} {:.8} @ {:?}",
                    record.position_id,
                    record.kind,
                    record.side,
                    record.requested_qty,
                    record.price
                );
                Ok(record)
            }
            Err(e) => {
                if e.is_transient() {
                    // 重试耗尽，不保留记录，下一轮重新评估后以新ID重试
                    // TODO: 按client_order_id反查交易所，回收可能已被接受的订单
                    log::warn!(
                        "⚠️ 订单提交失败(瞬时): {} {} - {}",
                        position.id,
                        intent.kind,
                        e
                    );
                } else {
                    // 交易所明确拒绝，留档供审计
                    record.status = OrderStatus::Rejected;
                    record.updated_at = Utc::now();
                    self.records
                        .write()
                        .await
                        .insert(record.id.clone(), record);
                    log::warn!("❌ 订单被拒绝: {} {} - {}", position.id, intent.kind, e);
                }
                Err(e)
            }
        }
    }

    /// 请求撤销订单
    /// 只向交易所发出撤销请求，终态与可能的部分成交一律由
    /// 下一次对账入账，撤销与成交的竞态因此不会丢失数量
    pub async fn cancel(&self, record_id: &str) -> Result<()> {
        let snapshot = {
            let records = self.records.read().await;
            match records.get(record_id) {
                Some(record) => record.clone(),
                None => return Err(EngineError::OrderNotFound(record_id.to_string())),
            }
        };

        if snapshot.status.is_terminal() {
            return Ok(());
        }

        let Some(exchange_order_id) = snapshot.exchange_order_id else {
            // 从未获得交易所确认，本地直接终态化
            self.finalize_record(record_id, OrderStatus::Cancelled, None)
                .await;
            return Ok(());
        };

        let retry = self.retry.clone();
        let symbol = snapshot.symbol.clone();
        let result = retry_transient("cancel_order", &retry, || {
            self.gateway.cancel_order(&symbol, &exchange_order_id)
        })
        .await;

        match result {
            Ok(()) => Ok(()),
            // 交易所已不认识该订单：多半已成交或已撤销，交给对账收尾
            Err(EngineError::OrderNotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// 对账：刷新仓位全部未完结订单的权威状态并入账新增成交
    /// 单笔订单的瞬时失败跳过该笔（状态保持不变）；一笔都没能刷新时
    /// 返回瞬时错误，让本轮决策跳过，避免基于陈旧数据下单
    pub async fn reconcile(&self, position: &mut Position) -> Result<Vec<OrderRecord>> {
        let pending_ids: Vec<String> = {
            let records = self.records.read().await;
            records
                .values()
                .filter(|r| r.position_id == position.id && !r.status.is_terminal())
                .map(|r| r.id.clone())
                .collect()
        };

        if pending_ids.is_empty() {
            return Ok(Vec::new());
        }

        let total = pending_ids.len();
        let mut refreshed = Vec::new();
        let mut last_transient: Option<EngineError> = None;

        for record_id in pending_ids {
            match self.reconcile_order(&record_id, position).await {
                Ok(Some(record)) => refreshed.push(record),
                Ok(None) => {}
                Err(e) if e.is_transient() => {
                    log::warn!("⚠️ 订单 {} 对账失败，状态保持不变: {}", record_id, e);
                    last_transient = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        if refreshed.is_empty() && total > 0 {
            if let Some(e) = last_transient {
                return Err(e);
            }
        }

        Ok(refreshed)
    }

    /// 对账单笔订单
    pub async fn reconcile_order(
        &self,
        record_id: &str,
        position: &mut Position,
    ) -> Result<Option<OrderRecord>> {
        let snapshot = {
            let records = self.records.read().await;
            match records.get(record_id) {
                Some(record) => record.clone(),
                None => return Ok(None),
            }
        };

        if snapshot.status.is_terminal() {
            return Ok(Some(snapshot));
        }
        let Some(exchange_order_id) = snapshot.exchange_order_id.clone() else {
            return Ok(None);
        };

        let retry = self.retry.clone();
        let symbol = snapshot.symbol.clone();
        let state = match retry_transient("fetch_order", &retry, || {
            self.gateway.fetch_order(&symbol, &exchange_order_id)
        })
        .await
        {
            Ok(state) => state,
            Err(EngineError::OrderNotFound(_)) => {
                // 交易所已查不到该订单，本地按撤销终态收尾
                log::warn!("订单 {} 在交易所侧已不存在，按已撤销处理", record_id);
                let updated = self
                    .finalize_record(record_id, OrderStatus::Cancelled, None)
                    .await;
                return Ok(updated);
            }
            Err(e) => return Err(e),
        };

        let new_status = classify(&state, snapshot.requested_qty);

        // 只入账新增的成交增量，重复对账不会重复计数
        let observed = state.filled_qty.max(snapshot.filled_qty);
        let delta = observed - snapshot.filled_qty;
        self.apply_fill(position, &snapshot, delta, observed, new_status, &state)?;

        let updated = self
            .finalize_record(record_id, new_status, Some(observed))
            .await;
        Ok(updated)
    }

    /// 把成交增量与终态标记写回仓位
    fn apply_fill(
        &self,
        position: &mut Position,
        record: &OrderRecord,
        delta: f64,
        observed: f64,
        new_status: OrderStatus,
        state: &OrderState,
    ) -> Result<()> {
        match record.kind {
            OrderKind::Entry => {
                if new_status == OrderStatus::Filled && !position.entry_filled {
                    position.mark_entry_filled(observed, state.avg_price);
                }
            }
            OrderKind::TakeProfit(level) => {
                if delta > QTY_EPSILON {
                    position.credit_exit_fill(delta)?;
                }
                if new_status == OrderStatus::Filled {
                    if let Some(flag) = position.tp_filled.get_mut(level as usize) {
                        *flag = true;
                        position.touch();
                    }
                }
            }
            OrderKind::StopLoss => {
                if delta > QTY_EPSILON {
                    position.credit_exit_fill(delta)?;
                }
                if new_status == OrderStatus::Filled {
                    position.stop_filled = true;
                    position.touch();
                }
            }
            OrderKind::Close => {
                if delta > QTY_EPSILON {
                    position.credit_exit_fill(delta)?;
                }
            }
        }
        Ok(())
    }

    /// 更新订单记录，终态订单移出在途索引
    async fn finalize_record(
        &self,
        record_id: &str,
        status: OrderStatus,
        filled_qty: Option<f64>,
    ) -> Option<OrderRecord> {
        let updated = {
            let mut records = self.records.write().await;
            let record = records.get_mut(record_id)?;
            record.status = status;
            if let Some(filled) = filled_qty {
                record.filled_qty = filled;
            }
            record.updated_at = Utc::now();
            record.clone()
        };

        if status.is_terminal() {
            let key = (updated.position_id.clone(), updated.kind);
            let mut active = self.active.write().await;
            if active.get(&key).map(|id| id == record_id).unwrap_or(false) {
                active.remove(&key);
            }
        }
        Some(updated)
    }

    /// 汇总在途订单概况，供风控决策使用
    pub async fn outlook(&self, position: &Position) -> OrderOutlook {
        let active = self.active.read().await;
        let records = self.records.read().await;

        let is_live = |kind: OrderKind| -> bool {
            active
                .get(&(position.id.clone(), kind))
                .and_then(|id| records.get(id))
                .map(|r| !r.status.is_terminal())
                .unwrap_or(false)
        };

        OrderOutlook {
            entry_live: is_live(OrderKind::Entry),
            tp_live: (0..position.spec.tp_levels.len())
                .map(|i| is_live(OrderKind::TakeProfit(i as u8)))
                .collect(),
            stop_live: is_live(OrderKind::StopLoss),
        }
    }

    /// 某仓位指定用途的在途订单
    pub async fn active_record(&self, position_id: &str, kind: OrderKind) -> Option<OrderRecord> {
        let active = self.active.read().await;
        let records = self.records.read().await;
        active
            .get(&(position_id.to_string(), kind))
            .and_then(|id| records.get(id))
            .filter(|r| !r.status.is_terminal())
            .cloned()
    }

    /// 某仓位的全部在途订单
    pub async fn active_records_for(&self, position_id: &str) -> Vec<OrderRecord> {
        let records = self.records.read().await;
        records
            .values()
            .filter(|r| r.position_id == position_id && !r.status.is_terminal())
            .cloned()
            .collect()
    }

    /// 某仓位的全部订单记录（含终态），用于持久化
    pub async fn records_for(&self, position_id: &str) -> Vec<OrderRecord> {
        let records = self.records.read().await;
        records
            .values()
            .filter(|r| r.position_id == position_id)
            .cloned()
            .collect()
    }

    /// 启动时恢复持久化的订单记录
    pub async fn adopt(&self, restored: Vec<OrderRecord>) {
        let mut records = self.records.write().await;
        let mut active = self.active.write().await;
        for record in restored {
            if !record.status.is_terminal() {
                active.insert(
                    (record.position_id.clone(), record.kind),
                    record.id.clone(),
                );
            }
            records.insert(record.id.clone(), record);
        }
    }
}

/// 交易所回报的状态分类
/// 成交数量达到请求数量视为完全成交，即使交易所尚未标记终态
fn classify(state: &OrderState, requested_qty: f64) -> OrderStatus {
    match state.status {
        OrderStatus::Filled => OrderStatus::Filled,
        OrderStatus::Cancelled => OrderStatus::Cancelled,
        OrderStatus::Rejected => OrderStatus::Rejected,
        OrderStatus::Pending | OrderStatus::Open | OrderStatus::PartiallyFilled => {
            if state.filled_qty + QTY_EPSILON >= requested_qty {
                OrderStatus::Filled
            } else if state.filled_qty > QTY_EPSILON {
                OrderStatus::PartiallyFilled
            } else {
                OrderStatus::Open
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::RiskParams;
    use crate::core::types::{PositionSide, PositionSpec, TpLevel};
    use crate::engine::testkit::FakeGateway;

    fn retry_fast() -> RetryConfig {
        RetryConfig {
            max_retries: 3,
            initial_delay_ms: 1,
            max_delay_ms: 2,
            backoff_factor: 1.0,
            jitter: false,
        }
    }

    fn long_position() -> Position {
        Position::new(
            "POS-ledger".to_string(),
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
                        close_pct: 50.0,
                    },
                ],
                stop_price: 97.0,
            },
        )
    }

    fn entry_intent() -> OrderIntent {
        OrderIntent {
            kind: OrderKind::Entry,
            side: OrderSide::Buy,
            order_type: GatewayOrderType::Limit,
            quantity: 100.0,
            price: Some(100.0),
            stop_price: None,
            reduce_only: false,
        }
    }

    #[tokio::test]
    async fn test_duplicate_order_rejected() {
        let gateway = Arc::new(FakeGateway::new(105.0));
        let ledger = OrderLedger::new(gateway.clone(), retry_fast());
        let position = long_position();

        ledger.issue(&position, entry_intent()).await.unwrap();
        let err = ledger.issue(&position, entry_intent()).await.unwrap_err();
        assert!(matches!(err, EngineError::DuplicateOrder { .. }));
        assert_eq!(gateway.placed_count().await, 1);
    }

    #[tokio::test]
    async fn test_reconcile_credits_delta_once() {
        let gateway = Arc::new(FakeGateway::new(100.0));
        let ledger = OrderLedger::new(gateway.clone(), retry_fast());
        let mut position = long_position();
        position.mark_entry_filled(100.0, Some(100.0));

        let record = ledger
            .issue(
                &position,
                OrderIntent {
                    kind: OrderKind::TakeProfit(0),
                    side: OrderSide::Sell,
                    order_type: GatewayOrderType::Limit,
                    quantity: 50.0,
                    price: Some(102.0),
                    stop_price: None,
                    reduce_only: true,
                },
            )
            .await
            .unwrap();

        // 价格越过102后止盈成交
        gateway.set_price(102.5).await;
        ledger.reconcile(&mut position).await.unwrap();
        assert!((position.filled_qty - 50.0).abs() < 1e-9);
        assert!(position.tp_filled[0]);

        // 无新数据时重复对账不改变任何状态
        let before_filled = position.filled_qty;
        let before_flags = position.tp_filled.clone();
        ledger.reconcile(&mut position).await.unwrap();
        assert_eq!(position.filled_qty, before_filled);
        assert_eq!(position.tp_filled, before_flags);

        let records = ledger.records_for(&position.id).await;
        let tp = records.iter().find(|r| r.id == record.id).unwrap();
        assert_eq!(tp.status, OrderStatus::Filled);
    }

    #[tokio::test]
    async fn test_reconcile_transient_streak_then_success() {
        let gateway = Arc::new(FakeGateway::new(100.0));
        let ledger = OrderLedger::new(gateway.clone(), retry_fast());
        let mut position = long_position();

        ledger.issue(&position, entry_intent()).await.unwrap();

        // 连续3轮对账遭遇瞬时故障（每轮1+3次查询预算）：状态保持不变
        gateway.inject_fetch_failures(12).await;
        for _ in 0..3 {
            let err = ledger.reconcile(&mut position).await.unwrap_err();
            assert!(err.is_transient());
            assert!(!position.entry_filled);
        }

        // 故障消除后一次对账即反映最终状态，且没有重复下单
        ledger.reconcile(&mut position).await.unwrap();
        assert!(position.entry_filled);
        assert_eq!(gateway.placed_count().await, 1);
    }

    #[tokio::test]
    async fn test_rejected_order_recorded_terminal() {
        let gateway = Arc::new(FakeGateway::new(100.0));
        gateway.reject_next_place("margin insufficient").await;
        let ledger = OrderLedger::new(gateway.clone(), retry_fast());
        let position = long_position();

        let err = ledger.issue(&position, entry_intent()).await.unwrap_err();
        assert!(matches!(err, EngineError::OrderRejected(_)));

        // 拒绝后没有在途订单，可以立即重新提交
        assert!(ledger
            .active_record(&position.id, OrderKind::Entry)
            .await
            .is_none());
        ledger.issue(&position, entry_intent()).await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_then_reconcile_finalizes() {
        let gateway = Arc::new(FakeGateway::new(100.0));
        let ledger = OrderLedger::new(gateway.clone(), retry_fast());
        let mut position = long_position();
        position.mark_entry_filled(100.0, Some(100.0));

        let record = ledger
            .issue(
                &position,
                OrderIntent {
                    kind: OrderKind::StopLoss,
                    side: OrderSide::Sell,
                    order_type: GatewayOrderType::StopMarket,
                    quantity: 100.0,
                    price: None,
                    stop_price: Some(97.0),
                    reduce_only: true,
                },
            )
            .await
            .unwrap();

        ledger.cancel(&record.id).await.unwrap();
        // 撤销后终态由对账确认
        ledger
            .reconcile_order(&record.id, &mut position)
            .await
            .unwrap();
        assert!(ledger
            .active_record(&position.id, OrderKind::StopLoss)
            .await
            .is_none());
        // 未成交的撤单不得入账任何数量
        assert_eq!(position.filled_qty, 0.0);
    }

    #[tokio::test]
    async fn test_outlook_reflects_live_orders() {
        let gateway = Arc::new(FakeGateway::new(100.0));
        let ledger = OrderLedger::new(gateway.clone(), retry_fast());
        let mut position = long_position();
        position.mark_entry_filled(100.0, Some(100.0));

        ledger
            .issue(
                &position,
                OrderIntent {
                    kind: OrderKind::TakeProfit(1),
                    side: OrderSide::Sell,
                    order_type: GatewayOrderType::Limit,
                    quantity: 50.0,
                    price: Some(104.0),
                    stop_price: None,
                    reduce_only: true,
                },
            )
            .await
            .unwrap();

        let outlook = ledger.outlook(&position).await;
        assert!(!outlook.entry_live);
        assert_eq!(outlook.tp_live, vec![false, true]);
        assert!(!outlook.stop_live);

        // 决策层在TP2在途时仍应先补挂TP1
        let params = RiskParams::default();
        let action = crate::engine::risk::decide(&position, 104.0, &outlook, &params);
        assert_eq!(action, crate::engine::risk::Action::PlaceTp(0));
    }
}
