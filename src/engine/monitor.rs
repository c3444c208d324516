//! 仓位监控
//! 每个未完结仓位一个独立的监督任务，按固定节奏执行轮询周期：
//! 取行情 -> 对账 -> 决策 -> 执行 -> 事件与持久化 -> 休眠。
//! 整个周期持有仓位自己的执行锁，休眠前释放；同一仓位不会有
//! 两个周期并发执行。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::core::config::{MonitorConfig, RiskParams};
use crate::core::error::ErrorClass;
use crate::core::gateway::{ExchangeGateway, GatewayOrderType};
use crate::core::retry::{retry_transient, RetryConfig};
use crate::core::types::{
    CloseReason, LifecycleState, OrderKind, OrderStatus, Result, StatusEvent, StatusUpdate,
    StopMode, StopState, PRICE_EPSILON, QTY_EPSILON,
};
use crate::engine::ledger::{OrderIntent, OrderLedger};
use crate::engine::position::Position;
use crate::engine::risk::{self, Action};
use crate::notify::StatusBus;
use crate::persist::PositionStore;

/// 监控任务共享的依赖集合
pub struct MonitorContext {
    pub gateway: Arc<dyn ExchangeGateway>,
    pub ledger: Arc<OrderLedger>,
    pub store: Arc<PositionStore>,
    pub bus: StatusBus,
    pub risk: RiskParams,
    pub monitor: MonitorConfig,
    pub retry: RetryConfig,
}

impl MonitorContext {
    fn emit(&self, position_id: &str, event: StatusEvent) {
        self.bus.emit(StatusUpdate::new(position_id, event));
    }
}

/// 启动一个仓位的监督任务，生命周期进入终态后退出
pub fn spawn_supervision_task(
    position: Arc<Mutex<Position>>,
    ctx: Arc<MonitorContext>,
    running: Arc<RwLock<bool>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let position_id = { position.lock().await.id.clone() };
        log::info!("🛰 仓位 {} 监控任务启动", position_id);

        let poll = Duration::from_secs(ctx.monitor.poll_interval_secs.max(1));
        let mut interval = tokio::time::interval(poll);

        loop {
            interval.tick().await;

            if !*running.read().await {
                log::info!("仓位 {} 收到停止信号，监控任务退出", position_id);
                break;
            }

            // 仓位执行锁：整个周期独占，休眠前释放
            let mut guard = position.lock().await;
            if guard.state.is_terminal() {
                break;
            }

            let before_updated = guard.updated_at;

            let result = if guard.cancel_requested {
                handle_cancel(&mut guard, &ctx).await
            } else {
                run_cycle(&mut guard, &ctx).await
            };

            match result {
                Ok(()) => {}
                Err(e) => match e.class() {
                    ErrorClass::Transient => {
                        log::warn!("⚠️ 仓位 {} 本轮跳过: {}", position_id, e);
                    }
                    ErrorClass::Fatal => {
                        log::error!("🚨 仓位 {} 状态损坏，已冻结等待人工处理: {}", position_id, e);
                        guard.transition_terminal(LifecycleState::Faulted, None);
                        ctx.emit(
                            &position_id,
                            StatusEvent::Faulted {
                                detail: e.to_string(),
                            },
                        );
                    }
                    _ => {
                        log::error!("❌ 仓位 {} 周期执行失败: {}", position_id, e);
                    }
                },
            }

            // 本轮有任何已提交的变更就落盘
            if guard.updated_at != before_updated || guard.state.is_terminal() {
                persist(&guard, &ctx).await;
            }

            if guard.state.is_terminal() {
                log::info!(
                    "仓位 {} 进入终态 {:?}，监控任务退出",
                    position_id,
                    guard.state
                );
                break;
            }
        }
    })
}

/// 单个轮询周期
/// 顺序保证：对账先于决策，决策先于执行；本周期发出的每条指令
/// 都基于对账后的最新数据
pub(crate) async fn run_cycle(position: &mut Position, ctx: &MonitorContext) -> Result<()> {
    ensure_entry_order(position, ctx).await?;

    let symbol = position.symbol().to_string();
    let last_price = retry_transient("fetch_price", &ctx.retry, || {
        ctx.gateway.fetch_price(&symbol)
    })
    .await?;

    let before_entry = position.entry_filled;
    let before_tp = position.tp_filled.clone();

    let refreshed = ctx.ledger.reconcile(position).await?;

    // 对账产生的状态事件
    if position.entry_filled && !before_entry {
        ctx.emit(
            &position.id,
            StatusEvent::EntryFilled {
                price: position.entry_fill_price.unwrap_or(last_price),
                quantity: position.base_qty,
            },
        );
        log::info!(
            "✅ 仓位 {} 入场成交: {:.8} @ {:.4}",
            position.id,
            position.base_qty,
            position.entry_fill_price.unwrap_or(last_price)
        );
    }
    for record in &refreshed {
        if let OrderKind::TakeProfit(level) = record.kind {
            if record.status == OrderStatus::Filled
                && !before_tp.get(level as usize).copied().unwrap_or(false)
            {
                ctx.emit(
                    &position.id,
                    StatusEvent::TpFilled {
                        level,
                        quantity: record.filled_qty,
                    },
                );
                log::info!(
                    "🎯 仓位 {} 止盈tp{}成交: {:.8}",
                    position.id,
                    level + 1,
                    record.filled_qty
                );
            }
        }
    }
    position.refresh_lifecycle();

    ensure_stop_order(position, ctx).await?;

    let outlook = ctx.ledger.outlook(position).await;
    let action = risk::decide(position, last_price, &outlook, &ctx.risk);
    apply_action(position, ctx, last_price, action).await
}

/// 入场订单尚未提交时补交
async fn ensure_entry_order(position: &mut Position, ctx: &MonitorContext) -> Result<()> {
    if position.entry_filled {
        return Ok(());
    }
    if ctx
        .ledger
        .active_record(&position.id, OrderKind::Entry)
        .await
        .is_some()
    {
        return Ok(());
    }

    // 杠杆在首次下单前设置一次，失败不阻塞交易
    if !position.leverage_applied {
        if let Err(e) = ctx
            .gateway
            .set_leverage(position.symbol(), position.spec.leverage)
            .await
        {
            log::warn!("⚠️ 仓位 {} 设置杠杆失败: {}", position.id, e);
        }
        position.leverage_applied = true;
        position.touch();
    }

    let (order_type, price) = match position.entry_price {
        Some(p) => (GatewayOrderType::Limit, Some(p)),
        None => (GatewayOrderType::Market, None),
    };
    let intent = OrderIntent {
        kind: OrderKind::Entry,
        side: position.side().entry_order_side(),
        order_type,
        quantity: position.spec.quantity,
        price,
        stop_price: None,
        reduce_only: false,
    };

    match ctx.ledger.issue(position, intent).await {
        Ok(_) => Ok(()),
        Err(e) if e.class() == ErrorClass::Rejected => {
            ctx.emit(
                &position.id,
                StatusEvent::OrderRejected {
                    kind: OrderKind::Entry,
                    reason: e.to_string(),
                },
            );
            Ok(())
        }
        Err(e) if e.class() == ErrorClass::Invalid => {
            // 并发竞态下的重复提交，下一轮对账自然收敛
            log::debug!("仓位 {} 入场订单重复提交被忽略: {}", position.id, e);
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// 保证持仓期间始终有一张数量正确的止损单挂在交易所
/// 覆盖三种情况：入场成交后的首次挂出、止盈成交后的数量收缩、
/// 以及上一轮移动止损失败后的自愈补挂
async fn ensure_stop_order(position: &mut Position, ctx: &MonitorContext) -> Result<()> {
    if !position.entry_filled || position.stop_filled {
        return Ok(());
    }
    let remaining = position.remaining_qty();
    if remaining <= QTY_EPSILON {
        return Ok(());
    }

    if let Some(active) = ctx
        .ledger
        .active_record(&position.id, OrderKind::StopLoss)
        .await
    {
        if active.requested_qty <= remaining + QTY_EPSILON {
            return Ok(());
        }
        // 止盈成交后止损数量需要收缩：撤销重挂
        ctx.ledger.cancel(&active.id).await?;
        ctx.ledger.reconcile_order(&active.id, position).await?;
        if position.stop_filled {
            log::warn!("仓位 {} 止损在撤换竞态中成交", position.id);
            return Ok(());
        }
    }

    place_stop_order(position, ctx, position.stop.price).await
}

async fn place_stop_order(
    position: &mut Position,
    ctx: &MonitorContext,
    stop_price: f64,
) -> Result<()> {
    let intent = OrderIntent {
        kind: OrderKind::StopLoss,
        side: position.side().exit_order_side(),
        order_type: GatewayOrderType::StopMarket,
        quantity: position.remaining_qty(),
        price: None,
        stop_price: Some(stop_price),
        reduce_only: true,
    };
    match ctx.ledger.issue(position, intent).await {
        Ok(_) => Ok(()),
        Err(e) if e.class() == ErrorClass::Rejected => {
            ctx.emit(
                &position.id,
                StatusEvent::OrderRejected {
                    kind: OrderKind::StopLoss,
                    reason: e.to_string(),
                },
            );
            log::warn!("❌ 仓位 {} 止损单被拒绝，下一轮重试: {}", position.id, e);
            Ok(())
        }
        Err(e) if e.class() == ErrorClass::Invalid => Ok(()),
        Err(e) => Err(e),
    }
}

/// 执行决策动作
async fn apply_action(
    position: &mut Position,
    ctx: &MonitorContext,
    last_price: f64,
    action: Action,
) -> Result<()> {
    match action {
        Action::None => Ok(()),
        Action::PlaceTp(level) => place_tp_order(position, ctx, level).await,
        Action::MoveStop { price, mode } => {
            move_stop(position, ctx, last_price, price, mode).await
        }
        Action::Close(reason) => close_position(position, ctx, reason).await,
    }
}

async fn place_tp_order(
    position: &mut Position,
    ctx: &MonitorContext,
    level: usize,
) -> Result<()> {
    let Some(trigger) = position.tp_trigger_price(level) else {
        return Ok(());
    };
    let quantity = position.tp_quantity(level);
    if quantity <= QTY_EPSILON {
        return Ok(());
    }

    let intent = OrderIntent {
        kind: OrderKind::TakeProfit(level as u8),
        side: position.side().exit_order_side(),
        order_type: GatewayOrderType::Limit,
        quantity,
        price: Some(trigger),
        stop_price: None,
        reduce_only: true,
    };
    match ctx.ledger.issue(position, intent).await {
        Ok(_) => Ok(()),
        Err(e) if e.class() == ErrorClass::Rejected => {
            ctx.emit(
                &position.id,
                StatusEvent::OrderRejected {
                    kind: OrderKind::TakeProfit(level as u8),
                    reason: e.to_string(),
                },
            );
            log::warn!(
                "❌ 仓位 {} 止盈tp{}被拒绝，下一轮重新评估: {}",
                position.id,
                level + 1,
                e
            );
            Ok(())
        }
        Err(e) if e.class() == ErrorClass::Invalid => Ok(()),
        Err(e) => Err(e),
    }
}

/// 移动止损：撤旧挂新，全程不放宽棘轮
/// 新单提交失败时旧止损价保持不变，由下一轮的补挂逻辑自愈
async fn move_stop(
    position: &mut Position,
    ctx: &MonitorContext,
    last_price: f64,
    new_price: f64,
    mode: StopMode,
) -> Result<()> {
    let from = position.stop.price;
    let price_changed = (new_price - from).abs() > PRICE_EPSILON;

    if price_changed {
        if !position.ratchet_ok(new_price) {
            return Ok(());
        }

        if let Some(old) = ctx
            .ledger
            .active_record(&position.id, OrderKind::StopLoss)
            .await
        {
            ctx.ledger.cancel(&old.id).await?;
            ctx.ledger.reconcile_order(&old.id, position).await?;
            if position.stop_filled {
                log::warn!("仓位 {} 止损在移动竞态中成交，放弃本次移动", position.id);
                return Ok(());
            }
        }

        let remaining = position.remaining_qty();
        if remaining <= QTY_EPSILON {
            return Ok(());
        }
        place_stop_order(position, ctx, new_price).await?;
        // 止损单未能挂出时不更新本地止损价，补挂逻辑仍以旧价保护
        if ctx
            .ledger
            .active_record(&position.id, OrderKind::StopLoss)
            .await
            .is_none()
        {
            return Ok(());
        }

        position.stop = StopState {
            price: new_price,
            mode,
        };
        position.trail_anchor = Some(last_price);
        if mode == StopMode::BreakEvenArmed {
            position.breakeven_armed = true;
        }
        position.touch();

        ctx.emit(
            &position.id,
            StatusEvent::StopMoved {
                from,
                to: new_price,
                mode,
            },
        );
        log::info!(
            "🛡 仓位 {} 止损移动: {:.4} -> {:.4} ({:?})",
            position.id,
            from,
            new_price,
            mode
        );
    } else {
        // 价格不变的模式翻转（保本位劣于当前止损时的武装动作）
        position.stop.mode = mode;
        position.trail_anchor = Some(last_price);
        if mode == StopMode::BreakEvenArmed {
            position.breakeven_armed = true;
        }
        position.touch();
        log::info!("仓位 {} 止损模式切换为 {:?}，价格维持 {:.4}", position.id, mode, from);
    }

    Ok(())
}

/// 终结仓位：撤销在途订单并确认数量归零后迁移到终态
async fn close_position(
    position: &mut Position,
    ctx: &MonitorContext,
    reason: CloseReason,
) -> Result<()> {
    for record in ctx.ledger.active_records_for(&position.id).await {
        if record.kind == OrderKind::Close {
            continue;
        }
        if let Err(e) = ctx.ledger.cancel(&record.id).await {
            log::warn!("⚠️ 仓位 {} 撤销订单 {} 失败: {}", position.id, record.id, e);
        }
    }
    ctx.ledger.reconcile(position).await?;

    match reason {
        CloseReason::EntryInvalidated => {
            if position.entry_filled {
                // 撤销竞态中入场已成交，转入常规持仓管理
                log::warn!("仓位 {} 入场在失效撤销竞态中成交", position.id);
                return Ok(());
            }
            position.transition_terminal(LifecycleState::Cancelled, Some(reason));
            ctx.emit(&position.id, StatusEvent::Closed { reason });
            log::info!("🚫 仓位 {} 入场失效，已撤销", position.id);
        }
        _ => {
            if position.remaining_qty() > QTY_EPSILON {
                // 数量尚未归零（撤单确认滞后），推迟到下一轮终结
                log::warn!(
                    "仓位 {} 剩余数量 {:.8} 未归零，延后终结",
                    position.id,
                    position.remaining_qty()
                );
                return Ok(());
            }
            position.transition_terminal(LifecycleState::Closed, Some(reason));
            ctx.emit(&position.id, StatusEvent::Closed { reason });
            log::info!("🏁 仓位 {} 已平仓: {:?}", position.id, reason);
        }
    }
    Ok(())
}

/// 处理外部撤销请求
/// 入场未成交：撤销入场订单后进入Cancelled；
/// 已持仓：撤掉保护单并用只减仓市价单清空剩余，数量归零后进入Closed
pub(crate) async fn handle_cancel(position: &mut Position, ctx: &MonitorContext) -> Result<()> {
    for record in ctx.ledger.active_records_for(&position.id).await {
        if record.kind == OrderKind::Close {
            continue;
        }
        if let Err(e) = ctx.ledger.cancel(&record.id).await {
            log::warn!("⚠️ 仓位 {} 撤销订单 {} 失败: {}", position.id, record.id, e);
        }
    }
    ctx.ledger.reconcile(position).await?;

    if !position.entry_filled {
        position.transition_terminal(LifecycleState::Cancelled, Some(CloseReason::Manual));
        ctx.emit(&position.id, StatusEvent::Cancelled);
        log::info!("🚫 仓位 {} 已按请求撤销（入场未成交）", position.id);
        return Ok(());
    }

    let remaining = position.remaining_qty();
    if remaining <= QTY_EPSILON {
        position.transition_terminal(LifecycleState::Closed, Some(CloseReason::Manual));
        ctx.emit(
            &position.id,
            StatusEvent::Closed {
                reason: CloseReason::Manual,
            },
        );
        log::info!("🏁 仓位 {} 已手动平仓", position.id);
        return Ok(());
    }

    if ctx
        .ledger
        .active_record(&position.id, OrderKind::Close)
        .await
        .is_none()
    {
        let intent = OrderIntent {
            kind: OrderKind::Close,
            side: position.side().exit_order_side(),
            order_type: GatewayOrderType::Market,
            quantity: remaining,
            price: None,
            stop_price: None,
            reduce_only: true,
        };
        match ctx.ledger.issue(position, intent).await {
            Ok(_) => {
                log::info!("仓位 {} 市价清仓单已提交: {:.8}", position.id, remaining);
            }
            Err(e) if e.class() == ErrorClass::Rejected => {
                ctx.emit(
                    &position.id,
                    StatusEvent::OrderRejected {
                        kind: OrderKind::Close,
                        reason: e.to_string(),
                    },
                );
            }
            Err(e) if e.class() == ErrorClass::Invalid => {}
            Err(e) => return Err(e),
        }
    }

    // 清仓单成交由后续周期对账确认后终结
    Ok(())
}

async fn persist(position: &Position, ctx: &MonitorContext) {
    let records = ctx.ledger.records_for(&position.id).await;
    if let Err(e) = ctx.store.save(position, &records) {
        log::warn!("⚠️ 仓位 {} 持久化失败: {}", position.id, e);
    }
}
