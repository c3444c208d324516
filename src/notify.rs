//! 状态事件总线
//! 仓位状态变更以广播形式分发给外部协作方（通知层、看板等），
//! 引擎内置一个日志订阅者，保证每个事件至少落一次日志。

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::core::types::{StatusEvent, StatusUpdate};

/// 状态事件总线
#[derive(Clone)]
pub struct StatusBus {
    tx: broadcast::Sender<StatusUpdate>,
}

impl StatusBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// 发布事件；没有订阅者时事件只进日志
    pub fn emit(&self, update: StatusUpdate) {
        log::debug!("状态事件: {} {:?}", update.position_id, update.event);
        let _ = self.tx.send(update);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusUpdate> {
        self.tx.subscribe()
    }
}

/// 启动内置日志订阅者
pub fn spawn_status_logger(bus: &StatusBus) -> JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(update) => log_update(&update),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    log::warn!("⚠️ 状态事件消费滞后，丢失 {} 条", missed);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

fn log_update(update: &StatusUpdate) {
    let id = &update.position_id;
    match &update.event {
        StatusEvent::Created {
            symbol,
            side,
            quantity,
        } => {
            log::info!("📬 [{}] 新建仓位: {} {} {:.8}", id, symbol, side, quantity);
        }
        StatusEvent::EntryFilled { price, quantity } => {
            log::info!("📥 [{}] 入场成交: {:.8} @ {:.4}", id, quantity, price);
        }
        StatusEvent::TpFilled { level, quantity } => {
            log::info!("🎯 [{}] 止盈tp{}成交: {:.8}", id, level + 1, quantity);
        }
        StatusEvent::StopMoved { from, to, mode } => {
            log::info!("🛡 [{}] 止损移动: {:.4} -> {:.4} ({:?})", id, from, to, mode);
        }
        StatusEvent::OrderRejected { kind, reason } => {
            log::warn!("❌ [{}] {}订单被拒绝: {}", id, kind, reason);
        }
        StatusEvent::Closed { reason } => {
            log::info!("🏁 [{}] 仓位关闭: {:?}", id, reason);
        }
        StatusEvent::Cancelled => {
            log::info!("🚫 [{}] 仓位已撤销", id);
        }
        StatusEvent::Faulted { detail } => {
            log::error!("🚨 [{}] 仓位已冻结: {}", id, detail);
        }
    }
}
