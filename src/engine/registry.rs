//! 仓位注册表
//! 进程内全部仓位的权威表，也是引擎对外的唯一入口：
//! 创建、查询、撤销、快照与启动恢复。注册表作为显式实例
//! 在构造时注入各处，不依赖任何全局单例。

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::core::error::EngineError;
use crate::core::types::{PositionSpec, PositionView, Result, StatusEvent, StatusUpdate};
use crate::engine::monitor::{spawn_supervision_task, MonitorContext};
use crate::engine::position::Position;
use crate::utils::generate_position_id;

struct PositionHandle {
    position: Arc<Mutex<Position>>,
    task: Option<JoinHandle<()>>,
}

/// 仓位注册表
pub struct PositionRegistry {
    ctx: Arc<MonitorContext>,
    running: Arc<RwLock<bool>>,
    positions: RwLock<HashMap<String, PositionHandle>>,
}

impl PositionRegistry {
    pub fn new(ctx: Arc<MonitorContext>) -> Self {
        Self {
            ctx,
            running: Arc::new(RwLock::new(true)),
            positions: RwLock::new(HashMap::new()),
        }
    }

    /// 接受一份仓位参数，校验通过后创建仓位并启动监督任务
    /// 不合法的参数同步拒绝，不产生任何状态
    pub async fn create(&self, spec: PositionSpec) -> Result<String> {
        spec.validate()?;

        let id = generate_position_id();
        let position = Position::new(id.clone(), spec);

        // 先落盘再启动任务，崩溃后重启能恢复
        self.ctx.store.save(&position, &[])?;
        self.ctx.bus.emit(StatusUpdate::new(
            &id,
            StatusEvent::Created {
                symbol: position.spec.symbol.clone(),
                side: position.side(),
                quantity: position.spec.quantity,
            },
        ));
        log::info!(
            "📬 新建仓位 {}: {} {} {:.8}",
            id,
            position.spec.symbol,
            position.side(),
            position.spec.quantity
        );

        let shared = Arc::new(Mutex::new(position));
        let task = spawn_supervision_task(shared.clone(), self.ctx.clone(), self.running.clone());

        self.positions.write().await.insert(
            id.clone(),
            PositionHandle {
                position: shared,
                task: Some(task),
            },
        );

        Ok(id)
    }

    /// 查询单个仓位视图
    pub async fn get(&self, id: &str) -> Option<PositionView> {
        let positions = self.positions.read().await;
        let handle = positions.get(id)?;
        let view = handle.position.lock().await.view();
        Some(view)
    }

    /// 请求撤销仓位
    /// 只设置待撤销标记，由仓位自己的周期在下次持锁时观察并执行，
    /// 保证撤销被观察到之后不会再发出新指令
    pub async fn cancel(&self, id: &str) -> Result<()> {
        let positions = self.positions.read().await;
        let handle = positions
            .get(id)
            .ok_or_else(|| EngineError::PositionNotFound(id.to_string()))?;

        let mut position = handle.position.lock().await;
        if position.state.is_terminal() {
            return Err(EngineError::PositionNotFound(format!(
                "仓位 {} 已进入终态 {:?}",
                id, position.state
            )));
        }
        position.cancel_requested = true;
        position.touch();
        log::info!("🚫 仓位 {} 收到撤销请求", id);
        Ok(())
    }

    /// 全量只读快照，供看板消费
    pub async fn snapshot(&self) -> Vec<PositionView> {
        let positions = self.positions.read().await;
        let mut views = Vec::with_capacity(positions.len());
        for handle in positions.values() {
            views.push(handle.position.lock().await.view());
        }
        views.sort_by(|a, b| a.id.cmp(&b.id));
        views
    }

    /// 归档终态仓位：移出注册表并删除持久化快照
    pub async fn archive(&self, id: &str) -> Result<()> {
        let mut positions = self.positions.write().await;
        let Some(handle) = positions.get(id) else {
            return Err(EngineError::PositionNotFound(id.to_string()));
        };
        let terminal = handle.position.lock().await.state.is_terminal();
        if !terminal {
            return Err(EngineError::InvalidSpec(format!(
                "仓位 {} 尚未进入终态，不能归档",
                id
            )));
        }
        positions.remove(id);
        self.ctx.store.remove(id)?;
        log::info!("🗄 仓位 {} 已归档", id);
        Ok(())
    }

    /// 启动时从持久化存储恢复仓位，非终态仓位重新进入监督
    pub async fn resume_from_store(&self) -> Result<usize> {
        let snapshots = self.ctx.store.load_all()?;
        let mut resumed = 0;

        for snapshot in snapshots {
            let id = snapshot.position.id.clone();
            self.ctx.ledger.adopt(snapshot.orders).await;

            let terminal = snapshot.position.state.is_terminal();
            let shared = Arc::new(Mutex::new(snapshot.position));
            let task = if terminal {
                None
            } else {
                resumed += 1;
                log::info!("🔄 恢复仓位 {} 的监督任务", id);
                Some(spawn_supervision_task(
                    shared.clone(),
                    self.ctx.clone(),
                    self.running.clone(),
                ))
            };

            self.positions.write().await.insert(
                id,
                PositionHandle {
                    position: shared,
                    task,
                },
            );
        }

        if resumed > 0 {
            log::info!("✅ 从持久化存储恢复了 {} 个未完结仓位", resumed);
        }
        Ok(resumed)
    }

    /// 优雅停机：通知全部监督任务退出并等待收尾
    pub async fn shutdown(&self) {
        *self.running.write().await = false;

        let mut positions = self.positions.write().await;
        for (id, handle) in positions.iter_mut() {
            if let Some(task) = handle.task.take() {
                if let Err(e) = task.await {
                    log::warn!("⚠️ 仓位 {} 监控任务异常退出: {}", id, e);
                }
            }
        }
        log::info!("引擎已停机，全部监控任务退出");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{MonitorConfig, RiskParams};
    use crate::core::retry::RetryConfig;
    use crate::core::types::{LifecycleState, PositionSide, TpLevel};
    use crate::engine::ledger::OrderLedger;
    use crate::engine::testkit::FakeGateway;
    use crate::notify::StatusBus;
    use crate::persist::PositionStore;

    fn test_ctx(gateway: Arc<FakeGateway>) -> Arc<MonitorContext> {
        let retry = RetryConfig {
            max_retries: 1,
            initial_delay_ms: 1,
            max_delay_ms: 2,
            backoff_factor: 1.0,
            jitter: false,
        };
        let dir = std::env::temp_dir().join(format!(
            "rustpos-registry-{}-{:x}",
            std::process::id(),
            chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0)
        ));
        Arc::new(MonitorContext {
            gateway: gateway.clone(),
            ledger: Arc::new(OrderLedger::new(gateway, retry.clone())),
            store: Arc::new(PositionStore::new(dir).unwrap()),
            bus: StatusBus::new(64),
            risk: RiskParams::default(),
            monitor: MonitorConfig {
                poll_interval_secs: 1,
            },
            retry,
        })
    }

    fn valid_spec() -> PositionSpec {
        PositionSpec {
            symbol: "BTC/USDT".to_string(),
            side: PositionSide::Long,
            quantity: 100.0,
            entry_price: Some(100.0),
            leverage: 5,
            tp_levels: vec![TpLevel {
                price_offset_pct: 2.0,
                close_pct: 50.0,
            }],
            stop_price: 97.0,
        }
    }

    #[tokio::test]
    async fn test_invalid_spec_creates_nothing() {
        let gateway = Arc::new(FakeGateway::new(105.0));
        let registry = PositionRegistry::new(test_ctx(gateway.clone()));

        let mut spec = valid_spec();
        spec.tp_levels = vec![
            TpLevel {
                price_offset_pct: 2.0,
                close_pct: 70.0,
            },
            TpLevel {
                price_offset_pct: 4.0,
                close_pct: 50.0,
            },
        ]; // 合计120%

        let err = registry.create(spec).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidSpec(_)));
        assert!(registry.snapshot().await.is_empty());
        // 连网关都不应被触碰
        assert_eq!(gateway.placed_count().await, 0);
    }

    #[tokio::test]
    async fn test_create_and_snapshot() {
        let gateway = Arc::new(FakeGateway::new(105.0));
        let ctx = test_ctx(gateway);
        let registry = PositionRegistry::new(ctx);

        let id = registry.create(valid_spec()).await.unwrap();
        let view = registry.get(&id).await.unwrap();
        assert_eq!(view.state, LifecycleState::PendingEntry);
        assert_eq!(view.symbol, "BTC/USDT");

        let snapshot = registry.snapshot().await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id, id);

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancel_unknown_position() {
        let gateway = Arc::new(FakeGateway::new(100.0));
        let registry = PositionRegistry::new(test_ctx(gateway));
        let err = registry.cancel("POS-nope").await.unwrap_err();
        assert!(matches!(err, EngineError::PositionNotFound(_)));
    }

    #[tokio::test]
    async fn test_archive_requires_terminal() {
        let gateway = Arc::new(FakeGateway::new(105.0));
        let registry = PositionRegistry::new(test_ctx(gateway));

        let id = registry.create(valid_spec()).await.unwrap();
        let err = registry.archive(&id).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidSpec(_)));

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_resume_from_store() {
        let gateway = Arc::new(FakeGateway::new(105.0));
        let ctx = test_ctx(gateway);

        // 第一个注册表创建仓位后整体停机
        {
            let registry = PositionRegistry::new(ctx.clone());
            registry.create(valid_spec()).await.unwrap();
            registry.shutdown().await;
        }

        // 新注册表从同一存储恢复
        let registry = PositionRegistry::new(ctx);
        let resumed = registry.resume_from_store().await.unwrap();
        assert_eq!(resumed, 1);
        assert_eq!(registry.snapshot().await.len(), 1);
        registry.shutdown().await;
    }
}
