pub mod core;
pub mod engine;
pub mod exchanges;
pub mod notify;
pub mod persist;
pub mod utils;

// 选择性导出，避免命名冲突
pub use self::core::{config::*, error::*, gateway::*, rate_limit::RateLimiter, types::*};
pub use self::engine::{MonitorContext, OrderLedger, Position, PositionRegistry};
pub use self::exchanges::{BinanceFuturesGateway, PaperGateway};
pub use self::notify::{spawn_status_logger, StatusBus};
pub use self::persist::{PersistedPosition, PositionStore};
