//! 订单ID与仓位ID生成
//! 客户端订单ID用于幂等识别，字符集限制为字母数字与短横线，
//! 以兼容各交易所对clientOrderId的约束。

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;

use crate::core::types::OrderKind;

static SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// 订单ID生成器
pub struct OrderIdGenerator {
    prefix: String,
}

impl OrderIdGenerator {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix
                .chars()
                .filter(|c| c.is_ascii_alphanumeric())
                .collect(),
        }
    }

    /// 生成带标签的ID：前缀-标签-毫秒时间戳(hex)-序号
    pub fn generate(&self, tag: &str) -> String {
        let millis = Utc::now().timestamp_millis().max(0) as u64;
        let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed) % 10_000;
        let id = format!("{}-{}-{:x}-{:04}", self.prefix, tag, millis, seq);
        // Binance限制clientOrderId长度不超过36
        id.chars().take(36).collect()
    }
}

/// 便捷函数：生成客户端订单ID
pub fn generate_client_order_id(kind: &OrderKind) -> String {
    OrderIdGenerator::new("RPS").generate(&kind.label())
}

/// 便捷函数：生成仓位ID
pub fn generate_position_id() -> String {
    OrderIdGenerator::new("POS").generate("p")
}
