use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("网络请求错误: {0}")]
    Network(#[from] reqwest::Error),

    #[error("JSON序列化错误: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("YAML配置错误: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("API错误: {code} - {message}")]
    Api { code: i32, message: String },

    #[error("速率限制: {0}")]
    RateLimited(String, Option<u64>),

    #[error("超时: 操作 '{0}' 未在预期时间内完成")]
    Timeout(String),

    #[error("订单被交易所拒绝: {0}")]
    OrderRejected(String),

    #[error("订单未找到: {0}")]
    OrderNotFound(String),

    #[error("重复订单: 仓位 {position_id} 已存在未完结的 {kind} 订单")]
    DuplicateOrder { position_id: String, kind: String },

    #[error("无效的仓位参数: {0}")]
    InvalidSpec(String),

    #[error("仓位未找到: {0}")]
    PositionNotFound(String),

    #[error("本地状态损坏: {0}")]
    Corrupted(String),

    #[error("配置错误: {0}")]
    Config(String),

    #[error("其他错误: {0}")]
    Other(String),
}

/// 错误分类，决定调用方的处理方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// 瞬时错误：网络、超时、限流，按退避策略重试
    Transient,
    /// 交易所拒绝：通知用户，下一轮重新评估后再试
    Rejected,
    /// 调用方参数错误：同步拒绝，不进入任何状态
    Invalid,
    /// 本地状态损坏：冻结受影响仓位，等待人工处理
    Fatal,
}

impl EngineError {
    /// 错误归类
    pub fn class(&self) -> ErrorClass {
        match self {
            EngineError::Network(_) => ErrorClass::Transient,
            EngineError::Timeout(_) => ErrorClass::Transient,
            EngineError::RateLimited(_, _) => ErrorClass::Transient,
            EngineError::Io(_) => ErrorClass::Transient,
            EngineError::Api { code, .. } => {
                // HTTP 5xx 与限流码视为瞬时
                if *code >= 500 || *code == 429 || *code == 418 {
                    ErrorClass::Transient
                } else {
                    ErrorClass::Rejected
                }
            }
            EngineError::OrderRejected(_) => ErrorClass::Rejected,
            EngineError::OrderNotFound(_) => ErrorClass::Rejected,
            EngineError::Serde(_)
            | EngineError::Yaml(_)
            | EngineError::Config(_)
            | EngineError::InvalidSpec(_)
            | EngineError::DuplicateOrder { .. }
            | EngineError::PositionNotFound(_) => ErrorClass::Invalid,
            EngineError::Corrupted(_) => ErrorClass::Fatal,
            EngineError::Other(_) => ErrorClass::Rejected,
        }
    }

    /// 是否可以按退避策略重试
    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// 建议的重试等待时间(秒)
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            EngineError::RateLimited(_, retry_after) => retry_after.or(Some(1)),
            EngineError::Network(_) => Some(1),
            EngineError::Timeout(_) => Some(2),
            EngineError::Api { code, .. } if *code >= 500 => Some(5),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert_eq!(
            EngineError::Timeout("fetch_price".to_string()).class(),
            ErrorClass::Transient
        );
        assert_eq!(
            EngineError::Api {
                code: 503,
                message: "service unavailable".to_string()
            }
            .class(),
            ErrorClass::Transient
        );
        assert_eq!(
            EngineError::Api {
                code: 400,
                message: "margin insufficient".to_string()
            }
            .class(),
            ErrorClass::Rejected
        );
        assert_eq!(
            EngineError::InvalidSpec("tp总比例超过100%".to_string()).class(),
            ErrorClass::Invalid
        );
        assert_eq!(
            EngineError::Corrupted("remaining < 0".to_string()).class(),
            ErrorClass::Fatal
        );
    }

    #[test]
    fn test_rate_limit_retry_after() {
        let err = EngineError::RateLimited("too many requests".to_string(), Some(3));
        assert!(err.is_transient());
        assert_eq!(err.retry_after(), Some(3));
    }
}
