use serde::{Deserialize, Serialize};
use std::fs;

use crate::core::error::EngineError;
use crate::core::retry::RetryConfig;
use crate::core::types::Result;

/// 引擎全局配置，从YAML文件加载
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub risk: RiskParams,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default = "default_state_dir")]
    pub state_dir: String,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_state_dir() -> String {
    "state/positions".to_string()
}

fn default_log_dir() -> String {
    "logs".to_string()
}

fn default_log_level() -> String {
    "INFO".to_string()
}

impl EngineConfig {
    /// 从YAML文件加载配置
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("读取配置文件 {} 失败: {}", path, e)))?;
        let config: EngineConfig = serde_yaml::from_str(&contents)?;
        Ok(config)
    }
}

/// 网关配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// 交易所名称，目前支持 binance
    pub exchange: String,
    #[serde(default)]
    pub testnet: bool,
    /// 纸面交易模式：订单在本地模拟成交，不触碰真实账户
    #[serde(default)]
    pub paper: bool,
    #[serde(default = "default_rate_limit_rps")]
    pub rate_limit_rps: u32,
}

fn default_rate_limit_rps() -> u32 {
    8
}

/// 风控决策参数
/// 保本缓冲与追踪步长的具体大小由部署环境决定，这里只提供保守默认值
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RiskParams {
    /// 入场失效阈值：入场前价格偏离入场价超过该百分比即放弃
    #[serde(default = "default_invalidation_pct")]
    pub invalidation_pct: f64,
    /// 保本缓冲：止损抬到入场价之外的该百分比处，覆盖手续费
    #[serde(default = "default_breakeven_buffer_pct")]
    pub breakeven_buffer_pct: f64,
    /// 追踪步长：自上次移动止损后价格再有利变动该百分比才再次移动
    #[serde(default = "default_trailing_step_pct")]
    pub trailing_step_pct: f64,
    /// 追踪距离：移动后止损与最新价保持的百分比距离
    #[serde(default = "default_trailing_distance_pct")]
    pub trailing_distance_pct: f64,
}

fn default_invalidation_pct() -> f64 {
    5.0
}
fn default_breakeven_buffer_pct() -> f64 {
    0.1
}
fn default_trailing_step_pct() -> f64 {
    1.0
}
fn default_trailing_distance_pct() -> f64 {
    1.0
}

impl Default for RiskParams {
    fn default() -> Self {
        Self {
            invalidation_pct: default_invalidation_pct(),
            breakeven_buffer_pct: default_breakeven_buffer_pct(),
            trailing_step_pct: default_trailing_step_pct(),
            trailing_distance_pct: default_trailing_distance_pct(),
        }
    }
}

/// 仓位轮询配置
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

fn default_poll_interval_secs() -> u64 {
    2
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

/// API密钥配置
#[derive(Debug, Clone)]
pub struct ApiKeys {
    pub api_key: String,
    pub api_secret: String,
}

impl ApiKeys {
    /// 从环境变量加载API密钥
    pub fn from_env(exchange: &str) -> Result<Self> {
        dotenv::dotenv().ok(); // 加载.env文件，忽略错误

        let exchange_upper = exchange.to_uppercase();

        let api_key = std::env::var(format!("{}_API_KEY", exchange_upper)).map_err(|_| {
            EngineError::Config(format!("未找到{}的API_KEY环境变量", exchange))
        })?;

        // 兼容两种格式的密钥名称
        let api_secret = std::env::var(format!("{}_API_SECRET", exchange_upper))
            .or_else(|_| std::env::var(format!("{}_SECRET_KEY", exchange_upper)))
            .map_err(|_| {
                EngineError::Config(format!(
                    "未找到{}的API_SECRET或SECRET_KEY环境变量",
                    exchange
                ))
            })?;

        Ok(ApiKeys {
            api_key,
            api_secret,
        })
    }

    /// 无密钥占位，仅供纸面交易模式使用公共行情接口
    pub fn anonymous() -> Self {
        Self {
            api_key: String::new(),
            api_secret: String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_yaml_with_defaults() {
        let yaml = r#"
gateway:
  exchange: binance
  paper: true
"#;
        let config: EngineConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.gateway.exchange, "binance");
        assert!(config.gateway.paper);
        assert_eq!(config.gateway.rate_limit_rps, 8);
        assert_eq!(config.monitor.poll_interval_secs, 2);
        assert_eq!(config.risk.invalidation_pct, 5.0);
        assert_eq!(config.state_dir, "state/positions");
        assert_eq!(config.retry.max_retries, 3);
    }

    #[test]
    fn test_risk_params_override() {
        let yaml = r#"
gateway:
  exchange: binance
risk:
  breakeven_buffer_pct: 0.2
  trailing_step_pct: 0.5
"#;
        let config: EngineConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.risk.breakeven_buffer_pct, 0.2);
        assert_eq!(config.risk.trailing_step_pct, 0.5);
        // 未覆盖的字段保持默认
        assert_eq!(config.risk.trailing_distance_pct, 1.0);
    }
}
