use std::sync::Arc;

use clap::{Arg, Command};
use rustpos::core::config::{ApiKeys, EngineConfig};
use rustpos::core::gateway::ExchangeGateway;
use rustpos::core::types::PositionSpec;
use rustpos::engine::{MonitorContext, OrderLedger, PositionRegistry};
use rustpos::exchanges::{BinanceFuturesGateway, PaperGateway};
use rustpos::notify::{spawn_status_logger, StatusBus};
use rustpos::persist::PositionStore;
use rustpos::utils::init_logging;
use rustpos::RateLimiter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 加载环境变量
    dotenv::dotenv().ok();

    // 解析命令行参数
    let matches = Command::new("RustPOS")
        .version("0.1")
        .about("合约仓位风控引擎")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("引擎配置文件路径")
                .required(true),
        )
        .arg(
            Arg::new("spec")
                .short('s')
                .long("spec")
                .value_name("FILE")
                .help("启动时提交的仓位参数文件(YAML)"),
        )
        .get_matches();

    let config_file = matches.get_one::<String>("config").expect("参数已标记必填");
    let config = EngineConfig::from_file(config_file)?;

    init_logging(&config.log_level, &config.log_dir)?;
    log::info!(
        "启动引擎: config={}, exchange={}, paper={}",
        config_file,
        config.gateway.exchange,
        config.gateway.paper
    );

    // 共享限流器：全部仓位任务共用
    let rate_limiter = Arc::new(RateLimiter::new(config.gateway.rate_limit_rps));

    // 构建网关
    if config.gateway.exchange != "binance" {
        return Err(format!("不支持的交易所: {}", config.gateway.exchange).into());
    }
    let api_keys = match ApiKeys::from_env(&config.gateway.exchange) {
        Ok(keys) => keys,
        Err(e) if config.gateway.paper => {
            log::warn!("⚠️ 未配置API密钥（{}），纸面模式仅使用公共行情", e);
            ApiKeys::anonymous()
        }
        Err(e) => return Err(e.into()),
    };
    let binance = Arc::new(BinanceFuturesGateway::new(
        api_keys,
        config.gateway.testnet,
        rate_limiter,
    )?);
    let gateway: Arc<dyn ExchangeGateway> = if config.gateway.paper {
        log::info!("📝 纸面交易模式：订单在本地模拟成交");
        Arc::new(PaperGateway::new(binance))
    } else {
        binance
    };

    // 状态事件总线与内置日志订阅者
    let bus = StatusBus::new(256);
    let _logger_task = spawn_status_logger(&bus);

    let ctx = Arc::new(MonitorContext {
        gateway: gateway.clone(),
        ledger: Arc::new(OrderLedger::new(gateway, config.retry.clone())),
        store: Arc::new(PositionStore::new(config.state_dir.clone())?),
        bus,
        risk: config.risk,
        monitor: config.monitor,
        retry: config.retry.clone(),
    });

    let registry = Arc::new(PositionRegistry::new(ctx));

    // 恢复上次运行留下的仓位
    let resumed = registry.resume_from_store().await?;
    log::info!("已恢复 {} 个未完结仓位", resumed);

    // 可选：从文件提交一份新的仓位参数
    if let Some(spec_file) = matches.get_one::<String>("spec") {
        let contents = std::fs::read_to_string(spec_file)?;
        let spec: PositionSpec = serde_yaml::from_str(&contents)?;
        match registry.create(spec).await {
            Ok(id) => log::info!("✅ 仓位已创建: {}", id),
            Err(e) => log::error!("❌ 仓位创建失败: {}", e),
        }
    }

    // 保持运行直到收到停止信号
    tokio::signal::ctrl_c().await?;
    log::info!("收到停止信号，正在关闭引擎...");
    registry.shutdown().await;

    Ok(())
}
