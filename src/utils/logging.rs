//! 日志初始化
//! 控制台 + 按大小滚动的文件双路输出

use std::str::FromStr;

use log::LevelFilter;
use log4rs::append::console::ConsoleAppender;
use log4rs::append::rolling_file::policy::compound::roll::fixed_window::FixedWindowRoller;
use log4rs::append::rolling_file::policy::compound::trigger::size::SizeTrigger;
use log4rs::append::rolling_file::policy::compound::CompoundPolicy;
use log4rs::append::rolling_file::RollingFileAppender;
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;

use crate::core::error::EngineError;
use crate::core::types::Result;

const LOG_PATTERN: &str = "[{d(%Y-%m-%d %H:%M:%S%.3f)}] [{l}] [{M}] {m}{n}";
const MAX_FILE_SIZE: u64 = 10 * 1024 * 1024;
const ROLLED_FILE_COUNT: u32 = 5;

/// 初始化全局日志，进程内只能调用一次
pub fn init_logging(level: &str, log_dir: &str) -> Result<()> {
    let level_filter = LevelFilter::from_str(level).unwrap_or(LevelFilter::Info);

    let console = ConsoleAppender::builder()
        .encoder(Box::new(PatternEncoder::new(LOG_PATTERN)))
        .build();

    let roller = FixedWindowRoller::builder()
        .build(
            &format!("{}/rustpos.{{}}.log", log_dir),
            ROLLED_FILE_COUNT,
        )
        .map_err(|e| EngineError::Config(format!("创建日志滚动策略失败: {}", e)))?;
    let policy = CompoundPolicy::new(
        Box::new(SizeTrigger::new(MAX_FILE_SIZE)),
        Box::new(roller),
    );
    let file = RollingFileAppender::builder()
        .encoder(Box::new(PatternEncoder::new(LOG_PATTERN)))
        .build(format!("{}/rustpos.log", log_dir), Box::new(policy))
        .map_err(|e| EngineError::Config(format!("创建日志文件失败: {}", e)))?;

    let config = Config::builder()
        .appender(Appender::builder().build("console", Box::new(console)))
        .appender(Appender::builder().build("file", Box::new(file)))
        .build(
            Root::builder()
                .appender("console")
                .appender("file")
                .build(level_filter),
        )
        .map_err(|e| EngineError::Config(format!("日志配置错误: {}", e)))?;

    log4rs::init_config(config)
        .map_err(|e| EngineError::Config(format!("初始化日志失败: {}", e)))?;

    Ok(())
}
