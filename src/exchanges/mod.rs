pub mod binance;
pub mod paper;

pub use binance::BinanceFuturesGateway;
pub use paper::PaperGateway;
