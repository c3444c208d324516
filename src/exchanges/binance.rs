//! Binance USDT-M 合约网关
//! 通过 /fapi/v1 REST 接口实现交易能力，签名方式为参数排序后
//! HMAC-SHA256。所有请求先经过共享限流器。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use crate::core::config::ApiKeys;
use crate::core::error::EngineError;
use crate::core::gateway::{
    ExchangeGateway, GatewayOrderRequest, GatewayOrderType, OrderAck, OrderState,
};
use crate::core::rate_limit::RateLimiter;
use crate::core::types::{OrderSide, OrderStatus, Result};
use crate::utils::SignatureHelper;

const MAINNET_BASE_URL: &str = "https://fapi.binance.com";
const TESTNET_BASE_URL: &str = "https://testnet.binancefuture.com";
const RECV_WINDOW_MS: &str = "5000";

/// Binance合约网关
pub struct BinanceFuturesGateway {
    client: reqwest::Client,
    api_keys: ApiKeys,
    base_url: String,
    rate_limiter: Arc<RateLimiter>,
}

impl BinanceFuturesGateway {
    pub fn new(api_keys: ApiKeys, testnet: bool, rate_limiter: Arc<RateLimiter>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent("rustpos/0.1")
            .timeout(std::time::Duration::from_secs(30))
            .tcp_nodelay(true)
            .build()
            .map_err(|e| EngineError::Config(format!("创建HTTP客户端失败: {}", e)))?;

        let base_url = if testnet {
            TESTNET_BASE_URL.to_string()
        } else {
            MAINNET_BASE_URL.to_string()
        };

        Ok(Self {
            client,
            api_keys,
            base_url,
            rate_limiter,
        })
    }

    /// 交易对转交易所格式: BTC/USDT -> BTCUSDT
    fn exchange_symbol(symbol: &str) -> String {
        symbol.replace('/', "").to_uppercase()
    }

    /// 发送签名请求
    async fn send_signed_request<T>(
        &self,
        method: &str,
        endpoint: &str,
        mut params: HashMap<String, String>,
    ) -> Result<T>
    where
        T: for<'de> Deserialize<'de>,
    {
        self.rate_limiter.acquire().await?;

        let timestamp = chrono::Utc::now().timestamp_millis().to_string();
        params.insert("timestamp".to_string(), timestamp);
        params.insert("recvWindow".to_string(), RECV_WINDOW_MS.to_string());

        // 按字母顺序排序参数生成签名
        let query_string = SignatureHelper::build_query_string(&params);
        let signature =
            SignatureHelper::binance_signature(&self.api_keys.api_secret, &query_string);
        let url = format!(
            "{}{}?{}&signature={}",
            self.base_url, endpoint, query_string, signature
        );

        let request = match method {
            "GET" => self.client.get(&url),
            "POST" => self.client.post(&url),
            "DELETE" => self.client.delete(&url),
            _ => {
                return Err(EngineError::Other(format!(
                    "不支持的HTTP方法: {}",
                    method
                )))
            }
        };

        let response = request
            .header("X-MBX-APIKEY", &self.api_keys.api_key)
            .send()
            .await?;

        self.handle_response(response, method, endpoint).await
    }

    /// 发送公共请求（行情类接口无需签名）
    async fn send_public_request<T>(
        &self,
        endpoint: &str,
        params: HashMap<String, String>,
    ) -> Result<T>
    where
        T: for<'de> Deserialize<'de>,
    {
        self.rate_limiter.acquire().await?;

        let mut url = format!("{}{}", self.base_url, endpoint);
        if !params.is_empty() {
            url = format!("{}?{}", url, SignatureHelper::build_query_string(&params));
        }

        let response = self.client.get(&url).send().await?;
        self.handle_response(response, "GET", endpoint).await
    }

    async fn handle_response<T>(
        &self,
        response: reqwest::Response,
        method: &str,
        endpoint: &str,
    ) -> Result<T>
    where
        T: for<'de> Deserialize<'de>,
    {
        let status = response.status();
        if status.is_success() {
            return Ok(response.json::<T>().await?);
        }

        let status_code = status.as_u16() as i32;
        let body = response.text().await.unwrap_or_else(|_| "未知错误".to_string());

        // 限流类错误同时反馈给限流器降速
        if status_code == 429 || status_code == 418 {
            self.rate_limiter.report_error().await;
            return Err(EngineError::RateLimited(body, None));
        }
        if status_code >= 500 {
            return Err(EngineError::Api {
                code: status_code,
                message: body,
            });
        }

        // 业务错误体: {"code": -2013, "msg": "Order does not exist."}
        #[derive(Deserialize)]
        struct BinanceErrorBody {
            code: i32,
            msg: String,
        }
        if let Ok(err_body) = serde_json::from_str::<BinanceErrorBody>(&body) {
            if err_body.code == -2013 || err_body.code == -2011 {
                return Err(EngineError::OrderNotFound(err_body.msg));
            }
            if method == "POST" && endpoint == "/fapi/v1/order" {
                return Err(EngineError::OrderRejected(format!(
                    "{} ({})",
                    err_body.msg, err_body.code
                )));
            }
            return Err(EngineError::Api {
                code: err_body.code,
                message: err_body.msg,
            });
        }

        Err(EngineError::Api {
            code: status_code,
            message: body,
        })
    }

    fn map_order_status(status: &str) -> OrderStatus {
        match status {
            "NEW" => OrderStatus::Open,
            "PARTIALLY_FILLED" => OrderStatus::PartiallyFilled,
            "FILLED" => OrderStatus::Filled,
            "CANCELED" | "EXPIRED" => OrderStatus::Cancelled,
            "REJECTED" => OrderStatus::Rejected,
            _ => OrderStatus::Pending,
        }
    }
}

/// Binance订单响应（下单与查询共用字段集）
#[derive(Debug, Deserialize)]
struct BinanceOrderResponse {
    #[serde(rename = "orderId")]
    order_id: i64,
    status: String,
    #[serde(rename = "executedQty", default)]
    executed_qty: String,
    #[serde(rename = "avgPrice", default)]
    avg_price: String,
}

impl BinanceOrderResponse {
    fn filled_qty(&self) -> f64 {
        self.executed_qty.parse().unwrap_or(0.0)
    }

    fn average_price(&self) -> Option<f64> {
        match self.avg_price.parse::<f64>() {
            Ok(p) if p > 0.0 => Some(p),
            _ => None,
        }
    }
}

#[async_trait]
impl ExchangeGateway for BinanceFuturesGateway {
    fn name(&self) -> &str {
        "binance-futures"
    }

    async fn place_order(&self, request: GatewayOrderRequest) -> Result<OrderAck> {
        let mut params = HashMap::new();
        params.insert(
            "symbol".to_string(),
            Self::exchange_symbol(&request.symbol),
        );
        params.insert(
            "side".to_string(),
            match request.side {
                OrderSide::Buy => "BUY".to_string(),
                OrderSide::Sell => "SELL".to_string(),
            },
        );
        params.insert(
            "type".to_string(),
            match request.order_type {
                GatewayOrderType::Market => "MARKET".to_string(),
                GatewayOrderType::Limit => "LIMIT".to_string(),
                GatewayOrderType::StopMarket => "STOP_MARKET".to_string(),
            },
        );
        params.insert("quantity".to_string(), request.quantity.to_string());
        params.insert(
            "newClientOrderId".to_string(),
            request.client_order_id.clone(),
        );

        if let Some(price) = request.price {
            params.insert("price".to_string(), price.to_string());
        }
        if request.order_type == GatewayOrderType::Limit {
            params.insert("timeInForce".to_string(), "GTC".to_string());
        }
        if let Some(stop_price) = request.stop_price {
            params.insert("stopPrice".to_string(), stop_price.to_string());
        }
        if request.reduce_only {
            params.insert("reduceOnly".to_string(), "true".to_string());
        }

        let response: BinanceOrderResponse = self
            .send_signed_request("POST", "/fapi/v1/order", params)
            .await?;

        Ok(OrderAck {
            exchange_order_id: response.order_id.to_string(),
            status: Self::map_order_status(&response.status),
            filled_qty: response.filled_qty(),
        })
    }

    async fn cancel_order(&self, symbol: &str, exchange_order_id: &str) -> Result<()> {
        let mut params = HashMap::new();
        params.insert("symbol".to_string(), Self::exchange_symbol(symbol));
        params.insert("orderId".to_string(), exchange_order_id.to_string());

        let _: BinanceOrderResponse = self
            .send_signed_request("DELETE", "/fapi/v1/order", params)
            .await?;
        Ok(())
    }

    async fn fetch_order(&self, symbol: &str, exchange_order_id: &str) -> Result<OrderState> {
        let mut params = HashMap::new();
        params.insert("symbol".to_string(), Self::exchange_symbol(symbol));
        params.insert("orderId".to_string(), exchange_order_id.to_string());

        let response: BinanceOrderResponse = self
            .send_signed_request("GET", "/fapi/v1/order", params)
            .await?;

        Ok(OrderState {
            exchange_order_id: response.order_id.to_string(),
            status: Self::map_order_status(&response.status),
            filled_qty: response.filled_qty(),
            avg_price: response.average_price(),
        })
    }

    async fn fetch_price(&self, symbol: &str) -> Result<f64> {
        #[derive(Deserialize)]
        struct TickerPrice {
            price: String,
        }

        let mut params = HashMap::new();
        params.insert("symbol".to_string(), Self::exchange_symbol(symbol));

        let ticker: TickerPrice = self
            .send_public_request("/fapi/v1/ticker/price", params)
            .await?;
        ticker
            .price
            .parse()
            .map_err(|e| EngineError::Other(format!("行情价格解析失败: {}", e)))
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<()> {
        #[derive(Deserialize)]
        struct LeverageResponse {
            #[serde(rename = "leverage")]
            _leverage: u32,
        }

        let mut params = HashMap::new();
        params.insert("symbol".to_string(), Self::exchange_symbol(symbol));
        params.insert("leverage".to_string(), leverage.to_string());

        let _: LeverageResponse = self
            .send_signed_request("POST", "/fapi/v1/leverage", params)
            .await?;
        log::info!("杠杆已设置: {} {}x", symbol, leverage);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exchange_symbol_format() {
        assert_eq!(
            BinanceFuturesGateway::exchange_symbol("BTC/USDT"),
            "BTCUSDT"
        );
        assert_eq!(BinanceFuturesGateway::exchange_symbol("ethusdt"), "ETHUSDT");
    }

    #[test]
    fn test_order_status_mapping() {
        assert_eq!(
            BinanceFuturesGateway::map_order_status("NEW"),
            OrderStatus::Open
        );
        assert_eq!(
            BinanceFuturesGateway::map_order_status("PARTIALLY_FILLED"),
            OrderStatus::PartiallyFilled
        );
        assert_eq!(
            BinanceFuturesGateway::map_order_status("FILLED"),
            OrderStatus::Filled
        );
        assert_eq!(
            BinanceFuturesGateway::map_order_status("CANCELED"),
            OrderStatus::Cancelled
        );
        assert_eq!(
            BinanceFuturesGateway::map_order_status("EXPIRED"),
            OrderStatus::Cancelled
        );
        assert_eq!(
            BinanceFuturesGateway::map_order_status("REJECTED"),
            OrderStatus::Rejected
        );
    }

    #[test]
    fn test_avg_price_zero_means_none() {
        let response = BinanceOrderResponse {
            order_id: 1,
            status: "NEW".to_string(),
            executed_qty: "0".to_string(),
            avg_price: "0.00000".to_string(),
        };
        assert_eq!(response.average_price(), None);
    }
}
