use std::collections::HashMap;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use cryptoflow_core::error::{CryptoflowError, Result};
use cryptoflow_core::traits::Tool;
use cryptoflow_core::types::ToolResult;

const COINGECKO_API_URL: &str = "https://api.coingecko.com/api/v3";

/// CoinGecko ids for common tickers. Unknown tickers are tried lowercased.
fn coin_id(symbol: &str) -> String {
    let id = match symbol.to_ascii_uppercase().as_str() {
        "BTC" => "bitcoin",
        "ETH" => "ethereum",
        "BNB" => "binancecoin",
        "SOL" => "solana",
        "ADA" => "cardano",
        "XRP" => "ripple",
        "DOT" => "polkadot",
        "DOGE" => "dogecoin",
        "AVAX" => "avalanche-2",
        "MATIC" => "matic-network",
        "LINK" => "chainlink",
        "UNI" => "uniswap",
        "ATOM" => "cosmos",
        "LTC" => "litecoin",
        "BCH" => "bitcoin-cash",
        _ => return symbol.to_ascii_lowercase(),
    };
    id.to_string()
}

#[derive(Deserialize)]
struct SymbolInput {
    symbol: String,
}

#[derive(Deserialize, Default)]
struct CoinResponse {
    #[serde(default)]
    name: String,
    #[serde(default)]
    market_data: MarketData,
}

#[derive(Deserialize, Default)]
struct MarketData {
    #[serde(default)]
    current_price: HashMap<String, f64>,
    #[serde(default)]
    market_cap: HashMap<String, f64>,
    #[serde(default)]
    total_volume: HashMap<String, f64>,
    #[serde(default)]
    high_24h: HashMap<String, f64>,
    #[serde(default)]
    low_24h: HashMap<String, f64>,
    #[serde(default)]
    ath: HashMap<String, f64>,
    #[serde(default)]
    atl: HashMap<String, f64>,
    #[serde(default)]
    price_change_24h: Option<f64>,
    #[serde(default)]
    price_change_percentage_24h: Option<f64>,
    #[serde(default)]
    market_cap_rank: Option<u64>,
}

fn usd(map: &HashMap<String, f64>) -> f64 {
    map.get("usd").copied().unwrap_or(0.0)
}

/// Current market snapshot for a ticker.
pub struct CryptoPriceTool {
    http: reqwest::Client,
    api_key: Option<String>,
    base_url: String,
}

impl CryptoPriceTool {
    pub fn new(api_key: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key,
            base_url: COINGECKO_API_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    /// Snapshot from CoinGecko, or offline sample data marked with `_note`
    /// when the API cannot be reached.
    pub async fn snapshot(&self, symbol: &str) -> Value {
        match self.fetch(symbol).await {
            Ok(v) => {
                info!(symbol, price = v["current_price"].as_f64().unwrap_or(0.0), "Fetched price data");
                v
            }
            Err(e) => {
                warn!(symbol, error = %e, "Price lookup failed, using sample data");
                sample_snapshot(symbol)
            }
        }
    }

    async fn fetch(&self, symbol: &str) -> Result<Value> {
        let url = format!("{}/coins/{}", self.base_url.trim_end_matches('/'), coin_id(symbol));
        let mut req = self
            .http
            .get(&url)
            .timeout(Duration::from_secs(10))
            .query(&[
                ("localization", "false"),
                ("tickers", "false"),
                ("market_data", "true"),
                ("community_data", "false"),
                ("developer_data", "false"),
            ]);
        if let Some(key) = &self.api_key {
            req = req.header("x-cg-pro-api-key", key);
        }

        let to_err = |e: reqwest::Error| CryptoflowError::ToolExecution {
            tool: "get_crypto_price".into(),
            message: e.to_string(),
        };
        let coin: CoinResponse = req
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(to_err)?
            .json()
            .await
            .map_err(to_err)?;

        let m = &coin.market_data;
        Ok(json!({
            "symbol": symbol.to_ascii_uppercase(),
            "name": coin.name,
            "current_price": usd(&m.current_price),
            "market_cap": usd(&m.market_cap),
            "total_volume": usd(&m.total_volume),
            "price_change_24h": m.price_change_24h.unwrap_or(0.0),
            "price_change_percentage_24h": m.price_change_percentage_24h.unwrap_or(0.0),
            "market_cap_rank": m.market_cap_rank.unwrap_or(0),
            "high_24h": usd(&m.high_24h),
            "low_24h": usd(&m.low_24h),
            "ath": usd(&m.ath),
            "atl": usd(&m.atl),
        }))
    }
}

fn sample_snapshot(symbol: &str) -> Value {
    let upper = symbol.to_ascii_uppercase();
    let btc = upper == "BTC";
    json!({
        "symbol": upper,
        "name": symbol,
        "current_price": if btc { 50000.0 } else { 3000.0 },
        "market_cap": 1_000_000_000_000.0,
        "total_volume": 50_000_000_000.0,
        "price_change_24h": 500.0,
        "price_change_percentage_24h": 1.2,
        "market_cap_rank": 1,
        "high_24h": if btc { 51000.0 } else { 3100.0 },
        "low_24h": if btc { 49000.0 } else { 2900.0 },
        "ath": if btc { 69000.0 } else { 4800.0 },
        "atl": if btc { 100.0 } else { 0.5 },
        "_note": "Sample data - price API unavailable",
    })
}

fn symbol_schema(extra: Value) -> Value {
    let mut properties = json!({
        "symbol": {
            "type": "string",
            "description": "Ticker symbol such as BTC or ETH"
        }
    });
    if let (Some(props), Some(extra)) = (properties.as_object_mut(), extra.as_object()) {
        props.extend(extra.clone());
    }
    json!({
        "type": "object",
        "properties": properties,
        "required": ["symbol"],
        "additionalProperties": false
    })
}

impl Tool for CryptoPriceTool {
    fn name(&self) -> &str {
        "get_crypto_price"
    }

    fn description(&self) -> &str {
        "Get current price, market cap, volume, and 24h change for a cryptocurrency."
    }

    fn input_schema(&self) -> Value {
        symbol_schema(json!({}))
    }

    fn timeout_secs(&self) -> u64 {
        15
    }

    fn execute(&self, input: Value) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            let p: SymbolInput = serde_json::from_value(input).map_err(|e| {
                CryptoflowError::ToolValidation {
                    tool: "get_crypto_price".into(),
                    message: e.to_string(),
                }
            })?;
            Ok(ToolResult::json(&self.snapshot(&p.symbol).await))
        })
    }
}

/// Recent headlines for a ticker.
pub struct CryptoNewsTool;

#[derive(Deserialize)]
struct NewsInput {
    symbol: String,
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    5
}

const HEADLINES: [&str; 5] = [
    "{} reaches new milestone as institutional adoption grows",
    "Analysts predict bullish trend for {} in coming weeks",
    "Major exchange lists {} trading pairs",
    "{} network upgrade scheduled for next month",
    "Whale activity detected in {} markets",
];

/// Templated articles; there is no news provider behind this tool.
pub fn headlines(symbol: &str, limit: usize) -> Value {
    let upper = symbol.to_ascii_uppercase();
    let articles: Vec<Value> = (0..limit)
        .map(|i| {
            json!({
                "title": HEADLINES[i % HEADLINES.len()].replace("{}", &upper),
                "source": "CryptoNews",
                "url": format!("https://example.com/news/{i}"),
                "published_at": chrono::Utc::now().format("%Y-%m-%d").to_string(),
            })
        })
        .collect();
    json!({
        "symbol": upper,
        "article_count": articles.len(),
        "articles": articles,
    })
}

impl Tool for CryptoNewsTool {
    fn name(&self) -> &str {
        "get_crypto_news"
    }

    fn description(&self) -> &str {
        "Get latest news headlines about a cryptocurrency."
    }

    fn input_schema(&self) -> Value {
        symbol_schema(json!({
            "limit": {
                "type": "integer",
                "description": "Number of articles (default 5)",
                "minimum": 1,
                "maximum": 20
            }
        }))
    }

    fn execute(&self, input: Value) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            let p: NewsInput = serde_json::from_value(input).map_err(|e| {
                CryptoflowError::ToolValidation {
                    tool: "get_crypto_news".into(),
                    message: e.to_string(),
                }
            })?;
            info!(symbol = %p.symbol, limit = p.limit, "Fetched news");
            Ok(ToolResult::json(&headlines(&p.symbol, p.limit)))
        })
    }
}
