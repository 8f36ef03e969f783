use std::io::Write;

use serde_json::{json, Value};
use tempfile::NamedTempFile;

/// Price snapshot in the shape `get_crypto_price` returns.
pub fn price_snapshot(symbol: &str, price: f64, change_pct_24h: f64, volume: f64) -> Value {
    json!({
        "symbol": symbol.to_uppercase(),
        "name": symbol,
        "current_price": price,
        "market_cap": price * 19_000_000.0,
        "total_volume": volume,
        "price_change_24h": price * change_pct_24h / 100.0,
        "price_change_percentage_24h": change_pct_24h,
        "market_cap_rank": 1,
        "high_24h": price * 1.02,
        "low_24h": price * 0.98,
        "ath": price * 1.4,
        "atl": 100.0,
    })
}

/// News payload in the shape `get_crypto_news` returns.
pub fn news(symbol: &str, titles: &[&str]) -> Value {
    let articles: Vec<Value> = titles
        .iter()
        .enumerate()
        .map(|(i, t)| {
            json!({
                "title": t,
                "source": "Fixture",
                "url": format!("https://example.com/news/{i}"),
                "published_at": "2024-01-15",
            })
        })
        .collect();
    json!({
        "symbol": symbol.to_uppercase(),
        "article_count": articles.len(),
        "articles": articles,
    })
}

/// A model turn that calls a tool.
pub fn react_action(thought: &str, tool: &str, input: &Value) -> String {
    format!("Thought: {thought}\nAction: {tool}\nAction Input: {input}")
}

/// A model turn that answers.
pub fn react_final(answer: &str) -> String {
    format!("Thought: I now know the final answer\nFinal Answer: {answer}")
}

/// Write TOML to a temporary file that lives as long as the handle.
pub fn write_config(toml: &str) -> std::io::Result<NamedTempFile> {
    let mut file = NamedTempFile::new()?;
    file.write_all(toml.as_bytes())?;
    file.flush()?;
    Ok(file)
}
