//! The market analysis workflow: `collect -> analyze -> sentiment -> decide -> notify`.

use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use cryptoflow_core::config::{AppConfig, ModelConfig, WorkflowConfig};
use cryptoflow_core::error::{CryptoflowError, Result};
use cryptoflow_core::traits::{generate, LlmClient};
use cryptoflow_core::types::ChatMessage;
use cryptoflow_tools::ToolRegistry;

use crate::graph::{CompiledGraph, GraphBuilder, GraphDefinitionError, Node};

const DISCLAIMER: &str =
    "This is an automated analysis. Always do your own research before investing.";

/// Trend and signal derived from the 24h move.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TechnicalSignal {
    pub trend: String,
    pub signal: String,
    pub volume_status: String,
    pub change_pct_24h: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sentiment {
    /// In `[-1, 1]`.
    pub score: f64,
    pub label: String,
    pub news_count: usize,
    pub headlines: Vec<String>,
}

/// State threaded through the market workflow.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MarketState {
    pub symbol: String,
    pub action: String,
    pub price_data: Option<Value>,
    pub technical: Option<TechnicalSignal>,
    pub indicators: Option<Value>,
    pub sentiment: Option<Sentiment>,
    /// Raw model output of the decide step.
    pub decision: Option<String>,
    pub recommendation: String,
    /// In `[0, 1]`.
    pub confidence: f64,
    /// One line per step, in execution order.
    pub reasoning: Vec<String>,
    pub notification_sent: bool,
}

impl MarketState {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into().to_ascii_uppercase(),
            action: "analyze".into(),
            ..Self::default()
        }
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = action.into();
        self
    }
}

/// Collaborators shared by every node of the workflow.
#[derive(Clone)]
pub struct MarketContext {
    pub tools: Arc<ToolRegistry>,
    pub llm: Arc<dyn LlmClient>,
    /// Model settings for the decide step.
    pub model: ModelConfig,
    pub workflow: WorkflowConfig,
}

impl MarketContext {
    pub fn new(config: &AppConfig, llm: Arc<dyn LlmClient>, tools: Arc<ToolRegistry>) -> Self {
        Self {
            tools,
            llm,
            model: config
                .model
                .with_temperature(config.workflow.decision_temperature),
            workflow: config.workflow.clone(),
        }
    }
}

/// Classify a 24h move.
pub fn analyze_change(change_pct_24h: f64, volume: f64) -> TechnicalSignal {
    let (trend, signal) = if change_pct_24h > 5.0 {
        ("Strong Uptrend", "BUY")
    } else if change_pct_24h > 0.0 {
        ("Uptrend", "HOLD")
    } else if change_pct_24h > -5.0 {
        ("Downtrend", "HOLD")
    } else {
        ("Strong Downtrend", "SELL")
    };
    TechnicalSignal {
        trend: trend.into(),
        signal: signal.into(),
        volume_status: if volume > 1e9 { "High" } else { "Normal" }.into(),
        change_pct_24h,
    }
}

const POSITIVE: &[&str] = &[
    "adoption", "approval", "approved", "breakout", "bullish", "gain", "gains", "grows",
    "growth", "high", "lists", "milestone", "partnership", "rally", "record", "rise",
    "rises", "soar", "soars", "surge", "surges", "upgrade",
];

const NEGATIVE: &[&str] = &[
    "ban", "bearish", "collapse", "crash", "decline", "declines", "drop", "drops", "dump",
    "fear", "fraud", "hack", "hacked", "lawsuit", "loss", "losses", "plunge", "plunges",
    "selloff", "slump", "warning",
];

/// Keyword score of headlines in `[-1, 1]` with its label.
pub fn score_headlines(headlines: &[String]) -> (f64, &'static str) {
    let (mut pos, mut neg) = (0usize, 0usize);
    for headline in headlines {
        let lower = headline.to_lowercase();
        for word in lower.split(|c: char| !c.is_alphanumeric()) {
            if POSITIVE.contains(&word) {
                pos += 1;
            } else if NEGATIVE.contains(&word) {
                neg += 1;
            }
        }
    }
    if pos + neg == 0 {
        return (0.0, "Neutral");
    }
    let score = (pos as f64 - neg as f64) / (pos + neg) as f64;
    let label = if score > 0.2 {
        "Positive"
    } else if score < -0.2 {
        "Negative"
    } else {
        "Neutral"
    };
    (score, label)
}

#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub recommendation: String,
    pub confidence: f64,
    pub reasoning: String,
}

fn normalize_confidence(raw: f64) -> f64 {
    let c = if raw > 1.0 { raw / 100.0 } else { raw };
    c.clamp(0.0, 1.0)
}

/// Read `{recommendation, confidence, reasoning}` out of a model reply.
/// Confidence may be given as 0-1 or 0-100.
pub fn parse_decision(text: &str) -> Option<Decision> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end < start {
        return None;
    }
    let v: Value = serde_json::from_str(&text[start..=end]).ok()?;

    let raw = v.get("recommendation")?.as_str()?.to_ascii_uppercase();
    let recommendation = ["BUY", "SELL", "HOLD"]
        .into_iter()
        .find(|r| raw.contains(r))?;

    let confidence = match v.get("confidence")? {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().trim_end_matches('%').trim().parse::<f64>().ok()?,
        _ => return None,
    };
    if !confidence.is_finite() {
        return None;
    }

    Some(Decision {
        recommendation: recommendation.to_string(),
        confidence: normalize_confidence(confidence),
        reasoning: v
            .get("reasoning")
            .and_then(|r| r.as_str())
            .map(|r| r.trim().to_string())
            .unwrap_or_default(),
    })
}

/// Decision from the technical signal alone, with agreement between the
/// signal and news sentiment raising confidence.
pub fn fallback_decision(technical: &TechnicalSignal, sentiment: Option<&Sentiment>) -> Decision {
    let mut confidence = 0.5 + technical.change_pct_24h.abs().min(10.0) / 10.0 * 0.3;
    let score = sentiment.map_or(0.0, |s| s.score);
    let agrees = match technical.signal.as_str() {
        "BUY" => score > 0.2,
        "SELL" => score < -0.2,
        _ => score.abs() <= 0.2,
    };
    let conflicts = match technical.signal.as_str() {
        "BUY" => score < -0.2,
        "SELL" => score > 0.2,
        _ => false,
    };
    if agrees {
        confidence += 0.1;
    } else if conflicts {
        confidence -= 0.15;
    }

    Decision {
        recommendation: technical.signal.clone(),
        confidence: confidence.clamp(0.05, 0.95),
        reasoning: format!(
            "Rule-based: {} ({:+.2}% in 24h) with {} news sentiment ({:.2}).",
            technical.trend,
            technical.change_pct_24h,
            sentiment.map_or("no", |s| s.label.as_str()),
            score
        ),
    }
}

fn decision_prompt(state: &MarketState) -> String {
    let show = |v: Option<Value>| v.map_or_else(|| "{}".to_string(), |v| v.to_string());
    format!(
        "Analyze the following cryptocurrency data and provide an investment recommendation:

Symbol: {symbol}

Price Data:
{price}

Technical Indicators:
{technical}

Sentiment Data:
{sentiment}

Provide a clear recommendation (BUY/HOLD/SELL) with reasoning and confidence level (0-100%).
Format your response as JSON:
{{
    \"recommendation\": \"BUY/HOLD/SELL\",
    \"confidence\": 85,
    \"reasoning\": \"Your detailed reasoning here\"
}}",
        symbol = state.symbol,
        price = show(state.price_data.clone()),
        technical = show(
            state
                .technical
                .as_ref()
                .and_then(|t| serde_json::to_value(t).ok())
                .map(|mut t| {
                    if let (Some(obj), Some(ind)) = (t.as_object_mut(), &state.indicators) {
                        obj.insert("indicators".into(), ind.clone());
                    }
                    t
                })
        ),
        sentiment = show(state.sentiment.as_ref().and_then(|s| serde_json::to_value(s).ok())),
    )
}

/// Summary sent by the notify step.
pub fn notification_message(state: &MarketState) -> String {
    let technical = state.technical.as_ref();
    format!(
        "Crypto Analysis Complete: {symbol} ({action})

Decision: {rec} ({conf:.0}% confidence)
Technical Signal: {signal}
Trend: {trend}
Sentiment: {sentiment}

{reasoning}

{DISCLAIMER}",
        symbol = state.symbol,
        action = state.action,
        rec = state.recommendation,
        conf = state.confidence * 100.0,
        signal = technical.map_or("N/A", |t| t.signal.as_str()),
        trend = technical.map_or("N/A", |t| t.trend.as_str()),
        sentiment = state.sentiment.as_ref().map_or("N/A", |s| s.label.as_str()),
        reasoning = state.reasoning.join("\n"),
    )
}

/// Side-by-side summary of several finished analyses.
pub fn comparison_table(states: &[MarketState]) -> String {
    let mut out = format!(
        "{:<8} {:<14} {:>10}  {:<8} {:<18} {:<9}\n",
        "Symbol", "Recommendation", "Confidence", "Signal", "Trend", "Sentiment"
    );
    for state in states {
        let technical = state.technical.as_ref();
        out.push_str(&format!(
            "{:<8} {:<14} {:>9.0}%  {:<8} {:<18} {:<9}\n",
            state.symbol,
            state.recommendation,
            state.confidence * 100.0,
            technical.map_or("N/A", |t| t.signal.as_str()),
            technical.map_or("N/A", |t| t.trend.as_str()),
            state.sentiment.as_ref().map_or("N/A", |s| s.label.as_str()),
        ));
    }
    out
}

fn as_f64(v: &Value, key: &str) -> f64 {
    v.get(key).and_then(Value::as_f64).unwrap_or(0.0)
}

async fn call_json(tools: &ToolRegistry, name: &str, input: Value) -> Result<Value> {
    let result = tools.execute(name, input).await?;
    if result.is_error {
        return Err(CryptoflowError::ToolExecution {
            tool: name.to_string(),
            message: result.content,
        });
    }
    result.as_json().ok_or_else(|| CryptoflowError::ToolExecution {
        tool: name.to_string(),
        message: "result is not JSON".into(),
    })
}

/// Fetch the price snapshot. Without it the rest of the workflow has nothing to work on.
pub fn collect_node(ctx: &MarketContext) -> Node<MarketState> {
    let tools = ctx.tools.clone();
    Node::new("collect", move |mut state: MarketState| {
        let tools = tools.clone();
        async move {
            let data = call_json(&tools, "get_crypto_price", json!({ "symbol": state.symbol })).await?;
            let price = as_f64(&data, "current_price");
            let change = as_f64(&data, "price_change_percentage_24h");
            info!(symbol = %state.symbol, price, "Collected price data");
            state.reasoning.push(format!(
                "collect: {} at ${:.2} ({:+.2}% in 24h)",
                state.symbol, price, change
            ));
            state.price_data = Some(data);
            Ok(state)
        }
    })
}

/// Classify the 24h move; enrich with computed indicators when that tool is registered.
pub fn analyze_node(ctx: &MarketContext) -> Node<MarketState> {
    let tools = ctx.tools.clone();
    Node::new("analyze", move |mut state: MarketState| {
        let tools = tools.clone();
        async move {
            let Some(data) = &state.price_data else {
                return Err(CryptoflowError::Node(
                    "no price data to analyze".to_string(),
                ));
            };
            let technical = analyze_change(
                as_f64(data, "price_change_percentage_24h"),
                as_f64(data, "total_volume"),
            );

            if tools.get("calculate_indicators").is_some() {
                match call_json(&tools, "calculate_indicators", json!({ "symbol": state.symbol })).await {
                    Ok(ind) => state.indicators = Some(ind),
                    Err(e) => warn!(error = %e, "Indicator calculation failed; continuing without"),
                }
            }

            state.reasoning.push(format!(
                "analyze: {}, signal {}, volume {}",
                technical.trend, technical.signal, technical.volume_status
            ));
            state.technical = Some(technical);
            Ok(state)
        }
    })
}

/// Score recent headlines. Missing news degrades to a neutral reading.
pub fn sentiment_node(ctx: &MarketContext) -> Node<MarketState> {
    let tools = ctx.tools.clone();
    let limit = ctx.workflow.news_limit;
    Node::new("sentiment", move |mut state: MarketState| {
        let tools = tools.clone();
        async move {
            let input = json!({ "symbol": state.symbol, "limit": limit });
            let headlines: Vec<String> = match call_json(&tools, "get_crypto_news", input).await {
                Ok(news) => news["articles"]
                    .as_array()
                    .map(|articles| {
                        articles
                            .iter()
                            .filter_map(|a| a["title"].as_str().map(str::to_string))
                            .collect()
                    })
                    .unwrap_or_default(),
                Err(e) => {
                    warn!(error = %e, "News lookup failed; treating sentiment as neutral");
                    Vec::new()
                }
            };

            let (score, label) = score_headlines(&headlines);
            state.reasoning.push(format!(
                "sentiment: {label} ({score:+.2}) from {} headline(s)",
                headlines.len()
            ));
            state.sentiment = Some(Sentiment {
                score,
                label: label.to_string(),
                news_count: headlines.len(),
                headlines: headlines.into_iter().take(3).collect(),
            });
            Ok(state)
        }
    })
}

/// Ask the model for a recommendation, falling back to the technical signal.
pub fn decide_node(ctx: &MarketContext) -> Node<MarketState> {
    let llm = ctx.llm.clone();
    let model = ctx.model.clone();
    Node::new("decide", move |mut state: MarketState| {
        let llm = llm.clone();
        let model = model.clone();
        async move {
            let Some(technical) = state.technical.clone() else {
                return Err(CryptoflowError::Node(
                    "no technical analysis to decide on".to_string(),
                ));
            };

            let messages = vec![ChatMessage::user(decision_prompt(&state))];
            let reply = match generate(llm.as_ref(), &model, messages, |_| {}).await {
                Ok(generation) => Some(generation.text),
                Err(e) => {
                    warn!(error = %e, "Decision model call failed; using technical signal");
                    None
                }
            };

            let parsed = reply.as_deref().and_then(parse_decision);
            let (decision, source) = match parsed {
                Some(d) => (d, "model"),
                None => {
                    if reply.is_some() {
                        warn!("Decision reply was not valid JSON; using technical signal");
                    }
                    (fallback_decision(&technical, state.sentiment.as_ref()), "rules")
                }
            };

            info!(
                symbol = %state.symbol,
                recommendation = %decision.recommendation,
                confidence = decision.confidence,
                source,
                "Decision made"
            );
            let mut line = format!(
                "decide: {} at {:.0}% confidence ({source})",
                decision.recommendation,
                decision.confidence * 100.0
            );
            if !decision.reasoning.is_empty() {
                line.push_str(": ");
                line.push_str(&decision.reasoning);
            }
            state.reasoning.push(line);
            state.decision = reply;
            state.recommendation = decision.recommendation;
            state.confidence = decision.confidence;
            Ok(state)
        }
    })
}

/// Send the summary on the configured channel. Delivery failure is recorded, not fatal.
pub fn notify_node(ctx: &MarketContext) -> Node<MarketState> {
    let tools = ctx.tools.clone();
    let channel = ctx.workflow.notification_channel.clone();
    Node::new("notify", move |mut state: MarketState| {
        let tools = tools.clone();
        let channel = channel.clone();
        async move {
            let message = notification_message(&state);
            let input = json!({ "message": message, "channel": channel });
            state.notification_sent = match tools.execute("send_notification", input).await {
                Ok(result) if !result.is_error => true,
                Ok(result) => {
                    warn!(channel = %channel, result = %result.content, "Notification not delivered");
                    false
                }
                Err(e) => {
                    warn!(channel = %channel, error = %e, "Notification failed");
                    false
                }
            };
            Ok(state)
        }
    })
}

/// The five market nodes wired in a straight line.
pub fn market_graph(ctx: &MarketContext) -> GraphBuilder<MarketState> {
    GraphBuilder::new()
        .add_node(collect_node(ctx))
        .add_node(analyze_node(ctx))
        .add_node(sentiment_node(ctx))
        .add_node(decide_node(ctx))
        .add_node(notify_node(ctx))
        .add_edge("collect", "analyze")
        .add_edge("analyze", "sentiment")
        .add_edge("sentiment", "decide")
        .add_edge("decide", "notify")
        .set_entry("collect")
        .set_finish("notify")
        .max_revisits(ctx.workflow.max_revisits)
}

/// Validated and compiled market workflow.
pub fn market_workflow(
    ctx: &MarketContext,
) -> std::result::Result<CompiledGraph<MarketState>, GraphDefinitionError> {
    Ok(market_graph(ctx).build()?.compile())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{RunOptions, WorkflowError};
    use cryptoflow_test_utils::fixtures::{news, price_snapshot};
    use cryptoflow_test_utils::{MockLlm, MockTool};
    use tokio_util::sync::CancellationToken;

    struct Fixture {
        ctx: MarketContext,
        llm: MockLlm,
        price: MockTool,
        news: MockTool,
        notify: MockTool,
    }

    fn fixture(llm: MockLlm, change_pct: f64) -> Fixture {
        let price = MockTool::new("get_crypto_price")
            .returning(price_snapshot("BTC", 50_000.0, change_pct, 3.0e10));
        let news = MockTool::new("get_crypto_news").returning(news(
            "BTC",
            &[
                "BTC reaches new milestone as institutional adoption grows",
                "Analysts predict bullish trend for BTC in coming weeks",
                "Whale activity detected in BTC markets",
                "Exchange hack rattles traders",
            ],
        ));
        let notify = MockTool::new("send_notification").returning(json!({ "success": true }));
        let registry = ToolRegistry::builder()
            .register(price.clone())
            .register(news.clone())
            .register(notify.clone())
            .build()
            .unwrap();
        let ctx = MarketContext::new(
            &AppConfig::default(),
            Arc::new(llm.clone()),
            Arc::new(registry),
        );
        Fixture {
            ctx,
            llm,
            price,
            news,
            notify,
        }
    }

    #[test]
    fn test_analyze_thresholds() {
        assert_eq!(analyze_change(6.0, 2e9).signal, "BUY");
        assert_eq!(analyze_change(6.0, 2e9).volume_status, "High");
        assert_eq!(analyze_change(5.0, 0.0).trend, "Uptrend");
        assert_eq!(analyze_change(0.0, 0.0).trend, "Downtrend");
        assert_eq!(analyze_change(-4.9, 0.0).signal, "HOLD");
        let s = analyze_change(-5.0, 1e9);
        assert_eq!((s.trend.as_str(), s.signal.as_str()), ("Strong Downtrend", "SELL"));
        assert_eq!(s.volume_status, "Normal");
    }

    #[test]
    fn test_headline_scoring() {
        let (score, label) = score_headlines(&["Bitcoin rally hits record high".to_string()]);
        assert_eq!((score, label), (1.0, "Positive"));

        let (score, label) = score_headlines(&[
            "Exchange hack triggers crash".to_string(),
            "Regulators warn of fraud".to_string(),
        ]);
        assert_eq!(label, "Negative");
        assert!((-1.0..0.0).contains(&score));

        assert_eq!(score_headlines(&[]), (0.0, "Neutral"));
    }

    #[test]
    fn test_parse_decision() {
        let d = parse_decision(
            "Here you go:\n```json\n{\"recommendation\": \"buy\", \"confidence\": 85, \"reasoning\": \"momentum\"}\n```",
        )
        .unwrap();
        assert_eq!(d.recommendation, "BUY");
        assert!((d.confidence - 0.85).abs() < 1e-9);
        assert_eq!(d.reasoning, "momentum");

        let d = parse_decision(r#"{"recommendation": "HOLD", "confidence": 0.4}"#).unwrap();
        assert!((d.confidence - 0.4).abs() < 1e-9);
        assert!(d.reasoning.is_empty());

        let d = parse_decision(r#"{"recommendation": "SELL", "confidence": "90%"}"#).unwrap();
        assert!((d.confidence - 0.9).abs() < 1e-9);

        let d = parse_decision(r#"{"recommendation": "SELL", "confidence": 250}"#).unwrap();
        assert_eq!(d.confidence, 1.0);

        assert!(parse_decision(r#"{"recommendation": "MOON", "confidence": 99}"#).is_none());
        assert!(parse_decision("I think you should buy.").is_none());
    }

    #[test]
    fn test_fallback_uses_signal() {
        let technical = analyze_change(7.5, 2e9);
        let positive = Sentiment {
            score: 0.6,
            label: "Positive".into(),
            news_count: 3,
            headlines: vec![],
        };
        let with_news = fallback_decision(&technical, Some(&positive));
        let without = fallback_decision(&technical, None);
        assert_eq!(with_news.recommendation, "BUY");
        assert!(with_news.confidence > without.confidence);
        assert!((0.0..=1.0).contains(&without.confidence));
        assert!(!with_news.reasoning.is_empty());
    }

    #[test]
    fn test_comparison_table() {
        let mut btc = MarketState::new("btc");
        btc.recommendation = "BUY".into();
        btc.confidence = 0.82;
        btc.technical = Some(analyze_change(6.2, 3e10));
        let mut doge = MarketState::new("doge");
        doge.recommendation = "HOLD".into();
        doge.confidence = 0.5;

        let table = comparison_table(&[btc, doge]);
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("Symbol"));
        assert!(lines[1].starts_with("BTC"));
        assert!(lines[1].contains("82%"));
        assert!(lines[1].contains("Strong Uptrend"));
        assert!(lines[2].starts_with("DOGE"));
        assert!(lines[2].contains("N/A"));
    }

    #[tokio::test]
    async fn test_workflow_visits_nodes_in_order() {
        let llm = MockLlm::with_responses([
            r#"{"recommendation": "BUY", "confidence": 82, "reasoning": "Strong momentum with positive news."}"#,
        ]);
        let f = fixture(llm, 6.2);
        let graph = market_workflow(&f.ctx).unwrap();
        assert_eq!(
            graph.node_names(),
            vec!["collect", "analyze", "sentiment", "decide", "notify"]
        );

        let result = graph.run(MarketState::new("btc")).await.unwrap();
        assert_eq!(
            result.trace,
            vec!["collect", "analyze", "sentiment", "decide", "notify"]
        );

        let state = result.state;
        assert_eq!(state.recommendation, "BUY");
        assert!((0.0..=1.0).contains(&state.confidence));
        assert!((state.confidence - 0.82).abs() < 1e-9);
        assert!(!state.reasoning.is_empty());
        assert!(state.reasoning.iter().any(|l| l.contains("Strong momentum")));
        assert!(state.notification_sent);

        assert_eq!(f.price.inputs(), vec![json!({ "symbol": "BTC" })]);
        assert_eq!(f.news.inputs(), vec![json!({ "symbol": "BTC", "limit": 5 })]);
        let sentiment = state.sentiment.unwrap();
        assert_eq!(sentiment.news_count, 4);
        assert_eq!(sentiment.headlines.len(), 3);

        let sent = &f.notify.inputs()[0];
        assert_eq!(sent["channel"], "console");
        let message = sent["message"].as_str().unwrap();
        assert!(message.contains("Crypto Analysis Complete: BTC"));
        assert!(message.contains("Technical Signal: BUY"));
        assert!(message.ends_with(DISCLAIMER));

        let configs = f.llm.configs();
        assert_eq!(configs.len(), 1);
        assert!((configs[0].temperature - 0.3).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_decide_falls_back_when_model_fails() {
        let f = fixture(MockLlm::new().then_error("HTTP 503"), -7.0);
        let result = market_workflow(&f.ctx)
            .unwrap()
            .run(MarketState::new("BTC"))
            .await
            .unwrap();

        let state = result.state;
        assert_eq!(state.recommendation, "SELL");
        assert!((0.0..=1.0).contains(&state.confidence));
        assert!(state.decision.is_none());
        assert!(state.reasoning.iter().any(|l| l.contains("(rules)")));
        assert_eq!(result.trace.len(), 5);
    }

    #[tokio::test]
    async fn test_decide_falls_back_on_prose() {
        let f = fixture(MockLlm::with_responses(["I would hold for now."]), 1.0);
        let state = market_workflow(&f.ctx)
            .unwrap()
            .run(MarketState::new("BTC"))
            .await
            .unwrap()
            .state;
        assert_eq!(state.recommendation, "HOLD");
        assert_eq!(state.decision.as_deref(), Some("I would hold for now."));
    }

    #[tokio::test]
    async fn test_missing_price_tool_fails_collect() {
        let registry = ToolRegistry::builder().build().unwrap();
        let ctx = MarketContext::new(
            &AppConfig::default(),
            Arc::new(MockLlm::new()),
            Arc::new(registry),
        );
        let err = market_workflow(&ctx)
            .unwrap()
            .run(MarketState::new("BTC"))
            .await
            .unwrap_err();
        match err {
            WorkflowError::NodeExecution { node, source, state, trace } => {
                assert_eq!(node, "collect");
                assert!(matches!(source, CryptoflowError::ToolNotFound(_)));
                assert_eq!(state.symbol, "BTC");
                assert!(trace.is_empty());
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    fn retry_graph(f: &Fixture, revisits: usize) -> CompiledGraph<MarketState> {
        GraphBuilder::new()
            .add_node(collect_node(&f.ctx))
            .add_node(analyze_node(&f.ctx))
            .add_node(sentiment_node(&f.ctx))
            .add_node(decide_node(&f.ctx))
            .add_node(notify_node(&f.ctx))
            .add_edge("collect", "analyze")
            .add_edge("analyze", "sentiment")
            .add_edge("sentiment", "decide")
            .add_conditional_edges(
                "decide",
                |_: &MarketState| "retry".to_string(),
                [("retry", "analyze"), ("done", "notify")],
            )
            .set_entry("collect")
            .set_finish("notify")
            .max_revisits(revisits)
            .build()
            .unwrap()
            .compile()
    }

    #[tokio::test]
    async fn test_revisit_beyond_limit_stops_before_side_effects() {
        let f = fixture(MockLlm::repeating(r#"{"recommendation": "HOLD", "confidence": 50}"#), 1.0);
        let err = retry_graph(&f, 0)
            .run(MarketState::new("BTC"))
            .await
            .unwrap_err();
        assert!(matches!(&err, WorkflowError::CycleLimit { node, limit: 1, .. } if node == "analyze"));
        assert_eq!(err.trace(), ["collect", "analyze", "sentiment", "decide"]);
        assert_eq!(f.notify.call_count(), 0);
        assert_eq!(f.news.call_count(), 1);

        let f = fixture(MockLlm::repeating(r#"{"recommendation": "HOLD", "confidence": 50}"#), 1.0);
        let err = retry_graph(&f, 1)
            .run(MarketState::new("BTC"))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::CycleLimit { limit: 2, .. }));
        assert_eq!(
            err.trace(),
            ["collect", "analyze", "sentiment", "decide", "analyze", "sentiment", "decide"]
        );
        assert_eq!(f.news.call_count(), 2);
        assert_eq!(f.llm.call_count(), 2);
        assert_eq!(f.notify.call_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_after_collect() {
        let f = fixture(MockLlm::repeating("{}"), 1.0);
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let collect = collect_node(&f.ctx);
        let collect_then_cancel = Node::new("collect", move |state: MarketState| {
            let step = (collect.transform)(state);
            let token = token.clone();
            async move {
                let out = step.await;
                token.cancel();
                out
            }
        });

        let graph = GraphBuilder::new()
            .add_node(collect_then_cancel)
            .add_node(analyze_node(&f.ctx))
            .add_node(sentiment_node(&f.ctx))
            .add_node(decide_node(&f.ctx))
            .add_node(notify_node(&f.ctx))
            .add_edge("collect", "analyze")
            .add_edge("analyze", "sentiment")
            .add_edge("sentiment", "decide")
            .add_edge("decide", "notify")
            .set_entry("collect")
            .set_finish("notify")
            .build()
            .unwrap()
            .compile();

        let err = graph
            .run_with(MarketState::new("BTC"), RunOptions::new().with_cancel(cancel))
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(err.trace(), ["collect"]);
        assert!(err.state().price_data.is_some());
        assert_eq!(f.news.call_count(), 0);
        assert_eq!(f.llm.call_count(), 0);
        assert_eq!(f.notify.call_count(), 0);
    }
}
