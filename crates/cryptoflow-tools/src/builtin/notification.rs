use std::path::PathBuf;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;

use cryptoflow_core::config::ToolsConfig;
use cryptoflow_core::error::{CryptoflowError, Result};
use cryptoflow_core::traits::Tool;
use cryptoflow_core::types::ToolResult;

/// Delivers a message to the console, a log file, or a Slack/Discord webhook.
pub struct NotificationTool {
    http: reqwest::Client,
    slack_webhook: Option<String>,
    discord_webhook: Option<String>,
    log_path: PathBuf,
}

#[derive(Deserialize)]
struct NotificationInput {
    message: String,
    #[serde(default = "default_channel")]
    channel: String,
}

fn default_channel() -> String {
    "console".into()
}

fn default_log_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
    PathBuf::from(home)
        .join(".cryptoflow")
        .join("notifications.log")
}

impl NotificationTool {
    pub fn new(config: &ToolsConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            slack_webhook: config.slack_webhook_url.clone(),
            discord_webhook: config.discord_webhook_url.clone(),
            log_path: config
                .notification_log
                .as_ref()
                .map(PathBuf::from)
                .unwrap_or_else(default_log_path),
        }
    }

    fn console(&self, message: &str) {
        let width = message.lines().map(|l| l.chars().count()).max().unwrap_or(0);
        let rule = "─".repeat(width + 2);
        println!("┌{rule}┐");
        for line in message.lines() {
            println!("│ {line:<width$} │");
        }
        println!("└{rule}┘");
    }

    async fn log(&self, channel: &str, message: &str) -> std::io::Result<()> {
        if let Some(dir) = self.log_path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let timestamp = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
        let entry = format!("[{timestamp}] [{channel}] {message}\n");
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .await?;
        file.write_all(entry.as_bytes()).await
    }

    async fn webhook(&self, url: &str, payload: Value) -> std::result::Result<(), String> {
        self.http
            .post(url)
            .timeout(Duration::from_secs(10))
            .json(&payload)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map(|_| ())
            .map_err(|e| e.to_string())
    }

    async fn deliver(&self, channel: &str, message: &str) -> std::result::Result<(), String> {
        match channel {
            "log" => self.log(channel, message).await.map_err(|e| e.to_string()),
            "slack" => match &self.slack_webhook {
                Some(url) => self.webhook(url, json!({ "text": message })).await,
                None => Err("Webhook not configured".into()),
            },
            "discord" => match &self.discord_webhook {
                Some(url) => self.webhook(url, json!({ "content": message })).await,
                None => Err("Webhook not configured".into()),
            },
            _ => {
                self.console(message);
                Ok(())
            }
        }
    }
}

impl Tool for NotificationTool {
    fn name(&self) -> &str {
        "send_notification"
    }

    fn description(&self) -> &str {
        "Send a notification message. Channels: console, log, slack, discord."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "message": { "type": "string", "description": "Notification message" },
                "channel": { "type": "string", "description": "Target channel (default: console)" }
            },
            "required": ["message"]
        })
    }

    fn has_side_effects(&self) -> bool {
        true
    }

    fn execute(&self, input: Value) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            let p: NotificationInput = serde_json::from_value(input).map_err(|e| {
                CryptoflowError::ToolValidation {
                    tool: "send_notification".into(),
                    message: e.to_string(),
                }
            })?;

            let channel = match p.channel.as_str() {
                "console" | "log" | "slack" | "discord" => p.channel.clone(),
                other => {
                    tracing::warn!(channel = other, "Unknown channel, defaulting to console");
                    "console".to_string()
                }
            };

            match self.deliver(&channel, &p.message).await {
                Ok(()) => {
                    tracing::info!(channel = %channel, "Notification sent");
                    Ok(ToolResult::json(&json!({
                        "success": true,
                        "channel": channel,
                        "message": p.message,
                    })))
                }
                Err(error) => {
                    tracing::warn!(channel = %channel, %error, "Notification failed");
                    Ok(ToolResult {
                        is_error: true,
                        ..ToolResult::json(&json!({
                            "success": false,
                            "channel": channel,
                            "error": error,
                        }))
                    })
                }
            }
        })
    }
}
