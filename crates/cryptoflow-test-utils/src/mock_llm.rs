use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use futures::stream::BoxStream;

use cryptoflow_core::config::ModelConfig;
use cryptoflow_core::error::{CryptoflowError, Result};
use cryptoflow_core::traits::LlmClient;
use cryptoflow_core::types::{ChatMessage, StopReason, StreamDelta};

#[derive(Clone)]
enum Step {
    Text(String),
    Fail(String),
    Hang,
}

#[derive(Default)]
struct Inner {
    script: VecDeque<Step>,
    repeat: Option<Step>,
    calls: Vec<(ModelConfig, Vec<ChatMessage>)>,
}

/// Scripted model: each call consumes the next step of the script.
///
/// Clones share the script and the call log, so a test can keep a handle
/// after boxing the mock into a client or engine.
#[derive(Clone, Default)]
pub struct MockLlm {
    inner: Arc<Mutex<Inner>>,
}

impl MockLlm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mock answering with each response in order.
    pub fn with_responses<I, T>(responses: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        responses
            .into_iter()
            .fold(Self::new(), |mock, r| mock.then_text(r))
    }

    /// Mock that gives the same response forever.
    pub fn repeating(text: impl Into<String>) -> Self {
        let mock = Self::new();
        mock.lock().repeat = Some(Step::Text(text.into()));
        mock
    }

    /// Mock whose requests never complete.
    pub fn hanging() -> Self {
        let mock = Self::new();
        mock.lock().repeat = Some(Step::Hang);
        mock
    }

    pub fn then_text(self, text: impl Into<String>) -> Self {
        self.lock().script.push_back(Step::Text(text.into()));
        self
    }

    /// Queue a request failure (`LlmRequest` with this message).
    pub fn then_error(self, message: impl Into<String>) -> Self {
        self.lock().script.push_back(Step::Fail(message.into()));
        self
    }

    pub fn then_hang(self) -> Self {
        self.lock().script.push_back(Step::Hang);
        self
    }

    pub fn call_count(&self) -> usize {
        self.lock().calls.len()
    }

    /// Messages of every call so far.
    pub fn calls(&self) -> Vec<Vec<ChatMessage>> {
        self.lock().calls.iter().map(|(_, m)| m.clone()).collect()
    }

    /// Model settings of every call so far.
    pub fn configs(&self) -> Vec<ModelConfig> {
        self.lock().calls.iter().map(|(c, _)| c.clone()).collect()
    }

    /// All message contents of the most recent call, joined by newlines.
    pub fn last_prompt(&self) -> Option<String> {
        self.lock().calls.last().map(|(_, msgs)| {
            msgs.iter()
                .map(|m| m.content.as_str())
                .collect::<Vec<_>>()
                .join("\n")
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A panicking test poisons the lock; the data is still usable.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Split text into word-sized chunks so consumers exercise accumulation.
fn chunks(text: &str) -> Vec<Result<StreamDelta>> {
    let mut deltas: Vec<Result<StreamDelta>> = text
        .split_inclusive(' ')
        .map(|w| Ok(StreamDelta::TextDelta(w.to_string())))
        .collect();
    deltas.push(Ok(StreamDelta::Usage {
        input_tokens: 10,
        output_tokens: text.split_whitespace().count() as u64,
    }));
    deltas.push(Ok(StreamDelta::Stop(StopReason::EndTurn)));
    deltas
}

impl LlmClient for MockLlm {
    fn chat_stream(
        &self,
        config: &ModelConfig,
        messages: Vec<ChatMessage>,
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<StreamDelta>>>> {
        let step = {
            let mut inner = self.lock();
            inner.calls.push((config.clone(), messages));
            inner.script.pop_front().or_else(|| inner.repeat.clone())
        };

        Box::pin(async move {
            match step {
                Some(Step::Text(text)) => Ok(Box::pin(futures::stream::iter(chunks(&text)))
                    as BoxStream<'_, Result<StreamDelta>>),
                Some(Step::Fail(message)) => Err(CryptoflowError::LlmRequest(message)),
                Some(Step::Hang) => futures::future::pending().await,
                None => Err(CryptoflowError::LlmRequest(
                    "MockLlm: script exhausted".to_string(),
                )),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cryptoflow_core::traits::generate;

    #[tokio::test]
    async fn test_script_then_exhausted() {
        let mock = MockLlm::with_responses(["one two", "three"]);
        let cfg = ModelConfig::default();

        let a = generate(&mock, &cfg, vec![ChatMessage::user("q")], |_| {}).await.unwrap();
        let b = generate(&mock, &cfg, vec![], |_| {}).await.unwrap();
        assert_eq!(a.text, "one two");
        assert_eq!(b.text, "three");
        assert!(generate(&mock, &cfg, vec![], |_| {}).await.is_err());
        assert_eq!(mock.call_count(), 3);
    }

    #[tokio::test]
    async fn test_repeating_and_clone_share_log() {
        let mock = MockLlm::repeating("again");
        let handle = mock.clone();
        for _ in 0..3 {
            generate(&mock, &ModelConfig::default(), vec![], |_| {}).await.unwrap();
        }
        assert_eq!(handle.call_count(), 3);
    }
}
