//! Shared test support: scripted mock providers, a collecting route
//! observer and a state backend that refuses to answer.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use llm_router::{
    ChatCompletion, ChatStream, JsonMap, Message, Provider, ProviderError, RouteEvent,
    RouteObserver, StateBackend, StateError, StreamChunk,
};

/// Scripted outcome for one mock call. When the script is empty the
/// provider succeeds with its default completion.
pub enum MockOutcome {
    /// `chat` succeeds / `stream` yields the content then `Done`
    Succeed {
        content: String,
        input_tokens: u64,
        output_tokens: u64,
    },
    /// `chat` fails / `stream` refuses to open
    Fail(ProviderError),
    /// `stream` opens and yields the scripted items in order
    StreamItems(Vec<Result<StreamChunk, ProviderError>>),
}

pub struct MockProvider {
    name: String,
    model: String,
    rpm_limit: u32,
    tpm_limit: u64,
    weight: f64,
    default_input_tokens: u64,
    default_output_tokens: u64,
    script: Mutex<VecDeque<MockOutcome>>,
    calls: AtomicU32,
}

impl MockProvider {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            model: format!("{name}-model"),
            rpm_limit: 100,
            tpm_limit: 10_000,
            weight: 1.0,
            default_input_tokens: 50,
            default_output_tokens: 50,
            script: Mutex::new(VecDeque::new()),
            calls: AtomicU32::new(0),
        }
    }

    pub fn with_limits(mut self, rpm_limit: u32, tpm_limit: u64) -> Self {
        self.rpm_limit = rpm_limit;
        self.tpm_limit = tpm_limit;
        self
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    /// Token counts reported by default completions; each successful
    /// call contributes `input + output` tokens to the usage window.
    pub fn with_default_tokens(mut self, input: u64, output: u64) -> Self {
        self.default_input_tokens = input;
        self.default_output_tokens = output;
        self
    }

    pub fn with_model(mut self, model: &str) -> Self {
        self.model = model.to_string();
        self
    }

    /// Queue an outcome for the next call.
    pub fn push(&self, outcome: MockOutcome) {
        self.script.lock().unwrap().push_back(outcome);
    }

    /// Queue `n` failures built by `make`.
    pub fn push_failures(&self, n: usize, make: impl Fn() -> ProviderError) {
        for _ in 0..n {
            self.push(MockOutcome::Fail(make()));
        }
    }

    /// Number of times `chat` or `stream` was actually invoked.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn next_outcome(&self) -> Option<MockOutcome> {
        self.script.lock().unwrap().pop_front()
    }

    fn default_completion(&self) -> ChatCompletion {
        ChatCompletion {
            content: format!("ok from {}", self.name),
            input_tokens: self.default_input_tokens,
            output_tokens: self.default_output_tokens,
        }
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn rpm_limit(&self) -> u32 {
        self.rpm_limit
    }

    fn tpm_limit(&self) -> u64 {
        self.tpm_limit
    }

    fn weight(&self) -> f64 {
        self.weight
    }

    async fn chat(
        &self,
        _messages: &[Message],
        _max_tokens: Option<u32>,
        _temperature: Option<f32>,
        _options: &JsonMap,
    ) -> Result<ChatCompletion, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.next_outcome() {
            Some(MockOutcome::Succeed {
                content,
                input_tokens,
                output_tokens,
            }) => Ok(ChatCompletion {
                content,
                input_tokens,
                output_tokens,
            }),
            Some(MockOutcome::Fail(err)) => Err(err),
            Some(MockOutcome::StreamItems(_)) => {
                panic!("stream outcome queued for a chat call")
            }
            None => Ok(self.default_completion()),
        }
    }

    async fn stream(
        &self,
        _messages: &[Message],
        _max_tokens: Option<u32>,
        _temperature: Option<f32>,
        _options: &JsonMap,
    ) -> Result<ChatStream, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let items: Vec<Result<StreamChunk, ProviderError>> = match self.next_outcome() {
            Some(MockOutcome::Succeed {
                content,
                input_tokens,
                output_tokens,
            }) => vec![
                Ok(StreamChunk::Delta(content)),
                Ok(StreamChunk::Done {
                    input_tokens,
                    output_tokens,
                }),
            ],
            Some(MockOutcome::Fail(err)) => return Err(err),
            Some(MockOutcome::StreamItems(items)) => items,
            None => {
                let completion = self.default_completion();
                vec![
                    Ok(StreamChunk::Delta(completion.content)),
                    Ok(StreamChunk::Done {
                        input_tokens: completion.input_tokens,
                        output_tokens: completion.output_tokens,
                    }),
                ]
            }
        };
        Ok(Box::pin(futures::stream::iter(items)))
    }
}

/// Observer that records every event; optionally errors to prove the
/// router swallows observer failures.
#[derive(Default)]
pub struct CollectingObserver {
    pub events: Mutex<Vec<RouteEvent>>,
    pub fail: bool,
}

impl CollectingObserver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
            fail: true,
        })
    }

    pub fn events(&self) -> Vec<RouteEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl RouteObserver for CollectingObserver {
    async fn on_route(
        &self,
        event: RouteEvent,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.events.lock().unwrap().push(event);
        if self.fail {
            return Err("observer exploded".into());
        }
        Ok(())
    }
}

/// Backend whose usage reads and writes always fail, for exercising the
/// reduced-visibility policy.
pub struct FailingStateBackend;

#[async_trait]
impl StateBackend for FailingStateBackend {
    async fn record_request(
        &self,
        _provider: &str,
        _tokens: u64,
        _window_seconds: u64,
    ) -> Result<(), StateError> {
        Err(StateError::Unavailable("backend offline".to_string()))
    }

    async fn get_usage(&self, _provider: &str, _window_seconds: u64) -> Result<(u32, u64), StateError> {
        Err(StateError::Unavailable("backend offline".to_string()))
    }

    async fn get_session_provider(&self, _session_id: &str) -> Result<Option<String>, StateError> {
        Ok(None)
    }

    async fn set_session_provider(
        &self,
        _session_id: &str,
        _provider: &str,
        _ttl_seconds: u64,
    ) -> Result<(), StateError> {
        Err(StateError::Unavailable("backend offline".to_string()))
    }
}
