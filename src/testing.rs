//! Scripted model invoker shared by the unit tests.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::invoker::{InvocationRequest, ModelInvoker, ProviderError, RawOutput};

#[derive(Debug, Clone)]
pub(crate) enum Reply {
    Text(String),
    Fail(ProviderError),
    /// Answer with text after a delay.
    Delay(Duration, String),
    /// Never answer.
    Hang,
    /// Panic inside the model call.
    Panic,
}

impl Reply {
    pub(crate) fn text(text: impl Into<String>) -> Self {
        Reply::Text(text.into())
    }
}

/// Answers prompts by substring match. Each needle holds a queue of replies;
/// the last reply repeats once the queue is drained.
pub(crate) struct ScriptedInvoker {
    rules: Mutex<Vec<(String, VecDeque<Reply>)>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedInvoker {
    pub(crate) fn new() -> Self {
        Self {
            rules: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn on(self, needle: &str, reply: Reply) -> Self {
        {
            let mut rules = self.rules.lock();
            match rules.iter_mut().find(|(n, _)| n == needle) {
                Some((_, queue)) => queue.push_back(reply),
                None => rules.push((needle.to_string(), VecDeque::from([reply]))),
            }
        }
        self
    }

    /// Prompts received so far, in call order.
    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn next_reply(&self, prompt: &str) -> Reply {
        let mut rules = self.rules.lock();
        for (needle, queue) in rules.iter_mut() {
            if prompt.contains(needle.as_str()) {
                if queue.len() > 1 {
                    if let Some(reply) = queue.pop_front() {
                        return reply;
                    }
                }
                if let Some(reply) = queue.front() {
                    return reply.clone();
                }
            }
        }
        Reply::text("ok")
    }
}

#[async_trait]
impl ModelInvoker for ScriptedInvoker {
    async fn invoke(&self, request: InvocationRequest) -> Result<RawOutput, ProviderError> {
        self.calls.lock().push(request.prompt.clone());
        match self.next_reply(&request.prompt) {
            Reply::Text(text) => Ok(RawOutput::Text(text)),
            Reply::Fail(err) => Err(err),
            Reply::Delay(delay, text) => {
                tokio::time::sleep(delay).await;
                Ok(RawOutput::Text(text))
            }
            Reply::Hang => std::future::pending().await,
            Reply::Panic => panic!("scripted invoker panic"),
        }
    }
}
