use std::sync::Mutex;

use async_trait::async_trait;

use crate::providers::{ChatProvider, ChatRequest, ChatResponse};
use crate::EvalError;

/// Replays a fixed list of responses in order. Used to exercise judge
/// graders without network access.
#[derive(Debug, Default)]
pub struct ScriptedProvider {
    responses: Mutex<Vec<String>>,
}

impl ScriptedProvider {
    pub fn new<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            responses: Mutex::new(responses.into_iter().map(Into::into).collect()),
        }
    }
}

#[async_trait]
impl ChatProvider for ScriptedProvider {
    async fn complete(&self, _request: ChatRequest) -> Result<ChatResponse, EvalError> {
        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            return Err(EvalError::Provider("no more scripted responses".to_string()));
        }
        let content = responses.remove(0);
        Ok(ChatResponse {
            content,
            usage: None,
        })
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}
