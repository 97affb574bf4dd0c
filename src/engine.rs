//! Conversation engine
//!
//! Owns one chat's in-memory turn history and orchestrates a reply:
//! classify the message, fold the emotion distribution into a structured
//! prompt, hand the user turn to the injected message sink, then stream the
//! model's answer as lazily-pulled cleaned fragments. One engine instance
//! serves one chat; no concurrent callers are supported, so the history
//! needs no locking.

use crate::db::StoredMessage;
use crate::emotion::EmotionClassifier;
use crate::llm::{
    FragmentStream, GenRequest, GenerationService, LlmError, Role, StreamEvent, Turn,
};
use crate::prompt::{format_prompt, strip_boilerplate};
use crate::system_prompt::{REPLY_PROMPT, TITLE_PROMPT};
use futures::StreamExt;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Llm(#[from] LlmError),
    #[error("Failed to persist user turn: {0}")]
    Sink(#[from] crate::db::DbError),
}

/// Persistence seam between the engine and the chat store. Invoked
/// synchronously, once per reply, with the user turn only; persisting the
/// assistant turn stays with the caller after the stream is drained.
pub trait MessageSink: Send + Sync {
    fn record(
        &self,
        chat_id: &str,
        role: Role,
        content: &str,
        prompt: Option<&str>,
    ) -> Result<(), crate::db::DbError>;
}

impl MessageSink for crate::db::Database {
    fn record(
        &self,
        chat_id: &str,
        role: Role,
        content: &str,
        prompt: Option<&str>,
    ) -> Result<(), crate::db::DbError> {
        self.append_message(chat_id, role, content, prompt)?;
        Ok(())
    }
}

/// How a reply stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyOutcome {
    /// The model ran to completion.
    Completed,
    /// The remote model cut the stream short (safety stop or decode
    /// failure). The accumulated partial reply is retained.
    Truncated,
}

/// The sealed result of one reply invocation.
#[derive(Debug)]
pub struct Reply {
    pub text: String,
    pub outcome: ReplyOutcome,
}

pub struct ConversationEngine {
    chat_id: String,
    classifier: Arc<EmotionClassifier>,
    llm: Arc<dyn GenerationService>,
    sink: Option<Arc<dyn MessageSink>>,
    history: Vec<Turn>,
}

impl ConversationEngine {
    /// Build an engine for one chat, seeding in-memory history from the
    /// persisted messages: user turns replay the emotion-augmented prompt
    /// that was actually sent, assistant turns replay their content.
    pub fn new(
        chat_id: impl Into<String>,
        messages: &[StoredMessage],
        classifier: Arc<EmotionClassifier>,
        llm: Arc<dyn GenerationService>,
        sink: Option<Arc<dyn MessageSink>>,
    ) -> Self {
        let history = messages
            .iter()
            .map(|m| Turn {
                role: m.role,
                text: m.prompt.clone().unwrap_or_else(|| m.content.clone()),
            })
            .collect();

        Self {
            chat_id: chat_id.into(),
            classifier,
            llm,
            sink,
            history,
        }
    }

    /// Generate a short title for the chat from `message`, with prior turns
    /// as conversation context. The result is boilerplate-stripped.
    pub async fn summarize_title(&self, message: &str) -> Result<String, LlmError> {
        let mut turns = self.history.clone();
        turns.push(Turn::user(format!("Message: {message}")));

        let text = self
            .llm
            .complete(&GenRequest::new(TITLE_PROMPT, turns))
            .await?;
        Ok(strip_boilerplate(text.trim()))
    }

    /// Start a reply to `message`. Classifies, formats the prompt, records
    /// the user turn through the sink, appends it to history, and opens the
    /// model stream. The returned [`ReplyStream`] yields cleaned fragments
    /// and must be drained and finished by the caller.
    pub async fn reply(&mut self, message: &str) -> Result<ReplyStream<'_>, EngineError> {
        let distribution = self.classifier.classify(message);
        let prompt = format_prompt(message, &distribution);

        if let Some(sink) = &self.sink {
            sink.record(&self.chat_id, Role::User, message, Some(&prompt))?;
        }

        self.history.push(Turn::user(prompt));

        let request = GenRequest::new(REPLY_PROMPT, self.history.clone());
        let inner = self.llm.stream(&request).await?;

        Ok(ReplyStream {
            engine: self,
            inner,
            accumulated: String::new(),
            ended: None,
        })
    }

    /// Turn history as currently held in memory.
    pub fn history(&self) -> &[Turn] {
        &self.history
    }

    fn push_assistant(&mut self, text: &str) {
        self.history.push(Turn::assistant(text));
    }
}

/// A finite, non-restartable sequence of reply fragments.
///
/// Pull fragments with [`next_fragment`](Self::next_fragment) until it
/// returns `Ok(None)`, then call [`finish`](Self::finish) to seal the reply
/// into the engine's history.
pub struct ReplyStream<'a> {
    engine: &'a mut ConversationEngine,
    inner: FragmentStream,
    accumulated: String,
    ended: Option<ReplyOutcome>,
}

impl ReplyStream<'_> {
    /// Next cleaned fragment, or `Ok(None)` once the stream has reached a
    /// terminal state. Safety stops and decode failures end the stream
    /// without raising; transport errors propagate.
    pub async fn next_fragment(&mut self) -> Result<Option<String>, LlmError> {
        if self.ended.is_some() {
            return Ok(None);
        }

        loop {
            match self.inner.next().await {
                Some(Ok(StreamEvent::Fragment(raw))) => {
                    let cleaned = strip_boilerplate(&raw);
                    if cleaned.is_empty() {
                        continue;
                    }
                    self.accumulated.push_str(&cleaned);
                    return Ok(Some(cleaned));
                }
                Some(Ok(StreamEvent::Blocked)) => {
                    self.ended = Some(ReplyOutcome::Truncated);
                    return Ok(None);
                }
                Some(Err(e)) => {
                    // The transport failed mid-stream; the partial reply is
                    // still sealed by finish().
                    self.ended = Some(ReplyOutcome::Truncated);
                    return Err(e);
                }
                None => {
                    self.ended = Some(ReplyOutcome::Completed);
                    return Ok(None);
                }
            }
        }
    }

    /// Seal the reply: strip the accumulated text once more, append it to
    /// the engine's history as an assistant turn, and report the terminal
    /// state. The final text is the full reply, distinct from the yielded
    /// increments.
    pub fn finish(self) -> Reply {
        let text = strip_boilerplate(&self.accumulated);
        self.engine.push_assistant(&text);
        Reply {
            text,
            outcome: self.ended.unwrap_or(ReplyOutcome::Truncated),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::llm::GenConfig;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Scripted generation service: replays a fixed sequence of stream
    /// events and records every request it sees.
    struct ScriptedService {
        events: Vec<Result<StreamEvent, LlmError>>,
        completion: String,
        requests: Mutex<Vec<GenRequest>>,
    }

    impl ScriptedService {
        fn streaming(events: Vec<Result<StreamEvent, LlmError>>) -> Self {
            Self {
                events,
                completion: String::new(),
                requests: Mutex::new(Vec::new()),
            }
        }

        fn completing(text: &str) -> Self {
            Self {
                events: Vec::new(),
                completion: text.to_string(),
                requests: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl GenerationService for ScriptedService {
        async fn complete(&self, request: &GenRequest) -> Result<String, LlmError> {
            self.requests.lock().unwrap().push(request.clone());
            Ok(self.completion.clone())
        }

        async fn stream(&self, request: &GenRequest) -> Result<FragmentStream, LlmError> {
            self.requests.lock().unwrap().push(request.clone());
            let events: Vec<_> = self
                .events
                .iter()
                .map(|e| match e {
                    Ok(ev) => Ok(ev.clone()),
                    Err(err) => Err(LlmError::new(err.kind, err.message.clone())),
                })
                .collect();
            Ok(Box::pin(futures::stream::iter(events)))
        }
    }

    fn fragment(s: &str) -> Result<StreamEvent, LlmError> {
        Ok(StreamEvent::Fragment(s.to_string()))
    }

    fn classifier() -> Arc<EmotionClassifier> {
        Arc::new(crate::emotion::tests::test_artifact())
    }

    fn engine_with(service: Arc<ScriptedService>, sink: Option<Arc<dyn MessageSink>>) -> ConversationEngine {
        ConversationEngine::new("chat-1", &[], classifier(), service, sink)
    }

    #[tokio::test]
    async fn fragments_concatenate_to_final_reply() {
        let service = Arc::new(ScriptedService::streaming(vec![
            fragment("Output: Hello"),
            fragment(" there, "),
            fragment("friend."),
        ]));
        let mut engine = engine_with(service, None);

        let mut stream = engine.reply("I am furious").await.unwrap();
        let mut yielded = String::new();
        while let Some(piece) = stream.next_fragment().await.unwrap() {
            yielded.push_str(&piece);
        }

        let reply = stream.finish();
        assert_eq!(reply.outcome, ReplyOutcome::Completed);
        assert_eq!(reply.text, yielded);
        assert_eq!(reply.text, "Hello there, friend.");
    }

    #[tokio::test]
    async fn safety_stop_truncates_without_error() {
        let service = Arc::new(ScriptedService::streaming(vec![
            fragment("partial "),
            fragment("answer"),
            Ok(StreamEvent::Blocked),
            fragment("never seen"),
        ]));
        let mut engine = engine_with(service, None);

        let mut stream = engine.reply("hello").await.unwrap();
        let mut yielded = String::new();
        while let Some(piece) = stream.next_fragment().await.unwrap() {
            yielded.push_str(&piece);
        }
        assert_eq!(yielded, "partial answer");

        // Terminal: further pulls stay None.
        assert!(stream.next_fragment().await.unwrap().is_none());

        let reply = stream.finish();
        assert_eq!(reply.outcome, ReplyOutcome::Truncated);
        assert_eq!(reply.text, "partial answer");
    }

    #[tokio::test]
    async fn transport_error_propagates() {
        let service = Arc::new(ScriptedService::streaming(vec![
            fragment("before "),
            Err(LlmError::network("connection reset")),
        ]));
        let mut engine = engine_with(service, None);

        let mut stream = engine.reply("hi").await.unwrap();
        assert_eq!(stream.next_fragment().await.unwrap().unwrap(), "before ");
        let err = stream.next_fragment().await.unwrap_err();
        assert!(err.kind.is_retryable());

        let reply = stream.finish();
        assert_eq!(reply.outcome, ReplyOutcome::Truncated);
        assert_eq!(reply.text, "before ");
    }

    #[tokio::test]
    async fn prompt_carries_emotion_distribution() {
        let service = Arc::new(ScriptedService::streaming(vec![fragment("ok")]));
        let mut engine = engine_with(service.clone(), None);

        let mut stream = engine.reply("I am furious").await.unwrap();
        while stream.next_fragment().await.unwrap().is_some() {}
        stream.finish();

        let requests = service.requests.lock().unwrap();
        let sent = &requests[0];
        assert_eq!(sent.system, REPLY_PROMPT);
        let last_turn = sent.turns.last().unwrap();
        assert_eq!(last_turn.role, Role::User);
        assert!(last_turn.text.starts_with("Message: I am furious"));
        assert!(last_turn.text.contains("Anger: "));

        // A nonzero anger percentage for an unmistakably angry message.
        let (_, pairs) = crate::prompt::parse_prompt(&last_turn.text).unwrap();
        let anger = pairs.iter().find(|(l, _)| l == "anger").unwrap().1;
        assert!(anger > 0.0);
    }

    #[tokio::test]
    async fn history_grows_by_user_and_assistant_turns() {
        let service = Arc::new(ScriptedService::streaming(vec![fragment("reply one")]));
        let mut engine = engine_with(service, None);
        assert!(engine.history().is_empty());

        let mut stream = engine.reply("first message").await.unwrap();
        while stream.next_fragment().await.unwrap().is_some() {}
        stream.finish();

        let history = engine.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, Role::User);
        assert!(history[0].text.starts_with("Message: first message"));
        assert_eq!(history[1].role, Role::Assistant);
        assert_eq!(history[1].text, "reply one");
    }

    #[tokio::test]
    async fn sink_receives_user_turn_once() {
        let db = Database::open_in_memory().unwrap();
        let chat = db.create_chat("s1").unwrap();

        let service = Arc::new(ScriptedService::streaming(vec![fragment("hi")]));
        let sink: Arc<dyn MessageSink> = Arc::new(db.clone());
        let mut engine =
            ConversationEngine::new(chat.id.clone(), &[], classifier(), service, Some(sink));

        let mut stream = engine.reply("hello there").await.unwrap();
        while stream.next_fragment().await.unwrap().is_some() {}
        stream.finish();

        // Only the user turn was persisted; the assistant turn is the
        // caller's responsibility.
        let messages = db.get_chat_messages(&chat.id).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[0].content, "hello there");
        let prompt = messages[0].prompt.as_deref().unwrap();
        assert!(prompt.starts_with("Message: hello there"));
    }

    #[tokio::test]
    async fn history_seeded_from_stored_messages() {
        let db = Database::open_in_memory().unwrap();
        let chat = db.create_chat("s1").unwrap();
        db.append_message(&chat.id, Role::User, "raw", Some("Message: raw\n\nEmotions:\n"))
            .unwrap();
        db.append_message(&chat.id, Role::Assistant, "an answer", None)
            .unwrap();

        let messages = db.get_chat_messages(&chat.id).unwrap();
        let service = Arc::new(ScriptedService::completing("A Title"));
        let engine =
            ConversationEngine::new(chat.id, &messages, classifier(), service, None);

        let history = engine.history();
        assert_eq!(history.len(), 2);
        // User turns replay the stored prompt, not the raw content.
        assert_eq!(history[0].text, "Message: raw\n\nEmotions:\n");
        assert_eq!(history[1].text, "an answer");
    }

    #[tokio::test]
    async fn title_is_stripped_and_contextual() {
        let service = Arc::new(ScriptedService::completing("Output: Calming An Angry Day\n"));
        let engine = engine_with(service.clone(), None);

        let title = engine.summarize_title("I am furious").await.unwrap();
        assert_eq!(title, "Calming An Angry Day");

        let requests = service.requests.lock().unwrap();
        assert_eq!(requests[0].system, TITLE_PROMPT);
        assert_eq!(
            requests[0].turns.last().unwrap().text,
            "Message: I am furious"
        );
    }

    #[test]
    fn default_generation_config_matches_service_contract() {
        let config = GenConfig::default();
        assert!((config.temperature - 1.0).abs() < f32::EPSILON);
        assert!((config.top_p - 0.95).abs() < f32::EPSILON);
        assert_eq!(config.top_k, 64);
        assert_eq!(config.max_output_tokens, 65536);
    }
}
