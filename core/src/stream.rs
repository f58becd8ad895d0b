use crate::llm::TransportError;
use crate::state::ImageRef;
use eventsource_stream::{EventStreamError, Eventsource};
use futures::{Stream, StreamExt};
use serde::Deserialize;
use std::pin::{pin, Pin};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

/// Raw response body as delivered by a provider.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, TransportError>> + Send>>;

const DONE_SENTINEL: &str = "[DONE]";

/// Terminal result of a completion: full text plus generated images.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Completion {
    pub text: String,
    pub images: Vec<ImageRef>,
}

/// Receives the incremental output of one completion request.
///
/// `on_fragment` fires once per text fragment, in wire order, with the
/// text accumulated so far. Image-only units fire it with an empty
/// fragment. Exactly one of `on_complete` / `on_error` ends the request;
/// `on_retry` marks an attempt boundary after which accumulation restarts.
pub trait StreamObserver: Send {
    fn on_fragment(&mut self, fragment: &str, text: &str, images: &[ImageRef]);

    fn on_complete(&mut self, _text: &str, _images: &[ImageRef]) {}

    fn on_error(&mut self, _error: &TransportError) {}

    fn on_retry(&mut self, _attempt: u32, _error: &TransportError) {}
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl StreamObserver for NoopObserver {
    fn on_fragment(&mut self, _fragment: &str, _text: &str, _images: &[ImageRef]) {}
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Fragment {
        delta: String,
        text: String,
        images: Vec<ImageRef>,
    },
    Retrying {
        attempt: u32,
        error: TransportError,
    },
    Completed(Completion),
    Failed(TransportError),
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed(_) | Self::Failed(_))
    }
}

/// Forwards observer callbacks into an unbounded channel.
pub struct ChannelObserver {
    tx: UnboundedSender<StreamEvent>,
}

impl ChannelObserver {
    pub fn new(tx: UnboundedSender<StreamEvent>) -> Self {
        Self { tx }
    }

    fn emit(&self, event: StreamEvent) {
        if self.tx.send(event).is_err() {
            debug!("stream receiver dropped");
        }
    }
}

impl StreamObserver for ChannelObserver {
    fn on_fragment(&mut self, fragment: &str, text: &str, images: &[ImageRef]) {
        self.emit(StreamEvent::Fragment {
            delta: fragment.to_owned(),
            text: text.to_owned(),
            images: images.to_vec(),
        });
    }

    fn on_complete(&mut self, text: &str, images: &[ImageRef]) {
        self.emit(StreamEvent::Completed(Completion {
            text: text.to_owned(),
            images: images.to_vec(),
        }));
    }

    fn on_error(&mut self, error: &TransportError) {
        self.emit(StreamEvent::Failed(error.clone()));
    }

    fn on_retry(&mut self, attempt: u32, error: &TransportError) {
        self.emit(StreamEvent::Retrying {
            attempt,
            error: error.clone(),
        });
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct ChoicesPayload {
    #[serde(default)]
    pub choices: Option<Vec<ChoicePayload>>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ChoicePayload {
    #[serde(default)]
    pub delta: Option<BodyPayload>,
    #[serde(default)]
    pub message: Option<BodyPayload>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct BodyPayload {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub images: Option<Vec<ImageRef>>,
}

#[derive(Debug, PartialEq)]
pub(crate) enum StreamUnit {
    Done,
    Delta {
        content: Option<String>,
        images: Vec<ImageRef>,
    },
    Skip,
}

/// Interpret the payload of one `data:` line.
pub(crate) fn decode_unit(data: &str) -> StreamUnit {
    let data = data.trim();
    if data.is_empty() {
        return StreamUnit::Skip;
    }
    if data == DONE_SENTINEL {
        return StreamUnit::Done;
    }
    let payload: ChoicesPayload = match serde_json::from_str(data) {
        Ok(payload) => payload,
        Err(err) => {
            warn!(%err, data, "skipping malformed stream unit");
            return StreamUnit::Skip;
        }
    };
    let Some(choice) = payload.choices.and_then(|choices| choices.into_iter().next()) else {
        return StreamUnit::Skip;
    };
    let delta = choice.delta.unwrap_or_default();
    let mut images = delta.images.unwrap_or_default();
    if let Some(message) = choice.message {
        images.extend(message.images.unwrap_or_default());
    }
    StreamUnit::Delta {
        content: delta.content,
        images,
    }
}

/// Drive one response body to completion, reporting fragments as they
/// arrive. Every `data:` line is its own unit, whether lines are separated
/// by a blank line or a single newline. A missing `[DONE]` sentinel is
/// treated as a normal end.
pub(crate) async fn consume(
    body: ByteStream,
    observer: &mut dyn StreamObserver,
) -> Result<Completion, TransportError> {
    // The parser only dispatches an event at a blank line; close the last one.
    let closed = body.chain(futures::stream::iter([Ok(b"\n\n".to_vec())]));
    let mut events = pin!(closed.eventsource());
    let mut completion = Completion::default();
    'events: while let Some(event) = events.next().await {
        let event = event.map_err(|err| match err {
            EventStreamError::Transport(inner) => inner,
            other => TransportError::Stream(other.to_string()),
        })?;
        // Consecutive `data:` lines arrive joined by '\n' in one event.
        for line in event.data.split('\n') {
            match decode_unit(line) {
                StreamUnit::Done => break 'events,
                StreamUnit::Skip => {}
                StreamUnit::Delta { content, images } => {
                    apply_delta(&mut completion, content, images, observer)
                }
            }
        }
    }
    Ok(completion)
}

fn apply_delta(
    completion: &mut Completion,
    content: Option<String>,
    images: Vec<ImageRef>,
    observer: &mut dyn StreamObserver,
) {
    let has_images = !images.is_empty();
    completion.images.extend(images);
    match content.filter(|fragment| !fragment.is_empty()) {
        Some(fragment) => {
            completion.text.push_str(&fragment);
            observer.on_fragment(&fragment, &completion.text, &completion.images);
        }
        None if has_images => observer.on_fragment("", &completion.text, &completion.images),
        None => {}
    }
}

/// Render fragments as an SSE body in `data: <json>` form.
pub fn encode_sse(fragments: &[String]) -> Vec<u8> {
    let mut body = String::new();
    for fragment in fragments {
        let unit = serde_json::json!({ "choices": [{ "delta": { "content": fragment } }] });
        body.push_str("data: ");
        body.push_str(&unit.to_string());
        body.push_str("\n\n");
    }
    body.push_str("data: [DONE]\n\n");
    body.into_bytes()
}
