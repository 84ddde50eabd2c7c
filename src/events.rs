use serde::Serialize;

/// Pipeline stage that absorbed a recoverable failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    Retrieval,
    Summarization,
}

/// Observable engine activity, bridged to the websocket event stream.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    Degraded {
        chat_id: String,
        component: Component,
        reason: String,
    },
    Compressed {
        chat_id: String,
        batch_size: usize,
        remaining_unsummarized: usize,
    },
    TurnCommitted {
        chat_id: String,
        turn_id: String,
        sequence: i64,
    },
    GenerationCancelled {
        chat_id: String,
    },
    GenerationFailed {
        chat_id: String,
        error: String,
    },
    HistoryTruncated {
        chat_id: String,
        after_sequence: i64,
        removed: usize,
    },
}

/// Best-effort event publisher. A closed receiver never fails the pipeline.
#[derive(Clone)]
pub struct EventSink {
    tx: Option<flume::Sender<EngineEvent>>,
}

impl EventSink {
    pub fn new(tx: flume::Sender<EngineEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: EngineEvent) {
        if let Some(tx) = &self.tx {
            if tx.send(event).is_err() {
                tracing::trace!("Engine event dropped: no subscribers");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_delivers_to_receiver_and_tolerates_disconnect() {
        let (tx, rx) = flume::unbounded();
        let sink = EventSink::new(tx);
        sink.emit(EngineEvent::GenerationCancelled {
            chat_id: "c1".to_string(),
        });
        assert_eq!(
            rx.try_recv().expect("event"),
            EngineEvent::GenerationCancelled {
                chat_id: "c1".to_string()
            }
        );

        drop(rx);
        sink.emit(EngineEvent::GenerationCancelled {
            chat_id: "c1".to_string(),
        });
        EventSink::disabled().emit(EngineEvent::GenerationCancelled {
            chat_id: "c2".to_string(),
        });
    }
}
