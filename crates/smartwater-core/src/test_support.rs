use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::config::{ChannelConfig, Credentials};
use crate::feed::{FeedRecord, FeedResponse};
use crate::transport::{FeedTransport, TransportError};

type Reply = Result<FeedResponse, TransportError>;

struct Scripted {
    delay: Duration,
    reply: Reply,
}

struct MockState {
    calls: AtomicUsize,
    script: Mutex<VecDeque<Scripted>>,
    fallback: Mutex<Reply>,
    seen: Mutex<Vec<Credentials>>,
}

/// Scripted transport: queued replies first, then the fallback reply forever.
#[derive(Clone)]
pub(crate) struct MockTransport {
    state: Arc<MockState>,
}

impl MockTransport {
    pub(crate) fn replying(reply: Reply) -> Self {
        Self {
            state: Arc::new(MockState {
                calls: AtomicUsize::new(0),
                script: Mutex::new(VecDeque::new()),
                fallback: Mutex::new(reply),
                seen: Mutex::new(Vec::new()),
            }),
        }
    }

    pub(crate) fn push(&self, delay: Duration, reply: Reply) {
        self.state
            .script
            .lock()
            .expect("script lock")
            .push_back(Scripted { delay, reply });
    }

    pub(crate) fn calls(&self) -> usize {
        self.state.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn seen(&self) -> Vec<Credentials> {
        self.state.seen.lock().expect("seen lock").clone()
    }
}

#[async_trait]
impl FeedTransport for MockTransport {
    async fn fetch_feed(
        &self,
        credentials: &Credentials,
        _results: u32,
    ) -> Result<FeedResponse, TransportError> {
        self.state.calls.fetch_add(1, Ordering::SeqCst);
        self.state
            .seen
            .lock()
            .expect("seen lock")
            .push(credentials.clone());

        let next = self.state.script.lock().expect("script lock").pop_front();
        let Scripted { delay, reply } = match next {
            Some(scripted) => scripted,
            None => Scripted {
                delay: Duration::ZERO,
                reply: self.state.fallback.lock().expect("fallback lock").clone(),
            },
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        reply
    }
}

pub(crate) fn feed_of(entry_ids: &[u64]) -> FeedResponse {
    FeedResponse {
        channel: serde_json::json!({"id": 1}),
        feeds: entry_ids
            .iter()
            .map(|id| FeedRecord {
                created_at: "2025-03-01T10:00:00Z".to_string(),
                entry_id: *id,
                field1: Some(format!("{id}.5")),
                field4: Some("1".to_string()),
                ..FeedRecord::default()
            })
            .collect(),
    }
}

pub(crate) fn channel_credentials() -> Credentials {
    ChannelConfig::new("1234", "READKEY").into()
}
