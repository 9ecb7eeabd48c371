//! A simulated replay backend.
//!
//! Answers the requests a debugger client makes while inspecting a recording: previews of the
//! objects at a pause, console messages by time range, and paged annotation streams. All data is
//! derived from the request, so every answer is stable across calls.

use std::sync::atomic::{AtomicUsize, Ordering};

use rewind_cache::{CacheContents, CacheError, StreamSink};

use crate::config::BackendConfig;

pub type PauseId = u32;
pub type ObjectId = u32;

/// Objects below this id have children, forming a tree rooted at object `0`.
const PARENT_LIMIT: ObjectId = 1_000;
const FANOUT: ObjectId = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeKind {
    Element,
    Text,
}

/// The preview of a DOM node at a pause.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectPreview {
    pub pause: PauseId,
    pub object: ObjectId,
    pub kind: NodeKind,
    pub name: String,
    pub children: Vec<ObjectId>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub time: u64,
    pub text: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Annotation {
    pub time: u64,
    pub kind: String,
    pub contents: String,
}

/// How often each endpoint has been called.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub objects: usize,
    pub messages: usize,
    pub annotations: usize,
}

#[derive(Debug)]
pub struct Backend {
    config: BackendConfig,
    requests: AtomicUsize,
    objects: AtomicUsize,
    messages: AtomicUsize,
    annotations: AtomicUsize,
}

impl Backend {
    pub fn new(config: BackendConfig) -> Self {
        Self {
            config,
            requests: AtomicUsize::new(0),
            objects: AtomicUsize::new(0),
            messages: AtomicUsize::new(0),
            annotations: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> CallCounts {
        CallCounts {
            objects: self.objects.load(Ordering::Relaxed),
            messages: self.messages.load(Ordering::Relaxed),
            annotations: self.annotations.load(Ordering::Relaxed),
        }
    }

    /// Simulates the round trip of a single request, failing it if it is due.
    async fn round_trip(&self, endpoint: &'static str) -> CacheContents<()> {
        let request = self.requests.fetch_add(1, Ordering::Relaxed) + 1;
        if !self.config.latency.is_zero() {
            tokio::time::sleep(self.config.latency).await;
        }

        let failure_every = self.config.failure_every;
        if failure_every > 0 && request % failure_every == 0 {
            tracing::debug!(endpoint, request, "injecting backend failure");
            return Err(CacheError::load_failed(format!(
                "request {request} to `{endpoint}` failed"
            )));
        }
        Ok(())
    }

    pub async fn get_object_preview(
        &self,
        pause: PauseId,
        object: ObjectId,
    ) -> CacheContents<ObjectPreview> {
        self.objects.fetch_add(1, Ordering::Relaxed);
        self.round_trip("getObjectPreview").await?;

        let children = if object < PARENT_LIMIT {
            (1..=FANOUT).map(|i| object * FANOUT + i).collect()
        } else {
            vec![]
        };
        let (kind, name) = match object % 4 {
            3 => (NodeKind::Text, "#text".to_owned()),
            n => (NodeKind::Element, format!("div.n{n}")),
        };

        Ok(ObjectPreview {
            pause,
            object,
            kind,
            name,
            children,
        })
    }

    /// Returns all messages whose time lies within `[begin, end]`.
    pub async fn find_messages(&self, begin: u64, end: u64) -> CacheContents<Vec<Message>> {
        self.messages.fetch_add(1, Ordering::Relaxed);
        self.round_trip("findMessages").await?;

        let spacing = self.config.message_spacing.max(1);
        let messages = (begin.div_ceil(spacing)..=end / spacing)
            .map(|index| Message {
                time: index * spacing,
                text: format!("console.log #{index}"),
            })
            .collect();
        Ok(messages)
    }

    /// Streams all annotations of `kind` into `sink`, one page per round trip.
    pub async fn stream_annotations(
        &self,
        kind: &str,
        sink: &StreamSink<Annotation, usize>,
    ) -> CacheContents<()> {
        self.annotations.fetch_add(1, Ordering::Relaxed);

        let pages = self.config.annotation_pages;
        let page_size = self.config.annotation_page_size;
        sink.set_data(pages * page_size);

        for page in 0..pages {
            self.round_trip("findAnnotations").await?;
            if page_size == 0 {
                return Err(CacheError::Malformed(format!(
                    "page {page} of `{kind}` annotations is empty"
                )));
            }
            sink.append((0..page_size).map(|i| {
                let index = (page * page_size + i) as u64;
                Annotation {
                    time: index * 100,
                    kind: kind.to_owned(),
                    contents: format!("{kind} #{index}"),
                }
            }));
            sink.set_progress((page + 1) as f64 / pages as f64);
        }
        Ok(())
    }
}
