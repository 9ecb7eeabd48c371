use futures::future;
use rand::Rng;
use rewind_cache::{Availability, CacheContents, CacheError};
use serde::{Deserialize, Serialize};

use crate::backend::PauseId;
use crate::caches::DebuggerCaches;

#[derive(Debug, Deserialize, Serialize)]
pub struct WorkloadsConfig {
    pub workloads: Vec<Workload>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Workload {
    pub concurrency: usize,
    #[serde(flatten)]
    pub payload: Payload,
}

/// What a single operation of a workload does.
///
/// Every operation picks its arguments at random from the configured ranges, so that smaller
/// ranges produce more cache hits.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Payload {
    /// Reads the preview of a random object at a random pause.
    Objects { pauses: PauseId, objects: u32 },
    /// Expands the two topmost levels of the DOM tree at a random pause.
    Children { pauses: PauseId },
    /// Reads the console messages in a random window of `[0, end]`.
    Messages { end: u64, window: u64 },
    /// Waits for a random annotation stream to complete.
    Annotations { kinds: Vec<String> },
}

pub async fn process_payload(caches: &DebuggerCaches, payload: &Payload) -> CacheContents<()> {
    match payload {
        Payload::Objects { pauses, objects } => {
            let (pause, object) = {
                let mut rng = rand::rng();
                (
                    rng.random_range(0..(*pauses).max(1)),
                    rng.random_range(0..(*objects).max(1)),
                )
            };
            caches.objects.read_async((pause, object)).await?;
        }
        Payload::Children { pauses } => {
            let pause = rand::rng().random_range(0..(*pauses).max(1));
            let elements = caches.children.read_async((pause, 0)).await?;
            let grandchildren = elements
                .iter()
                .map(|&element| caches.children.read_async((pause, element)));
            for result in future::join_all(grandchildren).await {
                result?;
            }
        }
        Payload::Messages { end, window } => {
            let begin = rand::rng().random_range(0..=end.saturating_sub(*window));
            let end = begin.saturating_add(*window);
            caches.messages.read_async(begin, end, ()).await?;
        }
        Payload::Annotations { kinds } => {
            if kinds.is_empty() {
                return Err(CacheError::load_failed("no annotation kinds configured"));
            }
            let kind = kinds[rand::rng().random_range(0..kinds.len())].clone();
            caches
                .annotations
                .read_async(kind, Availability::Complete)
                .await?;
        }
    }
    Ok(())
}
