//! The caches of a debugger client, backed by the simulated [`Backend`].

use std::sync::Arc;

use futures::FutureExt;
use futures::future::{self, BoxFuture};
use rewind_cache::{
    Cache, CacheContents, CacheKey, IntervalCache, IntervalLoader, Loader, StreamSink,
    StreamingCache, StreamingLoader,
};

use crate::backend::{Annotation, Backend, Message, NodeKind, ObjectId, ObjectPreview, PauseId};
use crate::config::CacheConfigs;

pub struct ObjectPreviewLoader {
    backend: Arc<Backend>,
}

impl Loader for ObjectPreviewLoader {
    type Args = (PauseId, ObjectId);
    type Value = Arc<ObjectPreview>;

    fn cache_key(&self, args: &Self::Args) -> CacheKey {
        CacheKey::from_parts(args)
    }

    fn load(
        &self,
        (pause, object): Self::Args,
    ) -> BoxFuture<'static, CacheContents<Self::Value>> {
        let backend = Arc::clone(&self.backend);
        async move {
            let preview = backend.get_object_preview(pause, object).await?;
            Ok(Arc::new(preview))
        }
        .boxed()
    }
}

pub type ObjectPreviewCache = Cache<ObjectPreviewLoader>;

/// Resolves the element children of a node by reading the previews of the node and its children.
pub struct ElementChildrenLoader {
    objects: ObjectPreviewCache,
}

impl Loader for ElementChildrenLoader {
    type Args = (PauseId, ObjectId);
    type Value = Arc<[ObjectId]>;

    fn cache_key(&self, args: &Self::Args) -> CacheKey {
        CacheKey::from_parts(args)
    }

    fn load(
        &self,
        (pause, object): Self::Args,
    ) -> BoxFuture<'static, CacheContents<Self::Value>> {
        let objects = self.objects.clone();
        async move {
            let node = objects.read_async((pause, object)).await?;
            let previews = node
                .children
                .iter()
                .map(|&child| objects.read_async((pause, child)));
            let previews = future::join_all(previews).await;

            let mut elements = Vec::with_capacity(previews.len());
            for preview in previews {
                let preview = preview?;
                if preview.kind == NodeKind::Element {
                    elements.push(preview.object);
                }
            }
            Ok(elements.into())
        }
        .boxed()
    }
}

pub type ElementChildrenCache = Cache<ElementChildrenLoader>;

/// Console messages on the time axis. There is a single console per recording.
pub struct MessagesLoader {
    backend: Arc<Backend>,
}

impl IntervalLoader for MessagesLoader {
    type Args = ();
    type Point = u64;
    type Value = Message;

    fn cache_key(&self, args: &()) -> CacheKey {
        CacheKey::from_parts(args)
    }

    fn point_for_value(&self, message: &Message) -> u64 {
        message.time
    }

    fn load(&self, begin: u64, end: u64, _: ()) -> BoxFuture<'static, CacheContents<Vec<Message>>> {
        let backend = Arc::clone(&self.backend);
        async move { backend.find_messages(begin, end).await }.boxed()
    }
}

pub type MessagesCache = IntervalCache<MessagesLoader>;

/// Annotations of one kind, streamed page by page. The stream data is the total count.
pub struct AnnotationsLoader {
    backend: Arc<Backend>,
}

impl StreamingLoader for AnnotationsLoader {
    type Args = String;
    type Value = Annotation;
    type Data = usize;

    fn cache_key(&self, kind: &String) -> CacheKey {
        CacheKey::from_parts(kind)
    }

    fn load(
        &self,
        kind: String,
        sink: StreamSink<Annotation, usize>,
    ) -> BoxFuture<'static, CacheContents<()>> {
        let backend = Arc::clone(&self.backend);
        async move { backend.stream_annotations(&kind, &sink).await }.boxed()
    }
}

pub type AnnotationsCache = StreamingCache<AnnotationsLoader>;

/// All caches of a debugger client, sharing one backend.
#[derive(Clone, Debug)]
pub struct DebuggerCaches {
    pub backend: Arc<Backend>,
    pub objects: ObjectPreviewCache,
    pub children: ElementChildrenCache,
    pub messages: MessagesCache,
    pub annotations: AnnotationsCache,
}

impl DebuggerCaches {
    pub fn new(config: &CacheConfigs, backend: Arc<Backend>) -> Self {
        let objects = Cache::new(
            "objects",
            ObjectPreviewLoader {
                backend: Arc::clone(&backend),
            },
            config.objects.clone(),
        );
        let children = Cache::new(
            "children",
            ElementChildrenLoader {
                objects: objects.clone(),
            },
            config.children.clone(),
        );
        let messages = IntervalCache::new(
            "messages",
            MessagesLoader {
                backend: Arc::clone(&backend),
            },
            config.messages.clone(),
        );
        let annotations = StreamingCache::new(
            "annotations",
            AnnotationsLoader {
                backend: Arc::clone(&backend),
            },
        );

        Self {
            backend,
            objects,
            children,
            messages,
            annotations,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rewind_cache::{Availability, CacheError, Status, resolve, test};

    use super::*;
    use crate::config::BackendConfig;

    fn caches(failure_every: usize) -> DebuggerCaches {
        let backend = Backend::new(BackendConfig {
            latency: Duration::from_millis(1),
            failure_every,
            ..Default::default()
        });
        DebuggerCaches::new(&CacheConfigs::default(), Arc::new(backend))
    }

    #[tokio::test]
    async fn test_dependent_cache_shares_loads() {
        test::setup();
        let caches = caches(0);

        // the root and its children 1, 2 and 3 are loaded exactly once
        let (first, second) = futures::join!(
            caches.children.read_async((1, 0)),
            caches.children.read_async((1, 0))
        );
        assert_eq!(&*first.unwrap(), [1, 2]);
        assert_eq!(&*second.unwrap(), [1, 2]);
        assert_eq!(caches.backend.calls().objects, 4);

        // the child previews were cached along the way
        let child = caches.objects.get_value_if_cached(&(1, 3)).unwrap();
        assert_eq!(child.kind, NodeKind::Text);

        // children of a child only load the grandchildren
        let elements = caches.children.read_async((1, 1)).await.unwrap();
        assert_eq!(&*elements, [4, 5, 6]);
        assert_eq!(caches.backend.calls().objects, 7);

        // a different pause is a different key
        caches.children.read_async((2, 0)).await.unwrap();
        assert_eq!(caches.backend.calls().objects, 11);
    }

    #[tokio::test]
    async fn test_render_reads_through_caches() {
        test::setup();
        let caches = caches(0);

        let names = resolve(|| {
            let elements = caches.children.read((1, 0))?;
            let mut names = vec![];
            for &element in elements.iter() {
                names.push(caches.objects.read((1, element))?.name.clone());
            }
            Ok(names)
        })
        .await;
        assert_eq!(names.unwrap(), ["div.n1", "div.n2"]);
    }

    #[tokio::test]
    async fn test_dependent_failure_is_cached() {
        test::setup();
        // the third request fails, which is the preview of the second child
        let caches = caches(3);

        let error = caches.children.read_async((1, 0)).await.unwrap_err();
        assert!(matches!(error, CacheError::LoadFailed(_)));
        assert_eq!(caches.children.status(&(1, 0)), Status::Rejected);

        // previews are immutable, but failed ones can still be evicted
        assert_eq!(caches.objects.evict_all(), 1);
        assert!(caches.children.evict(&(1, 0)));
        assert!(caches.children.read_async((1, 0)).await.is_ok());
    }

    #[tokio::test]
    async fn test_messages_load_gaps_only() {
        test::setup();
        let caches = caches(0);

        let messages = caches.messages.read_async(0, 100, ()).await.unwrap();
        assert_eq!(messages.len(), 11);
        let messages = caches.messages.read_async(200, 300, ()).await.unwrap();
        assert_eq!(messages.len(), 11);
        assert_eq!(caches.backend.calls().messages, 2);

        let messages = caches.messages.read_async(50, 250, ()).await.unwrap();
        assert_eq!(messages.first().map(|m| m.time), Some(50));
        assert_eq!(messages.last().map(|m| m.time), Some(250));
        assert_eq!(messages.len(), 21);
        assert_eq!(caches.backend.calls().messages, 3);
        assert_eq!(caches.messages.loaded_ranges(&()), [(0, 300)]);
    }

    #[tokio::test]
    async fn test_annotations_stream() {
        test::setup();
        let caches = caches(0);

        let kind = "mouse-event".to_owned();
        let first = caches
            .annotations
            .read_async(kind.clone(), Availability::FirstUpdate)
            .await
            .unwrap();
        assert_eq!(first.data, Some(100));
        assert!(!first.complete);

        let complete = caches
            .annotations
            .read_async(kind.clone(), Availability::Complete)
            .await
            .unwrap();
        assert_eq!(complete.values.len(), 100);
        assert_eq!(complete.progress, Some(1.0));
        assert_eq!(caches.backend.calls().annotations, 1);
    }

    #[tokio::test]
    async fn test_empty_annotation_page_is_malformed() {
        test::setup();
        let backend = Backend::new(BackendConfig {
            latency: Duration::ZERO,
            annotation_page_size: 0,
            ..Default::default()
        });
        let caches = DebuggerCaches::new(&CacheConfigs::default(), Arc::new(backend));

        let error = caches
            .annotations
            .read_async("keyboard-event".to_owned(), Availability::Complete)
            .await
            .unwrap_err();
        assert!(matches!(error, CacheError::Malformed(_)));

        let stream = caches
            .annotations
            .get_if_cached(&"keyboard-event".to_owned())
            .unwrap();
        assert_eq!(stream.data(), Some(0));
        assert!(stream.value().is_empty());
    }
}
