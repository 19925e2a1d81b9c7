use std::{pin::Pin, sync::Arc, time::SystemTime};

use futures::{Stream, StreamExt};

/// A payload tagged with the instant it entered the pipeline, used for the
/// fetch-to-write latency measurement at the sink.
#[derive(Debug, Clone)]
pub struct Envelope<T> {
    pub payload: T,
    pub received_at: SystemTime,
}

impl<T> Envelope<T> {
    pub fn now(payload: T) -> Self {
        Self {
            payload,
            received_at: SystemTime::now(),
        }
    }
}

/// Failure classes for a backfill run. `TransientFetch` is the only kind
/// worth retrying; everything else aborts the run.
#[derive(thiserror::Error, Debug)]
pub enum CollectorError {
    #[error("auth error: {0}")]
    Auth(String),
    #[error("transient fetch error: {0}")]
    TransientFetch(String),
    #[error("malformed response: {0}")]
    MalformedResponse(String),
    #[error("pagination limit exceeded after {pages} pages")]
    PaginationLimitExceeded { pages: u32 },
    #[error("output write error: {0}")]
    OutputWrite(String),
}

impl CollectorError {
    pub fn is_transient(&self) -> bool {
        matches!(self, CollectorError::TransientFetch(_))
    }
}

pub type ItemStream<T> =
    Pin<Box<dyn Stream<Item = Result<Envelope<T>, CollectorError>> + Send>>;

#[async_trait::async_trait]
pub trait Source<T>: Send + Sync {
    async fn stream(&self) -> ItemStream<T>;
}

/// A same-type, per-item stage between source and sink. The collector only
/// ever validates or annotates samples in flight, so input and output share
/// one payload type.
#[async_trait::async_trait]
pub trait Transform<T>: Send + Sync {
    async fn apply(&self, input: Envelope<T>) -> Result<Envelope<T>, CollectorError>;
}

#[async_trait::async_trait]
pub trait Sink<T>: Send + Sync {
    async fn run<S>(&self, input: S) -> Result<(), CollectorError>
    where
        S: Stream<Item = Result<Envelope<T>, CollectorError>> + Send + Unpin + 'static;
}

pub struct Pipeline<S, T, K> {
    pub source: S,
    pub transforms: Vec<Arc<dyn Transform<T>>>,
    pub sink: K,
}

fn through<T>(stream: ItemStream<T>, stage: Arc<dyn Transform<T>>) -> ItemStream<T>
where
    T: Send + 'static,
{
    Box::pin(stream.then(move |item| {
        let stage = stage.clone();
        async move {
            match item {
                Ok(env) => stage.apply(env).await,
                Err(e) => Err(e),
            }
        }
    }))
}

impl<T, S, K> Pipeline<S, T, K>
where
    T: Send + 'static,
    S: Source<T> + 'static,
    K: Sink<T> + 'static,
{
    /// Drains the source through every transform into the sink. The first
    /// error an item carries reaches the sink unchanged; the sink decides
    /// whether anything is flushed.
    pub async fn run(self) -> Result<(), CollectorError> {
        let stream = self
            .transforms
            .into_iter()
            .fold(self.source.stream().await, through);
        self.sink.run(stream).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct NumberSource(Vec<Result<i32, CollectorError>>);

    #[async_trait::async_trait]
    impl Source<i32> for NumberSource {
        async fn stream(&self) -> ItemStream<i32> {
            let items: Vec<_> = self
                .0
                .iter()
                .map(|r| match r {
                    Ok(v) => Ok(Envelope::now(*v)),
                    Err(e) => Err(CollectorError::TransientFetch(e.to_string())),
                })
                .collect();
            Box::pin(futures::stream::iter(items))
        }
    }

    struct Double;

    #[async_trait::async_trait]
    impl Transform<i32> for Double {
        async fn apply(&self, mut input: Envelope<i32>) -> Result<Envelope<i32>, CollectorError> {
            input.payload *= 2;
            Ok(input)
        }
    }

    #[derive(Clone, Default)]
    struct Collecting {
        seen: Arc<Mutex<Vec<i32>>>,
    }

    #[async_trait::async_trait]
    impl Sink<i32> for Collecting {
        async fn run<S>(&self, mut input: S) -> Result<(), CollectorError>
        where
            S: Stream<Item = Result<Envelope<i32>, CollectorError>> + Send + Unpin + 'static,
        {
            while let Some(item) = input.next().await {
                self.seen.lock().unwrap().push(item?.payload);
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn runs_items_through_every_transform() {
        let sink = Collecting::default();
        let pipeline = Pipeline {
            source: NumberSource(vec![Ok(1), Ok(2), Ok(3)]),
            transforms: vec![Arc::new(Double) as Arc<dyn Transform<i32>>, Arc::new(Double)],
            sink: sink.clone(),
        };
        pipeline.run().await.unwrap();
        assert_eq!(*sink.seen.lock().unwrap(), vec![4, 8, 12]);
    }

    #[tokio::test]
    async fn source_errors_reach_the_sink() {
        let sink = Collecting::default();
        let pipeline = Pipeline {
            source: NumberSource(vec![Ok(1), Err(CollectorError::TransientFetch("x".into()))]),
            transforms: vec![Arc::new(Double) as Arc<dyn Transform<i32>>],
            sink: sink.clone(),
        };
        let err = pipeline.run().await.unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn only_fetch_failures_are_transient() {
        assert!(CollectorError::TransientFetch("timeout".into()).is_transient());
        assert!(!CollectorError::Auth("denied".into()).is_transient());
        assert!(!CollectorError::PaginationLimitExceeded { pages: 100 }.is_transient());
        assert!(!CollectorError::OutputWrite("disk full".into()).is_transient());
    }
}
