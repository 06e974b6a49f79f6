//! Read results: buffered batches and incremental chunk streams.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::stream::{BoxStream, Stream, StreamExt};
use vista_core::value::RowBatch;

use crate::error::{QueryError, Result};

/// Why a read stopped before every block was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Every block was applied.
    Complete,
    /// The row cap was reached; remaining map tasks were skipped.
    Fulfilled,
    /// Cancelled after some blocks completed; the result is partial.
    Cancelled,
}

/// A fully materialized read result.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferedResult {
    /// Generation that answered the read.
    pub generation: u64,
    /// Result rows.
    pub batch: RowBatch,
    /// Blocks whose partials are included.
    pub blocks_applied: usize,
    /// Blocks in the generation.
    pub blocks_total: usize,
    /// How the read ended.
    pub completion: Completion,
}

impl BufferedResult {
    /// Returns true when the result reflects only part of the generation
    /// because the read was cancelled.
    #[must_use]
    pub fn is_partial(&self) -> bool {
        self.completion == Completion::Cancelled
    }
}

/// One streamed chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultChunk {
    /// Chunk rows.
    pub batch: RowBatch,
}

/// Frames a streaming read sends: chunks, then one end marker naming how
/// the read stopped.
#[derive(Debug)]
pub(crate) enum Frame {
    Chunk(ResultChunk),
    End(Completion),
}

/// Chunks forwarded as map tasks complete.
///
/// The stream ends after the last block, once the row cap is reached, or on
/// cancellation; [`ResultStream::completion`] then tells which. Cancellation
/// before any block was applied yields [`QueryError::Cancelled`]. A producer
/// that stops without its end marker surfaces as an error rather than a
/// silently short result.
pub struct ResultStream {
    generation: u64,
    columns: Vec<String>,
    inner: BoxStream<'static, Result<Frame>>,
    completion: Option<Completion>,
    done: bool,
}

impl std::fmt::Debug for ResultStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultStream")
            .field("generation", &self.generation)
            .field("columns", &self.columns)
            .field("completion", &self.completion)
            .finish_non_exhaustive()
    }
}

impl ResultStream {
    /// Wraps a chunk stream. Exhausting it counts as
    /// [`Completion::Complete`].
    #[must_use]
    pub fn new(
        generation: u64,
        columns: Vec<String>,
        inner: BoxStream<'static, Result<ResultChunk>>,
    ) -> Self {
        let frames = inner
            .map(|item| item.map(Frame::Chunk))
            .chain(futures::stream::once(async { Ok(Frame::End(Completion::Complete)) }))
            .boxed();
        Self::from_frames(generation, columns, frames)
    }

    pub(crate) fn from_frames(
        generation: u64,
        columns: Vec<String>,
        inner: BoxStream<'static, Result<Frame>>,
    ) -> Self {
        Self {
            generation,
            columns,
            inner,
            completion: None,
            done: false,
        }
    }

    /// An empty stream.
    #[must_use]
    pub fn empty(generation: u64, columns: Vec<String>) -> Self {
        Self::new(generation, columns, futures::stream::empty().boxed())
    }

    /// Generation being streamed.
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Result columns.
    #[must_use]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// How the read ended; `None` until the end marker has been read.
    #[must_use]
    pub const fn completion(&self) -> Option<Completion> {
        self.completion
    }

    /// Drains the stream into one batch.
    ///
    /// # Errors
    ///
    /// Returns the first error the stream yields.
    pub async fn collect_rows(mut self) -> Result<RowBatch> {
        let mut rows = Vec::new();
        while let Some(chunk) = self.next().await {
            rows.extend(chunk?.batch.rows);
        }
        Ok(RowBatch::new(self.columns, rows))
    }
}

impl Stream for ResultStream {
    type Item = Result<ResultChunk>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }
        match self.inner.as_mut().poll_next(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(Ok(Frame::Chunk(chunk)))) => Poll::Ready(Some(Ok(chunk))),
            Poll::Ready(Some(Ok(Frame::End(completion)))) => {
                self.completion = Some(completion);
                self.done = true;
                Poll::Ready(None)
            }
            Poll::Ready(Some(Err(e))) => {
                self.done = true;
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                self.done = true;
                Poll::Ready(Some(Err(QueryError::Core(vista_core::Error::internal(
                    "read stream ended without an end marker",
                )))))
            }
        }
    }
}

/// Result of a read: buffered for plans with global operations, streamed
/// otherwise.
#[derive(Debug)]
pub enum QueryResult {
    /// Every partial was collected before answering.
    Buffered(BufferedResult),
    /// Chunks are forwarded as blocks complete.
    Streaming(ResultStream),
}

impl QueryResult {
    /// Returns true for [`QueryResult::Streaming`].
    #[must_use]
    pub const fn is_streaming(&self) -> bool {
        matches!(self, Self::Streaming(_))
    }

    /// Collects either variant into one batch.
    ///
    /// # Errors
    ///
    /// Returns stream errors.
    pub async fn into_batch(self) -> Result<RowBatch> {
        match self {
            Self::Buffered(result) => Ok(result.batch),
            Self::Streaming(stream) => stream.collect_rows().await,
        }
    }

    /// The buffered result.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidInput` for a streaming result.
    pub fn into_buffered(self) -> Result<BufferedResult> {
        match self {
            Self::Buffered(result) => Ok(result),
            Self::Streaming(_) => Err(QueryError::Core(vista_core::Error::InvalidInput(
                "result is streaming".into(),
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vista_core::value::ScalarValue;

    #[tokio::test]
    async fn stream_collects_chunks_in_order() {
        let chunks = (0..3).map(|i| {
            Ok(ResultChunk {
                batch: RowBatch::new(vec!["n".into()], vec![vec![ScalarValue::Int64(i)]]),
            })
        });
        let stream = ResultStream::new(1, vec!["n".into()], futures::stream::iter(chunks).boxed());
        let batch = QueryResult::Streaming(stream).into_batch().await.unwrap();
        assert_eq!(batch.len(), 3);
        assert_eq!(batch.rows[2][0], ScalarValue::Int64(2));
    }

    #[tokio::test]
    async fn stream_errors_surface_on_collect() {
        let items = vec![Err(QueryError::Cancelled)];
        let stream = ResultStream::new(1, vec![], futures::stream::iter(items).boxed());
        assert!(stream.collect_rows().await.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn end_marker_records_completion() {
        let frames = vec![
            Ok(Frame::Chunk(ResultChunk {
                batch: RowBatch::new(vec!["n".into()], vec![vec![ScalarValue::Int64(1)]]),
            })),
            Ok(Frame::End(Completion::Cancelled)),
        ];
        let mut stream =
            ResultStream::from_frames(1, vec!["n".into()], futures::stream::iter(frames).boxed());
        assert!(stream.next().await.unwrap().is_ok());
        assert_eq!(stream.completion(), None);
        assert!(stream.next().await.is_none());
        assert_eq!(stream.completion(), Some(Completion::Cancelled));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn producer_vanishing_without_end_marker_is_an_error() {
        let frames = vec![Ok(Frame::Chunk(ResultChunk {
            batch: RowBatch::new(vec!["n".into()], vec![vec![ScalarValue::Int64(1)]]),
        }))];
        let stream =
            ResultStream::from_frames(1, vec!["n".into()], futures::stream::iter(frames).boxed());
        let err = stream.collect_rows().await.unwrap_err();
        assert!(matches!(err, QueryError::Core(vista_core::Error::Internal { .. })));
    }

    #[tokio::test]
    async fn exhausted_chunk_stream_is_complete() {
        let mut stream = ResultStream::empty(3, vec![]);
        assert!(stream.next().await.is_none());
        assert_eq!(stream.completion(), Some(Completion::Complete));
    }
}
