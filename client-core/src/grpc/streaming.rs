//! Progressive delivery of server-streamed results.
//!
//! A producer task pumps the transport stream into a bounded channel; the
//! consumer pulls from a `CancellableStream`. Dropping the consumer cancels
//! the producer, which drops the transport stream (resetting the HTTP/2
//! stream on the wire) and fires the optional cancel hook.

use futures::{Stream, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use super::connection::{ConnectionManager, ExclusiveOperationGuard, StreamTransport};
use crate::error::RpcError;

/// Buffered items between the transport and a slow consumer.
const STREAM_BUFFER: usize = 8;

/// Invoked when a stream is abandoned before it finished.
pub type CancelHook = Arc<dyn Fn() + Send + Sync>;

/// One page of a progressively loaded collection.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch<T> {
    pub items: Vec<T>,
    pub is_last: bool,
}

/// A wire message that carries one batch.
pub trait BatchPayload: Send + 'static {
    type Item: Send + 'static;

    fn into_batch(self) -> Batch<Self::Item>;
}

/// Interleaved progress and result payloads of a long generation call.
#[derive(Debug, Clone, PartialEq)]
pub enum GenerationUpdate<T> {
    Progress { fraction: f32, message: String },
    Result(T),
}

/// A wire message carrying a tagged generation payload.
pub trait GenerationPayload: Send + 'static {
    type Item: Send + 'static;

    /// `None` for payloads with no recognised tag; those are skipped.
    fn into_update(self) -> Option<GenerationUpdate<Self::Item>>;
}

pub type BatchStream<T> = CancellableStream<Batch<T>>;
pub type GenerationStream<T> = CancellableStream<GenerationUpdate<T>>;

/// Consumer half of a pumped server stream.
///
/// Fused: after a terminal item, an error, or the end of the source every
/// further poll yields `None` without touching the transport.
pub struct CancellableStream<U> {
    rx: ReceiverStream<Result<U, RpcError>>,
    cancel: CancellationToken,
    is_terminal: fn(&U) -> bool,
    done: bool,
    _exclusive: Option<ExclusiveOperationGuard>,
}

impl<T: Send + 'static> CancellableStream<Batch<T>> {
    /// Pump a stream of batches; the stream ends after the batch flagged `is_last`.
    pub fn batches<S>(source: S, on_cancel: Option<CancelHook>) -> Self
    where
        S: Stream<Item = Result<Batch<T>, RpcError>> + Send + 'static,
    {
        spawn_pump(source, |batch: &Batch<T>| batch.is_last, on_cancel)
    }
}

impl<T: Send + 'static> CancellableStream<GenerationUpdate<T>> {
    /// Pump a stream of generation updates until the source completes.
    pub fn generation<S>(source: S, on_cancel: Option<CancelHook>) -> Self
    where
        S: Stream<Item = Result<GenerationUpdate<T>, RpcError>> + Send + 'static,
    {
        spawn_pump(source, |_: &GenerationUpdate<T>| false, on_cancel)
    }
}

impl<U> CancellableStream<U> {
    /// Stop the producer now rather than on drop.
    pub fn cancel(&mut self) {
        self.done = true;
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.done
    }

    fn hold_exclusive(mut self, guard: ExclusiveOperationGuard) -> Self {
        self._exclusive = Some(guard);
        self
    }
}

impl<U> Stream for CancellableStream<U> {
    type Item = Result<U, RpcError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }

        let next = futures::ready!(this.rx.poll_next_unpin(cx));
        this.done = match &next {
            Some(Ok(item)) => (this.is_terminal)(item),
            Some(Err(_)) | None => true,
        };
        Poll::Ready(next)
    }
}

impl<U> Drop for CancellableStream<U> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn spawn_pump<S, U>(
    source: S,
    is_terminal: fn(&U) -> bool,
    on_cancel: Option<CancelHook>,
) -> CancellableStream<U>
where
    S: Stream<Item = Result<U, RpcError>> + Send + 'static,
    U: Send + 'static,
{
    let (tx, rx) = mpsc::channel(STREAM_BUFFER);
    let cancel = CancellationToken::new();
    let token = cancel.clone();

    tokio::spawn(async move {
        let mut source = Box::pin(source);
        let abandoned = loop {
            tokio::select! {
                _ = token.cancelled() => break true,
                next = source.next() => match next {
                    Some(Ok(item)) => {
                        let terminal = is_terminal(&item);
                        if tx.send(Ok(item)).await.is_err() {
                            break true;
                        }
                        if terminal {
                            break false;
                        }
                    }
                    Some(Err(err)) => {
                        tracing::warn!(error = %err, "Server stream failed");
                        let _ = tx.send(Err(err)).await;
                        break false;
                    }
                    None => break false,
                },
            }
        };

        // Dropping the source resets the call on the transport.
        drop(source);
        if abandoned {
            tracing::debug!("Server stream abandoned by consumer, call cancelled");
            if let Some(hook) = on_cancel {
                hook();
            }
        }
    });

    CancellableStream {
        rx: ReceiverStream::new(rx),
        cancel,
        is_terminal,
        done: false,
        _exclusive: None,
    }
}

/// Opens server streams on the shared connection and exposes them as
/// cancellable async sequences.
pub struct StreamingLoader<C = ConnectionManager> {
    connection: Arc<C>,
    on_cancel: Option<CancelHook>,
}

impl<C> Clone for StreamingLoader<C> {
    fn clone(&self) -> Self {
        Self {
            connection: self.connection.clone(),
            on_cancel: self.on_cancel.clone(),
        }
    }
}

impl<C: StreamTransport> StreamingLoader<C> {
    pub fn new(connection: Arc<C>) -> Self {
        Self {
            connection,
            on_cancel: None,
        }
    }

    /// Observe every stream abandoned before completion.
    pub fn with_cancel_hook(mut self, hook: CancelHook) -> Self {
        self.on_cancel = Some(hook);
        self
    }

    pub async fn stream_batches<Req, P>(
        &self,
        service: &str,
        method: &str,
        request: Req,
    ) -> Result<BatchStream<P::Item>, RpcError>
    where
        Req: prost::Message + 'static,
        P: BatchPayload + prost::Message + Default,
    {
        let source = self
            .connection
            .open_stream::<Req, P>(service, method, request, None)
            .await?
            .map(|payload| payload.map(BatchPayload::into_batch));

        tracing::debug!(service, method, "Batch stream opened");
        Ok(BatchStream::batches(source, self.on_cancel.clone()))
    }

    /// Open a generation stream under the long-operation timeout. The
    /// connection refuses non-forced reconnects until the stream is dropped.
    pub async fn stream_generation<Req, P>(
        &self,
        service: &str,
        method: &str,
        request: Req,
    ) -> Result<GenerationStream<P::Item>, RpcError>
    where
        Req: prost::Message + 'static,
        P: GenerationPayload + prost::Message + Default,
    {
        let guard = self.connection.begin_exclusive_operation();
        let timeout = self
            .connection
            .long_operation_timeout()
            .ok_or(RpcError::NotConnected)?;

        let source = self
            .connection
            .open_stream::<Req, P>(service, method, request, Some(timeout))
            .await?
            .filter_map(|payload| async move {
                match payload {
                    Ok(p) => p.into_update().map(Ok),
                    Err(err) => Some(Err(err)),
                }
            });

        tracing::debug!(service, method, timeout_secs = timeout.as_secs(), "Generation stream opened");
        Ok(GenerationStream::generation(source, self.on_cancel.clone()).hold_exclusive(guard))
    }
}

/// Drain a generation stream, reporting progress and keeping results.
///
/// Fails with `NoResultsProduced` when the stream completes without a result.
pub async fn collect_generation<T, F>(
    mut stream: GenerationStream<T>,
    mut on_progress: F,
) -> Result<Vec<T>, RpcError>
where
    F: FnMut(f32, &str),
{
    let mut results = Vec::new();
    while let Some(update) = stream.next().await {
        match update? {
            GenerationUpdate::Progress { fraction, message } => on_progress(fraction, &message),
            GenerationUpdate::Result(item) => results.push(item),
        }
    }

    if results.is_empty() {
        return Err(RpcError::NoResultsProduced);
    }
    Ok(results)
}
