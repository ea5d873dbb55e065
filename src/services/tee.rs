//! Bounded fan-out of one byte stream into two independently consumed streams.
//!
//! [`tee`] splits a source into a driver ([`Tee`]) and two [`TeeReader`]s.
//! The driver reads the source once, sequentially, and pushes every chunk
//! into both branches. Each branch holds at most `capacity` chunks, so a slow
//! reader throttles the driver instead of letting the payload pile up in
//! memory.
//!
//! All three halves share one [`CancellationToken`]. Tripping it stops the
//! driver, and each reader then yields an "aborted" error (see [`is_aborted`])
//! once its buffered chunks are drained, rather than a clean end of stream.

use bytes::Bytes;
use futures::{Stream, StreamExt, pin_mut};
use std::{
    io,
    pin::Pin,
    task::{Context, Poll, ready},
};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum TeeError {
    /// Reading the source failed.
    #[error("reading upload source: {0}")]
    Source(#[source] io::Error),
    /// A reader went away before the source was exhausted.
    #[error("tee reader closed before the copy finished")]
    SinkClosed,
    /// The shared token was tripped by someone else.
    #[error("copy aborted")]
    Aborted,
}

/// Payload of the I/O error handed to readers after an abort.
#[derive(Debug, Error)]
#[error("upload aborted")]
pub struct TeeAborted;

/// True when `err` is the error a [`TeeReader`] yields after an abort.
pub fn is_aborted(err: &io::Error) -> bool {
    err.get_ref().is_some_and(|inner| inner.is::<TeeAborted>())
}

/// Split `source` into a copy driver and two readers.
///
/// `capacity` is the number of chunks each branch may buffer; it is clamped
/// to at least one.
pub fn tee<S>(
    source: S,
    capacity: usize,
    token: CancellationToken,
) -> (Tee<S>, TeeReader, TeeReader)
where
    S: Stream<Item = io::Result<Bytes>>,
{
    let capacity = capacity.max(1);
    let (left_tx, left_rx) = mpsc::channel(capacity);
    let (right_tx, right_rx) = mpsc::channel(capacity);

    let driver = Tee {
        source,
        sinks: [left_tx, right_tx],
        token: token.clone(),
    };
    (
        driver,
        TeeReader::new(left_rx, token.clone()),
        TeeReader::new(right_rx, token),
    )
}

/// Copy driver returned by [`tee`].
pub struct Tee<S> {
    source: S,
    sinks: [mpsc::Sender<Bytes>; 2],
    token: CancellationToken,
}

impl<S> Tee<S>
where
    S: Stream<Item = io::Result<Bytes>>,
{
    /// Copy the whole source into both branches and return the byte count.
    ///
    /// On a source error or a vanished reader the shared token is tripped
    /// before the branches close, so the surviving reader sees an abort
    /// instead of a truncated stream.
    pub async fn run(self) -> Result<u64, TeeError> {
        let Tee {
            source,
            sinks,
            token,
        } = self;
        pin_mut!(source);

        let mut copied: u64 = 0;
        loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(TeeError::Aborted),
                next = source.next() => next,
            };

            let chunk = match next {
                None => return Ok(copied),
                Some(Ok(chunk)) => chunk,
                Some(Err(err)) => {
                    token.cancel();
                    return Err(TeeError::Source(err));
                }
            };
            if chunk.is_empty() {
                continue;
            }

            for sink in &sinks {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => return Err(TeeError::Aborted),
                    sent = sink.send(chunk.clone()) => {
                        if sent.is_err() {
                            token.cancel();
                            return Err(TeeError::SinkClosed);
                        }
                    }
                }
            }
            copied += chunk.len() as u64;
        }
    }
}

/// One branch of a [`tee`].
pub struct TeeReader {
    rx: mpsc::Receiver<Bytes>,
    token: CancellationToken,
    finished: bool,
}

impl TeeReader {
    fn new(rx: mpsc::Receiver<Bytes>, token: CancellationToken) -> Self {
        Self {
            rx,
            token,
            finished: false,
        }
    }
}

impl Stream for TeeReader {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }
        match ready!(self.rx.poll_recv(cx)) {
            Some(chunk) => Poll::Ready(Some(Ok(chunk))),
            None => {
                self.finished = true;
                if self.token.is_cancelled() {
                    Poll::Ready(Some(Err(io::Error::other(TeeAborted))))
                } else {
                    Poll::Ready(None)
                }
            }
        }
    }
}
