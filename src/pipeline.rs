//! # Ingestion Pipeline
//!
//! Ties the connection supervisor to the buffer and the persistence sink.
//!
//! ## Architecture
//! - **FrameRouter**: notification handler; stamps each frame and queues it
//! - **Writer thread**: sole owner of the decoder, buffer, retry queue and sink
//! - **IngestionPipeline**: async `start`/`stop` facade for callers
//!
//! Every mutation of the buffer happens on the writer thread, in the order the
//! commands were queued. `stop()` queues `Close` before the supervisor
//! unsubscribes, so any frame that arrives afterwards is rejected instead of
//! being persisted.
//!
//! ## Flush Policy
//! A failed batch is kept, in order, at the head of a retry queue and written
//! again on the next flush before newer data. Its first failure is reported on
//! the event channel; later retries are only logged. When the queue grows past
//! `max_pending_batches` the oldest batch is dropped and reported.

use crate::buffer::{Buffer, BufferStatus};
use crate::config::Config;
use crate::connection::{ConnectionState, ConnectionSupervisor, NotificationHandler};
use crate::decoder::SampleDecoder;
use crate::error::{MonitorError, PipelineError};
use crate::events::{EventSender, PipelineEvent};
use crate::persistence::PersistenceSink;
use crate::sample::{Sample, SessionId};
use crate::transport::Transport;
use chrono::{DateTime, Utc};
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::thread;
use tokio::sync::oneshot;

/// Outcome of one flush
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Samples written by this flush, retries included
    pub persisted: usize,
    /// Samples still waiting in the retry queue
    pub retained: usize,
    /// Samples given up on by this flush
    pub dropped: usize,
}

/// Running counters kept by the writer thread
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub frames_received: usize,
    pub frames_rejected: usize,
    pub decode_failures: usize,
    pub samples_decoded: usize,
    pub samples_buffered: usize,
    pub samples_persisted: usize,
    pub samples_dropped: usize,
    pub pending_batches: usize,
    /// Flushes triggered by the buffer reaching capacity
    pub automatic_flushes: usize,
}

/// Command sent to the writer thread
#[derive(Debug)]
enum IngestCommand {
    /// Create the buffer and start accepting frames
    Open,
    Frame {
        frame: Vec<u8>,
        received_at: DateTime<Utc>,
    },
    Flush {
        reply: oneshot::Sender<FlushReport>,
    },
    /// Flush, discard the buffer and reject frames until the next `Open`
    Close {
        reply: Option<oneshot::Sender<FlushReport>>,
    },
    BindSession(Option<SessionId>),
    Stats {
        reply: oneshot::Sender<PipelineStats>,
    },
    Shutdown,
}

/// Notification handler handed to the supervisor
struct FrameRouter {
    commands: Sender<IngestCommand>,
}

impl NotificationHandler for FrameRouter {
    fn on_notification(&self, frame: Vec<u8>) {
        let command = IngestCommand::Frame {
            frame,
            received_at: Utc::now(),
        };
        if self.commands.send(command).is_err() {
            log::warn!("Writer thread gone, dropping notification");
        }
    }

    fn on_link_lost(&self) {
        if self.commands.send(IngestCommand::Close { reply: None }).is_err() {
            log::warn!("Writer thread gone, buffer not flushed on link loss");
        }
    }
}

struct PendingBatch {
    samples: Vec<Sample>,
    /// Whether the failure was already reported on the event channel
    reported: bool,
}

/// State owned by the writer thread
struct IngestWorker<S> {
    sink: S,
    decoder: SampleDecoder,
    capacity: NonZeroUsize,
    buffer: Option<Buffer>,
    pending: VecDeque<PendingBatch>,
    max_pending: usize,
    stats: PipelineStats,
    events: EventSender,
}

impl<S: PersistenceSink> IngestWorker<S> {
    fn new(sink: S, capacity: NonZeroUsize, max_pending: usize, events: EventSender) -> Self {
        Self {
            sink,
            decoder: SampleDecoder::new(),
            capacity,
            buffer: None,
            pending: VecDeque::new(),
            max_pending,
            stats: PipelineStats::default(),
            events,
        }
    }

    fn open(&mut self) {
        if self.buffer.is_none() {
            log::debug!("Buffer opened (capacity {})", self.capacity);
            self.buffer = Some(Buffer::new(self.capacity));
        }
    }

    fn handle_frame(&mut self, frame: Vec<u8>, received_at: DateTime<Utc>) {
        self.stats.frames_received += 1;

        let Some(buffer) = self.buffer.as_mut() else {
            self.stats.frames_rejected += 1;
            log::debug!("Rejecting frame received while closed");
            self.events.emit(PipelineEvent::FrameRejected);
            return;
        };

        match self.decoder.decode(&frame, received_at) {
            Ok(sample) => {
                self.stats.samples_decoded += 1;
                if buffer.append(sample) == BufferStatus::Full {
                    self.stats.automatic_flushes += 1;
                    self.flush();
                }
            }
            Err(e) => {
                self.stats.decode_failures += 1;
                log::warn!("Discarding frame {:02x?}: {}", frame, e);
                self.events.emit(PipelineEvent::DecodeFailed(e));
            }
        }
    }

    /// Drain the buffer behind any queued retries and write everything in order
    fn flush(&mut self) -> FlushReport {
        if let Some(buffer) = self.buffer.as_mut() {
            if !buffer.is_empty() {
                self.pending.push_back(PendingBatch {
                    samples: buffer.drain(),
                    reported: false,
                });
            }
        }

        let mut report = FlushReport::default();
        while let Some(mut batch) = self.pending.pop_front() {
            match self.sink.write_batch(&batch.samples) {
                Ok(written) => {
                    log::debug!("Persisted batch of {} samples", written);
                    report.persisted += written;
                    self.events
                        .emit(PipelineEvent::BatchPersisted { count: written });
                }
                Err(e) => {
                    let written = e.written.min(batch.samples.len());
                    if written > 0 {
                        batch.samples.drain(..written);
                        report.persisted += written;
                        self.events
                            .emit(PipelineEvent::BatchPersisted { count: written });
                    }

                    if batch.reported {
                        log::warn!("Retry of {} samples failed: {}", batch.samples.len(), e);
                    } else {
                        log::error!(
                            "Failed to persist {} samples, keeping them for retry: {}",
                            batch.samples.len(),
                            e
                        );
                        self.events.emit(PipelineEvent::PersistenceFailed {
                            samples: batch.samples.len(),
                            error: e.to_string(),
                        });
                        batch.reported = true;
                    }

                    self.pending.push_front(batch);
                    break;
                }
            }
        }
        self.stats.samples_persisted += report.persisted;

        while self.pending.len() > self.max_pending {
            if let Some(batch) = self.pending.pop_front() {
                report.dropped += self.drop_batch(batch, "retry queue full");
            }
        }

        report.retained = self.retained();
        report
    }

    fn close(&mut self) -> FlushReport {
        let report = self.flush();
        if self.buffer.take().is_some() {
            log::debug!("Buffer closed");
        }
        report
    }

    fn shutdown(&mut self) {
        let mut report = self.close();
        while let Some(batch) = self.pending.pop_front() {
            report.dropped += self.drop_batch(batch, "pipeline shut down");
        }
        log::info!(
            "Writer thread stopped ({} persisted, {} dropped in final flush)",
            report.persisted,
            report.dropped
        );
    }

    fn drop_batch(&mut self, batch: PendingBatch, reason: &str) -> usize {
        let samples = batch.samples.len();
        log::error!("Dropping {} unpersisted samples: {}", samples, reason);
        self.stats.samples_dropped += samples;
        self.events.emit(PipelineEvent::BatchDropped {
            samples,
            reason: reason.to_string(),
        });
        samples
    }

    fn retained(&self) -> usize {
        self.pending.iter().map(|b| b.samples.len()).sum()
    }

    fn stats(&self) -> PipelineStats {
        PipelineStats {
            samples_buffered: self.buffer.as_ref().map_or(0, Buffer::len),
            pending_batches: self.pending.len(),
            ..self.stats
        }
    }
}

/// Writer thread loop
///
/// Processes commands in arrival order until `Shutdown` or until every
/// sender is gone, then performs a final flush.
fn writer_loop<S: PersistenceSink>(command_rx: Receiver<IngestCommand>, mut worker: IngestWorker<S>) {
    loop {
        match command_rx.recv() {
            Ok(IngestCommand::Open) => worker.open(),
            Ok(IngestCommand::Frame { frame, received_at }) => {
                worker.handle_frame(frame, received_at)
            }
            Ok(IngestCommand::Flush { reply }) => {
                let _ = reply.send(worker.flush());
            }
            Ok(IngestCommand::Close { reply }) => {
                let report = worker.close();
                if let Some(reply) = reply {
                    let _ = reply.send(report);
                }
            }
            Ok(IngestCommand::BindSession(session)) => {
                log::info!("Binding samples to session {:?}", session);
                worker.decoder.bind_session(session);
            }
            Ok(IngestCommand::Stats { reply }) => {
                let _ = reply.send(worker.stats());
            }
            Ok(IngestCommand::Shutdown) => {
                worker.shutdown();
                break;
            }
            Err(_) => {
                log::info!("Writer thread: command channel closed");
                worker.shutdown();
                break;
            }
        }
    }
}

/// Heart rate acquisition: connection lifecycle plus buffered persistence
pub struct IngestionPipeline<T: Transport> {
    supervisor: ConnectionSupervisor<T>,
    command_tx: Sender<IngestCommand>,
    writer_thread: Option<thread::JoinHandle<()>>,
}

impl<T: Transport> IngestionPipeline<T> {
    /// Creates the pipeline and spawns its writer thread.
    ///
    /// Returns the pipeline and the receiving end of the event channel.
    pub fn new<S>(
        config: &Config,
        transport: T,
        sink: S,
    ) -> Result<(Self, Receiver<PipelineEvent>), PipelineError>
    where
        S: PersistenceSink + 'static,
    {
        config.validate()?;
        let capacity = config.capacity()?;

        let (event_tx, event_rx) = unbounded();
        let events = EventSender::new(event_tx);
        let (command_tx, command_rx) = unbounded();

        let worker = IngestWorker::new(sink, capacity, config.max_pending_batches, events.clone());
        let writer_thread = thread::Builder::new()
            .name("pulse-writer".to_string())
            .spawn(move || writer_loop(command_rx, worker))
            .map_err(PipelineError::WriterSpawn)?;

        let supervisor = ConnectionSupervisor::new(transport, config.link_settings(), events);

        Ok((
            IngestionPipeline {
                supervisor,
                command_tx,
                writer_thread: Some(writer_thread),
            },
            event_rx,
        ))
    }

    fn send(&self, command: IngestCommand) -> Result<(), MonitorError> {
        self.command_tx
            .send(command)
            .map_err(|_| MonitorError::PipelineClosed)
    }

    async fn request<R>(
        &self,
        make: impl FnOnce(oneshot::Sender<R>) -> IngestCommand,
    ) -> Result<R, MonitorError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(make(reply_tx))?;
        reply_rx.await.map_err(|_| MonitorError::PipelineClosed)
    }

    /// Open a fresh buffer and drive the supervisor to `Monitoring`.
    ///
    /// A no-op success when already monitoring.
    pub async fn start(&self) -> Result<(), MonitorError> {
        self.send(IngestCommand::Open)?;

        let router = Arc::new(FrameRouter {
            commands: self.command_tx.clone(),
        });
        if let Err(e) = self.supervisor.start_monitoring(router).await {
            let _ = self.send(IngestCommand::Close { reply: None });
            return Err(e);
        }
        Ok(())
    }

    /// Stop accepting frames, tear the link down and flush what was buffered.
    ///
    /// A `start()` still scanning is cancelled and returns `MonitorError::Cancelled`.
    pub async fn stop(&self) -> Result<FlushReport, MonitorError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let closed = self.send(IngestCommand::Close {
            reply: Some(reply_tx),
        });

        self.supervisor.stop_monitoring().await;

        closed?;
        reply_rx.await.map_err(|_| MonitorError::PipelineClosed)
    }

    /// Write out the current buffer and any queued retries now
    pub async fn flush(&self) -> Result<FlushReport, MonitorError> {
        self.request(|reply| IngestCommand::Flush { reply }).await
    }

    pub async fn stats(&self) -> Result<PipelineStats, MonitorError> {
        self.request(|reply| IngestCommand::Stats { reply }).await
    }

    /// Tag every sample decoded from now on with `session`
    pub fn bind_session(&self, session: Option<SessionId>) -> Result<(), MonitorError> {
        self.send(IngestCommand::BindSession(session))
    }

    pub async fn state(&self) -> ConnectionState {
        self.supervisor.state().await
    }
}

impl<T: Transport> Drop for IngestionPipeline<T> {
    fn drop(&mut self) {
        // Stop forwarding notifications and release the peripheral first
        self.supervisor.release();

        // Signal writer thread to stop
        let _ = self.command_tx.send(IngestCommand::Shutdown);

        // Wait for writer thread to finish
        if let Some(handle) = self.writer_thread.take() {
            let _ = handle.join();
        }
    }
}
