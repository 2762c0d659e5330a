//! Capture/Verdict Loop
//!
//! `Idle → Initialized → Running → Stopping → Idle`
//!
//! One dedicated thread reads the queue and runs every packet through the
//! [`Pipeline`] synchronously, so verdicts leave in arrival order. A packet
//! waiting on an interactive prompt or on the token bucket holds up every
//! packet behind it.

use crate::parse::extract;
use crate::queue::{Interrupt, PacketQueue, QueueOpener, QueuedPacket, Received};
use crate::stats::{CaptureStats, CaptureStatsSnapshot};
use crate::{CaptureError, Pipeline, Result};
use hostwall_common::{Action, LogEntry, Verdict};
use hostwall_events::EventSink;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Capture configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Netfilter queue number
    pub queue_id: u16,
    /// Bytes copied per packet
    pub buffer_size: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            queue_id: 0,
            buffer_size: 0xffff,
        }
    }
}

/// Capture loop state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CaptureState {
    Idle,
    Initialized,
    Running,
    Stopping,
}

struct Inner {
    state: CaptureState,
    queue: Option<Box<dyn PacketQueue>>,
    interrupter: Option<Arc<dyn Interrupt>>,
    thread: Option<JoinHandle<()>>,
}

/// Owns the queue handle and the capture thread
pub struct CaptureLoop {
    pipeline: Arc<Pipeline>,
    sink: Arc<dyn EventSink>,
    opener: Box<dyn QueueOpener>,
    inner: Mutex<Inner>,
    stop: Arc<AtomicBool>,
    stats: Arc<CaptureStats>,
}

impl CaptureLoop {
    pub fn new(pipeline: Arc<Pipeline>, sink: Arc<dyn EventSink>, opener: impl QueueOpener + 'static) -> Self {
        Self {
            pipeline,
            sink,
            opener: Box::new(opener),
            inner: Mutex::new(Inner {
                state: CaptureState::Idle,
                queue: None,
                interrupter: None,
                thread: None,
            }),
            stop: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(CaptureStats::default()),
        }
    }

    /// Acquire the queue. On failure the loop stays `Idle`.
    pub fn init(&self, config: CaptureConfig) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state != CaptureState::Idle {
            return Err(CaptureError::AlreadyInitialized);
        }

        let queue = self.opener.open(config.queue_id, config.buffer_size)?;
        inner.queue = Some(queue);
        inner.state = CaptureState::Initialized;

        info!(queue_id = config.queue_id, buffer_size = config.buffer_size, "Capture initialized");
        Ok(())
    }

    /// Spawn the capture thread. No-op while running.
    pub fn start(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.state {
            CaptureState::Running => return Ok(()),
            CaptureState::Initialized => {}
            CaptureState::Idle | CaptureState::Stopping => return Err(CaptureError::NotInitialized),
        }

        let queue = inner.queue.take().ok_or(CaptureError::NotInitialized)?;
        let interrupter = queue.interrupter();
        self.stop.store(false, Ordering::Release);

        let worker = Worker {
            queue,
            pipeline: Arc::clone(&self.pipeline),
            sink: Arc::clone(&self.sink),
            stop: Arc::clone(&self.stop),
            stats: Arc::clone(&self.stats),
        };

        let handle = match thread::Builder::new()
            .name("hostwall-capture".into())
            .spawn(move || worker.run())
        {
            Ok(handle) => handle,
            Err(e) => {
                // The queue went down with the closure
                inner.state = CaptureState::Idle;
                return Err(CaptureError::Spawn(e));
            }
        };

        inner.interrupter = Some(interrupter);
        inner.thread = Some(handle);
        inner.state = CaptureState::Running;
        info!("Capture loop started");
        Ok(())
    }

    /// Stop the thread and release the queue. Idempotent.
    pub fn stop(&self) {
        let (thread, interrupter) = {
            let mut inner = self.inner.lock();
            match inner.state {
                CaptureState::Idle | CaptureState::Stopping => return,
                CaptureState::Initialized => {
                    inner.queue = None;
                    inner.state = CaptureState::Idle;
                    info!("Capture released");
                    return;
                }
                CaptureState::Running => {}
            }
            inner.state = CaptureState::Stopping;
            (inner.thread.take(), inner.interrupter.take())
        };

        self.stop.store(true, Ordering::Release);
        if let Some(interrupter) = interrupter {
            interrupter.interrupt();
        }
        if let Some(handle) = thread {
            if handle.join().is_err() {
                error!("Capture thread panicked");
            }
        }

        self.inner.lock().state = CaptureState::Idle;
        info!("Capture loop stopped");
    }

    pub fn state(&self) -> CaptureState {
        self.inner.lock().state
    }

    pub fn is_running(&self) -> bool {
        self.state() == CaptureState::Running
    }

    pub fn stats(&self) -> CaptureStatsSnapshot {
        self.stats.snapshot()
    }

    /// Block until the capture thread exits on its own (queue closed)
    pub fn wait(&self) {
        let thread = self.inner.lock().thread.take();
        if let Some(handle) = thread {
            let _ = handle.join();
        }
        self.stop();
    }
}

impl Drop for CaptureLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Worker {
    queue: Box<dyn PacketQueue>,
    pipeline: Arc<Pipeline>,
    sink: Arc<dyn EventSink>,
    stop: Arc<AtomicBool>,
    stats: Arc<CaptureStats>,
}

impl Worker {
    fn run(mut self) {
        while !self.stop.load(Ordering::Acquire) {
            match self.queue.recv() {
                Ok(Received::Packet(packet)) => self.handle(packet),
                Ok(Received::Interrupted) => continue,
                Ok(Received::Closed) => {
                    info!("Packet queue closed");
                    break;
                }
                Err(e) => {
                    self.stats.record_error();
                    warn!(error = %e, "Queue read failed");
                    thread::sleep(Duration::from_millis(10));
                }
            }
        }
        debug!("Capture thread exiting");
    }

    /// Exactly one verdict per packet, Drop when evaluation fails
    fn handle(&mut self, packet: QueuedPacket) {
        self.stats.record_rx(packet.payload.len());

        let pipeline = &self.pipeline;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| pipeline.evaluate(&packet.payload)));

        let (verdict, entry) = match outcome {
            Ok(evaluation) => (evaluation.verdict, evaluation.log_entry()),
            Err(panic) => {
                self.stats.record_error();
                error!(
                    packet_id = packet.id,
                    panic = panic_message(&*panic),
                    "Verdict evaluation panicked, dropping packet"
                );
                let tuple = extract(&packet.payload, pipeline.link_type()).five_tuple();
                (Verdict::Drop, LogEntry::new(&tuple, Action::Block, "internal error"))
            }
        };

        self.sink.record(entry);
        self.stats.record_verdict(verdict);

        if let Err(e) = self.queue.verdict(packet.id, verdict) {
            self.stats.record_error();
            error!(packet_id = packet.id, error = %e, "Failed to issue verdict");
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::tests::ipv4_tcp;
    use crate::queue::ChannelOpener;
    use hostwall_common::LinkType;
    use hostwall_events::NullSink;

    fn empty_pipeline() -> Arc<Pipeline> {
        Arc::new(Pipeline::new(LinkType::Raw))
    }

    struct FailingOpener;

    impl QueueOpener for FailingOpener {
        fn open(&self, queue_id: u16, _buffer_size: usize) -> Result<Box<dyn PacketQueue>> {
            Err(CaptureError::QueueOpen {
                queue_id,
                source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "Operation not permitted"),
            })
        }
    }

    #[test]
    fn test_state_machine() {
        let (opener, _handle) = ChannelOpener::new(8);
        let capture = CaptureLoop::new(empty_pipeline(), Arc::new(NullSink), opener);

        assert!(matches!(capture.start(), Err(CaptureError::NotInitialized)));
        assert_eq!(capture.state(), CaptureState::Idle);

        capture.init(CaptureConfig::default()).unwrap();
        assert_eq!(capture.state(), CaptureState::Initialized);
        assert!(matches!(capture.init(CaptureConfig::default()), Err(CaptureError::AlreadyInitialized)));

        capture.start().unwrap();
        capture.start().unwrap();
        assert!(capture.is_running());

        capture.stop();
        capture.stop();
        assert_eq!(capture.state(), CaptureState::Idle);
    }

    #[test]
    fn test_failed_init_stays_idle() {
        let capture = CaptureLoop::new(empty_pipeline(), Arc::new(NullSink), FailingOpener);

        let err = capture.init(CaptureConfig { queue_id: 3, buffer_size: 1500 }).unwrap_err();
        assert!(matches!(err, CaptureError::QueueOpen { queue_id: 3, .. }));
        assert_eq!(capture.state(), CaptureState::Idle);
        assert!(matches!(capture.start(), Err(CaptureError::NotInitialized)));
    }

    #[test]
    fn test_stop_interrupts_idle_read() {
        let (opener, _handle) = ChannelOpener::new(8);
        let capture = CaptureLoop::new(empty_pipeline(), Arc::new(NullSink), opener);
        capture.init(CaptureConfig::default()).unwrap();
        capture.start().unwrap();

        // Nothing queued: the thread is parked in recv
        thread::sleep(Duration::from_millis(20));
        let start = std::time::Instant::now();
        capture.stop();
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_every_packet_gets_a_verdict() {
        let (opener, handle) = ChannelOpener::new(64);
        let capture = CaptureLoop::new(empty_pipeline(), Arc::new(NullSink), opener);
        capture.init(CaptureConfig::default()).unwrap();
        capture.start().unwrap();

        let packet = ipv4_tcp([10, 0, 0, 1], 1000, [10, 0, 0, 2], 80, b"x");
        let ids: Vec<u32> = (0..10).map(|_| handle.inject(packet.clone()).unwrap()).collect();
        handle.inject(vec![0xff; 3]).unwrap();

        for id in &ids {
            assert_eq!(handle.recv_verdict(Duration::from_secs(5)), Some((*id, Verdict::Drop)));
        }
        assert!(handle.recv_verdict(Duration::from_secs(5)).is_some());

        capture.stop();
        let stats = capture.stats();
        assert_eq!(stats.total, 11);
        assert_eq!(stats.dropped, 11);
        assert_eq!(stats.bytes, 10 * packet.len() as u64 + 3);
    }

    #[test]
    fn test_restart_requires_init() {
        let (opener, _handle) = ChannelOpener::new(8);
        let capture = CaptureLoop::new(empty_pipeline(), Arc::new(NullSink), opener);
        capture.init(CaptureConfig::default()).unwrap();
        capture.start().unwrap();
        capture.stop();

        assert!(matches!(capture.start(), Err(CaptureError::NotInitialized)));
        // The channel opener hands out its queue only once
        assert!(capture.init(CaptureConfig::default()).is_err());
    }
}
