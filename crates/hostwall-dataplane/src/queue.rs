//! Packet queues
//!
//! [`PacketQueue`] is the kernel interception handle as the capture loop
//! sees it: a blocking read that can be interrupted from another thread,
//! and a verdict write keyed by packet id.
//!
//! - [`ChannelQueue`]: in-process queue fed through a [`QueueHandle`]
//! - `NfqQueue`: netfilter queue (`nfqueue` feature, Linux)

use crate::{CaptureError, Result};
use crossbeam_channel::{bounded, select, unbounded, Receiver, RecvTimeoutError, Sender};
use hostwall_common::Verdict;
use parking_lot::Mutex;
use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// One packet waiting for a verdict
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedPacket {
    pub id: u32,
    pub payload: Vec<u8>,
}

/// Result of a blocking read
#[derive(Debug)]
pub enum Received {
    Packet(QueuedPacket),
    /// Woken by an [`Interrupt`]
    Interrupted,
    /// The source went away; no more packets will arrive
    Closed,
}

/// Wakes a thread blocked in [`PacketQueue::recv`]
pub trait Interrupt: Send + Sync {
    fn interrupt(&self);
}

/// Kernel interception handle
pub trait PacketQueue: Send {
    /// Block until a packet arrives or the read is interrupted
    fn recv(&mut self) -> Result<Received>;

    /// Issue the verdict for a packet returned by `recv`
    fn verdict(&mut self, id: u32, verdict: Verdict) -> Result<()>;

    fn interrupter(&self) -> Arc<dyn Interrupt>;
}

/// Acquires a [`PacketQueue`]
pub trait QueueOpener: Send + Sync {
    fn open(&self, queue_id: u16, buffer_size: usize) -> Result<Box<dyn PacketQueue>>;
}

// ============================================================================
// Channel queue
// ============================================================================

/// In-process queue
pub struct ChannelQueue {
    packets: Receiver<QueuedPacket>,
    verdicts: Sender<(u32, Verdict)>,
    wake_rx: Receiver<()>,
    wake_tx: Sender<()>,
    buffer_size: usize,
}

/// Producer side of a [`ChannelQueue`]
#[derive(Clone)]
pub struct QueueHandle {
    packets: Sender<QueuedPacket>,
    verdicts: Receiver<(u32, Verdict)>,
    next_id: Arc<AtomicU32>,
}

struct ChannelInterrupt(Sender<()>);

impl Interrupt for ChannelInterrupt {
    fn interrupt(&self) {
        // A pending wake-up is as good as a second one
        let _ = self.0.try_send(());
    }
}

impl ChannelQueue {
    /// Queue holding up to `capacity` undelivered packets
    pub fn new(capacity: usize) -> (Self, QueueHandle) {
        let (packet_tx, packet_rx) = bounded(capacity.max(1));
        let (verdict_tx, verdict_rx) = unbounded();
        let (wake_tx, wake_rx) = bounded(1);

        let queue = Self {
            packets: packet_rx,
            verdicts: verdict_tx,
            wake_rx,
            wake_tx,
            buffer_size: usize::MAX,
        };
        let handle = QueueHandle {
            packets: packet_tx,
            verdicts: verdict_rx,
            next_id: Arc::new(AtomicU32::new(1)),
        };
        (queue, handle)
    }

    /// Truncate delivered payloads like a kernel copy range would
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }
}

impl PacketQueue for ChannelQueue {
    fn recv(&mut self) -> Result<Received> {
        select! {
            recv(self.packets) -> msg => Ok(match msg {
                Ok(mut packet) => {
                    packet.payload.truncate(self.buffer_size);
                    Received::Packet(packet)
                }
                Err(_) => Received::Closed,
            }),
            recv(self.wake_rx) -> _ => Ok(Received::Interrupted),
        }
    }

    fn verdict(&mut self, id: u32, verdict: Verdict) -> Result<()> {
        self.verdicts
            .send((id, verdict))
            .map_err(|_| CaptureError::Queue(io::Error::new(io::ErrorKind::BrokenPipe, "verdict receiver gone")))
    }

    fn interrupter(&self) -> Arc<dyn Interrupt> {
        Arc::new(ChannelInterrupt(self.wake_tx.clone()))
    }
}

impl QueueHandle {
    /// Queue a packet, returning its id
    pub fn inject(&self, payload: impl Into<Vec<u8>>) -> Result<u32> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.packets
            .send(QueuedPacket {
                id,
                payload: payload.into(),
            })
            .map_err(|_| CaptureError::Queue(io::Error::new(io::ErrorKind::BrokenPipe, "queue closed")))?;
        Ok(id)
    }

    /// Next verdict, in issue order
    pub fn recv_verdict(&self, timeout: Duration) -> Option<(u32, Verdict)> {
        match self.verdicts.recv_timeout(timeout) {
            Ok(v) => Some(v),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }
}

/// Hands out one pre-built [`ChannelQueue`]
pub struct ChannelOpener {
    queue: Mutex<Option<ChannelQueue>>,
}

impl ChannelOpener {
    pub fn new(capacity: usize) -> (Self, QueueHandle) {
        let (queue, handle) = ChannelQueue::new(capacity);
        (
            Self {
                queue: Mutex::new(Some(queue)),
            },
            handle,
        )
    }
}

impl QueueOpener for ChannelOpener {
    fn open(&self, queue_id: u16, buffer_size: usize) -> Result<Box<dyn PacketQueue>> {
        match self.queue.lock().take() {
            Some(queue) => Ok(Box::new(queue.with_buffer_size(buffer_size))),
            None => Err(CaptureError::QueueOpen {
                queue_id,
                source: io::Error::new(io::ErrorKind::AddrInUse, "queue already bound"),
            }),
        }
    }
}

// ============================================================================
// Netfilter queue
// ============================================================================

#[cfg(all(feature = "nfqueue", target_os = "linux"))]
pub mod nfqueue {
    //! NFQUEUE capture
    //!
    //! The netlink socket is non-blocking; `recv` polls it together with the
    //! read end of a pipe so [`Interrupt`] can wake a blocked read.

    use super::{Interrupt, PacketQueue, QueueOpener, QueuedPacket, Received};
    use crate::{CaptureError, Result};
    use hostwall_common::Verdict;
    use std::collections::HashMap;
    use std::io;
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
    use std::sync::Arc;
    use tracing::{debug, info};

    /// Bound netfilter queue
    pub struct NfqQueue {
        queue: nfq::Queue,
        queue_id: u16,
        wake_rx: OwnedFd,
        wake_tx: Arc<OwnedFd>,
        next_id: u32,
        pending: HashMap<u32, nfq::Message>,
    }

    struct PipeInterrupt(Arc<OwnedFd>);

    impl Interrupt for PipeInterrupt {
        fn interrupt(&self) {
            let byte = [1u8];
            // EAGAIN means a wake-up is already pending
            unsafe {
                libc::write(self.0.as_raw_fd(), byte.as_ptr().cast(), 1);
            }
        }
    }

    fn pipe() -> io::Result<(OwnedFd, OwnedFd)> {
        let mut fds = [0 as RawFd; 2];
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: pipe2 succeeded, both descriptors are fresh and owned here
        Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
    }

    impl NfqQueue {
        /// Open the netlink socket, bind `queue_id` and request up to
        /// `buffer_size` bytes of every packet. Nothing stays bound on error.
        pub fn open(queue_id: u16, buffer_size: usize) -> Result<Self> {
            let err = |source: io::Error| CaptureError::QueueOpen { queue_id, source };

            let mut queue = nfq::Queue::open().map_err(err)?;
            queue.bind(queue_id).map_err(err)?;
            let copy_range = buffer_size.clamp(1, usize::from(u16::MAX)) as u16;
            queue.set_copy_range(queue_id, copy_range).map_err(err)?;
            queue.set_nonblocking(true);

            let (wake_rx, wake_tx) = pipe().map_err(err)?;

            info!(queue_id, copy_range, "Netfilter queue bound");
            Ok(Self {
                queue,
                queue_id,
                wake_rx,
                wake_tx: Arc::new(wake_tx),
                next_id: 0,
                pending: HashMap::new(),
            })
        }

        fn drain_wake(&self) {
            let mut buf = [0u8; 64];
            loop {
                let n = unsafe { libc::read(self.wake_rx.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len()) };
                if n <= 0 {
                    break;
                }
            }
        }

        /// Wait until the socket or the wake pipe is readable
        fn wait(&self) -> io::Result<bool> {
            let mut fds = [
                libc::pollfd {
                    fd: self.queue.as_raw_fd(),
                    events: libc::POLLIN,
                    revents: 0,
                },
                libc::pollfd {
                    fd: self.wake_rx.as_raw_fd(),
                    events: libc::POLLIN,
                    revents: 0,
                },
            ];

            loop {
                let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1) };
                if rc >= 0 {
                    break;
                }
                let e = io::Error::last_os_error();
                if e.kind() != io::ErrorKind::Interrupted {
                    return Err(e);
                }
            }

            if fds[1].revents != 0 {
                self.drain_wake();
                return Ok(false);
            }
            Ok(true)
        }
    }

    impl PacketQueue for NfqQueue {
        fn recv(&mut self) -> Result<Received> {
            loop {
                match self.queue.recv() {
                    Ok(msg) => {
                        self.next_id = self.next_id.wrapping_add(1);
                        let id = self.next_id;
                        let payload = msg.get_payload().to_vec();
                        self.pending.insert(id, msg);
                        return Ok(Received::Packet(QueuedPacket { id, payload }));
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        if !self.wait()? {
                            return Ok(Received::Interrupted);
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(CaptureError::Queue(e)),
                }
            }
        }

        fn verdict(&mut self, id: u32, verdict: Verdict) -> Result<()> {
            let mut msg = self.pending.remove(&id).ok_or_else(|| {
                CaptureError::Queue(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("no pending packet {id}"),
                ))
            })?;

            msg.set_verdict(match verdict {
                Verdict::Accept => nfq::Verdict::Accept,
                Verdict::Drop => nfq::Verdict::Drop,
            });
            self.queue.verdict(msg).map_err(CaptureError::Queue)
        }

        fn interrupter(&self) -> Arc<dyn Interrupt> {
            Arc::new(PipeInterrupt(Arc::clone(&self.wake_tx)))
        }
    }

    impl Drop for NfqQueue {
        fn drop(&mut self) {
            // Packets still held would otherwise sit in the kernel queue
            for (_, mut msg) in self.pending.drain() {
                msg.set_verdict(nfq::Verdict::Drop);
                let _ = self.queue.verdict(msg);
            }
            if let Err(e) = self.queue.unbind(self.queue_id) {
                debug!(queue_id = self.queue_id, error = %e, "Unbind failed");
            }
        }
    }

    /// Opens [`NfqQueue`]s
    #[derive(Clone, Copy, Debug, Default)]
    pub struct NfqOpener;

    impl QueueOpener for NfqOpener {
        fn open(&self, queue_id: u16, buffer_size: usize) -> Result<Box<dyn PacketQueue>> {
            Ok(Box::new(NfqQueue::open(queue_id, buffer_size)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_channel_roundtrip() {
        let (mut queue, handle) = ChannelQueue::new(8);

        let id = handle.inject(vec![1, 2, 3]).unwrap();
        match queue.recv().unwrap() {
            Received::Packet(packet) => {
                assert_eq!(packet.id, id);
                assert_eq!(packet.payload, vec![1, 2, 3]);
            }
            other => panic!("unexpected: {other:?}"),
        }

        queue.verdict(id, Verdict::Drop).unwrap();
        assert_eq!(handle.recv_verdict(Duration::from_secs(1)), Some((id, Verdict::Drop)));
    }

    #[test]
    fn test_interrupt_wakes_blocked_recv() {
        let (mut queue, _handle) = ChannelQueue::new(8);
        let interrupter = queue.interrupter();

        let reader = thread::spawn(move || matches!(queue.recv(), Ok(Received::Interrupted)));
        thread::sleep(Duration::from_millis(20));
        interrupter.interrupt();
        interrupter.interrupt();

        assert!(reader.join().unwrap());
    }

    #[test]
    fn test_closed_when_handle_dropped() {
        let (mut queue, handle) = ChannelQueue::new(8);
        drop(handle);
        assert!(matches!(queue.recv(), Ok(Received::Closed)));
    }

    #[test]
    fn test_opener_hands_out_once_and_truncates() {
        let (opener, handle) = ChannelOpener::new(8);

        let mut queue = opener.open(0, 4).unwrap();
        assert!(matches!(opener.open(0, 4), Err(CaptureError::QueueOpen { queue_id: 0, .. })));

        handle.inject(vec![9; 10]).unwrap();
        match queue.recv().unwrap() {
            Received::Packet(packet) => assert_eq!(packet.payload.len(), 4),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
