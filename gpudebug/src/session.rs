/// Debug session internals
///
/// This module owns the per-session state behind a session handle: the
/// FIFO event queue fed by the device notice stream, the thread run-state
/// table that gates memory and register access, and the thread-scoped
/// accessors themselves.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::time::{timeout, Instant};

use crate::codec;
use crate::link::{DeviceLink, DeviceReply, DeviceRequest};
use crate::types::{
    DebugEvent, DeviceHandle, DriverError, EventKind, MemorySpace, Result, THREAD_ALL,
    THREAD_NONE, TIMEOUT_INFINITE,
};

/// Maximum pending events per session; the oldest event is dropped when a
/// device outruns its debugger.
const EVENT_QUEUE_CAP: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Running,
    Stopped,
}

struct EventQueue {
    events: Mutex<VecDeque<DebugEvent>>,
    notify: Notify,
}

impl EventQueue {
    fn new() -> Self {
        EventQueue {
            events: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    fn push(&self, event: DebugEvent) {
        {
            let mut events = self.events.lock().unwrap();
            if events.len() == EVENT_QUEUE_CAP {
                let dropped = events.pop_front();
                log::warn!("event queue full, dropped {:?}", dropped.map(|e| e.kind));
            }
            events.push_back(event);
        }
        self.notify.notify_one();
    }
}

/// One attached debugger/device relationship.
///
/// Cheap to clone; the driver hands out clones so handle resolution does
/// not hold the session registry across device round trips.
#[derive(Clone)]
pub(crate) struct DebugSession {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    device: DeviceHandle,
    pid: u32,
    num_threads: u64,
    link: DeviceLink,
    queue: EventQueue,
    threads: Mutex<Vec<RunState>>,
}

impl DebugSession {
    pub(crate) fn new(
        device: DeviceHandle,
        pid: u32,
        num_threads: u64,
        link: DeviceLink,
        notices: mpsc::UnboundedReceiver<DebugEvent>,
    ) -> Self {
        let session = DebugSession {
            inner: Arc::new(SessionInner {
                device,
                pid,
                num_threads,
                link,
                queue: EventQueue::new(),
                threads: Mutex::new(vec![RunState::Running; num_threads as usize]),
            }),
        };
        session.start_event_pump(notices);
        session
    }

    pub(crate) fn device(&self) -> DeviceHandle {
        self.inner.device
    }

    pub(crate) fn pid(&self) -> u32 {
        self.inner.pid
    }

    /// The maximal number of addressable device threads.
    pub(crate) fn num_threads(&self) -> u64 {
        self.inner.num_threads
    }

    /// Move device notices into the session queue until the device closes
    /// the stream (detach, host exit, or device loss).
    ///
    /// Run-state changes are applied before the event becomes readable, so
    /// a drained stop event guarantees the thread table shows the thread
    /// stopped.
    fn start_event_pump(&self, mut notices: mpsc::UnboundedReceiver<DebugEvent>) {
        let inner = self.inner.clone();

        tokio::spawn(async move {
            log::debug!("event pump for pid {} started", inner.pid);
            while let Some(event) = notices.recv().await {
                if event.kind == EventKind::Exception
                    && event.stopped()
                    && event.thread < inner.num_threads
                {
                    inner.threads.lock().unwrap()[event.thread as usize] = RunState::Stopped;
                }
                inner.queue.push(event);
            }
            log::debug!("event pump for pid {} stopped", inner.pid);
        });
    }

    /// Dequeue the oldest pending event into `buf`, waiting up to
    /// `timeout_ms` milliseconds (or forever for `TIMEOUT_INFINITE`).
    ///
    /// A buffer too small for the pending event fails with
    /// `OutOfHostMemory` and leaves the event queued for a retry.
    pub(crate) async fn read_event(&self, timeout_ms: u64, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Err(DriverError::InvalidNullPointer);
        }

        let deadline = if timeout_ms == TIMEOUT_INFINITE {
            None
        } else {
            // Saturate absurd finite timeouts into an infinite wait.
            Instant::now().checked_add(Duration::from_millis(timeout_ms))
        };

        loop {
            let notified = self.inner.queue.notify.notified();

            {
                let mut events = self.inner.queue.events.lock().unwrap();
                if let Some(event) = events.front().copied() {
                    let needed = codec::encoded_event_len(event.kind);
                    if buf.len() < needed {
                        return Err(DriverError::OutOfHostMemory);
                    }
                    let written = codec::encode_event(&event, buf)?;
                    events.pop_front();
                    return Ok(written);
                }
            }

            match deadline {
                None => notified.await,
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(DriverError::NotReady);
                    }
                    if timeout(deadline - now, notified).await.is_err() {
                        return Err(DriverError::NotReady);
                    }
                }
            }
        }
    }

    /// Request a stop of one thread or all threads.
    ///
    /// The transition itself is observed through subsequent stop events;
    /// the thread table is only updated when those events arrive.
    pub(crate) async fn interrupt(&self, thread: u64) -> Result<()> {
        self.check_control_target(thread)?;

        match self.inner.link.request(DeviceRequest::Interrupt { thread }).await? {
            DeviceReply::Stopped { threads } => {
                log::debug!("interrupt acknowledged for {} thread(s)", threads.len());
                Ok(())
            }
            reply => Err(protocol_violation(&reply)),
        }
    }

    /// Request that one thread or all threads resume.
    pub(crate) async fn resume(&self, thread: u64) -> Result<()> {
        self.check_control_target(thread)?;

        match self.inner.link.request(DeviceRequest::Resume { thread }).await? {
            DeviceReply::Resumed { threads } => {
                let mut table = self.inner.threads.lock().unwrap();
                for t in &threads {
                    if *t < self.inner.num_threads {
                        table[*t as usize] = RunState::Running;
                    }
                }
                log::debug!("resumed {} thread(s)", threads.len());
                Ok(())
            }
            reply => Err(protocol_violation(&reply)),
        }
    }

    pub(crate) async fn read_memory(
        &self,
        thread: u64,
        space: MemorySpace,
        address: u64,
        buf: &mut [u8],
    ) -> Result<()> {
        if buf.is_empty() {
            return Err(DriverError::InvalidNullPointer);
        }
        self.check_memory_target(thread)?;

        let request = DeviceRequest::ReadMemory {
            thread,
            space,
            address,
            len: buf.len(),
        };
        match self.inner.link.request(request).await? {
            DeviceReply::Memory(data) if data.len() == buf.len() => {
                buf.copy_from_slice(&data);
                Ok(())
            }
            reply => Err(protocol_violation(&reply)),
        }
    }

    pub(crate) async fn write_memory(
        &self,
        thread: u64,
        space: MemorySpace,
        address: u64,
        data: &[u8],
    ) -> Result<()> {
        if data.is_empty() {
            return Err(DriverError::InvalidNullPointer);
        }
        self.check_memory_target(thread)?;

        let request = DeviceRequest::WriteMemory {
            thread,
            space,
            address,
            data: data.to_vec(),
        };
        match self.inner.link.request(request).await? {
            DeviceReply::Done => Ok(()),
            reply => Err(protocol_violation(&reply)),
        }
    }

    pub(crate) async fn read_state(&self, thread: u64, offset: u64, buf: &mut [u8]) -> Result<()> {
        if buf.is_empty() {
            return Err(DriverError::InvalidNullPointer);
        }
        self.check_stopped(thread)?;

        let request = DeviceRequest::ReadState {
            thread,
            offset,
            len: buf.len(),
        };
        match self.inner.link.request(request).await? {
            DeviceReply::State(data) if data.len() == buf.len() => {
                buf.copy_from_slice(&data);
                Ok(())
            }
            reply => Err(protocol_violation(&reply)),
        }
    }

    pub(crate) async fn write_state(&self, thread: u64, offset: u64, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Err(DriverError::InvalidNullPointer);
        }
        self.check_stopped(thread)?;

        let request = DeviceRequest::WriteState {
            thread,
            offset,
            data: data.to_vec(),
        };
        match self.inner.link.request(request).await? {
            DeviceReply::Done => Ok(()),
            reply => Err(protocol_violation(&reply)),
        }
    }

    /// Release the device side of the session.
    pub(crate) async fn detach_device(&self) -> Result<()> {
        match self.inner.link.request(DeviceRequest::DetachDebug).await? {
            DeviceReply::Done => Ok(()),
            reply => Err(protocol_violation(&reply)),
        }
    }

    /// A run-state change targets one existing thread or `THREAD_ALL`.
    fn check_control_target(&self, thread: u64) -> Result<()> {
        if thread == THREAD_ALL {
            return Ok(());
        }
        if thread >= self.inner.num_threads {
            return Err(DriverError::InvalidArgument);
        }
        Ok(())
    }

    /// Memory access targets the device-global space (`THREAD_NONE`) or a
    /// specific stopped thread.
    fn check_memory_target(&self, thread: u64) -> Result<()> {
        if thread == THREAD_NONE {
            return Ok(());
        }
        self.check_stopped(thread)
    }

    /// Register state is always thread-scoped and requires the thread to
    /// be stopped.
    fn check_stopped(&self, thread: u64) -> Result<()> {
        if thread >= self.inner.num_threads {
            return Err(DriverError::InvalidArgument);
        }
        if self.inner.threads.lock().unwrap()[thread as usize] == RunState::Running {
            return Err(DriverError::InvalidArgument);
        }
        Ok(())
    }
}

/// The device answered with a payload the protocol does not allow here;
/// treat the link as unusable.
fn protocol_violation(reply: &DeviceReply) -> DriverError {
    log::error!("protocol violation in device reply: {:?}", reply);
    DriverError::DeviceLost
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::device_channel;
    use crate::types::DetachReason;

    fn test_session(num_threads: u64) -> (DebugSession, mpsc::UnboundedSender<DebugEvent>) {
        let (link, _endpoint) = device_channel();
        let (tx, rx) = mpsc::unbounded_channel();
        let session = DebugSession::new(DeviceHandle::new(0, 1), 42, num_threads, link, rx);
        (session, tx)
    }

    #[test]
    fn test_queue_drops_oldest_when_full() {
        let queue = EventQueue::new();
        queue.push(DebugEvent::detached(DetachReason::HostExit));
        for thread in 0..EVENT_QUEUE_CAP as u64 {
            queue.push(DebugEvent::exception(thread));
        }

        let events = queue.events.lock().unwrap();
        assert_eq!(events.len(), EVENT_QUEUE_CAP);
        // The detach event was the oldest and went overboard.
        assert_eq!(events.front().unwrap().kind, EventKind::Exception);
        assert_eq!(events.front().unwrap().thread, 0);
    }

    #[tokio::test]
    async fn test_read_event_zero_timeout_never_blocks() {
        let (session, _tx) = test_session(2);
        let mut buf = [0u8; codec::MAX_EVENT_LEN];

        let result = session.read_event(0, &mut buf).await;
        assert_eq!(result.unwrap_err(), DriverError::NotReady);
    }

    #[tokio::test]
    async fn test_read_event_delivers_in_fifo_order() {
        let (session, tx) = test_session(4);
        tx.send(DebugEvent::process_entry()).unwrap();
        tx.send(DebugEvent::exception(3)).unwrap();

        let mut buf = [0u8; codec::MAX_EVENT_LEN];

        let written = session.read_event(TIMEOUT_INFINITE, &mut buf).await.unwrap();
        let first = codec::decode_event(&buf[..written]).unwrap();
        assert_eq!(first.kind, EventKind::ProcessEntry);

        let written = session.read_event(TIMEOUT_INFINITE, &mut buf).await.unwrap();
        let second = codec::decode_event(&buf[..written]).unwrap();
        assert_eq!(second.kind, EventKind::Exception);
        assert_eq!(second.thread, 3);
    }

    #[tokio::test]
    async fn test_small_buffer_does_not_dequeue() {
        let (session, tx) = test_session(2);
        tx.send(DebugEvent::module_load(crate::types::ModuleRange {
            begin: 0,
            end: 0x100,
            load: 0x200,
        }))
        .unwrap();

        // Wait until the pump delivered the event, then retry undersized.
        let mut probe = [0u8; codec::MAX_EVENT_LEN];
        let mut small = [0u8; codec::EVENT_FIXED_LEN];
        loop {
            match session.read_event(0, &mut small).await {
                Err(DriverError::OutOfHostMemory) => break,
                Err(DriverError::NotReady) => tokio::task::yield_now().await,
                other => panic!("unexpected result: {:?}", other),
            }
        }

        // The event is still there for a properly sized retry.
        let written = session.read_event(0, &mut probe).await.unwrap();
        let event = codec::decode_event(&probe[..written]).unwrap();
        assert_eq!(event.kind, EventKind::ModuleLoad);
    }

    #[tokio::test]
    async fn test_stop_event_marks_thread_stopped() {
        let (session, tx) = test_session(2);
        assert_eq!(
            session.check_stopped(1).unwrap_err(),
            DriverError::InvalidArgument
        );

        tx.send(DebugEvent::exception(1)).unwrap();
        let mut buf = [0u8; codec::MAX_EVENT_LEN];
        session.read_event(TIMEOUT_INFINITE, &mut buf).await.unwrap();

        assert!(session.check_stopped(1).is_ok());
        // The other thread is still running.
        assert_eq!(
            session.check_stopped(0).unwrap_err(),
            DriverError::InvalidArgument
        );
    }

    #[tokio::test]
    async fn test_empty_buffer_is_null_pointer() {
        let (session, _tx) = test_session(1);
        let mut empty = [0u8; 0];
        assert_eq!(
            session.read_event(0, &mut empty).await.unwrap_err(),
            DriverError::InvalidNullPointer
        );
        assert_eq!(
            session
                .read_memory(THREAD_NONE, MemorySpace::Default, 0, &mut empty)
                .await
                .unwrap_err(),
            DriverError::InvalidNullPointer
        );
    }
}
