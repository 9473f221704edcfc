/// Device command link
///
/// This module carries the request/reply traffic between the driver and a
/// device. Every command is stamped with a token; replies are routed back
/// to the waiting caller through a pending-command map by a spawned reply
/// pump. Spontaneous device events travel on a separate notice channel
/// handed out at attach time.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};

use crate::types::{DebugEvent, DriverError, MemorySpace, Result};

/// A command sent to the device.
#[derive(Debug)]
pub enum DeviceRequest {
    Properties,
    AttachDebug {
        pid: u32,
    },
    DetachDebug,
    Interrupt {
        thread: u64,
    },
    Resume {
        thread: u64,
    },
    ReadMemory {
        thread: u64,
        space: MemorySpace,
        address: u64,
        len: usize,
    },
    WriteMemory {
        thread: u64,
        space: MemorySpace,
        address: u64,
        data: Vec<u8>,
    },
    ReadState {
        thread: u64,
        offset: u64,
        len: usize,
    },
    WriteState {
        thread: u64,
        offset: u64,
        data: Vec<u8>,
    },
}

/// Static device properties reported over the link.
#[derive(Debug, Clone)]
pub struct DeviceProperties {
    pub name: String,
    /// The maximal number of device threads.
    pub num_threads: u64,
    /// Whether the device supports debug attach at all.
    pub debug_attach: bool,
}

/// A reply to one command.
#[derive(Debug)]
pub enum DeviceReply {
    Properties(DeviceProperties),
    /// Debug attach succeeded; events arrive on the returned channel until
    /// detach or host exit.
    Attached {
        notices: mpsc::UnboundedReceiver<DebugEvent>,
    },
    /// Threads that transitioned to stopped.
    Stopped { threads: Vec<u64> },
    /// Threads that transitioned back to running.
    Resumed { threads: Vec<u64> },
    Memory(Vec<u8>),
    State(Vec<u8>),
    Done,
    /// The device rejected the command.
    Fault(DriverError),
}

#[derive(Debug)]
pub struct CommandEnvelope {
    pub token: u32,
    pub request: DeviceRequest,
}

#[derive(Debug)]
pub struct ReplyEnvelope {
    pub token: u32,
    pub reply: DeviceReply,
}

/// The device side of a command link.
#[derive(Debug)]
pub struct DeviceEndpoint {
    pub commands: mpsc::UnboundedReceiver<CommandEnvelope>,
    pub replies: mpsc::UnboundedSender<ReplyEnvelope>,
}

/// The driver side of a command link.
///
/// Cheap to clone; clones share the token counter and pending map. A dead
/// device surfaces as `DeviceLost` on every outstanding and future request.
#[derive(Clone)]
pub struct DeviceLink {
    cmd_tx: mpsc::UnboundedSender<CommandEnvelope>,
    token_counter: Arc<AtomicU32>,
    pending: Arc<Mutex<HashMap<u32, oneshot::Sender<DeviceReply>>>>,
    closed: Arc<AtomicBool>,
}

/// Create a connected link pair: the driver half and the device half.
pub fn device_channel() -> (DeviceLink, DeviceEndpoint) {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (reply_tx, reply_rx) = mpsc::unbounded_channel();

    let link = DeviceLink::new(cmd_tx, reply_rx);
    let endpoint = DeviceEndpoint {
        commands: cmd_rx,
        replies: reply_tx,
    };
    (link, endpoint)
}

impl DeviceLink {
    fn new(
        cmd_tx: mpsc::UnboundedSender<CommandEnvelope>,
        reply_rx: mpsc::UnboundedReceiver<ReplyEnvelope>,
    ) -> Self {
        let link = DeviceLink {
            cmd_tx,
            token_counter: Arc::new(AtomicU32::new(1)),
            pending: Arc::new(Mutex::new(HashMap::new())),
            closed: Arc::new(AtomicBool::new(false)),
        };
        link.start_reply_pump(reply_rx);
        link
    }

    /// Send one command and wait for its reply.
    ///
    /// A `Fault` reply is unwrapped into the carried error so callers only
    /// ever see successful payloads.
    pub async fn request(&self, request: DeviceRequest) -> Result<DeviceReply> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DriverError::DeviceLost);
        }

        let token = self.token_counter.fetch_add(1, Ordering::SeqCst);
        log::debug!("SEND[{}]: {:?}", token, request);

        let (sender, receiver) = oneshot::channel();
        self.pending.lock().unwrap().insert(token, sender);

        let envelope = CommandEnvelope { token, request };
        if self.cmd_tx.send(envelope).is_err() {
            self.pending.lock().unwrap().remove(&token);
            return Err(DriverError::DeviceLost);
        }

        let reply = receiver.await.map_err(|_| DriverError::DeviceLost)?;
        log::debug!("RECV[{}]: {:?}", token, reply);

        match reply {
            DeviceReply::Fault(error) => Err(error),
            reply => Ok(reply),
        }
    }

    /// Route replies back to waiting callers until the device goes away.
    fn start_reply_pump(&self, mut reply_rx: mpsc::UnboundedReceiver<ReplyEnvelope>) {
        let pending = self.pending.clone();
        let closed = self.closed.clone();

        tokio::spawn(async move {
            while let Some(envelope) = reply_rx.recv().await {
                match pending.lock().unwrap().remove(&envelope.token) {
                    Some(sender) => {
                        let _ = sender.send(envelope.reply);
                    }
                    None => {
                        log::warn!("RECV[{}]: no pending command for token", envelope.token);
                    }
                }
            }

            // Device is gone: fail everything still waiting.
            closed.store(true, Ordering::SeqCst);
            let drained: Vec<_> = pending.lock().unwrap().drain().collect();
            if !drained.is_empty() {
                log::warn!("device link closed with {} commands in flight", drained.len());
            }
        });
    }
}
