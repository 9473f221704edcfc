/// Simulated device
///
/// This module provides an in-process device for the demo binary and the
/// test suite: a spawned task that answers link commands against a model of
/// device threads, mapped memory, per-thread shared local memory and
/// register state areas, and that produces debug event notices.

use tokio::sync::mpsc;

use crate::codec::StateAreaBuilder;
use crate::link::{
    device_channel, CommandEnvelope, DeviceEndpoint, DeviceLink, DeviceProperties, DeviceReply,
    DeviceRequest, ReplyEnvelope,
};
use crate::types::{
    DebugEvent, DetachReason, DriverError, MemorySpace, ModuleRange, RegisterFile, THREAD_ALL,
    THREAD_NONE,
};

/// Configures and spawns a simulated device.
pub struct SimDeviceBuilder {
    name: String,
    num_threads: u64,
    debug_attach: bool,
    deny_permission: bool,
    slm_size: usize,
    regions: Vec<(u64, usize)>,
}

impl SimDeviceBuilder {
    pub fn new() -> Self {
        SimDeviceBuilder {
            name: "simgpu".into(),
            num_threads: 8,
            debug_attach: true,
            deny_permission: false,
            slm_size: 0x1000,
            regions: Vec::new(),
        }
    }

    pub fn name(mut self, name: &str) -> Self {
        self.name = name.into();
        self
    }

    pub fn threads(mut self, count: u64) -> Self {
        self.num_threads = count;
        self
    }

    /// The device reports that debug attach is not supported.
    pub fn debug_unsupported(mut self) -> Self {
        self.debug_attach = false;
        self
    }

    /// The device refuses attach for lack of privilege.
    pub fn deny_permission(mut self) -> Self {
        self.deny_permission = true;
        self
    }

    /// Map a zero-filled region of device virtual memory.
    pub fn map_region(mut self, address: u64, len: usize) -> Self {
        self.regions.push((address, len));
        self
    }

    pub fn slm_size(mut self, len: usize) -> Self {
        self.slm_size = len;
        self
    }

    /// Spawn the device task. Must be called inside a tokio runtime.
    pub fn spawn(self) -> (DeviceLink, SimController) {
        let (link, endpoint) = device_channel();
        let (ctl_tx, ctl_rx) = mpsc::unbounded_channel();

        let threads = self.num_threads as usize;
        let state = SimState {
            name: self.name,
            num_threads: self.num_threads,
            debug_attach: self.debug_attach,
            deny_permission: self.deny_permission,
            stopped: vec![false; threads],
            regions: self
                .regions
                .into_iter()
                .map(|(base, len)| Region {
                    base,
                    bytes: vec![0; len],
                })
                .collect(),
            slm: vec![vec![0; self.slm_size]; threads],
            state_areas: (0..threads).map(|_| default_state_area()).collect(),
            notices: None,
        };

        tokio::spawn(run_device(state, endpoint, ctl_rx));

        (link, SimController { ctl_tx })
    }
}

impl Default for SimDeviceBuilder {
    fn default() -> Self {
        SimDeviceBuilder::new()
    }
}

/// Out-of-band control over a spawned simulated device.
#[derive(Clone)]
pub struct SimController {
    ctl_tx: mpsc::UnboundedSender<SimControl>,
}

impl SimController {
    pub fn emit_process_entry(&self) {
        let _ = self.ctl_tx.send(SimControl::Emit(DebugEvent::process_entry()));
    }

    pub fn emit_process_exit(&self) {
        let _ = self.ctl_tx.send(SimControl::Emit(DebugEvent::process_exit()));
    }

    pub fn emit_module_load(&self, range: ModuleRange) {
        let _ = self.ctl_tx.send(SimControl::Emit(DebugEvent::module_load(range)));
    }

    pub fn emit_module_unload(&self, range: ModuleRange) {
        let _ = self
            .ctl_tx
            .send(SimControl::Emit(DebugEvent::module_unload(range)));
    }

    /// Report that the host process exited; the device queues a detach
    /// event and closes its notice stream.
    pub fn signal_host_exit(&self) {
        let _ = self.ctl_tx.send(SimControl::HostExit);
    }

    /// Kill the device task; subsequent commands observe `DeviceLost`.
    pub fn hang(&self) {
        let _ = self.ctl_tx.send(SimControl::Hang);
    }
}

enum SimControl {
    Emit(DebugEvent),
    HostExit,
    Hang,
}

struct Region {
    base: u64,
    bytes: Vec<u8>,
}

struct SimState {
    name: String,
    num_threads: u64,
    debug_attach: bool,
    deny_permission: bool,
    stopped: Vec<bool>,
    regions: Vec<Region>,
    slm: Vec<Vec<u8>>,
    state_areas: Vec<Vec<u8>>,
    notices: Option<mpsc::UnboundedSender<DebugEvent>>,
}

/// Register state area layout shared by every simulated thread.
fn default_state_area() -> Vec<u8> {
    StateAreaBuilder::new()
        .section(RegisterFile::General, 1, vec![0; 4096])
        .section(RegisterFile::Accumulator, 1, vec![0; 256])
        .section(RegisterFile::Address, 1, vec![0; 64])
        .section(RegisterFile::Flags, 1, vec![0; 16])
        .build()
}

async fn run_device(
    mut state: SimState,
    mut endpoint: DeviceEndpoint,
    mut ctl_rx: mpsc::UnboundedReceiver<SimControl>,
) {
    log::debug!("simulated device '{}' running", state.name);
    let mut ctl_open = true;

    loop {
        tokio::select! {
            maybe_cmd = endpoint.commands.recv() => match maybe_cmd {
                Some(CommandEnvelope { token, request }) => {
                    let reply = state.handle_request(request);
                    if endpoint.replies.send(ReplyEnvelope { token, reply }).is_err() {
                        break;
                    }
                }
                None => break,
            },
            maybe_ctl = ctl_rx.recv(), if ctl_open => match maybe_ctl {
                Some(SimControl::Emit(event)) => state.notify(event),
                Some(SimControl::HostExit) => {
                    state.notify(DebugEvent::detached(DetachReason::HostExit));
                    state.notices = None;
                }
                Some(SimControl::Hang) => break,
                None => ctl_open = false,
            },
        }
    }

    log::debug!("simulated device '{}' gone", state.name);
}

impl SimState {
    fn notify(&self, event: DebugEvent) {
        match &self.notices {
            Some(sender) => {
                let _ = sender.send(event);
            }
            None => log::debug!("event {:?} with no debugger attached, dropped", event.kind),
        }
    }

    fn handle_request(&mut self, request: DeviceRequest) -> DeviceReply {
        match request {
            DeviceRequest::Properties => DeviceReply::Properties(DeviceProperties {
                name: self.name.clone(),
                num_threads: self.num_threads,
                debug_attach: self.debug_attach,
            }),
            DeviceRequest::AttachDebug { pid } => self.attach_debug(pid),
            DeviceRequest::DetachDebug => {
                self.notices = None;
                DeviceReply::Done
            }
            DeviceRequest::Interrupt { thread } => self.interrupt(thread),
            DeviceRequest::Resume { thread } => self.resume(thread),
            DeviceRequest::ReadMemory {
                thread,
                space,
                address,
                len,
            } => self.read_memory(thread, space, address, len),
            DeviceRequest::WriteMemory {
                thread,
                space,
                address,
                data,
            } => self.write_memory(thread, space, address, &data),
            DeviceRequest::ReadState {
                thread,
                offset,
                len,
            } => self.read_state(thread, offset, len),
            DeviceRequest::WriteState {
                thread,
                offset,
                data,
            } => self.write_state(thread, offset, &data),
        }
    }

    fn attach_debug(&mut self, pid: u32) -> DeviceReply {
        if !self.debug_attach {
            return DeviceReply::Fault(DriverError::UnsupportedFeature);
        }
        if self.deny_permission {
            return DeviceReply::Fault(DriverError::InsufficientPermissions);
        }

        log::debug!("debugger for pid {} attached to '{}'", pid, self.name);
        let (tx, rx) = mpsc::unbounded_channel();
        self.notices = Some(tx);
        DeviceReply::Attached { notices: rx }
    }

    /// Threads targeted by a run-state change, or the fault for a bad id.
    fn targets(&self, thread: u64, want_stopped: bool) -> Result<Vec<u64>, DriverError> {
        let selected: Vec<u64> = if thread == THREAD_ALL {
            (0..self.num_threads)
                .filter(|t| self.stopped[*t as usize] != want_stopped)
                .collect()
        } else if thread < self.num_threads {
            if self.stopped[thread as usize] == want_stopped {
                // Already in the requested state.
                return Err(DriverError::InvalidArgument);
            }
            vec![thread]
        } else {
            return Err(DriverError::InvalidArgument);
        };

        if selected.is_empty() {
            return Err(DriverError::InvalidArgument);
        }
        Ok(selected)
    }

    fn interrupt(&mut self, thread: u64) -> DeviceReply {
        let threads = match self.targets(thread, true) {
            Ok(threads) => threads,
            Err(error) => return DeviceReply::Fault(error),
        };

        for t in &threads {
            self.stopped[*t as usize] = true;
            self.notify(DebugEvent::exception(*t));
        }
        log::debug!("stopped {} thread(s)", threads.len());
        DeviceReply::Stopped { threads }
    }

    fn resume(&mut self, thread: u64) -> DeviceReply {
        let threads = match self.targets(thread, false) {
            Ok(threads) => threads,
            Err(error) => return DeviceReply::Fault(error),
        };

        for t in &threads {
            self.stopped[*t as usize] = false;
        }
        log::debug!("resumed {} thread(s)", threads.len());
        DeviceReply::Resumed { threads }
    }

    /// Check a thread-scoped access and return the backing bytes.
    fn memory_target(
        &mut self,
        thread: u64,
        space: MemorySpace,
        address: u64,
        len: usize,
    ) -> Result<&mut [u8], DriverError> {
        if thread != THREAD_NONE {
            if thread >= self.num_threads {
                return Err(DriverError::InvalidArgument);
            }
            if !self.stopped[thread as usize] {
                return Err(DriverError::InvalidArgument);
            }
        }

        match space {
            MemorySpace::SharedLocal => {
                if thread == THREAD_NONE {
                    // SLM is only reachable from a thread context.
                    return Err(DriverError::NotAvailable);
                }
                let slm = &mut self.slm[thread as usize];
                let end = (address as usize)
                    .checked_add(len)
                    .ok_or(DriverError::InvalidArgument)?;
                if address > usize::MAX as u64 || end > slm.len() {
                    return Err(DriverError::InvalidArgument);
                }
                Ok(&mut slm[address as usize..end])
            }
            MemorySpace::Default => {
                let end = address
                    .checked_add(len as u64)
                    .ok_or(DriverError::InvalidArgument)?;
                for region in &mut self.regions {
                    if address >= region.base && end <= region.base + region.bytes.len() as u64 {
                        let at = (address - region.base) as usize;
                        return Ok(&mut region.bytes[at..at + len]);
                    }
                }
                Err(DriverError::InvalidArgument)
            }
        }
    }

    fn read_memory(
        &mut self,
        thread: u64,
        space: MemorySpace,
        address: u64,
        len: usize,
    ) -> DeviceReply {
        match self.memory_target(thread, space, address, len) {
            Ok(bytes) => DeviceReply::Memory(bytes.to_vec()),
            Err(error) => DeviceReply::Fault(error),
        }
    }

    fn write_memory(
        &mut self,
        thread: u64,
        space: MemorySpace,
        address: u64,
        data: &[u8],
    ) -> DeviceReply {
        match self.memory_target(thread, space, address, data.len()) {
            Ok(bytes) => {
                bytes.copy_from_slice(data);
                DeviceReply::Done
            }
            Err(error) => DeviceReply::Fault(error),
        }
    }

    /// Check a state-area access and return the backing bytes.
    fn state_target(
        &mut self,
        thread: u64,
        offset: u64,
        len: usize,
    ) -> Result<&mut [u8], DriverError> {
        if thread >= self.num_threads {
            return Err(DriverError::InvalidArgument);
        }
        if !self.stopped[thread as usize] {
            return Err(DriverError::InvalidArgument);
        }

        let area = &mut self.state_areas[thread as usize];
        let end = (offset as usize)
            .checked_add(len)
            .ok_or(DriverError::InvalidArgument)?;
        if offset > usize::MAX as u64 || end > area.len() {
            return Err(DriverError::InvalidArgument);
        }
        Ok(&mut area[offset as usize..end])
    }

    fn read_state(&mut self, thread: u64, offset: u64, len: usize) -> DeviceReply {
        match self.state_target(thread, offset, len) {
            Ok(bytes) => DeviceReply::State(bytes.to_vec()),
            Err(error) => DeviceReply::Fault(error),
        }
    }

    fn write_state(&mut self, thread: u64, offset: u64, data: &[u8]) -> DeviceReply {
        match self.state_target(thread, offset, data.len()) {
            Ok(bytes) => {
                bytes.copy_from_slice(data);
                DeviceReply::Done
            }
            Err(error) => DeviceReply::Fault(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_properties_report_configuration() {
        let (link, _sim) = SimDeviceBuilder::new().name("t0").threads(16).spawn();

        match link.request(DeviceRequest::Properties).await.unwrap() {
            DeviceReply::Properties(props) => {
                assert_eq!(props.name, "t0");
                assert_eq!(props.num_threads, 16);
                assert!(props.debug_attach);
            }
            reply => panic!("unexpected reply: {:?}", reply),
        }
    }

    #[tokio::test]
    async fn test_interrupt_emits_stop_events() {
        let (link, _sim) = SimDeviceBuilder::new().threads(2).spawn();

        let mut notices = match link
            .request(DeviceRequest::AttachDebug { pid: 1 })
            .await
            .unwrap()
        {
            DeviceReply::Attached { notices } => notices,
            reply => panic!("unexpected reply: {:?}", reply),
        };

        match link
            .request(DeviceRequest::Interrupt { thread: THREAD_ALL })
            .await
            .unwrap()
        {
            DeviceReply::Stopped { threads } => assert_eq!(threads, vec![0, 1]),
            reply => panic!("unexpected reply: {:?}", reply),
        }

        for _ in 0..2 {
            let event = notices.recv().await.unwrap();
            assert!(event.stopped());
        }
    }

    #[tokio::test]
    async fn test_interrupt_when_all_stopped_is_invalid() {
        let (link, _sim) = SimDeviceBuilder::new().threads(1).spawn();

        link.request(DeviceRequest::Interrupt { thread: 0 })
            .await
            .unwrap();
        let again = link.request(DeviceRequest::Interrupt { thread: 0 }).await;
        assert_eq!(again.unwrap_err(), DriverError::InvalidArgument);

        let all = link
            .request(DeviceRequest::Interrupt { thread: THREAD_ALL })
            .await;
        assert_eq!(all.unwrap_err(), DriverError::InvalidArgument);
    }

    #[tokio::test]
    async fn test_memory_requires_mapped_address() {
        let (link, _sim) = SimDeviceBuilder::new().map_region(0x1000, 0x100).spawn();

        let inside = link
            .request(DeviceRequest::ReadMemory {
                thread: THREAD_NONE,
                space: MemorySpace::Default,
                address: 0x1080,
                len: 0x10,
            })
            .await;
        assert!(inside.is_ok());

        let outside = link
            .request(DeviceRequest::ReadMemory {
                thread: THREAD_NONE,
                space: MemorySpace::Default,
                address: 0x2000,
                len: 0x10,
            })
            .await;
        assert_eq!(outside.unwrap_err(), DriverError::InvalidArgument);

        // Straddling the end of the region is rejected as well.
        let straddle = link
            .request(DeviceRequest::ReadMemory {
                thread: THREAD_NONE,
                space: MemorySpace::Default,
                address: 0x10f8,
                len: 0x10,
            })
            .await;
        assert_eq!(straddle.unwrap_err(), DriverError::InvalidArgument);
    }

    #[tokio::test]
    async fn test_slm_needs_thread_context() {
        let (link, _sim) = SimDeviceBuilder::new().spawn();

        let result = link
            .request(DeviceRequest::ReadMemory {
                thread: THREAD_NONE,
                space: MemorySpace::SharedLocal,
                address: 0,
                len: 16,
            })
            .await;
        assert_eq!(result.unwrap_err(), DriverError::NotAvailable);
    }

    #[tokio::test]
    async fn test_hang_loses_the_device() {
        let (link, sim) = SimDeviceBuilder::new().spawn();
        sim.hang();

        // The task exits asynchronously; poll until the link notices.
        for _ in 0..100 {
            if link.request(DeviceRequest::Properties).await.is_err() {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("device never went away");
    }
}
