/// GPU tools debug driver
///
/// This crate implements the program-debug surface of a GPU tools driver:
/// attach/detach session management, the per-session debug event stream,
/// thread interrupt/resume, and stopped-thread memory and register state
/// access. Devices are reached through a command link; a simulated device
/// is provided for tests and demos.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

pub mod codec;
pub mod link;
pub mod sim;
pub mod types;

mod session;

pub use link::{device_channel, DeviceLink, DeviceProperties};
pub use sim::{SimController, SimDeviceBuilder};
pub use types::*;

use link::{DeviceReply, DeviceRequest};
use session::DebugSession;

/// The tools driver: device registry, session registry, and the dispatch
/// point for every session-scoped operation.
///
/// Cross-handle calls are safe from simultaneous threads and tasks;
/// operations on the same session handle require external serialization by
/// the caller.
pub struct Driver {
    initialized: AtomicBool,
    devices: Mutex<SlotMap<DeviceEntry>>,
    sessions: Mutex<SlotMap<DebugSession>>,
}

struct DeviceEntry {
    link: DeviceLink,
    debug: DebugSlot,
}

/// Attach arbitration for one device: at most one live session.
enum DebugSlot {
    Free,
    /// An attach is in flight; blocks competing attaches until it settles.
    Pending,
    Active(SessionHandle),
}

impl Driver {
    pub fn new() -> Self {
        Driver {
            initialized: AtomicBool::new(false),
            devices: Mutex::new(SlotMap::new()),
            sessions: Mutex::new(SlotMap::new()),
        }
    }

    /// Initialize the driver. Every tools entry point fails with
    /// `Uninitialized` until this has been called.
    pub fn init(&self) {
        self.initialized.store(true, Ordering::SeqCst);
        log::info!("tools driver initialized");
    }

    fn ensure_init(&self) -> Result<()> {
        if self.initialized.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(DriverError::Uninitialized)
        }
    }

    /// Register a device reachable over `link` and hand out its handle.
    pub fn register_device(&self, link: DeviceLink) -> Result<DeviceHandle> {
        self.ensure_init()?;
        let (index, generation) = self.devices.lock().unwrap().insert(DeviceEntry {
            link,
            debug: DebugSlot::Free,
        });
        let handle = DeviceHandle::new(index, generation);
        log::debug!("registered device {:#x}", handle.as_raw());
        Ok(handle)
    }

    /// Remove a device from the registry.
    ///
    /// Fails with `HandleObjectInUse` while a debug session is attached.
    pub fn unregister_device(&self, device: DeviceHandle) -> Result<()> {
        self.ensure_init()?;
        let (index, generation) = device.parts().ok_or(DriverError::InvalidNullHandle)?;

        let mut devices = self.devices.lock().unwrap();
        let entry = devices
            .get(index, generation)
            .ok_or(DriverError::InvalidArgument)?;
        if !matches!(entry.debug, DebugSlot::Free) {
            return Err(DriverError::HandleObjectInUse);
        }
        devices.remove(index, generation);
        Ok(())
    }

    /// Attach a debugger to a device.
    ///
    /// At most one session may exist per device; a concurrent second attach
    /// fails with `NotAvailable` until the first session detaches.
    pub async fn attach(
        &self,
        device: DeviceHandle,
        config: &DebugConfig,
    ) -> Result<SessionHandle> {
        self.ensure_init()?;
        let (index, generation) = device.parts().ok_or(DriverError::InvalidNullHandle)?;

        // Reserve the device under the registry lock so two racing
        // attaches cannot both proceed.
        let link = {
            let mut devices = self.devices.lock().unwrap();
            let entry = devices
                .get_mut(index, generation)
                .ok_or(DriverError::InvalidArgument)?;
            if !matches!(entry.debug, DebugSlot::Free) {
                return Err(DriverError::NotAvailable);
            }
            entry.debug = DebugSlot::Pending;
            entry.link.clone()
        };

        match self.attach_device(&link, config).await {
            Ok((properties, notices)) => {
                let session = DebugSession::new(
                    device,
                    config.pid(),
                    properties.num_threads,
                    link,
                    notices,
                );
                let handle = {
                    let mut sessions = self.sessions.lock().unwrap();
                    let (index, generation) = sessions.insert(session);
                    SessionHandle::new(index, generation)
                };
                self.set_debug_slot(device, DebugSlot::Active(handle));
                log::info!(
                    "attached to '{}' for pid {} ({} threads)",
                    properties.name,
                    config.pid(),
                    properties.num_threads
                );
                Ok(handle)
            }
            Err(error) => {
                self.set_debug_slot(device, DebugSlot::Free);
                Err(error)
            }
        }
    }

    /// Version dispatch plus the device round trips behind `attach`.
    async fn attach_device(
        &self,
        link: &DeviceLink,
        config: &DebugConfig,
    ) -> Result<(DeviceProperties, tokio::sync::mpsc::UnboundedReceiver<DebugEvent>)> {
        let pid = match config {
            DebugConfig::V1(v1) => v1.pid,
        };

        let properties = match link.request(DeviceRequest::Properties).await? {
            DeviceReply::Properties(properties) => properties,
            _ => return Err(DriverError::DeviceLost),
        };
        if !properties.debug_attach {
            return Err(DriverError::UnsupportedFeature);
        }

        match link.request(DeviceRequest::AttachDebug { pid }).await? {
            DeviceReply::Attached { notices } => Ok((properties, notices)),
            _ => Err(DriverError::DeviceLost),
        }
    }

    fn set_debug_slot(&self, device: DeviceHandle, slot: DebugSlot) {
        if let Some((index, generation)) = device.parts() {
            if let Some(entry) = self.devices.lock().unwrap().get_mut(index, generation) {
                entry.debug = slot;
            }
        }
    }

    /// Close a debug session and release its queued events. Subsequent
    /// operations on the handle fail with `InvalidArgument`.
    pub async fn detach(&self, session: SessionHandle) -> Result<()> {
        self.ensure_init()?;
        let (index, generation) = session.parts().ok_or(DriverError::InvalidNullHandle)?;

        let removed = self
            .sessions
            .lock()
            .unwrap()
            .remove(index, generation)
            .ok_or(DriverError::InvalidArgument)?;

        self.set_debug_slot(removed.device(), DebugSlot::Free);

        // A lost device still detaches driver-side.
        if let Err(error) = removed.detach_device().await {
            log::warn!("device-side detach failed: {}", error);
        }
        log::info!("detached session for pid {}", removed.pid());
        Ok(())
    }

    /// The maximal number of device threads for the session's device.
    pub fn num_threads(&self, session: SessionHandle) -> Result<u64> {
        Ok(self.session_ref(session)?.num_threads())
    }

    /// Read the topmost debug event into `buf`, waiting up to `timeout_ms`
    /// milliseconds (or forever for `TIMEOUT_INFINITE`).
    pub async fn read_event(
        &self,
        session: SessionHandle,
        timeout_ms: u64,
        buf: &mut [u8],
    ) -> Result<usize> {
        self.session_ref(session)?.read_event(timeout_ms, buf).await
    }

    /// Interrupt one device thread, or all of them with `THREAD_ALL`.
    pub async fn interrupt(&self, session: SessionHandle, thread: u64) -> Result<()> {
        self.session_ref(session)?.interrupt(thread).await
    }

    /// Resume one device thread, or all of them with `THREAD_ALL`.
    pub async fn resume(&self, session: SessionHandle, thread: u64) -> Result<()> {
        self.session_ref(session)?.resume(thread).await
    }

    /// Read device memory from a thread context (`THREAD_NONE` for the
    /// device-global space).
    pub async fn read_memory(
        &self,
        session: SessionHandle,
        thread: u64,
        space: MemorySpace,
        address: u64,
        buf: &mut [u8],
    ) -> Result<()> {
        self.session_ref(session)?
            .read_memory(thread, space, address, buf)
            .await
    }

    /// Write device memory in a thread context.
    pub async fn write_memory(
        &self,
        session: SessionHandle,
        thread: u64,
        space: MemorySpace,
        address: u64,
        data: &[u8],
    ) -> Result<()> {
        self.session_ref(session)?
            .write_memory(thread, space, address, data)
            .await
    }

    /// Read a stopped thread's register state area at `offset`.
    pub async fn read_state(
        &self,
        session: SessionHandle,
        thread: u64,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<()> {
        self.session_ref(session)?.read_state(thread, offset, buf).await
    }

    /// Write a stopped thread's register state area at `offset`.
    pub async fn write_state(
        &self,
        session: SessionHandle,
        thread: u64,
        offset: u64,
        data: &[u8],
    ) -> Result<()> {
        self.session_ref(session)?.write_state(thread, offset, data).await
    }

    fn session_ref(&self, session: SessionHandle) -> Result<DebugSession> {
        self.ensure_init()?;
        let (index, generation) = session.parts().ok_or(DriverError::InvalidNullHandle)?;
        self.sessions
            .lock()
            .unwrap()
            .get(index, generation)
            .cloned()
            .ok_or(DriverError::InvalidArgument)
    }
}

impl Default for Driver {
    fn default() -> Self {
        Driver::new()
    }
}

/// Generation-checked slot arena backing the opaque handle types. Stale
/// handles stop resolving once their slot is reused.
struct SlotMap<T> {
    slots: Vec<Slot<T>>,
}

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

impl<T> SlotMap<T> {
    fn new() -> Self {
        SlotMap { slots: Vec::new() }
    }

    fn insert(&mut self, value: T) -> (u32, u32) {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.value.is_none() {
                slot.value = Some(value);
                return (index as u32, slot.generation);
            }
        }
        self.slots.push(Slot {
            generation: 1,
            value: Some(value),
        });
        ((self.slots.len() - 1) as u32, 1)
    }

    fn get(&self, index: u32, generation: u32) -> Option<&T> {
        let slot = self.slots.get(index as usize)?;
        if slot.generation != generation {
            return None;
        }
        slot.value.as_ref()
    }

    fn get_mut(&mut self, index: u32, generation: u32) -> Option<&mut T> {
        let slot = self.slots.get_mut(index as usize)?;
        if slot.generation != generation {
            return None;
        }
        slot.value.as_mut()
    }

    fn remove(&mut self, index: u32, generation: u32) -> Option<T> {
        let slot = self.slots.get_mut(index as usize)?;
        if slot.generation != generation || slot.value.is_none() {
            return None;
        }
        slot.generation += 1;
        slot.value.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_calls_require_init() {
        let driver = Driver::new();
        assert_eq!(
            driver.num_threads(SessionHandle::NULL),
            Err(DriverError::Uninitialized)
        );

        driver.init();
        assert_eq!(
            driver.num_threads(SessionHandle::NULL),
            Err(DriverError::InvalidNullHandle)
        );
    }

    #[tokio::test]
    async fn test_null_device_handle() {
        let driver = Driver::new();
        driver.init();

        let result = driver.attach(DeviceHandle::NULL, &DebugConfig::v1(1)).await;
        assert_eq!(result.unwrap_err(), DriverError::InvalidNullHandle);
    }

    #[tokio::test]
    async fn test_attach_detach_cycle() {
        let driver = Driver::new();
        driver.init();

        let (link, _sim) = SimDeviceBuilder::new().threads(4).spawn();
        let device = driver.register_device(link).unwrap();

        let session = driver.attach(device, &DebugConfig::v1(100)).await.unwrap();
        assert_eq!(driver.num_threads(session).unwrap(), 4);

        driver.detach(session).await.unwrap();

        // The handle is dead now.
        assert_eq!(
            driver.num_threads(session),
            Err(DriverError::InvalidArgument)
        );

        // And the device is free for the next debugger.
        let session = driver.attach(device, &DebugConfig::v1(101)).await.unwrap();
        driver.detach(session).await.unwrap();
    }

    #[tokio::test]
    async fn test_unregister_busy_device() {
        let driver = Driver::new();
        driver.init();

        let (link, _sim) = SimDeviceBuilder::new().spawn();
        let device = driver.register_device(link).unwrap();
        let session = driver.attach(device, &DebugConfig::v1(7)).await.unwrap();

        assert_eq!(
            driver.unregister_device(device),
            Err(DriverError::HandleObjectInUse)
        );

        driver.detach(session).await.unwrap();
        driver.unregister_device(device).unwrap();
        assert_eq!(
            driver.unregister_device(device),
            Err(DriverError::InvalidArgument)
        );
    }

    #[test]
    fn test_slotmap_generations() {
        let mut map = SlotMap::new();
        let (index, generation) = map.insert("first");
        assert_eq!(map.get(index, generation), Some(&"first"));

        map.remove(index, generation).unwrap();
        assert_eq!(map.get(index, generation), None);

        // The slot is reused with a bumped generation.
        let (index2, generation2) = map.insert("second");
        assert_eq!(index2, index);
        assert_ne!(generation2, generation);
        assert_eq!(map.get(index, generation), None);
        assert_eq!(map.get(index2, generation2), Some(&"second"));
    }
}
