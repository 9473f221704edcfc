/// Core types for the tools driver surface
///
/// This module defines the result-code taxonomy shared by every tools
/// entry point, the opaque handle types, and the data structures that
/// describe debug events and register state.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Uniform result codes returned by every tools operation.
///
/// Callers match on the exact kind; no operation returns anything outside
/// this set.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverError {
    #[error("driver is not initialized")]
    Uninitialized,
    #[error("device hung, was reset or removed")]
    DeviceLost,
    #[error("handle argument is null")]
    InvalidNullHandle,
    #[error("required buffer argument is missing or empty")]
    InvalidNullPointer,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("feature is not supported by the device")]
    UnsupportedFeature,
    #[error("caller does not have sufficient permissions")]
    InsufficientPermissions,
    #[error("resource is already in use")]
    NotAvailable,
    #[error("object referenced by the handle is still in use")]
    HandleObjectInUse,
    #[error("timeout expired before the operation was ready")]
    NotReady,
    #[error("host buffer is too small to hold the result")]
    OutOfHostMemory,
}

pub type Result<T> = std::result::Result<T, DriverError>;

/// Thread id sentinel: no thread on the device.
pub const THREAD_NONE: u64 = 0xffff_ffff_ffff_ffff;

/// Thread id sentinel: all threads on the device.
pub const THREAD_ALL: u64 = 0xffff_ffff_ffff_fffe;

/// Timeout sentinel: wait forever.
pub const TIMEOUT_INFINITE: u64 = 0xffff_ffff_ffff_ffff;

// Handles pack a 32-bit slot index and a 32-bit generation. Generations
// start at 1, so the raw value 0 is never produced and stands for null.
fn pack_handle(index: u32, generation: u32) -> u64 {
    ((generation as u64) << 32) | index as u64
}

fn unpack_handle(raw: u64) -> Option<(u32, u32)> {
    if raw == 0 {
        return None;
    }
    Some((raw as u32, (raw >> 32) as u32))
}

/// Opaque device handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceHandle(u64);

impl DeviceHandle {
    pub const NULL: DeviceHandle = DeviceHandle(0);

    pub(crate) fn new(index: u32, generation: u32) -> Self {
        DeviceHandle(pack_handle(index, generation))
    }

    pub(crate) fn parts(&self) -> Option<(u32, u32)> {
        unpack_handle(self.0)
    }

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }

    pub fn as_raw(&self) -> u64 {
        self.0
    }
}

/// Opaque debug session handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle(u64);

impl SessionHandle {
    pub const NULL: SessionHandle = SessionHandle(0);

    pub(crate) fn new(index: u32, generation: u32) -> Self {
        SessionHandle(pack_handle(index, generation))
    }

    pub(crate) fn parts(&self) -> Option<(u32, u32)> {
        unpack_handle(self.0)
    }

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }

    pub fn as_raw(&self) -> u64 {
        self.0
    }
}

/// The debug configuration version understood by this driver.
pub const DEBUG_CONFIG_VERSION: u16 = 1;

/// Version 1 debug configuration fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebugConfigV1 {
    /// The host process identifier of the debuggee.
    pub pid: u32,
}

/// Versioned debug configuration.
///
/// The version tag selects the variant record so fields can be added later
/// without breaking old callers. `from_parts` rejects any version this
/// driver does not recognize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DebugConfig {
    V1(DebugConfigV1),
}

impl DebugConfig {
    /// Build a version 1 configuration.
    pub fn v1(pid: u32) -> Self {
        DebugConfig::V1(DebugConfigV1 { pid })
    }

    /// Build a configuration from a raw version tag and its fields.
    pub fn from_parts(version: u16, pid: u32) -> Result<Self> {
        match version {
            1 => Ok(DebugConfig::V1(DebugConfigV1 { pid })),
            _ => Err(DriverError::InvalidArgument),
        }
    }

    pub fn version(&self) -> u16 {
        match self {
            DebugConfig::V1(_) => 1,
        }
    }

    pub fn pid(&self) -> u32 {
        match self {
            DebugConfig::V1(v1) => v1.pid,
        }
    }
}

/// Event flag bit: the reporting thread stopped.
pub const EVENT_FLAG_STOPPED: u64 = 1 << 0;

/// Debug event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EventKind {
    /// The tool was detached.
    Detached = 1,
    /// The debuggee created command queues on the device.
    ProcessEntry = 2,
    /// The debuggee destroyed all command queues on the device.
    ProcessExit = 3,
    /// An in-memory module was loaded onto the device.
    ModuleLoad = 4,
    /// An in-memory module is about to be unloaded from the device.
    ModuleUnload = 5,
    /// A thread stopped due to a device exception.
    Exception = 6,
}

impl EventKind {
    /// Decode the wire byte; 0 is the reserved invalid value.
    pub fn from_wire(raw: u8) -> Result<Self> {
        match raw {
            1 => Ok(EventKind::Detached),
            2 => Ok(EventKind::ProcessEntry),
            3 => Ok(EventKind::ProcessExit),
            4 => Ok(EventKind::ModuleLoad),
            5 => Ok(EventKind::ModuleUnload),
            6 => Ok(EventKind::Exception),
            _ => Err(DriverError::InvalidArgument),
        }
    }
}

/// Why the session was detached without an explicit detach call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DetachReason {
    /// The host process exited.
    HostExit = 1,
}

impl DetachReason {
    pub fn from_wire(raw: u8) -> Result<Self> {
        match raw {
            1 => Ok(DetachReason::HostExit),
            _ => Err(DriverError::InvalidArgument),
        }
    }
}

/// Address range of an in-memory module and its device load address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleRange {
    pub begin: u64,
    pub end: u64,
    pub load: u64,
}

/// Event-type specific payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventInfo {
    None,
    Detached { reason: DetachReason },
    Module(ModuleRange),
}

/// A debug event reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebugEvent {
    pub kind: EventKind,
    /// The thread reporting the event, or `THREAD_NONE`.
    pub thread: u64,
    /// Bit-vector of event flags (`EVENT_FLAG_STOPPED`).
    pub flags: u64,
    pub info: EventInfo,
}

impl DebugEvent {
    /// A stop event for one thread.
    pub fn exception(thread: u64) -> Self {
        DebugEvent {
            kind: EventKind::Exception,
            thread,
            flags: EVENT_FLAG_STOPPED,
            info: EventInfo::None,
        }
    }

    pub fn detached(reason: DetachReason) -> Self {
        DebugEvent {
            kind: EventKind::Detached,
            thread: THREAD_NONE,
            flags: 0,
            info: EventInfo::Detached { reason },
        }
    }

    pub fn module_load(range: ModuleRange) -> Self {
        DebugEvent {
            kind: EventKind::ModuleLoad,
            thread: THREAD_NONE,
            flags: 0,
            info: EventInfo::Module(range),
        }
    }

    pub fn module_unload(range: ModuleRange) -> Self {
        DebugEvent {
            kind: EventKind::ModuleUnload,
            thread: THREAD_NONE,
            flags: 0,
            info: EventInfo::Module(range),
        }
    }

    pub fn process_entry() -> Self {
        DebugEvent {
            kind: EventKind::ProcessEntry,
            thread: THREAD_NONE,
            flags: 0,
            info: EventInfo::None,
        }
    }

    pub fn process_exit() -> Self {
        DebugEvent {
            kind: EventKind::ProcessExit,
            thread: THREAD_NONE,
            flags: 0,
            info: EventInfo::None,
        }
    }

    /// True if the reporting thread stopped.
    pub fn stopped(&self) -> bool {
        self.flags & EVENT_FLAG_STOPPED != 0
    }
}

/// Memory spaces addressable through the debug interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MemorySpace {
    /// The default device virtual address space.
    Default = 0,
    /// Shared local memory, reachable only from a thread context.
    SharedLocal = 1,
}

/// Register file kinds found in a register state area.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum RegisterFile {
    General = 1,
    Accumulator = 2,
    Address = 3,
    Flags = 4,
}

/// Header of a register state area.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateHeader {
    /// Total size of the state area in bytes.
    pub size: u32,
    /// Size of this header in bytes.
    pub header_size: u8,
    /// Size of each section descriptor in bytes.
    pub sec_size: u8,
    /// Number of section descriptors.
    pub num_sec: u16,
}

/// A register file descriptor inside a state area.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateSection {
    /// Register file kind (`RegisterFile` values).
    pub kind: u16,
    /// Register file layout version.
    pub version: u16,
    /// Size of the register file in bytes.
    pub size: u32,
    /// Offset of the register bytes from the start of the state area.
    pub offset: u64,
}
