use std::sync::Arc;

use gpudebug::codec;
use gpudebug::{
    DebugConfig, Driver, EventKind, MemorySpace, ModuleRange, SimDeviceBuilder, THREAD_ALL,
    TIMEOUT_INFINITE,
};
use gputools_sysman::{report, SimTelemetry, Sysman};

const SCRATCH_BASE: u64 = 0x1000_0000;

#[tokio::main]
async fn main() {
    // Initialize the logger first
    simple_logger::SimpleLogger::new()
        .with_level(log::LevelFilter::Info)
        .with_module_level("gpudebug", log::LevelFilter::Debug)
        .with_module_level("gputools_sysman", log::LevelFilter::Debug)
        .init()
        .unwrap();

    log::info!("GPU tools demo starting...");

    if let Err(error) = run_demo().await {
        log::error!("demo failed: {}", error);
        std::process::exit(1);
    }
}

async fn run_demo() -> Result<(), Box<dyn std::error::Error>> {
    let driver = Driver::new();
    driver.init();

    let (link, sim) = SimDeviceBuilder::new()
        .name("simgpu0")
        .threads(4)
        .map_region(SCRATCH_BASE, 0x1000)
        .spawn();
    let device = driver.register_device(link)?;

    // Attach and watch the debuggee come up.
    let session = driver.attach(device, &DebugConfig::v1(1234)).await?;
    sim.emit_process_entry();
    sim.emit_module_load(ModuleRange {
        begin: 0x4000,
        end: 0x9000,
        load: 0x8000_0000,
    });

    // Stop the device and drain events until every thread reports in.
    driver.interrupt(session, THREAD_ALL).await?;

    let num_threads = driver.num_threads(session)?;
    let mut stops = 0;
    let mut buf = [0u8; codec::MAX_EVENT_LEN];
    while stops < num_threads {
        let written = driver.read_event(session, TIMEOUT_INFINITE, &mut buf).await?;
        let event = codec::decode_event(&buf[..written])?;
        log::info!("event: {:?} (thread {:#x})", event.kind, event.thread);
        if event.kind == EventKind::Exception && event.stopped() {
            stops += 1;
        }
    }

    // Poke memory and registers while stopped.
    let pattern = *b"gputools";
    driver
        .write_memory(session, 0, MemorySpace::Default, SCRATCH_BASE, &pattern)
        .await?;
    let mut readback = [0u8; 8];
    driver
        .read_memory(session, 0, MemorySpace::Default, SCRATCH_BASE, &mut readback)
        .await?;
    log::info!("memory roundtrip: {}", String::from_utf8_lossy(&readback));

    let mut header_bytes = [0u8; codec::STATE_HEADER_LEN];
    driver.read_state(session, 0, 0, &mut header_bytes).await?;
    let header = codec::parse_state_header(&header_bytes)?;
    log::info!(
        "register state: {} bytes in {} sections",
        header.size,
        header.num_sec
    );

    driver.resume(session, THREAD_ALL).await?;
    driver.detach(session).await?;
    driver.unregister_device(device)?;

    // Management snapshot of the same class of device.
    let sysman = Sysman::new(Arc::new(SimTelemetry::new().with_privilege()));
    println!("{}", report::render(&sysman)?);

    log::info!("GPU tools demo finished");
    Ok(())
}
