use std::path::PathBuf;

use anyhow::Context;
use virtenc_host::session::Session;

fn main() -> anyhow::Result<()> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Trace)
        .init();

    let mut args = std::env::args().skip(1);
    let program = match (args.next(), args.next()) {
        (Some(path), None) => PathBuf::from(path),
        _ => {
            eprintln!("Usage: virtenc-host <enclave-program>");
            std::process::exit(1);
        }
    };

    let mut session = Session::create(kconfig::VE_HEAP_SIZE).context("create session")?;
    session
        .exec(&program)
        .with_context(|| format!("start enclave {}", program.display()))?;

    // Provision a few emulated hardware threads and exercise each one.
    // Neither step is fatal to an established session.
    for tcs in 0..3 {
        if let Err(err) = session.add_thread(tcs, kconfig::VE_THREAD_STACK_SIZE) {
            log::warn!("Failed to add thread {}: {:#}", tcs, err);
        }
    }
    for tcs in 0..3 {
        if let Err(err) = session.ping_thread(tcs) {
            log::warn!("Failed to ping thread {}: {:#}", tcs, err);
        }
    }

    let status = session.terminate().context("terminate enclave")?;
    println!("child exit status: {}", status);

    Ok(())
}
