use std::process::ExitCode;

use capmux::{
    capture::CaptureSession,
    lifecycle::Lifecycle,
    runtime::{self, Runtime, RuntimeError},
    scheduler::SystemAlarm,
};
use tracing::info;

/// Exit status for help, version and rejected arguments.
const USAGE_EXIT: u8 = 2;

fn main() -> ExitCode {
    let runtime = match Runtime::new() {
        Ok(runtime) => runtime,
        Err(RuntimeError::Usage(e)) => {
            let _ = e.print();
            return ExitCode::from(USAGE_EXIT);
        }
        Err(RuntimeError::Config(e)) => {
            eprintln!("capmux: {e}");
            return ExitCode::FAILURE;
        }
    };
    let Runtime { conf, .. } = runtime;

    runtime::logging::init(conf.verbose);

    let mut lifecycle = Lifecycle::new(&conf, SystemAlarm);
    let outcome = lifecycle.run(|conf| {
        CaptureSession::open(&conf.interface, conf.snaplen, conf.promiscuous)
    });

    match outcome {
        Ok(reason) => {
            info!(
                event.name = "main.exit",
                reason = %reason,
                packets = lifecycle.packets(),
                ticks = lifecycle.ticks(),
                "exiting"
            );
            ExitCode::SUCCESS
        }
        // already reported by the lifecycle, with the phase it failed in
        Err(_) => ExitCode::FAILURE,
    }
}
