// lowmem_guard - main entry point

use lowmem_guard::config::Args;
use lowmem_guard::daemon;
use std::process;

/// Setup logging based on configuration
fn setup_logging(debug: bool, use_syslog: bool) {
    let log_level = if debug { "debug" } else { "info" };

    if use_syslog {
        #[cfg(feature = "syslog")]
        {
            use syslog::{BasicLogger, Facility, Formatter3164};
            let formatter = Formatter3164 {
                facility: Facility::LOG_DAEMON,
                hostname: None,
                process: "lowmem_guard".into(),
                pid: std::process::id(),
            };

            match syslog::unix(formatter) {
                Ok(logger) => {
                    let level = if debug {
                        log::LevelFilter::Debug
                    } else {
                        log::LevelFilter::Info
                    };
                    if log::set_boxed_logger(Box::new(BasicLogger::new(logger)))
                        .map(|()| log::set_max_level(level))
                        .is_ok()
                    {
                        return;
                    }
                }
                Err(e) => eprintln!("Failed to connect to syslog: {e}"),
            }
        }

        #[cfg(not(feature = "syslog"))]
        eprintln!("Warning: --syslog requires the 'syslog' feature to be enabled");
    }

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp_secs()
        .init();
}

fn main() {
    let args = Args::parse_args();

    setup_logging(args.debug, args.syslog);

    if let Err(e) = daemon::run(args) {
        log::error!("Fatal: {e:#}");
        process::exit(1);
    }
}
