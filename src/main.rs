use std::{
    io, process,
    sync::mpsc::{self, RecvTimeoutError},
    thread,
    time::Duration,
};

use clap::Parser;
use libc::SIGINT;
use signal_hook::iterator::Signals;
use station_deadlock::{
    config::{self, Cli, Prompter},
    Error, ShutdownReport, Simulation,
};
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

// デッドロック検出の確認間隔
const WATCH_INTERVAL: Duration = Duration::from_secs(1);

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_thread_names(true)
        .with_target(false)
        .init();

    let cli = Cli::parse();

    let config = {
        let stdin = io::stdin();
        let mut prompter = Prompter::new(stdin.lock(), io::stdout());
        match config::collect(&cli, &mut prompter) {
            Ok(config) => config,
            // 入力が不正ならユーザーによる中断とみなし、何も確保せず終了
            Err(Error::Config(e)) => {
                debug!(%e, "aborted");
                process::exit(0);
            }
            Err(e) => return Err(e.into()),
        }
    };

    // SIGINT を受け取ったらメインスレッドに知らせる
    let mut signals = Signals::new([SIGINT]).map_err(Error::Signal)?;
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        for sig in signals.forever() {
            if tx.send(sig).is_err() {
                break;
            }
        }
    });

    let mut sim = Simulation::start(config)?;
    info!("press Ctrl-C to stop");

    let mut reported = Vec::new();
    loop {
        match rx.recv_timeout(WATCH_INTERVAL) {
            Ok(sig) => {
                info!(signal = sig, "interrupt received");
                break;
            }
            Err(RecvTimeoutError::Timeout) => {
                let stuck = sim.deadlocked_stations();
                for id in stuck.iter().filter(|id| !reported.contains(*id)) {
                    error!(station = id, "circular wait: workers are deadlocked");
                }
                reported = stuck;
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    if let Some(report) = sim.drain() {
        summary(&report);
    }
    Ok(())
}

fn summary(report: &ShutdownReport) {
    println!("----- {} mode finished -----", report.mode);
    println!("orders delivered: {}", report.stats.completed);
    println!(
        "gave up under contention: {}",
        report.stats.contention_releases
    );
    if report.forced {
        // 強制終了ではロックが持ち主ごと放置される
        println!(
            "workers terminated: {} (resources left locked: {})",
            report.remaining_active, report.abandoned
        );
    }
    if report.panicked > 0 {
        println!("workers crashed: {}", report.panicked);
    }
}
