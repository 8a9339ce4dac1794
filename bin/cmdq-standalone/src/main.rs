// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use cmdq::devq::Admission;
use cmdq::perimeter::{self, Perimeter, PerimeterLock};
use cmdq::{
    AdapterHandle, AdapterRef, DeviceId, Dispatched, Priority,
    QueueDisposition,
};
use crossbeam_channel::{select, unbounded, Receiver, Sender};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use cmdq::usdt::register_probes;

use slog::{o, Drain};

/// Soft state of the simulated adapter driver
struct Driver {
    /// Ring on which dispatched commands are handed to the workers
    ring: Sender<Dispatched<Cmd>>,
    polls: AtomicU64,
}

#[derive(Debug)]
struct Cmd {
    seq: u64,
    service_time: Duration,
}

/// Simulated hardware: complete each command after its service time, then
/// refill the adapter.
fn worker(
    adapter: AdapterRef<Driver, Cmd>,
    ring: Receiver<Dispatched<Cmd>>,
    stop: Receiver<()>,
    done: Sender<u64>,
    log: slog::Logger,
) {
    loop {
        select! {
            recv(ring) -> msg => {
                let Ok(Dispatched { device, cmd, .. }) = msg else {
                    break;
                };
                thread::sleep(cmd.service_time);
                if let Err(e) = adapter.complete(device) {
                    slog::error!(log, "completion failed";
                        "seq" => cmd.seq,
                        "error" => %e,
                    );
                }
                let _ = done.send(cmd.seq);
                adapter.run();
            }
            recv(stop) -> _ => break,
        }
    }
    slog::debug!(log, "worker exiting");
}

fn build_log() -> (slog::Logger, slog_async::AsyncGuard) {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::CompactFormat::new(decorator).build().fuse();
    let (drain, guard) = slog_async::Async::new(drain).build_with_guard();
    (slog::Logger::root(drain.fuse(), o!()), guard)
}

#[derive(clap::Parser)]
/// Drive a synthetic command workload through an adapter's admission queues.
struct Args {
    /// Adapter configuration file
    #[clap(value_name = "CONFIG", action)]
    config: String,

    /// Number of commands to issue
    #[clap(short = 'n', long, default_value_t = 10_000)]
    commands: u64,

    /// Number of simulated hardware workers
    #[clap(short, long, default_value_t = 4)]
    workers: usize,

    /// Seed for the workload generator
    #[clap(long, env = "CMDQ_SEED", default_value_t = 0)]
    seed: u64,

    /// Briefly freeze the adapter after every N commands
    #[clap(long, value_name = "N")]
    freeze_every: Option<NonZeroU64>,
}

fn main() -> anyhow::Result<()> {
    let Args { config, commands, workers, seed, freeze_every } = Args::parse();

    // Ensure proper setup of USDT probes
    register_probes().context("Failed to setup USDT probes")?;

    let (log, _log_async_guard) = build_log();
    slog::info!(log, "cmdq-standalone {}", cmdq::version());

    let config =
        cmdq_config_toml::parse(&config).context("Failed to parse config")?;
    if config.devices.is_empty() {
        anyhow::bail!("no devices configured for adapter");
    }

    let queue = Arc::new(PerimeterLock::new(Perimeter::new(
        config.adapter.send_openings,
    )));
    let (ring_tx, ring_rx) = unbounded();
    let adapter = AdapterHandle::create(
        config.adapter.params(),
        Driver { ring: ring_tx, polls: AtomicU64::new(0) },
        // The receiving end stays open in main until the adapter is gone
        |drv: &Driver, cmd| {
            let _ = drv.ring.send(cmd);
        },
        |drv: &Driver| {
            drv.polls.fetch_add(1, Ordering::Relaxed);
        },
        queue,
        &log,
    );
    adapter.set_path(config.adapter.unit);

    let devices: Vec<(String, DeviceId)> = config
        .devices
        .iter()
        .map(|(name, dev)| {
            let id = adapter.attach_device(dev.into());
            slog::info!(log, "attached device"; "name" => name, "id" => %id);
            (name.clone(), id)
        })
        .collect();

    let (stop_tx, stop_rx) = unbounded::<()>();
    let (done_tx, done_rx) = unbounded();
    let workers = (0..workers)
        .map(|n| {
            let adapter = adapter.acquire_ref();
            let ring = ring_rx.clone();
            let stop = stop_rx.clone();
            let done = done_tx.clone();
            let log = log.new(o!("worker" => n));
            thread::Builder::new()
                .name(format!("worker-{n}"))
                .spawn(move || worker(adapter, ring, stop, done, log))
        })
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to spawn workers")?;

    let start = Instant::now();
    let mut rng = StdRng::seed_from_u64(seed);
    let mut refused = 0u64;
    let mut parked = 0u64;
    for seq in 0..commands {
        let dev = devices[rng.gen_range(0..devices.len())].1;
        let priority = Priority(rng.gen_range(0..8));
        let service_time = Duration::from_micros(rng.gen_range(10..200));

        loop {
            let cmd = Cmd { seq, service_time };
            match adapter.queue_command(dev, priority, cmd) {
                Ok((_, Admission::Queued)) => break,
                Ok((_, Admission::Frozen)) => {
                    parked += 1;
                    break;
                }
                Err(perimeter::Error::NoOpening(_)) => {
                    refused += 1;
                    adapter.run();
                    thread::yield_now();
                }
                Err(e) => {
                    return Err(e).context("Failed to queue command");
                }
            }
        }
        adapter.run();

        if freeze_every.is_some_and(|n| seq % n.get() == n.get() - 1) {
            // Hold off dispatch while the driver is polled, as error
            // recovery would.
            adapter.freeze(1);
            adapter.poll();
            adapter.release(true);
        }
    }

    let mut completed = 0;
    while completed < commands {
        match done_rx.recv_timeout(Duration::from_secs(10)) {
            Ok(_) => completed += 1,
            Err(_) => anyhow::bail!(
                "stalled with {completed} of {commands} commands complete"
            ),
        }
    }
    let elapsed = start.elapsed();

    drop(stop_tx);
    for handle in workers {
        handle.join().map_err(|_| anyhow::anyhow!("worker panicked"))?;
    }

    for (name, dev) in devices {
        adapter
            .detach_device(dev)
            .with_context(|| format!("Failed to detach device {name}"))?;
    }

    slog::info!(log, "workload complete";
        "commands" => commands,
        "elapsed_ms" => elapsed.as_millis() as u64,
        "refused" => refused,
        "parked" => parked,
        "polls" => adapter.softc().polls.load(Ordering::Relaxed),
    );

    adapter.destroy(QueueDisposition::Free);
    drop(ring_rx);
    Ok(())
}
