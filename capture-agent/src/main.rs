// Copyright 2024 hq-capture Authors
// SPDX-License-Identifier: Apache-2.0

//! hq-capture CLI entry point
//!
//! `simulate` drives the agent against the in-process host, `encode` runs a
//! raw frame dump through the capture pipeline.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use clap::{Arg, ArgMatches, Command};
use log::{error, info, warn, LevelFilter};
use simple_logger::SimpleLogger;

use hq_capture::capture::stub::StubGrabber;
use hq_capture::capture::{FileGrabber, FrameDesc};
use hq_capture::encode::WebPCodec;
use hq_capture::host::HostClock;
use hq_capture::provider::{CaptureProvider, CompletionCallback, ImageProvider};
use hq_capture::resize::RayonPool;
use hq_capture::sim::SimulatedHost;
use hq_capture::{CaptureAgent, CaptureSettings, HostSaveState, PixelFormat};

fn common_args(command: Command) -> Command {
    command
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("PATH")
                .help("Settings file (JSON), defaults are used if it does not exist"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(clap::ArgAction::SetTrue)
                .help("Enable verbose logging"),
        )
}

fn cli() -> Command {
    Command::new("hq-capture")
        .version(env!("CARGO_PKG_VERSION"))
        .author("hq-capture Authors")
        .about("High quality capture agent for in-game photo albums")
        .subcommand_required(true)
        .subcommand(common_args(
            Command::new("simulate")
                .about("Run save cycles against the simulated host")
                .arg(
                    Arg::new("fps")
                        .short('f')
                        .long("fps")
                        .value_name("FPS")
                        .default_value("60")
                        .help("Host frames per second"),
                )
                .arg(
                    Arg::new("cycles")
                        .short('n')
                        .long("cycles")
                        .value_name("N")
                        .default_value("1")
                        .help("Save cycles to run"),
                )
                .arg(
                    Arg::new("out")
                        .short('o')
                        .long("out")
                        .value_name("DIR")
                        .default_value(".")
                        .help("Directory the saved captures are written to"),
                ),
        ))
        .subcommand(common_args(
            Command::new("encode")
                .about("Convert, resize and encode a raw frame dump")
                .arg(Arg::new("input").required(true).value_name("RAW"))
                .arg(
                    Arg::new("width")
                        .long("width")
                        .value_name("PIXELS")
                        .required(true),
                )
                .arg(
                    Arg::new("height")
                        .long("height")
                        .value_name("PIXELS")
                        .required(true),
                )
                .arg(
                    Arg::new("format")
                        .long("format")
                        .value_name("FORMAT")
                        .default_value("bgra8")
                        .help("Pixel format, e.g. rgba8, bgra8, rgb10a2, rgba16_float"),
                )
                .arg(
                    Arg::new("out")
                        .short('o')
                        .long("out")
                        .value_name("PATH")
                        .default_value("capture.webp"),
                ),
        ))
}

fn parse<T>(matches: &ArgMatches, name: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw = matches
        .get_one::<String>(name)
        .ok_or_else(|| anyhow!("missing --{name}"))?;
    raw.parse().with_context(|| format!("invalid --{name} {raw:?}"))
}

fn load_settings(matches: &ArgMatches) -> Result<CaptureSettings> {
    match matches.get_one::<String>("config") {
        Some(path) => CaptureSettings::load(path).with_context(|| format!("loading {path}")),
        None => Ok(CaptureSettings::default()),
    }
}

fn main() -> Result<()> {
    let matches = cli().get_matches();
    let (name, sub) = matches
        .subcommand()
        .ok_or_else(|| anyhow!("no subcommand given"))?;

    // Initialize logging
    let log_level = if sub.get_flag("verbose") {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    SimpleLogger::new()
        .with_level(log_level)
        .init()
        .context("installing logger")?;

    let settings = load_settings(sub)?;
    match name {
        "simulate" => simulate(sub, settings),
        "encode" => encode(sub, settings),
        other => bail!("unknown subcommand {other}"),
    }
}

fn simulate(matches: &ArgMatches, settings: CaptureSettings) -> Result<()> {
    let fps: u32 = parse(matches, "fps")?;
    let cycles: u32 = parse(matches, "cycles")?;
    let out = PathBuf::from(matches.get_one::<String>("out").map_or(".", String::as_str));
    if fps == 0 {
        bail!("--fps must be positive");
    }
    fs::create_dir_all(&out).with_context(|| format!("creating {}", out.display()))?;

    let size = settings.output_16x9;
    let grabber = StubGrabber::new(FrameDesc::new(size.width, size.height, PixelFormat::Bgra8));
    let deadline = settings.deadline_frames;
    let mut agent = CaptureAgent::new(settings, Box::new(grabber))?;
    let mut host = SimulatedHost::new();

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .context("installing Ctrl+C handler")?;

    info!("Simulating {cycles} save cycles at {fps} fps, press Ctrl+C to stop");
    let frame_interval = Duration::from_micros(1_000_000 / u64::from(fps));

    for cycle in 1..=cycles {
        agent.arm_capture();
        host.request_save();

        let mut frames = 0;
        while running.load(Ordering::SeqCst) && host.save_state() != HostSaveState::Idle {
            let start = Instant::now();
            host.run_frame(&mut agent);
            frames += 1;
            if frames > deadline.saturating_mul(2) {
                bail!("save cycle {cycle} did not finish after {frames} frames");
            }

            // Maintain frame rate
            let elapsed = start.elapsed();
            if elapsed < frame_interval {
                std::thread::sleep(frame_interval - elapsed);
            }
        }
        if !running.load(Ordering::SeqCst) {
            warn!("Interrupted during cycle {cycle}");
            break;
        }

        let saved = host.saved().last().map_or(&[][..], Vec::as_slice);
        let path = out.join(format!("capture_{cycle}.webp"));
        fs::write(&path, saved).with_context(|| format!("writing {}", path.display()))?;
        info!(
            "Cycle {cycle}: {frames} frames, {} bytes saved to {} (injected {})",
            saved.len(),
            path.display(),
            agent.injections()
        );
    }

    info!("Stopping capture agent...");
    agent.stop();
    Ok(())
}

fn encode(matches: &ArgMatches, settings: CaptureSettings) -> Result<()> {
    let input = matches
        .get_one::<String>("input")
        .ok_or_else(|| anyhow!("missing input"))?;
    let width: u32 = parse(matches, "width")?;
    let height: u32 = parse(matches, "height")?;
    let format_name = matches
        .get_one::<String>("format")
        .ok_or_else(|| anyhow!("missing --format"))?;
    let format: PixelFormat = serde_json::from_value(serde_json::Value::String(format_name.clone()))
        .with_context(|| format!("unknown pixel format {format_name:?}"))?;
    let out = Path::new(matches.get_one::<String>("out").map_or("capture.webp", String::as_str));

    let grabber = FileGrabber::open(input, FrameDesc::new(width, height, format))
        .with_context(|| format!("opening {input}"))?;
    let deadline = settings.deadline_frames;
    let mut provider = CaptureProvider::new(
        settings,
        Box::new(grabber),
        Arc::new(WebPCodec),
        Arc::new(RayonPool::new(0)?),
    );

    let (tx, rx) = flume::bounded(1);
    let callback: CompletionCallback = Box::new(move |result| {
        // The receiver outlives the provider
        let _ = tx.send(result);
    });
    provider.set_requested();
    if !provider.provide_image(width * 9 <= height * 16, Some(callback)) {
        bail!("capture provider refused the request, check `enabled` and `mode`");
    }

    // Drive the prepare cycle with the simulated clock until the request completes
    let mut host = SimulatedHost::new();
    for _ in 0..=deadline {
        provider.on_update();
        provider.on_late_update(&mut HostClock::new(&mut host));
        provider.on_end_rendering();
        provider.join();
        if !provider.is_in_flight() {
            break;
        }
    }

    match rx.try_recv() {
        Ok(Ok(payload)) => {
            fs::write(out, &payload.bytes).with_context(|| format!("writing {}", out.display()))?;
            info!(
                "Wrote {} bytes at quality {} to {}{}",
                payload.len(),
                payload.quality,
                out.display(),
                if payload.within_budget { "" } else { " (over budget)" }
            );
            Ok(())
        }
        Ok(Err(e)) => {
            error!("Capture failed: {e}");
            Err(e.into())
        }
        Err(_) => bail!("capture did not complete"),
    }
}
