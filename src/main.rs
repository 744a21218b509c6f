//! Aberred event bus demo entry point.
//!
//! Runs the headless bouncing-balls [`demo`](aberredbus::demo) scene on a
//! single [`Bus`] created here and handed to the scene explicitly:
//!
//! 1. Load the bus configuration (INI, optional)
//! 2. Create the bus and the scene, spawn the balls
//! 3. Step the scene for the requested number of frames, either by hand
//!    (deterministic) or from the bus' enter loop (real time)
//! 4. Print a report, then reset the scene
//!
//! # Running
//!
//! ```sh
//! cargo run --release -- --balls 16 --frames 1200 --seed 7
//! ```

use aberredbus::config::BusConfig;
use aberredbus::demo::{Arena, Scene};
use aberredbus::event::Bus;
use clap::Parser;
use std::path::PathBuf;

/// Aberred event bus demo
#[derive(Parser)]
#[command(
    version,
    about = "Headless bouncing-balls scene driven by the Aberred event bus."
)]
struct Cli {
    /// Bus configuration file (INI). Defaults are used when omitted.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Number of frames to run.
    #[arg(long, default_value_t = 600)]
    frames: u64,

    /// Number of balls to spawn.
    #[arg(long, default_value_t = 8)]
    balls: usize,

    /// Bounces each ball gets before it retires.
    #[arg(long, default_value_t = 3)]
    bounces: u32,

    /// Seed for ball placement. Random when omitted.
    #[arg(long)]
    seed: Option<u64>,

    /// Drive frames from the bus enter loop at the configured fps instead of
    /// stepping as fast as possible.
    #[arg(long)]
    realtime: bool,

    /// Print the final report as JSON.
    #[arg(long)]
    json: bool,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => {
            let mut config = BusConfig::with_path(path);
            if let Err(e) = config.load_from_file() {
                eprintln!("Error: {e}");
                std::process::exit(1);
            }
            config
        }
        None => {
            let mut config = BusConfig::new();
            config.load_from_file().ok(); // ignore errors, use defaults
            config
        }
    };
    let frame_delay = config.frame_delay();

    log::info!("Hello, world! This is the Aberred event bus!");
    let bus = Bus::with_config(config);

    let mut rng = match cli.seed {
        Some(seed) => fastrand::Rng::with_seed(seed),
        None => fastrand::Rng::new(),
    };
    let mut scene = Scene::new(&bus, Arena::default());
    scene.spawn_balls(cli.balls, cli.bounces, &mut rng);
    bus.flush();

    let report = if cli.realtime {
        scene.run_realtime(cli.frames, frame_delay)
    } else {
        scene.run(cli.frames, frame_delay)
    };

    if cli.json {
        match serde_json::to_string_pretty(&report) {
            Ok(json) => println!("{json}"),
            Err(e) => log::error!("Failed to serialize report: {}", e),
        }
    } else {
        println!(
            "{} frame(s): {} bounce(s), {} ball(s) retired, {} still live, {} binding(s) on the bus",
            report.frames, report.bounces, report.retired, report.live_balls, report.bus.bindings
        );
    }

    scene.teardown();
    log::info!("Bus after teardown: {:?}", bus.stats());
}
