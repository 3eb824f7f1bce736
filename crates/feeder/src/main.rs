use std::path::PathBuf;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use log::info;
use scara_feeder::{FeederConfig, Job, MotionSink, Plotter, Simulator, Speed};
use scara_geom::Point3;
use scara_planner::{ArcCenter, ArcRequest, Rotation};

#[derive(Parser)]
struct Args {
    /// A JSON file with the geometry, limits and session configuration.
    #[arg(long)]
    config: Option<PathBuf>,

    /// The device's address, overriding the one in the configuration.
    #[arg(long)]
    address: Option<String>,

    /// Instead of talking to a device, run a simulated one and draw what it
    /// did into this SVG file.
    #[arg(long)]
    simulate: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Runs the drawing commands in a JSON job file.
    Run { job: PathBuf },
    /// Moves the pen to a point.
    Move {
        x: f64,
        y: f64,
        #[arg(long)]
        z: Option<f64>,
    },
    /// Draws a circle.
    Circle {
        x: f64,
        y: f64,
        radius: f64,
        #[arg(long, default_value_t = 1)]
        turns: u32,
    },
    /// Goes back to the index point.
    Home,
}

struct LogSink;

impl MotionSink for LogSink {
    fn on_speed_change(&mut self, speed: Speed) {
        info!("speed: {speed:?}");
    }

    fn on_up_down(&mut self, pen_down: bool) {
        info!("pen {}", if pen_down { "down" } else { "up" });
    }
}

async fn run(cmd: &Command, plotter: &mut Plotter<LogSink>) -> anyhow::Result<()> {
    match cmd {
        Command::Run { job } => {
            let job = Job::load(job)?;
            job.run(plotter).await?;
        }
        Command::Move { x, y, z } => {
            let z = z.unwrap_or(plotter.engine().position().z);
            plotter.move_to(Point3::new(*x, *y, z)).await?;
        }
        Command::Circle {
            x,
            y,
            radius,
            turns,
        } => {
            plotter.pen_up().await?;
            plotter.set_speed(Speed::Travel);
            let z = plotter.engine().position().z;
            plotter.move_to(Point3::new(x + radius, *y, z)).await?;
            plotter.set_speed(Speed::Draw);
            plotter.pen_down().await?;
            let req = ArcRequest::new(
                Point3::origin(),
                ArcCenter::Radius(*radius),
                Rotation::CounterClockwise,
            )
            .with_turns(*turns);
            plotter.arc_by(&req).await?;
            plotter.pen_up().await?;
        }
        Command::Home => plotter.home().await?,
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pretty_env_logger::init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => FeederConfig::load(path)?,
        None => FeederConfig::default(),
    };
    if let Some(address) = args.address {
        config.session.address = address;
    }
    let translator = config
        .geometry
        .calibrate()
        .context("invalid geometry configuration")?;

    let simulator = match &args.simulate {
        Some(_) => {
            let device = scara_firmware::Config {
                auth_key: config.session.auth_key,
                ..Default::default()
            };
            let sim = Simulator::start(device, translator.home()?.steps, 1)?;
            config.session.address = sim.addr().to_string();
            Some(sim)
        }
        None => None,
    };

    let session = config.session.clone();
    let mut plotter = Plotter::connect(translator, config.limits, session, LogSink).await?;
    run(&args.cmd, &mut plotter).await?;
    let end = plotter.engine().rounded_position();
    plotter.finish().await?;
    info!("finished at {end:?}");

    if let (Some(mut sim), Some(out)) = (simulator, &args.simulate) {
        let pen_z = (config.session.pen_up_z + config.session.pen_down_z) / 2.0;
        sim.illustrate(&translator, pen_z, out)?;
        let ends = sim.join()?;
        info!("simulated sessions: {ends:?}");
    }
    Ok(())
}
