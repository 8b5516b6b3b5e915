use shuttle_gate::{
    camera::Camera,
    common::{Config, DevMode},
    core::{
        matcher::is_valid_embedding,
        station::{self, Station},
    },
    gate::protocol::{generate_secret, secret_fingerprint},
};

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "shuttlegate")]
#[command(about = "Face verification checkpoint for the shuttle gate")]
struct Cli {
    /// Enable development mode (keeps users, captures and events in ./dev_data)
    #[arg(long, global = true)]
    dev: bool,

    /// Configuration file (defaults to configs/shuttle-gate.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the checkpoint: watch the camera and open the gate for known faces
    Run {
        /// Stop after this many frames
        #[arg(long)]
        frames: Option<u64>,
    },
    /// Capture one frame and save it
    TestCamera,
    /// List cameras and their pixel formats
    ListCameras,
    /// Run detection on one frame and save an annotated image
    TestDetection,
    /// Enroll a user from a face image
    Enroll {
        #[arg(short, long)]
        user: String,
        #[arg(short, long)]
        image: PathBuf,
    },
    /// List enrolled users
    Users,
    /// Remove an enrolled user
    RemoveUser {
        #[arg(short, long)]
        user: String,
    },
    /// Verify a face image against enrolled users (no gate command)
    Verify {
        #[arg(short, long)]
        image: PathBuf,
    },
    /// Connect to the gate, authenticate and send one FACE_DETECTED
    GateTest,
    /// Generate a shared secret for the gate controller
    GenSecret {
        #[arg(short, long, default_value = "24")]
        length: usize,
    },
    /// Show recorded verifications
    Events {
        /// Only the most recent N events
        #[arg(short = 'n', long)]
        last: Option<usize>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.dev);

    let context = || -> Result<(Config, DevMode)> {
        let config = match &cli.config {
            Some(path) => Config::load_from_path(path)?,
            None => Config::load()?,
        };
        let dev_mode = DevMode::from_config(cli.dev, &config)?;
        Ok((config, dev_mode))
    };
    let open_station = || -> Result<Station> {
        let (config, dev_mode) = context()?;
        Ok(Station::new(config, dev_mode)?)
    };

    match &cli.command {
        Commands::Run { frames } => {
            open_station()?.run(*frames)?;
        }
        Commands::TestCamera => {
            println!("Testing camera...");
            let (config, dev_mode) = context()?;
            station::test_camera_dev(&config, &dev_mode)?;
        }
        Commands::TestDetection => {
            println!("Testing face detection...");
            let (config, dev_mode) = context()?;
            station::test_detection_dev(&config, &dev_mode)?;
        }
        Commands::Enroll { user, image } => {
            println!("Enrolling user: {}", user);
            open_station()?.enroll_from_image(user, image)?;
            println!("✓ Enrolled {}", user);
        }
        Commands::Users => {
            let users = open_station()?.store().list()?;
            if users.is_empty() {
                println!("No users enrolled");
            }
            for user in users {
                let flag = if is_valid_embedding(&user.embedding) { "" } else { "  [invalid embedding]" };
                println!(
                    "{}  (enrolled {}){}",
                    user.user_id,
                    user.enrolled_at.format("%Y-%m-%d %H:%M:%S"),
                    flag
                );
            }
        }
        Commands::RemoveUser { user } => {
            open_station()?.store().remove_user(user)?;
            println!("Removed {}", user);
        }
        Commands::Verify { image } => {
            let outcome = open_station()?.verify_image(image)?;
            match outcome.matched_user_id {
                Some(user) if outcome.verified => {
                    println!("Verification: SUCCESS ({}, distance {:.3})", user, outcome.distance.unwrap_or(0.0))
                }
                _ => println!("Verification: FAILED ({})", outcome.reason.unwrap_or_default()),
            }
        }
        Commands::GateTest => {
            let ok = open_station()?.gate_test()?;
            println!("Gate test: {}", if ok { "SUCCESS" } else { "FAILED" });
        }
        Commands::Events { last } => {
            let events = open_station()?.events().read_all()?;
            let skip = last.map_or(0, |n| events.len().saturating_sub(n));
            for event in events.iter().skip(skip) {
                println!("{}  {}", event.timestamp.to_rfc3339(), event.user_id);
            }
        }
        Commands::GenSecret { length } => {
            let secret = generate_secret(*length);
            println!("{}", secret);
            eprintln!("fingerprint: {}", secret_fingerprint(&secret));
        }
        Commands::ListCameras => list_cameras()?,
    }

    Ok(())
}

fn list_cameras() -> Result<()> {
    let cameras = Camera::list_cameras()?;
    if cameras.is_empty() {
        println!("No cameras found. Check /dev/video* permissions.");
    }
    for camera in cameras {
        println!("/dev/video{}: {}  [{}]", camera.index, camera.card, camera.formats.join(", "));
    }
    Ok(())
}

fn setup_logging(dev_mode: bool) {
    if dev_mode {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_file(true)
            .with_line_number(true)
            .with_thread_ids(true)
            .init();
    } else {
        tracing_subscriber::fmt::init();
    }
}
