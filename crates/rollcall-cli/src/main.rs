use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rollcall_core::{FaceLocator, FrameSource, LocatorConfig, ModelManifest, ScrfdLocator};
use rollcall_hw::camera::CaptureSettings;
use rollcall_hw::Camera;
use serde_json::Value;
use std::path::PathBuf;

// `#[zbus::proxy]` generates both `RollcallProxy` (async) and
// `RollcallProxyBlocking`. The CLI only uses the blocking variant.
#[zbus::proxy(
    interface = "org.rollcall.Rollcall1",
    default_service = "org.rollcall.Rollcall1",
    default_path = "/org/rollcall/Rollcall1"
)]
trait Rollcall {
    fn enroll_image(&self, person_id: &str, path: &str, label: &str) -> zbus::Result<String>;
    fn revoke(&self, person_id: &str) -> zbus::Result<bool>;
    fn list_people(&self) -> zbus::Result<String>;
    fn attendance(&self, window: &str) -> zbus::Result<String>;
    fn status(&self) -> zbus::Result<String>;

    #[zbus(signal)]
    fn attendance_recorded(&self, person_id: &str, window: &str, timestamp_ms: u64) -> zbus::Result<()>;

    #[zbus(signal)]
    fn health_changed(&self, health: &str) -> zbus::Result<()>;
}

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall attendance recognition CLI")]
struct Cli {
    /// Talk to a daemon on the session bus instead of the system bus
    #[arg(long, global = true)]
    session: bool,

    /// Print raw JSON from the daemon
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a person from a photo
    Enroll {
        /// Person identifier (e.g., a student or employee number)
        person: String,
        /// Image file containing the person's face
        image: PathBuf,
        /// Label for this reference (e.g., "glasses")
        #[arg(short, long, default_value = "")]
        label: String,
    },
    /// Remove a person and all their references
    Revoke { person: String },
    /// List enrolled people
    List,
    /// Show attendance for a window (default: today)
    Attendance {
        /// Window id, e.g. 2026-10-16
        #[arg(short, long)]
        window: Option<String>,
    },
    /// Show daemon status
    Status,
    /// Print attendance and health signals as they arrive
    Watch,
    /// List V4L2 capture devices
    Devices,
    /// Run camera diagnostics without the daemon
    Test {
        #[arg(short, long, default_value = "/dev/video0")]
        device: String,
        #[arg(short, long, default_value_t = 10)]
        frames: usize,
        /// Also run the face locator from this model directory
        #[arg(long)]
        models: Option<PathBuf>,
        /// Accept models without a manifest or checksums
        #[arg(long)]
        allow_unverified: bool,
    },
}

fn connect(session: bool) -> Result<RollcallProxyBlocking<'static>> {
    let builder = if session {
        zbus::blocking::connection::Builder::session()?
    } else {
        zbus::blocking::connection::Builder::system()?
    };
    let conn = builder
        .method_timeout(std::time::Duration::from_secs(30))
        .build()
        .context("cannot connect to D-Bus")?;
    RollcallProxyBlocking::new(&conn).context("rollcalld is not running")
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Enroll { person, image, label } => {
            let path = std::fs::canonicalize(&image)
                .with_context(|| format!("cannot resolve {}", image.display()))?;
            let proxy = connect(cli.session)?;
            let reply = proxy.enroll_image(&person, &path.to_string_lossy(), &label)?;
            if cli.json {
                println!("{reply}");
            } else {
                let v: Value = serde_json::from_str(&reply)?;
                println!(
                    "{}: {} ({} reference(s), face confidence {:.2})",
                    person,
                    v["outcome"].as_str().unwrap_or("?"),
                    v["references"],
                    v["confidence"].as_f64().unwrap_or(0.0)
                );
            }
        }
        Commands::Revoke { person } => {
            let proxy = connect(cli.session)?;
            if proxy.revoke(&person)? {
                println!("revoked {person}");
            } else {
                println!("{person} is not enrolled");
            }
        }
        Commands::List => {
            let reply = connect(cli.session)?.list_people()?;
            if cli.json {
                println!("{reply}");
            } else {
                let lines = format_people(&reply)?;
                if lines.is_empty() {
                    println!("No people enrolled");
                }
                for line in lines {
                    println!("{line}");
                }
            }
        }
        Commands::Attendance { window } => {
            let reply = connect(cli.session)?.attendance(window.as_deref().unwrap_or(""))?;
            if cli.json {
                println!("{reply}");
            } else {
                let lines = format_attendance(&reply)?;
                if lines.is_empty() {
                    println!("No attendance recorded");
                }
                for line in lines {
                    println!("{line}");
                }
            }
        }
        Commands::Status => {
            let reply = connect(cli.session)?.status()?;
            let v: Value = serde_json::from_str(&reply)?;
            println!("{}", serde_json::to_string_pretty(&v)?);
        }
        Commands::Watch => watch(cli.session)?,
        Commands::Devices => {
            let devices = Camera::list_devices();
            if devices.is_empty() {
                println!("No V4L2 capture devices found");
            }
            for d in devices {
                println!("{}  {} ({}, {})", d.path, d.name, d.driver, d.bus);
            }
        }
        Commands::Test {
            device,
            frames,
            models,
            allow_unverified,
        } => run_camera_test(&device, frames, models, allow_unverified)?,
    }

    Ok(())
}

fn watch(session: bool) -> Result<()> {
    let proxy = connect(session)?;
    let attendance = proxy.receive_attendance_recorded()?;
    println!("watching for attendance (Ctrl-C to stop)");

    std::thread::scope(|s| {
        let health_proxy = proxy.clone();
        s.spawn(move || {
            let health = match health_proxy.receive_health_changed() {
                Ok(signals) => signals,
                Err(e) => {
                    tracing::warn!(error = %e, "cannot subscribe to HealthChanged");
                    return;
                }
            };
            for signal in health {
                match signal.args() {
                    Ok(args) => println!("health: {}", args.health()),
                    Err(e) => tracing::warn!(error = %e, "malformed HealthChanged signal"),
                }
            }
        });
        for signal in attendance {
            match signal.args() {
                Ok(args) => println!(
                    "{}  {}  [{}]",
                    format_time(*args.timestamp_ms()),
                    args.person_id(),
                    args.window()
                ),
                Err(e) => tracing::warn!(error = %e, "malformed AttendanceRecorded signal"),
            }
        }
    });
    Ok(())
}

fn run_camera_test(device: &str, frames: usize, models: Option<PathBuf>, allow_unverified: bool) -> Result<()> {
    println!("Running camera diagnostics on {device}...");
    let mut camera = Camera::open(device, CaptureSettings::default())?;
    println!("  format: {:?} {}x{}", camera.fourcc, camera.width, camera.height);

    let mut locator = match models {
        Some(dir) => {
            let manifest = if allow_unverified {
                ModelManifest::load_unverified(&dir)?
            } else {
                ModelManifest::load(&dir)?
            };
            Some(ScrfdLocator::load(&manifest.detector, LocatorConfig::default())?)
        }
        None => None,
    };

    camera.warm_up(4);
    for i in 0..frames {
        let Some(frame) = camera.next_frame()? else {
            break;
        };
        let mut line = format!("  frame {i:>3}: brightness {:>6.1}", frame.avg_brightness());
        if let Some(locator) = locator.as_mut() {
            let faces = locator.locate(&frame)?;
            let best = faces.first().map(|f| f.confidence).unwrap_or(0.0);
            line.push_str(&format!("  faces {}  best {:.2}", faces.len(), best));
        }
        println!("{line}");
    }
    println!("  dark frames skipped: {}", camera.dark_skipped());
    Ok(())
}

fn format_time(timestamp_ms: u64) -> String {
    i64::try_from(timestamp_ms)
        .ok()
        .and_then(chrono::DateTime::<chrono::Utc>::from_timestamp_millis)
        .map(|t| t.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| timestamp_ms.to_string())
}

fn format_people(json: &str) -> Result<Vec<String>> {
    let people: Vec<Value> = serde_json::from_str(json)?;
    Ok(people
        .iter()
        .map(|p| {
            let labels: Vec<&str> = p["labels"]
                .as_array()
                .map(|a| a.iter().filter_map(Value::as_str).collect())
                .unwrap_or_default();
            let mut line = format!(
                "{}  {} reference(s)",
                p["person_id"].as_str().unwrap_or("?"),
                p["references"].as_u64().unwrap_or(0)
            );
            if !labels.is_empty() {
                line.push_str(&format!("  [{}]", labels.join(", ")));
            }
            line
        })
        .collect())
}

fn format_attendance(json: &str) -> Result<Vec<String>> {
    let events: Vec<Value> = serde_json::from_str(json)?;
    Ok(events
        .iter()
        .map(|e| {
            format!(
                "{}  {}",
                format_time(e["timestamp_ms"].as_u64().unwrap_or(0)),
                e["person_id"].as_str().unwrap_or("?")
            )
        })
        .collect())
}
