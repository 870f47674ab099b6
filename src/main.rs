use faceprint::{
    camera::{test_device_open, CaptureSession, DeviceLocator},
    common::{Config, FaceAuthError, Paths, EXIT_FAILURE},
    core::{create_backend, Enrollment, EnrollmentOptions, LabelChoice, StdinPrompt},
    storage::{validate_user, ModelStore},
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "faceprint")]
#[command(about = "Face model enrollment for camera-based login")]
struct Cli {
    /// Enable development mode (keeps config and models under ./dev_data)
    #[arg(long, global = true)]
    dev: bool,

    /// Config file to use instead of the default location
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// User to act on (defaults to the invoking user)
    #[arg(short = 'U', long, global = true)]
    user: Option<String>,

    /// Assume yes for every question (non-interactive)
    #[arg(short = 'y', long, global = true)]
    yes: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture a new face model
    Add {
        /// Label for the new model
        label: Option<String>,
    },
    /// List the user's face models
    List,
    /// Remove one face model by id
    Remove { id: u32 },
    /// Remove all of the user's face models
    Clear,
    /// Probe the camera devices on this system
    Devices,
}

fn main() {
    let cli = Cli::parse();

    // Setup logging based on mode
    setup_logging(cli.dev);

    if let Err(err) = run(cli) {
        let code = match err.downcast_ref::<FaceAuthError>() {
            Some(error @ FaceAuthError::ModelFilesMissing { directory, .. }) => {
                eprintln!("{}", error);
                eprintln!(
                    "Install the recognition models into {} \
                     (or set models.directory in the config) and try again.",
                    directory.display()
                );
                error.exit_code()
            }
            Some(error) => {
                eprintln!("{}", error);
                error.exit_code()
            }
            None => {
                eprintln!("Error: {:#}", err);
                EXIT_FAILURE
            }
        };
        std::process::exit(code);
    }
}

fn run(cli: Cli) -> Result<()> {
    let paths = Paths::new(cli.dev)?;

    match cli.command {
        Commands::Devices => {
            list_devices();
            return Ok(());
        }
        Commands::Add { ref label } => {
            let config = load_config(&paths, cli.config.as_ref())?;
            let user = target_user(cli.user.as_deref())?;
            let store = ModelStore::new(paths.user_models_dir());
            let backend = create_backend(&config, &paths.recognition_models_dir())?;

            let mut prompt = StdinPrompt;
            let label = match (label.clone(), cli.yes) {
                (Some(label), _) => LabelChoice::Explicit(label),
                (None, true) => LabelChoice::Automatic,
                (None, false) => LabelChoice::Interactive(&mut prompt),
            };

            println!("Adding face model for the user {}", user);
            let capture = config.capture_config();
            let options = EnrollmentOptions::from_config(&config);
            let enrollment = Enrollment::new(&store, backend.as_ref(), options);
            let outcome = enrollment.run(&user, label, || CaptureSession::open(capture))?;

            println!("\nScan complete");
            println!(
                "Added a new model to {} (id {}, {} total)",
                user, outcome.record.id, outcome.total_models
            );
        }
        Commands::List => {
            let user = target_user(cli.user.as_deref())?;
            let store = ModelStore::new(paths.user_models_dir());
            let records = store.load(&user)?;
            if records.is_empty() {
                println!("No face models known for the user {}", user);
                return Ok(());
            }

            println!("Known face models for {}:\n", user);
            println!("  {:<4} {:<21} {}", "ID", "Date", "Label");
            for record in &records {
                let date = chrono::DateTime::from_timestamp(record.time, 0)
                    .map(|utc| {
                        utc.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S").to_string()
                    })
                    .unwrap_or_else(|| "unknown".to_string());
                println!("  {:<4} {:<21} {}", record.id, date, record.label);
            }
        }
        Commands::Remove { id } => {
            let user = target_user(cli.user.as_deref())?;
            let store = ModelStore::new(paths.user_models_dir());
            if !cli.yes && !confirm(&format!("Remove model {} from the user {}?", id, user))? {
                println!("Nothing removed");
                return Ok(());
            }
            if store.remove(&user, id)? {
                println!("Removed model {}", id);
            } else {
                let reason = format!("No model with id {} exists for {}", id, user);
                return Err(FaceAuthError::Storage(reason).into());
            }
        }
        Commands::Clear => {
            let user = target_user(cli.user.as_deref())?;
            let store = ModelStore::new(paths.user_models_dir());
            if !cli.yes && !confirm(&format!("Remove all face models of the user {}?", user))? {
                println!("Nothing removed");
                return Ok(());
            }
            if store.clear(&user)? {
                println!("Models cleared");
            } else {
                println!("No face models known for the user {}", user);
            }
        }
    }

    Ok(())
}

fn load_config(paths: &Paths, override_path: Option<&PathBuf>) -> Result<Config> {
    let path = override_path.cloned().unwrap_or_else(|| paths.config_file());
    let config = Config::load_from_path(&path)
        .with_context(|| format!("load config {}", path.display()))?;
    Ok(config)
}

/// The `-U` user, else whoever invoked us (through sudo if applicable).
fn target_user(explicit: Option<&str>) -> Result<String> {
    let user = match explicit {
        Some(user) => user.to_string(),
        None => std::env::var("SUDO_USER")
            .or_else(|_| std::env::var("USER"))
            .context("could not determine the user, pass one with -U")?,
    };
    validate_user(&user)?;
    Ok(user)
}

fn confirm(question: &str) -> Result<bool> {
    print!("{} [y/N]: ", question);
    io::stdout().flush()?;
    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}

fn list_devices() {
    let locator = DeviceLocator::host();
    let environment = locator.detect_environment();

    println!("V4L2 device links:  {}", if environment.v4l2_available { "found" } else { "none" });
    println!("PipeWire running:   {}", if environment.pipewire_running { "yes" } else { "no" });
    println!(
        "GStreamer backend:  {}",
        if environment.alternate_backend_available { "available" } else { "not built in" }
    );

    let devices = locator.discover_devices();
    if devices.is_empty() {
        println!("\nNo camera devices found.");
        return;
    }

    println!();
    for device in &devices {
        let probe = test_device_open(&device.path, None);
        let status = match (&probe.error, probe.is_gray) {
            (Some(error), _) => error.clone(),
            (None, true) => "grayscale (likely IR)".to_string(),
            (None, false) => "color".to_string(),
        };
        println!(
            "{:<16} {:<32} [{}] {}",
            device.path.display(),
            device.display_name,
            device.source.as_str(),
            status
        );
    }
    println!("\nSet video.device_path in the config to the camera you want to use.");
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
