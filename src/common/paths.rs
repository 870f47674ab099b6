use std::path::PathBuf;
use std::fs;
use crate::common::error::Result;

pub enum RunMode {
    Development(PathBuf),  // Base directory for dev mode
    System,                // Use system paths
}

pub struct Paths {
    mode: RunMode,
}

impl Paths {
    pub fn new(dev: bool) -> Result<Self> {
        if dev {
            let base_dir = PathBuf::from("./dev_data");

            fs::create_dir_all(base_dir.join("models"))?;
            fs::create_dir_all(base_dir.join("recognition"))?;

            println!("📁 Development mode - using local directory: {}", base_dir.display());

            Ok(Self {
                mode: RunMode::Development(base_dir),
            })
        } else {
            Ok(Self { mode: RunMode::System })
        }
    }

    pub fn config_file(&self) -> PathBuf {
        match &self.mode {
            RunMode::Development(base) => base.join("config.toml"),
            RunMode::System => {
                // A per-user config wins over the system one
                if let Some(config_dir) = dirs::config_dir() {
                    let user_config = config_dir.join("faceprint/config.toml");
                    if user_config.exists() {
                        return user_config;
                    }
                }
                PathBuf::from("/etc/faceprint/config.toml")
            }
        }
    }

    /// Where the per-user model stores live.
    pub fn user_models_dir(&self) -> PathBuf {
        match &self.mode {
            RunMode::Development(base) => base.join("models"),
            RunMode::System => PathBuf::from("/var/lib/faceprint/models"),
        }
    }

    /// Where the recognition model files (ONNX) are installed.
    pub fn recognition_models_dir(&self) -> PathBuf {
        match &self.mode {
            RunMode::Development(base) => base.join("recognition"),
            RunMode::System => PathBuf::from("/usr/share/faceprint/models"),
        }
    }
}
