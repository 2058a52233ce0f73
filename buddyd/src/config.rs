use serde_derive::{Deserialize, Serialize};
use serdeconv;
use std::path::Path;

pub const DEFAULT_PORT: u16 = 2500;

#[derive(Serialize, Deserialize)]
pub struct General {
    pub port: u16,
    pub interface: String,
    pub log_level: String,
}

impl Default for General {
    fn default() -> General {
        General {
            port: DEFAULT_PORT,
            interface: "0.0.0.0".into(),
            log_level: "info".into(),
        }
    }
}

#[derive(Serialize, Deserialize)]
pub struct Buffer {
    /// Capacity of the global sample ring in bytes.
    pub capacity: usize,
}

impl Default for Buffer {
    fn default() -> Buffer {
        Buffer {
            capacity: 1024 * 1024,
        }
    }
}

#[derive(Serialize, Deserialize)]
pub struct Producer {
    /// Base tick period in microseconds.
    pub period_us: u64,
}

impl Default for Producer {
    fn default() -> Producer {
        Producer { period_us: 1000 }
    }
}

#[derive(Serialize, Deserialize, Default)]
pub struct Features {
    pub statistics: bool,
}

#[derive(Serialize, Deserialize)]
pub struct User {
    pub name: String,
    /// Base64, 32 bytes decoded.
    pub key: String,
    #[serde(default)]
    pub admin: bool,
    #[serde(default)]
    pub write_access: bool,
}

#[derive(Serialize, Deserialize, Default)]
pub struct BuddyConfig {
    #[serde(default)]
    pub general: General,
    #[serde(default)]
    pub buffer: Buffer,
    #[serde(default)]
    pub producer: Producer,
    #[serde(default)]
    pub features: Features,
    #[serde(default)]
    pub users: Vec<User>,
}

impl BuddyConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> BuddyConfig {
        serdeconv::from_toml_file(path).expect("Error loading buddy configuration file")
    }
}
