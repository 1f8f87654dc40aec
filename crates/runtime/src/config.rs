//! Engine configuration
//!
//! One `key=value` per line, `#` comments. Every key is mirrored by a
//! command-line flag in the server binary; flags win over the file.

use std::fmt;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct Config {
    /// Checkpoint read path.
    pub load_path: PathBuf,
    /// Checkpoint write path.
    pub save_path: PathBuf,
    /// Emergency checkpoint path.
    pub panic_path: PathBuf,
    /// Host directory the virtual filesystem mirrors.
    pub fs_root: PathBuf,
    /// Server log file; stderr when unset.
    pub syslog: Option<PathBuf>,
    /// Transaction log path.
    pub xlog_path: PathBuf,
    /// Soft cap on the transaction log, in bytes (0 = uncapped).
    pub xlog_size: u64,
    /// Temporary checkpoint path (renamed over save_path on success).
    pub tmpdb_path: PathBuf,
    /// Wire protocol; only "tcp" is implemented.
    pub protocol: String,
    pub port: u16,
    /// Daemonize after startup.
    pub detach: bool,
    /// Interface mode; `single` accepts one connection, `multi` many.
    pub single: bool,
    /// Cosmetic label.
    pub title: String,
    /// Soft cap on resident objects.
    pub cache_size: usize,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            load_path: PathBuf::from("world.db"),
            save_path: PathBuf::from("world.db"),
            panic_path: PathBuf::from("panic.db"),
            fs_root: PathBuf::from("world"),
            syslog: None,
            xlog_path: PathBuf::from("transact.log"),
            xlog_size: 0,
            tmpdb_path: PathBuf::from("tmp.db"),
            protocol: "tcp".to_string(),
            port: 4004,
            detach: false,
            single: false,
            title: "Tern".to_string(),
            cache_size: 64,
        }
    }
}

#[derive(Debug)]
pub struct ConfigError {
    pub line: usize,
    pub message: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "config line {}: {}", self.line, self.message)
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    /// Apply a config file over the current values.
    pub fn apply_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError {
            line: 0,
            message: format!("cannot read {}: {}", path.display(), e),
        })?;
        self.apply_text(&text)
    }

    pub fn apply_text(&mut self, text: &str) -> Result<(), ConfigError> {
        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let err = |message: String| ConfigError {
                line: lineno + 1,
                message,
            };
            let (key, value) = match line.split_once('=') {
                Some((k, v)) => (k.trim(), v.trim()),
                None => {
                    // Bare words toggle the boolean modes.
                    match line {
                        "detach" => {
                            self.detach = true;
                            continue;
                        }
                        "single" => {
                            self.single = true;
                            continue;
                        }
                        "multi" => {
                            self.single = false;
                            continue;
                        }
                        other => return Err(err(format!("expected key=value, got '{}'", other))),
                    }
                }
            };
            match key {
                "load" => self.load_path = PathBuf::from(value),
                "save" => self.save_path = PathBuf::from(value),
                "panic" => self.panic_path = PathBuf::from(value),
                "filesystem" => self.fs_root = PathBuf::from(value),
                "syslog" => self.syslog = Some(PathBuf::from(value)),
                "xlog" => self.xlog_path = PathBuf::from(value),
                "xlogsize" => {
                    self.xlog_size = value
                        .parse()
                        .map_err(|_| err(format!("bad xlogsize '{}'", value)))?
                }
                "tmpdb" => self.tmpdb_path = PathBuf::from(value),
                "protocol" => {
                    if value != "tcp" {
                        return Err(err(format!("unsupported protocol '{}'", value)));
                    }
                    self.protocol = value.to_string();
                }
                "port" => {
                    self.port = value
                        .parse()
                        .map_err(|_| err(format!("bad port '{}'", value)))?
                }
                "detach" => self.detach = value != "0",
                "single" => self.single = value != "0",
                "multi" => self.single = value == "0",
                "title" => self.title = value.to_string(),
                "cache" => {
                    self.cache_size = value
                        .parse()
                        .map_err(|_| err(format!("bad cache size '{}'", value)))?
                }
                other => return Err(err(format!("unknown key '{}'", other))),
            }
        }
        Ok(())
    }
}
