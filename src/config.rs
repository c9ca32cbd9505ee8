//! Flat `key = value` configuration file loader.
//!
//! Loading is infallible by design: a missing file, an unreadable line, or an
//! out-of-range value all degrade to a default with a `tracing::warn!`,
//! never abort startup.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub addr: u16,
    pub width: u32,
    pub height: u32,
    pub framerate: u32,
    pub rotation: u32,
    pub bitrate: u32,
    pub cors_origin: String,
    pub recording_dir: Option<PathBuf>,
    pub recording_skip_conversion: bool,
    pub recording_max_minutes: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: 8765,
            width: 1280,
            height: 720,
            framerate: 30,
            rotation: 180,
            bitrate: 0,
            cors_origin: "*".to_string(),
            recording_dir: None,
            recording_skip_conversion: false,
            recording_max_minutes: 60,
        }
    }
}

impl ServerConfig {
    /// Parses `path`, falling back to built-in defaults for anything missing
    /// or rejected. Never returns an error.
    pub fn load(path: &Path) -> Self {
        let mut config = Self::default();

        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "could not read config file, using defaults");
                return config;
            }
        };

        for (line_no, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                warn!(line = line_no + 1, "ignoring malformed config line (no '=')");
                continue;
            };
            let key = key.trim();
            let value = unquote(value.trim());
            config.apply(key, value, line_no + 1);
        }

        if config.cors_origin == "*" {
            warn!("cors_origin defaulted to \"*\"; restrict this for production deployments");
        }

        info!(?config, "effective configuration");
        config
    }

    fn apply(&mut self, key: &str, value: &str, line_no: usize) {
        match key {
            "addr" => self.addr = clamp_parse(value, key, line_no, 1, 65535, self.addr),
            "width" => self.width = clamp_parse(value, key, line_no, 1, u32::MAX, self.width),
            "height" => self.height = clamp_parse(value, key, line_no, 1, u32::MAX, self.height),
            "framerate" => self.framerate = clamp_parse(value, key, line_no, 1, 120, self.framerate),
            "rotation" => {
                let rotation = clamp_parse(value, key, line_no, 0, 270, self.rotation);
                self.rotation = if matches!(rotation, 0 | 90 | 180 | 270) {
                    rotation
                } else {
                    warn!(key, value = rotation, "rotation must be one of 0/90/180/270, using default");
                    self.rotation
                };
            }
            "bitrate" => self.bitrate = clamp_parse(value, key, line_no, 0, u32::MAX, self.bitrate),
            "cors_origin" => self.cors_origin = value.to_string(),
            // Existence/writability is not checked here: `Recorder::new` owns
            // that, retrying a few times before disabling recording, since a
            // directory that isn't mounted yet at config-load time may still
            // appear shortly after this process starts.
            "recording_dir" => self.recording_dir = Some(PathBuf::from(value)),
            "recording_skip_conversion" => {
                self.recording_skip_conversion = clamp_parse_bool(value, key, line_no, self.recording_skip_conversion)
            }
            "recording_max_minutes" => {
                self.recording_max_minutes = clamp_parse(value, key, line_no, 1, 24 * 60, self.recording_max_minutes)
            }
            _ => debug!(key, line = line_no, "ignoring unknown config key"),
        }
    }
}

/// Strips one layer of matching surrounding quotes (`"` or `'`).
fn unquote(value: &str) -> &str {
    let bytes = value.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'') {
            return &value[1..value.len() - 1];
        }
    }
    value
}

/// Parses `value` as `T`, clamps into `[min, max]`, and warns (substituting
/// `default`) on either a parse failure or an out-of-range value.
fn clamp_parse<T>(value: &str, key: &str, line_no: usize, min: T, max: T, default: T) -> T
where
    T: FromStr + PartialOrd + Copy + std::fmt::Display,
{
    match value.parse::<T>() {
        Ok(parsed) if parsed < min || parsed > max => {
            warn!(key, line = line_no, value, "value out of range, using default {default}");
            default
        }
        Ok(parsed) => parsed,
        Err(_) => {
            warn!(key, line = line_no, value, "value could not be parsed, using default {default}");
            default
        }
    }
}

fn clamp_parse_bool(value: &str, key: &str, line_no: usize, default: bool) -> bool {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => true,
        "false" | "0" | "no" => false,
        _ => {
            warn!(key, line = line_no, value, "value could not be parsed as bool, using default {default}");
            default
        }
    }
}

impl std::fmt::Display for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "addr={} {}x{}@{}fps rotation={} bitrate={} cors_origin={} recording_dir={:?} max_minutes={}",
            self.addr,
            self.width,
            self.height,
            self.framerate,
            self.rotation,
            self.bitrate,
            self.cors_origin,
            self.recording_dir,
            self.recording_max_minutes
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("one-cam.conf");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        (dir, path)
    }

    #[test]
    fn missing_file_yields_defaults() {
        let config = ServerConfig::load(Path::new("/nonexistent/one-cam.conf"));
        assert_eq!(config.addr, 8765);
        assert_eq!(config.framerate, 30);
    }

    #[test]
    fn parses_recognized_keys_and_ignores_unknown_ones_and_comments() {
        let (_dir, path) = write_config(
            "# a comment\n\
             addr = 9000\n\
             framerate=60\n\
             cors_origin = \"https://example.com\"\n\
             some_unknown_key = 42\n\
             \n",
        );
        let config = ServerConfig::load(&path);
        assert_eq!(config.addr, 9000);
        assert_eq!(config.framerate, 60);
        assert_eq!(config.cors_origin, "https://example.com");
    }

    #[test]
    fn out_of_range_values_clamp_to_default() {
        let (_dir, path) = write_config("framerate = 500\naddr = 0\nrotation = 45\n");
        let config = ServerConfig::load(&path);
        assert_eq!(config.framerate, 30);
        assert_eq!(config.addr, 8765);
        assert_eq!(config.rotation, 180);
    }

    #[test]
    fn malformed_value_degrades_to_default_without_aborting() {
        let (_dir, path) = write_config("framerate = not-a-number\n");
        let config = ServerConfig::load(&path);
        assert_eq!(config.framerate, 30);
    }

    #[test]
    fn recording_dir_is_accepted_unvalidated_at_config_load_time() {
        // Existence/writability is validated later by `Recorder::new`, with
        // retries, not at config-parse time.
        let (_dir, path) = write_config("recording_dir = /nonexistent/path\n");
        let config = ServerConfig::load(&path);
        assert_eq!(config.recording_dir, Some(PathBuf::from("/nonexistent/path")));
    }
}
