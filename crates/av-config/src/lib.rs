// av-config: Layered configuration with defined precedence.
//
// Sources, low to high: compiled-in defaults, the system file, the user
// file, the project file, then environment variables mapped through a fixed
// table.  Values are keyed by dotted paths ("section.subsection.key").
// A missing layer file is normal; a layer that fails to parse is skipped
// with an error log and the remaining layers still load.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use toml::Value;
use toml::value::Table;
use tracing::{debug, error};

/// Fixed environment-variable -> dotted-path overrides.
pub const ENV_OVERRIDES: &[(&str, &str)] = &[
    ("AVHUB_STORAGE_PATH", "system.storage_path"),
    ("AVHUB_LOG_LEVEL", "system.log_level"),
    ("AVHUB_STUN_SERVER", "streaming.webrtc.stun_server"),
    ("AVHUB_LOCAL_SCAN_INTERVAL", "local_devices.scan_interval"),
    ("AVHUB_NETWORK_SCAN_INTERVAL", "network_devices.scan_interval"),
];

/// Compiled-in defaults, lowest-precedence layer.
const DEFAULT_CONFIG: &str = r#"
[system]
storage_path = "storage"
log_level = "INFO"

[local_devices]
enable_video = true
enable_audio = true
auto_start = false
scan_interval = 60

[network_devices]
scan_interval = 60
discovery_enabled = true
discovery_methods = ["onvif", "upnp", "mdns"]

[streaming]
transcoder = "ffmpeg"

[streaming.rtsp]
port_start = 8554

[streaming.rtmp]
port_start = 1935
server = "nginx"

[streaming.webrtc]
port_start = 8080
stun_server = "stun://stun.l.google.com:19302"
transcoder = "gst-launch-1.0"
http_server = "python3"
"#;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("layer {0:?} cannot be written")]
    ReadOnlyLayer(ConfigLayer),
    #[error("invalid config path: {0}")]
    InvalidPath(String),
}

/// The writable file layers plus the two synthetic ends of the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConfigLayer {
    Defaults,
    System,
    User,
    Project,
    Env,
}

/// Filesystem locations of the three file layers.
#[derive(Debug, Clone)]
pub struct ConfigPaths {
    pub system: PathBuf,
    pub user: PathBuf,
    pub project: PathBuf,
}

impl Default for ConfigPaths {
    fn default() -> Self {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_owned());
        ConfigPaths {
            system: PathBuf::from("/etc/avhub/config.toml"),
            user: Path::new(&home).join(".config/avhub/config.toml"),
            project: PathBuf::from(".avhub/config.toml"),
        }
    }
}

pub struct ConfigStore {
    paths: ConfigPaths,
    layers: BTreeMap<ConfigLayer, Table>,
    merged: Table,
}

impl ConfigStore {
    /// Load from the standard locations and the process environment.
    pub fn load() -> Self {
        Self::load_from(ConfigPaths::default())
    }

    /// Load from explicit locations and the process environment.
    pub fn load_from(paths: ConfigPaths) -> Self {
        let env: Vec<(String, String)> = ENV_OVERRIDES
            .iter()
            .filter_map(|(var, path)| std::env::var(var).ok().map(|v| ((*path).to_owned(), v)))
            .collect();
        Self::build(paths, &env).reload_files()
    }

    /// Assemble a store from in-memory layer sources.  Used by tests and by
    /// callers that already hold the file contents.
    pub fn from_layers(
        system: Option<&str>,
        user: Option<&str>,
        project: Option<&str>,
        env: &[(&str, &str)],
    ) -> Self {
        let env: Vec<(String, String)> = env
            .iter()
            .map(|(path, value)| ((*path).to_owned(), (*value).to_owned()))
            .collect();
        let mut store = Self::build(ConfigPaths::default(), &env);
        store.set_layer_from_str(ConfigLayer::System, system);
        store.set_layer_from_str(ConfigLayer::User, user);
        store.set_layer_from_str(ConfigLayer::Project, project);
        store.remerge();
        store
    }

    fn build(paths: ConfigPaths, env: &[(String, String)]) -> Self {
        let mut layers = BTreeMap::new();
        let defaults: Table =
            toml::from_str(DEFAULT_CONFIG).expect("built-in defaults are valid TOML");
        layers.insert(ConfigLayer::Defaults, defaults);

        let mut env_table = Table::new();
        for (path, raw) in env {
            set_dotted(&mut env_table, path, coerce_env_value(raw));
        }
        layers.insert(ConfigLayer::Env, env_table);

        let mut store = ConfigStore {
            paths,
            layers,
            merged: Table::new(),
        };
        store.remerge();
        store
    }

    fn reload_files(mut self) -> Self {
        for layer in [ConfigLayer::System, ConfigLayer::User, ConfigLayer::Project] {
            if let Some(table) = read_layer_file(layer, self.layer_path(layer)) {
                self.layers.insert(layer, table);
            }
        }
        self.remerge();
        self
    }

    fn set_layer_from_str(&mut self, layer: ConfigLayer, source: Option<&str>) {
        let Some(source) = source else { return };
        match toml::from_str::<Table>(source) {
            Ok(table) => {
                self.layers.insert(layer, table);
            }
            Err(e) => error!(?layer, error = %e, "config layer failed to parse; skipping"),
        }
    }

    fn layer_path(&self, layer: ConfigLayer) -> &Path {
        match layer {
            ConfigLayer::System => &self.paths.system,
            ConfigLayer::User => &self.paths.user,
            ConfigLayer::Project => &self.paths.project,
            ConfigLayer::Defaults | ConfigLayer::Env => Path::new(""),
        }
    }

    fn remerge(&mut self) {
        let mut merged = Table::new();
        for table in self.layers.values() {
            merge_tables(&mut merged, table);
        }
        self.merged = merged;
    }

    /// Look up a value by dotted path across the merged layers.
    pub fn get(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('.');
        let first = parts.next()?;
        let mut current = self.merged.get(first)?;
        for part in parts {
            current = current.as_table()?.get(part)?;
        }
        Some(current)
    }

    pub fn str_or(&self, path: &str, default: &str) -> String {
        self.get(path)
            .and_then(Value::as_str)
            .unwrap_or(default)
            .to_owned()
    }

    pub fn int_or(&self, path: &str, default: i64) -> i64 {
        self.get(path).and_then(Value::as_integer).unwrap_or(default)
    }

    pub fn bool_or(&self, path: &str, default: bool) -> bool {
        self.get(path).and_then(Value::as_bool).unwrap_or(default)
    }

    pub fn float_or(&self, path: &str, default: f64) -> f64 {
        self.get(path)
            .and_then(|v| v.as_float().or_else(|| v.as_integer().map(|i| i as f64)))
            .unwrap_or(default)
    }

    pub fn str_list_or(&self, path: &str, default: &[&str]) -> Vec<String> {
        match self.get(path).and_then(Value::as_array) {
            Some(values) => values
                .iter()
                .filter_map(Value::as_str)
                .map(ToOwned::to_owned)
                .collect(),
            None => default.iter().map(|s| (*s).to_owned()).collect(),
        }
    }

    /// Write a value into a file layer (in memory).  The defaults and env
    /// layers are read-only.
    pub fn set(&mut self, path: &str, value: Value, layer: ConfigLayer) -> Result<(), ConfigError> {
        if matches!(layer, ConfigLayer::Defaults | ConfigLayer::Env) {
            return Err(ConfigError::ReadOnlyLayer(layer));
        }
        if path.is_empty() || path.split('.').any(str::is_empty) {
            return Err(ConfigError::InvalidPath(path.to_owned()));
        }
        let table = self.layers.entry(layer).or_default();
        set_dotted(table, path, value);
        self.remerge();
        Ok(())
    }

    /// Serialize one file layer back to its path.  Lower layers are never
    /// rewritten.
    pub fn save(&self, layer: ConfigLayer) -> Result<(), ConfigError> {
        if matches!(layer, ConfigLayer::Defaults | ConfigLayer::Env) {
            return Err(ConfigError::ReadOnlyLayer(layer));
        }
        let path = self.layer_path(layer);
        let table = self.layers.get(&layer).cloned().unwrap_or_default();
        let rendered = toml::to_string_pretty(&Value::Table(table))
            .map_err(|e| ConfigError::Parse(e.to_string()))?;
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .map_err(|e| ConfigError::Io(format!("creating '{}': {e}", parent.display())))?;
        }
        std::fs::write(path, rendered)
            .map_err(|e| ConfigError::Io(format!("writing '{}': {e}", path.display())))?;
        debug!(?layer, path = %path.display(), "config layer saved");
        Ok(())
    }
}

fn read_layer_file(layer: ConfigLayer, path: &Path) -> Option<Table> {
    if path.as_os_str().is_empty() || !path.exists() {
        return None;
    }
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) => {
            error!(?layer, path = %path.display(), error = %e, "config layer unreadable; skipping");
            return None;
        }
    };
    match toml::from_str::<Table>(&raw) {
        Ok(table) => {
            debug!(?layer, path = %path.display(), "config layer loaded");
            Some(table)
        }
        Err(e) => {
            error!(?layer, path = %path.display(), error = %e, "config layer failed to parse; skipping");
            None
        }
    }
}

/// Recursive table merge: `src` values override `dest`, tables merge deep.
fn merge_tables(dest: &mut Table, src: &Table) {
    for (key, value) in src {
        match (dest.get_mut(key), value) {
            (Some(Value::Table(d)), Value::Table(s)) => merge_tables(d, s),
            (_, v) => {
                dest.insert(key.clone(), v.clone());
            }
        }
    }
}

fn set_dotted(table: &mut Table, path: &str, value: Value) {
    let mut parts = path.split('.').peekable();
    let mut current = table;
    while let Some(part) = parts.next() {
        if parts.peek().is_none() {
            current.insert(part.to_owned(), value);
            return;
        }
        let entry = current
            .entry(part.to_owned())
            .or_insert_with(|| Value::Table(Table::new()));
        if !entry.is_table() {
            // A scalar in the way of a deeper path is replaced by a table.
            *entry = Value::Table(Table::new());
        }
        current = entry.as_table_mut().expect("entry was just made a table");
    }
}

/// Coerce an environment string: booleans, then integers, then floats with
/// exactly one dot, else a plain string.
fn coerce_env_value(raw: &str) -> Value {
    match raw.to_ascii_lowercase().as_str() {
        "true" => return Value::Boolean(true),
        "false" => return Value::Boolean(false),
        _ => {}
    }
    if !raw.is_empty() && raw.chars().all(|c| c.is_ascii_digit()) {
        if let Ok(n) = raw.parse::<i64>() {
            return Value::Integer(n);
        }
    }
    let digits_only = raw.replace('.', "");
    if raw.matches('.').count() == 1
        && !digits_only.is_empty()
        && digits_only.chars().all(|c| c.is_ascii_digit())
    {
        if let Ok(f) = raw.parse::<f64>() {
            return Value::Float(f);
        }
    }
    Value::String(raw.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_complete() {
        let cfg = ConfigStore::from_layers(None, None, None, &[]);
        assert_eq!(cfg.str_or("system.storage_path", ""), "storage");
        assert_eq!(cfg.str_or("system.log_level", ""), "INFO");
        assert!(cfg.bool_or("local_devices.enable_video", false));
        assert!(cfg.bool_or("local_devices.enable_audio", false));
        assert!(!cfg.bool_or("local_devices.auto_start", true));
        assert_eq!(cfg.int_or("local_devices.scan_interval", 0), 60);
        assert_eq!(cfg.int_or("network_devices.scan_interval", 0), 60);
        assert!(cfg.bool_or("network_devices.discovery_enabled", false));
        assert_eq!(
            cfg.str_list_or("network_devices.discovery_methods", &[]),
            vec!["onvif", "upnp", "mdns"]
        );
        assert_eq!(cfg.int_or("streaming.rtsp.port_start", 0), 8554);
        assert_eq!(cfg.int_or("streaming.rtmp.port_start", 0), 1935);
        assert_eq!(cfg.int_or("streaming.webrtc.port_start", 0), 8080);
        assert_eq!(
            cfg.str_or("streaming.webrtc.stun_server", ""),
            "stun://stun.l.google.com:19302"
        );
    }

    #[test]
    fn higher_layers_win() {
        let cfg = ConfigStore::from_layers(
            Some("[system]\nstorage_path = \"/srv/system\""),
            Some("[system]\nstorage_path = \"/home/user/avhub\""),
            Some("[system]\nstorage_path = \"./project\""),
            &[],
        );
        assert_eq!(cfg.str_or("system.storage_path", ""), "./project");
    }

    #[test]
    fn env_layer_wins_over_all_files() {
        let cfg = ConfigStore::from_layers(
            None,
            None,
            Some("[system]\nstorage_path = \"./project\""),
            &[("system.storage_path", "/env/wins")],
        );
        assert_eq!(cfg.str_or("system.storage_path", ""), "/env/wins");
    }

    #[test]
    fn merge_is_deep_not_wholesale() {
        let cfg = ConfigStore::from_layers(
            None,
            None,
            Some("[streaming.rtsp]\nport_start = 9554"),
            &[],
        );
        // Sibling sections from the defaults survive the project override.
        assert_eq!(cfg.int_or("streaming.rtsp.port_start", 0), 9554);
        assert_eq!(cfg.int_or("streaming.rtmp.port_start", 0), 1935);
    }

    #[test]
    fn broken_layer_is_skipped_others_load() {
        let cfg = ConfigStore::from_layers(
            Some("[system]\nstorage_path = \"/srv/system\""),
            Some("this is { not toml"),
            None,
            &[],
        );
        assert_eq!(cfg.str_or("system.storage_path", ""), "/srv/system");
    }

    #[test]
    fn env_values_are_coerced() {
        assert_eq!(coerce_env_value("true"), Value::Boolean(true));
        assert_eq!(coerce_env_value("False"), Value::Boolean(false));
        assert_eq!(coerce_env_value("8554"), Value::Integer(8554));
        assert_eq!(coerce_env_value("0.5"), Value::Float(0.5));
        assert_eq!(
            coerce_env_value("1.2.3"),
            Value::String("1.2.3".to_owned())
        );
        assert_eq!(
            coerce_env_value("stun://host:3478"),
            Value::String("stun://host:3478".to_owned())
        );
        assert_eq!(coerce_env_value(""), Value::String(String::new()));
    }

    #[test]
    fn set_and_get_dotted_paths() {
        let mut cfg = ConfigStore::from_layers(None, None, None, &[]);
        cfg.set(
            "streaming.webrtc.stun_server",
            Value::String("stun://internal:3478".to_owned()),
            ConfigLayer::Project,
        )
        .unwrap();
        assert_eq!(
            cfg.str_or("streaming.webrtc.stun_server", ""),
            "stun://internal:3478"
        );
        assert!(cfg.get("no.such.path").is_none());
    }

    #[test]
    fn defaults_and_env_layers_are_read_only() {
        let mut cfg = ConfigStore::from_layers(None, None, None, &[]);
        assert!(matches!(
            cfg.set("a.b", Value::Integer(1), ConfigLayer::Defaults),
            Err(ConfigError::ReadOnlyLayer(_))
        ));
        assert!(matches!(
            cfg.save(ConfigLayer::Env),
            Err(ConfigError::ReadOnlyLayer(_))
        ));
    }

    #[test]
    fn save_writes_only_the_chosen_layer() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ConfigPaths {
            system: dir.path().join("system.toml"),
            user: dir.path().join("user.toml"),
            project: dir.path().join("project.toml"),
        };
        let mut cfg = ConfigStore::load_from(paths.clone());
        cfg.set(
            "system.storage_path",
            Value::String("/writable".to_owned()),
            ConfigLayer::Project,
        )
        .unwrap();
        cfg.save(ConfigLayer::Project).unwrap();

        assert!(paths.project.exists());
        assert!(!paths.system.exists());
        assert!(!paths.user.exists());

        let written = std::fs::read_to_string(&paths.project).unwrap();
        assert!(written.contains("/writable"));
    }

    #[test]
    fn files_load_through_load_from() {
        let dir = tempfile::tempdir().unwrap();
        let project = dir.path().join("project.toml");
        std::fs::write(&project, "[system]\nlog_level = \"DEBUG\"").unwrap();
        let cfg = ConfigStore::load_from(ConfigPaths {
            system: dir.path().join("missing-system.toml"),
            user: dir.path().join("missing-user.toml"),
            project,
        });
        assert_eq!(cfg.str_or("system.log_level", ""), "DEBUG");
    }
}
