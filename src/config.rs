use crate::error::ConfigError;
use crate::expand::{expand_str, expand_table, local_vars, Vars};
use serde::{Deserialize, Deserializer};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use toml::{Table, Value};

/// One fully expanded configuration snapshot.
///
/// A new snapshot is built from the file on every reload and never mutated
/// afterwards.
#[derive(Debug, Clone)]
pub struct GlobalConfig {
    /// Listening port (0 picks an ephemeral port)
    pub port: u16,

    /// Number of worker processes sharing the listening socket
    pub processes: usize,

    /// Path of the PID file written by the supervisor at startup
    pub pid_file: Option<PathBuf>,

    /// Log destination settings
    pub logger: LoggerConfig,

    /// Named partial service blocks, unexpanded
    pub templates: HashMap<String, Table>,

    /// Expanded service instances in configuration order
    pub services: Vec<ServiceConfig>,
}

/// Top-level scalar settings, deserialized after expansion
#[derive(Debug, Deserialize)]
struct TopLevel {
    port: u16,
    processes: usize,
    pid_file: Option<PathBuf>,
    #[serde(default)]
    logger: LoggerConfig,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct LoggerConfig {
    /// Write log lines at all (default: true)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Include debug-level events (default: false)
    #[serde(default)]
    pub debug: bool,

    /// Log file path, or "-" for standard output (default: "-")
    #[serde(default = "default_log_file")]
    pub file: String,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            debug: false,
            file: default_log_file(),
        }
    }
}

/// Configuration for a single service instance
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ServiceConfig {
    /// Service identity (the instance name for multi-instance blocks)
    pub name: String,

    /// URI prefix routed to this service (default: "/")
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// Prepended to the request path after the prefix is stripped
    pub replace_prefix: Option<String>,

    /// Application manifest file
    pub file: PathBuf,

    /// Binding in the manifest that is the application (default: "application")
    #[serde(default = "default_entry_point")]
    pub application: String,

    /// Binding in the manifest used as a factory; takes precedence over `application`
    pub create: Option<String>,

    /// Arguments handed to the factory binding
    pub args: Option<Value>,

    /// Maximum concurrently executing requests (default: 5)
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Maximum queued plus executing requests (default: 10)
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Per-request timeout in seconds (default: 10)
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// Files whose modification triggers a reload of this service
    #[serde(default, deserialize_with = "one_or_many")]
    pub touch_reload: Vec<PathBuf>,

    /// Directories searched for programs the application runs
    #[serde(default, alias = "python_path", deserialize_with = "one_or_many")]
    pub search_path: Vec<PathBuf>,

    /// Environment overrides applied while loading and running the application
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Template this block was merged with, if any
    pub template: Option<String>,
}

impl ServiceConfig {
    /// Create a service config with defaults for everything but identity and file
    pub fn new(name: &str, file: impl Into<PathBuf>) -> Self {
        Self {
            name: name.to_string(),
            prefix: default_prefix(),
            replace_prefix: None,
            file: file.into(),
            application: default_entry_point(),
            create: None,
            args: None,
            max_workers: default_max_workers(),
            queue_capacity: default_queue_capacity(),
            timeout: default_timeout(),
            touch_reload: Vec::new(),
            search_path: Vec::new(),
            env: HashMap::new(),
            template: None,
        }
    }

    /// Set the routed prefix (builder pattern)
    pub fn with_prefix(mut self, prefix: &str) -> Self {
        self.prefix = prefix.to_string();
        self
    }

    /// Set pool limits (builder pattern)
    pub fn with_limits(mut self, max_workers: usize, queue_capacity: usize) -> Self {
        self.max_workers = max_workers;
        self.queue_capacity = queue_capacity;
        self
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if !self.prefix.starts_with('/') {
            errors.push(format!(
                "Service '{}': 'prefix' must start with '/' (got '{}')",
                self.name, self.prefix
            ));
        }
        if self.max_workers == 0 {
            errors.push(format!("Service '{}': 'max_workers' must be greater than 0", self.name));
        }
        if self.queue_capacity == 0 {
            errors.push(format!(
                "Service '{}': 'queue_capacity' must be greater than 0",
                self.name
            ));
        }
        if self.timeout == 0 {
            errors.push(format!("Service '{}': 'timeout' must be greater than 0", self.name));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<PathBuf>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(PathBuf),
        Many(Vec<PathBuf>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(path) => vec![path],
        OneOrMany::Many(paths) => paths,
    })
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_log_file() -> String {
    "-".to_string()
}

fn default_prefix() -> String {
    "/".to_string()
}

fn default_entry_point() -> String {
    "application".to_string()
}

fn default_max_workers() -> usize {
    5
}

fn default_queue_capacity() -> usize {
    10
}

fn default_timeout() -> u64 {
    10
}

impl GlobalConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content, path)
    }

    /// Parse, expand and validate configuration text. `origin` is only used in errors.
    pub fn parse(content: &str, origin: &Path) -> Result<Self, ConfigError> {
        let mut root: Table = toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: origin.to_path_buf(),
            source,
        })?;

        let templates = take_templates(&mut root)?;
        let service_blocks = take_services(&mut root)?;

        let vars = local_vars(&root, &Vars::new());
        let top: TopLevel = Value::Table(expand_table(&root, &Vars::new()))
            .try_into()
            .map_err(ConfigError::Global)?;

        let mut services = Vec::new();
        for (index, block) in service_blocks.into_iter().enumerate() {
            services.extend(build_instances(index, block, &templates, &vars)?);
        }

        let config = GlobalConfig {
            port: top.port,
            processes: top.processes,
            pid_file: top.pid_file,
            logger: top.logger,
            templates,
            services,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if self.processes == 0 {
            errors.push("'processes' must be greater than 0".to_string());
        }

        let mut seen = HashSet::new();
        for service in &self.services {
            if !seen.insert(service.name.as_str()) {
                errors.push(format!("Service '{}' is defined more than once", service.name));
            }
            if let Err(mut e) = service.validate() {
                errors.append(&mut e);
            }
        }

        if !errors.is_empty() {
            return Err(ConfigError::Invalid(errors));
        }

        Ok(())
    }

    pub fn service_names(&self) -> Vec<&str> {
        self.services.iter().map(|s| s.name.as_str()).collect()
    }
}

fn take_templates(root: &mut Table) -> Result<HashMap<String, Table>, ConfigError> {
    let Some(value) = root.remove("templates") else {
        return Ok(HashMap::new());
    };
    let Value::Table(entries) = value else {
        return Err(ConfigError::Invalid(vec!["'templates' must be a table".to_string()]));
    };

    let mut templates = HashMap::new();
    let mut errors = Vec::new();
    for (name, entry) in entries {
        match entry {
            Value::Table(t) => {
                templates.insert(name, t);
            }
            _ => errors.push(format!("Template '{}' must be a table", name)),
        }
    }

    if errors.is_empty() {
        Ok(templates)
    } else {
        Err(ConfigError::Invalid(errors))
    }
}

fn take_services(root: &mut Table) -> Result<Vec<Table>, ConfigError> {
    let Some(value) = root.remove("services") else {
        return Ok(Vec::new());
    };
    let Value::Array(blocks) = value else {
        return Err(ConfigError::Invalid(vec![
            "'services' must be an array of tables".to_string(),
        ]));
    };

    blocks
        .into_iter()
        .enumerate()
        .map(|(index, block)| match block {
            Value::Table(t) => Ok(t),
            _ => Err(ConfigError::Invalid(vec![format!(
                "Service block #{} must be a table",
                index
            )])),
        })
        .collect()
}

/// Merge a block with its template and expand it once per instance name.
fn build_instances(
    index: usize,
    block: Table,
    templates: &HashMap<String, Table>,
    vars: &Vars,
) -> Result<Vec<ServiceConfig>, ConfigError> {
    let merged = match block.get("template").and_then(Value::as_str) {
        Some(template_name) => {
            let template_name = expand_str(template_name, vars);
            let template = templates.get(&template_name).ok_or_else(|| {
                ConfigError::UnknownTemplate {
                    index,
                    template: template_name.clone(),
                }
            })?;
            let mut merged = template.clone();
            merged.extend(block);
            merged
        }
        None => block,
    };

    let names: Vec<String> = match merged.get("names").and_then(Value::as_array) {
        Some(list) => {
            let mut names = Vec::with_capacity(list.len());
            let mut errors = Vec::new();
            for (position, entry) in list.iter().enumerate() {
                match entry.as_str() {
                    Some(name) => names.push(name.to_string()),
                    None => errors.push(format!(
                        "Service block #{}: names[{}] must be a string, got {}",
                        index, position, entry
                    )),
                }
            }
            if !errors.is_empty() {
                return Err(ConfigError::Invalid(errors));
            }
            names
        }
        None => merged
            .get("name")
            .and_then(Value::as_str)
            .map(|n| vec![n.to_string()])
            .unwrap_or_default(),
    };

    if names.is_empty() {
        return Err(ConfigError::Invalid(vec![format!(
            "Service block #{} needs a 'name' or a non-empty 'names' list",
            index
        )]));
    }

    names
        .into_iter()
        .map(|name| {
            let mut instance = merged.clone();
            instance.remove("names");
            instance.insert("name".to_string(), Value::String(name.clone()));
            instance.insert("service_name".to_string(), Value::String(name));

            Value::Table(expand_table(&instance, vars))
                .try_into()
                .map_err(|source| ConfigError::Service { index, source })
        })
        .collect()
}

/// Modification time of a file, `None` when it is missing or unreadable
pub fn modified_time(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}
