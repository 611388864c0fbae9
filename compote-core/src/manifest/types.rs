//! Compose file format types.
//!
//! Typed model of the compose document. Polymorphic fields (string-or-list,
//! string-or-object, bool-or-object) are modeled as untagged enums with
//! normalization accessors rather than loose values.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Root structure of a compose file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComposeFile {
    /// Compose file format version (e.g., "3.8"). Informational only.
    #[serde(default)]
    pub version: Option<String>,

    /// Services to be created.
    #[serde(default)]
    pub services: BTreeMap<String, Service>,

    /// Named volumes.
    #[serde(default)]
    pub volumes: BTreeMap<String, VolumeDefinition>,

    /// Networks.
    #[serde(default)]
    pub networks: BTreeMap<String, NetworkDefinition>,

    /// Top-level config files.
    #[serde(default)]
    pub configs: BTreeMap<String, FileObjectDefinition>,

    /// Top-level secret files.
    #[serde(default)]
    pub secrets: BTreeMap<String, FileObjectDefinition>,
}

impl ComposeFile {
    /// Look up a service by name.
    pub fn service(&self, name: &str) -> Option<&Service> {
        self.services.get(name)
    }

    /// Service names in deterministic (ascending) order.
    pub fn service_names(&self) -> Vec<String> {
        self.services.keys().cloned().collect()
    }
}

/// A service in a compose file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Service {
    /// Container image reference. Passed to the image capability verbatim.
    #[serde(default)]
    pub image: Option<String>,

    /// Build configuration, used when `image` is absent (or to produce it).
    #[serde(default)]
    pub build: Option<BuildSpec>,

    /// Hostname inside the container (defaults to the service name).
    #[serde(default)]
    pub hostname: Option<String>,

    /// Working directory inside the container.
    #[serde(default)]
    pub working_dir: Option<String>,

    /// User to run as.
    #[serde(default)]
    pub user: Option<String>,

    /// Override the default command.
    #[serde(default)]
    pub command: Option<Command>,

    /// Override the default entrypoint.
    #[serde(default)]
    pub entrypoint: Option<Command>,

    /// Environment variables.
    #[serde(default)]
    pub environment: Environment,

    /// One or more env files loaded before `environment`.
    #[serde(default, rename = "env_file")]
    pub env_file: Option<EnvFiles>,

    /// Port mappings (e.g., `["8080:80", "53:53/udp"]`).
    #[serde(default)]
    pub ports: Vec<String>,

    /// Volume mounts (`src:dst[:ro]`).
    #[serde(default)]
    pub volumes: Vec<String>,

    /// Tmpfs mount targets.
    #[serde(default)]
    pub tmpfs: Option<StringOrList>,

    /// Config file references.
    #[serde(default)]
    pub configs: Vec<ServiceConfigRef>,

    /// Secret file references.
    #[serde(default)]
    pub secrets: Vec<ServiceSecretRef>,

    /// Services this service depends on.
    #[serde(default)]
    pub depends_on: DependsOn,

    /// Container healthcheck.
    #[serde(default)]
    pub healthcheck: Option<Healthcheck>,

    /// Deployment configuration (replicas, resource limits).
    #[serde(default)]
    pub deploy: Option<DeployConfig>,

    /// Restart policy string (e.g., "always").
    #[serde(default)]
    pub restart: Option<String>,

    /// Metadata labels.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    /// Profiles this service belongs to.
    #[serde(default)]
    pub profiles: Vec<String>,

    /// Logging configuration.
    #[serde(default)]
    pub logging: Option<LoggingConfig>,
}

impl Service {
    /// Requested replica count (defaults to 1).
    pub fn replicas(&self) -> u32 {
        self.deploy.as_ref().and_then(|d| d.replicas).unwrap_or(1).max(1)
    }

    /// Names of services this service depends on.
    pub fn dependencies(&self) -> Vec<&str> {
        self.depends_on.services()
    }
}

/// A command can be specified as a single line or an argv list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Command {
    /// One line, split on whitespace when normalized.
    Line(String),
    /// Argv list used verbatim.
    Args(Vec<String>),
}

impl Command {
    /// Normalize to an argv list.
    pub fn to_args(&self) -> Vec<String> {
        match self {
            Command::Line(line) => line.split_whitespace().map(str::to_string).collect(),
            Command::Args(args) => args.clone(),
        }
    }
}

/// A plain string-or-list field (tmpfs targets and the like).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StringOrList {
    Single(String),
    Multiple(Vec<String>),
}

impl StringOrList {
    /// Normalize to a list.
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            StringOrList::Single(s) => vec![s.clone()],
            StringOrList::Multiple(v) => v.clone(),
        }
    }
}

/// Environment variables can be specified as a map or list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Environment {
    /// Environment as key-value map.
    Map(BTreeMap<String, String>),
    /// Environment as list of KEY=value strings.
    List(Vec<String>),
}

impl Default for Environment {
    fn default() -> Self {
        Environment::Map(BTreeMap::new())
    }
}

impl Environment {
    /// Convert environment to a map regardless of input format.
    pub fn to_map(&self) -> BTreeMap<String, String> {
        match self {
            Environment::Map(map) => map.clone(),
            Environment::List(list) => list
                .iter()
                .filter_map(|s| {
                    s.split_once('=').map(|(k, v)| (k.to_string(), v.to_string()))
                })
                .collect(),
        }
    }
}

/// One or more env file paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EnvFiles {
    Single(String),
    Multiple(Vec<String>),
}

impl EnvFiles {
    /// Normalize to a list of paths.
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            EnvFiles::Single(p) => vec![p.clone()],
            EnvFiles::Multiple(ps) => ps.clone(),
        }
    }
}

/// `depends_on` accepts a bare list of names or a map with per-dependency options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DependsOn {
    List(Vec<String>),
    Map(BTreeMap<String, DependsOnSpec>),
}

impl Default for DependsOn {
    fn default() -> Self {
        DependsOn::List(Vec::new())
    }
}

impl DependsOn {
    /// Names of the dependencies, in declaration order for the list form and
    /// ascending order for the map form.
    pub fn services(&self) -> Vec<&str> {
        match self {
            DependsOn::List(names) => names.iter().map(String::as_str).collect(),
            DependsOn::Map(map) => map.keys().map(String::as_str).collect(),
        }
    }

    /// Whether `dep` must reach healthy status before this service starts.
    pub fn requires_healthy(&self, dep: &str) -> bool {
        match self {
            DependsOn::List(_) => false,
            DependsOn::Map(map) => map
                .get(dep)
                .map(|spec| spec.condition == DependsOnCondition::ServiceHealthy)
                .unwrap_or(false),
        }
    }
}

/// Per-dependency options for the map form of `depends_on`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DependsOnSpec {
    #[serde(default)]
    pub condition: DependsOnCondition,

    /// Restart this service when the dependency is restarted.
    #[serde(default)]
    pub restart: bool,
}

/// Start condition for a dependency.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependsOnCondition {
    #[default]
    ServiceStarted,
    ServiceHealthy,
}

/// Container healthcheck configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Healthcheck {
    /// Test command. A string is split on whitespace; a list is used verbatim.
    #[serde(default)]
    pub test: Option<Command>,

    /// Time between probes (e.g., "5s", "1m"). Default 30s.
    #[serde(default)]
    pub interval: Option<String>,

    /// Per-probe timeout. Default 30s.
    #[serde(default)]
    pub timeout: Option<String>,

    /// Probe attempts before the service is marked unhealthy. Default 3.
    #[serde(default)]
    pub retries: Option<u32>,

    /// Grace period before the first probe. Default 0s.
    #[serde(default)]
    pub start_period: Option<String>,

    /// Disable the check entirely.
    #[serde(default)]
    pub disable: bool,
}

/// Deployment configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeployConfig {
    /// Number of replicas to run.
    #[serde(default)]
    pub replicas: Option<u32>,

    /// Resource limits.
    #[serde(default)]
    pub resources: Option<Resources>,

    /// Restart policy.
    #[serde(default)]
    pub restart_policy: Option<RestartPolicy>,
}

/// Resource configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Resources {
    /// Resource limits (maximum).
    #[serde(default)]
    pub limits: Option<ResourceLimit>,
}

impl Resources {
    /// CPU limit as a whole core count (floor of the parsed decimal).
    pub fn cpu_count(&self) -> Option<u32> {
        self.limits.as_ref().and_then(|l| l.cpus.as_deref()).and_then(parse_cpu_count)
    }

    /// Memory limit in bytes.
    pub fn memory_bytes(&self) -> Option<u64> {
        self.limits.as_ref().and_then(|l| l.memory.as_deref()).and_then(parse_memory_bytes)
    }
}

/// Resource limits for CPU and memory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceLimit {
    /// CPU limit (e.g., "2.0" for 2 cores).
    #[serde(default)]
    pub cpus: Option<String>,

    /// Memory limit (e.g., "1024M", "1G").
    #[serde(default)]
    pub memory: Option<String>,
}

/// Restart policy under `deploy`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RestartPolicy {
    #[serde(default)]
    pub condition: Option<String>,
}

/// Build configuration: a bare context path or the full form.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BuildSpec {
    /// Shorthand: just the context directory.
    Path(String),
    /// Full build configuration.
    Full(BuildConfig),
}

impl BuildSpec {
    /// Build context directory.
    pub fn context(&self) -> &str {
        match self {
            BuildSpec::Path(path) => path,
            BuildSpec::Full(config) => &config.context,
        }
    }

    /// Dockerfile name relative to the context.
    pub fn dockerfile(&self) -> &str {
        match self {
            BuildSpec::Path(_) => "Dockerfile",
            BuildSpec::Full(config) => config.dockerfile.as_deref().unwrap_or("Dockerfile"),
        }
    }

    /// Build arguments.
    pub fn args(&self) -> BTreeMap<String, String> {
        match self {
            BuildSpec::Path(_) => BTreeMap::new(),
            BuildSpec::Full(config) => config.args.to_map(),
        }
    }

    /// Target build stage.
    pub fn target(&self) -> Option<&str> {
        match self {
            BuildSpec::Path(_) => None,
            BuildSpec::Full(config) => config.target.as_deref(),
        }
    }
}

/// Full build configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildConfig {
    /// Build context directory.
    pub context: String,

    /// Dockerfile name relative to the context.
    #[serde(default)]
    pub dockerfile: Option<String>,

    /// Build arguments (map or KEY=value list).
    #[serde(default)]
    pub args: Environment,

    /// Target build stage.
    #[serde(default)]
    pub target: Option<String>,
}

/// A service-level config reference: a bare name or `{ source, target }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServiceConfigRef {
    Name(String),
    Detailed {
        source: String,
        #[serde(default)]
        target: Option<String>,
    },
}

impl ServiceConfigRef {
    /// Name of the referenced top-level config.
    pub fn source(&self) -> &str {
        match self {
            ServiceConfigRef::Name(name) => name,
            ServiceConfigRef::Detailed { source, .. } => source,
        }
    }

    /// Explicit mount target, if any.
    pub fn target(&self) -> Option<&str> {
        match self {
            ServiceConfigRef::Name(_) => None,
            ServiceConfigRef::Detailed { target, .. } => target.as_deref(),
        }
    }
}

/// A service-level secret reference: a bare name or `{ source, target }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServiceSecretRef {
    Name(String),
    Detailed {
        source: String,
        #[serde(default)]
        target: Option<String>,
    },
}

impl ServiceSecretRef {
    /// Name of the referenced top-level secret.
    pub fn source(&self) -> &str {
        match self {
            ServiceSecretRef::Name(name) => name,
            ServiceSecretRef::Detailed { source, .. } => source,
        }
    }

    /// Explicit mount target, if any.
    pub fn target(&self) -> Option<&str> {
        match self {
            ServiceSecretRef::Name(_) => None,
            ServiceSecretRef::Detailed { target, .. } => target.as_deref(),
        }
    }
}

/// `external` is either a bare flag or an object with an optional name alias.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum External {
    Flag(bool),
    Named {
        #[serde(default)]
        name: Option<String>,
    },
}

impl Default for External {
    fn default() -> Self {
        External::Flag(false)
    }
}

impl External {
    /// Whether the resource is externally managed.
    pub fn is_external(&self) -> bool {
        match self {
            External::Flag(flag) => *flag,
            External::Named { .. } => true,
        }
    }

    /// External name alias, if given.
    pub fn alias(&self) -> Option<&str> {
        match self {
            External::Flag(_) => None,
            External::Named { name } => name.as_deref(),
        }
    }
}

/// Network definition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkDefinition {
    /// Network driver (defaults to "bridge").
    #[serde(default)]
    pub driver: Option<String>,

    /// Driver-specific options.
    #[serde(default)]
    pub driver_opts: BTreeMap<String, String>,

    /// IPAM configuration.
    #[serde(default)]
    pub ipam: Option<IpamConfig>,

    #[serde(default)]
    pub external: External,

    #[serde(default)]
    pub internal: bool,

    #[serde(default)]
    pub attachable: bool,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    /// Explicit network name (overrides the project-prefixed name).
    #[serde(default)]
    pub name: Option<String>,
}

impl NetworkDefinition {
    pub fn driver(&self) -> &str {
        self.driver.as_deref().unwrap_or("bridge")
    }
}

/// IP address management configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IpamConfig {
    #[serde(default)]
    pub driver: Option<String>,

    #[serde(default)]
    pub config: Vec<BTreeMap<String, String>>,
}

/// Volume definition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VolumeDefinition {
    /// Volume driver (defaults to "local").
    #[serde(default)]
    pub driver: Option<String>,

    /// Driver-specific options.
    #[serde(default)]
    pub driver_opts: BTreeMap<String, String>,

    #[serde(default)]
    pub external: External,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    /// Explicit volume name (overrides the project-prefixed name).
    #[serde(default)]
    pub name: Option<String>,
}

impl VolumeDefinition {
    pub fn driver(&self) -> &str {
        self.driver.as_deref().unwrap_or("local")
    }
}

/// Top-level config/secret definition. Only file-backed objects are supported.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileObjectDefinition {
    /// Host file to mount.
    #[serde(default)]
    pub file: Option<String>,

    #[serde(default)]
    pub external: External,

    #[serde(default)]
    pub name: Option<String>,
}

/// Logging configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub driver: Option<String>,

    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

/// Parse a memory limit (`500k`, `512M`, `2G`, or plain bytes) to bytes.
pub fn parse_memory_bytes(s: &str) -> Option<u64> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }

    let (digits, multiplier) = match s.chars().last() {
        Some('k') | Some('K') => (&s[..s.len() - 1], 1024),
        Some('m') | Some('M') => (&s[..s.len() - 1], 1024 * 1024),
        Some('g') | Some('G') => (&s[..s.len() - 1], 1024 * 1024 * 1024),
        _ => (s, 1),
    };

    digits.parse::<u64>().ok().map(|n| n * multiplier)
}

/// Parse a CPU limit (e.g., "2.5") to a whole core count (floor of the
/// parsed decimal).
pub fn parse_cpu_count(s: &str) -> Option<u32> {
    s.trim().parse::<f64>().ok().map(|c| c.floor() as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_to_map_from_list() {
        let env = Environment::List(vec![
            "ENV=production".to_string(),
            "DEBUG=false".to_string(),
        ]);
        let map = env.to_map();
        assert_eq!(map.get("ENV"), Some(&"production".to_string()));
        assert_eq!(map.get("DEBUG"), Some(&"false".to_string()));
    }

    #[test]
    fn test_environment_value_with_equals_sign() {
        let env = Environment::List(vec!["OPTS=-a=1 -b=2".to_string()]);
        assert_eq!(env.to_map().get("OPTS"), Some(&"-a=1 -b=2".to_string()));
    }

    #[test]
    fn test_command_normalization() {
        let line = Command::Line("sh -c sleep".to_string());
        assert_eq!(line.to_args(), vec!["sh", "-c", "sleep"]);

        let args = Command::Args(vec!["sh".to_string(), "-c".to_string(), "sleep 1".to_string()]);
        assert_eq!(args.to_args(), vec!["sh", "-c", "sleep 1"]);
    }

    #[test]
    fn test_depends_on_forms() {
        let yaml = r#"
            web:
              image: nginx
              depends_on:
                app:
                  condition: service_healthy
            app:
              image: myapp
              depends_on: [db]
            db:
              image: postgres
        "#;
        let services: BTreeMap<String, Service> = serde_yaml::from_str(yaml).unwrap();

        let web = &services["web"];
        assert_eq!(web.dependencies(), vec!["app"]);
        assert!(web.depends_on.requires_healthy("app"));

        let app = &services["app"];
        assert_eq!(app.dependencies(), vec!["db"]);
        assert!(!app.depends_on.requires_healthy("db"));
    }

    #[test]
    fn test_external_forms() {
        let flag: External = serde_yaml::from_str("true").unwrap();
        assert!(flag.is_external());
        assert_eq!(flag.alias(), None);

        let named: External = serde_yaml::from_str("{ name: shared-net }").unwrap();
        assert!(named.is_external());
        assert_eq!(named.alias(), Some("shared-net"));

        assert!(!External::default().is_external());
    }

    #[test]
    fn test_config_ref_forms() {
        let bare: ServiceConfigRef = serde_yaml::from_str("app-config").unwrap();
        assert_eq!(bare.source(), "app-config");
        assert_eq!(bare.target(), None);

        let full: ServiceConfigRef =
            serde_yaml::from_str("{ source: app-config, target: /etc/app.conf }").unwrap();
        assert_eq!(full.source(), "app-config");
        assert_eq!(full.target(), Some("/etc/app.conf"));
    }

    #[test]
    fn test_env_files_forms() {
        let single: EnvFiles = serde_yaml::from_str("one.env").unwrap();
        assert_eq!(single.to_vec(), vec!["one.env"]);

        let multiple: EnvFiles = serde_yaml::from_str("[one.env, two.env]").unwrap();
        assert_eq!(multiple.to_vec(), vec!["one.env", "two.env"]);
    }

    #[test]
    fn test_parse_memory_bytes() {
        assert_eq!(parse_memory_bytes("500k"), Some(500 * 1024));
        assert_eq!(parse_memory_bytes("512M"), Some(512 * 1024 * 1024));
        assert_eq!(parse_memory_bytes("2g"), Some(2 * 1024 * 1024 * 1024));
        assert_eq!(parse_memory_bytes("1048576"), Some(1048576));
        assert_eq!(parse_memory_bytes("oops"), None);
    }

    #[test]
    fn test_parse_cpu_count() {
        assert_eq!(parse_cpu_count("2.5"), Some(2));
        assert_eq!(parse_cpu_count("1"), Some(1));
        assert_eq!(parse_cpu_count("0.5"), Some(0));
        assert_eq!(parse_cpu_count("four"), None);
    }

    #[test]
    fn test_replicas_default() {
        let service = Service { image: Some("alpine".to_string()), ..Default::default() };
        assert_eq!(service.replicas(), 1);

        let scaled = Service {
            image: Some("alpine".to_string()),
            deploy: Some(DeployConfig { replicas: Some(3), ..Default::default() }),
            ..Default::default()
        };
        assert_eq!(scaled.replicas(), 3);
    }
}
