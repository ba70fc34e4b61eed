//! edged.toml configuration.
//!
//! Every field has a default, so an empty file is a valid configuration for
//! a single manager on localhost with no cloud credentials.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use edgegrid_autoscale::{
    Bounds, HostMonitorSettings, HostThresholds, RecoveryPolicy, ServiceMonitorSettings, ServiceThresholds,
};
use edgegrid_executor::{AwsLaunchConfig, CloudSettings, ExecutorSettings};
use edgegrid_placement::DEFAULT_ZONE;
use edgegrid_state::{HostLocation, ServiceSpec};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EdgedConfig {
    pub manager: ManagerConfig,
    pub hosts: HostsConfig,
    pub services: ServicesConfig,
    pub cloud: CloudConfig,
    pub ssh: SshConfig,
    pub placement: PlacementConfig,
    pub rules: RulesConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Public address of the host this manager runs on.
    pub address: String,
    pub private_address: Option<String>,
    pub location: HostLocation,
    /// Region this manager owns. Unset owns every region.
    pub region: Option<String>,
    pub data_dir: PathBuf,
    /// Append every recorded sample to the monitoring log.
    pub test_log: bool,
    /// Services never evaluated (the manager's own containers and similar).
    pub system_services: Vec<String>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1".to_string(),
            private_address: None,
            location: HostLocation::default(),
            region: None,
            data_dir: PathBuf::from("/var/lib/edgegrid"),
            test_log: false,
            system_services: Vec::new(),
        }
    }
}

/// A known edge machine that may join the cluster.
#[derive(Debug, Clone, Deserialize)]
pub struct EdgeHostConfig {
    pub address: String,
    pub private_address: Option<String>,
    #[serde(default)]
    pub location: HostLocation,
    #[serde(default)]
    pub memory_bytes: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HostsConfig {
    pub monitor_interval_secs: u64,
    pub start_threshold: u32,
    pub stop_threshold: u32,
    pub min_hosts: u32,
    /// 0 = unbounded.
    pub max_hosts: u32,
    pub join_attempts: u32,
    /// Catalog service run on every host before it joins.
    pub proxy_service: Option<String>,
    /// Catalog services run on every host once it joined.
    pub background_services: Vec<String>,
    pub edge: Vec<EdgeHostConfig>,
}

impl Default for HostsConfig {
    fn default() -> Self {
        Self {
            monitor_interval_secs: 60,
            start_threshold: 3,
            stop_threshold: 5,
            min_hosts: 1,
            max_hosts: 0,
            join_attempts: 5,
            proxy_service: None,
            background_services: Vec::new(),
            edge: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServicesConfig {
    pub monitor_interval_secs: u64,
    pub replicate_threshold: u32,
    pub migrate_threshold: u32,
    pub stop_threshold: u32,
    /// Grace period between a migration's replica and the original's stop.
    pub migration_stop_delay_secs: u64,
    pub max_recoveries: u32,
    pub recovery_window_secs: u64,
    pub catalog: Vec<ServiceSpec>,
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            monitor_interval_secs: 30,
            replicate_threshold: 3,
            migrate_threshold: 3,
            stop_threshold: 5,
            migration_stop_delay_secs: 60,
            max_recoveries: 3,
            recovery_window_secs: 600,
            catalog: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CloudConfig {
    pub enabled: bool,
    pub profile: Option<String>,
    pub instance_type: String,
    /// AMI per zone.
    pub images: HashMap<String, String>,
    pub security_group: Option<String>,
    pub key_name: Option<String>,
    pub tag_key: String,
    pub tag_value: String,
    /// Zones scanned for managed instances. Empty scans every known zone.
    pub zones: Vec<String>,
    pub max_retries: u32,
    pub retry_delay_secs: u64,
    pub poll_interval_secs: u64,
    pub poll_timeout_secs: u64,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            profile: None,
            instance_type: "t2.micro".to_string(),
            images: HashMap::new(),
            security_group: None,
            key_name: None,
            tag_key: "edgegrid".to_string(),
            tag_value: "managed".to_string(),
            zones: vec![DEFAULT_ZONE.to_string()],
            max_retries: 5,
            retry_delay_secs: 5,
            poll_interval_secs: 2,
            poll_timeout_secs: 180,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    pub user: String,
    pub identity_file: Option<PathBuf>,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            user: "ubuntu".to_string(),
            identity_file: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PlacementConfig {
    /// Region placed last among otherwise equal candidates.
    pub avoid_region: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RulesConfig {
    pub path: PathBuf,
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/etc/edgegrid/rules.toml"),
        }
    }
}

impl EdgedConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: EdgedConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn state_path(&self) -> PathBuf {
        self.manager.data_dir.join("edgegrid.redb")
    }

    pub fn executor_settings(&self) -> ExecutorSettings {
        ExecutorSettings {
            join_attempts: self.hosts.join_attempts,
            proxy_service: self.hosts.proxy_service.clone(),
            background_services: self.hosts.background_services.clone(),
            migration_stop_delay: Duration::from_secs(self.services.migration_stop_delay_secs),
            avoid_region: self.placement.avoid_region.clone(),
            cloud: CloudSettings {
                max_retries: self.cloud.max_retries,
                retry_delay: Duration::from_secs(self.cloud.retry_delay_secs),
                poll_interval: Duration::from_secs(self.cloud.poll_interval_secs),
                poll_timeout: Duration::from_secs(self.cloud.poll_timeout_secs),
            },
        }
    }

    pub fn aws_launch_config(&self) -> AwsLaunchConfig {
        AwsLaunchConfig {
            profile: self.cloud.profile.clone(),
            instance_type: self.cloud.instance_type.clone(),
            images: self.cloud.images.clone(),
            security_group: self.cloud.security_group.clone(),
            key_name: self.cloud.key_name.clone(),
            tag: (self.cloud.tag_key.clone(), self.cloud.tag_value.clone()),
            zones: self.cloud.zones.clone(),
        }
    }

    pub fn host_monitor_settings(&self) -> HostMonitorSettings {
        HostMonitorSettings {
            thresholds: HostThresholds {
                start: self.hosts.start_threshold,
                stop: self.hosts.stop_threshold,
            },
            bounds: Bounds::new(self.hosts.min_hosts, self.hosts.max_hosts),
            region: self.manager.region.clone(),
        }
    }

    pub fn service_monitor_settings(&self) -> ServiceMonitorSettings {
        let mut system_services = self.manager.system_services.clone();
        system_services.extend(self.hosts.proxy_service.iter().cloned());
        system_services.extend(self.hosts.background_services.iter().cloned());
        ServiceMonitorSettings {
            thresholds: ServiceThresholds {
                replicate: self.services.replicate_threshold,
                migrate: self.services.migrate_threshold,
                stop: self.services.stop_threshold,
            },
            region: self.manager.region.clone(),
            system_services,
            recovery: RecoveryPolicy {
                max_recoveries: self.services.max_recoveries,
                window: Duration::from_secs(self.services.recovery_window_secs),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edgegrid_state::ServiceType;

    #[test]
    fn empty_file_uses_defaults() {
        let config: EdgedConfig = toml::from_str("").unwrap();
        assert_eq!(config.manager.address, "127.0.0.1");
        assert_eq!(config.hosts.join_attempts, 5);
        assert_eq!(config.services.max_recoveries, 3);
        assert!(!config.cloud.enabled);
        assert_eq!(config.state_path(), PathBuf::from("/var/lib/edgegrid/edgegrid.redb"));

        let settings = config.executor_settings();
        assert_eq!(settings.cloud.poll_timeout, Duration::from_secs(180));
        assert_eq!(settings.migration_stop_delay, Duration::from_secs(60));
    }

    #[test]
    fn parses_full_file() {
        let toml_str = r#"
[manager]
address = "10.0.0.1"
region = "europe"
data_dir = "/tmp/edgegrid"
system_services = ["registration-server"]

[manager.location]
continent = "europe"
region = "europe"
country = "pt"
city = "lisbon"
coordinates = { latitude = 38.72, longitude = -9.14 }

[hosts]
start_threshold = 2
stop_threshold = 4
min_hosts = 2
max_hosts = 6
proxy_service = "nginx-proxy"
background_services = ["node-exporter"]

[[hosts.edge]]
address = "10.0.0.2"
location = { continent = "europe", region = "europe", country = "pt", city = "porto", coordinates = { latitude = 41.15, longitude = -8.61 } }

[services]
replicate_threshold = 1
migration_stop_delay_secs = 30

[[services.catalog]]
name = "api"
image = "edgegrid/api"
service_type = "backend"
internal_port = 8080
external_port = 8080
launch_command = "--port ${externalPort} --db ${storeHost}"
output_label = "apiHost"
min_replicas = 1
max_replicas = 4
expected_memory_bytes = 268435456
dependencies = ["store"]

[[services.catalog]]
name = "store"
image = "edgegrid/store"
service_type = "database"
internal_port = 5432
external_port = 5432

[cloud]
enabled = true
profile = "edge"
images = { "eu-west-3" = "ami-0123" }
zones = ["eu-west-3"]
poll_timeout_secs = 60

[ssh]
user = "edge"
identity_file = "/home/edge/.ssh/id_ed25519"

[placement]
avoid_region = "us-east-1"

[rules]
path = "/tmp/rules.toml"
"#;
        let config: EdgedConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.manager.location.city, "lisbon");
        assert_eq!(config.hosts.edge.len(), 1);
        assert_eq!(config.hosts.edge[0].location.city, "porto");
        assert_eq!(config.services.catalog.len(), 2);
        assert_eq!(config.services.catalog[1].service_type, ServiceType::Database);
        assert_eq!(config.services.catalog[0].dependencies, vec!["store".to_string()]);

        let hosts = config.host_monitor_settings();
        assert_eq!(hosts.thresholds, HostThresholds { start: 2, stop: 4 });
        assert_eq!(hosts.bounds, Bounds::new(2, 6));
        assert_eq!(hosts.region.as_deref(), Some("europe"));

        let services = config.service_monitor_settings();
        assert_eq!(services.thresholds.replicate, 1);
        assert_eq!(
            services.system_services,
            vec!["registration-server", "nginx-proxy", "node-exporter"]
        );

        let aws = config.aws_launch_config();
        assert_eq!(aws.tag, ("edgegrid".to_string(), "managed".to_string()));
        assert_eq!(aws.images.get("eu-west-3").map(String::as_str), Some("ami-0123"));
        assert_eq!(config.executor_settings().migration_stop_delay, Duration::from_secs(30));
    }

    #[test]
    fn from_file_reads_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("edged.toml");
        std::fs::write(&path, "[manager]\naddress = \"10.1.1.1\"\n").unwrap();
        let config = EdgedConfig::from_file(&path).unwrap();
        assert_eq!(config.manager.address, "10.1.1.1");
        assert_eq!(config.hosts.min_hosts, 1);
    }

    #[test]
    fn shipped_examples_parse() {
        let config: EdgedConfig = toml::from_str(include_str!("../../../config/edged.example.toml")).unwrap();
        assert_eq!(config.hosts.edge.len(), 2);
        assert_eq!(config.services.catalog.len(), 4);
        assert!(config.cloud.enabled);

        let rules = edgegrid_rules::parse_rules(include_str!("../../../config/rules.example.toml")).unwrap();
        assert_eq!(rules.len(), 7);
    }

    #[test]
    fn unknown_types_are_rejected() {
        assert!(toml::from_str::<EdgedConfig>("[hosts]\nmin_hosts = \"two\"\n").is_err());
    }
}
