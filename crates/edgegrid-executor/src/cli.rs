//! Command-line backed collaborators.
//!
//! Everything here shells out through a [`CommandRunner`]: `bash -c` for the
//! manager's own host, `ssh` for the others. Structured output (`aws …
//! --output json`, `docker inspect`) is parsed with `serde_json`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;
use tracing::debug;

use edgegrid_placement::{AWS_REGIONS, HostProbe};
use edgegrid_state::{CloudInstance, HostRecord, InstanceState, NodeRole, NodeState, PortBinding};

use crate::backends::{CloudProvider, CommandRunner, ContainerRuntime, LaunchRequest, RunningContainer, SwarmApi, SwarmNode};
use crate::context::ExecContext;

/// Quote a value for a POSIX shell.
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@,".contains(c))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}

// ── Shell ──────────────────────────────────────────────────────────

/// Runs commands with `bash -c` locally and over `ssh` elsewhere.
pub struct ShellCommandRunner {
    context: ExecContext,
    ssh_user: String,
    identity_file: Option<PathBuf>,
}

impl ShellCommandRunner {
    pub fn new(context: ExecContext, ssh_user: impl Into<String>) -> Self {
        Self {
            context,
            ssh_user: ssh_user.into(),
            identity_file: None,
        }
    }

    pub fn with_identity_file(mut self, path: Option<PathBuf>) -> Self {
        self.identity_file = path;
        self
    }

    fn command_for(&self, host: &str, command: &str) -> Command {
        if self.context.is_local(host) {
            let mut cmd = Command::new("bash");
            cmd.arg("-c").arg(command);
            return cmd;
        }
        let mut cmd = Command::new("ssh");
        cmd.args(["-o", "StrictHostKeyChecking=no", "-o", "BatchMode=yes", "-o", "ConnectTimeout=10"]);
        if let Some(identity) = &self.identity_file {
            cmd.arg("-i").arg(identity);
        }
        cmd.arg(format!("{}@{host}", self.ssh_user)).arg(command);
        cmd
    }
}

#[async_trait]
impl CommandRunner for ShellCommandRunner {
    async fn run(&self, host: &str, command: &str) -> anyhow::Result<String> {
        debug!(%host, %command, "running command");
        let output = self
            .command_for(host, command)
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("spawn `{command}` for {host}"))?;
        if !output.status.success() {
            bail!(
                "`{command}` on {host} exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

// ── Host probe ─────────────────────────────────────────────────────

/// Available memory as reported by `free`.
pub struct CommandHostProbe {
    runner: Arc<dyn CommandRunner>,
}

impl CommandHostProbe {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl HostProbe for CommandHostProbe {
    async fn available_memory(&self, host: &HostRecord) -> anyhow::Result<u64> {
        let out = self.runner.run(&host.address, "free -b | awk 'NR==2{print $7}'").await?;
        out.trim()
            .parse()
            .with_context(|| format!("unexpected free output from {}: {out:?}", host.address))
    }
}

// ── AWS ────────────────────────────────────────────────────────────

/// Launch parameters for new instances.
#[derive(Debug, Clone)]
pub struct AwsLaunchConfig {
    pub profile: Option<String>,
    pub instance_type: String,
    /// AMI per zone; AMIs are region-specific.
    pub images: HashMap<String, String>,
    pub security_group: Option<String>,
    pub key_name: Option<String>,
    /// Management tag `(key, value)`; only tagged instances are visible.
    pub tag: (String, String),
    /// Zones scanned by `describe_instances`. Empty means every known region.
    pub zones: Vec<String>,
}

/// `aws ec2 …` run on the manager host.
pub struct AwsCliProvider {
    runner: Arc<dyn CommandRunner>,
    context: ExecContext,
    config: AwsLaunchConfig,
}

impl AwsCliProvider {
    pub fn new(runner: Arc<dyn CommandRunner>, context: ExecContext, config: AwsLaunchConfig) -> Self {
        Self {
            runner,
            context,
            config,
        }
    }

    fn zones(&self) -> Vec<String> {
        if self.config.zones.is_empty() {
            AWS_REGIONS.iter().map(|r| r.zone.to_string()).collect()
        } else {
            self.config.zones.clone()
        }
    }

    async fn ec2(&self, zone: &str, args: &str) -> anyhow::Result<Value> {
        let profile = self
            .config
            .profile
            .as_deref()
            .map(|p| format!(" --profile {}", shell_quote(p)))
            .unwrap_or_default();
        let command = format!("aws ec2 {args} --region {} --output json{profile}", shell_quote(zone));
        let out = self.runner.run(self.context.manager_address(), &command).await?;
        if out.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&out).with_context(|| format!("parse output of `{command}`"))
    }

    async fn state_change(&self, verb: &str, instance_id: &str) -> anyhow::Result<()> {
        let instance = self
            .describe_instance(instance_id)
            .await?
            .with_context(|| format!("instance {instance_id} not found"))?;
        self.ec2(&instance.zone, &format!("{verb} --instance-ids {}", shell_quote(instance_id)))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl CloudProvider for AwsCliProvider {
    async fn describe_instances(&self) -> anyhow::Result<Vec<CloudInstance>> {
        let (key, value) = &self.config.tag;
        let filter = shell_quote(&format!("Name=tag:{key},Values={value}"));
        let mut instances = Vec::new();
        for zone in self.zones() {
            let out = self.ec2(&zone, &format!("describe-instances --filters {filter}")).await?;
            instances.extend(parse_reservations(&out, &zone));
        }
        Ok(instances)
    }

    async fn describe_instance(&self, instance_id: &str) -> anyhow::Result<Option<CloudInstance>> {
        Ok(self
            .describe_instances()
            .await?
            .into_iter()
            .find(|i| i.instance_id == instance_id))
    }

    async fn launch_instance(&self, zone: &str) -> anyhow::Result<CloudInstance> {
        let image = self
            .config
            .images
            .get(zone)
            .with_context(|| format!("no image configured for zone {zone}"))?;
        let (key, value) = &self.config.tag;
        let mut args = format!(
            "run-instances --image-id {} --instance-type {} --count 1 --tag-specifications {}",
            shell_quote(image),
            shell_quote(&self.config.instance_type),
            shell_quote(&format!("ResourceType=instance,Tags=[{{Key={key},Value={value}}}]")),
        );
        if let Some(group) = &self.config.security_group {
            args.push_str(&format!(" --security-group-ids {}", shell_quote(group)));
        }
        if let Some(key_name) = &self.config.key_name {
            args.push_str(&format!(" --key-name {}", shell_quote(key_name)));
        }
        let out = self.ec2(zone, &args).await?;
        out["Instances"]
            .as_array()
            .and_then(|list| list.first())
            .and_then(|v| parse_instance(v, zone))
            .context("run-instances returned no instance")
    }

    async fn start_instance(&self, instance_id: &str) -> anyhow::Result<()> {
        self.state_change("start-instances", instance_id).await
    }

    async fn stop_instance(&self, instance_id: &str) -> anyhow::Result<()> {
        self.state_change("stop-instances", instance_id).await
    }

    async fn terminate_instance(&self, instance_id: &str) -> anyhow::Result<()> {
        self.state_change("terminate-instances", instance_id).await
    }
}

fn parse_reservations(out: &Value, zone: &str) -> Vec<CloudInstance> {
    out["Reservations"]
        .as_array()
        .into_iter()
        .flatten()
        .flat_map(|r| r["Instances"].as_array().into_iter().flatten())
        .filter_map(|v| parse_instance(v, zone))
        .collect()
}

fn parse_instance(v: &Value, zone: &str) -> Option<CloudInstance> {
    let state = v["State"]["Code"]
        .as_u64()
        .and_then(|c| InstanceState::from_code(c as u16))
        .or_else(|| v["State"]["Name"].as_str().and_then(InstanceState::from_name))?;
    let text = |key: &str| v[key].as_str().map(str::to_string);
    Some(CloudInstance {
        instance_id: text("InstanceId")?,
        instance_type: text("InstanceType").unwrap_or_default(),
        image_id: text("ImageId").unwrap_or_default(),
        state,
        public_address: text("PublicIpAddress"),
        private_address: text("PrivateIpAddress"),
        zone: v["Placement"]["AvailabilityZone"]
            .as_str()
            .map(|az| az.trim_end_matches(|c: char| c.is_ascii_alphabetic()).to_string())
            .unwrap_or_else(|| zone.to_string()),
        updated_at: 0,
    })
}

// ── Docker swarm ───────────────────────────────────────────────────

/// `docker swarm` / `docker node` driven from the manager.
pub struct DockerCliSwarm {
    runner: Arc<dyn CommandRunner>,
    context: ExecContext,
}

impl DockerCliSwarm {
    pub fn new(runner: Arc<dyn CommandRunner>, context: ExecContext) -> Self {
        Self { runner, context }
    }

    async fn on_manager(&self, command: &str) -> anyhow::Result<String> {
        self.runner.run(self.context.manager_address(), command).await
    }

    async fn node_id(&self, host: &HostRecord) -> anyhow::Result<String> {
        let out = self
            .runner
            .run(&host.address, "docker info -f '{{.Swarm.NodeID}}'")
            .await?;
        let id = out.trim();
        if id.is_empty() {
            bail!("{} reports no swarm node id", host.address);
        }
        Ok(id.to_string())
    }
}

#[async_trait]
impl SwarmApi for DockerCliSwarm {
    async fn init(&self, host: &HostRecord) -> anyhow::Result<String> {
        let command = format!(
            "docker swarm init --advertise-addr {}",
            shell_quote(&host.private_address)
        );
        self.runner.run(&host.address, &command).await?;
        self.node_id(host).await
    }

    async fn join(&self, host: &HostRecord, role: NodeRole) -> anyhow::Result<String> {
        let kind = match role {
            NodeRole::Manager => "manager",
            NodeRole::Worker => "worker",
        };
        let token = self.on_manager(&format!("docker swarm join-token -q {kind}")).await?;
        let command = format!(
            "docker swarm join --token {} --advertise-addr {} {}:2377",
            shell_quote(token.trim()),
            shell_quote(&host.address),
            shell_quote(self.context.manager_address()),
        );
        self.runner.run(&host.address, &command).await?;
        self.node_id(host).await
    }

    async fn leave(&self, host: &HostRecord) -> anyhow::Result<()> {
        self.runner.run(&host.address, "docker swarm leave --force").await?;
        Ok(())
    }

    async fn remove_node(&self, node_id: &str) -> anyhow::Result<()> {
        self.on_manager(&format!("docker node rm --force {}", shell_quote(node_id)))
            .await?;
        Ok(())
    }

    async fn list_nodes(&self) -> anyhow::Result<Vec<SwarmNode>> {
        let out = self
            .on_manager("ids=$(docker node ls -q); [ -z \"$ids\" ] && echo '[]' || docker node inspect $ids")
            .await?;
        parse_nodes(&out)
    }

    async fn promote(&self, node_id: &str) -> anyhow::Result<()> {
        self.on_manager(&format!("docker node promote {}", shell_quote(node_id)))
            .await?;
        Ok(())
    }

    async fn demote(&self, node_id: &str) -> anyhow::Result<()> {
        self.on_manager(&format!("docker node demote {}", shell_quote(node_id)))
            .await?;
        Ok(())
    }

    async fn set_label(&self, node_id: &str, key: &str, value: &str) -> anyhow::Result<()> {
        let label = shell_quote(&format!("{key}={value}"));
        self.on_manager(&format!("docker node update --label-add {label} {}", shell_quote(node_id)))
            .await?;
        Ok(())
    }
}

fn string_map(v: &Value) -> HashMap<String, String> {
    v.as_object()
        .map(|m| {
            m.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

fn parse_nodes(out: &str) -> anyhow::Result<Vec<SwarmNode>> {
    let nodes: Vec<Value> = serde_json::from_str(out).context("parse docker node inspect")?;
    Ok(nodes
        .iter()
        .filter_map(|n| {
            let role = match n["Spec"]["Role"].as_str()? {
                "manager" => NodeRole::Manager,
                _ => NodeRole::Worker,
            };
            let state = match n["Status"]["State"].as_str()? {
                "ready" => NodeState::Ready,
                _ => NodeState::Down,
            };
            // A manager's Status.Addr can be 0.0.0.0; its ManagerStatus has the real one.
            let address = match n["Status"]["Addr"].as_str() {
                Some(addr) if addr != "0.0.0.0" => addr.to_string(),
                _ => n["ManagerStatus"]["Addr"].as_str()?.split(':').next()?.to_string(),
            };
            Some(SwarmNode {
                node_id: n["ID"].as_str()?.to_string(),
                address,
                role,
                state,
                labels: string_map(&n["Spec"]["Labels"]),
            })
        })
        .collect())
}

// ── Docker runtime ─────────────────────────────────────────────────

/// `docker run|inspect|stop|ps` on the target host.
pub struct DockerCliRuntime {
    runner: Arc<dyn CommandRunner>,
}

impl DockerCliRuntime {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl ContainerRuntime for DockerCliRuntime {
    async fn create_and_start(&self, request: &LaunchRequest) -> anyhow::Result<String> {
        let mut command = format!("docker run -d --name {}", shell_quote(&request.name));
        for port in &request.ports {
            command.push_str(&format!(" -p {}:{}", port.external, port.internal));
        }
        for (key, value) in &request.env {
            command.push_str(&format!(" -e {}", shell_quote(&format!("{key}={value}"))));
        }
        let mut labels: Vec<_> = request.labels.iter().collect();
        labels.sort();
        for (key, value) in labels {
            command.push_str(&format!(" -l {}", shell_quote(&format!("{key}={value}"))));
        }
        command.push(' ');
        command.push_str(&shell_quote(&request.image));
        for arg in &request.args {
            command.push(' ');
            command.push_str(&shell_quote(arg));
        }
        let out = self.runner.run(&request.host, &command).await?;
        let id = out.trim();
        if id.is_empty() {
            bail!("docker run on {} returned no container id", request.host);
        }
        Ok(id.to_string())
    }

    async fn inspect(&self, host: &str, container_id: &str) -> anyhow::Result<Option<RunningContainer>> {
        let command = format!("docker inspect {} 2>/dev/null || echo '[]'", shell_quote(container_id));
        let out = self.runner.run(host, &command).await?;
        Ok(parse_containers(&out)?.into_iter().next())
    }

    async fn stop(&self, host: &str, container_id: &str) -> anyhow::Result<()> {
        let id = shell_quote(container_id);
        self.runner.run(host, &format!("docker stop {id} && docker rm {id}")).await?;
        Ok(())
    }

    async fn list(&self, host: &str) -> anyhow::Result<Vec<RunningContainer>> {
        let out = self
            .runner
            .run(host, "ids=$(docker ps -q); [ -z \"$ids\" ] && echo '[]' || docker inspect $ids")
            .await?;
        parse_containers(&out)
    }
}

/// Running containers from `docker inspect` output.
fn parse_containers(out: &str) -> anyhow::Result<Vec<RunningContainer>> {
    let containers: Vec<Value> = serde_json::from_str(out).context("parse docker inspect")?;
    Ok(containers
        .iter()
        .filter(|c| c["State"]["Running"].as_bool().unwrap_or(false))
        .filter_map(|c| {
            let ports = c["NetworkSettings"]["Ports"]
                .as_object()
                .into_iter()
                .flatten()
                .filter_map(|(spec, bindings)| {
                    let internal = spec.split('/').next()?.parse().ok()?;
                    let external = bindings.as_array()?.first()?["HostPort"].as_str()?.parse().ok()?;
                    Some(PortBinding { internal, external })
                })
                .collect();
            Some(RunningContainer {
                id: c["Id"].as_str()?.to_string(),
                name: c["Name"].as_str()?.trim_start_matches('/').to_string(),
                image: c["Config"]["Image"].as_str().unwrap_or_default().to_string(),
                ports,
                args: c["Args"]
                    .as_array()
                    .into_iter()
                    .flatten()
                    .filter_map(|a| a.as_str().map(str::to_string))
                    .collect(),
                labels: string_map(&c["Config"]["Labels"]),
            })
        })
        .collect())
}
