//! Glue between the monitors and the live infrastructure.
//!
//! [`ExecutorActions`] carries monitor decisions out through the executor;
//! [`CommandMetricSource`] samples hosts and containers through the same
//! command runner the executor uses.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, anyhow};
use async_trait::async_trait;

use edgegrid_autoscale::{HostActions, MetricSource, ServiceActions};
use edgegrid_executor::cli::shell_quote;
use edgegrid_executor::{CommandRunner, Executor};
use edgegrid_metrics::Samples;
use edgegrid_state::{ContainerRecord, DecisionRecord, HostLocation, HostRecord};

// ── Actions ───────────────────────────────────────────────────────

pub struct ExecutorActions {
    executor: Arc<Executor>,
}

impl ExecutorActions {
    pub fn new(executor: Arc<Executor>) -> Self {
        Self { executor }
    }

    fn expected_memory(&self, container: &ContainerRecord) -> anyhow::Result<u64> {
        Ok(self
            .executor
            .state()
            .get_service(&container.service_name)?
            .map(|spec| spec.expected_memory_bytes)
            .unwrap_or(0))
    }
}

#[async_trait]
impl HostActions for ExecutorActions {
    async fn start_host_near(&self, overloaded: &str) -> anyhow::Result<HostRecord> {
        Ok(self.executor.start_host_near(overloaded).await?)
    }

    async fn stop_host(&self, address: &str) -> anyhow::Result<()> {
        self.executor.leave_host(address).await?;
        Ok(())
    }

    async fn decision_executed(&self, record: DecisionRecord) -> anyhow::Result<()> {
        Ok(self.executor.decision_executed(record).await?)
    }
}

#[async_trait]
impl ServiceActions for ExecutorActions {
    async fn sync(&self) -> anyhow::Result<Vec<ContainerRecord>> {
        Ok(self.executor.sync_containers().await?)
    }

    async fn replicate(&self, container: &ContainerRecord, target: &HostLocation) -> anyhow::Result<ContainerRecord> {
        let expected_memory = self.expected_memory(container)?;
        let host = self.executor.placement().select_host(expected_memory, target).await?;
        Ok(self.executor.replicate_container(&container.id, &host.address).await?)
    }

    async fn migrate(&self, container: &ContainerRecord) -> anyhow::Result<ContainerRecord> {
        let expected_memory = self.expected_memory(container)?;
        let host = self
            .executor
            .placement()
            .closest_capable_host(expected_memory, container.coordinates, &[container.host_address.as_str()])
            .await?;
        Ok(self.executor.migrate_container(&container.id, &host.address).await?)
    }

    async fn stop(&self, container: &ContainerRecord) -> anyhow::Result<()> {
        Ok(self.executor.stop_container(&container.id).await?)
    }

    async fn recover(
        &self,
        crashed: &ContainerRecord,
        labels: HashMap<String, String>,
    ) -> anyhow::Result<ContainerRecord> {
        let expected_memory = self.expected_memory(crashed)?;
        let host = self
            .executor
            .placement()
            .closest_capable_host(expected_memory, crashed.coordinates, &[])
            .await?;
        Ok(self.executor.replicate_record(crashed, &host.address, labels).await?)
    }

    async fn decision_executed(&self, record: DecisionRecord) -> anyhow::Result<()> {
        Ok(self.executor.decision_executed(record).await?)
    }
}

// ── Metrics ───────────────────────────────────────────────────────

/// Prints core count, `/proc/loadavg` and `total available` memory bytes.
const HOST_STATS_COMMAND: &str = "nproc && cat /proc/loadavg && free -b | awk 'NR==2{print $2, $7}'";

/// Samples hosts through `/proc` and `free`, containers through `docker stats`.
///
/// Hosts yield `cpu-%` (one-minute load over core count) and `ram-%`.
/// Containers yield `cpu-%`, `ram-%`, `ram`, `rx-bytes` and `tx-bytes`.
pub struct CommandMetricSource {
    runner: Arc<dyn CommandRunner>,
}

impl CommandMetricSource {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl MetricSource for CommandMetricSource {
    async fn host_stats(&self, host: &HostRecord) -> anyhow::Result<Samples> {
        let out = self.runner.run(&host.address, HOST_STATS_COMMAND).await?;
        parse_host_stats(&out).with_context(|| format!("host stats from {}", host.address))
    }

    async fn container_stats(&self, container: &ContainerRecord) -> anyhow::Result<Samples> {
        let command = format!(
            "docker stats --no-stream --format '{{{{.CPUPerc}}}}|{{{{.MemPerc}}}}|{{{{.MemUsage}}}}|{{{{.NetIO}}}}' {}",
            shell_quote(&container.id)
        );
        let out = self.runner.run(&container.host_address, &command).await?;
        parse_container_stats(&out).with_context(|| format!("stats of container {}", container.id))
    }
}

fn parse_host_stats(out: &str) -> anyhow::Result<Samples> {
    let mut lines = out.lines().map(str::trim).filter(|l| !l.is_empty());
    let cores: f64 = lines.next().ok_or_else(|| anyhow!("missing core count"))?.parse()?;
    let load: f64 = lines
        .next()
        .and_then(|l| l.split_whitespace().next())
        .ok_or_else(|| anyhow!("missing load average"))?
        .parse()?;
    let memory = lines.next().ok_or_else(|| anyhow!("missing memory line"))?;
    let (total, available) = memory
        .split_once(' ')
        .ok_or_else(|| anyhow!("malformed memory line {memory:?}"))?;
    let total: f64 = total.trim().parse()?;
    let available: f64 = available.trim().parse()?;

    let mut samples = Samples::new();
    if cores > 0.0 {
        samples.insert("cpu-%".to_string(), load / cores * 100.0);
    }
    if total > 0.0 {
        samples.insert("ram-%".to_string(), (total - available) / total * 100.0);
    }
    Ok(samples)
}

fn parse_container_stats(out: &str) -> anyhow::Result<Samples> {
    let line = out
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .ok_or_else(|| anyhow!("empty docker stats output"))?;
    let columns: Vec<&str> = line.split('|').map(str::trim).collect();
    let [cpu, mem, mem_usage, net] = columns[..] else {
        return Err(anyhow!("unexpected docker stats line {line:?}"));
    };
    let (ram, _limit) = split_pair(mem_usage)?;
    let (rx, tx) = split_pair(net)?;

    Ok(Samples::from([
        ("cpu-%".to_string(), parse_percent(cpu)?),
        ("ram-%".to_string(), parse_percent(mem)?),
        ("ram".to_string(), parse_size(ram)?),
        ("rx-bytes".to_string(), parse_size(rx)?),
        ("tx-bytes".to_string(), parse_size(tx)?),
    ]))
}

fn split_pair(value: &str) -> anyhow::Result<(&str, &str)> {
    value
        .split_once('/')
        .map(|(a, b)| (a.trim(), b.trim()))
        .ok_or_else(|| anyhow!("expected `a / b`, got {value:?}"))
}

fn parse_percent(value: &str) -> anyhow::Result<f64> {
    let value = value.trim_end_matches('%');
    if value == "--" {
        return Ok(0.0);
    }
    value.parse().with_context(|| format!("bad percentage {value:?}"))
}

/// Docker's human-readable sizes: `0B`, `1.5kB`, `12MiB`, `3.2GB`.
fn parse_size(value: &str) -> anyhow::Result<f64> {
    let split = value
        .find(|c: char| c.is_ascii_alphabetic())
        .unwrap_or(value.len());
    let (number, unit) = value.split_at(split);
    let number: f64 = number.trim().parse().with_context(|| format!("bad size {value:?}"))?;
    let multiplier = match unit.trim() {
        "" | "B" => 1.0,
        "kB" | "KB" => 1e3,
        "MB" => 1e6,
        "GB" => 1e9,
        "TB" => 1e12,
        "KiB" => 1024.0,
        "MiB" => 1024.0 * 1024.0,
        "GiB" => 1024.0 * 1024.0 * 1024.0,
        "TiB" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        other => return Err(anyhow!("unknown size unit {other:?}")),
    };
    Ok(number * multiplier)
}
