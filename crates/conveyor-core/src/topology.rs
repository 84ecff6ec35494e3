//! Declared service stack: which services run, what they publish, how they
//! are health-checked and the order they may start in.

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

use crate::task::duration_secs;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    /// Dependency process has been launched.
    ServiceStarted,
    /// Dependency passed its health check.
    ServiceHealthy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub service: String,
    pub condition: Condition,
}

impl Dependency {
    pub fn healthy(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            condition: Condition::ServiceHealthy,
        }
    }

    pub fn started(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            condition: Condition::ServiceStarted,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RestartPolicy {
    #[default]
    #[serde(rename = "no")]
    No,
    #[serde(rename = "on-failure")]
    OnFailure,
    #[serde(rename = "always")]
    Always,
}

impl RestartPolicy {
    pub fn should_restart(self, exited_cleanly: bool) -> bool {
        match self {
            RestartPolicy::No => false,
            RestartPolicy::OnFailure => !exited_cleanly,
            RestartPolicy::Always => true,
        }
    }
}

impl std::str::FromStr for RestartPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "no" => Ok(RestartPolicy::No),
            "on-failure" => Ok(RestartPolicy::OnFailure),
            "always" => Ok(RestartPolicy::Always),
            other => Err(Error::InvalidTopology(format!("unknown restart policy '{}'", other))),
        }
    }
}

/// Readiness probe and its retry budget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheck {
    pub test: Vec<String>,
    #[serde(with = "duration_secs")]
    pub interval: Duration,
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
    pub retries: u32,
    #[serde(with = "duration_secs", default)]
    pub start_period: Duration,
}

impl HealthCheck {
    pub fn new(test: &[&str], interval_secs: u64, timeout_secs: u64, retries: u32) -> Self {
        Self {
            test: test.iter().map(|s| s.to_string()).collect(),
            interval: Duration::from_secs(interval_secs),
            timeout: Duration::from_secs(timeout_secs),
            retries,
            start_period: Duration::ZERO,
        }
    }

    pub fn with_start_period(mut self, start_period: Duration) -> Self {
        self.start_period = start_period;
        self
    }

    /// Longest a dependant may wait before this service counts as failed.
    pub fn budget(&self) -> Duration {
        self.start_period + (self.interval + self.timeout) * self.retries
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PortMapping {
    pub host: u16,
    pub container: u16,
}

fn parse_range(s: &str) -> Result<Vec<u16>> {
    let bad = || Error::InvalidTopology(format!("invalid port '{}'", s));
    match s.split_once('-') {
        Some((lo, hi)) => {
            let lo: u16 = lo.trim().parse().map_err(|_| bad())?;
            let hi: u16 = hi.trim().parse().map_err(|_| bad())?;
            if lo > hi {
                return Err(bad());
            }
            Ok((lo..=hi).collect())
        }
        None => Ok(vec![s.trim().parse().map_err(|_| bad())?]),
    }
}

/// Parses `"PORT"`, `"HOST:CONTAINER"` and ranges like `"10000-10002:10000-10002"`.
pub fn parse_port(spec: &str) -> Result<Vec<PortMapping>> {
    let (host, container) = match spec.split_once(':') {
        Some((host, container)) => (parse_range(host)?, parse_range(container)?),
        None => {
            let ports = parse_range(spec)?;
            (ports.clone(), ports)
        }
    };

    if host.len() != container.len() {
        return Err(Error::InvalidTopology(format!(
            "port range '{}' maps {} host ports onto {} container ports",
            spec,
            host.len(),
            container.len()
        )));
    }

    Ok(host
        .into_iter()
        .zip(container)
        .map(|(host, container)| PortMapping { host, container })
        .collect())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub ports: Vec<String>,
    #[serde(default)]
    pub depends_on: Vec<Dependency>,
    #[serde(default)]
    pub healthcheck: Option<HealthCheck>,
    #[serde(default)]
    pub restart: RestartPolicy,
    #[serde(default = "default_replicas")]
    pub replicas: u32,
    /// Variable names read from the env file.
    #[serde(default)]
    pub env: Vec<String>,
}

fn default_replicas() -> u32 {
    1
}

impl Service {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            command: Vec::new(),
            ports: Vec::new(),
            depends_on: Vec::new(),
            healthcheck: None,
            restart: RestartPolicy::No,
            replicas: 1,
            env: Vec::new(),
        }
    }

    fn command(mut self, command: &[&str]) -> Self {
        self.command = command.iter().map(|s| s.to_string()).collect();
        self
    }

    fn ports(mut self, ports: &[&str]) -> Self {
        self.ports = ports.iter().map(|s| s.to_string()).collect();
        self
    }

    fn depends_on(mut self, deps: Vec<Dependency>) -> Self {
        self.depends_on = deps;
        self
    }

    fn healthcheck(mut self, check: HealthCheck) -> Self {
        self.healthcheck = Some(check);
        self
    }

    fn restart(mut self, policy: RestartPolicy) -> Self {
        self.restart = policy;
        self
    }

    fn env(mut self, vars: &[&str]) -> Self {
        self.env = vars.iter().map(|s| s.to_string()).collect();
        self
    }

    fn replicas(mut self, replicas: u32) -> Self {
        self.replicas = replicas;
        self
    }

    pub fn port_mappings(&self) -> Result<Vec<PortMapping>> {
        let mut mappings = Vec::new();
        for spec in &self.ports {
            mappings.extend(parse_port(spec)?);
        }
        Ok(mappings)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    pub services: BTreeMap<String, Service>,
}

impl Topology {
    /// Reads a `[services.<name>]` table from a TOML, YAML or JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let topology: Topology = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .build()?
            .try_deserialize()?;
        topology.validate()?;
        Ok(topology)
    }

    /// The stack this project is deployed as.
    pub fn reference() -> Self {
        use RestartPolicy::*;

        let app = "conveyor:latest";
        let mut services = BTreeMap::new();

        services.insert(
            "postgres".to_string(),
            Service::new("postgres:16-alpine")
                .ports(&["5432:5432"])
                .env(&["POSTGRES_USER", "POSTGRES_PASSWORD", "POSTGRES_DB"])
                .healthcheck(HealthCheck::new(
                    &["CMD-SHELL", "pg_isready -U $POSTGRES_USER"],
                    5,
                    5,
                    5,
                ))
                .restart(Always),
        );
        services.insert(
            "redis".to_string(),
            Service::new("redis:7-alpine")
                .command(&["redis-server", "--requirepass", "$REDIS_PASSWORD"])
                .ports(&["6379:6379"])
                .env(&["REDIS_PASSWORD"])
                .healthcheck(HealthCheck::new(
                    &["CMD-SHELL", "redis-cli -a $REDIS_PASSWORD ping | grep PONG"],
                    5,
                    3,
                    5,
                ))
                .restart(Always),
        );
        services.insert(
            "rabbitmq".to_string(),
            Service::new("rabbitmq:3-management")
                .ports(&["5672:5672", "15672:15672"])
                .env(&["BROKER_USER", "BROKER_PASSWORD"])
                .healthcheck(
                    HealthCheck::new(&["CMD", "rabbitmq-diagnostics", "-q", "ping"], 10, 10, 5)
                        .with_start_period(Duration::from_secs(20)),
                )
                .restart(Always),
        );
        services.insert(
            "api".to_string(),
            Service::new(app)
                .command(&["conveyor", "serve"])
                .ports(&["8000:8000"])
                .env(&["POSTGRES_USER", "POSTGRES_PASSWORD", "REDIS_PASSWORD"])
                .depends_on(vec![
                    Dependency::healthy("postgres"),
                    Dependency::healthy("redis"),
                    Dependency::healthy("rabbitmq"),
                ])
                .healthcheck(HealthCheck::new(&["CMD", "conveyor", "probe", "api"], 10, 5, 3))
                .restart(OnFailure),
        );
        services.insert(
            "worker".to_string(),
            Service::new(app)
                .command(&["conveyor", "worker"])
                .env(&["POSTGRES_USER", "POSTGRES_PASSWORD", "REDIS_PASSWORD"])
                .depends_on(vec![
                    Dependency::healthy("postgres"),
                    Dependency::healthy("redis"),
                    Dependency::healthy("rabbitmq"),
                ])
                .healthcheck(HealthCheck::new(
                    &["CMD", "conveyor", "probe", "worker"],
                    30,
                    10,
                    3,
                ))
                .restart(OnFailure)
                .replicas(2),
        );
        services.insert(
            "beat".to_string(),
            Service::new(app)
                .command(&["conveyor", "beat"])
                .env(&["REDIS_PASSWORD"])
                .depends_on(vec![
                    Dependency::healthy("redis"),
                    Dependency::healthy("rabbitmq"),
                ])
                .restart(OnFailure),
        );
        services.insert(
            "flower".to_string(),
            Service::new("mher/flower:2.0")
                .env(&["BROKER_USER", "BROKER_PASSWORD"])
                .depends_on(vec![Dependency::healthy("rabbitmq"), Dependency::started("worker")])
                .restart(Always),
        );
        services.insert(
            "seq".to_string(),
            Service::new("datalust/seq:latest").restart(Always),
        );
        services.insert(
            "client".to_string(),
            Service::new("node:20-alpine")
                .ports(&["3000:3000"])
                .depends_on(vec![Dependency::healthy("api")])
                .restart(OnFailure),
        );
        services.insert(
            "proxy".to_string(),
            Service::new("nginx:alpine")
                .ports(&["80:80"])
                .depends_on(vec![Dependency::started("client"), Dependency::healthy("api")])
                .restart(Always),
        );
        services.insert(
            "azurite".to_string(),
            Service::new("mcr.microsoft.com/azure-storage/azurite")
                .ports(&["10000-10002:10000-10002"])
                .restart(Always),
        );

        Self { services }
    }

    /// Checks references, self-dependencies, health-gated dependencies
    /// without a health check and host port clashes.
    pub fn validate(&self) -> Result<()> {
        let mut host_ports: HashMap<u16, &str> = HashMap::new();

        for (name, service) in &self.services {
            for dep in &service.depends_on {
                if dep.service == *name {
                    return Err(Error::InvalidTopology(format!("{} depends on itself", name)));
                }
                let Some(target) = self.services.get(&dep.service) else {
                    return Err(Error::InvalidTopology(format!(
                        "{} depends on unknown service {}",
                        name, dep.service
                    )));
                };
                if dep.condition == Condition::ServiceHealthy && target.healthcheck.is_none() {
                    return Err(Error::InvalidTopology(format!(
                        "{} waits for {} to be healthy but {} has no health check",
                        name, dep.service, dep.service
                    )));
                }
            }

            if service.replicas == 0 {
                return Err(Error::InvalidTopology(format!("{} has zero replicas", name)));
            }

            for mapping in service.port_mappings()? {
                if let Some(other) = host_ports.insert(mapping.host, name.as_str()) {
                    return Err(Error::InvalidTopology(format!(
                        "host port {} published by both {} and {}",
                        mapping.host, other, name
                    )));
                }
            }
        }

        Ok(())
    }

    /// Groups services so that each one starts after every service it
    /// depends on. Names within a wave are sorted.
    pub fn startup_waves(&self) -> Result<Vec<Vec<String>>> {
        self.validate()?;

        let mut graph: DiGraph<&str, Condition> = DiGraph::new();
        let nodes: HashMap<&str, NodeIndex> = self
            .services
            .keys()
            .map(|name| (name.as_str(), graph.add_node(name.as_str())))
            .collect();

        for (name, service) in &self.services {
            for dep in &service.depends_on {
                graph.add_edge(nodes[dep.service.as_str()], nodes[name.as_str()], dep.condition);
            }
        }

        let order = toposort(&graph, None)
            .map_err(|cycle| Error::DependencyCycle(graph[cycle.node_id()].to_string()))?;

        let mut wave_of: HashMap<NodeIndex, usize> = HashMap::new();
        for node in &order {
            let wave = graph
                .neighbors_directed(*node, petgraph::Direction::Incoming)
                .map(|dep| wave_of[&dep] + 1)
                .max()
                .unwrap_or(0);
            wave_of.insert(*node, wave);
        }

        let depth = wave_of.values().copied().max().map_or(0, |max| max + 1);
        let mut waves = vec![Vec::new(); depth];
        for (node, wave) in wave_of {
            waves[wave].push(graph[node].to_string());
        }
        for wave in &mut waves {
            wave.sort();
        }

        Ok(waves)
    }

    /// Services that must be healthy before `name` may start.
    pub fn health_gates(&self, name: &str) -> Vec<&str> {
        self.services
            .get(name)
            .map(|service| {
                service
                    .depends_on
                    .iter()
                    .filter(|dep| dep.condition == Condition::ServiceHealthy)
                    .map(|dep| dep.service.as_str())
                    .collect()
            })
            .unwrap_or_default()
    }
}
