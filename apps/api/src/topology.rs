//! Process topology: the three long-running processes and how they are supervised.

use std::collections::BTreeMap;
use std::fmt::{self, Write as _};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const QUEUE_ADDRESS_VAR: &str = "REDIS_URL";
pub const CONCURRENCY_VAR: &str = "WORKER_CONCURRENCY";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProcessRole {
    ApiServer,
    Worker,
    Scheduler,
}

impl ProcessRole {
    pub const ALL: [ProcessRole; 3] = [
        ProcessRole::ApiServer,
        ProcessRole::Worker,
        ProcessRole::Scheduler,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessRole::ApiServer => "api-server",
            ProcessRole::Worker => "worker",
            ProcessRole::Scheduler => "scheduler",
        }
    }

    /// Name of the binary target that runs this role.
    pub fn binary(&self) -> &'static str {
        match self {
            ProcessRole::ApiServer => "api",
            ProcessRole::Worker => "worker",
            ProcessRole::Scheduler => "scheduler",
        }
    }
}

impl fmt::Display for ProcessRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessRole {
    type Err = TopologyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ProcessRole::ALL
            .into_iter()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| TopologyError::UnknownRole(s.to_string()))
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TopologyError {
    #[error("Unknown process role: {0}")]
    UnknownRole(String),

    #[error("No process definition for role {0}")]
    MissingRole(ProcessRole),

    #[error("Role {0} is defined more than once")]
    DuplicateRole(ProcessRole),

    #[error("Process {0} does not set {QUEUE_ADDRESS_VAR}")]
    MissingQueueAddress(String),

    #[error("Process {0} points at a different queue backend than the others")]
    QueueAddressMismatch(String),

    #[error("{CONCURRENCY_VAR} belongs to the worker, but process {0} sets it")]
    ConcurrencyOutsideWorker(String),
}

/// One supervised process: what to run, where, and with which environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessDefinition {
    pub name: String,
    pub role: ProcessRole,
    pub command: String,
    pub directory: String,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

impl ProcessDefinition {
    pub fn new(role: ProcessRole, command: impl Into<String>, directory: impl Into<String>) -> Self {
        Self {
            name: role.as_str().to_string(),
            role,
            command: command.into(),
            directory: directory.into(),
            environment: BTreeMap::new(),
        }
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    /// The api server must let in-flight requests finish; the worker its running tasks.
    fn stop_wait_secs(&self) -> u32 {
        match self.role {
            ProcessRole::Worker => 300,
            ProcessRole::ApiServer => 30,
            ProcessRole::Scheduler => 10,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    pub processes: Vec<ProcessDefinition>,
}

impl Topology {
    pub fn new(processes: Vec<ProcessDefinition>) -> Self {
        Self { processes }
    }

    /// The deployment this repo ships: one process per role sharing `redis_url`.
    pub fn standard(
        bin_dir: &str,
        directory: &str,
        redis_url: &str,
        database_url: &str,
        worker_concurrency: usize,
    ) -> Self {
        let bin_dir = bin_dir.trim_end_matches('/');
        let processes = ProcessRole::ALL
            .into_iter()
            .map(|role| {
                let def = ProcessDefinition::new(role, format!("{bin_dir}/{}", role.binary()), directory)
                    .env(QUEUE_ADDRESS_VAR, redis_url)
                    .env("DATABASE_URL", database_url);
                match role {
                    ProcessRole::Worker => def.env(CONCURRENCY_VAR, worker_concurrency.to_string()),
                    ProcessRole::ApiServer => def.env("RUN_MIGRATIONS", "true"),
                    ProcessRole::Scheduler => def,
                }
            })
            .collect();
        Self { processes }
    }

    pub fn validate(&self) -> Result<(), TopologyError> {
        for role in ProcessRole::ALL {
            match self.processes.iter().filter(|p| p.role == role).count() {
                0 => return Err(TopologyError::MissingRole(role)),
                1 => {}
                _ => return Err(TopologyError::DuplicateRole(role)),
            }
        }

        let mut queue_address: Option<&str> = None;
        for process in &self.processes {
            let address = process
                .environment
                .get(QUEUE_ADDRESS_VAR)
                .ok_or_else(|| TopologyError::MissingQueueAddress(process.name.clone()))?;
            match queue_address {
                None => queue_address = Some(address),
                Some(first) if first != address => {
                    return Err(TopologyError::QueueAddressMismatch(process.name.clone()))
                }
                Some(_) => {}
            }

            if process.role != ProcessRole::Worker
                && process.environment.contains_key(CONCURRENCY_VAR)
            {
                return Err(TopologyError::ConcurrencyOutsideWorker(process.name.clone()));
            }
        }
        Ok(())
    }

    /// Renders the topology as a supervisord configuration. Validates first.
    pub fn render_supervisor(&self) -> Result<String, TopologyError> {
        self.validate()?;

        let mut out = String::from(
            "[supervisord]\nnodaemon=true\nlogfile=/dev/null\nlogfile_maxbytes=0\n",
        );
        for process in &self.processes {
            let environment = process
                .environment
                .iter()
                .map(|(k, v)| format!("{k}=\"{}\"", v.replace('"', "\\\"")))
                .collect::<Vec<_>>()
                .join(",");

            // Writing into a String cannot fail.
            let _ = write!(
                out,
                "\n[program:{name}]\n\
                 command={command}\n\
                 directory={directory}\n\
                 environment={environment}\n\
                 autostart=true\n\
                 autorestart=true\n\
                 startretries=10\n\
                 stopsignal=TERM\n\
                 stopwaitsecs={stop_wait}\n\
                 stdout_logfile=/dev/stdout\n\
                 stdout_logfile_maxbytes=0\n\
                 redirect_stderr=true\n",
                name = process.name,
                command = process.command,
                directory = process.directory,
                stop_wait = process.stop_wait_secs(),
            );
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn standard() -> Topology {
        Topology::standard(
            "/app/bin/",
            "/app",
            "redis://redis:6379/0",
            "postgres://cv:cv@db/cv",
            4,
        )
    }

    #[test]
    fn test_role_round_trips_through_str() {
        for role in ProcessRole::ALL {
            assert_eq!(role.as_str().parse::<ProcessRole>().unwrap(), role);
        }
        assert_eq!(
            "beat".parse::<ProcessRole>(),
            Err(TopologyError::UnknownRole("beat".to_string()))
        );
    }

    #[test]
    fn test_standard_topology_is_valid() {
        let topology = standard();
        assert!(topology.validate().is_ok());
        let worker = topology
            .processes
            .iter()
            .find(|p| p.role == ProcessRole::Worker)
            .unwrap();
        assert_eq!(worker.command, "/app/bin/worker");
        assert_eq!(worker.environment[CONCURRENCY_VAR], "4");
    }

    #[test]
    fn test_missing_and_duplicate_roles() {
        let mut topology = standard();
        topology.processes.retain(|p| p.role != ProcessRole::Scheduler);
        assert_eq!(
            topology.validate(),
            Err(TopologyError::MissingRole(ProcessRole::Scheduler))
        );

        let mut topology = standard();
        let mut second = topology.processes[1].clone();
        second.name = "worker-2".to_string();
        topology.processes.push(second);
        assert_eq!(
            topology.validate(),
            Err(TopologyError::DuplicateRole(ProcessRole::Worker))
        );
    }

    #[test]
    fn test_all_processes_share_one_queue() {
        let mut topology = standard();
        topology.processes[2]
            .environment
            .insert(QUEUE_ADDRESS_VAR.to_string(), "redis://other:6379/0".to_string());
        assert_eq!(
            topology.validate(),
            Err(TopologyError::QueueAddressMismatch("scheduler".to_string()))
        );

        let mut topology = standard();
        topology.processes[0].environment.remove(QUEUE_ADDRESS_VAR);
        assert_eq!(
            topology.validate(),
            Err(TopologyError::MissingQueueAddress("api-server".to_string()))
        );
    }

    #[test]
    fn test_concurrency_only_on_worker() {
        let mut topology = standard();
        topology.processes[2]
            .environment
            .insert(CONCURRENCY_VAR.to_string(), "8".to_string());
        assert_eq!(
            topology.validate(),
            Err(TopologyError::ConcurrencyOutsideWorker("scheduler".to_string()))
        );
    }

    #[test]
    fn test_render_supervisor() {
        let rendered = standard().render_supervisor().unwrap();
        assert!(rendered.starts_with("[supervisord]\nnodaemon=true\n"));
        assert!(rendered.contains("[program:api-server]\ncommand=/app/bin/api\n"));
        assert!(rendered.contains("[program:worker]\ncommand=/app/bin/worker\n"));
        assert!(rendered.contains("[program:scheduler]\ncommand=/app/bin/scheduler\n"));
        assert!(rendered.contains(
            "environment=DATABASE_URL=\"postgres://cv:cv@db/cv\",REDIS_URL=\"redis://redis:6379/0\",WORKER_CONCURRENCY=\"4\"\n"
        ));
        assert!(rendered.contains("stopwaitsecs=300"));
        assert_eq!(rendered.matches("[program:").count(), 3);
    }

    #[test]
    fn test_checked_in_supervisor_config_is_current() {
        let rendered = Topology::standard(
            "/app/bin",
            "/app",
            "%(ENV_REDIS_URL)s",
            "%(ENV_DATABASE_URL)s",
            4,
        )
        .render_supervisor()
        .unwrap();
        assert_eq!(rendered, include_str!("../../../deploy/supervisord.conf"));
    }

    #[test]
    fn test_render_rejects_invalid_topology() {
        assert!(Topology::default().render_supervisor().is_err());
    }
}
