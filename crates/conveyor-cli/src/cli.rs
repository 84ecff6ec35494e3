use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "conveyor")]
#[command(about = "Conveyor - distributed task queue", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Settings file (defaults to ./conveyor.toml when present)
    #[arg(long, global = true, env = "CONVEYOR_CONFIG")]
    pub config: Option<PathBuf>,

    /// API base URL for client commands
    #[arg(long, global = true, env = "CONVEYOR_API_URL")]
    pub api_url: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the API server
    Serve {
        /// Port to listen on
        #[arg(long)]
        port: Option<u16>,

        /// Also run a worker pool in this process
        #[arg(long)]
        with_worker: bool,

        /// Also run the beat in this process
        #[arg(long)]
        with_beat: bool,
    },

    /// Start a worker pool
    Worker {
        /// Concurrent tasks
        #[arg(long)]
        concurrency: Option<usize>,
    },

    /// Start the periodic task emitter
    Beat {
        /// Schedule file
        #[arg(long)]
        schedules: Option<PathBuf>,
    },

    /// Queue a task through the API
    Submit {
        /// Registered task name
        name: String,

        /// JSON payload
        #[arg(long, default_value = "null")]
        payload: String,

        #[arg(long)]
        queue: Option<String>,

        #[arg(long)]
        max_retries: Option<u32>,

        /// Wait for the task to finish
        #[arg(long)]
        wait: bool,

        /// Give up waiting after this many seconds
        #[arg(long, default_value = "60")]
        timeout: u64,
    },

    /// Show task status
    Status {
        /// Task ID
        task_id: String,

        /// Include execution logs
        #[arg(long)]
        logs: bool,
    },

    /// List recent tasks from history
    List {
        /// Filter by state
        #[arg(long)]
        state: Option<String>,

        /// Limit number of results
        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Show statistics
    Stats,

    /// Show tasks the workers gave up on
    Dead {
        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Initialize database
    InitDb,

    /// Delete finished tasks and their logs from history
    Purge {
        /// Keep tasks finished within this many days
        #[arg(long, default_value = "30")]
        older_than_days: u32,
    },

    /// Check that a service answers; exits non-zero when it does not
    Probe {
        #[arg(value_enum)]
        target: ProbeTarget,
    },

    /// Validate a stack descriptor and print its startup order
    Topology {
        /// Descriptor file (defaults to the built-in stack)
        #[arg(long)]
        file: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ProbeTarget {
    Api,
    Redis,
    Postgres,
    Broker,
    /// This host's worker pool is sending heartbeats
    Worker,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_is_well_formed() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_submit() {
        let cli = Cli::try_parse_from([
            "conveyor",
            "submit",
            "add",
            "--payload",
            r#"{"values":[1,2]}"#,
            "--wait",
        ])
        .unwrap();

        match cli.command {
            Commands::Submit { name, payload, wait, timeout, .. } => {
                assert_eq!(name, "add");
                assert_eq!(payload, r#"{"values":[1,2]}"#);
                assert!(wait);
                assert_eq!(timeout, 60);
            }
            _ => panic!("expected submit"),
        }
    }

    #[test]
    fn test_parse_probe_target() {
        let cli = Cli::try_parse_from(["conveyor", "probe", "postgres"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Probe { target: ProbeTarget::Postgres }
        ));
        assert!(Cli::try_parse_from(["conveyor", "probe", "mainframe"]).is_err());
    }

    #[test]
    fn test_parse_purge_and_dead() {
        let cli = Cli::try_parse_from(["conveyor", "purge", "--older-than-days", "7"]).unwrap();
        assert!(matches!(cli.command, Commands::Purge { older_than_days: 7 }));

        let cli = Cli::try_parse_from(["conveyor", "dead"]).unwrap();
        assert!(matches!(cli.command, Commands::Dead { limit: 20 }));
    }

    #[test]
    fn test_reference_stack_commands_parse() {
        let topology = conveyor_core::topology::Topology::reference();
        let mut checked = 0;

        for (name, service) in &topology.services {
            let mut argvs = vec![service.command.clone()];
            if let Some(check) = &service.healthcheck {
                argvs.push(check.test.iter().skip(1).cloned().collect());
            }

            for argv in argvs.into_iter().filter(|a| a.first().map(String::as_str) == Some("conveyor")) {
                if let Err(e) = Cli::try_parse_from(&argv) {
                    panic!("{} runs {:?}, which does not parse: {}", name, argv, e);
                }
                checked += 1;
            }
        }

        // serve, worker, beat and the api and worker health checks
        assert_eq!(checked, 5);
    }
}
