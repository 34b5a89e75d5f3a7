use crate::axiom::Orchestrator;
use crate::error::Result;
use clap::{Parser, Subcommand};

// Console over the orchestrator. Holds no lifecycle logic of its own.
#[derive(Parser, Debug)]
#[command(name = "halodeck", author, version, about = "Module lifecycle console")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Show every module and its health
    Status,

    /// Show one module's health
    State { name: String },

    /// Start a module and its dependencies
    Start { name: String },

    /// Stop a module and everything depending on it
    Stop { name: String },

    /// Stop all modules, dependents first
    StopAll,

    /// Show what a module depends on and what depends on it
    Deps { name: String },

    // Show recent health transitions
    Logs {
        #[arg(long, default_value_t = 20)]
        tail: usize,
    },

    /// Boot autostart modules and serve until Ctrl-C
    Run,
}

impl Cli {
    pub fn run(self, orch: &Orchestrator) -> Result<()> {
        match self.command {
            Command::Status => {
                for (name, state) in orch.states() {
                    println!("{name:<20} {state}");
                }
                for entry in orch.waiting() {
                    println!("{:<20} waiting on {}", entry.dependent, entry.dependency);
                }
                Ok(())
            }
            Command::State { name } => {
                println!("{name}: {}", orch.state(&name)?);
                Ok(())
            }
            Command::Start { name } => {
                orch.start(&name)?;
                tracing::info!(module = %name, "started");
                println!("{name}: {}", orch.state(&name)?);
                Ok(())
            }
            Command::Stop { name } => {
                orch.stop(&name)?;
                tracing::info!(module = %name, "stopped");
                println!("{name}: {}", orch.state(&name)?);
                Ok(())
            }
            Command::StopAll => {
                orch.stop_all();
                tracing::info!("all modules stopped");
                Ok(())
            }
            Command::Deps { name } => {
                for dep in orch.dependencies(&name)? {
                    let kind = match (dep.mandatory, dep.start_blocking) {
                        (true, true) => "required",
                        (false, true) => "optional",
                        (_, false) => "soft",
                    };
                    println!("{name} -> {} ({kind})", dep.target);
                }
                for dependent in orch.dependents(&name)? {
                    println!("{dependent} -> {name}");
                }
                Ok(())
            }
            Command::Logs { tail } => {
                for event in orch.journal_tail(tail) {
                    println!(
                        "{} #{} {}: {} -> {}{}",
                        event.ts_ms,
                        event.seq,
                        event.module,
                        event.from,
                        event.to,
                        event.reason.map(|r| format!(" ({r})")).unwrap_or_default()
                    );
                }
                Ok(())
            }
            Command::Run => orch.run_until_ctrlc(),
        }
    }
}

// Testing CLI parsing
#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::HealthState;
    use crate::testkit::{inline_config, Probe};
    use std::sync::Arc;

    #[test]
    fn test_cli_status() {
        let cli = Cli::parse_from(["halodeck", "status"]);
        assert!(matches!(cli.command, Command::Status));
    }

    #[test]
    fn test_cli_start_stop() {
        match Cli::parse_from(["halodeck", "start", "catalog"]).command {
            Command::Start { name } => assert_eq!(name, "catalog"),
            other => panic!("Expected Start command, got {other:?}"),
        }
        assert!(matches!(Cli::parse_from(["halodeck", "stop-all"]).command, Command::StopAll));
    }

    #[test]
    fn test_cli_logs() {
        match Cli::parse_from(["halodeck", "logs", "--tail", "10"]).command {
            Command::Logs { tail } => assert_eq!(tail, 10),
            other => panic!("Expected Logs command, got {other:?}"),
        }
    }

    #[test]
    fn dispatch_drives_orchestrator() {
        let db = Probe::detached("db");
        let orch = Orchestrator::builder(Arc::new(inline_config()))
            .module(db.descriptor())
            .build()
            .unwrap();

        Cli::parse_from(["halodeck", "start", "db"]).run(&orch).unwrap();
        assert_eq!(orch.state("db").unwrap(), HealthState::RUNNING);

        Cli::parse_from(["halodeck", "stop", "db"]).run(&orch).unwrap();
        assert_eq!(orch.state("db").unwrap(), HealthState::STOPPED);

        assert!(Cli::parse_from(["halodeck", "state", "ghost"]).run(&orch).is_err());
    }
}
