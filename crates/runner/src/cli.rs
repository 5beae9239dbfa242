//! Command-line interface.

use clap::{Parser, Subcommand};
use workflow::{InstanceId, WorkflowStatus};

/// Runs and inspects workflow instances.
#[derive(Debug, Parser)]
#[command(name = "workflow-runner", version)]
#[command(about = "Run and inspect durable workflow instances", long_about = None)]
pub struct Cli {
    /// Skip resuming unfinished instances before running a command
    #[arg(long, env = "WORKFLOW_NO_RECOVER")]
    pub no_recover: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Start a workflow and wait for its result. Ctrl-C requests cancellation.
    Run {
        /// Workflow id, e.g. createShipmentWorkflow
        workflow: String,

        /// Workflow input as a JSON document
        #[arg(short, long, default_value = "{}")]
        input: String,

        /// Run under this instance id; an existing instance is resumed
        #[arg(long)]
        instance_id: Option<InstanceId>,
    },

    /// Continue an instance from its last recorded state
    Resume { instance_id: InstanceId },

    /// Resume every running or compensating instance
    Recover,

    /// Show the result view of an instance
    Status { instance_id: InstanceId },

    /// List instance headers
    List {
        /// Only instances in this status
        #[arg(long)]
        status: Option<WorkflowStatus>,

        /// Only instances of this workflow
        #[arg(long)]
        workflow: Option<String>,

        #[arg(long, default_value_t = 50)]
        limit: usize,
    },

    /// Request cancellation of a running instance
    Cancel { instance_id: InstanceId },

    /// Remove a finished instance from the log
    Purge { instance_id: InstanceId },

    /// List the defined workflows
    Workflows,
}

impl Command {
    /// Commands that drive instances resume unfinished ones first.
    pub fn recovers_first(&self) -> bool {
        matches!(self, Command::Run { .. } | Command::Resume { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run() {
        let cli = Cli::try_parse_from([
            "workflow-runner",
            "run",
            "createShipmentWorkflow",
            "--input",
            r#"{"fulfillment_id":"ful_01"}"#,
        ])
        .unwrap();

        match cli.command {
            Command::Run {
                workflow,
                input,
                instance_id,
            } => {
                assert_eq!(workflow, "createShipmentWorkflow");
                assert_eq!(input, r#"{"fulfillment_id":"ful_01"}"#);
                assert!(instance_id.is_none());
            }
            other => panic!("unexpected command {other:?}"),
        }
        assert!(!cli.no_recover);
    }

    #[test]
    fn test_parse_list_filters() {
        let cli = Cli::try_parse_from([
            "workflow-runner",
            "--no-recover",
            "list",
            "--status",
            "compensating",
            "--limit",
            "5",
        ])
        .unwrap();

        assert!(cli.no_recover);
        match cli.command {
            Command::List { status, limit, .. } => {
                assert_eq!(status, Some(WorkflowStatus::Compensating));
                assert_eq!(limit, 5);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_instance_id_must_be_a_uuid() {
        let id = InstanceId::new().to_string();
        assert!(Cli::try_parse_from(["workflow-runner", "status", id.as_str()]).is_ok());
        assert!(Cli::try_parse_from(["workflow-runner", "status", "not-a-uuid"]).is_err());
    }

    #[test]
    fn test_recovers_first() {
        assert!(!Command::Recover.recovers_first());
        assert!(
            Command::Resume {
                instance_id: InstanceId::new()
            }
            .recovers_first()
        );
        assert!(!Command::Workflows.recovers_first());
    }
}
