//! Coordination store path layout
//!
//! Every path segment built here goes through validated identifiers, so
//! the layout stays flat and parseable:
//!
//! ```text
//! /discovery/{service}/{host}:{port}            ephemeral endpoint node
//! /runs/{run}/instances/{target}                ephemeral target liveness node
//! /runs/{run}/targets/{target}/commands/cmd-N   persistent envelope queue
//! /runs/{run}/targets/{target}/acks/{envelope}  persistent acknowledgements
//! ```

/// Root of the discovery namespace.
pub const DISCOVERY_ROOT: &str = "/discovery";

/// Root of the per-run namespace.
pub const RUNS_ROOT: &str = "/runs";

/// Parent path of all endpoints announced for one service.
pub fn discovery_service(service_name: &str) -> String {
    format!("{}/{}", DISCOVERY_ROOT, service_name)
}

/// Ephemeral node path of one announced endpoint.
pub fn discovery_endpoint(service_name: &str, host: &str, port: u16) -> String {
    format!("{}/{}:{}", discovery_service(service_name), host, port)
}

/// Parent path of a run's live target instances.
pub fn run_instances(run_id: &str) -> String {
    format!("{}/{}/instances", RUNS_ROOT, run_id)
}

/// Ephemeral liveness node of one target.
pub fn run_instance(run_id: &str, target_id: &str) -> String {
    format!("{}/{}", run_instances(run_id), target_id)
}

/// Envelope queue of one target. Sequential children are created under
/// this path with the `cmd-` prefix.
pub fn target_commands(run_id: &str, target_id: &str) -> String {
    format!("{}/{}/targets/{}/commands", RUNS_ROOT, run_id, target_id)
}

/// Prefix handed to sequential create for a new envelope.
pub fn target_command_prefix(run_id: &str, target_id: &str) -> String {
    format!("{}/cmd-", target_commands(run_id, target_id))
}

/// Acknowledgement directory of one target.
pub fn target_acks(run_id: &str, target_id: &str) -> String {
    format!("{}/{}/targets/{}/acks", RUNS_ROOT, run_id, target_id)
}

/// Acknowledgement node of one envelope.
pub fn target_ack(run_id: &str, target_id: &str, envelope_id: &str) -> String {
    format!("{}/{}", target_acks(run_id, target_id), envelope_id)
}

/// Last path segment of a node path.
pub fn node_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discovery_paths() {
        assert_eq!(discovery_service("web"), "/discovery/web");
        assert_eq!(
            discovery_endpoint("web", "10.0.0.1", 8080),
            "/discovery/web/10.0.0.1:8080"
        );
    }

    #[test]
    fn test_run_paths() {
        assert_eq!(run_instances("run-1"), "/runs/run-1/instances");
        assert_eq!(run_instance("run-1", "r1"), "/runs/run-1/instances/r1");
        assert_eq!(
            target_commands("run-1", "r1"),
            "/runs/run-1/targets/r1/commands"
        );
        assert_eq!(
            target_command_prefix("run-1", "r1"),
            "/runs/run-1/targets/r1/commands/cmd-"
        );
        assert_eq!(
            target_ack("run-1", "r1", "e-9"),
            "/runs/run-1/targets/r1/acks/e-9"
        );
    }

    #[test]
    fn test_node_name() {
        assert_eq!(node_name("/discovery/web/10.0.0.1:8080"), "10.0.0.1:8080");
        assert_eq!(node_name("plain"), "plain");
    }
}
