//! Command line interface of the controller.

use std::{net::SocketAddr, time::Duration};

use nightjar_core::notify::DetailLevel;

use crate::namespace::WatchNamespace;

#[derive(clap::Parser, Debug)]
#[command(
    name = "nightjar-operator",
    author,
    version,
    about = "Explains which cluster constraints affect which workloads"
)]
pub struct Opts {
    #[clap(subcommand)]
    pub command: Command,
}

#[derive(clap::Parser, Debug)]
pub enum Command {
    /// Print the ConstraintReport CRD schema
    Crd,
    /// Run the controller
    Run(RunOptions),
}

#[derive(clap::Parser, Debug, PartialEq)]
pub struct RunOptions {
    /// Address the Prometheus metrics endpoint binds to.
    #[arg(long, env = "NIGHTJAR_METRICS_BIND_ADDRESS", default_value = "0.0.0.0:8080")]
    pub metrics_bind_address: SocketAddr,

    /// Address the liveness/readiness probe endpoint binds to.
    #[arg(
        long,
        env = "NIGHTJAR_HEALTH_PROBE_BIND_ADDRESS",
        default_value = "0.0.0.0:8081"
    )]
    pub health_probe_bind_address: SocketAddr,

    /// Take a leadership lease so that at most one replica mutates cluster
    /// state.
    #[arg(long, env = "NIGHTJAR_LEADER_ELECT")]
    pub leader_elect: bool,

    /// How often the cluster's API surface is re-enumerated for newly
    /// installed or removed resource types.
    #[arg(
        long,
        env = "NIGHTJAR_RESCAN_INTERVAL",
        default_value = "5m",
        value_parser = humantime::parse_duration
    )]
    pub rescan_interval: Duration,

    /// Consume network drop observations from a Hubble relay.
    #[arg(long, env = "NIGHTJAR_HUBBLE_ENABLED")]
    pub hubble_enabled: bool,

    #[arg(
        long,
        env = "NIGHTJAR_HUBBLE_RELAY_ADDRESS",
        default_value = "http://hubble-relay.kube-system.svc.cluster.local:80"
    )]
    pub hubble_relay_address: String,

    /// How much notifications reveal: summary, detailed or full.
    #[arg(long, env = "NIGHTJAR_DETAIL_LEVEL", default_value = "summary")]
    pub detail_level: DetailLevel,

    /// Provides a specific namespace to watch (instead of watching all
    /// namespaces).
    #[arg(long, env = "NIGHTJAR_WATCH_NAMESPACE", default_value = "")]
    pub watch_namespace: WatchNamespace,

    /// The namespace this controller runs in; holds the leadership lease.
    #[arg(
        long,
        env = "NIGHTJAR_OPERATOR_NAMESPACE",
        default_value = "nightjar-system"
    )]
    pub operator_namespace: String,
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[test]
    fn run_options_parse_with_defaults() {
        let opts = Opts::parse_from(["nightjar-operator", "run"]);
        let Command::Run(run) = opts.command else {
            panic!("expected run command");
        };
        assert_eq!(run.rescan_interval, Duration::from_secs(300));
        assert_eq!(run.detail_level, DetailLevel::Summary);
        assert_eq!(run.watch_namespace, WatchNamespace::All);
        assert!(!run.leader_elect);
        assert!(!run.hubble_enabled);
    }

    #[test]
    fn flags_override_defaults() {
        let opts = Opts::parse_from([
            "nightjar-operator",
            "run",
            "--rescan-interval",
            "1s",
            "--detail-level",
            "full",
            "--watch-namespace",
            "demo",
            "--leader-elect",
            "--hubble-enabled",
            "--hubble-relay-address",
            "http://localhost:4245",
        ]);
        let Command::Run(run) = opts.command else {
            panic!("expected run command");
        };
        assert_eq!(run.rescan_interval, Duration::from_secs(1));
        assert_eq!(run.detail_level, DetailLevel::Full);
        assert_eq!(run.watch_namespace, WatchNamespace::One("demo".to_string()));
        assert!(run.leader_elect);
        assert!(run.hubble_enabled);
    }
}
