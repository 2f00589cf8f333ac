//! Nightjar: explains which cluster constraints affect which workloads.
//!
//! Startup wires the subsystems together: the discovery engine feeds the
//! constraint index through the adapter registry, the correlator joins index
//! and workload state, and the dispatcher/annotator/reconciler trio turns
//! correlation results into Events, annotations and ConstraintReports.

use std::{sync::Arc, time::{Duration, Instant}};

use clap::Parser;
use kube::{Client, CustomResourceExt};
use nightjar_core::{
    adapter::{RegistryError, builtin_registry},
    index::ConstraintIndex,
    requirements::Evaluator,
};
use nightjar_hubble::FlowObserver;
use prometheus_client::registry::Registry;
use snafu::{ResultExt, Snafu};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{error, info, warn};

mod annotator;
mod cli;
mod consts;
mod correlator;
mod crd;
mod discovery;
mod dispatcher;
mod http;
mod leader;
mod logging;
mod metrics;
mod namespace;
mod report;
mod shutdown;
mod workloads;

use crate::{
    annotator::Annotator,
    cli::{Command, Opts, RunOptions},
    correlator::{Correlator, CorrelatorChannels},
    crd::ConstraintReport,
    discovery::{DiscoveryEngine, SyncGate},
    dispatcher::{Dispatcher, LogSink},
    leader::LeaderElector,
    metrics::Metrics,
    report::ReportReconciler,
    shutdown::{SHUTDOWN_DEADLINE, Shutdown},
    workloads::WorkloadCache,
};

const CHANNEL_CAPACITY: usize = 1024;
const EVALUATOR_CLEANUP_INTERVAL: Duration = Duration::from_secs(600);

type Result<T, E = StartupError> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
enum StartupError {
    #[snafu(display("failed to install signal handlers"))]
    InstallSignals { source: shutdown::SignalError },

    #[snafu(display("failed to create Kubernetes client from ambient credentials"))]
    CreateClient { source: kube::Error },

    #[snafu(display("failed to register built-in adapters"))]
    RegisterAdapters { source: RegistryError },

    #[snafu(display("failed to bind HTTP endpoint"))]
    BindEndpoint { source: http::HttpError },

    #[snafu(display("failed to serialize the ConstraintReport CRD"))]
    SerializeCrd { source: serde_yaml::Error },
}

#[tokio::main]
async fn main() {
    logging::initialize_logging("NIGHTJAR_OPERATOR_LOG", "nightjar-operator");

    let opts = Opts::parse();
    let outcome = match opts.command {
        Command::Crd => print_crd(),
        Command::Run(options) => run_controller(options).await,
    };

    if let Err(error) = outcome {
        error!(
            error = &error as &dyn std::error::Error,
            "fatal error, exiting"
        );
        std::process::exit(1);
    }
}

fn print_crd() -> Result<()> {
    let crd = serde_yaml::to_string(&ConstraintReport::crd()).context(SerializeCrdSnafu)?;
    print!("{crd}");
    Ok(())
}

async fn run_controller(options: RunOptions) -> Result<()> {
    let shutdown = Shutdown::install().context(InstallSignalsSnafu)?;
    let client = Client::try_default().await.context(CreateClientSnafu)?;

    // A registration conflict means two adapters would parse the same kind;
    // refusing to start beats parsing ambiguously.
    let registry = Arc::new(builtin_registry().context(RegisterAdaptersSnafu)?);
    let index = Arc::new(ConstraintIndex::new());
    let cache = WorkloadCache::default();
    let evaluator = Arc::new(Evaluator::new(Arc::clone(&index)));

    let mut prometheus = Registry::default();
    let metrics = Metrics::register(&mut prometheus);
    let prometheus = Arc::new(prometheus);

    // Bind both endpoints before spawning anything; an occupied port is a
    // fatal startup error.
    let probe_listener = http::bind(options.health_probe_bind_address)
        .await
        .context(BindEndpointSnafu)?;
    let metrics_listener = http::bind(options.metrics_bind_address)
        .await
        .context(BindEndpointSnafu)?;

    // Without leader election every replica acts as a leader.
    let (leader_tx, leader_rx) = watch::channel(!options.leader_elect);
    let leader_guard = if options.leader_elect {
        let elector = LeaderElector::new(&client, &options.operator_namespace);
        tokio::spawn(elector.run(leader_tx, shutdown.wait()));
        None
    } else {
        Some(leader_tx)
    };

    let (sync_gate, ready_rx) = SyncGate::new();
    let (heartbeat_tx, heartbeat_rx) = watch::channel(Instant::now());

    let (workload_tx, workload_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (notify_tx, notify_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (flow_notify_tx, flow_notify_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (flow_tx, flow_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (annotate_tx, annotate_rx) = mpsc::channel(CHANNEL_CAPACITY);
    index.set_annotator_sink(annotate_tx);

    let mut tasks: Vec<(&str, JoinHandle<()>)> = Vec::new();

    let probe_state = http::ProbeState {
        ready: ready_rx,
        heartbeat: heartbeat_rx,
    };
    tasks.push((
        "probe-server",
        tokio::spawn(log_failure(
            "probe-server",
            http::run_probe_server(probe_listener, probe_state, shutdown.wait()),
        )),
    ));
    tasks.push((
        "metrics-server",
        tokio::spawn(log_failure(
            "metrics-server",
            http::run_metrics_server(metrics_listener, prometheus, shutdown.wait()),
        )),
    ));

    let engine = DiscoveryEngine::new(
        client.clone(),
        Arc::clone(&registry),
        Arc::clone(&index),
        options.watch_namespace.clone(),
        options.rescan_interval,
        metrics.clone(),
        sync_gate,
        shutdown.clone(),
    );
    tasks.push(("discovery", tokio::spawn(engine.run())));

    tasks.push((
        "workload-informers",
        tokio::spawn(workloads::run_workload_informers(
            client.clone(),
            options.watch_namespace.clone(),
            cache.clone(),
            workload_tx,
            shutdown.clone(),
        )),
    ));

    let correlator = Correlator::new(
        Arc::clone(&index),
        cache.clone(),
        options.detail_level,
        metrics.clone(),
    );
    let channels = CorrelatorChannels {
        index_rx: index.subscribe(),
        workload_rx,
        flow_rx,
        notify_tx,
        flow_notify_tx,
        heartbeat: heartbeat_tx,
    };
    tasks.push((
        "correlator",
        tokio::spawn(correlator.run(channels, shutdown.clone())),
    ));

    let dispatcher = Dispatcher::new(
        client.clone(),
        options.detail_level,
        leader_rx.clone(),
        metrics.clone(),
        vec![Arc::new(LogSink)],
    );
    tasks.push((
        "dispatcher",
        tokio::spawn(dispatcher.run(notify_rx, flow_notify_rx, shutdown.clone())),
    ));

    let annotator = Annotator::new(
        client.clone(),
        Arc::clone(&index),
        cache.clone(),
        leader_rx.clone(),
    );
    tasks.push((
        "annotator",
        tokio::spawn(annotator.run(annotate_rx, shutdown.clone())),
    ));

    let reconciler = ReportReconciler::new(
        client.clone(),
        Arc::clone(&index),
        cache.clone(),
        Arc::clone(&evaluator),
        leader_rx,
        metrics.clone(),
    );
    tasks.push((
        "report-reconciler",
        tokio::spawn(reconciler.run(index.subscribe(), shutdown.clone())),
    ));

    if options.hubble_enabled {
        let observer = FlowObserver::new(options.hubble_relay_address.clone());
        tasks.push((
            "flow-observer",
            tokio::spawn(observer.run(flow_tx, shutdown.wait())),
        ));
        info!(address = %options.hubble_relay_address, "flow observation enabled");
    } else {
        // Dropping the sender parks the correlator's flow arm for good.
        drop(flow_tx);
    }

    tasks.push((
        "evaluator-cleanup",
        tokio::spawn(evaluator_cleanup(
            Arc::clone(&evaluator),
            cache.clone(),
            shutdown.clone(),
        )),
    ));

    info!(
        rescan_interval = ?options.rescan_interval,
        detail_level = %options.detail_level,
        leader_elect = options.leader_elect,
        "nightjar started"
    );

    shutdown.wait().await;
    info!(deadline = ?SHUTDOWN_DEADLINE, "shutdown signal received, draining tasks");

    let draining = futures::future::join_all(tasks.iter_mut().map(|(_, handle)| handle));
    if tokio::time::timeout(SHUTDOWN_DEADLINE, draining).await.is_err() {
        let stuck: Vec<&str> = tasks
            .iter()
            .filter(|(_, handle)| !handle.is_finished())
            .map(|(name, _)| *name)
            .collect();
        warn!(?stuck, "tasks exceeded the shutdown deadline, abandoning them");
    }

    drop(leader_guard);
    Ok(())
}

/// Expires requirements-evaluator debounce state for workloads that left the
/// cluster.
async fn evaluator_cleanup(
    evaluator: Arc<Evaluator>,
    cache: WorkloadCache,
    shutdown: Shutdown,
) {
    let mut stop = std::pin::pin!(shutdown.wait());
    let mut interval = tokio::time::interval(EVALUATOR_CLEANUP_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = &mut stop => return,
            _ = interval.tick() => evaluator.expire(&cache.refs()),
        }
    }
}

async fn log_failure(
    task: &'static str,
    fut: impl Future<Output = Result<(), http::HttpError>>,
) {
    if let Err(error) = fut.await {
        error!(task, error = &error as &dyn std::error::Error, "task failed");
    }
}
