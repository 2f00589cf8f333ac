//! The long-running flow observation task.
//!
//! Keeps one `GetFlows` stream open against the relay, filtered server-side
//! to drop verdicts, and forwards enriched [`FlowDrop`] records. Reconnects
//! with full-jitter backoff; the rest of the system works unchanged when the
//! relay is absent.

use std::collections::BTreeMap;

use nightjar_core::backoff::Backoff;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    client::ObserverClient,
    proto::{Flow, FlowFilter, GetFlowsRequest, Layer4, Verdict},
};

/// One observed network drop, attributed to pods on both ends.
#[derive(Clone, Debug)]
pub struct FlowDrop {
    pub source: FlowEndpoint,
    pub destination: FlowEndpoint,
    pub dest_port: u16,
    pub protocol: String,
    pub reason: String,
}

#[derive(Clone, Debug, Default)]
pub struct FlowEndpoint {
    pub namespace: String,
    pub pod: String,
    pub labels: BTreeMap<String, String>,
}

pub struct FlowObserver {
    address: String,
}

impl FlowObserver {
    pub fn new(address: String) -> Self {
        Self { address }
    }

    /// Streams drops into `tx` until shutdown. Never returns an error: relay
    /// trouble is logged and retried.
    pub async fn run(self, tx: mpsc::Sender<FlowDrop>, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);
        let mut backoff = Backoff::watch();

        loop {
            tokio::select! {
                () = &mut shutdown => {
                    info!("flow observer shutting down");
                    return;
                }
                outcome = self.stream_once(&tx) => match outcome {
                    StreamEnd::SinkClosed => return,
                    StreamEnd::Disconnected => {
                        let delay = backoff.next_delay();
                        warn!(delay = ?delay, "flow relay stream ended, reconnecting");
                        tokio::select! {
                            () = &mut shutdown => return,
                            () = tokio::time::sleep(delay) => {}
                        }
                    }
                }
            }
        }
    }

    async fn stream_once(&self, tx: &mpsc::Sender<FlowDrop>) -> StreamEnd {
        let mut client = match ObserverClient::connect(self.address.clone()).await {
            Ok(client) => client,
            Err(error) => {
                debug!(%error, address = %self.address, "failed to connect to flow relay");
                return StreamEnd::Disconnected;
            }
        };

        let request = GetFlowsRequest {
            number: 0,
            follow: true,
            whitelist: vec![FlowFilter {
                verdict: vec![Verdict::Dropped as i32],
            }],
            blacklist: Vec::new(),
        };

        let mut stream = match client.get_flows(request).await {
            Ok(response) => response.into_inner(),
            Err(status) => {
                debug!(%status, "flow relay rejected GetFlows");
                return StreamEnd::Disconnected;
            }
        };
        info!(address = %self.address, "flow relay stream established");

        loop {
            match stream.message().await {
                Ok(Some(response)) => {
                    let Some(drop) = response.flow.as_ref().and_then(flow_drop) else {
                        continue;
                    };
                    if tx.send(drop).await.is_err() {
                        return StreamEnd::SinkClosed;
                    }
                }
                Ok(None) => return StreamEnd::Disconnected,
                Err(status) => {
                    debug!(%status, "flow relay stream failed");
                    return StreamEnd::Disconnected;
                }
            }
        }
    }
}

enum StreamEnd {
    Disconnected,
    SinkClosed,
}

fn flow_drop(flow: &Flow) -> Option<FlowDrop> {
    if flow.verdict != Verdict::Dropped as i32 {
        return None;
    }
    let source = endpoint(flow.source.as_ref()?);
    let destination = endpoint(flow.destination.as_ref()?);
    let (dest_port, protocol) = layer4(flow.l4.as_ref()?)?;

    Some(FlowDrop {
        source,
        destination,
        dest_port,
        protocol,
        reason: flow.drop_reason_desc.clone(),
    })
}

fn endpoint(endpoint: &crate::proto::Endpoint) -> FlowEndpoint {
    FlowEndpoint {
        namespace: endpoint.namespace.clone(),
        pod: endpoint.pod_name.clone(),
        labels: parse_labels(&endpoint.labels),
    }
}

fn layer4(l4: &Layer4) -> Option<(u16, String)> {
    if let Some(tcp) = &l4.tcp {
        return Some((tcp.destination_port as u16, "TCP".to_string()));
    }
    if let Some(udp) = &l4.udp {
        return Some((udp.destination_port as u16, "UDP".to_string()));
    }
    None
}

/// Cilium reports labels as `source:key=value` strings (`k8s:app=web`).
/// Only the Kubernetes-sourced labels are meaningful for selector matching.
fn parse_labels(labels: &[String]) -> BTreeMap<String, String> {
    labels
        .iter()
        .filter_map(|label| {
            let label = label.strip_prefix("k8s:").unwrap_or(label);
            if label.contains(':') {
                // A remaining prefix means a non-Kubernetes label source.
                return None;
            }
            let (key, value) = label.split_once('=')?;
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}
