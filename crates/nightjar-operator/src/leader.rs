//! Lease-based leader election.
//!
//! At most one replica may mutate cluster state (Events, annotations,
//! reports). Non-leaders keep their indexes warm and take over when the
//! lease expires.

use std::time::Duration;

use k8s_openapi::{
    api::coordination::v1::{Lease, LeaseSpec},
    apimachinery::pkg::apis::meta::v1::MicroTime,
    chrono::{TimeDelta, Utc},
};
use kube::{
    Api, Client,
    api::{ObjectMeta, PostParams},
};
use snafu::{ResultExt, Snafu};
use tokio::sync::watch;
use tracing::{debug, info, warn};

const LEASE_NAME: &str = "nightjar-controller-lock";
const LEASE_DURATION_SECONDS: i32 = 30;
const RENEW_INTERVAL: Duration = Duration::from_secs(10);

type Result<T, E = LeaseError> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum LeaseError {
    #[snafu(display("failed to read lease"))]
    ReadLease { source: kube::Error },

    #[snafu(display("failed to write lease"))]
    WriteLease { source: kube::Error },
}

pub struct LeaderElector {
    api: Api<Lease>,
    identity: String,
}

impl LeaderElector {
    pub fn new(client: &Client, namespace: &str) -> Self {
        let identity = std::env::var("HOSTNAME")
            .unwrap_or_else(|_| format!("nightjar-{pid}", pid = std::process::id()));
        Self {
            api: Api::namespaced(client.clone(), namespace),
            identity,
        }
    }

    /// Claims and renews the lease until shutdown, publishing leadership
    /// changes on `tx`. Lease API trouble demotes to non-leader and retries
    /// on the next tick.
    pub async fn run(self, tx: watch::Sender<bool>, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);
        let mut interval = tokio::time::interval(RENEW_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = &mut shutdown => break,
                _ = interval.tick() => {}
            }

            let leading = match self.try_acquire().await {
                Ok(leading) => leading,
                Err(error) => {
                    warn!(%error, "lease operation failed, dropping leadership");
                    false
                }
            };
            tx.send_if_modified(|current| {
                if *current != leading {
                    info!(leading, identity = %self.identity, "leadership changed");
                    *current = leading;
                    true
                } else {
                    false
                }
            });
        }

        // Releasing on the way out lets a standby take over immediately.
        if *tx.borrow() {
            if let Err(error) = self.release().await {
                debug!(%error, "failed to release lease on shutdown");
            }
        }
        let _ = tx.send(false);
    }

    async fn try_acquire(&self) -> Result<bool> {
        let Some(lease) = self.api.get_opt(LEASE_NAME).await.context(ReadLeaseSnafu)? else {
            return self.create().await;
        };

        let spec = lease.spec.clone().unwrap_or_default();
        let held_by_us = spec.holder_identity.as_deref() == Some(self.identity.as_str());

        if !held_by_us && !expired(&spec) {
            return Ok(false);
        }

        // Renewal and takeover both go through a compare-and-set replace on
        // the resource version we just read; losing the race means someone
        // else holds the lease.
        let transitions = spec.lease_transitions.unwrap_or_default() + i32::from(!held_by_us);
        let now = MicroTime(Utc::now());
        let updated = Lease {
            metadata: ObjectMeta {
                name: Some(LEASE_NAME.to_string()),
                namespace: lease.metadata.namespace.clone(),
                resource_version: lease.metadata.resource_version.clone(),
                ..ObjectMeta::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.identity.clone()),
                lease_duration_seconds: Some(LEASE_DURATION_SECONDS),
                acquire_time: if held_by_us {
                    spec.acquire_time.clone()
                } else {
                    Some(now.clone())
                },
                renew_time: Some(now),
                lease_transitions: Some(transitions),
                ..LeaseSpec::default()
            }),
        };

        match self
            .api
            .replace(LEASE_NAME, &PostParams::default(), &updated)
            .await
        {
            Ok(_) => Ok(true),
            Err(error) if is_conflict(&error) => Ok(false),
            Err(error) => Err(error).context(WriteLeaseSnafu),
        }
    }

    async fn create(&self) -> Result<bool> {
        let now = MicroTime(Utc::now());
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(LEASE_NAME.to_string()),
                ..ObjectMeta::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.identity.clone()),
                lease_duration_seconds: Some(LEASE_DURATION_SECONDS),
                acquire_time: Some(now.clone()),
                renew_time: Some(now),
                lease_transitions: Some(0),
                ..LeaseSpec::default()
            }),
        };
        match self.api.create(&PostParams::default(), &lease).await {
            Ok(_) => Ok(true),
            Err(error) if is_conflict(&error) => Ok(false),
            Err(error) => Err(error).context(WriteLeaseSnafu),
        }
    }

    async fn release(&self) -> Result<()> {
        let Some(lease) = self.api.get_opt(LEASE_NAME).await.context(ReadLeaseSnafu)? else {
            return Ok(());
        };
        let spec = lease.spec.clone().unwrap_or_default();
        if spec.holder_identity.as_deref() != Some(self.identity.as_str()) {
            return Ok(());
        }
        let released = Lease {
            metadata: ObjectMeta {
                name: Some(LEASE_NAME.to_string()),
                namespace: lease.metadata.namespace.clone(),
                resource_version: lease.metadata.resource_version.clone(),
                ..ObjectMeta::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: None,
                lease_transitions: spec.lease_transitions,
                ..LeaseSpec::default()
            }),
        };
        match self
            .api
            .replace(LEASE_NAME, &PostParams::default(), &released)
            .await
        {
            Ok(_) => Ok(()),
            Err(error) if is_conflict(&error) => Ok(()),
            Err(error) => Err(error).context(WriteLeaseSnafu),
        }
    }
}

fn expired(spec: &LeaseSpec) -> bool {
    let duration = i64::from(
        spec.lease_duration_seconds
            .unwrap_or(LEASE_DURATION_SECONDS),
    );
    let last = spec
        .renew_time
        .as_ref()
        .or(spec.acquire_time.as_ref())
        .map(|t| t.0);
    match last {
        // A lease that was never renewed or acquired is free to take.
        None => true,
        Some(last) => Utc::now() - last > TimeDelta::seconds(duration),
    }
}

fn is_conflict(error: &kube::Error) -> bool {
    matches!(error, kube::Error::Api(response) if response.code == 409)
}
