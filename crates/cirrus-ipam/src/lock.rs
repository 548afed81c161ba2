//! Allocator lock using Kubernetes Leases
//!
//! One Lease per lock key in the operator namespace. Acquisition is a
//! compare-and-swap on the Lease's resourceVersion: a write based on a stale
//! read fails with 409 and the attempt is repeated until the acquisition
//! timeout elapses. A holder that crashed is taken over once its lease
//! duration has passed without renewal.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, PostParams};
use kube::Client;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use cirrus_common::{Error, Result};

use crate::capabilities::{LockToken, Locker};

// A holder that stops renewing loses the lock after this long
const LEASE_DURATION: Duration = Duration::from_secs(60);
const RETRY_INTERVAL: Duration = Duration::from_millis(500);

/// Lease name for a lock key
pub fn lease_name(key: &str) -> String {
    format!("cirrus-ipam-{}", key)
}

/// [`Locker`] backed by coordination.k8s.io/v1 Leases
pub struct LeaseLocker {
    client: Client,
    namespace: String,
    identity: String,
    timeout: Duration,
    lease_duration: Duration,
    retry_interval: Duration,
}

impl LeaseLocker {
    /// Create a locker; `timeout` bounds every [`Locker::lock`] call
    pub fn new(client: Client, namespace: &str, identity: &str, timeout: Duration) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
            identity: identity.to_string(),
            timeout,
            lease_duration: LEASE_DURATION,
            retry_interval: RETRY_INTERVAL,
        }
    }

    fn api(&self) -> Api<Lease> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn lease_spec(&self, now: DateTime<Utc>, transitions: i32) -> LeaseSpec {
        LeaseSpec {
            holder_identity: Some(self.identity.clone()),
            lease_duration_seconds: Some(self.lease_duration.as_secs() as i32),
            acquire_time: Some(MicroTime(now)),
            renew_time: Some(MicroTime(now)),
            lease_transitions: Some(transitions),
            ..Default::default()
        }
    }

    /// One acquisition attempt; `Ok(None)` if someone else holds the lock
    async fn try_acquire(&self, name: &str) -> Result<Option<LockToken>> {
        let api = self.api();
        let now = Utc::now();
        let existing = api.get_opt(name).await?;

        match acquire_decision(existing.as_ref(), now) {
            AcquireDecision::Busy => Ok(None),
            AcquireDecision::Create => {
                let lease = Lease {
                    metadata: ObjectMeta {
                        name: Some(name.to_string()),
                        namespace: Some(self.namespace.clone()),
                        ..Default::default()
                    },
                    spec: Some(self.lease_spec(now, 0)),
                };
                match api.create(&PostParams::default(), &lease).await {
                    Ok(_) => Ok(Some(acquire_token(now))),
                    Err(kube::Error::Api(e)) if e.code == 409 => {
                        debug!(lock = %name, "lease creation conflict");
                        Ok(None)
                    }
                    Err(e) => Err(e.into()),
                }
            }
            AcquireDecision::TakeOver { transitions } => {
                let Some(mut updated) = existing else {
                    return Ok(None);
                };
                let previous = updated
                    .spec
                    .as_ref()
                    .and_then(|s| s.holder_identity.clone());
                updated.spec = Some(self.lease_spec(now, transitions + 1));

                match api.replace(name, &PostParams::default(), &updated).await {
                    Ok(_) => {
                        if previous.is_some() {
                            info!(lock = %name, ?previous, "took over expired lock");
                        }
                        Ok(Some(acquire_token(now)))
                    }
                    Err(kube::Error::Api(e)) if e.code == 409 => {
                        debug!(lock = %name, "lease takeover conflict");
                        Ok(None)
                    }
                    Err(e) => Err(e.into()),
                }
            }
        }
    }
}

/// What one acquisition attempt should do with the current lease
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum AcquireDecision {
    /// No lease exists yet
    Create,
    /// The lease is free or expired; replace it with this transition count
    TakeOver { transitions: i32 },
    /// A live holder owns the lease
    Busy,
}

/// Decide how to acquire given the lease as last read
///
/// Not re-entrant: passes for other clusters in this replica share the
/// identity, so a live lease is busy even when we are its holder.
fn acquire_decision(lease: Option<&Lease>, now: DateTime<Utc>) -> AcquireDecision {
    let Some(lease) = lease else {
        return AcquireDecision::Create;
    };
    let spec = lease.spec.as_ref();
    let holder = spec.and_then(|s| s.holder_identity.as_deref());
    if holder.is_some() && !is_expired(lease, now) {
        return AcquireDecision::Busy;
    }
    AcquireDecision::TakeOver {
        transitions: spec.and_then(|s| s.lease_transitions).unwrap_or(0),
    }
}

/// Token of an acquisition made at `acquired`, at the Lease's precision
fn acquire_token(acquired: DateTime<Utc>) -> LockToken {
    LockToken(acquired.to_rfc3339_opts(SecondsFormat::Micros, true))
}

/// Whether the lease is still held under `token`
///
/// The identity alone is not enough: after expiry another pass of this
/// replica may have taken the lease over under the same identity.
fn held_by(lease: &Lease, identity: &str, token: &LockToken) -> bool {
    let Some(spec) = lease.spec.as_ref() else {
        return false;
    };
    spec.holder_identity.as_deref() == Some(identity)
        && spec.acquire_time.as_ref().map(|t| acquire_token(t.0)).as_ref() == Some(token)
}

/// The lease with its holder cleared
fn released(lease: &Lease) -> Lease {
    let mut released = lease.clone();
    if let Some(ref mut spec) = released.spec {
        spec.holder_identity = None;
        spec.renew_time = None;
    }
    released
}

/// Repeat `attempt` every `retry_interval` until it yields a token or
/// `timeout` elapses
///
/// Failed attempts count as contention; only the deadline ends the loop.
async fn acquire_within<F, Fut>(
    name: &str,
    timeout: Duration,
    retry_interval: Duration,
    mut attempt: F,
) -> Result<LockToken>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<LockToken>>>,
{
    let started = Instant::now();
    let deadline = started + timeout;

    loop {
        match attempt().await {
            Ok(Some(token)) => return Ok(token),
            Ok(None) => {}
            Err(e) => {
                warn!(lock = %name, error = %e, "lock attempt failed");
            }
        }

        if Instant::now() + retry_interval > deadline {
            return Err(Error::LockTimeout {
                lock: name.to_string(),
                waited_secs: started.elapsed().as_secs(),
            });
        }
        tokio::time::sleep(retry_interval).await;
    }
}

fn is_expired(lease: &Lease, now: DateTime<Utc>) -> bool {
    let spec = lease.spec.as_ref();
    let renew_time = spec.and_then(|s| s.renew_time.as_ref());
    let duration_secs = spec.and_then(|s| s.lease_duration_seconds);
    match (renew_time, duration_secs) {
        (Some(rt), Some(duration)) => now > rt.0 + chrono::Duration::seconds(duration as i64),
        _ => true,
    }
}

#[async_trait]
impl Locker for LeaseLocker {
    async fn lock(&self, key: &str) -> Result<LockToken> {
        let name = lease_name(key);
        let lease = name.as_str();
        let token = acquire_within(lease, self.timeout, self.retry_interval, move || {
            LeaseLocker::try_acquire(self, lease)
        })
        .await?;
        debug!(lock = %name, identity = %self.identity, "lock acquired");
        Ok(token)
    }

    async fn unlock(&self, key: &str, token: &LockToken) -> Result<()> {
        let name = lease_name(key);
        let api = self.api();

        let Some(lease) = api.get_opt(&name).await? else {
            return Ok(());
        };
        if !held_by(&lease, &self.identity, token) {
            debug!(lock = %name, "not the holder, nothing to release");
            return Ok(());
        }

        match api.replace(&name, &PostParams::default(), &released(&lease)).await {
            Ok(_) => {
                debug!(lock = %name, "lock released");
                Ok(())
            }
            // Someone took it over after expiry; it is no longer ours to release
            Err(kube::Error::Api(e)) if e.code == 409 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
