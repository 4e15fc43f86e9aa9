//! Sequential capability negotiation against the bootstrap broker.
//!
//! Exactly one request is outstanding at a time. Every grant result restarts
//! the evaluation from the first capability, so the base capability is always
//! settled before any named capability is asked for.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::error::Result;

/// Name of the capability that lets the primary service follow the broker at startup.
pub const FOLLOW_STARTUP_CAPABILITY: &str = "follow_startup";

/// A named permission the broker can grant. The empty name is the base capability.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Capability(String);

impl Capability {
    pub fn base() -> Self {
        Self(String::new())
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn is_base(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_base() {
            f.write_str("<base>")
        } else {
            f.write_str(&self.0)
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum GrantState {
    #[default]
    Unknown,
    Denied,
    Granted,
}

/// Result of a capability request as delivered by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GrantResult {
    pub request_code: i32,
    pub allowed: bool,
    /// The broker answered without prompting because the grant already existed.
    pub already_granted: bool,
}

/// A capability together with the request code its results are correlated by.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityRequest {
    #[serde(rename = "name")]
    pub capability: Capability,
    pub request_code: i32,
}

impl CapabilityRequest {
    pub fn new(capability: Capability, request_code: i32) -> Self {
        Self {
            capability,
            request_code,
        }
    }
}

/// Base capability first, then the startup-follow capability.
pub fn default_capability_requests() -> Vec<CapabilityRequest> {
    vec![
        CapabilityRequest::new(Capability::base(), 1),
        CapabilityRequest::new(Capability::named(FOLLOW_STARTUP_CAPABILITY), 2),
    ]
}

/// Per-process record of what the broker said about each capability.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PermissionRecord {
    states: BTreeMap<Capability, GrantState>,
}

impl PermissionRecord {
    pub fn get(&self, capability: &Capability) -> GrantState {
        self.states.get(capability).copied().unwrap_or_default()
    }

    fn set(&mut self, capability: &Capability, state: GrantState) -> GrantState {
        self.states
            .insert(capability.clone(), state)
            .unwrap_or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Capability, GrantState)> {
        self.states.iter().map(|(cap, state)| (cap, *state))
    }
}

/// Capability check/request surface of the bootstrap broker. Results of
/// `request_permission` arrive asynchronously as [`GrantResult`]s.
#[async_trait]
pub trait PermissionBroker: Send + Sync {
    async fn check_self_permission(&self, capability: &Capability) -> Result<bool>;

    async fn request_permission(&self, capability: &Capability, request_code: i32) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Evaluation {
    /// A request was just issued; nothing more happens until its result arrives.
    Requested(Capability),
    /// An earlier request is still waiting for its result.
    Pending(Capability),
    /// The capability was refused and is not asked for again automatically.
    Denied(Capability),
    /// The broker could not be reached while asking for the capability.
    Unreachable(Capability),
    /// Every capability is granted; first report of this episode.
    FullyAuthorized,
    /// Every capability is granted and that was already reported.
    AlreadyAuthorized,
}

#[derive(Debug)]
pub struct PermissionNegotiator {
    requests: Vec<CapabilityRequest>,
    record: PermissionRecord,
    outstanding: Option<CapabilityRequest>,
    authorized_reported: bool,
}

impl PermissionNegotiator {
    /// `requests` is the fixed priority order capabilities are negotiated in.
    pub fn new(requests: Vec<CapabilityRequest>) -> Self {
        let mut record = PermissionRecord::default();
        for request in &requests {
            record.set(&request.capability, GrantState::Unknown);
        }
        Self {
            requests,
            record,
            outstanding: None,
            authorized_reported: false,
        }
    }

    pub fn check_granted(&self, capability: &Capability) -> GrantState {
        self.record.get(capability)
    }

    pub fn record(&self) -> &PermissionRecord {
        &self.record
    }

    pub fn outstanding(&self) -> Option<&CapabilityRequest> {
        self.outstanding.as_ref()
    }

    pub fn is_fully_granted(&self) -> bool {
        self.requests
            .iter()
            .all(|request| self.record.get(&request.capability) == GrantState::Granted)
    }

    /// Starts a new authorization episode, e.g. after the broker went away.
    /// Grant states survive; the outstanding request and the "already
    /// reported" latch do not.
    pub fn reset_episode(&mut self) {
        self.outstanding = None;
        self.authorized_reported = false;
    }

    /// Walks the capabilities in priority order and requests the first one
    /// that is not granted.
    pub async fn evaluate(&mut self, broker: &dyn PermissionBroker) -> Evaluation {
        if let Some(pending) = &self.outstanding {
            debug!(
                "capability {} still has request {} outstanding",
                pending.capability, pending.request_code
            );
            return Evaluation::Pending(pending.capability.clone());
        }

        for index in 0..self.requests.len() {
            let request = self.requests[index].clone();
            let capability = &request.capability;
            let granted = match broker.check_self_permission(capability).await {
                Ok(granted) => granted,
                Err(err) => {
                    warn!("failed to check capability {capability}: {err}");
                    false
                }
            };

            if granted {
                self.update(capability, GrantState::Granted);
                continue;
            }

            match self.record.get(capability) {
                GrantState::Denied => {
                    info!("capability {capability} was denied; waiting for an external grant");
                    return Evaluation::Denied(capability.clone());
                }
                GrantState::Granted => {
                    warn!("capability {capability} is no longer granted");
                    self.update(capability, GrantState::Unknown);
                }
                GrantState::Unknown => {}
            }

            info!(
                "requesting capability {capability} (request code {})",
                request.request_code
            );
            return match broker
                .request_permission(capability, request.request_code)
                .await
            {
                Ok(()) => {
                    self.outstanding = Some(request.clone());
                    Evaluation::Requested(request.capability)
                }
                Err(err) => {
                    warn!("failed to request capability {capability}: {err}");
                    Evaluation::Unreachable(request.capability)
                }
            };
        }

        if self.authorized_reported {
            Evaluation::AlreadyAuthorized
        } else {
            info!("all capabilities granted");
            self.authorized_reported = true;
            Evaluation::FullyAuthorized
        }
    }

    /// Records a grant result and re-runs the evaluation from the top.
    pub async fn on_grant_result(
        &mut self,
        result: GrantResult,
        broker: &dyn PermissionBroker,
    ) -> Evaluation {
        let matched = self
            .requests
            .iter()
            .find(|request| request.request_code == result.request_code)
            .map(|request| request.capability.clone());

        match matched {
            Some(capability) => {
                let state = if result.allowed {
                    GrantState::Granted
                } else {
                    GrantState::Denied
                };
                info!(
                    "capability {capability} {} (request code {}, already granted: {})",
                    if result.allowed { "granted" } else { "denied" },
                    result.request_code,
                    result.already_granted
                );
                self.update(&capability, state);
            }
            None => warn!(
                "ignoring grant result for unknown request code {}",
                result.request_code
            ),
        }

        if self
            .outstanding
            .as_ref()
            .is_some_and(|pending| pending.request_code == result.request_code)
        {
            self.outstanding = None;
        }

        self.evaluate(broker).await
    }

    fn update(&mut self, capability: &Capability, state: GrantState) {
        let previous = self.record.set(capability, state);
        if previous == GrantState::Granted && state != GrantState::Granted {
            self.authorized_reported = false;
        }
    }
}
