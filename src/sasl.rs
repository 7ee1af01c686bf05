//! SASL mechanism registry.
//!
//! A mechanism is a chain of continuations. Each continuation gets the
//! hostname from `sasl-init` and the peer's latest response bytes, and
//! returns the next continuation (None when finished) plus a challenge to
//! send (empty for none). Finishing a mechanism means recording an outcome
//! on the [`SaslSession`]; the negotiator refuses to complete without one.
//! The negotiator has no mechanism-specific logic, so adding a mechanism is
//! just another [`SaslRegistry::register`] call.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::codec::{SaslCode, SaslOutcome};
use crate::error::SaslError;

pub const ANONYMOUS: &str = "ANONYMOUS";

/// Empty responses ANONYMOUS tolerates before failing.
pub const ANONYMOUS_EMPTY_RETRIES: u32 = 2;

/// Per-connection SASL results written by mechanisms.
#[derive(Debug, Default)]
pub struct SaslSession {
    outcome: Option<SaslOutcome>,
    identity: Option<String>,
}

impl SaslSession {
    /// Record the outcome. Only the first call has any effect.
    pub fn set_outcome(&mut self, code: SaslCode, additional_data: Option<Vec<u8>>) -> bool {
        if self.outcome.is_some() {
            return false;
        }
        self.outcome = Some(SaslOutcome {
            code,
            additional_data,
        });
        true
    }

    pub fn set_identity(&mut self, identity: impl Into<String>) {
        self.identity = Some(identity.into());
    }

    pub fn outcome(&self) -> Option<&SaslOutcome> {
        self.outcome.as_ref()
    }

    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    pub fn succeeded(&self) -> bool {
        matches!(&self.outcome, Some(o) if o.code == SaslCode::Ok)
    }
}

/// Result of one continuation call.
pub struct SaslStep {
    pub next: Option<Continuation>,
    pub challenge: Vec<u8>,
}

impl SaslStep {
    pub fn done() -> Self {
        SaslStep {
            next: None,
            challenge: Vec::new(),
        }
    }

    pub fn challenge(next: Continuation, challenge: Vec<u8>) -> Self {
        SaslStep {
            next: Some(next),
            challenge,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.next.is_none() && self.challenge.is_empty()
    }
}

pub type Continuation =
    Box<dyn FnOnce(&mut SaslSession, &str, &[u8]) -> Result<SaslStep, SaslError> + Send>;

/// Builds the first continuation of a fresh negotiation.
pub type Mechanism = Arc<dyn Fn() -> Continuation + Send + Sync>;

#[derive(Clone, Default)]
pub struct SaslRegistry {
    mechanisms: BTreeMap<String, Mechanism>,
}

impl SaslRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_anonymous() -> Self {
        let mut r = Self::new();
        r.register(ANONYMOUS, anonymous());
        r
    }

    /// Build a registry from configured mechanism names.
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Result<Self, String> {
        let mut r = Self::new();
        for name in names {
            let mech = builtin(name.as_ref())
                .ok_or_else(|| format!("unknown SASL mechanism {:?}", name.as_ref()))?;
            r.register(name.as_ref(), mech);
        }
        Ok(r)
    }

    pub fn register(&mut self, name: impl Into<String>, mechanism: Mechanism) {
        self.mechanisms.insert(name.into(), mechanism);
    }

    /// First continuation for `name`.
    pub fn start(&self, name: &str) -> Option<Continuation> {
        self.mechanisms.get(name).map(|m| m())
    }

    /// Mechanism names, sorted.
    pub fn names(&self) -> Vec<String> {
        self.mechanisms.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.mechanisms.is_empty()
    }
}

impl fmt::Debug for SaslRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.mechanisms.keys()).finish()
    }
}

fn builtin(name: &str) -> Option<Mechanism> {
    match name {
        ANONYMOUS => Some(anonymous()),
        _ => None,
    }
}

/// ANONYMOUS with an optional trace identity.
///
/// A non-empty response is taken as the identity and completes with `ok`.
/// Some clients probe with empty data first, so an empty response is
/// answered with an empty challenge up to [`ANONYMOUS_EMPTY_RETRIES`] times.
pub fn anonymous() -> Mechanism {
    Arc::new(|| anonymous_step(ANONYMOUS_EMPTY_RETRIES))
}

fn anonymous_step(retries_left: u32) -> Continuation {
    Box::new(move |session: &mut SaslSession, _hostname: &str, response: &[u8]| {
        if !response.is_empty() {
            session.set_identity(String::from_utf8_lossy(response));
            session.set_outcome(SaslCode::Ok, None);
            return Ok(SaslStep::done());
        }
        if retries_left == 0 {
            return Err(SaslError::AuthFailed(
                "no trace identity supplied".to_string(),
            ));
        }
        Ok(SaslStep::challenge(anonymous_step(retries_left - 1), Vec::new()))
    })
}
