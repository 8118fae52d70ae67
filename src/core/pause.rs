//! Manual pause and circuit breakers.
//!
//! Manual pause is operator-driven and scoped; breakers trip automatically
//! on risk events and recover after a cooldown. Breakers only ever block
//! entries; an exit is never made worse by refusing it.

use anyhow::{bail, Result};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::{info, warn};

/// What a manual pause applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseScope {
    All,
    Entry,
    Exit,
}

/// Operation being gated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Entry,
    Exit,
}

/// Circuit breaker categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BreakerKind {
    LongHealth,
    ShortMargin,
    LstDepeg,
    PriceDeviation,
    FundingVolatility,
}

/// One active breaker.
#[derive(Debug, Clone)]
pub struct ActiveBreaker {
    pub kind: BreakerKind,
    pub reason: String,
    pub activated_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct PauseState {
    manual_scope: Option<PauseScope>,
    manual_reason: Option<String>,
    breakers: HashMap<BreakerKind, ActiveBreaker>,
}

/// Composes manual pause and circuit breakers into the entry/exit gates.
pub struct PauseController {
    state: RwLock<PauseState>,
    admin_api_key: String,
    breaker_cooldown: Duration,
    breakers_enabled: bool,
}

/// Default breaker cooldown: five minutes.
const DEFAULT_COOLDOWN_SECS: i64 = 300;

impl PauseController {
    pub fn new(admin_api_key: impl Into<String>, breakers_enabled: bool) -> Self {
        Self {
            state: RwLock::new(PauseState::default()),
            admin_api_key: admin_api_key.into(),
            breaker_cooldown: Duration::seconds(DEFAULT_COOLDOWN_SECS),
            breakers_enabled,
        }
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.breaker_cooldown = cooldown;
        self
    }

    /// Manually pause with the given scope. Requires the admin key.
    pub fn pause(&self, api_key: &str, reason: &str, scope: PauseScope) -> Result<()> {
        self.authorize(api_key)?;
        let mut state = self.state.write().expect("pause lock poisoned");
        state.manual_scope = Some(scope);
        state.manual_reason = Some(reason.to_string());
        warn!(?scope, reason, "trading manually paused");
        Ok(())
    }

    /// Clear all manual pause scopes. Requires the admin key.
    pub fn resume(&self, api_key: &str) -> Result<()> {
        self.authorize(api_key)?;
        let mut state = self.state.write().expect("pause lock poisoned");
        state.manual_scope = None;
        state.manual_reason = None;
        info!("trading manually resumed");
        Ok(())
    }

    /// Pause from an internal path (kill switch, fatal infra). Bypasses the
    /// admin key; never exposed over an operator surface.
    pub fn force_pause(&self, reason: &str, scope: PauseScope) {
        let mut state = self.state.write().expect("pause lock poisoned");
        state.manual_scope = Some(scope);
        state.manual_reason = Some(reason.to_string());
        warn!(?scope, reason, "trading force-paused");
    }

    /// Trip a breaker. No key required: callers are internal risk paths.
    pub fn trigger_breaker(&self, kind: BreakerKind, reason: &str) {
        self.trigger_breaker_at(kind, reason, Utc::now());
    }

    pub(crate) fn trigger_breaker_at(&self, kind: BreakerKind, reason: &str, now: DateTime<Utc>) {
        if !self.breakers_enabled {
            return;
        }
        let mut state = self.state.write().expect("pause lock poisoned");
        warn!(?kind, reason, "circuit breaker tripped");
        state.breakers.insert(
            kind,
            ActiveBreaker {
                kind,
                reason: reason.to_string(),
                activated_at: now,
            },
        );
    }

    /// Clear breakers whose cooldown has expired. Returns the recovered
    /// kinds.
    pub fn check_and_recover(&self) -> Vec<BreakerKind> {
        self.check_and_recover_at(Utc::now())
    }

    pub(crate) fn check_and_recover_at(&self, now: DateTime<Utc>) -> Vec<BreakerKind> {
        let mut state = self.state.write().expect("pause lock poisoned");
        let cooldown = self.breaker_cooldown;
        let expired: Vec<BreakerKind> = state
            .breakers
            .values()
            .filter(|b| now - b.activated_at >= cooldown)
            .map(|b| b.kind)
            .collect();
        for kind in &expired {
            state.breakers.remove(kind);
            info!(?kind, "circuit breaker recovered");
        }
        expired
    }

    /// Whether the given operation may run right now.
    pub fn can_execute(&self, op: Operation) -> bool {
        let state = self.state.read().expect("pause lock poisoned");

        if let Some(scope) = state.manual_scope {
            let blocked = matches!(
                (scope, op),
                (PauseScope::All, _)
                    | (PauseScope::Entry, Operation::Entry)
                    | (PauseScope::Exit, Operation::Exit)
            );
            if blocked {
                return false;
            }
        }

        // Breakers block entries only.
        if op == Operation::Entry && !state.breakers.is_empty() {
            return false;
        }
        true
    }

    pub fn is_paused(&self) -> bool {
        self.state
            .read()
            .expect("pause lock poisoned")
            .manual_scope
            .is_some()
    }

    pub fn pause_reason(&self) -> Option<String> {
        self.state
            .read()
            .expect("pause lock poisoned")
            .manual_reason
            .clone()
    }

    pub fn active_breakers(&self) -> Vec<ActiveBreaker> {
        self.state
            .read()
            .expect("pause lock poisoned")
            .breakers
            .values()
            .cloned()
            .collect()
    }

    fn authorize(&self, api_key: &str) -> Result<()> {
        if self.admin_api_key.is_empty() {
            bail!("admin API key is not configured");
        }
        if !constant_time_eq(api_key.as_bytes(), self.admin_api_key.as_bytes()) {
            bail!("invalid admin API key");
        }
        Ok(())
    }
}

/// Compare without early exit so timing leaks nothing about the prefix.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> PauseController {
        PauseController::new("secret-key", true)
    }

    #[test]
    fn test_manual_pause_scopes() {
        let ctl = controller();
        assert!(ctl.can_execute(Operation::Entry));
        assert!(ctl.can_execute(Operation::Exit));

        ctl.pause("secret-key", "maintenance", PauseScope::Entry)
            .unwrap();
        assert!(!ctl.can_execute(Operation::Entry));
        assert!(ctl.can_execute(Operation::Exit));

        ctl.pause("secret-key", "incident", PauseScope::All).unwrap();
        assert!(!ctl.can_execute(Operation::Entry));
        assert!(!ctl.can_execute(Operation::Exit));

        ctl.resume("secret-key").unwrap();
        assert!(ctl.can_execute(Operation::Entry));
        assert!(ctl.can_execute(Operation::Exit));
    }

    #[test]
    fn test_exit_scope_blocks_only_exit() {
        let ctl = controller();
        ctl.pause("secret-key", "close freeze", PauseScope::Exit)
            .unwrap();
        assert!(ctl.can_execute(Operation::Entry));
        assert!(!ctl.can_execute(Operation::Exit));
    }

    #[test]
    fn test_bad_key_rejected() {
        let ctl = controller();
        assert!(ctl.pause("wrong", "x", PauseScope::All).is_err());
        assert!(ctl.resume("").is_err());
        assert!(!ctl.is_paused());
    }

    #[test]
    fn test_breaker_blocks_entry_never_exit() {
        let ctl = controller();
        ctl.trigger_breaker(BreakerKind::LongHealth, "hf critical");

        assert!(!ctl.can_execute(Operation::Entry));
        assert!(ctl.can_execute(Operation::Exit));
        assert_eq!(ctl.active_breakers().len(), 1);
    }

    #[test]
    fn test_breaker_auto_recovery() {
        let ctl = controller();
        let t0 = Utc::now() - Duration::seconds(301);
        ctl.trigger_breaker_at(BreakerKind::PriceDeviation, "divergence", t0);
        assert!(!ctl.can_execute(Operation::Entry));

        let recovered = ctl.check_and_recover();
        assert_eq!(recovered, vec![BreakerKind::PriceDeviation]);
        assert!(ctl.can_execute(Operation::Entry));
    }

    #[test]
    fn test_breaker_not_recovered_before_cooldown() {
        let ctl = controller();
        ctl.trigger_breaker(BreakerKind::ShortMargin, "mf low");
        assert!(ctl.check_and_recover().is_empty());
        assert!(!ctl.can_execute(Operation::Entry));
    }

    #[test]
    fn test_breakers_disabled_never_trip() {
        let ctl = PauseController::new("secret-key", false);
        ctl.trigger_breaker(BreakerKind::LstDepeg, "depeg");
        assert!(ctl.can_execute(Operation::Entry));
        assert!(ctl.active_breakers().is_empty());
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
        assert!(constant_time_eq(b"", b""));
    }

    #[test]
    fn test_unconfigured_key_refuses_all() {
        let ctl = PauseController::new("", true);
        assert!(ctl.pause("", "x", PauseScope::All).is_err());
    }
}
