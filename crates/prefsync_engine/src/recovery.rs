//! Failure classification routing and recovery decisions.
//!
//! The router keeps the orchestrator ignorant of recovery strategy
//! specifics: every caught failure is classified into a
//! [`FailureKind`] and dispatched to a per-kind handler that decides
//! what the engine should do next. Handlers decide; the engine applies.

use crate::error::{EngineError, FailureKind};
use prefsync_core::SettingValue;
use std::collections::BTreeMap;
use tracing::{error, warn};

/// An optional collaborator that validates setting values.
///
/// The engine accepts a nullable validator at construction and no-ops
/// when absent; it never interprets values itself.
pub trait SettingValidator: Send + Sync {
    /// Validates a value for a key. Returns a rejection message on
    /// failure.
    ///
    /// # Errors
    ///
    /// Returns the validator's rejection message.
    fn validate(&self, key: &str, value: &SettingValue) -> Result<(), String>;
}

/// What the engine should do after a classified failure.
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryAction {
    /// Park the operation in the offline queue for a later retry.
    QueueForRetry,
    /// Replace the rejected value with the key's default and retry the
    /// write.
    ResetToDefault {
        /// The key to reset.
        key: String,
        /// The default value to apply.
        value: SettingValue,
    },
    /// Run the conflict resolver over all three tiers.
    ResolveSnapshots,
    /// Resolution is impossible; clear the cache and tell the caller to
    /// reload.
    ClearCacheAndReload,
    /// Switch the session to remote-only persistence.
    SwitchToRemoteOnly,
    /// Nothing recoverable; surface the failure to the caller.
    Surface,
}

/// Outcome of routing one failure.
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveryOutcome {
    /// Whether the condition is recoverable from the caller's view.
    pub success: bool,
    /// Whether a fallback path was chosen instead of the normal path.
    pub fallback_applied: bool,
    /// The action the engine should take.
    pub action: RecoveryAction,
}

/// Context the caller supplies alongside a failure.
#[derive(Debug, Clone, Default)]
pub struct FailureContext {
    /// The key involved, if the failure concerns a single setting.
    pub key: Option<String>,
    /// Optional classification hint from the call site.
    pub hint: Option<FailureKind>,
    /// Whether snapshot reconciliation was already attempted.
    pub resolution_attempted: bool,
}

impl FailureContext {
    /// Creates a context for a single-key operation.
    #[must_use]
    pub fn for_key(key: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            ..Self::default()
        }
    }

    /// Attaches a classification hint.
    #[must_use]
    pub fn with_hint(mut self, hint: FailureKind) -> Self {
        self.hint = Some(hint);
        self
    }

    /// Marks that snapshot reconciliation was already attempted for the
    /// failing operation.
    #[must_use]
    pub fn after_resolution(mut self) -> Self {
        self.resolution_attempted = true;
        self
    }
}

/// Routes classified failures to recovery decisions.
#[derive(Debug, Default)]
pub struct RecoveryRouter {
    defaults: BTreeMap<String, SettingValue>,
}

impl RecoveryRouter {
    /// Creates a router with no defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a router with per-key default values used by
    /// reset-to-default recovery.
    #[must_use]
    pub fn with_defaults(defaults: BTreeMap<String, SettingValue>) -> Self {
        Self { defaults }
    }

    /// Returns the default for a key, if one is registered.
    #[must_use]
    pub fn default_for(&self, key: &str) -> Option<&SettingValue> {
        self.defaults.get(key)
    }

    /// Classifies a typed failure and routes it.
    #[must_use]
    pub fn route_error(&self, failure: &EngineError, context: &FailureContext) -> RecoveryOutcome {
        let kind = match context.hint {
            Some(hint) => hint,
            None => failure.kind(),
        };
        self.route(kind, &failure.to_string(), context)
    }

    /// Classifies a bare failure message and routes it.
    #[must_use]
    pub fn route_message(&self, message: &str, context: &FailureContext) -> RecoveryOutcome {
        let kind = FailureKind::from_message(message, context.hint);
        self.route(kind, message, context)
    }

    fn route(&self, kind: FailureKind, message: &str, context: &FailureContext) -> RecoveryOutcome {
        match kind {
            FailureKind::Network | FailureKind::RemoteStore => RecoveryOutcome {
                success: true,
                fallback_applied: true,
                action: RecoveryAction::QueueForRetry,
            },
            FailureKind::Validation => self.handle_validation(message, context),
            FailureKind::Conflict => {
                if context.resolution_attempted {
                    warn!(key = ?context.key, %message, "conflict persisted after reconciliation, clearing cache for reload");
                    RecoveryOutcome {
                        success: false,
                        fallback_applied: true,
                        action: RecoveryAction::ClearCacheAndReload,
                    }
                } else {
                    RecoveryOutcome {
                        success: true,
                        fallback_applied: true,
                        action: RecoveryAction::ResolveSnapshots,
                    }
                }
            }
            FailureKind::StorageQuota => {
                warn!(%message, "durable store quota exceeded, switching to remote-only persistence");
                RecoveryOutcome {
                    success: true,
                    fallback_applied: true,
                    action: RecoveryAction::SwitchToRemoteOnly,
                }
            }
            FailureKind::Unknown => {
                error!(key = ?context.key, %message, "unclassified failure");
                RecoveryOutcome {
                    success: false,
                    fallback_applied: false,
                    action: RecoveryAction::Surface,
                }
            }
        }
    }

    fn handle_validation(&self, message: &str, context: &FailureContext) -> RecoveryOutcome {
        let default = context
            .key
            .as_deref()
            .and_then(|key| self.defaults.get(key).map(|v| (key.to_string(), v.clone())));

        match default {
            Some((key, value)) => {
                warn!(%key, %message, "validation failed, resetting to default");
                RecoveryOutcome {
                    success: true,
                    fallback_applied: true,
                    action: RecoveryAction::ResetToDefault { key, value },
                }
            }
            None => RecoveryOutcome {
                success: false,
                fallback_applied: false,
                action: RecoveryAction::Surface,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router_with_default() -> RecoveryRouter {
        let mut defaults = BTreeMap::new();
        defaults.insert(
            "admin_bar_background".to_string(),
            SettingValue::from("#23282d"),
        );
        RecoveryRouter::with_defaults(defaults)
    }

    #[test]
    fn network_failures_queue() {
        let router = RecoveryRouter::new();
        let outcome = router.route_error(
            &EngineError::network("connection refused"),
            &FailureContext::default(),
        );
        assert!(outcome.success);
        assert!(outcome.fallback_applied);
        assert_eq!(outcome.action, RecoveryAction::QueueForRetry);
    }

    #[test]
    fn validation_with_default_resets() {
        let router = router_with_default();
        let outcome = router.route_error(
            &EngineError::Validation {
                key: "admin_bar_background".into(),
                message: "not a color".into(),
            },
            &FailureContext::for_key("admin_bar_background"),
        );

        assert!(outcome.success);
        match outcome.action {
            RecoveryAction::ResetToDefault { key, value } => {
                assert_eq!(key, "admin_bar_background");
                assert_eq!(value.as_str(), Some("#23282d"));
            }
            other => panic!("unexpected action: {other:?}"),
        }
    }

    #[test]
    fn validation_without_default_surfaces() {
        let router = RecoveryRouter::new();
        let outcome = router.route_error(
            &EngineError::Validation {
                key: "unknown_key".into(),
                message: "rejected".into(),
            },
            &FailureContext::for_key("unknown_key"),
        );

        assert!(!outcome.success);
        assert_eq!(outcome.action, RecoveryAction::Surface);
    }

    #[test]
    fn quota_switches_persistence_mode() {
        let router = RecoveryRouter::new();
        let outcome = router.route_message("storage quota exceeded", &FailureContext::default());
        assert!(outcome.success);
        assert_eq!(outcome.action, RecoveryAction::SwitchToRemoteOnly);
    }

    #[test]
    fn conflict_resolves() {
        let router = RecoveryRouter::new();
        let outcome = router.route_error(
            &EngineError::Conflict("divergent writes".into()),
            &FailureContext::default(),
        );
        assert_eq!(outcome.action, RecoveryAction::ResolveSnapshots);
    }

    #[test]
    fn conflict_after_reconciliation_clears_and_reloads() {
        let router = RecoveryRouter::new();
        let outcome = router.route_error(
            &EngineError::Conflict("still divergent".into()),
            &FailureContext::default().after_resolution(),
        );
        assert!(!outcome.success);
        assert!(outcome.fallback_applied);
        assert_eq!(outcome.action, RecoveryAction::ClearCacheAndReload);
    }

    #[test]
    fn unknown_is_surfaced_not_swallowed() {
        let router = RecoveryRouter::new();
        let outcome = router.route_message("something odd", &FailureContext::default());
        assert!(!outcome.success);
        assert!(!outcome.fallback_applied);
        assert_eq!(outcome.action, RecoveryAction::Surface);
    }

    #[test]
    fn hint_overrides_content_inspection() {
        let router = router_with_default();
        let outcome = router.route_message(
            "opaque upstream failure",
            &FailureContext::for_key("admin_bar_background").with_hint(FailureKind::Validation),
        );
        assert!(matches!(
            outcome.action,
            RecoveryAction::ResetToDefault { .. }
        ));
    }
}
