// Precondition policy
//
// Caller bugs (double init, mismatched sizes, bad fence batches) all funnel
// through `check`. Under `Panic` a violation aborts the caller on the spot.
// Under `Trust` nothing panics: `check` just reports the condition back and
// call sites that would otherwise touch invalid memory or handles return
// `ComputeError::Precondition` instead.

use serde::Deserialize;
use std::cell::Cell;
use std::sync::atomic::{AtomicU8, Ordering};

/// How precondition violations are handled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationPolicy {
    /// Panic with the violated condition
    Panic,
    /// Skip the panic; unsafe call sites degrade to an error
    Trust,
}

impl ValidationPolicy {
    /// Panic in debug builds, trust the caller in release builds
    pub const fn build_default() -> Self {
        if cfg!(debug_assertions) {
            Self::Panic
        } else {
            Self::Trust
        }
    }

    const fn to_raw(self) -> u8 {
        match self {
            Self::Panic => 1,
            Self::Trust => 2,
        }
    }

    const fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(Self::Panic),
            2 => Some(Self::Trust),
            _ => None,
        }
    }
}

// 0 = unset, fall back to the build default
static GLOBAL_POLICY: AtomicU8 = AtomicU8::new(0);

thread_local! {
    static THREAD_POLICY: Cell<Option<ValidationPolicy>> = const { Cell::new(None) };
}

/// Set the process-wide policy
pub fn set_policy(policy: ValidationPolicy) {
    GLOBAL_POLICY.store(policy.to_raw(), Ordering::Relaxed);
}

/// Policy in effect on the calling thread
pub fn policy() -> ValidationPolicy {
    THREAD_POLICY
        .with(Cell::get)
        .or_else(|| ValidationPolicy::from_raw(GLOBAL_POLICY.load(Ordering::Relaxed)))
        .unwrap_or_else(ValidationPolicy::build_default)
}

/// Run `f` with `policy` overriding the global one on this thread only
pub fn with_policy<R>(policy: ValidationPolicy, f: impl FnOnce() -> R) -> R {
    struct Restore(Option<ValidationPolicy>);

    impl Drop for Restore {
        fn drop(&mut self) {
            THREAD_POLICY.with(|cell| cell.set(self.0));
        }
    }

    let _restore = Restore(THREAD_POLICY.with(|cell| cell.replace(Some(policy))));
    f()
}

/// Evaluate a precondition. Returns `condition` when the policy lets it through.
#[track_caller]
pub fn check(condition: bool, message: &'static str) -> bool {
    if !condition {
        match policy() {
            ValidationPolicy::Panic => panic!("{}", message),
            ValidationPolicy::Trust => log::warn!("Precondition violated: {}", message),
        }
    }
    condition
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passing_check_returns_true_under_any_policy() {
        assert!(with_policy(ValidationPolicy::Panic, || check(true, "fine")));
        assert!(with_policy(ValidationPolicy::Trust, || check(true, "fine")));
    }

    #[test]
    #[should_panic(expected = "Buffers are differing sizes")]
    fn panic_policy_panics() {
        with_policy(ValidationPolicy::Panic, || check(false, "Buffers are differing sizes"));
    }

    #[test]
    fn trust_policy_reports_the_violation() {
        assert!(!with_policy(ValidationPolicy::Trust, || check(false, "ignored")));
    }

    #[test]
    fn override_is_restored() {
        let outer = policy();
        with_policy(ValidationPolicy::Trust, || {
            assert_eq!(policy(), ValidationPolicy::Trust);
            with_policy(ValidationPolicy::Panic, || {
                assert_eq!(policy(), ValidationPolicy::Panic);
            });
            assert_eq!(policy(), ValidationPolicy::Trust);
        });
        assert_eq!(policy(), outer);
    }

    #[test]
    fn policy_parses_from_config_strings() {
        #[derive(Deserialize)]
        struct Wrapper {
            policy: ValidationPolicy,
        }
        let parsed: Wrapper = toml::from_str("policy = \"trust\"").unwrap();
        assert_eq!(parsed.policy, ValidationPolicy::Trust);
    }
}
