//! Workload identity claims.
//!
//! Tasks present these claims, signed by the keyring, to other cluster
//! services. The encoded form is a compact three-segment token whose
//! header carries the signing key ID (`kid`).

use serde::{Deserialize, Serialize};

/// Claims carried by a workload identity token.
///
/// Registered claims follow their standard meanings. Verification checks
/// `exp` and `nbf` only when present and never compares `aud` or `iss` —
/// tokens minted by older servers carry neither, and they must keep
/// verifying. Callers that want a stricter policy apply it on top of the
/// returned claims.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityClaims {
    /// Subject: the workload this identity belongs to.
    pub sub: String,

    /// Issuer, filled in from server configuration at signing time when
    /// configured.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,

    /// Audience.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aud: Option<String>,

    /// Expiration time, seconds since the epoch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exp: Option<u64>,

    /// Not-before time, seconds since the epoch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nbf: Option<u64>,

    /// Issued-at time, seconds since the epoch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iat: Option<u64>,

    /// Token ID.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jti: Option<String>,

    /// Namespace of the workload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Job the workload belongs to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,

    /// Allocation the workload runs in.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alloc_id: Option<String>,

    /// Task name within the allocation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
}

impl IdentityClaims {
    /// Creates claims for a subject with everything else unset.
    #[must_use]
    pub fn new(sub: impl Into<String>) -> Self {
        Self { sub: sub.into(), ..Self::default() }
    }

    /// Creates claims identifying a task, with the subject derived as
    /// `{namespace}:{job_id}:{alloc_id}:{task}`.
    #[must_use]
    pub fn for_task(
        namespace: impl Into<String>,
        job_id: impl Into<String>,
        alloc_id: impl Into<String>,
        task: impl Into<String>,
    ) -> Self {
        let (namespace, job_id, alloc_id, task) =
            (namespace.into(), job_id.into(), alloc_id.into(), task.into());
        Self {
            sub: format!("{namespace}:{job_id}:{alloc_id}:{task}"),
            namespace: Some(namespace),
            job_id: Some(job_id),
            alloc_id: Some(alloc_id),
            task: Some(task),
            ..Self::default()
        }
    }

    /// Sets the expiration time.
    #[must_use]
    pub fn with_expiry(mut self, exp: u64) -> Self {
        self.exp = Some(exp);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn for_task_derives_the_subject() {
        let claims = IdentityClaims::for_task("default", "web", "a3906a63", "nginx");
        assert_eq!(claims.sub, "default:web:a3906a63:nginx");
        assert_eq!(claims.task.as_deref(), Some("nginx"));
    }

    #[test]
    fn none_fields_are_omitted_from_json() {
        let claims = IdentityClaims::new("s1");
        let json = serde_json::to_string(&claims).unwrap();
        assert_eq!(json, "{\"sub\":\"s1\"}");
    }

    mod proptests {
        use proptest::prelude::*;

        use super::*;

        fn arb_claims() -> impl Strategy<Value = IdentityClaims> {
            (
                "[a-zA-Z0-9:_-]{1,64}",
                proptest::option::of("[a-zA-Z0-9:/._-]{1,64}"),
                proptest::option::of(1_000_000_000u64..2_000_000_000u64),
                proptest::option::of(1_000_000_000u64..2_000_000_000u64),
                proptest::option::of("[a-zA-Z0-9-]{1,36}"),
                proptest::option::of("[a-z0-9-]{1,32}"),
            )
                .prop_map(|(sub, iss, exp, nbf, jti, namespace)| IdentityClaims {
                    sub,
                    iss,
                    exp,
                    nbf,
                    jti,
                    namespace,
                    ..IdentityClaims::default()
                })
        }

        proptest! {
            /// Serializing then deserializing any claims must produce an
            /// identical struct.
            #[test]
            fn claims_serde_round_trip(claims in arb_claims()) {
                let json = serde_json::to_string(&claims).expect("serialize");
                let back: IdentityClaims = serde_json::from_str(&json).expect("deserialize");
                prop_assert_eq!(back, claims);
            }

            /// Fields set to `None` never appear in the serialized form.
            #[test]
            fn claims_none_fields_omitted(claims in arb_claims()) {
                let json = serde_json::to_string(&claims).expect("serialize");
                let parsed: serde_json::Value = serde_json::from_str(&json).expect("valid JSON");
                if claims.exp.is_none() {
                    prop_assert!(parsed.get("exp").is_none());
                }
                if claims.iss.is_none() {
                    prop_assert!(parsed.get("iss").is_none());
                }
                if claims.jti.is_none() {
                    prop_assert!(parsed.get("jti").is_none());
                }
            }
        }
    }
}
