//! Role checks over the current session.
//!
//! `Role::Admin` is a super-role: it satisfies every required capability.
//! All predicates treat a missing session as lacking every role.

use crate::types::{Role, Session};

/// Whether an account holding `role` may act with the `required` capability.
pub fn has_capability(role: Role, required: Role) -> bool {
    role == Role::Admin || role == required
}

pub fn has_role(session: Option<&Session>, required: Role) -> bool {
    session.is_some_and(|session| has_capability(session.role, required))
}

pub fn has_any_role(session: Option<&Session>, required: &[Role]) -> bool {
    session.is_some_and(|session| {
        required
            .iter()
            .any(|role| has_capability(session.role, *role))
    })
}
