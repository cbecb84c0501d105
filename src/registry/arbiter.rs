// src/registry/arbiter.rs
//! Conflict rules for competing registrations
//!
//! Commands and single services can each have only one owner. When a second
//! implementation claims the same command name or capability, these rules
//! decide whether it takes over or the registration fails.
//!
//! | Existing owner | Candidate | Command | Service |
//! |----------------|-----------|---------|---------|
//! | core | extension | replace | replace |
//! | extension A | extension B | conflict | conflict |
//! | same origin | same origin | permission | replace |
//! | extension | core | permission | permission |
//!
//! "permission" means replace when the process-wide replace permission is
//! set, conflict otherwise. A type registered again from the origin that
//! already owns it never conflicts with itself. The same type arriving from
//! another origin is judged by the table like any other candidate, so one
//! extension cannot adopt a registration another extension made.

use super::{ImplementationInfo, Origin};

/// Outcome of arbitration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Candidate is the existing owner, from the same origin
    Same,
    /// Candidate takes over; the existing owner is released
    Replace,
    /// Candidate is refused
    Conflict,
}

/// Decide whether `candidate` may take a command name owned by `existing`
pub fn arbitrate_command(
    existing: &ImplementationInfo,
    candidate: &ImplementationInfo,
    replace_permission: bool,
) -> Decision {
    if existing.same_type(candidate) && existing.origin == candidate.origin {
        return Decision::Same;
    }

    match (&existing.origin, &candidate.origin) {
        (Origin::Core, Origin::Extension(_)) => Decision::Replace,
        (Origin::Extension(a), Origin::Extension(b)) if a != b => Decision::Conflict,
        _ if replace_permission => Decision::Replace,
        _ => Decision::Conflict,
    }
}

/// Decide whether `candidate` may take a capability bound to `existing`
pub fn arbitrate_service(
    existing: &ImplementationInfo,
    candidate: &ImplementationInfo,
    replace_permission: bool,
) -> Decision {
    if existing.same_type(candidate) && existing.origin == candidate.origin {
        return Decision::Same;
    }

    match (&existing.origin, &candidate.origin) {
        (a, b) if a == b => Decision::Replace,
        (Origin::Core, Origin::Extension(_)) => Decision::Replace,
        (Origin::Extension(_), Origin::Extension(_)) => Decision::Conflict,
        _ if replace_permission => Decision::Replace,
        _ => Decision::Conflict,
    }
}
