//! Server-side permission checks for client requests.

use suspense_common::ActorId;

use crate::constraints::ValidatedOperation;

/// Decides whether an actor may perform an operation.
pub trait AuthorityGate {
    /// Returns true when `actor` may perform `operation`.
    fn check_authority(&self, actor: ActorId, operation: ValidatedOperation) -> bool;
}

/// Grants everything. Used by local and single-player setups.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl AuthorityGate for AllowAll {
    fn check_authority(&self, _actor: ActorId, _operation: ValidatedOperation) -> bool {
        true
    }
}

impl<F> AuthorityGate for F
where
    F: Fn(ActorId, ValidatedOperation) -> bool,
{
    fn check_authority(&self, actor: ActorId, operation: ValidatedOperation) -> bool {
        self(actor, operation)
    }
}
