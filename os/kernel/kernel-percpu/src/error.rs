use crate::CoreId;

/// Messaging requests rejected before anything was sent.
#[derive(Debug, Clone, Copy, Eq, PartialEq, thiserror::Error)]
pub enum SmpError {
    #[error("SMP messaging is not enabled yet")]
    NotEnabled,
    #[error("core {core} cannot send a message to itself")]
    SelfTarget { core: CoreId },
    #[error("core {core} does not exist ({count} cores)")]
    NoSuchCore { core: CoreId, count: usize },
}
