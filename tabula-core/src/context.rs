//! Call context passed from the store layer into repositories.
//!
//! The cache layer only reads it: a context marked as executing inside a
//! write transaction makes cached repositories go straight to the store.

use crate::TransactionId;

/// Per-call store context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StoreContext {
    transaction: Option<TransactionId>,
}

impl StoreContext {
    /// Context for calls outside any transaction.
    pub fn background() -> Self {
        Self::default()
    }

    /// Context for calls executing inside the given write transaction.
    pub fn in_transaction(transaction: TransactionId) -> Self {
        Self {
            transaction: Some(transaction),
        }
    }

    pub fn is_in_transaction(&self) -> bool {
        self.transaction.is_some()
    }

    pub fn transaction_id(&self) -> Option<TransactionId> {
        self.transaction
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_background_is_not_transactional() {
        let ctx = StoreContext::background();
        assert!(!ctx.is_in_transaction());
        assert_eq!(ctx.transaction_id(), None);
    }

    #[test]
    fn test_transaction_context_carries_id() {
        let tx = TransactionId::now_v7();
        let ctx = StoreContext::in_transaction(tx);
        assert!(ctx.is_in_transaction());
        assert_eq!(ctx.transaction_id(), Some(tx));
    }
}
