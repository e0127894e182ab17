//! Opt-in repository capabilities and the unwrap chain.
//!
//! Repositories stack: a cache-consistent wrapper holds the authoritative
//! repository, and wrappers may hold further wrappers. A capability such as
//! transaction control lives on exactly one layer, usually the innermost.
//! [`resolve_transaction_source`] walks the chain from the outermost layer
//! inward until a layer exposes it.

use async_trait::async_trait;
use tabula_core::{StorageError, StoreContext, TabulaResult};

/// Transaction control offered by an authoritative store.
#[async_trait]
pub trait TransactionSource: Send + Sync {
    /// Open a transaction and return the context that marks calls as part
    /// of it.
    async fn begin(&self) -> TabulaResult<StoreContext>;

    /// Make the transaction's writes visible to every reader.
    async fn commit(&self, ctx: &StoreContext) -> TabulaResult<()>;

    /// Discard the transaction's writes.
    async fn rollback(&self, ctx: &StoreContext) -> TabulaResult<()>;
}

/// One layer of a repository stack.
pub trait RepositoryLayer: Send + Sync {
    /// Short name of the layer, used in logs and errors.
    fn layer_name(&self) -> &'static str;

    /// The transaction capability, if this layer owns it.
    fn transaction_source(&self) -> Option<&dyn TransactionSource> {
        None
    }

    /// The wrapped layer, if this layer is a wrapper.
    fn inner_layer(&self) -> Option<&dyn RepositoryLayer> {
        None
    }
}

/// Find the first layer exposing [`TransactionSource`], looking through at
/// most `max_depth` wrappers.
pub fn resolve_transaction_source(
    layer: &dyn RepositoryLayer,
    max_depth: usize,
) -> TabulaResult<&dyn TransactionSource> {
    let mut current = layer;
    let mut depth = 0usize;
    loop {
        if let Some(source) = current.transaction_source() {
            return Ok(source);
        }
        let Some(next) = current.inner_layer() else {
            return Err(StorageError::CapabilityUnavailable {
                capability: format!("transaction source (chain ends at {})", current.layer_name()),
            }
            .into());
        };
        depth += 1;
        if depth > max_depth {
            return Err(StorageError::UnwrapDepthExceeded { depth: max_depth }.into());
        }
        current = next;
    }
}

/// Names of the layers from `layer` inward, at most `max_depth + 1` of them.
pub fn layer_chain(layer: &dyn RepositoryLayer, max_depth: usize) -> Vec<&'static str> {
    let mut names = vec![layer.layer_name()];
    let mut current = layer;
    while let Some(next) = current.inner_layer() {
        if names.len() > max_depth {
            break;
        }
        names.push(next.layer_name());
        current = next;
    }
    names
}
