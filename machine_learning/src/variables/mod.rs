mod init;
mod scope;
mod store;

pub use init::{Initializer, TruncatedNormal};
pub use scope::{ScopeMode, VariableScope};
pub use store::{SHADOW_SUFFIX, VarId, VariableStore};
