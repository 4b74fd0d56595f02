use super::{Initializer, VarId, VariableStore};
use crate::error::Result;

/// Whether a scope may create variables or only resolve existing ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeMode {
    Create,
    Reuse,
}

/// A naming context over a `VariableStore`.
///
/// The first tower builds its graph in `Create` mode, every other tower (and every later step)
/// resolves the very same variables in `Reuse` mode.
#[derive(Debug, Clone)]
pub struct VariableScope {
    store: VariableStore,
    mode: ScopeMode,
    prefix: String,
}

impl VariableScope {
    /// Creates a new root `VariableScope`.
    pub fn new(store: VariableStore, mode: ScopeMode) -> Self {
        Self {
            store,
            mode,
            prefix: String::new(),
        }
    }

    pub fn store(&self) -> &VariableStore {
        &self.store
    }

    pub fn mode(&self) -> ScopeMode {
        self.mode
    }

    /// Returns a scope whose names are nested under `name`.
    pub fn nested(&self, name: &str) -> Self {
        Self {
            store: self.store.clone(),
            mode: self.mode,
            prefix: self.full_name(name),
        }
    }

    /// Returns the store name of a variable declared in this scope.
    pub fn full_name(&self, name: &str) -> String {
        if self.prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}/{name}", self.prefix)
        }
    }

    /// Resolves a variable declared in this scope.
    ///
    /// # Arguments
    /// * `name` - The variable's name relative to this scope.
    /// * `shape` - The variable's shape.
    /// * `init` - The initializer, only used in `Create` mode.
    pub fn get(&self, name: &str, shape: &[usize], init: Initializer) -> Result<VarId> {
        self.store.get_or_create(
            &self.full_name(name),
            shape,
            init,
            self.mode == ScopeMode::Create,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MlErr;

    #[test]
    fn nested_names_are_slash_separated() {
        let scope = VariableScope::new(VariableStore::new(Some(0)), ScopeMode::Create);
        let stage = scope.nested("stage_3").nested("conv3x3");

        assert_eq!(stage.full_name("weights"), "stage_3/conv3x3/weights");
        assert_eq!(scope.full_name("weights"), "weights");
    }

    #[test]
    fn reuse_scopes_share_created_variables() {
        let store = VariableStore::new(Some(0));
        let first = VariableScope::new(store.clone(), ScopeMode::Create).nested("init");
        let second = VariableScope::new(store.clone(), ScopeMode::Reuse).nested("init");

        let a = first.get("weights", &[3, 3], Initializer::Zeros).unwrap();
        let b = second.get("weights", &[3, 3], Initializer::Zeros).unwrap();

        assert_eq!(a, b);
        assert_eq!(store.len(), 1);
        assert!(matches!(
            second.get("biases", &[3], Initializer::Zeros),
            Err(MlErr::MissingVariable(_))
        ));
    }
}
