use std::{collections::HashMap, sync::Arc};

use log::{debug, warn};
use ndarray::{ArrayD, Zip};
use parking_lot::RwLock;
use rand::{SeedableRng, rngs::StdRng};
use rayon::prelude::*;

use super::Initializer;
use crate::{
    error::{MlErr, Result},
    optimization::{GradientTuple, Optimizer},
};

/// Suffix appended to a variable's name to name its moving average.
pub const SHADOW_SUFFIX: &str = "/ExponentialMovingAverage";

/// A dense identifier of a variable inside its `VariableStore`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VarId(usize);

impl VarId {
    pub(crate) fn new(index: usize) -> Self {
        Self(index)
    }

    pub fn index(&self) -> usize {
        self.0
    }
}

/// A named trainable tensor along with its exponential moving average.
#[derive(Debug)]
struct Variable {
    name: String,
    value: ArrayD<f32>,
    shadow: ArrayD<f32>,
}

#[derive(Debug)]
struct Inner {
    vars: Vec<Variable>,
    by_name: HashMap<String, VarId>,
    rng: StdRng,
}

/// The storage shared by every tower, holds each variable exactly once.
///
/// Cloning a `VariableStore` yields another handle to the same variables.
#[derive(Debug, Clone)]
pub struct VariableStore {
    inner: Arc<RwLock<Inner>>,
}

impl VariableStore {
    /// Creates a new empty `VariableStore`.
    ///
    /// # Arguments
    /// * `seed` - The seed for the initializers, a random one is used if `None`.
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };

        let inner = Inner {
            vars: Vec::new(),
            by_name: HashMap::new(),
            rng,
        };

        Self {
            inner: Arc::new(RwLock::new(inner)),
        }
    }

    /// Returns the amount of variables.
    pub fn len(&self) -> usize {
        self.inner.read().vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the total amount of trainable scalars.
    pub fn num_params(&self) -> usize {
        self.inner.read().vars.iter().map(|v| v.value.len()).sum()
    }

    /// Looks a variable up by its full name.
    pub fn id(&self, name: &str) -> Option<VarId> {
        self.inner.read().by_name.get(name).copied()
    }

    /// Returns the ids of every variable in creation order.
    pub fn ids(&self) -> Vec<VarId> {
        (0..self.len()).map(VarId).collect()
    }

    /// Returns the variable names in creation order.
    pub fn names(&self) -> Vec<String> {
        self.inner.read().vars.iter().map(|v| v.name.clone()).collect()
    }

    /// Resolves a variable, creating it if allowed.
    ///
    /// # Arguments
    /// * `name` - The variable's full name.
    /// * `shape` - The expected shape.
    /// * `init` - The initializer used if the variable is created.
    /// * `create` - Whether a missing variable may be created.
    ///
    /// # Returns
    /// The variable's id or an error if it exists with another shape, or it doesn't exist and
    /// `create` is false.
    pub fn get_or_create(
        &self,
        name: &str,
        shape: &[usize],
        init: Initializer,
        create: bool,
    ) -> Result<VarId> {
        if let Some(id) = self.lookup(name, shape)? {
            return Ok(id);
        }

        if !create {
            return Err(MlErr::MissingVariable(name.to_string()));
        }

        let mut inner = self.inner.write();

        // Another handle may have created it between both locks.
        if inner.by_name.contains_key(name) {
            drop(inner);
            return self.lookup(name, shape)?.ok_or(MlErr::MissingVariable(name.to_string()));
        }

        let value = init.generate(shape, &mut inner.rng)?;
        let id = VarId(inner.vars.len());

        debug!(name = name, shape:? = shape; "created variable");

        inner.vars.push(Variable {
            name: name.to_string(),
            shadow: value.clone(),
            value,
        });
        inner.by_name.insert(name.to_string(), id);

        Ok(id)
    }

    fn lookup(&self, name: &str, shape: &[usize]) -> Result<Option<VarId>> {
        let inner = self.inner.read();
        let Some(&id) = inner.by_name.get(name) else {
            return Ok(None);
        };

        let existing = inner.vars[id.0].value.shape();
        if existing != shape {
            return Err(MlErr::VariableShape {
                name: name.to_string(),
                got: shape.to_vec(),
                expected: existing.to_vec(),
            });
        }

        Ok(Some(id))
    }

    /// Returns a copy of a variable's current value.
    pub fn value(&self, id: VarId) -> Result<ArrayD<f32>> {
        let inner = self.inner.read();
        inner
            .vars
            .get(id.0)
            .map(|v| v.value.clone())
            .ok_or_else(|| MlErr::MissingVariable(format!("#{}", id.0)))
    }

    /// Returns a copy of a variable's moving average.
    pub fn shadow(&self, id: VarId) -> Result<ArrayD<f32>> {
        let inner = self.inner.read();
        inner
            .vars
            .get(id.0)
            .map(|v| v.shadow.clone())
            .ok_or_else(|| MlErr::MissingVariable(format!("#{}", id.0)))
    }

    /// Applies one optimizer update onto every variable that has a gradient.
    ///
    /// # Arguments
    /// * `grads` - The gradients, variables with an absent gradient are left untouched.
    /// * `optimizer` - The update rule.
    ///
    /// # Returns
    /// The amount of updated variables or an error if a gradient doesn't match its variable.
    pub fn apply_gradients<O: Optimizer + ?Sized>(
        &self,
        grads: &[GradientTuple],
        optimizer: &O,
    ) -> Result<usize> {
        let mut inner = self.inner.write();
        let mut by_var: Vec<Option<&ArrayD<f32>>> = vec![None; inner.vars.len()];

        for tuple in grads {
            let Some(grad) = &tuple.grad else {
                continue;
            };

            let var = &inner.vars.get(tuple.var.0).ok_or_else(|| {
                MlErr::MissingVariable(format!("#{}", tuple.var.0))
            })?;

            if var.value.shape() != grad.shape() {
                return Err(MlErr::VariableShape {
                    name: var.name.clone(),
                    got: grad.shape().to_vec(),
                    expected: var.value.shape().to_vec(),
                });
            }

            by_var[tuple.var.0] = Some(grad);
        }

        let updated = by_var.iter().flatten().count();

        inner
            .vars
            .par_iter_mut()
            .zip(by_var.par_iter())
            .for_each(|(var, grad)| {
                if let Some(grad) = grad {
                    optimizer.update_params(var.value.view_mut(), grad.view());
                }
            });

        Ok(updated)
    }

    /// Moves every shadow towards its variable: `shadow -= (1 - decay) * (shadow - value)`.
    pub fn update_shadows(&self, decay: f32) {
        let mut inner = self.inner.write();

        inner.vars.par_iter_mut().for_each(|var| {
            Zip::from(&mut var.shadow)
                .and(&var.value)
                .for_each(|s, &v| *s -= (1.0 - decay) * (*s - v));
        });
    }

    /// Copies out every variable and shadow under its checkpoint name.
    pub fn snapshot(&self) -> Vec<(String, ArrayD<f32>)> {
        let inner = self.inner.read();

        inner
            .vars
            .iter()
            .flat_map(|v| {
                [
                    (v.name.clone(), v.value.clone()),
                    (format!("{}{SHADOW_SUFFIX}", v.name), v.shadow.clone()),
                ]
            })
            .collect()
    }

    /// Overwrites every variable and shadow with the entries of a snapshot.
    ///
    /// # Arguments
    /// * `entries` - `(name, value)` pairs as produced by `snapshot`.
    ///
    /// # Returns
    /// The names of the entries that don't belong to any variable, or an error if a variable is
    /// missing from `entries` or has a different shape there. Nothing is written on error.
    pub fn restore<I>(&self, entries: I) -> Result<Vec<String>>
    where
        I: IntoIterator<Item = (String, ArrayD<f32>)>,
    {
        let mut entries: HashMap<_, _> = entries.into_iter().collect();
        let mut inner = self.inner.write();

        let mut restored = Vec::with_capacity(inner.vars.len());
        for var in &inner.vars {
            let shadow_name = format!("{}{SHADOW_SUFFIX}", var.name);
            let value = take_entry(&mut entries, &var.name, var.value.shape())?;
            let shadow = take_entry(&mut entries, &shadow_name, var.value.shape())?;
            restored.push((value, shadow));
        }

        for (var, (value, shadow)) in inner.vars.iter_mut().zip(restored) {
            var.value = value;
            var.shadow = shadow;
        }

        let ignored: Vec<_> = entries.into_keys().collect();
        if !ignored.is_empty() {
            warn!(entries:? = ignored; "snapshot entries without a variable were ignored");
        }

        Ok(ignored)
    }
}

fn take_entry(
    entries: &mut HashMap<String, ArrayD<f32>>,
    name: &str,
    shape: &[usize],
) -> Result<ArrayD<f32>> {
    let value = entries
        .remove(name)
        .ok_or_else(|| MlErr::MissingVariable(name.to_string()))?;

    if value.shape() != shape {
        return Err(MlErr::VariableShape {
            name: name.to_string(),
            got: value.shape().to_vec(),
            expected: shape.to_vec(),
        });
    }

    Ok(value)
}

#[cfg(test)]
mod tests {
    use ndarray::arr1;

    use super::*;
    use crate::optimization::GradientDescent;

    fn store_with(names: &[&str]) -> VariableStore {
        let store = VariableStore::new(Some(42));
        for name in names {
            store
                .get_or_create(name, &[2], Initializer::Constant(1.0), true)
                .unwrap();
        }
        store
    }

    #[test]
    fn variables_are_created_once_and_reused() {
        let store = store_with(&["a", "b"]);
        let handle = store.clone();

        let a = handle
            .get_or_create("a", &[2], Initializer::Zeros, false)
            .unwrap();
        assert_eq!(a, VarId(0));
        assert_eq!(store.len(), 2);
        assert_eq!(store.num_params(), 4);
        assert_eq!(store.value(a).unwrap(), arr1(&[1.0, 1.0]).into_dyn());
    }

    #[test]
    fn reuse_rejects_new_names_and_other_shapes() {
        let store = store_with(&["a"]);

        assert!(matches!(
            store.get_or_create("c", &[2], Initializer::Zeros, false),
            Err(MlErr::MissingVariable(name)) if name == "c"
        ));
        assert!(matches!(
            store.get_or_create("a", &[3], Initializer::Zeros, true),
            Err(MlErr::VariableShape { .. })
        ));
    }

    #[test]
    fn absent_gradients_leave_variables_untouched() {
        let store = store_with(&["a", "b"]);
        let grads = [
            GradientTuple {
                grad: Some(arr1(&[1.0, 2.0]).into_dyn()),
                var: VarId(0),
            },
            GradientTuple {
                grad: None,
                var: VarId(1),
            },
        ];

        let updated = store
            .apply_gradients(&grads, &GradientDescent::new(0.5))
            .unwrap();

        assert_eq!(updated, 1);
        assert_eq!(store.value(VarId(0)).unwrap(), arr1(&[0.5, 0.0]).into_dyn());
        assert_eq!(store.value(VarId(1)).unwrap(), arr1(&[1.0, 1.0]).into_dyn());
    }

    #[test]
    fn shadows_follow_values() {
        let store = store_with(&["a"]);
        let grads = [GradientTuple {
            grad: Some(arr1(&[2.0, 2.0]).into_dyn()),
            var: VarId(0),
        }];
        store
            .apply_gradients(&grads, &GradientDescent::new(1.0))
            .unwrap();

        store.update_shadows(0.75);
        // 1 - 0.25 * (1 - (-1))
        assert_eq!(store.shadow(VarId(0)).unwrap(), arr1(&[0.5, 0.5]).into_dyn());
    }

    #[test]
    fn snapshots_restore_into_a_fresh_store() {
        let store = store_with(&["a", "b"]);
        store.update_shadows(0.0);
        let mut snapshot = store.snapshot();
        assert_eq!(snapshot.len(), 4);
        assert_eq!(snapshot[1].0, "a/ExponentialMovingAverage");

        snapshot.push(("global_loss".to_string(), arr1(&[3.0]).into_dyn()));

        let fresh = VariableStore::new(Some(1));
        for name in ["a", "b"] {
            fresh
                .get_or_create(name, &[2], Initializer::Zeros, true)
                .unwrap();
        }

        let ignored = fresh.restore(snapshot.clone()).unwrap();
        assert_eq!(ignored, ["global_loss"]);
        assert_eq!(fresh.snapshot(), store.snapshot());

        snapshot.retain(|(name, _)| name != "b");
        assert!(matches!(
            fresh.restore(snapshot),
            Err(MlErr::MissingVariable(name)) if name == "b"
        ));
    }
}
