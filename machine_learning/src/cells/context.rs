use ndarray::ArrayD;

use crate::{
    error::Result,
    graph::{Graph, NodeId},
    variables::{Initializer, VariableScope},
};

/// Everything a cell needs to add itself to a tower's graph.
pub struct CellContext<'g> {
    graph: &'g mut Graph,
    scope: VariableScope,
    is_training: bool,
}

impl<'g> CellContext<'g> {
    /// Creates a new `CellContext`.
    ///
    /// # Arguments
    /// * `graph` - The tower's tape.
    /// * `scope` - The root variable scope of the tower.
    /// * `is_training` - Whether the graph is built for training.
    pub fn new(graph: &'g mut Graph, scope: VariableScope, is_training: bool) -> Self {
        Self {
            graph,
            scope,
            is_training,
        }
    }

    pub fn graph(&mut self) -> &mut Graph {
        self.graph
    }

    pub fn scope(&self) -> &VariableScope {
        &self.scope
    }

    pub fn is_training(&self) -> bool {
        self.is_training
    }

    /// Returns the shape of a tensor of the graph.
    pub fn shape(&self, x: NodeId) -> Result<Vec<usize>> {
        Ok(self.graph.shape(x)?.to_vec())
    }

    /// Records an external tensor on the graph.
    pub fn input(&mut self, value: ArrayD<f32>) -> NodeId {
        self.graph.input(value)
    }

    /// Runs `f` with every variable it declares nested under `name`.
    pub fn nested<T>(&mut self, name: &str, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let inner = self.scope.nested(name);
        let outer = std::mem::replace(&mut self.scope, inner);
        let result = f(self);
        self.scope = outer;
        result
    }

    /// Reads a variable of the current scope into the graph.
    ///
    /// # Arguments
    /// * `name` - The variable's name relative to the current scope.
    /// * `shape` - The variable's shape.
    /// * `init` - The initializer used when the variable is created.
    /// * `weight_decay` - If given, an L2 penalty scaled by this factor is added to the graph's
    ///   losses.
    pub fn variable(
        &mut self,
        name: &str,
        shape: &[usize],
        init: Initializer,
        weight_decay: Option<f32>,
    ) -> Result<NodeId> {
        let id = self.scope.get(name, shape, init)?;
        let store = self.scope.store();
        let node = self.graph.variable(id, || store.value(id))?;

        if let Some(scale) = weight_decay {
            let penalty = self.graph.l2_loss(node, scale)?;
            self.graph.add_to_losses(penalty);
        }

        Ok(node)
    }
}
