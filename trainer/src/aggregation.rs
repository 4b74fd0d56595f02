use machine_learning::optimization::GradientTuple;
use ndarray::{ArrayViewD, Axis};

use crate::error::{Result, TrainErr};

/// Averages the gradients of every tower, variable by variable.
///
/// For each variable the gradients the towers produced are stacked along a new leading axis and
/// reduced by their mean. Absent gradients are left out of the mean, so its divisor is the
/// amount of towers that did produce one; a variable without any gradient stays absent. The
/// returned tuples reuse the variable references of the first tower.
///
/// # Args
/// * `tower_grads` - The gradient list of every tower, all in the same variable order.
///
/// # Returns
/// One tuple per variable, or an error if the towers disagree on their variables.
pub fn average_gradients(tower_grads: &[Vec<GradientTuple>]) -> Result<Vec<GradientTuple>> {
    let Some((first, rest)) = tower_grads.split_first() else {
        return Ok(Vec::new());
    };

    if let Some((tower, grads)) = rest
        .iter()
        .enumerate()
        .find(|(_, grads)| grads.len() != first.len())
    {
        return Err(TrainErr::Aggregation(format!(
            "tower {} has {} gradients, tower 0 has {}",
            tower + 1,
            grads.len(),
            first.len()
        )));
    }

    first
        .iter()
        .enumerate()
        .map(|(i, head)| {
            let mut present: Vec<ArrayViewD<'_, f32>> = Vec::with_capacity(tower_grads.len());

            for (tower, grads) in tower_grads.iter().enumerate() {
                let tuple = &grads[i];
                if tuple.var != head.var {
                    return Err(TrainErr::Aggregation(format!(
                        "tower {tower} lists variable #{} where tower 0 lists #{}",
                        tuple.var.index(),
                        head.var.index()
                    )));
                }

                if let Some(grad) = &tuple.grad {
                    present.push(grad.view());
                }
            }

            let grad = if present.is_empty() {
                None
            } else {
                let stacked = ndarray::stack(Axis(0), &present).map_err(|e| {
                    TrainErr::Aggregation(format!(
                        "gradients of variable #{} disagree in shape: {e}",
                        head.var.index()
                    ))
                })?;
                stacked.mean_axis(Axis(0))
            };

            Ok(GradientTuple {
                grad,
                var: head.var,
            })
        })
        .collect()
}
