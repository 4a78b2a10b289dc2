use std::ops::{Deref, DerefMut};

use nalgebra::DVector;
use tracing::trace;

use crate::vector::VariableVector;

/// Restores the whole buffer on drop, whichever way the scope is left.
///
/// Dereferences to the borrowed vector so it can be handed to an evaluation
/// while the guard is alive.
pub struct Restore<'a> {
    vector: &'a mut VariableVector,
    saved: DVector<f64>,
}

impl<'a> Restore<'a> {
    pub fn new(vector: &'a mut VariableVector) -> Self {
        let saved = vector.as_vector().clone();
        Self { vector, saved }
    }

    /// Buffer contents at the time the guard was created.
    pub fn saved(&self) -> &DVector<f64> {
        &self.saved
    }
}

impl Deref for Restore<'_> {
    type Target = VariableVector;

    fn deref(&self) -> &VariableVector {
        &*self.vector
    }
}

impl DerefMut for Restore<'_> {
    fn deref_mut(&mut self) -> &mut VariableVector {
        &mut *self.vector
    }
}

impl Drop for Restore<'_> {
    fn drop(&mut self) {
        self.vector.as_vector_mut().copy_from(&self.saved);
    }
}

/// Shifts one scalar by `delta` and writes the original back on drop.
///
/// The original is stored rather than recomputed as `value - delta`, so the
/// restored entry is bit-identical.
pub struct Perturbation<'a> {
    vector: &'a mut VariableVector,
    position: usize,
    original: f64,
}

impl<'a> Perturbation<'a> {
    pub fn new(vector: &'a mut VariableVector, position: usize, delta: f64) -> Self {
        let original = vector.as_vector()[position];
        vector.as_vector_mut()[position] = original + delta;
        trace!(position, original, delta, "perturbed");
        Self {
            vector,
            position,
            original,
        }
    }
}

impl Deref for Perturbation<'_> {
    type Target = VariableVector;

    fn deref(&self) -> &VariableVector {
        &*self.vector
    }
}

impl DerefMut for Perturbation<'_> {
    fn deref_mut(&mut self) -> &mut VariableVector {
        &mut *self.vector
    }
}

impl Drop for Perturbation<'_> {
    fn drop(&mut self) {
        self.vector.as_vector_mut()[self.position] = self.original;
    }
}
