use std::ops::{Deref, DerefMut};

use serde::{Deserialize, Serialize};

use crate::ml::{RngStrategy, RNG};

#[cfg(not(feature = "short_floats"))]
pub type NodeValue = f64;

#[cfg(feature = "short_floats")]
pub type NodeValue = f32;

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerValues(Vec<NodeValue>);

impl<T> From<T> for LayerValues
where
    T: AsRef<[NodeValue]>,
{
    fn from(value: T) -> Self {
        Self(value.as_ref().to_vec())
    }
}

impl FromIterator<NodeValue> for LayerValues {
    fn from_iter<T: IntoIterator<Item = NodeValue>>(iter: T) -> Self {
        LayerValues(iter.into_iter().collect())
    }
}

impl Deref for LayerValues {
    type Target = Vec<NodeValue>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for LayerValues {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl LayerValues {
    pub fn new(inner: Vec<NodeValue>) -> Self {
        Self(inner)
    }

    /// index of the largest value, the first one on ties
    pub fn position_max(&self) -> Option<usize> {
        let mut best: Option<(usize, NodeValue)> = None;
        for (idx, &x) in self.iter().enumerate() {
            if best.map_or(true, |(_, max)| x > max) {
                best = Some((idx, x));
            }
        }
        best.map(|(idx, _)| idx)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum LayerInitStrategy {
    /// uniform over `[-bound, bound]`
    Uniform(NodeValue),
    /// uniform over `[-1/sqrt(n), 1/sqrt(n)]` where `n` is the fan-in
    UniformFanIn,
    /// normal, scaled by the tanh gain over `sqrt(n)`
    Kaiming,
}

impl LayerInitStrategy {
    pub fn apply<'a>(
        &self,
        values: impl Iterator<Item = &'a mut NodeValue>,
        inputs_count: usize,
        rng: &RngStrategy,
    ) {
        let fan_in_scale = (inputs_count.max(1) as NodeValue).powf(-0.5);

        match self {
            LayerInitStrategy::Uniform(bound) => {
                values.for_each(|x| *x = Self::full_rand(rng) * bound);
            }
            LayerInitStrategy::UniformFanIn => {
                values.for_each(|x| *x = Self::full_rand(rng) * fan_in_scale);
            }
            LayerInitStrategy::Kaiming => {
                let scale = fan_in_scale * 5.0 / 3.0;
                values.for_each(|x| *x = Self::rand_normal(rng) * scale);
            }
        }
    }

    fn full_rand(rng: &dyn RNG) -> NodeValue {
        rng.rand() * 2.0 - 1.0
    }

    /// standard normal sample via box-muller
    fn rand_normal(rng: &dyn RNG) -> NodeValue {
        let u1 = 1.0 - rng.rand();
        let u2 = rng.rand();
        let tau = 2.0 * std::f64::consts::PI as NodeValue;
        (-2.0 * u1.ln()).sqrt() * (tau * u2).cos()
    }
}
