pub mod linear {
    use std::fmt;

    use anyhow::{anyhow, Context, Result};
    use serde::{Deserialize, Serialize};

    use crate::ml::{layer::LayerInitStrategy, LayerValues, NodeValue, RngStrategy};

    /// Row-major matrix of `count` rows, each `stride` values wide.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Linear {
        inner: LayerValues,
        stride: usize,
        count: usize,
    }

    impl Linear {
        pub fn new(count: usize, stride: usize) -> Self {
            Self::with_value(count, stride, 0.0)
        }

        pub fn with_dimensions(other: &Self) -> Self {
            Self::new(other.count, other.stride)
        }

        pub fn with_value(count: usize, stride: usize, value: NodeValue) -> Self {
            Self {
                inner: LayerValues::new(vec![value; count * stride]),
                stride,
                count,
            }
        }

        pub fn from_iter<I: Iterator<Item = NodeValue>>(stride: usize, values: I) -> Result<Self> {
            if stride == 0 {
                Err(anyhow!("invalid stride dimension: 0"))?;
            }
            let inner: LayerValues = values.collect();
            if inner.len() % stride != 0 {
                Err(anyhow!(
                    "can not split {} values into rows of {stride}",
                    inner.len()
                ))?;
            }

            Ok(Self {
                count: inner.len() / stride,
                inner,
                stride,
            })
        }

        pub fn from_values(rows: &[LayerValues]) -> Result<Self> {
            let stride = rows.first().context("no rows provided")?.len();
            if let Some(row) = rows.iter().find(|x| x.len() != stride) {
                Err(anyhow!(
                    "mismatched row length: expected={stride}, actual={}",
                    row.len()
                ))?;
            }
            Self::from_iter(stride, rows.iter().flat_map(|x| x.iter().copied()))
        }

        /// stacks matrices of equal stride on top of each other, in order
        pub fn vstack(parts: &[Linear]) -> Result<Self> {
            let stride = parts.first().context("no matrices to stack")?.stride;
            if let Some(part) = parts.iter().find(|x| x.stride != stride) {
                Err(anyhow!(
                    "mismatched stride dimension: expected={stride}, actual={}",
                    part.stride
                ))?;
            }
            Self::from_iter(stride, parts.iter().flat_map(|x| x.inner.iter().copied()))
        }

        /// fills every value, treating `count` as the fan-in
        pub fn initialize_as_layer(&mut self, strategy: &LayerInitStrategy, rng: &RngStrategy) {
            strategy.apply(self.inner.iter_mut(), self.count, rng);
        }

        pub fn iter(&self) -> LinearIter<impl Iterator<Item = NodeValue> + '_> {
            LinearIter {
                inner: self.inner.iter().copied(),
                stride: self.stride,
                count: self.count,
            }
        }

        pub fn stride(&self) -> usize {
            self.stride
        }

        pub fn count(&self) -> usize {
            self.count
        }

        pub fn values(&self) -> &[NodeValue] {
            &self.inner
        }

        pub fn values_mut(&mut self) -> &mut [NodeValue] {
            &mut self.inner
        }

        pub fn is_finite(&self) -> bool {
            self.inner.iter().all(|x| x.is_finite())
        }

        pub fn rows_iter(&self) -> impl Iterator<Item = &[NodeValue]> {
            self.inner.chunks_exact(self.stride.max(1))
        }

        pub fn rows_iter_mut(&mut self) -> impl Iterator<Item = &mut [NodeValue]> {
            self.inner.chunks_exact_mut(self.stride.max(1))
        }

        pub fn row(&self, idx: usize) -> &[NodeValue] {
            &self.inner[idx * self.stride..(idx + 1) * self.stride]
        }

        pub fn set_row(&mut self, idx: usize, values: &[NodeValue]) {
            let start = idx * self.stride;
            self.inner[start..start + self.stride].copy_from_slice(values);
        }

        /// copies out `count` rows starting at row `start`
        pub fn rows(&self, start: usize, count: usize) -> Result<Self> {
            if start + count > self.count {
                Err(anyhow!(
                    "row range {start}..{} out of bounds for count {}",
                    start + count,
                    self.count
                ))?;
            }
            let from = start * self.stride;
            let to = from + count * self.stride;
            Ok(Self {
                inner: self.inner[from..to].into(),
                stride: self.stride,
                count,
            })
        }

        /// joins each row of `self` with the matching row of `rhs`
        pub fn concat(&self, rhs: &Linear) -> Result<Self> {
            if self.count != rhs.count {
                Err(anyhow!(
                    "mismatched count dimension: lhs={}, rhs={}",
                    self.count,
                    rhs.count
                ))?;
            }
            let values = self
                .rows_iter()
                .zip(rhs.rows_iter())
                .flat_map(|(lhs, rhs)| lhs.iter().chain(rhs).copied());
            Self::from_iter(self.stride + rhs.stride, values)
        }

        /// splits every row at column `mid`, returning the `[..mid]` and `[mid..]` blocks
        pub fn split_at(&self, mid: usize) -> Result<(Self, Self)> {
            if mid == 0 || mid >= self.stride {
                Err(anyhow!(
                    "invalid split column {mid} for stride {}",
                    self.stride
                ))?;
            }
            let lhs = self.rows_iter().flat_map(|row| &row[..mid]).copied();
            let rhs = self.rows_iter().flat_map(|row| &row[mid..]).copied();
            Ok((
                Self::from_iter(mid, lhs)?,
                Self::from_iter(self.stride - mid, rhs)?,
            ))
        }

        /// `self * rhs`
        pub fn matrix_product(&self, rhs: &Linear) -> Linear {
            assert_eq!(self.stride, rhs.count, "mismatched inner dimension");
            let mut product = Linear::new(self.count, rhs.stride);
            for (out, lhs) in product.rows_iter_mut().zip(self.rows_iter()) {
                for (&a, rhs_row) in lhs.iter().zip(rhs.rows_iter()) {
                    out.iter_mut()
                        .zip(rhs_row)
                        .for_each(|(c, &b)| *c = a.mul_add(b, *c));
                }
            }
            product
        }

        /// `self * rhs.T`
        pub fn matrix_product_rhs_transposed(&self, rhs: &Linear) -> Linear {
            assert_eq!(self.stride, rhs.stride, "mismatched stride dimension");
            let mut product = Linear::new(self.count, rhs.count);
            for (out, lhs) in product.rows_iter_mut().zip(self.rows_iter()) {
                for (c, rhs_row) in out.iter_mut().zip(rhs.rows_iter()) {
                    *c = lhs.iter().zip(rhs_row).map(|(a, b)| a * b).sum();
                }
            }
            product
        }

        /// `self.T * rhs`
        pub fn matrix_product_lhs_transposed(&self, rhs: &Linear) -> Linear {
            assert_eq!(self.count, rhs.count, "mismatched count dimension");
            let mut product = Linear::new(self.stride, rhs.stride);
            for (lhs, rhs_row) in self.rows_iter().zip(rhs.rows_iter()) {
                for (&a, out) in lhs.iter().zip(product.rows_iter_mut()) {
                    out.iter_mut()
                        .zip(rhs_row)
                        .for_each(|(c, &b)| *c = a.mul_add(b, *c));
                }
            }
            product
        }

        pub fn as_single_stride(&self) -> Result<LayerValues> {
            if self.count == 1 {
                Ok(self.inner.clone())
            } else {
                Err(anyhow!(
                    "can not read shape = [{}, {}] as single stride",
                    self.count,
                    self.stride
                ))
            }
        }

        pub fn to_sum(&self) -> NodeValue {
            self.inner.iter().sum()
        }

        pub fn sum_squares(&self) -> NodeValue {
            self.inner.iter().map(|x| x * x).sum()
        }
    }

    impl fmt::Display for Linear {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            let mut rows = f.debug_list();
            for row in self.rows_iter() {
                rows.entry(&row);
            }
            rows.finish()
        }
    }

    /// Lazy elementwise operations over the values of a [`Linear`].
    #[must_use = "linear iterators are lazy and do nothing unless consumed"]
    pub struct LinearIter<I> {
        inner: I,
        stride: usize,
        count: usize,
    }

    impl<I: Iterator<Item = NodeValue>> LinearIter<I> {
        fn map_values(
            self,
            f: impl Fn(NodeValue) -> NodeValue,
        ) -> LinearIter<impl Iterator<Item = NodeValue>> {
            LinearIter {
                inner: self.inner.map(f),
                stride: self.stride,
                count: self.count,
            }
        }

        fn zip_values<J: Iterator<Item = NodeValue>>(
            self,
            rhs: LinearIter<J>,
            f: impl Fn(NodeValue, NodeValue) -> NodeValue,
        ) -> LinearIter<impl Iterator<Item = NodeValue>> {
            assert_eq!(
                (self.count, self.stride),
                (rhs.count, rhs.stride),
                "mismatched dimensions"
            );
            LinearIter {
                inner: self.inner.zip(rhs.inner).map(move |(x, y)| f(x, y)),
                stride: self.stride,
                count: self.count,
            }
        }

        pub fn add<J: Iterator<Item = NodeValue>>(
            self,
            rhs: LinearIter<J>,
        ) -> LinearIter<impl Iterator<Item = NodeValue>> {
            self.zip_values(rhs, |x, y| x + y)
        }

        pub fn sub<J: Iterator<Item = NodeValue>>(
            self,
            rhs: LinearIter<J>,
        ) -> LinearIter<impl Iterator<Item = NodeValue>> {
            self.zip_values(rhs, |x, y| x - y)
        }

        pub fn multiply_scalar(self, rhs: NodeValue) -> LinearIter<impl Iterator<Item = NodeValue>> {
            self.map_values(move |x| x * rhs)
        }

        pub fn powf_scalar(self, n: NodeValue) -> LinearIter<impl Iterator<Item = NodeValue>> {
            self.map_values(move |x| x.powf(n))
        }

        pub fn abs(self) -> LinearIter<impl Iterator<Item = NodeValue>> {
            self.map_values(NodeValue::abs)
        }

        /// rounds to a fixed number of decimal places
        pub fn round(self, decimals: u32) -> LinearIter<impl Iterator<Item = NodeValue>> {
            let scale = 10u32.pow(decimals) as NodeValue;
            self.map_values(move |x| (x * scale).round() / scale)
        }

        /// row-wise softmax, shifted by the row max
        pub fn softmax(self) -> Linear {
            let mut probabilities = self.collect();
            for row in probabilities.rows_iter_mut() {
                let max = row.iter().copied().fold(NodeValue::NEG_INFINITY, NodeValue::max);
                row.iter_mut().for_each(|x| *x = (*x - max).exp());
                let sum: NodeValue = row.iter().sum();
                row.iter_mut().for_each(|x| *x /= sum);
            }
            probabilities
        }

        pub fn collect(self) -> Linear {
            Linear {
                inner: self.inner.collect(),
                stride: self.stride,
                count: self.count,
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn naive_product(lhs: &Linear, rhs: &Linear) -> Linear {
            let mut product = Linear::new(lhs.count(), rhs.stride());
            for i in 0..lhs.count() {
                for j in 0..rhs.stride() {
                    let value = (0..lhs.stride())
                        .map(|k| lhs.row(i)[k] * rhs.row(k)[j])
                        .sum();
                    product.values_mut()[i * rhs.stride() + j] = value;
                }
            }
            product
        }

        #[test]
        fn matrix_product_matches_naive_product() {
            let rng = RngStrategy::testable(99);
            let mut lhs = Linear::new(7, 5);
            let mut rhs = Linear::new(5, 3);
            lhs.initialize_as_layer(&LayerInitStrategy::UniformFanIn, &rng);
            rhs.initialize_as_layer(&LayerInitStrategy::UniformFanIn, &rng);

            let product = lhs.matrix_product(&rhs);
            let expected = naive_product(&lhs, &rhs);
            let delta = product.iter().sub(expected.iter()).round(9).collect();

            assert_eq!(product.count(), 7);
            assert_eq!(product.stride(), 3);
            assert_eq!(delta, Linear::with_dimensions(&product));
        }

        #[test]
        fn transposed_products_match_explicit_transpose() {
            let a = Linear::from_iter(3, [1.0, 2.0, 3.0, 4.0, 5.0, 6.0].into_iter()).unwrap();
            let b = Linear::from_iter(3, [1.0, 0.0, -1.0, 2.0, 1.0, 0.0].into_iter()).unwrap();

            let ab_t = a.matrix_product_rhs_transposed(&b);
            assert_eq!(ab_t.values(), &[-2.0, 4.0, -2.0, 13.0]);

            let a_t_b = a.matrix_product_lhs_transposed(&b);
            assert_eq!(a_t_b.count(), 3);
            assert_eq!(a_t_b.stride(), 3);
            assert_eq!(a_t_b.row(0), &[9.0, 4.0, -1.0]);
        }

        #[test]
        fn concat_and_split_at_are_inverse() {
            let lhs = Linear::from_iter(2, [1.0, 2.0, 3.0, 4.0].into_iter()).unwrap();
            let rhs = Linear::from_iter(1, [5.0, 6.0].into_iter()).unwrap();

            let joined = lhs.concat(&rhs).unwrap();
            assert_eq!(joined.stride(), 3);
            assert_eq!(joined.row(1), &[3.0, 4.0, 6.0]);

            let (left, right) = joined.split_at(2).unwrap();
            assert_eq!(left, lhs);
            assert_eq!(right, rhs);
            assert!(joined.split_at(3).is_err());
            assert!(lhs.concat(&Linear::new(3, 1)).is_err());
        }

        #[test]
        fn vstack_and_rows_round_trip_blocks() {
            let first = Linear::with_value(2, 3, 1.0);
            let second = Linear::with_value(1, 3, 2.0);

            let stacked = Linear::vstack(&[first.clone(), second.clone()]).unwrap();
            assert_eq!(stacked.count(), 3);
            assert_eq!(stacked.rows(0, 2).unwrap(), first);
            assert_eq!(stacked.rows(2, 1).unwrap(), second);
            assert!(stacked.rows(2, 2).is_err());
            assert!(Linear::vstack(&[first, Linear::new(1, 2)]).is_err());
        }

        #[test]
        fn set_row_overwrites_single_row() {
            let mut linear = Linear::new(3, 2);
            linear.set_row(1, &[7.0, 8.0]);

            assert_eq!(linear.values(), &[0.0, 0.0, 7.0, 8.0, 0.0, 0.0]);
            assert_eq!(linear.to_sum(), 15.0);
            assert!(linear.as_single_stride().is_err());
        }

        #[test]
        fn softmax_rows_are_normalized() {
            let logits = Linear::from_iter(3, [1.0, 2.0, 3.0, 0.0, 0.0, 0.0].into_iter()).unwrap();
            let probabilities = logits.iter().softmax();

            for row in probabilities.rows_iter() {
                let sum: NodeValue = row.iter().sum();
                assert!((sum - 1.0).abs() < 1e-12);
            }
            assert_eq!(probabilities.row(1)[0], 1.0 / 3.0);
        }
    }
}

pub mod dense {
    use anyhow::{anyhow, Result};
    use serde::{Deserialize, Serialize};

    use crate::{
        lazy_opt,
        ml::{layer::LayerInitStrategy, NodeValue, RngStrategy},
    };

    use super::{linear::Linear, params::TrainableLinear, solver::source::OptimizerSource};

    /// Fully connected layer, `outputs = inputs * weights + bias`.
    #[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
    pub struct Dense {
        weights: TrainableLinear,
        bias: TrainableLinear,
        inputs_count: usize,
        outputs_count: usize,
    }

    impl Dense {
        pub fn new(
            inputs_count: usize,
            outputs_count: usize,
            strategy: &LayerInitStrategy,
            rng: &RngStrategy,
        ) -> Self {
            let mut weights = Linear::new(inputs_count, outputs_count);
            let mut bias = Linear::new(1, outputs_count);
            let values = weights.values_mut().iter_mut().chain(bias.values_mut());
            strategy.apply(values, inputs_count, rng);

            Self {
                weights: weights.into(),
                bias: bias.into(),
                inputs_count,
                outputs_count,
            }
        }

        pub fn forward(&self, inputs: &Linear) -> Result<Linear> {
            if inputs.stride() != self.inputs_count {
                Err(anyhow!(
                    "mismatched input vector size: expected={}, actual={}",
                    self.inputs_count,
                    inputs.stride()
                ))?;
            }
            let mut outputs = inputs.matrix_product(self.weights.value());
            let bias = self.bias.value().row(0);
            for row in outputs.rows_iter_mut() {
                row.iter_mut().zip(bias).for_each(|(x, b)| *x += b);
            }
            Ok(outputs)
        }

        /// Queues the weight and bias gradients and returns dloss/dinputs.
        pub fn backward(&self, inputs: &Linear, output_gradients: &Linear) -> Result<Linear> {
            if inputs.stride() != self.inputs_count
                || inputs.count() != output_gradients.count()
                || output_gradients.stride() != self.outputs_count
            {
                Err(anyhow!("mismatched output gradients shape"))?;
            }

            // dweights = inputs.T * doutputs
            let weights_gradients = inputs.matrix_product_lhs_transposed(output_gradients);
            self.weights.queue_gradients(weights_gradients);

            let mut bias_gradients = Linear::new(1, self.outputs_count);
            for row in output_gradients.rows_iter() {
                let sums = bias_gradients.values_mut().iter_mut();
                sums.zip(row).for_each(|(sum, x)| *sum += x);
            }
            self.bias.queue_gradients(bias_gradients);

            // dinputs = doutputs * weights.T
            Ok(output_gradients.matrix_product_rhs_transposed(self.weights.value()))
        }

        pub fn inputs_count(&self) -> usize {
            self.inputs_count
        }

        pub fn outputs_count(&self) -> usize {
            self.outputs_count
        }

        pub fn parameter_count(&self) -> usize {
            (self.inputs_count + 1) * self.outputs_count
        }

        pub fn apply_gradients<T: OptimizerSource>(&mut self, optimizer: &T) -> Result<()> {
            let weights_optimizer = lazy_opt!(optimizer, self.weights);
            self.weights.apply_gradients(weights_optimizer)?;

            let bias_optimizer = lazy_opt!(optimizer, self.bias);
            self.bias.apply_gradients(bias_optimizer)
        }

        /// sum of squared gradient values queued since the last apply/reset
        pub fn gradient_sum_squares(&self) -> NodeValue {
            self.weights.gradient_sum_squares() + self.bias.gradient_sum_squares()
        }

        pub fn reset_gradients(&self) {
            self.weights.reset_gradients();
            self.bias.reset_gradients();
        }
    }

}

pub mod params {
    use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockWriteGuard};

    use anyhow::Result;
    use serde::{Deserialize, Serialize};

    use crate::ml::NodeValue;

    use super::{linear::Linear, solver::Optimizer};

    /// Parameter matrix paired with the gradients queued against it.
    ///
    /// Clones share one gradient store.
    #[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct TrainableLinear {
        value: Linear,
        #[serde(skip)]
        gradients: ParameterStore,
    }

    impl TrainableLinear {
        pub fn value(&self) -> &Linear {
            &self.value
        }

        pub fn stride(&self) -> usize {
            self.value.stride()
        }

        pub fn count(&self) -> usize {
            self.value.count()
        }

        pub fn queue_gradients(&self, gradients: Linear) {
            self.gradients.add(gradients);
        }

        pub fn gradient_sum_squares(&self) -> NodeValue {
            self.gradients.peek(|x| x.map_or(0.0, Linear::sum_squares))
        }

        pub fn reset_gradients(&self) {
            self.gradients.take();
        }

        /// Steps the value along the queued gradients, then clears them.
        pub fn apply_gradients<O: Optimizer>(&mut self, mut optimizer: O) -> Result<()> {
            match self.gradients.take() {
                Some(gradients) => optimizer.update(&mut self.value, &gradients),
                None => Ok(()),
            }
        }
    }

    impl From<Linear> for TrainableLinear {
        fn from(value: Linear) -> Self {
            Self {
                value,
                gradients: ParameterStore::default(),
            }
        }
    }

    /// Gradient accumulator for one parameter matrix.
    ///
    /// A writer that finds `sum` locked parks its gradients in `pending`, which
    /// is folded into `sum` before every read.
    #[derive(Debug, Default, Clone)]
    pub struct ParameterStore {
        sum: Arc<RwLock<Option<Linear>>>,
        pending: Arc<Mutex<Vec<Linear>>>,
    }

    impl PartialEq for ParameterStore {
        fn eq(&self, _: &Self) -> bool {
            true
        }
    }

    impl ParameterStore {
        pub fn add(&self, gradients: Linear) {
            match self.sum.try_write() {
                Ok(mut sum) => Self::accumulate(&mut sum, gradients),
                Err(_) => lock(&self.pending).push(gradients),
            }
        }

        pub fn peek<T>(&self, action: impl FnOnce(Option<&Linear>) -> T) -> T {
            let sum = self.flush();
            action(sum.as_ref())
        }

        pub fn take(&self) -> Option<Linear> {
            self.flush().take()
        }

        fn flush(&self) -> RwLockWriteGuard<'_, Option<Linear>> {
            let pending: Vec<_> = lock(&self.pending).drain(..).collect();
            let mut sum = self.sum.write().unwrap_or_else(PoisonError::into_inner);
            for gradients in pending {
                Self::accumulate(&mut sum, gradients);
            }
            sum
        }

        fn accumulate(sum: &mut Option<Linear>, gradients: Linear) {
            let next = match sum.as_ref() {
                Some(current)
                    if current.count() == gradients.count()
                        && current.stride() == gradients.stride() =>
                {
                    current.iter().add(gradients.iter()).collect()
                }
                _ => gradients,
            };
            *sum = Some(next);
        }
    }

    fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
        mutex.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn parameter_store_folds_pending_gradients_on_peek() {
            let store = ParameterStore::default();
            let gradients = Linear::with_value(2, 2, 1.0);

            store.add(gradients.clone());
            lock(&store.pending).push(gradients);

            assert_eq!(store.peek(|x| x.map(Linear::to_sum)), Some(8.0));
            assert!(lock(&store.pending).is_empty());

            assert!(store.take().is_some());
            assert!(store.peek(|x| x.is_none()));
        }

        #[test]
        fn parameter_store_replaces_mismatched_shapes() {
            let store = ParameterStore::default();
            store.add(Linear::with_value(2, 2, 1.0));
            store.add(Linear::with_value(1, 3, 2.0));

            let gradients = store.take().unwrap();
            assert_eq!(gradients, Linear::with_value(1, 3, 2.0));
        }

        #[test]
        fn cloned_parameters_share_gradients() {
            let param = TrainableLinear::from(Linear::new(1, 2));
            let cloned = param.clone();

            cloned.queue_gradients(Linear::with_value(1, 2, 3.0));
            assert_eq!(param.gradient_sum_squares(), 18.0);

            param.reset_gradients();
            assert_eq!(cloned.gradient_sum_squares(), 0.0);
        }
    }
}

pub mod solver {
    use anyhow::{anyhow, Result};

    use crate::ml::NodeValue;

    use super::linear::Linear;

    pub trait Optimizer {
        fn update(&mut self, target: &mut Linear, dloss_dtarget: &Linear) -> Result<()>;
    }

    /// Adam with bias-corrected first and second moment estimates.
    pub struct AdamOptimizer {
        momentum: Linear,
        rms: Linear,
        beta: (NodeValue, NodeValue),
        epsilon: NodeValue,
        eta: NodeValue,
        t: i32,
    }

    pub type AdamOptimizerCache = source::OptimizerCache<AdamOptimizer>;

    impl AdamOptimizer {
        pub fn new(param_count: usize, param_dimension: usize, learn_rate: NodeValue) -> Self {
            Self::new_builder(param_count, param_dimension)
                .with_eta(learn_rate)
                .build()
        }

        pub fn new_builder(
            param_count: usize,
            param_dimension: usize,
        ) -> builder::AdamOptimizerBuilder {
            builder::AdamOptimizerBuilder::new(param_count, param_dimension)
        }

        pub fn new_cache(learn_rate: NodeValue) -> AdamOptimizerCache {
            source::OptimizerCache::new(move |param_count, param_dimension| {
                Self::new(param_count, param_dimension, learn_rate)
            })
        }
    }

    impl Optimizer for AdamOptimizer {
        fn update(&mut self, target: &mut Linear, dloss_dtarget: &Linear) -> Result<()> {
            let shape = (target.count(), target.stride());
            if shape != (dloss_dtarget.count(), dloss_dtarget.stride())
                || shape != (self.momentum.count(), self.momentum.stride())
            {
                Err(anyhow!(
                    "mismatched optimizer shape: target={:?}, state={:?}",
                    shape,
                    (self.momentum.count(), self.momentum.stride())
                ))?;
            }

            let (beta1, beta2) = self.beta;
            let momentum_scale = 1.0 / (1.0 - beta1.powi(self.t));
            let rms_scale = 1.0 / (1.0 - beta2.powi(self.t));

            let mut next_value = target.clone();
            let moments = self.momentum.values_mut().iter_mut().zip(self.rms.values_mut());
            let values = next_value.values_mut().iter_mut().zip(dloss_dtarget.values());

            for ((x, &grad), (m, v)) in values.zip(moments) {
                *m = beta1 * *m + (1.0 - beta1) * grad;
                *v = beta2 * *v + (1.0 - beta2) * grad * grad;
                let rms = (*v * rms_scale).sqrt();
                *x -= self.eta * *m * momentum_scale / (rms + self.epsilon);
            }

            if !next_value.is_finite() {
                Err(anyhow!("failed to update target: invalid gradients"))?;
            }

            self.t += 1;
            *target = next_value;
            Ok(())
        }
    }

    pub mod source {
        use std::{cell::RefCell, collections::HashMap, rc::Rc, sync::Arc};

        use anyhow::Result;
        use itertools::Itertools;
        use tracing::debug;

        use crate::ml::nn::linear::Linear;

        use super::{lazy::LazyOptimizer, Optimizer};

        /// Hands out optimizer state by parameter name.
        pub trait OptimizerSource: Clone {
            type Optimizer: Optimizer;

            fn create(
                &self,
                param_count: usize,
                param_dimension: usize,
                instance_name: String,
            ) -> Self::Optimizer;

            /// Defers creation until the first update, when the gradient shape is known.
            fn create_lazy_named(&self, instance_name: String) -> LazyOptimizer<'_, Self::Optimizer> {
                LazyOptimizer::new(move |param_count, param_dimension| {
                    self.create(param_count, param_dimension, instance_name)
                })
            }

            /// Nests every name created from the returned source under `index`.
            fn with_index(&self, index: usize) -> Self;
        }

        pub struct OptimizerCache<O> {
            factory: Arc<dyn Fn(usize, usize) -> O>,
            instances: Rc<RefCell<HashMap<String, Rc<RefCell<O>>>>>,
            scope: Vec<usize>,
        }

        impl<O> Clone for OptimizerCache<O> {
            fn clone(&self) -> Self {
                Self {
                    factory: self.factory.clone(),
                    instances: self.instances.clone(),
                    scope: self.scope.clone(),
                }
            }
        }

        impl<O> OptimizerCache<O> {
            pub fn new(factory: impl Fn(usize, usize) -> O + 'static) -> Self {
                Self {
                    factory: Arc::new(factory),
                    instances: Rc::new(RefCell::new(HashMap::new())),
                    scope: vec![],
                }
            }

            pub fn instance_count(&self) -> usize {
                self.instances.borrow().len()
            }

            fn scoped_name(&self, instance_name: &str) -> String {
                format!("[{}]{instance_name}", self.scope.iter().join("."))
            }
        }

        impl<O: Optimizer> OptimizerSource for OptimizerCache<O> {
            type Optimizer = CachedOptimizer<O>;

            fn create(
                &self,
                param_count: usize,
                param_dimension: usize,
                instance_name: String,
            ) -> Self::Optimizer {
                let key = self.scoped_name(&instance_name);
                let mut instances = self.instances.borrow_mut();
                let instance = instances.entry(key).or_insert_with_key(|key| {
                    debug!("Created new optimizer instance with key='{key}'");
                    let instance = (self.factory)(param_count, param_dimension);
                    Rc::new(RefCell::new(instance))
                });
                CachedOptimizer(instance.clone())
            }

            fn with_index(&self, index: usize) -> Self {
                let mut scoped = self.clone();
                scoped.scope.push(index);
                scoped
            }
        }

        pub struct CachedOptimizer<O>(Rc<RefCell<O>>);

        impl<O: Optimizer> Optimizer for CachedOptimizer<O> {
            fn update(&mut self, target: &mut Linear, dloss_dtarget: &Linear) -> Result<()> {
                self.0.borrow_mut().update(target, dloss_dtarget)
            }
        }

        /// Names a lazy optimizer after the call site and the parameter shape.
        #[macro_export]
        macro_rules! lazy_opt {
            ($opt:expr, $linear:expr) => {
                $opt.create_lazy_named(format!(
                    "{}:{}:{}/{}[{}x{}]",
                    file!(),
                    line!(),
                    column!(),
                    stringify!($linear),
                    $linear.count(),
                    $linear.stride()
                ))
            };
        }
    }

    pub mod lazy {
        use anyhow::{Context, Result};

        use crate::ml::nn::linear::Linear;

        use super::Optimizer;

        pub struct LazyOptimizer<'a, O> {
            factory: Option<Box<dyn FnOnce(usize, usize) -> O + 'a>>,
            instance: Option<O>,
        }

        impl<'a, O: Optimizer> LazyOptimizer<'a, O> {
            pub fn new(factory: impl FnOnce(usize, usize) -> O + 'a) -> Self {
                Self {
                    factory: Some(Box::new(factory)),
                    instance: None,
                }
            }
        }

        impl<'a, O: Optimizer> Optimizer for LazyOptimizer<'a, O> {
            fn update(&mut self, target: &mut Linear, dloss_dtarget: &Linear) -> Result<()> {
                if self.instance.is_none() {
                    let factory = self
                        .factory
                        .take()
                        .context("lazy optimizer factory already consumed")?;
                    self.instance = Some(factory(dloss_dtarget.count(), dloss_dtarget.stride()));
                }
                let instance = self
                    .instance
                    .as_mut()
                    .context("lazy optimizer has no instance")?;
                instance.update(target, dloss_dtarget)
            }
        }
    }

    pub mod builder {
        use super::*;

        pub struct AdamOptimizerBuilder {
            param_count: usize,
            param_dimension: usize,
            beta: (NodeValue, NodeValue),
            epsilon: NodeValue,
            eta: NodeValue,
        }

        impl AdamOptimizerBuilder {
            pub fn new(param_count: usize, param_dimension: usize) -> Self {
                Self {
                    param_count,
                    param_dimension,
                    beta: (0.9, 0.999),
                    epsilon: 1e-8,
                    eta: 0.001,
                }
            }

            pub fn with_beta(mut self, beta1: NodeValue, beta2: NodeValue) -> Self {
                self.beta = (beta1, beta2);
                self
            }

            pub fn with_eta(mut self, eta: NodeValue) -> Self {
                self.eta = eta;
                self
            }

            pub fn with_epsilon(mut self, epsilon: NodeValue) -> Self {
                self.epsilon = epsilon;
                self
            }

            pub fn build(self) -> AdamOptimizer {
                AdamOptimizer {
                    momentum: Linear::new(self.param_count, self.param_dimension),
                    rms: Linear::new(self.param_count, self.param_dimension),
                    beta: self.beta,
                    epsilon: self.epsilon,
                    eta: self.eta,
                    t: 1,
                }
            }
        }
    }

}

pub mod embedding {
    use anyhow::{anyhow, Result};
    use serde::{Deserialize, Serialize};

    use super::linear::Linear;

    /// Frozen lookup table mapping token ids to their pretrained vectors.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct EmbeddingLayer {
        table: Linear,
    }

    impl EmbeddingLayer {
        pub fn from_pretrained(table: Linear) -> Self {
            Self { table }
        }

        pub fn forward<T: AsRef<[usize]>>(&self, token_sequence: T) -> Result<Linear> {
            let token_sequence = token_sequence.as_ref();
            let mut embedding_vectors = Linear::new(token_sequence.len(), self.table.stride());

            for (row, &token) in token_sequence.iter().enumerate() {
                if token >= self.vocab_size() {
                    return Err(anyhow!(
                        "token {token} not in embedding range 0..{}",
                        self.vocab_size()
                    ));
                }
                embedding_vectors.set_row(row, self.table.row(token));
            }

            Ok(embedding_vectors)
        }

        pub fn vocab_size(&self) -> usize {
            self.table.count()
        }

        pub fn embedding_dimension(&self) -> usize {
            self.table.stride()
        }

        pub fn table(&self) -> &Linear {
            &self.table
        }

        /// Right-pads `input_sequence` to `seq_len`, returning the padded tokens
        /// and a `[seq_len, 1]` mask with ones over the real tokens.
        pub fn pad_inputs(
            input_sequence: &[usize],
            seq_len: usize,
            pad_token: usize,
        ) -> (Vec<usize>, Linear) {
            let mut padded = input_sequence.to_vec();
            padded.resize(seq_len.max(input_sequence.len()), pad_token);

            let mut mask = Linear::new(padded.len(), 1);
            mask.values_mut()
                .iter_mut()
                .take(input_sequence.len())
                .for_each(|x| *x = 1.0);

            (padded, mask)
        }
    }

    #[cfg(test)]
    mod tests {
        use crate::ml::LayerValues;

        use super::*;

        fn table() -> Linear {
            Linear::from_values(&[
                LayerValues::new(vec![0.0, 0.0]),
                LayerValues::new(vec![1.0, 2.0]),
                LayerValues::new(vec![3.0, 4.0]),
            ])
            .unwrap()
        }

        #[test]
        fn embedding_forward_looks_up_rows_in_order() {
            let layer = EmbeddingLayer::from_pretrained(table());
            let output = layer.forward([2, 1, 2]).unwrap();

            assert_eq!(output.count(), 3);
            assert_eq!(output.row(0), &[3.0, 4.0]);
            assert_eq!(output.row(1), &[1.0, 2.0]);
        }

        #[test]
        fn embedding_forward_rejects_unknown_tokens() {
            let layer = EmbeddingLayer::from_pretrained(table());
            assert!(layer.forward([0, 3]).is_err());
        }

        #[test]
        fn embedding_forward_empty_sequence_has_no_rows() {
            let layer = EmbeddingLayer::from_pretrained(table());
            let output = layer.forward(Vec::<usize>::new()).unwrap();
            assert_eq!(output.count(), 0);
            assert_eq!(output.stride(), 2);
        }

        #[test]
        fn pad_inputs_masks_padding_positions() {
            let (tokens, mask) = EmbeddingLayer::pad_inputs(&[4, 5], 4, 9);

            assert_eq!(tokens, vec![4, 5, 9, 9]);
            assert_eq!(mask.values(), &[1.0, 1.0, 0.0, 0.0]);

            let (tokens, mask) = EmbeddingLayer::pad_inputs(&[4, 5], 2, 9);
            assert_eq!(tokens, vec![4, 5]);
            assert_eq!(mask.to_sum(), 2.0);
        }
    }
}

pub mod lstm {
    use anyhow::{anyhow, Result};
    use serde::{Deserialize, Serialize};

    use crate::ml::{
        layer::LayerInitStrategy,
        LayerValues,
        NetworkActivationMode::{Sigmoid, Tanh},
        NodeValue, RngStrategy,
    };

    use super::{dense::Dense, linear::Linear, solver::source::OptimizerSource};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct LstmState {
        pub hidden: Linear,
        pub cell: Linear,
    }

    impl LstmState {
        pub fn zero(hidden_dimension: usize) -> Self {
            Self {
                hidden: Linear::new(1, hidden_dimension),
                cell: Linear::new(1, hidden_dimension),
            }
        }
    }

    #[derive(Debug, Clone)]
    pub struct LstmOutput {
        /// hidden state after every step, one row per input row
        pub outputs: Linear,
        pub state: LstmState,
    }

    #[derive(Debug, Clone)]
    pub struct LstmGradients {
        pub inputs: Linear,
        pub initial_state: LstmState,
    }

    /// Single layer LSTM, gate order `[input, forget, cell, output]`.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct LstmLayer {
        gates: Dense,
        input_dimension: usize,
        hidden_dimension: usize,
    }

    struct LstmStep {
        gate_inputs: Linear,
        /// `None` for masked steps
        gates: Option<GateValues>,
    }

    struct GateValues {
        input: LayerValues,
        forget: LayerValues,
        candidate: LayerValues,
        output: LayerValues,
        prev_cell: LayerValues,
        cell_tanh: LayerValues,
    }

    impl LstmLayer {
        pub fn new(input_dimension: usize, hidden_dimension: usize, rng: &RngStrategy) -> Self {
            let bound = (hidden_dimension.max(1) as NodeValue).powf(-0.5);
            let gates = Dense::new(
                input_dimension + hidden_dimension,
                4 * hidden_dimension,
                &LayerInitStrategy::Uniform(bound),
                rng,
            );
            Self {
                gates,
                input_dimension,
                hidden_dimension,
            }
        }

        pub fn input_dimension(&self) -> usize {
            self.input_dimension
        }

        pub fn hidden_dimension(&self) -> usize {
            self.hidden_dimension
        }

        pub fn parameter_count(&self) -> usize {
            self.gates.parameter_count()
        }

        pub fn forward(
            &self,
            inputs: &Linear,
            initial_state: &LstmState,
            mask: Option<&Linear>,
        ) -> Result<LstmOutput> {
            let (output, _) = self.forward_steps(inputs, initial_state, mask)?;
            Ok(output)
        }

        fn forward_steps(
            &self,
            inputs: &Linear,
            initial_state: &LstmState,
            mask: Option<&Linear>,
        ) -> Result<(LstmOutput, Vec<LstmStep>)> {
            self.validate(inputs, initial_state, mask)?;
            let h = self.hidden_dimension;

            let mut hidden = initial_state.hidden.clone();
            let mut cell = initial_state.cell.as_single_stride()?;
            let mut outputs = Linear::new(inputs.count(), h);
            let mut steps = Vec::with_capacity(inputs.count());

            for t in 0..inputs.count() {
                let x = inputs.rows(t, 1)?;
                let gate_inputs = x.concat(&hidden)?;
                let active = mask.map_or(true, |mask| mask.row(t)[0] != 0.0);

                if !active {
                    outputs.set_row(t, hidden.row(0));
                    steps.push(LstmStep {
                        gate_inputs,
                        gates: None,
                    });
                    continue;
                }

                let activations = self.gates.forward(&gate_inputs)?;
                let activations = activations.row(0);
                let gates = GateValues {
                    input: Sigmoid.apply(&activations[..h]),
                    forget: Sigmoid.apply(&activations[h..2 * h]),
                    candidate: Tanh.apply(&activations[2 * h..3 * h]),
                    output: Sigmoid.apply(&activations[3 * h..]),
                    cell_tanh: LayerValues::default(),
                    prev_cell: cell,
                };

                cell = (0..h)
                    .map(|j| {
                        gates.forget[j] * gates.prev_cell[j] + gates.input[j] * gates.candidate[j]
                    })
                    .collect();
                let cell_tanh = Tanh.apply(&cell);
                let next_hidden = gates.output.iter().zip(cell_tanh.iter()).map(|(o, c)| o * c);
                hidden = Linear::from_iter(h, next_hidden)?;
                outputs.set_row(t, hidden.row(0));

                steps.push(LstmStep {
                    gate_inputs,
                    gates: Some(GateValues { cell_tanh, ..gates }),
                });
            }

            let state = LstmState {
                hidden,
                cell: Linear::from_iter(h, cell.iter().copied())?,
            };
            Ok((LstmOutput { outputs, state }, steps))
        }

        /// Backpropagates through every step, queueing gate gradients.
        ///
        /// `output_gradients` holds dloss/doutput per step, and `final_state_gradients`
        /// carries any gradient flowing into the returned final state.
        pub fn backward(
            &self,
            inputs: &Linear,
            initial_state: &LstmState,
            mask: Option<&Linear>,
            output_gradients: &Linear,
            final_state_gradients: Option<&LstmState>,
        ) -> Result<LstmGradients> {
            let h = self.hidden_dimension;
            let e = self.input_dimension;
            if output_gradients.count() != inputs.count() || output_gradients.stride() != h {
                Err(anyhow!("mismatched output gradients shape"))?;
            }

            let (_, steps) = self.forward_steps(inputs, initial_state, mask)?;
            let (mut dhidden, mut dcell) = match final_state_gradients {
                Some(state) => (state.hidden.as_single_stride()?, state.cell.as_single_stride()?),
                None => (LayerValues::new(vec![0.0; h]), LayerValues::new(vec![0.0; h])),
            };
            let mut input_gradients = Linear::new(inputs.count(), e);

            for (t, step) in steps.iter().enumerate().rev() {
                dhidden
                    .iter_mut()
                    .zip(output_gradients.row(t))
                    .for_each(|(dh, g)| *dh += g);
                let Some(gates) = &step.gates else {
                    continue;
                };

                let dinput = Sigmoid.derivative(&gates.input);
                let dforget = Sigmoid.derivative(&gates.forget);
                let dcandidate = Tanh.derivative(&gates.candidate);
                let doutput = Sigmoid.derivative(&gates.output);
                let dcell_tanh = Tanh.derivative(&gates.cell_tanh);

                let mut dactivations = vec![0.0; 4 * h];
                for j in 0..h {
                    let dc = dcell[j] + dhidden[j] * gates.output[j] * dcell_tanh[j];

                    dactivations[j] = dc * gates.candidate[j] * dinput[j];
                    dactivations[h + j] = dc * gates.prev_cell[j] * dforget[j];
                    dactivations[2 * h + j] = dc * gates.input[j] * dcandidate[j];
                    dactivations[3 * h + j] = dhidden[j] * gates.cell_tanh[j] * doutput[j];
                    dcell[j] = dc * gates.forget[j];
                }

                let dactivations = Linear::from_iter(4 * h, dactivations.into_iter())?;
                let dgate_inputs = self.gates.backward(&step.gate_inputs, &dactivations)?;
                let (dx, dh_prev) = dgate_inputs.split_at(e)?;

                input_gradients.set_row(t, dx.row(0));
                dhidden = dh_prev.as_single_stride()?;
            }

            Ok(LstmGradients {
                inputs: input_gradients,
                initial_state: LstmState {
                    hidden: Linear::from_iter(h, dhidden.iter().copied())?,
                    cell: Linear::from_iter(h, dcell.iter().copied())?,
                },
            })
        }

        fn validate(
            &self,
            inputs: &Linear,
            initial_state: &LstmState,
            mask: Option<&Linear>,
        ) -> Result<()> {
            if inputs.stride() != self.input_dimension {
                Err(anyhow!(
                    "mismatched input vector size: expected={}, actual={}",
                    self.input_dimension,
                    inputs.stride()
                ))?;
            }
            for state in [&initial_state.hidden, &initial_state.cell] {
                if state.count() != 1 || state.stride() != self.hidden_dimension {
                    Err(anyhow!(
                        "invalid state shape: [{}, {}]",
                        state.count(),
                        state.stride()
                    ))?;
                }
            }
            if let Some(mask) = mask {
                if mask.count() != inputs.count() || mask.stride() != 1 {
                    Err(anyhow!("mismatched mask shape"))?;
                }
            }
            Ok(())
        }

        pub fn apply_gradients<T: OptimizerSource>(&mut self, optimizer: &T) -> Result<()> {
            self.gates.apply_gradients(optimizer)
        }

        pub fn gradient_sum_squares(&self) -> NodeValue {
            self.gates.gradient_sum_squares()
        }

        pub fn reset_gradients(&self) {
            self.gates.reset_gradients()
        }
    }

}

pub mod loss {
    use anyhow::{anyhow, Result};

    use crate::ml::NodeValue;

    use super::linear::Linear;

    /// Mean softmax cross entropy of `logits` rows against target class ids.
    ///
    /// Returns the loss along with dloss/dlogits.
    pub fn cross_entropy(logits: &Linear, targets: &[usize]) -> Result<(NodeValue, Linear)> {
        if logits.count() != targets.len() {
            Err(anyhow!(
                "mismatched target count: logits={}, targets={}",
                logits.count(),
                targets.len()
            ))?;
        }
        if targets.is_empty() {
            Err(anyhow!("no targets to compute loss over"))?;
        }
        if let Some(target) = targets.iter().find(|&&x| x >= logits.stride()) {
            Err(anyhow!(
                "target class {target} out of range 0..{}",
                logits.stride()
            ))?;
        }

        let n = targets.len() as NodeValue;
        let mut total = 0.0;
        let mut dlogits = logits.iter().softmax();

        for ((row, grads), &target) in logits.rows_iter().zip(dlogits.rows_iter_mut()).zip(targets) {
            let max = row.iter().copied().fold(NodeValue::NEG_INFINITY, NodeValue::max);
            let log_sum_exp = max + row.iter().map(|x| (x - max).exp()).sum::<NodeValue>().ln();
            total += log_sum_exp - row[target];

            grads[target] -= 1.0;
            grads.iter_mut().for_each(|x| *x /= n);
        }

        Ok((total / n, dlogits))
    }

    #[cfg(test)]
    mod tests {
        use crate::ml::{
            nn::tests::helpers::{assert_linear_close, compute_expected_dloss_dinput},
            LayerValues,
        };

        use super::*;

        #[test]
        fn cross_entropy_uniform_logits_equal_log_classes() {
            let logits = Linear::new(2, 4);
            let (loss, _) = cross_entropy(&logits, &[1, 3]).unwrap();
            assert!((loss - (4.0 as NodeValue).ln()).abs() < 1e-9);
        }

        #[test]
        fn cross_entropy_ignores_negative_infinite_logits() {
            let logits = Linear::from_values(&[LayerValues::new(vec![
                NodeValue::NEG_INFINITY,
                0.0,
                0.0,
            ])])
            .unwrap();
            let (loss, dlogits) = cross_entropy(&logits, &[1]).unwrap();

            assert!((loss - (2.0 as NodeValue).ln()).abs() < 1e-9);
            assert_eq!(dlogits.values(), &[0.0, -0.5, 0.5]);
        }

        #[test]
        fn cross_entropy_matches_known_value() {
            let logits = Linear::from_values(&[LayerValues::new(vec![1.0, 2.0, 3.0])]).unwrap();
            let (loss, dlogits) = cross_entropy(&logits, &[2]).unwrap();

            assert!((loss - 0.40760596).abs() < 1e-6);
            assert!(dlogits.to_sum().abs() < 1e-9);
        }

        #[test]
        fn cross_entropy_rejects_invalid_targets() {
            let logits = Linear::new(2, 3);
            assert!(cross_entropy(&logits, &[0]).is_err());
            assert!(cross_entropy(&logits, &[0, 3]).is_err());
        }

        #[test]
        fn cross_entropy_gradients_match_finite_differences() {
            let logits = Linear::from_values(&[
                LayerValues::new(vec![0.5, -1.0, 2.0, 0.1]),
                LayerValues::new(vec![-0.3, 0.8, 0.0, 1.2]),
            ])
            .unwrap();
            let targets = [2, 0];
            let (_, computed) = cross_entropy(&logits, &targets).unwrap();

            let expected = compute_expected_dloss_dinput(
                |logits| logits.clone(),
                |logits| cross_entropy(logits, &targets).unwrap().0,
                &logits,
                1e-8,
            );

            assert_linear_close(&computed, &expected, 4);
        }
    }
}

#[cfg(test)]
mod tests {
    pub mod helpers {
        use crate::ml::{layer::LayerInitStrategy, nn::linear::Linear, NodeValue, RngStrategy};

        /// Summed squared error and its gradient with respect to `output`.
        pub fn squared_error(output: &Linear, target: &Linear) -> (NodeValue, Linear) {
            let loss = output.iter().sub(target.iter()).powf_scalar(2.0).collect();
            let dloss = output.iter().sub(target.iter()).multiply_scalar(2.0).collect();
            (loss.to_sum(), dloss)
        }

        pub fn assert_optimisation_converges<T, I>(
            create: &dyn Fn(RngStrategy) -> (T, I, Linear),
            forward: &dyn Fn(&T, &I) -> Linear,
            backward: &dyn Fn(&mut T, &mut I, Linear) -> Linear,
            iters: usize,
        ) {
            let rng = RngStrategy::testable(12345);
            let (mut instance, mut inputs, target) = create(rng);
            let report_every = (iters / 10).max(1);

            let mut losses = Vec::with_capacity(iters);
            for iteration in 0..iters {
                let output = forward(&instance, &inputs);
                let (loss, dloss) = squared_error(&output, &target);
                let mean_loss = loss / output.values().len().max(1) as NodeValue;

                let grads = backward(&mut instance, &mut inputs, dloss);
                assert!(grads.is_finite(), "non-finite gradients at iter {iteration}");

                if iteration % report_every == 0 {
                    let mean_grads = grads.iter().abs().collect().to_sum()
                        / grads.values().len().max(1) as NodeValue;
                    println!(
                        "iter: {:<5} | loss: {:<10.5} | mean abs grad: {:.5}",
                        iteration, mean_loss, mean_grads
                    );
                }
                losses.push(mean_loss);
            }

            let (first, last) = (losses[0], losses[losses.len() - 1]);
            assert!(last.is_finite(), "final loss has invalid value");
            assert!(
                first > last,
                "loss failed to optimise (start={first:.4}, end={last:.4})"
            );
        }

        pub fn assert_input_gradients<T>(
            create: &dyn Fn(RngStrategy) -> (T, Linear, Linear),
            forward: &dyn Fn(&T, &Linear) -> Linear,
            backward: &dyn Fn(&mut T, &Linear, Linear) -> Linear,
        ) {
            let rng = RngStrategy::testable(12345);
            let (mut instance, inputs, target) = create(rng);

            let (_, dloss) = squared_error(&forward(&instance, &inputs), &target);
            let computed = backward(&mut instance, &inputs, dloss);

            let expected = compute_expected_dloss_dinput(
                |inputs| forward(&instance, inputs),
                |output| squared_error(output, &target).0,
                &inputs,
                1e-8,
            );
            assert_linear_close(&computed, &expected, 4);
        }

        /// Forward difference estimate of dloss/dinput, perturbing one value at a time.
        pub fn compute_expected_dloss_dinput(
            forward_fn: impl Fn(&Linear) -> Linear,
            loss_fn: impl Fn(&Linear) -> NodeValue,
            inputs: &Linear,
            epsilon: NodeValue,
        ) -> Linear {
            let original_loss = loss_fn(&forward_fn(inputs));
            let mut perturbed = inputs.clone();
            let mut dloss_dinput = Linear::with_dimensions(inputs);

            for idx in 0..inputs.values().len() {
                perturbed.values_mut()[idx] += epsilon;
                let loss = loss_fn(&forward_fn(&perturbed));
                dloss_dinput.values_mut()[idx] = (loss - original_loss) / epsilon;
                perturbed.values_mut()[idx] = inputs.values()[idx];
            }

            dloss_dinput
        }

        pub fn assert_linear_close(actual: &Linear, expected: &Linear, decimals: u32) {
            assert_eq!(
                (actual.count(), actual.stride()),
                (expected.count(), expected.stride())
            );
            let delta = actual.iter().sub(expected.iter()).round(decimals).collect();
            assert_eq!(
                delta,
                Linear::with_dimensions(actual),
                "\n actual: {actual}\n expected: {expected}"
            );
        }

        pub fn new_linear(count: usize, stride: usize, rng: &RngStrategy) -> Linear {
            let mut linear = Linear::new(count, stride);
            linear.initialize_as_layer(&LayerInitStrategy::Kaiming, rng);
            linear
        }
    }
}
