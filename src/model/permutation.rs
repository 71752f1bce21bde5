//! Group-row permutations applied between coupling flows.
//!
//! After flow `i` the audio and the conditioning are reordered along the
//! height axis with `new[j] = old[perm_i[j]]`, so the next flow
//! autoregresses over a different row order.

use candle_core::Tensor;

use crate::{Error, Result};

/// Validated permutation per flow step, plus the inverses.
#[derive(Debug, Clone, PartialEq)]
pub struct PermutationSchedule {
    n_group: usize,
    forward: Vec<Vec<usize>>,
    inverse: Vec<Vec<usize>>,
}

impl PermutationSchedule {
    /// Check that every step is a permutation of `0..n_group`.
    pub fn new(perms: Vec<Vec<usize>>, n_group: usize) -> Result<Self> {
        let mut inverse = Vec::with_capacity(perms.len());
        for (step, perm) in perms.iter().enumerate() {
            if perm.len() != n_group {
                return Err(Error::Config(format!(
                    "permutation {step} has {} entries, expected {n_group}",
                    perm.len()
                )));
            }
            let mut inv = vec![usize::MAX; n_group];
            for (j, &src) in perm.iter().enumerate() {
                if src >= n_group || inv[src] != usize::MAX {
                    return Err(Error::Config(format!(
                        "permutation {step} is not a permutation of 0..{n_group}: {perm:?}"
                    )));
                }
                inv[src] = j;
            }
            inverse.push(inv);
        }
        Ok(Self {
            n_group,
            forward: perms,
            inverse,
        })
    }

    /// The default schedule: the first half of the steps reverse all rows,
    /// the rest reverse each half of the rows independently.
    ///
    /// For 16 groups and 8 flows this is four times `[15, 14, .., 0]`
    /// followed by four times `[7, .., 0, 15, .., 8]`.
    pub fn reference(n_flows: usize, n_group: usize) -> Result<Self> {
        let half = n_group / 2;
        let full: Vec<usize> = (0..n_group).rev().collect();
        let halves: Vec<usize> = (0..half).rev().chain((half..n_group).rev()).collect();
        let perms = (0..n_flows)
            .map(|i| {
                if i < n_flows.div_ceil(2) {
                    full.clone()
                } else {
                    halves.clone()
                }
            })
            .collect();
        Self::new(perms, n_group)
    }

    /// Use `perms` when given, else the reference schedule.
    pub fn from_config(perms: Option<&[Vec<usize>]>, n_flows: usize, n_group: usize) -> Result<Self> {
        let schedule = match perms {
            Some(perms) => Self::new(perms.to_vec(), n_group)?,
            None => Self::reference(n_flows, n_group)?,
        };
        if schedule.len() != n_flows {
            return Err(Error::Config(format!(
                "{} permutations given for {n_flows} flows",
                schedule.len()
            )));
        }
        Ok(schedule)
    }

    pub fn len(&self) -> usize {
        self.forward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }

    pub fn step(&self, step: usize) -> &[usize] {
        &self.forward[step]
    }

    /// Reorder rows (dim 2) of `xs` with permutation `step`.
    pub fn apply(&self, step: usize, xs: &Tensor) -> Result<Tensor> {
        self.select(&self.forward[step], xs)
    }

    /// Undo [`Self::apply`] for `step`.
    pub fn invert(&self, step: usize, xs: &Tensor) -> Result<Tensor> {
        self.select(&self.inverse[step], xs)
    }

    fn select(&self, order: &[usize], xs: &Tensor) -> Result<Tensor> {
        let rows = xs.dim(2)?;
        if rows != self.n_group {
            return Err(Error::Precondition(format!(
                "permutation over {} rows applied to {rows} rows",
                self.n_group
            )));
        }
        let index: Vec<u32> = order.iter().map(|&i| i as u32).collect();
        let index = Tensor::new(index.as_slice(), xs.device())?;
        Ok(xs.contiguous()?.index_select(&index, 2)?)
    }

    /// Row order seen by each flow, in original row indices.
    ///
    /// Flow 0 sees the identity order; flow `i + 1` sees flow `i`'s order
    /// reordered by `perm_i`.
    pub fn row_orders(&self) -> Vec<Vec<usize>> {
        let mut order: Vec<usize> = (0..self.n_group).collect();
        let mut orders = Vec::with_capacity(self.len());
        for perm in &self.forward {
            orders.push(order.clone());
            order = perm.iter().map(|&j| order[j]).collect();
        }
        orders
    }

    /// Original row that each flow generates first.
    pub fn root_rows(&self) -> Vec<usize> {
        self.row_orders().iter().map(|order| order[0]).collect()
    }

    /// Whether every row can influence every other row: for each ordered
    /// pair `(a, b)` some flow places `a` before `b`.
    pub fn covers_all_orderings(&self) -> bool {
        let n = self.n_group;
        let mut reached = vec![false; n * n];
        for order in self.row_orders() {
            for (i, &a) in order.iter().enumerate() {
                for &b in &order[i + 1..] {
                    reached[a * n + b] = true;
                }
            }
        }
        (0..n).all(|a| (0..n).all(|b| a == b || reached[a * n + b]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn reference_matches_sixteen_group_table() {
        let schedule = PermutationSchedule::reference(8, 16).unwrap();
        let full: Vec<usize> = (0..16).rev().collect();
        let halves = vec![7, 6, 5, 4, 3, 2, 1, 0, 15, 14, 13, 12, 11, 10, 9, 8];
        for i in 0..4 {
            assert_eq!(schedule.step(i), full.as_slice());
        }
        for i in 4..8 {
            assert_eq!(schedule.step(i), halves.as_slice());
        }
        assert!(schedule.covers_all_orderings());
        assert_eq!(schedule.root_rows(), vec![0, 15, 0, 15, 0, 7, 0, 7]);
    }

    #[test]
    fn single_flow_reverses() {
        let schedule = PermutationSchedule::reference(1, 8).unwrap();
        assert_eq!(schedule.step(0), &[7, 6, 5, 4, 3, 2, 1, 0]);
    }

    #[test]
    fn identity_schedule_fails_coverage() {
        let identity: Vec<usize> = (0..8).collect();
        let schedule = PermutationSchedule::new(vec![identity; 4], 8).unwrap();
        assert!(!schedule.covers_all_orderings());
    }

    #[test]
    fn rejects_non_permutations() {
        assert!(PermutationSchedule::new(vec![vec![0, 0, 1, 2]], 4).is_err());
        assert!(PermutationSchedule::new(vec![vec![0, 1, 2]], 4).is_err());
        assert!(PermutationSchedule::new(vec![vec![0, 1, 2, 4]], 4).is_err());
        assert!(PermutationSchedule::from_config(None, 3, 8).is_ok());
        assert!(PermutationSchedule::from_config(Some([vec![1, 0]].as_slice()), 2, 2).is_err());
    }

    #[test]
    fn apply_and_invert_rows() {
        let device = Device::Cpu;
        let schedule = PermutationSchedule::new(vec![vec![2, 0, 3, 1]], 4).unwrap();
        let xs = Tensor::arange(0f32, 8.0, &device)
            .unwrap()
            .reshape((1, 1, 4, 2))
            .unwrap();
        let permuted = schedule.apply(0, &xs).unwrap();
        assert_eq!(
            permuted.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
            vec![4.0, 5.0, 0.0, 1.0, 6.0, 7.0, 2.0, 3.0]
        );
        let back = schedule.invert(0, &permuted).unwrap();
        assert_eq!(
            back.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
            xs.flatten_all().unwrap().to_vec1::<f32>().unwrap()
        );
    }

    #[test]
    fn strided_batches_are_reordered() {
        let schedule = PermutationSchedule::reference(1, 4).unwrap();
        assert_eq!(schedule.step(0), &[3, 2, 1, 0]);
        // [2, 1, 2, 4] transposed to a non-contiguous [2, 1, 4, 2] view.
        let xs = Tensor::arange(0f32, 16.0, &Device::Cpu)
            .unwrap()
            .reshape((2, 1, 2, 4))
            .unwrap()
            .transpose(2, 3)
            .unwrap();
        assert!(!xs.is_contiguous());
        let ys = schedule.apply(0, &xs).unwrap();
        assert_eq!(
            ys.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
            vec![
                3.0, 7.0, 2.0, 6.0, 1.0, 5.0, 0.0, 4.0, 11.0, 15.0, 10.0, 14.0, 9.0, 13.0, 8.0,
                12.0
            ]
        );
        let back = schedule.invert(0, &ys).unwrap();
        assert_eq!(
            back.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
            xs.flatten_all().unwrap().to_vec1::<f32>().unwrap()
        );
    }

    #[test]
    fn wrong_row_count_rejected() {
        let device = Device::Cpu;
        let schedule = PermutationSchedule::reference(2, 8).unwrap();
        let xs = Tensor::zeros((1, 1, 4, 3), candle_core::DType::F32, &device).unwrap();
        assert!(matches!(schedule.apply(0, &xs), Err(Error::Precondition(_))));
    }
}
