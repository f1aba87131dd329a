//! Named parameter sets.
//!
//! A [`ParameterSet`] is an ordered view over a candle [`VarMap`]: iteration is
//! always lexicographic by parameter name so norms, checkpoints and EMA
//! updates visit parameters in the same order on every worker.

use std::collections::{BTreeSet, HashMap};

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};

use crate::error::{LatteError, Result};

/// Ordered mapping from parameter name to a trainable tensor.
///
/// Cloning a `ParameterSet` clones the handle, not the storage. Use
/// [`ParameterSet::deep_copy`] for an independent set.
#[derive(Clone)]
pub struct ParameterSet {
    varmap: VarMap,
}

impl Default for ParameterSet {
    fn default() -> Self {
        Self {
            varmap: VarMap::new(),
        }
    }
}

impl std::fmt::Debug for ParameterSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let keys = self.keys().unwrap_or_default();
        f.debug_struct("ParameterSet").field("keys", &keys).finish()
    }
}

impl ParameterSet {
    /// Create an empty parameter set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap an existing `VarMap`.
    #[must_use]
    pub fn from_varmap(varmap: VarMap) -> Self {
        Self { varmap }
    }

    /// Underlying `VarMap`.
    #[must_use]
    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    /// A `VarBuilder` that creates parameters inside this set.
    #[must_use]
    pub fn var_builder(&self, dtype: DType, device: &Device) -> VarBuilder<'static> {
        VarBuilder::from_varmap(&self.varmap, dtype, device)
    }

    /// All parameters, sorted by name.
    ///
    /// # Errors
    ///
    /// Returns [`LatteError::Poisoned`] if the `VarMap` lock was poisoned.
    pub fn named_vars(&self) -> Result<Vec<(String, Var)>> {
        let data = self.varmap.data().lock().map_err(|_| LatteError::Poisoned)?;
        let mut vars: Vec<(String, Var)> = data
            .iter()
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();
        vars.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(vars)
    }

    /// Parameter names, sorted.
    ///
    /// # Errors
    ///
    /// Returns [`LatteError::Poisoned`] if the `VarMap` lock was poisoned.
    pub fn keys(&self) -> Result<Vec<String>> {
        Ok(self.named_vars()?.into_iter().map(|(name, _)| name).collect())
    }

    /// Look up a single parameter.
    ///
    /// # Errors
    ///
    /// Returns [`LatteError::Poisoned`] if the `VarMap` lock was poisoned.
    pub fn get(&self, name: &str) -> Result<Option<Var>> {
        let data = self.varmap.data().lock().map_err(|_| LatteError::Poisoned)?;
        Ok(data.get(name).cloned())
    }

    /// Number of named parameters.
    ///
    /// # Errors
    ///
    /// Returns [`LatteError::Poisoned`] if the `VarMap` lock was poisoned.
    pub fn len(&self) -> Result<usize> {
        let data = self.varmap.data().lock().map_err(|_| LatteError::Poisoned)?;
        Ok(data.len())
    }

    /// Whether the set holds no parameters.
    ///
    /// # Errors
    ///
    /// Returns [`LatteError::Poisoned`] if the `VarMap` lock was poisoned.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Total number of scalar elements.
    ///
    /// # Errors
    ///
    /// Returns [`LatteError::Poisoned`] if the `VarMap` lock was poisoned.
    pub fn element_count(&self) -> Result<usize> {
        Ok(self
            .named_vars()?
            .iter()
            .map(|(_, var)| var.elem_count())
            .sum())
    }

    /// Insert a parameter initialised from `value`. The storage is copied.
    ///
    /// # Errors
    ///
    /// Returns an error if the copy fails or the `VarMap` lock was poisoned.
    pub fn insert(&self, name: impl Into<String>, value: &Tensor) -> Result<Var> {
        let var = detached_var(value)?;
        let mut data = self.varmap.data().lock().map_err(|_| LatteError::Poisoned)?;
        data.insert(name.into(), var.clone());
        Ok(var)
    }

    /// Structurally identical set with independent storage.
    pub fn deep_copy(&self) -> Result<Self> {
        let copy = Self::new();
        for (name, var) in self.named_vars()? {
            copy.insert(name, var.as_tensor())?;
        }
        Ok(copy)
    }

    /// Detached copies of every parameter, sorted by name.
    ///
    /// Later updates to the set do not show through the returned tensors.
    ///
    /// # Errors
    ///
    /// Returns an error if a tensor copy fails.
    pub fn snapshot(&self) -> Result<Vec<(String, Tensor)>> {
        self.named_vars()?
            .into_iter()
            .map(|(name, var)| Ok((name, var.as_tensor().copy()?.detach())))
            .collect()
    }

    /// Fail unless `other` has exactly the same keys and shapes.
    ///
    /// # Errors
    ///
    /// Returns [`LatteError::ParameterMismatch`] naming the differing keys or
    /// the first differing shape.
    pub fn check_compatible(&self, other: &ParameterSet) -> Result<()> {
        let ours = self.named_vars()?;
        let theirs = other.named_vars()?;

        if ours.len() != theirs.len()
            || ours.iter().zip(theirs.iter()).any(|(a, b)| a.0 != b.0)
        {
            let a: BTreeSet<&str> = ours.iter().map(|(k, _)| k.as_str()).collect();
            let b: BTreeSet<&str> = theirs.iter().map(|(k, _)| k.as_str()).collect();
            let only_ours: Vec<&str> = a.difference(&b).copied().collect();
            let only_theirs: Vec<&str> = b.difference(&a).copied().collect();
            return Err(LatteError::ParameterMismatch(format!(
                "key sets differ (only in first: {only_ours:?}, only in second: {only_theirs:?})"
            )));
        }

        for ((name, a), (_, b)) in ours.iter().zip(theirs.iter()) {
            if a.dims() != b.dims() {
                return Err(LatteError::ParameterMismatch(format!(
                    "`{name}` has shape {:?} in one set and {:?} in the other",
                    a.dims(),
                    b.dims()
                )));
            }
        }
        Ok(())
    }

    /// Fail if any key of `tensors` that names a parameter carries a
    /// different shape. Nothing is written.
    ///
    /// # Errors
    ///
    /// Returns [`LatteError::ShapeMismatch`] for the first mismatched key.
    pub fn check_loadable(&self, tensors: &HashMap<String, Tensor>) -> Result<()> {
        for (name, var) in self.named_vars()? {
            if let Some(src) = tensors.get(&name) {
                if src.dims() != var.dims() {
                    return Err(LatteError::ShapeMismatch {
                        key: name,
                        expected: var.dims().to_vec(),
                        got: src.dims().to_vec(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Copy matching tensors into this set.
    ///
    /// Keys present in `tensors` but not in the set are reported as ignored,
    /// keys of the set absent from `tensors` are reported as missing and keep
    /// their current values.
    ///
    /// # Errors
    ///
    /// A shape mismatch on a matched key fails before anything is written
    /// (see [`check_loadable`](Self::check_loadable)).
    pub fn load_partial(&self, tensors: &HashMap<String, Tensor>) -> Result<LoadReport> {
        self.check_loadable(tensors)?;

        let vars = self.named_vars()?;
        let mut report = LoadReport::default();
        let mut matched = Vec::new();
        for (name, var) in &vars {
            match tensors.get(name) {
                Some(src) => matched.push((name, var, src)),
                None => report.missing.push(name.clone()),
            }
        }

        let known: BTreeSet<&str> = vars.iter().map(|(k, _)| k.as_str()).collect();
        report.ignored = tensors
            .keys()
            .filter(|k| !known.contains(k.as_str()))
            .cloned()
            .collect();
        report.ignored.sort();

        for (name, var, src) in matched {
            let src = src.to_device(var.device())?.to_dtype(var.dtype())?;
            var.set(&src)?;
            report.loaded.push(name.clone());
        }

        Ok(report)
    }
}

/// Outcome of a partial load.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// Keys copied into the destination.
    pub loaded: Vec<String>,
    /// Checkpoint keys with no counterpart in the destination.
    pub ignored: Vec<String>,
    /// Destination keys the checkpoint did not provide.
    pub missing: Vec<String>,
}

impl LoadReport {
    /// Whether every destination key was filled and nothing was ignored.
    #[must_use]
    pub fn is_exact(&self) -> bool {
        self.ignored.is_empty() && self.missing.is_empty()
    }

    /// Fraction of checkpoint entries that were used, in percent.
    #[must_use]
    pub fn percent_loaded(&self) -> f64 {
        let total = self.loaded.len() + self.ignored.len();
        if total == 0 {
            0.0
        } else {
            100.0 * self.loaded.len() as f64 / total as f64
        }
    }

    /// Log every ignored and missing key.
    pub fn log(&self, what: &str) {
        for key in &self.ignored {
            tracing::info!("{what}: ignoring checkpoint key {key}");
        }
        for key in &self.missing {
            tracing::info!("{what}: no checkpoint value for {key}, keeping current value");
        }
        tracing::info!(
            "{what}: loaded {:.1}% of checkpoint entries ({} loaded, {} ignored, {} missing)",
            self.percent_loaded(),
            self.loaded.len(),
            self.ignored.len(),
            self.missing.len()
        );
    }
}

/// A fresh variable holding a copy of `tensor`, detached from any graph.
pub(crate) fn detached_var(tensor: &Tensor) -> Result<Var> {
    Ok(Var::from_tensor(&tensor.copy()?.detach())?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_set() -> ParameterSet {
        let set = ParameterSet::new();
        let dev = Device::Cpu;
        set.insert("b.bias", &Tensor::new(&[1f32, 2.], &dev).unwrap())
            .unwrap();
        set.insert("a.weight", &Tensor::new(&[[1f32, 2.], [3., 4.]], &dev).unwrap())
            .unwrap();
        set
    }

    #[test]
    fn test_default_is_empty() {
        let set = ParameterSet::default();
        assert!(set.is_empty().unwrap());
        assert!(set.keys().unwrap().is_empty());
    }

    #[test]
    fn test_named_vars_sorted() {
        let set = sample_set();
        assert_eq!(set.keys().unwrap(), vec!["a.weight", "b.bias"]);
        assert_eq!(set.element_count().unwrap(), 6);
        assert_eq!(set.len().unwrap(), 2);
    }

    #[test]
    fn test_deep_copy_is_independent() {
        let set = sample_set();
        let copy = set.deep_copy().unwrap();
        set.check_compatible(&copy).unwrap();

        let var = set.get("b.bias").unwrap().unwrap();
        var.set(&Tensor::new(&[9f32, 9.], &Device::Cpu).unwrap())
            .unwrap();

        let copied = copy.get("b.bias").unwrap().unwrap();
        assert_eq!(copied.as_tensor().to_vec1::<f32>().unwrap(), vec![1., 2.]);
    }

    #[test]
    fn test_snapshot_is_detached() {
        let set = sample_set();
        let snapshot = set.snapshot().unwrap();
        set.get("b.bias")
            .unwrap()
            .unwrap()
            .set(&Tensor::new(&[0f32, 0.], &Device::Cpu).unwrap())
            .unwrap();
        assert_eq!(snapshot[1].0, "b.bias");
        assert_eq!(snapshot[1].1.to_vec1::<f32>().unwrap(), vec![1., 2.]);
    }

    #[test]
    fn test_check_compatible_reports_keys() {
        let set = sample_set();
        let other = ParameterSet::new();
        other
            .insert("a.weight", &Tensor::zeros((2, 2), DType::F32, &Device::Cpu).unwrap())
            .unwrap();
        let err = set.check_compatible(&other).unwrap_err();
        assert!(err.to_string().contains("b.bias"));
    }

    #[test]
    fn test_check_compatible_shapes() {
        let set = sample_set();
        let other = ParameterSet::new();
        other
            .insert("a.weight", &Tensor::zeros((2, 2), DType::F32, &Device::Cpu).unwrap())
            .unwrap();
        other
            .insert("b.bias", &Tensor::zeros(3, DType::F32, &Device::Cpu).unwrap())
            .unwrap();
        assert!(matches!(
            set.check_compatible(&other),
            Err(LatteError::ParameterMismatch(_))
        ));
    }

    #[test]
    fn test_load_partial_reports_and_keeps_unmatched() {
        let set = sample_set();
        let mut tensors = HashMap::new();
        tensors.insert(
            "b.bias".to_string(),
            Tensor::new(&[5f32, 6.], &Device::Cpu).unwrap(),
        );
        tensors.insert(
            "c.extra".to_string(),
            Tensor::new(&[7f32], &Device::Cpu).unwrap(),
        );

        let report = set.load_partial(&tensors).unwrap();
        assert_eq!(report.loaded, vec!["b.bias"]);
        assert_eq!(report.ignored, vec!["c.extra"]);
        assert_eq!(report.missing, vec!["a.weight"]);
        assert!(!report.is_exact());
        assert!((report.percent_loaded() - 50.0).abs() < 1e-9);

        let bias = set.get("b.bias").unwrap().unwrap();
        assert_eq!(bias.as_tensor().to_vec1::<f32>().unwrap(), vec![5., 6.]);
        let weight = set.get("a.weight").unwrap().unwrap();
        assert_eq!(
            weight.as_tensor().to_vec2::<f32>().unwrap(),
            vec![vec![1., 2.], vec![3., 4.]]
        );
    }

    #[test]
    fn test_check_loadable_only_compares_shared_keys() {
        let set = sample_set();
        let mut tensors = HashMap::new();
        tensors.insert(
            "unknown".to_string(),
            Tensor::zeros(9, DType::F32, &Device::Cpu).unwrap(),
        );
        set.check_loadable(&tensors).unwrap();

        tensors.insert(
            "b.bias".to_string(),
            Tensor::zeros(3, DType::F32, &Device::Cpu).unwrap(),
        );
        let err = set.check_loadable(&tensors).unwrap_err();
        assert!(matches!(err, LatteError::ShapeMismatch { ref key, .. } if key == "b.bias"));
    }

    #[test]
    fn test_load_partial_shape_mismatch_writes_nothing() {
        let set = sample_set();
        let mut tensors = HashMap::new();
        tensors.insert(
            "a.weight".to_string(),
            Tensor::zeros((3, 3), DType::F32, &Device::Cpu).unwrap(),
        );
        tensors.insert(
            "b.bias".to_string(),
            Tensor::new(&[5f32, 6.], &Device::Cpu).unwrap(),
        );

        let err = set.load_partial(&tensors).unwrap_err();
        assert!(matches!(err, LatteError::ShapeMismatch { ref key, .. } if key == "a.weight"));

        let bias = set.get("b.bias").unwrap().unwrap();
        assert_eq!(bias.as_tensor().to_vec1::<f32>().unwrap(), vec![1., 2.]);
    }
}
