//! Iteration-keyed parameter checkpoints.
//!
//! ```text
//! dir/
//!   checkpoint                 "model_checkpoint_path: step-{latest}"
//!   step-{iteration}.safetensors
//! ```
//!
//! Only parameters are stored; optimizer moments start fresh on resume.

use std::fs;
use std::path::{Path, PathBuf};

use candle_nn::VarMap;

use crate::{Error, Result};

const POINTER_FILE: &str = "checkpoint";
const POINTER_PREFIX: &str = "model_checkpoint_path: step-";

/// Path of the parameter file for `iteration`.
pub fn checkpoint_path(dir: impl AsRef<Path>, iteration: usize) -> PathBuf {
    dir.as_ref().join(format!("step-{iteration}.safetensors"))
}

/// Write every variable in `varmap` and mark `iteration` as the latest.
pub fn save_checkpoint(dir: impl AsRef<Path>, iteration: usize, varmap: &VarMap) -> Result<PathBuf> {
    let dir = dir.as_ref();
    fs::create_dir_all(dir)?;
    let path = checkpoint_path(dir, iteration);
    varmap.save(&path)?;
    fs::write(dir.join(POINTER_FILE), format!("{POINTER_PREFIX}{iteration}"))?;
    tracing::info!("Saved checkpoint {}", path.display());
    Ok(path)
}

/// Iteration recorded in `dir/checkpoint`, or `None` if there is no pointer.
pub fn latest_checkpoint(dir: impl AsRef<Path>) -> Result<Option<usize>> {
    let pointer = dir.as_ref().join(POINTER_FILE);
    if !pointer.exists() {
        return Ok(None);
    }
    let text = fs::read_to_string(&pointer)?;
    let iteration = text
        .trim()
        .strip_prefix(POINTER_PREFIX)
        .and_then(|n| n.parse().ok())
        .ok_or_else(|| {
            Error::Checkpoint(format!(
                "malformed pointer in {}: {:?}",
                pointer.display(),
                text.trim()
            ))
        })?;
    Ok(Some(iteration))
}

/// Load `iteration` (or the latest one) into `varmap`.
///
/// Returns the loaded iteration, `None` when no iteration was requested and
/// the directory holds no checkpoint.
pub fn load_checkpoint(
    dir: impl AsRef<Path>,
    iteration: Option<usize>,
    varmap: &mut VarMap,
) -> Result<Option<usize>> {
    let dir = dir.as_ref();
    let Some(iteration) = iteration.map_or_else(|| latest_checkpoint(dir), |i| Ok(Some(i)))? else {
        tracing::info!("No checkpoint in {}, starting from scratch", dir.display());
        return Ok(None);
    };
    let path = checkpoint_path(dir, iteration);
    if !path.exists() {
        return Err(Error::Checkpoint(format!("{} not found", path.display())));
    }
    varmap.load(&path)?;
    tracing::info!("Loaded checkpoint {}", path.display());
    Ok(Some(iteration))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, Tensor};
    use candle_nn::{Init, VarBuilder};

    fn varmap_with(value: f32) -> VarMap {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        vb.get_with_hints(3, "layer.bias", Init::Const(value as f64))
            .unwrap();
        varmap
    }

    fn bias(varmap: &VarMap) -> Vec<f32> {
        varmap
            .data()
            .lock()
            .unwrap()
            .get("layer.bias")
            .unwrap()
            .as_tensor()
            .to_vec1()
            .unwrap()
    }

    #[test]
    fn empty_dir_has_no_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(latest_checkpoint(dir.path()).unwrap(), None);
        let mut varmap = varmap_with(0.0);
        assert_eq!(load_checkpoint(dir.path(), None, &mut varmap).unwrap(), None);
    }

    #[test]
    fn save_then_load_latest() {
        let dir = tempfile::tempdir().unwrap();
        save_checkpoint(dir.path(), 10, &varmap_with(1.0)).unwrap();
        let path = save_checkpoint(dir.path(), 20, &varmap_with(2.0)).unwrap();
        assert!(path.ends_with("step-20.safetensors"));
        assert_eq!(latest_checkpoint(dir.path()).unwrap(), Some(20));

        let mut varmap = varmap_with(0.0);
        assert_eq!(load_checkpoint(dir.path(), None, &mut varmap).unwrap(), Some(20));
        assert_eq!(bias(&varmap), vec![2.0; 3]);

        assert_eq!(load_checkpoint(dir.path(), Some(10), &mut varmap).unwrap(), Some(10));
        assert_eq!(bias(&varmap), vec![1.0; 3]);
    }

    #[test]
    fn missing_iteration_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        save_checkpoint(dir.path(), 1, &varmap_with(1.0)).unwrap();
        let mut varmap = varmap_with(0.0);
        assert!(matches!(
            load_checkpoint(dir.path(), Some(5), &mut varmap),
            Err(Error::Checkpoint(_))
        ));
    }

    #[test]
    fn malformed_pointer_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(POINTER_FILE), "garbage").unwrap();
        assert!(matches!(
            latest_checkpoint(dir.path()),
            Err(Error::Checkpoint(_))
        ));
    }

    #[test]
    fn saved_file_holds_named_tensors() {
        let dir = tempfile::tempdir().unwrap();
        let path = save_checkpoint(dir.path(), 3, &varmap_with(4.0)).unwrap();
        let tensors = candle_core::safetensors::load(&path, &Device::Cpu).unwrap();
        let bias: &Tensor = tensors.get("layer.bias").unwrap();
        assert_eq!(bias.to_vec1::<f32>().unwrap(), vec![4.0; 3]);
    }
}
