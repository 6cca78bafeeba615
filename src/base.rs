// Copyright (c) 2024-present, microforest-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use std::path::PathBuf;

const BASE_DATA_EXIST: u16 = 1 << 0;
const BASE_DATA_IS_CSV: u16 = 1 << 1;
const QTZ_FILE_EXIST: u16 = 1 << 2;
const DP_FILE_EXIST: u16 = 1 << 3;
const CONFIG_FILE_EXIST: u16 = 1 << 4;
const UNIFIED_FOREST_EXIST: u16 = 1 << 5;
const NODE_PRED_FILE_EXIST: u16 = 1 << 6;
const ABLE_TO_INFERENCE: u16 = 1 << 7;
const ABLE_TO_TRAINING: u16 = 1 << 8;
const SCANNED: u16 = 1 << 9;

/// Owns the model name and synthesizes every file path of a model.
///
/// All model files live under `<root>/<model>/` and are named
/// `<model><suffix>`. On construction the directory is scanned so callers
/// can ask what the model is currently capable of.
#[derive(Clone, Debug)]
pub struct Base {
    root: PathBuf,
    model_name: String,
    flags: u16,
}

impl Base {
    /// Creates the model directory if needed and scans its resources.
    pub fn new(root: impl Into<PathBuf>, model_name: &str) -> crate::Result<Self> {
        if model_name.is_empty() {
            return Err(crate::Error::Incompatible("model name is empty"));
        }

        let mut base = Self {
            root: root.into(),
            model_name: model_name.to_owned(),
            flags: 0,
        };
        std::fs::create_dir_all(base.model_dir())?;
        base.scan_resources();
        Ok(base)
    }

    #[must_use]
    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    #[must_use]
    pub fn model_dir(&self) -> PathBuf {
        self.root.join(&self.model_name)
    }

    fn file_path(&self, suffix: &str) -> PathBuf {
        self.model_dir().join(format!("{}{suffix}", self.model_name))
    }

    /// Binary base dataset
    #[must_use]
    pub fn base_data_path(&self) -> PathBuf {
        self.file_path("_nml.bin")
    }

    /// CSV base dataset awaiting one-shot conversion
    #[must_use]
    pub fn base_csv_path(&self) -> PathBuf {
        self.file_path("_nml.csv")
    }

    /// Quantizer (`QTZ4`)
    #[must_use]
    pub fn quantizer_path(&self) -> PathBuf {
        self.file_path("_qtz.bin")
    }

    /// Dataset-parameters CSV
    #[must_use]
    pub fn dp_path(&self) -> PathBuf {
        self.file_path("_dp.csv")
    }

    /// Model configuration JSON
    #[must_use]
    pub fn config_path(&self) -> PathBuf {
        self.file_path("_config.json")
    }

    /// Unified forest (`FRC3`)
    #[must_use]
    pub fn forest_path(&self) -> PathBuf {
        self.file_path("_forest.bin")
    }

    /// Node predictor coefficients
    #[must_use]
    pub fn node_predictor_path(&self) -> PathBuf {
        self.file_path("_npd.bin")
    }

    /// Node predictor observation log CSV
    #[must_use]
    pub fn node_log_path(&self) -> PathBuf {
        self.file_path("_nlg.csv")
    }

    /// Event/time log CSV
    #[must_use]
    pub fn time_log_path(&self) -> PathBuf {
        self.file_path("_tlog.csv")
    }

    /// Memory log CSV
    #[must_use]
    pub fn memory_log_path(&self) -> PathBuf {
        self.file_path("_mlog.csv")
    }

    /// Per-tree file (`TRC3`): `<root>/<model>/tree_<index>.bin`
    #[must_use]
    pub fn tree_path(&self, tree_index: u8) -> PathBuf {
        self.model_dir().join(format!("tree_{tree_index}.bin"))
    }

    fn scan_resources(&mut self) {
        self.flags = 0;

        if self.base_data_path().exists() {
            log::debug!("found base data file: {:?}", self.base_data_path());
            self.flags |= BASE_DATA_EXIST;
        } else if self.base_csv_path().exists() {
            log::debug!("found csv dataset, needs conversion before use");
            self.flags |= BASE_DATA_IS_CSV;
        } else {
            log::debug!("no base data file found: {:?}", self.base_data_path());
        }

        if self.quantizer_path().exists() {
            self.flags |= QTZ_FILE_EXIST;
        }
        if self.dp_path().exists() {
            self.flags |= DP_FILE_EXIST;
        } else {
            log::debug!("no data_params file found; dataset will be scanned");
        }
        if self.config_path().exists() {
            self.flags |= CONFIG_FILE_EXIST;
        } else {
            log::debug!("no config file found; switching to auto configuration");
        }
        if self.forest_path().exists() {
            self.flags |= UNIFIED_FOREST_EXIST;
        }
        if self.node_predictor_path().exists() {
            self.flags |= NODE_PRED_FILE_EXIST;
        }

        if self.flags & UNIFIED_FOREST_EXIST != 0 && self.flags & QTZ_FILE_EXIST != 0 {
            self.flags |= ABLE_TO_INFERENCE;
        }
        if self.flags & BASE_DATA_EXIST != 0 && self.flags & QTZ_FILE_EXIST != 0 {
            self.flags |= ABLE_TO_TRAINING;
        }

        self.flags |= SCANNED;
    }

    /// Rescans the model directory after files were added or removed.
    pub fn update_status(&mut self) {
        self.scan_resources();
    }

    #[must_use]
    pub fn ready_to_use(&self) -> bool {
        self.flags & SCANNED != 0
    }

    #[must_use]
    pub fn base_data_is_csv(&self) -> bool {
        self.flags & BASE_DATA_IS_CSV != 0
    }

    #[must_use]
    pub fn dp_file_exists(&self) -> bool {
        self.flags & DP_FILE_EXIST != 0
    }

    #[must_use]
    pub fn config_file_exists(&self) -> bool {
        self.flags & CONFIG_FILE_EXIST != 0
    }

    #[must_use]
    pub fn node_pred_file_exists(&self) -> bool {
        self.flags & NODE_PRED_FILE_EXIST != 0
    }

    #[must_use]
    pub fn forest_file_exists(&self) -> bool {
        self.flags & UNIFIED_FOREST_EXIST != 0
    }

    #[must_use]
    pub fn able_to_train(&self) -> bool {
        self.flags & ABLE_TO_TRAINING != 0
    }

    #[must_use]
    pub fn able_to_infer(&self) -> bool {
        self.flags & ABLE_TO_INFERENCE != 0
    }

    pub(crate) fn set_config_status(&mut self, exists: bool) {
        if exists {
            self.flags |= CONFIG_FILE_EXIST;
        } else {
            self.flags &= !CONFIG_FILE_EXIST;
        }
    }

    pub(crate) fn set_dp_status(&mut self, exists: bool) {
        if exists {
            self.flags |= DP_FILE_EXIST;
        } else {
            self.flags &= !DP_FILE_EXIST;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn base_path_layout() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let base = Base::new(dir.path(), "gesture")?;

        let root = dir.path().join("gesture");
        assert_eq!(root.join("gesture_nml.bin"), base.base_data_path());
        assert_eq!(root.join("gesture_qtz.bin"), base.quantizer_path());
        assert_eq!(root.join("gesture_config.json"), base.config_path());
        assert_eq!(root.join("gesture_forest.bin"), base.forest_path());
        assert_eq!(root.join("tree_7.bin"), base.tree_path(7));

        Ok(())
    }

    #[test]
    fn base_scans_resources() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;

        {
            let base = Base::new(dir.path(), "m")?;
            assert!(base.ready_to_use());
            assert!(!base.able_to_train());
            assert!(!base.able_to_infer());
        }

        std::fs::write(dir.path().join("m").join("m_nml.bin"), b"x")?;
        std::fs::write(dir.path().join("m").join("m_qtz.bin"), b"x")?;

        let mut base = Base::new(dir.path(), "m")?;
        assert!(base.able_to_train());
        assert!(!base.able_to_infer());

        std::fs::write(dir.path().join("m").join("m_forest.bin"), b"x")?;
        base.update_status();
        assert!(base.able_to_infer());

        Ok(())
    }

    #[test]
    fn base_rejects_empty_name() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(Base::new(dir.path(), "").is_err());
    }
}
