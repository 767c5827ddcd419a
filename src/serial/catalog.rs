//! The wake-word model catalog the bridge exposes to its host.
//!
//! Populated from a directory scan at startup; the host flips entries on and
//! off and tunes thresholds over the wire. The enable mask is a 16-bit
//! bitmap, bit `i` set when entry `i` is enabled.

use std::path::{Path, PathBuf};

use crate::error::{Result, VozError};

use super::event::{WwConfPayload, WwStatusPayload};

pub const MAX_ENTRIES: usize = 16;
pub const MAX_NAME: usize = 32;

const DEFAULT_THRESHOLD: f32 = 0.5;
const DEFAULT_PATIENCE: u8 = 1;

#[derive(Debug, Clone)]
pub struct CatalogEntry {
    pub path: PathBuf,
    pub name: String,
    pub index: u8,
    pub enabled: bool,
    pub threshold: f32,
    pub patience: u8,
}

pub struct Catalog {
    entries: Vec<CatalogEntry>,
}

impl Catalog {
    /// Scan `dir` for `*.tflite` models, in name order, keeping the first
    /// sixteen. Entry 0 starts enabled so a freshly flashed device detects
    /// something out of the box.
    pub fn scan(dir: &Path) -> Result<Self> {
        let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
            .map_err(|e| VozError::Config(format!("{}: {}", dir.display(), e)))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                p.extension()
                    .map(|ext| ext.eq_ignore_ascii_case("tflite"))
                    .unwrap_or(false)
            })
            .collect();
        paths.sort();
        if paths.len() > MAX_ENTRIES {
            log::warn!(
                "{}: {} models found, keeping the first {}",
                dir.display(),
                paths.len(),
                MAX_ENTRIES
            );
            paths.truncate(MAX_ENTRIES);
        }

        let entries = paths
            .into_iter()
            .enumerate()
            .map(|(i, path)| {
                let name = display_name(&path);
                CatalogEntry {
                    path,
                    name,
                    index: i as u8,
                    enabled: i == 0,
                    threshold: DEFAULT_THRESHOLD,
                    patience: DEFAULT_PATIENCE,
                }
            })
            .collect();
        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[CatalogEntry] {
        &self.entries
    }

    pub fn mask(&self) -> u16 {
        self.entries
            .iter()
            .filter(|e| e.enabled)
            .fold(0u16, |mask, e| mask | (1 << e.index))
    }

    pub fn clear_enabled(&mut self) {
        for e in &mut self.entries {
            e.enabled = false;
        }
    }

    /// Apply a host configuration update to the referenced entry.
    pub fn apply_conf(&mut self, conf: &WwConfPayload) -> Result<()> {
        let entry = self
            .entries
            .get_mut(conf.index as usize)
            .ok_or_else(|| VozError::Config(format!("no catalog entry {}", conf.index)))?;
        if !(0.0..=1.0).contains(&conf.threshold) {
            return Err(VozError::Config(format!(
                "threshold {} out of range",
                conf.threshold
            )));
        }
        if conf.patience == 0 {
            return Err(VozError::Config("patience must be >= 1".into()));
        }
        entry.enabled = conf.enabled != 0;
        entry.threshold = conf.threshold;
        entry.patience = conf.patience;
        Ok(())
    }

    pub fn status_payload(&self, index: usize) -> Option<WwStatusPayload> {
        self.entries.get(index).map(|e| {
            WwStatusPayload::with_name(
                &e.name,
                WwConfPayload {
                    index: e.index,
                    enabled: e.enabled as u8,
                    threshold: e.threshold,
                    patience: e.patience,
                },
            )
        })
    }

    /// Detector model arguments for the enabled entries, configuration order.
    /// The entry index doubles as the child-side model name so match lines
    /// map straight back to catalog entries.
    pub fn model_args(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|e| e.enabled)
            .map(|e| {
                format!(
                    "{}:{}:{}:{}",
                    e.path.display(),
                    e.index,
                    e.threshold,
                    e.patience
                )
            })
            .collect()
    }

    /// Map a child-reported model name back to a catalog index.
    pub fn index_for_name(&self, name: &str) -> Option<u8> {
        if let Ok(index) = name.parse::<u8>() {
            if (index as usize) < self.entries.len() {
                return Some(index);
            }
        }
        self.entries
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.index)
    }
}

fn display_name(path: &Path) -> String {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    // keep at most 32 bytes without splitting a utf-8 sequence
    let mut end = stem.len().min(MAX_NAME);
    while end > 0 && !stem.is_char_boundary(end) {
        end -= 1;
    }
    stem[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;

    fn model_dir(names: &[&str]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for name in names {
            File::create(dir.path().join(name)).unwrap();
        }
        dir
    }

    #[test]
    fn scans_sorted_tflite_files() {
        let dir = model_dir(&["b.tflite", "a.tflite", "notes.txt", "c.onnx"]);
        let cat = Catalog::scan(dir.path()).unwrap();
        assert_eq!(cat.len(), 2);
        assert_eq!(cat.entries()[0].name, "a");
        assert_eq!(cat.entries()[1].name, "b");
        assert!(cat.entries()[0].enabled);
        assert!(!cat.entries()[1].enabled);
        assert_eq!(cat.mask(), 0b01);
    }

    #[test]
    fn keeps_at_most_sixteen_entries() {
        let names: Vec<String> = (0..20).map(|i| format!("m{:02}.tflite", i)).collect();
        let refs: Vec<&str> = names.iter().map(|s| s.as_str()).collect();
        let dir = model_dir(&refs);
        let cat = Catalog::scan(dir.path()).unwrap();
        assert_eq!(cat.len(), MAX_ENTRIES);
    }

    #[test]
    fn conf_update_recomputes_mask() {
        let dir = model_dir(&["a.tflite", "b.tflite"]);
        let mut cat = Catalog::scan(dir.path()).unwrap();
        cat.apply_conf(&WwConfPayload {
            index: 1,
            enabled: 1,
            threshold: 0.6,
            patience: 2,
        })
        .unwrap();
        assert_eq!(cat.mask(), 0b11);
        let status = cat.status_payload(1).unwrap();
        assert_eq!(status.conf.enabled, 1);
        assert_eq!(status.conf.threshold, 0.6);
        assert_eq!(status.conf.patience, 2);

        cat.apply_conf(&WwConfPayload {
            index: 0,
            enabled: 0,
            threshold: 0.5,
            patience: 1,
        })
        .unwrap();
        assert_eq!(cat.mask(), 0b10);
    }

    #[test]
    fn conf_update_validates() {
        let dir = model_dir(&["a.tflite"]);
        let mut cat = Catalog::scan(dir.path()).unwrap();
        assert!(cat
            .apply_conf(&WwConfPayload {
                index: 5,
                enabled: 1,
                threshold: 0.5,
                patience: 1
            })
            .is_err());
        assert!(cat
            .apply_conf(&WwConfPayload {
                index: 0,
                enabled: 1,
                threshold: 1.5,
                patience: 1
            })
            .is_err());
        assert!(cat
            .apply_conf(&WwConfPayload {
                index: 0,
                enabled: 1,
                threshold: 0.5,
                patience: 0
            })
            .is_err());
    }

    #[test]
    fn clear_enabled_zeroes_the_mask() {
        let dir = model_dir(&["a.tflite", "b.tflite"]);
        let mut cat = Catalog::scan(dir.path()).unwrap();
        cat.clear_enabled();
        assert_eq!(cat.mask(), 0);
    }

    #[test]
    fn model_args_cover_enabled_entries_in_order() {
        let dir = model_dir(&["a.tflite", "b.tflite", "c.tflite"]);
        let mut cat = Catalog::scan(dir.path()).unwrap();
        cat.apply_conf(&WwConfPayload {
            index: 2,
            enabled: 1,
            threshold: 0.7,
            patience: 3,
        })
        .unwrap();
        let args = cat.model_args();
        assert_eq!(args.len(), 2);
        assert!(args[0].ends_with("a.tflite:0:0.5:1"));
        assert!(args[1].ends_with("c.tflite:2:0.7:3"));
    }

    #[test]
    fn child_names_map_back_to_indices() {
        let dir = model_dir(&["a.tflite", "b.tflite"]);
        let cat = Catalog::scan(dir.path()).unwrap();
        assert_eq!(cat.index_for_name("1"), Some(1));
        assert_eq!(cat.index_for_name("a"), Some(0));
        assert_eq!(cat.index_for_name("9"), None);
        assert_eq!(cat.index_for_name("zzz"), None);
    }

    #[test]
    fn long_names_truncate() {
        let long = format!("{}.tflite", "n".repeat(60));
        let dir = model_dir(&[long.as_str()]);
        let cat = Catalog::scan(dir.path()).unwrap();
        assert_eq!(cat.entries()[0].name.len(), MAX_NAME);
    }
}
