//! Local, versioned model assets with SHA-256 integrity verification.
//!
//! Models are never fetched at runtime. The model directory carries a
//! `manifest.toml` naming the detector and extractor files:
//!
//! ```toml
//! [detector]
//! file = "det_10g.onnx"
//! version = "scrfd_10g"
//! sha256 = "5838f7fe05..."
//!
//! [extractor]
//! file = "w600k_r50.onnx"
//! version = "w600k_r50"
//! sha256 = "4c06341c33..."
//! ```
//!
//! Both digests are mandatory. [`ModelManifest::load_unverified`] is the
//! explicit opt-out for development setups without a manifest.
//!
//! Assets are verified once at startup, before any session is built.

use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const MANIFEST_FILE: &str = "manifest.toml";

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("model file not found: {0}; place the ONNX model in the model directory")]
    NotFound(PathBuf),
    #[error("checksum mismatch for {path}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },
    #[error("model manifest not found: {0}")]
    ManifestMissing(PathBuf),
    #[error("no sha256 for {0} in the model manifest")]
    MissingChecksum(String),
    #[error("invalid manifest {path}: {source}")]
    Manifest {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("io error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Deserialize)]
struct AssetEntry {
    file: String,
    version: String,
    sha256: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ManifestFile {
    detector: AssetEntry,
    extractor: AssetEntry,
}

/// A single model file with its expected version and digest.
#[derive(Debug, Clone)]
pub struct ModelAsset {
    pub path: PathBuf,
    pub version: String,
    /// Lowercase hex SHA-256. `None` only comes from
    /// [`ModelManifest::load_unverified`] and skips the integrity check.
    pub sha256: Option<String>,
}

impl ModelAsset {
    /// Check the file exists and matches its digest.
    pub fn verify(&self) -> Result<(), ModelError> {
        if !self.path.exists() {
            return Err(ModelError::NotFound(self.path.clone()));
        }

        let Some(expected) = &self.sha256 else {
            tracing::warn!(
                path = %self.path.display(),
                version = %self.version,
                "no checksum configured for model asset; skipping integrity check"
            );
            return Ok(());
        };

        let actual = sha256_file(&self.path)?;
        if !actual.eq_ignore_ascii_case(expected.trim()) {
            return Err(ModelError::ChecksumMismatch {
                path: self.path.clone(),
                expected: expected.clone(),
                actual,
            });
        }

        tracing::info!(path = %self.path.display(), version = %self.version, "model asset verified");
        Ok(())
    }
}

/// Detector and extractor assets for one deployment.
#[derive(Debug, Clone)]
pub struct ModelManifest {
    pub detector: ModelAsset,
    pub extractor: ModelAsset,
}

impl ModelManifest {
    /// Read `manifest.toml` from `model_dir`. The manifest and a sha256 for
    /// both assets are required.
    pub fn load(model_dir: &Path) -> Result<Self, ModelError> {
        let path = model_dir.join(MANIFEST_FILE);
        if !path.exists() {
            return Err(ModelError::ManifestMissing(path));
        }
        let manifest = Self::parse(model_dir, &path)?;
        for (role, asset) in [("detector", &manifest.detector), ("extractor", &manifest.extractor)] {
            if asset.sha256.is_none() {
                return Err(ModelError::MissingChecksum(role.into()));
            }
        }
        Ok(manifest)
    }

    /// Like [`load`](Self::load) but tolerates missing digests, and without a
    /// manifest falls back to the stock InsightFace file names.
    pub fn load_unverified(model_dir: &Path) -> Result<Self, ModelError> {
        tracing::warn!(dir = %model_dir.display(), "model checksum enforcement disabled");
        let path = model_dir.join(MANIFEST_FILE);
        if !path.exists() {
            tracing::warn!(dir = %model_dir.display(), "no model manifest found; using default file names");
            return Ok(Self::unverified(model_dir));
        }
        Self::parse(model_dir, &path)
    }

    fn parse(model_dir: &Path, path: &Path) -> Result<Self, ModelError> {
        let text = std::fs::read_to_string(path).map_err(|source| ModelError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let parsed: ManifestFile = toml::from_str(&text).map_err(|source| ModelError::Manifest {
            path: path.to_path_buf(),
            source,
        })?;

        let asset = |entry: AssetEntry| ModelAsset {
            path: model_dir.join(entry.file),
            version: entry.version,
            sha256: entry.sha256,
        };

        Ok(Self {
            detector: asset(parsed.detector),
            extractor: asset(parsed.extractor),
        })
    }

    fn unverified(model_dir: &Path) -> Self {
        Self {
            detector: ModelAsset {
                path: model_dir.join("det_10g.onnx"),
                version: "scrfd_10g".into(),
                sha256: None,
            },
            extractor: ModelAsset {
                path: model_dir.join("w600k_r50.onnx"),
                version: "w600k_r50".into(),
                sha256: None,
            },
        }
    }

    /// Verify both assets. Fails on the first problem.
    pub fn verify(&self) -> Result<(), ModelError> {
        self.detector.verify()?;
        self.extractor.verify()
    }
}

/// Default model directory: `$XDG_DATA_HOME/rollcall/models`.
pub fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall/models")
}

/// Lowercase hex SHA-256 of a file, streamed in 64 KiB chunks.
pub fn sha256_file(path: &Path) -> Result<String, ModelError> {
    let io_err = |source| ModelError::Io {
        path: path.to_path_buf(),
        source,
    };
    let mut file = File::open(path).map_err(io_err)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).map_err(io_err)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    // sha256("abc")
    const ABC_SHA256: &str = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";

    fn write_file(dir: &Path, name: &str, contents: &[u8]) -> PathBuf {
        let path = dir.join(name);
        let mut f = File::create(&path).unwrap();
        f.write_all(contents).unwrap();
        path
    }

    #[test]
    fn test_sha256_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "m.onnx", b"abc");
        assert_eq!(sha256_file(&path).unwrap(), ABC_SHA256);
    }

    #[test]
    fn test_verify_checksum_match_and_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "m.onnx", b"abc");

        let good = ModelAsset {
            path: path.clone(),
            version: "v1".into(),
            sha256: Some(ABC_SHA256.to_uppercase()),
        };
        assert!(good.verify().is_ok());

        let bad = ModelAsset {
            path,
            version: "v1".into(),
            sha256: Some("00".repeat(32)),
        };
        assert!(matches!(bad.verify(), Err(ModelError::ChecksumMismatch { .. })));
    }

    #[test]
    fn test_verify_missing_file() {
        let asset = ModelAsset {
            path: PathBuf::from("/nonexistent/model.onnx"),
            version: "v1".into(),
            sha256: None,
        };
        assert!(matches!(asset.verify(), Err(ModelError::NotFound(_))));
    }

    fn write_manifest(dir: &Path, extractor_sha256: Option<&str>) {
        let mut text = format!(
            "[detector]\nfile = \"det.onnx\"\nversion = \"scrfd\"\nsha256 = \"{ABC_SHA256}\"\n\n\
             [extractor]\nfile = \"rec.onnx\"\nversion = \"arc\"\n"
        );
        if let Some(digest) = extractor_sha256 {
            text.push_str(&format!("sha256 = \"{digest}\"\n"));
        }
        write_file(dir, MANIFEST_FILE, text.as_bytes());
        write_file(dir, "det.onnx", b"abc");
        write_file(dir, "rec.onnx", b"abc");
    }

    #[test]
    fn test_manifest_load() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(dir.path(), Some(ABC_SHA256));

        let manifest = ModelManifest::load(dir.path()).unwrap();
        assert_eq!(manifest.detector.path, dir.path().join("det.onnx"));
        assert_eq!(manifest.extractor.version, "arc");
        assert!(manifest.verify().is_ok());
    }

    #[test]
    fn test_manifest_requires_every_checksum() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(dir.path(), None);
        assert!(matches!(
            ModelManifest::load(dir.path()),
            Err(ModelError::MissingChecksum(role)) if role == "extractor"
        ));

        let relaxed = ModelManifest::load_unverified(dir.path()).unwrap();
        assert!(relaxed.extractor.sha256.is_none());
        assert!(relaxed.verify().is_ok());
    }

    #[test]
    fn test_manifest_missing_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            ModelManifest::load(dir.path()),
            Err(ModelError::ManifestMissing(_))
        ));
    }

    #[test]
    fn test_unverified_without_manifest_uses_default_names() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = ModelManifest::load_unverified(dir.path()).unwrap();
        assert_eq!(manifest.detector.path, dir.path().join("det_10g.onnx"));
        assert!(manifest.detector.sha256.is_none());
    }

    #[test]
    fn test_manifest_invalid() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), MANIFEST_FILE, b"[detector]\nfile = 3\n");
        assert!(matches!(
            ModelManifest::load(dir.path()),
            Err(ModelError::Manifest { .. })
        ));
    }
}
