use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("path {0} resolves outside the public asset root")]
    OutsideAssetRoot(PathBuf),
    #[error("invalid file name: {0}")]
    InvalidFileName(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Local file storage rooted at the public asset directory.
///
/// Every artifact the pipeline produces is referenced by a path relative to
/// this root so downstream consumers never deal in absolute filesystem
/// paths. A write whose resolved location falls outside the root is rejected
/// instead of producing a broken reference.
#[derive(Clone)]
pub struct AssetService {
    asset_root: PathBuf,
}

impl AssetService {
    pub fn new(asset_root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = asset_root.into();
        fs::create_dir_all(&root)?;
        Ok(Self {
            asset_root: root.canonicalize()?,
        })
    }

    pub fn asset_root(&self) -> &Path {
        &self.asset_root
    }

    /// Directory holding one delivery's photos and derived artifacts.
    pub fn delivery_dir(&self, delivery_code: &str) -> PathBuf {
        self.asset_root.join("uploads").join(delivery_code)
    }

    pub fn ensure_delivery_dir(&self, delivery_code: &str) -> Result<PathBuf, StorageError> {
        let dir = self.delivery_dir(delivery_code);
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Canonical location of the delivery's consolidated JSON artifact.
    pub fn json_artifact_path(&self, delivery_code: &str) -> PathBuf {
        self.delivery_dir(delivery_code)
            .join(format!("classification_{delivery_code}.json"))
    }

    /// Forward-slash path relative to the asset root, or `None` when the
    /// file lives outside it (no public URL can be built).
    pub fn relative_to_root(&self, path: &Path) -> Option<String> {
        let canonical = path.canonicalize().ok()?;
        let relative = canonical.strip_prefix(&self.asset_root).ok()?;
        Some(relative.to_string_lossy().replace('\\', "/"))
    }

    /// Resolves a stored relative path back to an absolute one.
    pub fn resolve_relative(&self, relative: &str) -> PathBuf {
        self.asset_root.join(relative)
    }

    /// Writes `bytes` as `filename` inside `dir` and returns the public
    /// relative path of the new file.
    pub fn write_asset(
        &self,
        dir: &Path,
        filename: &str,
        bytes: &[u8],
    ) -> Result<String, StorageError> {
        if filename.contains('/') || filename.contains('\\') || filename.contains("..") {
            return Err(StorageError::InvalidFileName(filename.to_string()));
        }
        let dir = dir.canonicalize()?;
        if !dir.starts_with(&self.asset_root) {
            return Err(StorageError::OutsideAssetRoot(dir));
        }
        let target = dir.join(filename);
        fs::write(&target, bytes)?;
        self.relative_to_root(&target)
            .ok_or(StorageError::OutsideAssetRoot(target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn writes_inside_root_and_returns_relative_path() {
        let root = tempdir().unwrap();
        let service = AssetService::new(root.path().join("static")).unwrap();

        let dir = service.ensure_delivery_dir("GUIDE_1").unwrap();
        let rel = service.write_asset(&dir, "foto_1.jpg", b"jpeg-bytes").unwrap();

        assert_eq!(rel, "uploads/GUIDE_1/foto_1.jpg");
        assert!(service.resolve_relative(&rel).exists());
    }

    #[test]
    fn rejects_writes_outside_the_asset_root() {
        let root = tempdir().unwrap();
        let service = AssetService::new(root.path().join("static")).unwrap();
        let elsewhere = root.path().join("elsewhere");
        fs::create_dir_all(&elsewhere).unwrap();

        let err = service.write_asset(&elsewhere, "foto.jpg", b"x").unwrap_err();
        assert!(matches!(err, StorageError::OutsideAssetRoot(_)));
    }

    #[test]
    fn rejects_traversal_in_file_names() {
        let root = tempdir().unwrap();
        let service = AssetService::new(root.path().join("static")).unwrap();
        let dir = service.ensure_delivery_dir("GUIDE_1").unwrap();

        let err = service.write_asset(&dir, "../escape.jpg", b"x").unwrap_err();
        assert!(matches!(err, StorageError::InvalidFileName(_)));
    }

    #[test]
    fn paths_outside_root_have_no_public_relative_path() {
        let root = tempdir().unwrap();
        let service = AssetService::new(root.path().join("static")).unwrap();
        let outside = root.path().join("outside.jpg");
        fs::write(&outside, b"x").unwrap();

        assert_eq!(service.relative_to_root(&outside), None);
    }
}
