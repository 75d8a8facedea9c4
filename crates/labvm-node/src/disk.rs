use std::path::Path;

use tracing::{info, warn};

/// Copy a template image to a VM's private disk path.
///
/// Uses `cp --reflink=auto` on Linux so CoW filesystems clone instantly and
/// everything else falls back to a full copy. Refuses to overwrite an
/// existing disk.
pub async fn clone_template(template_path: &str, dest: &str) -> Result<(), DiskError> {
    if !Path::new(template_path).exists() {
        return Err(DiskError::SourceNotFound(template_path.to_string()));
    }
    if Path::new(dest).exists() {
        return Err(DiskError::AlreadyExists(dest.to_string()));
    }

    if let Some(parent) = Path::new(dest).parent() {
        tokio::fs::create_dir_all(parent).await.map_err(|e| {
            DiskError::Io(format!("failed to create {}: {}", parent.display(), e))
        })?;
    }

    info!(src = %template_path, dest = %dest, "copying template disk");

    let mut cmd = tokio::process::Command::new("cp");
    if cfg!(target_os = "linux") {
        cmd.arg("--reflink=auto");
    }
    let output = cmd
        .arg(template_path)
        .arg(dest)
        .output()
        .await
        .map_err(|e| DiskError::Io(format!("failed to run cp: {}", e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        // cp may leave a partial file behind
        let _ = tokio::fs::remove_file(dest).await;
        return Err(DiskError::Io(format!("cp failed: {}", stderr.trim())));
    }

    info!(dest = %dest, "template disk copied");
    Ok(())
}

/// Remove a VM disk. A disk that is already gone counts as removed.
pub async fn remove_disk(path: &str) -> Result<(), DiskError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            info!(path = %path, "disk removed");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(path = %path, "disk already absent");
            Ok(())
        }
        Err(e) => Err(DiskError::Io(format!("failed to remove {}: {}", path, e))),
    }
}

#[derive(Debug)]
pub enum DiskError {
    SourceNotFound(String),
    AlreadyExists(String),
    Io(String),
}

impl std::fmt::Display for DiskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DiskError::SourceNotFound(path) => write!(f, "template image not found: {}", path),
            DiskError::AlreadyExists(path) => write!(f, "disk already exists: {}", path),
            DiskError::Io(msg) => write!(f, "disk I/O error: {}", msg),
        }
    }
}

impl std::error::Error for DiskError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn clone_fails_for_missing_template() {
        let tmp = tempfile::tempdir().unwrap();
        let dest = tmp.path().join("vm.qcow2");
        let err = clone_template("/nonexistent/base.qcow2", dest.to_str().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, DiskError::SourceNotFound(_)));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn clone_creates_parent_and_copies() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("base.qcow2");
        std::fs::write(&src, b"fake-qcow2-data").unwrap();
        let dest = tmp.path().join("images").join("lab01.qcow2");

        clone_template(src.to_str().unwrap(), dest.to_str().unwrap())
            .await
            .unwrap();

        assert_eq!(std::fs::read(&dest).unwrap(), b"fake-qcow2-data");
        assert!(src.exists());
    }

    #[tokio::test]
    async fn clone_refuses_to_overwrite() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("base.qcow2");
        let dest = tmp.path().join("lab01.qcow2");
        std::fs::write(&src, b"new").unwrap();
        std::fs::write(&dest, b"existing").unwrap();

        let err = clone_template(src.to_str().unwrap(), dest.to_str().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, DiskError::AlreadyExists(_)));
        assert_eq!(std::fs::read(&dest).unwrap(), b"existing");
    }

    #[tokio::test]
    async fn remove_disk_deletes_file() {
        let tmp = tempfile::tempdir().unwrap();
        let disk = tmp.path().join("lab01.qcow2");
        std::fs::write(&disk, b"data").unwrap();

        remove_disk(disk.to_str().unwrap()).await.unwrap();
        assert!(!disk.exists());
    }

    #[tokio::test]
    async fn remove_disk_is_idempotent() {
        let result = remove_disk("/tmp/labvm-no-such-disk.qcow2").await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn remove_disk_reports_other_errors() {
        let tmp = tempfile::tempdir().unwrap();
        // removing a directory with remove_file fails with something other than NotFound
        let err = remove_disk(tmp.path().to_str().unwrap()).await.unwrap_err();
        assert!(matches!(err, DiskError::Io(_)));
    }

    #[test]
    fn disk_error_display() {
        assert_eq!(
            DiskError::SourceNotFound("/t/base.qcow2".to_string()).to_string(),
            "template image not found: /t/base.qcow2"
        );
        assert_eq!(
            DiskError::Io("permission denied".to_string()).to_string(),
            "disk I/O error: permission denied"
        );
    }
}
