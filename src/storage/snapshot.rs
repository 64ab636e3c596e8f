use std::collections::HashMap;
use std::io;
use std::path::Path;

use serde::{Deserialize, Deserializer, Serialize};

use super::models::{FileItem, Folder};

/// The durable image of the registry: the folder sequence plus the mapping
/// from folder name to its items.
///
/// In-flight uploads are deliberately absent; a legacy `Uploads` key in an
/// existing file is ignored on load. Earlier releases wrote `null` for
/// empty collections, so both fields tolerate it.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(rename = "Folders", default, deserialize_with = "null_as_default")]
    pub folders: Vec<Folder>,
    #[serde(rename = "Items", default, deserialize_with = "null_as_default")]
    pub items: HashMap<String, Vec<FileItem>>,
}

impl Snapshot {
    /// Read and decode the snapshot file.
    pub async fn load(path: &Path) -> io::Result<Snapshot> {
        let data = tokio::fs::read(path).await?;
        serde_json::from_slice(&data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    /// Persist the snapshot as indented JSON. The bytes land in a sibling
    /// temp file first and replace the target with a rename, so readers
    /// never observe a torn snapshot.
    pub async fn save(&self, path: &Path) -> io::Result<()> {
        let data = serde_json::to_vec_pretty(self)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let file_name = path
            .file_name()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "snapshot path has no file name"))?;
        let tmp = path.with_file_name(format!("{}.tmp", file_name.to_string_lossy()));
        tokio::fs::write(&tmp, &data).await?;
        tokio::fs::rename(&tmp, path).await
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.json");

        let snapshot = Snapshot {
            folders: vec![Folder::new("inbox")],
            items: HashMap::from([(
                "inbox".to_string(),
                vec![FileItem::new("a.txt", 12)],
            )]),
        };
        snapshot.save(&path).await.unwrap();

        let loaded = Snapshot::load(&path).await.unwrap();
        assert_eq!(loaded, snapshot);
        // The temp sibling never survives a successful save.
        assert!(!path.with_file_name("db.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = Snapshot::load(&dir.path().join("absent.json"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_load_ignores_uploads_key_and_nulls() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.json");
        tokio::fs::write(
            &path,
            r#"{"Uploads": [{"TmpFile": "x"}], "Folders": null, "Items": null}"#,
        )
        .await
        .unwrap();

        let loaded = Snapshot::load(&path).await.unwrap();
        assert!(loaded.folders.is_empty());
        assert!(loaded.items.is_empty());
    }

    #[tokio::test]
    async fn test_save_overwrites_previous_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.json");

        let mut snapshot = Snapshot {
            folders: vec![Folder::new("inbox")],
            items: HashMap::new(),
        };
        snapshot.save(&path).await.unwrap();

        snapshot.folders.push(Folder::new("outbox"));
        snapshot.save(&path).await.unwrap();

        let loaded = Snapshot::load(&path).await.unwrap();
        assert_eq!(loaded.folders.len(), 2);
    }
}
