use std::collections::HashMap;

use chrono::{DateTime, Utc};

use super::models::{clean_name, FileItem, Folder};
use super::snapshot::Snapshot;
use crate::error::{EngineError, Result};

/// The in-memory registry of folders and their completed items.
///
/// Purely synchronous: the serializer task is the only caller, so no
/// locking happens here. In-flight uploads are tracked by the serializer,
/// not the registry, and never persist.
#[derive(Debug, Default)]
pub struct Registry {
    folders: Vec<Folder>,
    items: HashMap<String, Vec<FileItem>>,
}

impl Registry {
    pub fn from_snapshot(snapshot: Snapshot) -> Self {
        Self {
            folders: snapshot.folders,
            items: snapshot.items,
        }
    }

    pub fn to_snapshot(&self) -> Snapshot {
        Snapshot {
            folders: self.folders.clone(),
            items: self.items.clone(),
        }
    }

    /// Copies of the folders, optionally without the private ones.
    pub fn folders(&self, include_private: bool) -> Vec<Folder> {
        self.folders
            .iter()
            .filter(|f| include_private || !f.is_private)
            .cloned()
            .collect()
    }

    pub fn folder_names(&self) -> Vec<String> {
        self.folders.iter().map(|f| f.name.clone()).collect()
    }

    pub fn folder(&self, name: &str) -> Option<&Folder> {
        self.folders.iter().find(|f| f.name == name)
    }

    pub fn folder_mut(&mut self, name: &str) -> Option<&mut Folder> {
        self.folders.iter_mut().find(|f| f.name == name)
    }

    /// Register a new folder. The name is reduced to its first path segment
    /// before the uniqueness check; the cleaned name is returned.
    pub fn create_folder(&mut self, mut folder: Folder) -> Result<String> {
        folder.name = clean_name(&folder.name);
        if folder.name.is_empty() {
            return Err(EngineError::EmptyName);
        }
        if self.folder(&folder.name).is_some() {
            return Err(EngineError::Duplicate(folder.name));
        }
        let name = folder.name.clone();
        self.folders.push(folder);
        Ok(name)
    }

    /// Replace a folder's policy. `create_date` is never taken from the
    /// caller, and the users mapping is kept unless `replace_users` is set.
    pub fn update_folder(&mut self, mut folder: Folder, replace_users: bool) -> Result<()> {
        let existing = self
            .folder_mut(&folder.name)
            .ok_or_else(|| EngineError::NotFound(format!("folder {:?}", folder.name)))?;
        folder.create_date = existing.create_date;
        if !replace_users {
            folder.users = existing.users.clone();
        }
        *existing = folder;
        Ok(())
    }

    pub fn remove_folder(&mut self, name: &str) -> Result<()> {
        if self.folder(name).is_none() {
            return Err(EngineError::NotFound(format!("folder {name:?}")));
        }
        self.folders.retain(|f| f.name != name);
        self.items.remove(name);
        Ok(())
    }

    /// Completed items of a folder; empty when none were uploaded yet.
    pub fn items(&self, folder: &str) -> &[FileItem] {
        self.items.get(folder).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn item(&self, folder: &str, name: &str) -> Option<&FileItem> {
        self.items(folder).iter().find(|i| i.name == name)
    }

    pub fn has_item(&self, folder: &str, name: &str) -> bool {
        self.item(folder, name).is_some()
    }

    /// Sum of completed item sizes in a folder.
    pub fn total_size(&self, folder: &str) -> u64 {
        self.items(folder).iter().map(|i| i.size).sum()
    }

    pub fn add_item(&mut self, folder: &str, item: FileItem) -> Result<()> {
        if item.name.is_empty() {
            return Err(EngineError::EmptyName);
        }
        if self.folder(folder).is_none() {
            return Err(EngineError::NotFound(format!("folder {folder:?}")));
        }
        self.items.entry(folder.to_string()).or_default().push(item);
        Ok(())
    }

    pub fn remove_item(&mut self, folder: &str, name: &str) -> Result<FileItem> {
        let items = self
            .items
            .get_mut(folder)
            .ok_or_else(|| EngineError::NotFound(format!("folder {folder:?}")))?;
        let pos = items.iter().position(|i| i.name == name).ok_or_else(|| {
            EngineError::NotFound(format!("file {name:?} in folder {folder:?}"))
        })?;
        Ok(items.remove(pos))
    }

    /// Drop and return every item whose folder lifetime has elapsed.
    pub fn drain_expired(&mut self, now: DateTime<Utc>) -> Vec<(String, FileItem)> {
        let mut expired = Vec::new();
        for folder in &self.folders {
            let Some(life) = folder.max_life_time else {
                continue;
            };
            let Some(items) = self.items.get_mut(&folder.name) else {
                continue;
            };
            let mut kept = Vec::with_capacity(items.len());
            for item in items.drain(..) {
                let age = now.signed_duration_since(item.create_date).to_std();
                if age.map(|a| a > life).unwrap_or(false) {
                    expired.push((folder.name.clone(), item));
                } else {
                    kept.push(item);
                }
            }
            *items = kept;
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use super::*;

    fn registry_with(name: &str) -> Registry {
        let mut registry = Registry::default();
        registry.create_folder(Folder::new(name)).unwrap();
        registry
    }

    #[test]
    fn test_create_folder_cleans_name() {
        let mut registry = Registry::default();
        let name = registry
            .create_folder(Folder::new("inbox/../../etc"))
            .unwrap();
        assert_eq!(name, "inbox");
        assert!(registry.folder("inbox").is_some());
    }

    #[test]
    fn test_create_folder_rejects_empty_and_duplicate() {
        let mut registry = Registry::default();
        assert_eq!(
            registry.create_folder(Folder::new("///")),
            Err(EngineError::EmptyName)
        );
        registry.create_folder(Folder::new("inbox")).unwrap();
        assert!(matches!(
            registry.create_folder(Folder::new("inbox")),
            Err(EngineError::Duplicate(_))
        ));
    }

    #[test]
    fn test_update_preserves_create_date_and_users() {
        let mut registry = registry_with("inbox");
        let created = registry.folder("inbox").unwrap().create_date;
        registry.folder_mut("inbox").unwrap().users = Some(HashMap::from([(
            "alice".to_string(),
            vec!["hash".to_string()],
        )]));

        let mut update = Folder::new("inbox");
        update.max_file_size = Some(100);
        registry.update_folder(update, false).unwrap();

        let folder = registry.folder("inbox").unwrap();
        assert_eq!(folder.create_date, created);
        assert_eq!(folder.max_file_size, Some(100));
        assert!(folder.users.as_ref().unwrap().contains_key("alice"));
    }

    #[test]
    fn test_update_can_replace_users() {
        let mut registry = registry_with("inbox");
        registry.folder_mut("inbox").unwrap().users = Some(HashMap::from([(
            "alice".to_string(),
            vec!["hash".to_string()],
        )]));

        registry.update_folder(Folder::new("inbox"), true).unwrap();
        assert!(registry.folder("inbox").unwrap().users.is_none());
    }

    #[test]
    fn test_update_missing_folder() {
        let mut registry = Registry::default();
        assert!(matches!(
            registry.update_folder(Folder::new("ghost"), false),
            Err(EngineError::NotFound(_))
        ));
    }

    #[test]
    fn test_remove_folder_drops_items() {
        let mut registry = registry_with("inbox");
        registry
            .add_item("inbox", FileItem::new("a.txt", 1))
            .unwrap();
        registry.remove_folder("inbox").unwrap();
        assert!(registry.folder("inbox").is_none());
        assert!(registry.items("inbox").is_empty());
    }

    #[test]
    fn test_items_and_total_size() {
        let mut registry = registry_with("inbox");
        registry
            .add_item("inbox", FileItem::new("a.txt", 10))
            .unwrap();
        registry
            .add_item("inbox", FileItem::new("b.txt", 5))
            .unwrap();
        assert_eq!(registry.items("inbox").len(), 2);
        assert_eq!(registry.total_size("inbox"), 15);
        assert!(registry.has_item("inbox", "a.txt"));
        assert!(!registry.has_item("inbox", "c.txt"));
    }

    #[test]
    fn test_add_item_requires_folder() {
        let mut registry = Registry::default();
        assert!(matches!(
            registry.add_item("ghost", FileItem::new("a.txt", 1)),
            Err(EngineError::NotFound(_))
        ));
    }

    #[test]
    fn test_remove_item() {
        let mut registry = registry_with("inbox");
        registry
            .add_item("inbox", FileItem::new("a.txt", 1))
            .unwrap();
        let removed = registry.remove_item("inbox", "a.txt").unwrap();
        assert_eq!(removed.name, "a.txt");
        assert!(matches!(
            registry.remove_item("inbox", "a.txt"),
            Err(EngineError::NotFound(_))
        ));
    }

    #[test]
    fn test_drain_expired_honors_lifetime() {
        let mut registry = registry_with("inbox");
        registry.folder_mut("inbox").unwrap().max_life_time = Some(Duration::from_secs(60));

        let now = Utc::now();
        let mut old = FileItem::new("old.txt", 1);
        old.create_date = now - chrono::Duration::seconds(120);
        let mut fresh = FileItem::new("fresh.txt", 1);
        fresh.create_date = now;
        registry.add_item("inbox", old).unwrap();
        registry.add_item("inbox", fresh).unwrap();

        let expired = registry.drain_expired(now);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].1.name, "old.txt");
        assert_eq!(registry.items("inbox").len(), 1);
        assert_eq!(registry.items("inbox")[0].name, "fresh.txt");
    }

    #[test]
    fn test_drain_expired_skips_unlimited_folders() {
        let mut registry = registry_with("inbox");
        let mut old = FileItem::new("old.txt", 1);
        old.create_date = Utc::now() - chrono::Duration::days(365);
        registry.add_item("inbox", old).unwrap();
        assert!(registry.drain_expired(Utc::now()).is_empty());
        assert_eq!(registry.items("inbox").len(), 1);
    }
}
