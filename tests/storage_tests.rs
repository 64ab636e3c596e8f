//! Snapshot format stability: the on-disk JSON keeps its historical field
//! vocabulary so data files from earlier releases keep loading.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{TimeZone, Utc};

use filedrop::storage::{FileItem, Folder, Snapshot};

fn sample_folder() -> Folder {
    let mut folder = Folder::new("inbox");
    folder.create_date = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
    folder.max_file_size = Some(10 * 1024 * 1024);
    folder.max_file_count = Some(30);
    folder.max_total_size = Some(100 * 1024 * 1024);
    folder.max_life_time = Some(Duration::from_secs(7 * 24 * 3600));
    folder.read_rate = Some(100 * 1024);
    folder.write_rate = Some(200 * 1024);
    folder.max_active_reads = Some(5);
    folder.max_active_writes = Some(5);
    folder.captcha_for_anonymous = true;
    folder.is_private = true;
    folder.users = Some(HashMap::from([(
        "alice".to_string(),
        vec!["$argon2id$v=19$stub".to_string()],
    )]));
    folder
}

fn sample_item(name: &str, size: u64) -> FileItem {
    let mut item = FileItem::new(name, size);
    item.create_date = Utc.with_ymd_and_hms(2024, 3, 2, 8, 30, 0).unwrap();
    item.uploaded = size;
    item
}

#[test]
fn test_snapshot_top_level_shape() {
    let snapshot = Snapshot {
        folders: vec![sample_folder()],
        items: HashMap::from([("inbox".to_string(), vec![sample_item("a.txt", 12)])]),
    };

    let value = serde_json::to_value(&snapshot).unwrap();
    assert!(value.get("Folders").unwrap().is_array());
    assert!(value.get("Items").unwrap().is_object());
    assert_eq!(value["Items"]["inbox"][0]["Name"], "a.txt");
    assert_eq!(value["Items"]["inbox"][0]["Path"], "/");
    assert_eq!(value["Items"]["inbox"][0]["Size"], 12);
    assert_eq!(value["Items"]["inbox"][0]["Uploaded"], 12);
}

#[test]
fn test_folder_wire_vocabulary() {
    let value = serde_json::to_value(sample_folder()).unwrap();

    // Rate and concurrency caps keep the legacy inverted names.
    assert_eq!(value["MaxUpBytesPerSec"], 100 * 1024);
    assert_eq!(value["MaxDlBytesPerSec"], 200 * 1024);
    assert_eq!(value["MaxActiveUploads"], 5);
    assert_eq!(value["MaxActiveDownloads"], 5);

    // Durations are integer nanoseconds, dates RFC 3339.
    assert_eq!(value["MaxLifeTime"], 7 * 24 * 3600 * 1_000_000_000u64);
    assert!(value["CreateDate"].as_str().unwrap().starts_with("2024-03-01T12:00:00"));

    assert_eq!(value["CaptchaForAnonymous"], true);
    assert_eq!(value["IsPrivate"], true);
    assert_eq!(value["Users"]["alice"][0], "$argon2id$v=19$stub");
}

#[test]
fn test_snapshot_json_roundtrip() {
    let snapshot = Snapshot {
        folders: vec![sample_folder(), Folder::new("plain")],
        items: HashMap::from([(
            "inbox".to_string(),
            vec![sample_item("a.txt", 12), sample_item("b.bin", 4096)],
        )]),
    };

    let json = serde_json::to_string_pretty(&snapshot).unwrap();
    let back: Snapshot = serde_json::from_str(&json).unwrap();
    assert_eq!(back, snapshot);
}

#[test]
fn test_snapshot_loads_legacy_document() {
    // A document as earlier releases wrote it, including the in-flight
    // uploads they never meant to persist.
    let legacy = r#"{
        "Uploads": null,
        "Folders": [
            {
                "Name": "legacy",
                "CreateDate": "2021-06-01T10:00:00Z",
                "MaxFileSize": 1048576,
                "MaxFileCount": null,
                "MaxTotalSize": null,
                "MaxLifeTime": 604800000000000,
                "MaxUpBytesPerSec": null,
                "MaxDlBytesPerSec": null,
                "MaxActiveUploads": 5,
                "MaxActiveDownloads": null,
                "CaptchaForAnonymous": true,
                "CaptchaForLoggedUsers": false,
                "IsPrivate": false,
                "IsAdminOnlyReadable": false,
                "Password": null,
                "Users": null
            }
        ],
        "Items": {
            "legacy": [
                {
                    "Name": "old.pdf",
                    "Path": "/",
                    "CreateDate": "2021-06-02T09:00:00Z",
                    "Size": 2048,
                    "Uploaded": 2048
                }
            ]
        }
    }"#;

    let snapshot: Snapshot = serde_json::from_str(legacy).unwrap();
    assert_eq!(snapshot.folders.len(), 1);

    let folder = &snapshot.folders[0];
    assert_eq!(folder.name, "legacy");
    assert_eq!(folder.max_file_size, Some(1048576));
    assert_eq!(folder.max_life_time, Some(Duration::from_secs(604800)));
    assert_eq!(folder.max_active_reads, Some(5));
    assert!(folder.max_active_writes.is_none());
    assert!(folder.captcha_for_anonymous);

    let item = &snapshot.items["legacy"][0];
    assert_eq!(item.name, "old.pdf");
    assert!(item.is_complete());
}

#[tokio::test]
async fn test_snapshot_file_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db.json");

    let snapshot = Snapshot {
        folders: vec![sample_folder()],
        items: HashMap::from([("inbox".to_string(), vec![sample_item("a.txt", 12)])]),
    };
    snapshot.save(&path).await.unwrap();

    let loaded = Snapshot::load(&path).await.unwrap();
    assert_eq!(loaded, snapshot);
}
