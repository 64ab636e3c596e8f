use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A named drop folder: identity plus the policy applied to every transfer
/// into or out of it.
///
/// The serialized field names are pinned to the legacy snapshot format,
/// which named the read-side knobs "upload" and the write-side knobs
/// "download". The Rust fields carry the behavioral names:
/// `read_rate`/`max_active_reads` govern downloads, `write_rate`/
/// `max_active_writes` govern uploads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Folder {
    #[serde(rename = "Name")]
    pub name: String,
    /// Assigned by the engine at creation; immutable afterwards.
    #[serde(rename = "CreateDate")]
    pub create_date: DateTime<Utc>,
    /// Per-file byte cap. Absent or zero means unlimited.
    #[serde(rename = "MaxFileSize", default)]
    pub max_file_size: Option<u64>,
    /// Cap on the number of items. Absent or zero means unlimited.
    #[serde(rename = "MaxFileCount", default)]
    pub max_file_count: Option<u64>,
    /// Cap on the sum of item sizes. Absent or zero means unlimited.
    #[serde(rename = "MaxTotalSize", default)]
    pub max_total_size: Option<u64>,
    /// Item lifetime before the sweeper deletes it. Absent means infinite.
    #[serde(rename = "MaxLifeTime", default, with = "duration_nanos")]
    pub max_life_time: Option<Duration>,
    /// Bytes per second granted to each download stream.
    #[serde(rename = "MaxUpBytesPerSec", default)]
    pub read_rate: Option<u64>,
    /// Bytes per second granted to each upload stream.
    #[serde(rename = "MaxDlBytesPerSec", default)]
    pub write_rate: Option<u64>,
    /// Concurrent download cap, enforced at `open_item`.
    #[serde(rename = "MaxActiveUploads", default)]
    pub max_active_reads: Option<u32>,
    /// Concurrent upload cap, enforced at `upload_item` admission.
    #[serde(rename = "MaxActiveDownloads", default)]
    pub max_active_writes: Option<u32>,
    #[serde(rename = "CaptchaForAnonymous", default)]
    pub captcha_for_anonymous: bool,
    #[serde(rename = "CaptchaForLoggedUsers", default)]
    pub captcha_for_logged_users: bool,
    /// Hidden from public folder listings.
    #[serde(rename = "IsPrivate", default)]
    pub is_private: bool,
    /// Item listing restricted to admins.
    #[serde(rename = "IsAdminOnlyReadable", default)]
    pub is_admin_only_readable: bool,
    /// Shared folder secret, stored as an Argon2id PHC string.
    #[serde(rename = "Password", default)]
    pub password: Option<String>,
    /// Login -> acceptable password hashes. `None` when no logins exist.
    #[serde(rename = "Users", default)]
    pub users: Option<HashMap<String, Vec<String>>>,
}

impl Folder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            create_date: Utc::now(),
            max_file_size: None,
            max_file_count: None,
            max_total_size: None,
            max_life_time: None,
            read_rate: None,
            write_rate: None,
            max_active_reads: None,
            max_active_writes: None,
            captcha_for_anonymous: false,
            captcha_for_logged_users: false,
            is_private: false,
            is_admin_only_readable: false,
            password: None,
            users: None,
        }
    }
}

/// A completed file within a folder. Identity within the folder is `name`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileItem {
    #[serde(rename = "Name")]
    pub name: String,
    /// Always "/": items live flat inside their folder.
    #[serde(rename = "Path")]
    pub path: String,
    #[serde(rename = "CreateDate")]
    pub create_date: DateTime<Utc>,
    /// Declared size in bytes.
    #[serde(rename = "Size")]
    pub size: u64,
    /// Bytes committed so far; equals `size` once the upload finalized.
    #[serde(rename = "Uploaded")]
    pub uploaded: u64,
}

impl FileItem {
    pub fn new(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            path: "/".to_string(),
            create_date: Utc::now(),
            size,
            uploaded: 0,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.uploaded >= self.size
    }
}

/// Reduce a client-supplied folder name to its first real path segment.
///
/// Separators of both flavors and dot segments never survive, so a cleaned
/// name can only address a direct child of the storage root. Returns an
/// empty string when nothing usable remains.
pub fn clean_name(raw: &str) -> String {
    raw.split(['/', '\\'])
        .map(str::trim)
        .find(|s| !s.is_empty() && *s != "." && *s != "..")
        .unwrap_or("")
        .to_string()
}

/// Serializes `Option<Duration>` as integer nanoseconds, the durable form
/// legacy snapshots use.
pub(crate) mod duration_nanos {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_nanos() as i64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let nanos = Option::<i64>::deserialize(deserializer)?;
        Ok(nanos.map(|n| Duration::from_nanos(n.max(0) as u64)))
    }
}
