use crate::common::{FaceAuthError, Result};
use crate::core::backend::FaceEncoding;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

pub const MAX_LABEL_LEN: usize = 24;

/// Stores past this size slow recognition down noticeably.
pub const RECOMMENDED_MAX_RECORDS: usize = 3;

/// One enrollment result as persisted in the user's model file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelRecord {
    /// Unix seconds.
    pub time: i64,
    pub label: String,
    pub id: u32,
    pub data: Vec<FaceEncoding>,
}

/// Id for a record appended after `records`: one past the highest id, 0 when empty.
pub fn next_id(records: &[ModelRecord]) -> Result<u32> {
    let Some(highest) = records.iter().map(|record| record.id).max() else {
        return Ok(0);
    };
    highest.checked_add(1).ok_or_else(|| {
        FaceAuthError::Storage(format!("Model id {} is the last one available", highest))
    })
}

pub fn default_label(id: u32) -> String {
    format!("Model #{}", id)
}

/// Truncates to `MAX_LABEL_LEN` characters and drops commas. The flag is set
/// when commas were removed.
pub fn sanitize_label(label: &str) -> (String, bool) {
    let truncated: String = label.chars().take(MAX_LABEL_LEN).collect();
    let stripped = truncated.contains(',');
    (truncated.replace(',', ""), stripped)
}

/// User names become file names, so anything that could escape the store is refused.
pub fn validate_user(user: &str) -> Result<()> {
    let invalid = user.is_empty()
        || user == "."
        || user == ".."
        || user.contains('/')
        || user.contains('\\')
        || user.contains('\0');
    if invalid {
        return Err(FaceAuthError::InvalidUser(user.to_string()));
    }
    Ok(())
}

/// Per-user model files under one directory, `<user>.json` each.
#[derive(Debug, Clone)]
pub struct ModelStore {
    dir: PathBuf,
}

impl ModelStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn user_model_path(&self, user: &str) -> PathBuf {
        self.dir.join(format!("{}.json", user))
    }

    /// Records for `user`; a missing file is an empty store.
    pub fn load(&self, user: &str) -> Result<Vec<ModelRecord>> {
        validate_user(user)?;
        let path = self.user_model_path(user);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let contents = fs::read_to_string(&path)?;
        serde_json::from_str(&contents).map_err(|e| {
            FaceAuthError::Storage(format!("Corrupt model file {}: {}", path.display(), e))
        })
    }

    /// Replaces the user's whole model file with `records`.
    pub fn save(&self, user: &str, records: &[ModelRecord]) -> Result<()> {
        validate_user(user)?;
        fs::create_dir_all(&self.dir)?;

        if records.len() > RECOMMENDED_MAX_RECORDS {
            tracing::warn!(
                "{} has {} face models. Recognition slows down with every model past {}.",
                user,
                records.len(),
                RECOMMENDED_MAX_RECORDS
            );
        }

        let encoded = serde_json::to_vec(records)?;
        write_atomic(&self.user_model_path(user), &encoded)?;
        tracing::debug!("Saved {} model(s) for {}", records.len(), user);
        Ok(())
    }

    /// Exclusive lock on the user's store, held until the guard drops.
    pub fn lock(&self, user: &str) -> Result<StoreLock> {
        validate_user(user)?;
        fs::create_dir_all(&self.dir)?;
        StoreLock::acquire(&self.dir.join(format!("{}.lock", user)))
    }

    /// Deletes the record with `id`. Other ids stay as they are. Returns
    /// false when no such record exists.
    pub fn remove(&self, user: &str, id: u32) -> Result<bool> {
        let _lock = self.lock(user)?;
        let mut records = self.load(user)?;
        let before = records.len();
        records.retain(|record| record.id != id);
        if records.len() == before {
            return Ok(false);
        }

        if records.is_empty() {
            fs::remove_file(self.user_model_path(user))?;
        } else {
            self.save(user, &records)?;
        }
        Ok(true)
    }

    /// Removes every model of `user`. Returns false when there was nothing to remove.
    pub fn clear(&self, user: &str) -> Result<bool> {
        let _lock = self.lock(user)?;
        let path = self.user_model_path(user);
        if !path.exists() {
            return Ok(false);
        }
        fs::remove_file(path)?;
        Ok(true)
    }
}

fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let tmp_path = path.with_extension("json.tmp");
    {
        let mut file = File::create(&tmp_path)?;
        file.write_all(data)?;
        file.sync_all()?;
    }
    fs::rename(tmp_path, path)?;
    Ok(())
}

/// Advisory `flock` guard.
pub struct StoreLock {
    #[cfg_attr(not(target_os = "linux"), allow(dead_code))]
    file: File,
}

impl StoreLock {
    #[cfg(target_os = "linux")]
    fn acquire(path: &Path) -> Result<Self> {
        use std::os::unix::io::AsRawFd;

        let file = File::options().create(true).read(true).write(true).open(path)?;
        // SAFETY: the descriptor is owned by `file` and stays open for the call.
        if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) } != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(Self { file })
    }

    #[cfg(not(target_os = "linux"))]
    fn acquire(path: &Path) -> Result<Self> {
        let file = File::options().create(true).read(true).write(true).open(path)?;
        Ok(Self { file })
    }
}

#[cfg(target_os = "linux")]
impl Drop for StoreLock {
    fn drop(&mut self) {
        use std::os::unix::io::AsRawFd;

        // SAFETY: as in `acquire`.
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: u32) -> ModelRecord {
        ModelRecord { time: 1_700_000_000, label: default_label(id), id, data: vec![vec![0.5; 4]] }
    }

    #[test]
    fn next_id_skips_past_gaps() {
        assert_eq!(next_id(&[]).unwrap(), 0);
        assert_eq!(next_id(&[record(0), record(2), record(5)]).unwrap(), 6);
        assert_eq!(next_id(&[record(5), record(0)]).unwrap(), 6);
    }

    #[test]
    fn exhausted_ids_are_a_storage_error() {
        assert_eq!(next_id(&[record(u32::MAX - 1)]).unwrap(), u32::MAX);
        assert!(matches!(next_id(&[record(3), record(u32::MAX)]), Err(FaceAuthError::Storage(_))));
    }

    #[test]
    fn labels_are_truncated_then_stripped() {
        assert_eq!(sanitize_label("My,Model"), ("MyModel".to_string(), true));
        assert_eq!(sanitize_label("Model #3"), ("Model #3".to_string(), false));

        let (label, _) = sanitize_label("abcdefghijklmnopqrstuvwxyz");
        assert_eq!(label, "abcdefghijklmnopqrstuvwx");
        // the comma past the cut is gone with the truncation
        assert_eq!(sanitize_label("abcdefghijklmnopqrstuvwxyz,"), (label, false));
    }

    #[test]
    fn path_like_users_are_rejected() {
        for user in ["", ".", "..", "../root", "a/b"] {
            let result = validate_user(user);
            assert!(matches!(result, Err(FaceAuthError::InvalidUser(_))), "{:?}", user);
        }
        assert!(validate_user("alice").is_ok());
    }

    #[test]
    fn missing_file_loads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = ModelStore::new(dir.path().join("models"));
        assert!(store.load("alice").unwrap().is_empty());
    }

    #[test]
    fn save_creates_directory_and_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let store = ModelStore::new(dir.path().join("models"));

        store.save("alice", &[record(0), record(1)]).unwrap();
        store.save("alice", &[record(4)]).unwrap();

        assert_eq!(store.load("alice").unwrap(), vec![record(4)]);
        assert!(!store.user_model_path("alice").with_extension("json.tmp").exists());
    }

    #[test]
    fn remove_keeps_other_ids_and_deletes_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = ModelStore::new(dir.path());
        store.save("bob", &[record(0), record(1), record(2)]).unwrap();

        assert!(store.remove("bob", 1).unwrap());
        assert!(!store.remove("bob", 1).unwrap());
        let ids: Vec<u32> = store.load("bob").unwrap().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![0, 2]);

        store.remove("bob", 0).unwrap();
        store.remove("bob", 2).unwrap();
        assert!(!store.user_model_path("bob").exists());
        assert!(!store.clear("bob").unwrap());
    }

    #[test]
    fn double_precision_encodings_survive_load_and_save() {
        let dir = tempfile::tempdir().unwrap();
        let store = ModelStore::new(dir.path());
        let value = -0.09128374651234567_f64;
        assert_ne!(value as f32 as f64, value);

        let raw = format!(
            r#"[{{"time":1600000000,"label":"Imported","id":0,"data":[[{},0.5]]}}]"#,
            value
        );
        fs::write(store.user_model_path("dana"), raw).unwrap();

        let records = store.load("dana").unwrap();
        assert_eq!(records[0].data[0][0], value);
        store.save("dana", &records).unwrap();

        let text = fs::read_to_string(store.user_model_path("dana")).unwrap();
        let saved: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(saved[0]["data"][0][0].as_f64(), Some(value));
        assert_eq!(store.load("dana").unwrap(), records);
    }
}
