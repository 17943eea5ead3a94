//! Persistent, string-keyed store of dense f32 arrays.
//!
//! Each key maps to a single file under the cache directory holding one or
//! more named arrays (a convolved PSF cache entry holds two: the
//! once-convolved full PSF and the twice-convolved mean PSF). Writes go to a
//! temp path and are renamed into place so a crash mid-write never corrupts
//! the prior value.

use std::collections::HashSet;
use std::fs;
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};

use crate::error::{Result, WscmsError};

const CACHE_EXT: &str = "wscms-cache";

/// One dense array with its shape, flattened row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct ArrayBlob {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl ArrayBlob {
    pub fn from_array<D: ndarray::Dimension>(arr: &ndarray::ArrayView<f32, D>) -> Self {
        ArrayBlob {
            shape: arr.shape().to_vec(),
            data: arr.iter().copied().collect(),
        }
    }
}

/// A cache value: an ordered list of named arrays, keyed by position rather
/// than name (callers agree on array order by construction, e.g. "conv_psf
/// then conv2_psf_mean").
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CacheValue {
    pub arrays: Vec<ArrayBlob>,
}

impl CacheValue {
    fn write_to(&self, w: &mut impl Write) -> std::io::Result<()> {
        w.write_all(&(self.arrays.len() as u32).to_le_bytes())?;
        for blob in &self.arrays {
            w.write_all(&(blob.shape.len() as u32).to_le_bytes())?;
            for &d in &blob.shape {
                w.write_all(&(d as u64).to_le_bytes())?;
            }
            w.write_all(&(blob.data.len() as u64).to_le_bytes())?;
            for &v in &blob.data {
                w.write_all(&v.to_le_bytes())?;
            }
        }
        Ok(())
    }

    fn read_from(bytes: &[u8]) -> std::io::Result<Self> {
        let mut cur = Cursor::new(bytes);
        let n_arrays = read_u32(&mut cur)? as usize;
        let mut arrays = Vec::with_capacity(n_arrays);
        for _ in 0..n_arrays {
            let ndim = read_u32(&mut cur)? as usize;
            let mut shape = Vec::with_capacity(ndim);
            for _ in 0..ndim {
                shape.push(read_u64(&mut cur)? as usize);
            }
            let len = read_u64(&mut cur)? as usize;
            let mut data = Vec::with_capacity(len);
            for _ in 0..len {
                data.push(read_f32(&mut cur)?);
            }
            arrays.push(ArrayBlob { shape, data });
        }
        Ok(CacheValue { arrays })
    }
}

fn read_u32(cur: &mut Cursor<&[u8]>) -> std::io::Result<u32> {
    let mut buf = [0u8; 4];
    cur.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64(cur: &mut Cursor<&[u8]>) -> std::io::Result<u64> {
    let mut buf = [0u8; 8];
    cur.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_f32(cur: &mut Cursor<&[u8]>) -> std::io::Result<f32> {
    let mut buf = [0u8; 4];
    cur.read_exact(&mut buf)?;
    Ok(f32::from_le_bytes(buf))
}

/// Disk-backed layer of the PSF cache: one file per key under `dir`.
pub struct PsfCacheStore {
    dir: PathBuf,
    valid_keys: HashSet<String>,
}

impl PsfCacheStore {
    /// Opens (creating if needed) the cache directory and enumerates
    /// existing entries so `contains`/`get` see prior runs' data.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| WscmsError::CacheIo {
            key: dir.display().to_string(),
            source: e,
        })?;

        let mut valid_keys = HashSet::new();
        let entries = fs::read_dir(&dir).map_err(|e| WscmsError::CacheIo {
            key: dir.display().to_string(),
            source: e,
        })?;
        for entry in entries {
            let entry = entry.map_err(|e| WscmsError::CacheIo {
                key: dir.display().to_string(),
                source: e,
            })?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some(CACHE_EXT) {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    valid_keys.insert(stem.to_string());
                }
            }
        }

        Ok(PsfCacheStore { dir, valid_keys })
    }

    pub fn contains(&self, key: &str) -> bool {
        self.valid_keys.contains(key)
    }

    pub fn valid_keys(&self) -> impl Iterator<Item = &String> {
        self.valid_keys.iter()
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.{CACHE_EXT}"))
    }

    pub fn get(&self, key: &str) -> Result<CacheValue> {
        if !self.valid_keys.contains(key) {
            return Err(WscmsError::CacheMiss {
                key: key.to_string(),
            });
        }
        let path = self.path_for(key);
        let bytes = fs::read(&path).map_err(|e| WscmsError::CacheIo {
            key: key.to_string(),
            source: e,
        })?;
        CacheValue::read_from(&bytes).map_err(|e| WscmsError::CacheIo {
            key: key.to_string(),
            source: e,
        })
    }

    /// Writes `value` under `key`, atomically: write to a temp path in the
    /// same directory, then rename over the final path. A write failure
    /// leaves any prior value for `key` untouched.
    pub fn put(&mut self, key: &str, value: &CacheValue) -> Result<()> {
        let final_path = self.path_for(key);
        let tmp_path = self.dir.join(format!("{key}.{CACHE_EXT}.tmp"));

        let write_result = (|| -> std::io::Result<()> {
            let mut f = fs::File::create(&tmp_path)?;
            value.write_to(&mut f)?;
            f.sync_all()?;
            Ok(())
        })();

        if let Err(e) = write_result {
            let _ = fs::remove_file(&tmp_path);
            return Err(WscmsError::CacheIo {
                key: key.to_string(),
                source: e,
            });
        }

        fs::rename(&tmp_path, &final_path).map_err(|e| WscmsError::CacheIo {
            key: key.to_string(),
            source: e,
        })?;
        self.valid_keys.insert(key.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn sample_value() -> CacheValue {
        let a = array![[1.0_f32, 2.0], [3.0, 4.0]];
        let b = array![5.0_f32, 6.0, 7.0];
        CacheValue {
            arrays: vec![
                ArrayBlob::from_array(&a.view()),
                ArrayBlob::from_array(&b.view()),
            ],
        }
    }

    #[test]
    fn put_then_get_round_trips_bitwise() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = PsfCacheStore::open(dir.path()).unwrap();
        let value = sample_value();

        store.put("S0F0", &value).unwrap();
        let read_back = store.get("S0F0").unwrap();
        assert_eq!(read_back, value);
    }

    #[test]
    fn missing_key_is_cache_miss() {
        let dir = tempfile::tempdir().unwrap();
        let store = PsfCacheStore::open(dir.path()).unwrap();
        let err = store.get("nope").unwrap_err();
        assert!(matches!(err, WscmsError::CacheMiss { .. }));
    }

    #[test]
    fn reopening_store_discovers_prior_keys() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = PsfCacheStore::open(dir.path()).unwrap();
            store.put("S1F2", &sample_value()).unwrap();
        }
        let store2 = PsfCacheStore::open(dir.path()).unwrap();
        assert!(store2.contains("S1F2"));
        assert_eq!(store2.get("S1F2").unwrap(), sample_value());
    }

    #[test]
    fn failed_write_leaves_prior_value_intact() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = PsfCacheStore::open(dir.path()).unwrap();
        let v1 = sample_value();
        store.put("K", &v1).unwrap();

        // Simulate a bad write by pointing the tmp file at a directory (a
        // write there fails), which must not disturb the committed value.
        let tmp_path = dir.path().join("K.wscms-cache.tmp");
        fs::create_dir(&tmp_path).unwrap();
        let mut v2 = v1.clone();
        v2.arrays.push(ArrayBlob {
            shape: vec![1],
            data: vec![42.0],
        });
        let result = store.put("K", &v2);
        assert!(result.is_err());
        fs::remove_dir(&tmp_path).ok();

        assert_eq!(store.get("K").unwrap(), v1);
    }
}
