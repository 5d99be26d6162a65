//! In-memory files, for tests and embedding.

use super::{File, Identity, Source};
use bytes::Bytes;
use std::{
    collections::HashMap,
    io,
    sync::{Arc, Mutex, RwLock},
};

/// In-memory [Source] keyed by path.
#[derive(Clone, Default)]
pub struct Memory {
    files: Arc<RwLock<HashMap<String, Bytes>>>,
    opens: Arc<Mutex<Vec<(String, Identity)>>>,
}

impl Memory {
    /// Store (or replace) the content of `path`.
    pub fn insert(&self, path: &str, content: impl Into<Bytes>) {
        self.files
            .write()
            .unwrap()
            .insert(path.to_string(), content.into());
    }

    /// Remove `path`, returning whether it existed.
    pub fn remove(&self, path: &str) -> bool {
        self.files.write().unwrap().remove(path).is_some()
    }

    /// Every successful open so far, with the identity it was performed for.
    pub fn opens(&self) -> Vec<(String, Identity)> {
        self.opens.lock().unwrap().clone()
    }
}

impl Source for Memory {
    type File = MemoryBlob;

    fn open(&self, path: &str, identity: &Identity) -> io::Result<MemoryBlob> {
        let content = self
            .files
            .read()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, path.to_string()))?;
        self.opens
            .lock()
            .unwrap()
            .push((path.to_string(), identity.clone()));
        Ok(MemoryBlob { content })
    }
}

/// A file opened from [Memory]. Later changes to the path are not observed.
pub struct MemoryBlob {
    content: Bytes,
}

impl File for MemoryBlob {
    fn size(&self) -> io::Result<u64> {
        Ok(self.content.len() as u64)
    }

    fn read_at(&self, bufs: &mut [&mut [u8]], offset: u64) -> io::Result<()> {
        let len = self.content.len();
        let mut offset = usize::try_from(offset).unwrap_or(usize::MAX);
        for buf in bufs.iter_mut() {
            let start = offset.min(len);
            let available = (len - start).min(buf.len());
            buf[..available].copy_from_slice(&self.content[start..start + available]);
            buf[available..].fill(0);
            offset = offset.saturating_add(buf.len());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use commonware_macros::test_traced;

    #[test_traced]
    fn test_read_past_end_zero_fills() {
        let memory = Memory::default();
        memory.insert("/a", b"abcdef".to_vec());
        let blob = memory.open("/a", &Identity::new(1, 2)).unwrap();
        assert_eq!(blob.size().unwrap(), 6);

        // Read across the end of the file
        let mut first = [0xffu8; 4];
        let mut second = [0xffu8; 4];
        blob.read_at(&mut [&mut first[..], &mut second[..]], 0).unwrap();
        assert_eq!(&first, b"abcd");
        assert_eq!(&second, b"ef\0\0");

        // Read entirely beyond the end
        let mut third = [0xffu8; 4];
        blob.read_at(&mut [&mut third[..]], 100).unwrap();
        assert_eq!(third, [0; 4]);

        // Opens are recorded with their identity
        assert_eq!(memory.opens(), vec![("/a".to_string(), Identity::new(1, 2))]);
    }

    #[test_traced]
    fn test_open_missing() {
        let memory = Memory::default();
        let err = memory.open("/missing", &Identity::new(0, 0)).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
        assert!(memory.opens().is_empty());

        // Removing the path makes it unavailable to new opens
        memory.insert("/gone", b"x".to_vec());
        assert!(memory.remove("/gone"));
        assert!(memory.open("/gone", &Identity::new(0, 0)).is_err());
    }
}
