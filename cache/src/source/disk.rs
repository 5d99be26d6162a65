//! Positional reads from the local filesystem.
//!
//! A vectored read fills each buffer in turn with as many positional reads as it takes. Bytes past
//! the end of the file are zeroed.

use super::{File, Identity, Source};
use std::{fs, io};
use tracing::debug;

/// [Source] reading files from the local filesystem.
///
/// Files are opened with the credentials of the calling process. The requester's [Identity] is
/// recorded in the logs; enforcing it is left to whoever grants the process access to the file.
#[derive(Clone, Copy, Debug, Default)]
pub struct Disk;

impl Source for Disk {
    type File = DiskBlob;

    fn open(&self, path: &str, identity: &Identity) -> io::Result<DiskBlob> {
        let file = fs::File::open(path)?;
        debug!(path, uid = identity.uid, gid = identity.gid, "opened file");
        Ok(DiskBlob { file })
    }
}

/// A file opened from [Disk].
pub struct DiskBlob {
    file: fs::File,
}

#[cfg(unix)]
fn read_once(file: &fs::File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.read_at(buf, offset)
}

#[cfg(windows)]
fn read_once(file: &fs::File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_read(buf, offset)
}

impl File for DiskBlob {
    fn size(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn read_at(&self, bufs: &mut [&mut [u8]], offset: u64) -> io::Result<()> {
        let mut offset = offset;
        for buf in bufs.iter_mut() {
            let mut filled = 0;
            while filled < buf.len() {
                let n = read_once(&self.file, &mut buf[filled..], offset + filled as u64)?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            buf[filled..].fill(0);
            offset += buf.len() as u64;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use commonware_macros::test_traced;
    use std::{io::Write, process};

    #[test_traced]
    fn test_read_disk_file() {
        // Write a small file
        let path = std::env::temp_dir().join(format!("zerofs-cache-disk-{}", process::id()));
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(b"0123456789").unwrap();
        drop(file);

        // Read it back across the end
        let path_str = path.to_str().unwrap();
        let blob = Disk.open(path_str, &Identity::new(0, 0)).unwrap();
        assert_eq!(blob.size().unwrap(), 10);
        let mut first = [0xffu8; 6];
        let mut second = [0xffu8; 6];
        blob.read_at(&mut [&mut first[..], &mut second[..]], 2).unwrap();
        assert_eq!(&first, b"234567");
        assert_eq!(&second, b"89\0\0\0\0");

        fs::remove_file(&path).unwrap();
    }

    #[test_traced]
    fn test_open_missing_file() {
        let err = Disk
            .open("/definitely/not/here", &Identity::new(0, 0))
            .err()
            .unwrap();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
