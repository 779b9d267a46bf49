//! Unix-specific filesystem helpers with portable fallbacks.

use std::fs::File;
use std::io;
use std::path::Path;

/// Lock modes for [`flock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// Acquire an advisory flock on an open file without blocking.
/// Returns `WouldBlock` if another process holds a conflicting lock.
pub fn flock(file: &File, mode: LockMode) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::io::AsRawFd;

        let op = match mode {
            LockMode::Shared => libc::LOCK_SH,
            LockMode::Exclusive => libc::LOCK_EX,
        } | libc::LOCK_NB;
        if unsafe { libc::flock(file.as_raw_fd(), op) } == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(not(unix))]
    {
        let _ = (file, mode);
        Ok(())
    }
}

/// Release an advisory flock.
pub fn funlock(file: &File) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::io::AsRawFd;

        if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_UN) } == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(not(unix))]
    {
        let _ = file;
        Ok(())
    }
}

/// Ensure the byte range `[offset, offset+len)` of `file` reads as zeroes.
///
/// Delegates to `fallocate(PUNCH_HOLE)` where available; falls back to
/// writing zeroes so the result is identical either way.
pub fn punch_hole(file: &mut File, offset: u64, len: u64) -> io::Result<()> {
    if len == 0 {
        return Ok(());
    }

    #[cfg(target_os = "linux")]
    {
        use std::os::unix::io::AsRawFd;

        let res = unsafe {
            libc::fallocate(
                file.as_raw_fd(),
                libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE,
                offset as libc::off_t,
                len as libc::off_t,
            )
        };
        if res == 0 {
            return Ok(());
        }
        // Not every filesystem or file kind supports hole punching.
    }

    write_zeroes(file, offset, len)
}

fn write_zeroes(file: &mut File, offset: u64, len: u64) -> io::Result<()> {
    use std::io::{Seek, SeekFrom, Write};

    const ZERO_BUF: usize = 256 * 1024;
    let zeroes = [0u8; ZERO_BUF];
    file.seek(SeekFrom::Start(offset))?;
    let mut remaining = len;
    while remaining > 0 {
        let n = remaining.min(ZERO_BUF as u64) as usize;
        file.write_all(&zeroes[..n])?;
        remaining -= n as u64;
    }
    Ok(())
}

/// Best-effort preallocation of `len` bytes for `file`.
pub fn preallocate(file: &File, len: u64) -> io::Result<()> {
    #[cfg(target_os = "linux")]
    {
        use std::os::unix::io::AsRawFd;

        if len > 0 {
            let res = unsafe { libc::fallocate(file.as_raw_fd(), 0, 0, len as libc::off_t) };
            if res != 0 {
                // Allocation support is optional; the caller tolerates failure.
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    {
        let _ = (file, len);
        Ok(())
    }
}

/// fsync a directory so renames and unlinks inside it are durable.
pub fn fsync_dir(path: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        File::open(path)?.sync_all()
    }

    #[cfg(not(unix))]
    {
        let _ = path;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Seek, SeekFrom, Write};

    #[test]
    fn punch_hole_zeroes_range() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("holes");
        let mut f = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .unwrap();
        f.write_all(&[0xAA; 8192]).unwrap();

        punch_hole(&mut f, 1024, 4096).unwrap();

        let mut buf = Vec::new();
        f.seek(SeekFrom::Start(0)).unwrap();
        f.read_to_end(&mut buf).unwrap();
        assert_eq!(&buf[..1024], &[0xAA; 1024][..]);
        assert!(buf[1024..5120].iter().all(|&b| b == 0));
        assert_eq!(&buf[5120..], &[0xAA; 3072][..]);
    }

    #[test]
    fn exclusive_flock_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lock");
        let a = File::create(&path).unwrap();
        let b = File::options().read(true).open(&path).unwrap();

        flock(&a, LockMode::Exclusive).unwrap();
        // Same-process flock conflicts are only visible through a second
        // file description, which `b` is.
        let err = flock(&b, LockMode::Exclusive).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::WouldBlock);
        funlock(&a).unwrap();
        flock(&b, LockMode::Exclusive).unwrap();
    }

    #[test]
    fn shared_flocks_coexist() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lock");
        let a = File::create(&path).unwrap();
        let b = File::options().read(true).open(&path).unwrap();

        flock(&a, LockMode::Shared).unwrap();
        flock(&b, LockMode::Shared).unwrap();
    }
}
