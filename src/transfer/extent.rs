//! Positional reads of a local file range.
//!
//! Several file workers may read different ranges of the same file at
//! once, so reads use `pread`/`seek_read` and never touch a shared cursor.

use std::fs::File;
use std::io;
use std::path::Path;

/// Read `length` bytes of the file at `path` starting at `offset`.
///
/// Fails with `UnexpectedEof` if the file ends first, which for a dirty
/// file means it was truncated after its size was recorded.
pub fn read_extent(path: &Path, offset: u64, length: u64) -> io::Result<Vec<u8>> {
    let file = File::open(path)?;
    let length = usize::try_from(length).map_err(|_| {
        io::Error::new(io::ErrorKind::InvalidInput, "extent does not fit in memory")
    })?;
    let mut buf = vec![0u8; length];
    let mut filled = 0;
    while filled < length {
        match pread(&file, offset + filled as u64, &mut buf[filled..]) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!(
                        "{} ends after {} of {} bytes at offset {}",
                        path.display(),
                        filled,
                        length,
                        offset
                    ),
                ))
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(buf)
}

#[cfg(unix)]
fn pread(file: &File, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
    std::os::unix::fs::FileExt::read_at(file, buf, offset)
}

#[cfg(windows)]
fn pread(file: &File, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
    std::os::windows::fs::FileExt::seek_read(file, buf, offset)
}
