//! Utility functions for file operations and path manipulation

use std::io;
use std::path::{Component, Path, PathBuf};
use tokio::io::AsyncReadExt;

/// Read buffer used when hashing files already on disk
const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// Local path of `file` of `item` under `dest`
///
/// The layout is `<dest>/<item>/<file>`, where `file` may contain `/` separated
/// subdirectories. Names that would escape `dest` (absolute paths, `..`, empty
/// components) are rejected with [`io::ErrorKind::InvalidInput`].
///
/// # Examples
///
/// ```
/// use std::path::Path;
/// use archive_dl::utils::destination_path;
///
/// let path = destination_path(Path::new("/data"), "item", "sub/a.warc.gz").unwrap();
/// assert_eq!(path, Path::new("/data/item/sub/a.warc.gz"));
///
/// assert!(destination_path(Path::new("/data"), "item", "../escape").is_err());
/// ```
pub fn destination_path(dest: &Path, item: &str, file: &str) -> io::Result<PathBuf> {
    let mut path = dest.to_path_buf();
    push_checked(&mut path, item, false)?;
    push_checked(&mut path, file, true)?;
    Ok(path)
}

fn push_checked(path: &mut PathBuf, name: &str, allow_subdirs: bool) -> io::Result<()> {
    let invalid = || {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("refusing unsafe name '{}'", name),
        )
    };

    if name.is_empty() || name.contains('\0') || (!allow_subdirs && name.contains('/')) {
        return Err(invalid());
    }

    for segment in name.split('/') {
        let mut components = Path::new(segment).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(part)), None) => path.push(part),
            _ => return Err(invalid()),
        }
    }

    Ok(())
}

/// Hex MD5 digest of a file on disk
///
/// Used to adopt files that already exist at their destination.
pub async fn compute_md5(path: &Path) -> io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut context = md5::Context::new();
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];

    loop {
        let read = file.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        context.consume(&buffer[..read]);
    }

    Ok(format!("{:x}", context.compute()))
}

/// Human-readable byte count for log lines (`1.5 MiB`)
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];

    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}
