///! Utility functions for reading and modifying the state of sysfs
/// objects.
use std::path::Path;
use std::{
    fs,
    io::{Error, ErrorKind, Result},
    str::FromStr,
};

/// Read and parse value from a file
pub fn parse_value<T>(dir: &Path, file: &str) -> Result<T>
where
    T: FromStr,
{
    let path = dir.join(file);
    let s = fs::read_to_string(&path)?;
    let s = s.trim();
    match s.parse() {
        Ok(v) => Ok(v),
        Err(_) => Err(Error::new(
            ErrorKind::InvalidData,
            format!(
                "Failed to parse {}: {}",
                path.as_path().to_str().unwrap(),
                s
            ),
        )),
    }
}

/// List the entry names of a directory, sorted for deterministic iteration.
/// Used for the "exactly one entry expected" sysfs directories (net/,
/// physfn/net/) as well as for scanning (virtfn*, infiniband device dirs).
pub fn list_dir_entries(dir: &Path) -> Result<Vec<String>> {
    let mut names: Vec<String> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    Ok(names)
}

/// Read a directory that sysfs guarantees holds exactly one entry (e.g.
/// `net/<pf>/device/virtfn<i>/net/`) and return that entry's name.
pub fn single_dir_entry(dir: &Path) -> Result<String> {
    let mut names = list_dir_entries(dir)?;
    match names.len() {
        1 => Ok(names.remove(0)),
        0 => Err(Error::new(
            ErrorKind::NotFound,
            format!("{}: no entries", dir.display()),
        )),
        n => Err(Error::new(
            ErrorKind::InvalidData,
            format!("{}: expected a single entry, found {}", dir.display(), n),
        )),
    }
}

/// Resolve a symlink and return the basename of its target, e.g. reading
/// `/sys/bus/pci/devices/<vf>/driver` yields the bound driver's name and
/// reading `net/<pf>/device/virtfn<i>` yields the VF's PCI address.
pub fn read_link_basename(path: &Path) -> Result<String> {
    let target = fs::read_link(path)?;
    target
        .file_name()
        .and_then(|name| name.to_str())
        .map(|name| name.to_string())
        .ok_or_else(|| {
            Error::new(
                ErrorKind::InvalidData,
                format!("{}: symlink target has no basename", path.display()),
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;

    #[test]
    fn parse_value_trims_whitespace() {
        let dir = tempdir();
        fs::write(dir.join("numvfs"), "8\n").unwrap();
        let v: u32 = parse_value(&dir, "numvfs").unwrap();
        assert_eq!(v, 8);
        cleanup(&dir);
    }

    #[test]
    fn parse_value_rejects_garbage() {
        let dir = tempdir();
        fs::write(dir.join("numvfs"), "not-a-number\n").unwrap();
        let res: Result<u32> = parse_value(&dir, "numvfs");
        assert!(res.is_err());
        cleanup(&dir);
    }

    #[test]
    fn single_dir_entry_requires_exactly_one() {
        let dir = tempdir();
        let res = single_dir_entry(&dir);
        assert!(res.is_err());

        fs::write(dir.join("ib0"), "").unwrap();
        assert_eq!(single_dir_entry(&dir).unwrap(), "ib0");

        fs::write(dir.join("ib1"), "").unwrap();
        assert!(single_dir_entry(&dir).is_err());
        cleanup(&dir);
    }

    #[test]
    fn read_link_basename_resolves_target() {
        let dir = tempdir();
        symlink("../../../devices/pci0000:00/0000:00:06.0/0000:af:06.0", dir.join("virtfn0")).unwrap();
        assert_eq!(read_link_basename(&dir.join("virtfn0")).unwrap(), "0000:af:06.0");
        cleanup(&dir);
    }

    fn tempdir() -> std::path::PathBuf {
        use std::sync::atomic::{AtomicU32, Ordering};
        static COUNTER: AtomicU32 = AtomicU32::new(0);
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        let dir = std::env::temp_dir()
            .join(format!("sysfs-test-{}-{}", std::process::id(), n));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn cleanup(dir: &Path) {
        let _ = fs::remove_dir_all(dir);
    }
}
