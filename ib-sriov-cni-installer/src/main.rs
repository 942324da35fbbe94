//! Thin entrypoint (spec §4.8): copies the `ib-sriov-cni` binary into a
//! host-mounted CNI bin directory atomically, then blocks until the
//! container is asked to terminate. Run as an init container's "sleep
//! forever" sidecar in a DaemonSet, not as part of the per-invocation CNI
//! plugin itself.

use clap::{App, Arg};
use std::fs::{self, File};
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

static TERMINATED: AtomicBool = AtomicBool::new(false);

fn install_signal_handlers() -> io::Result<()> {
    for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        unsafe {
            signal_hook::low_level::register(signal, || {
                TERMINATED.store(true, Ordering::SeqCst);
            })?;
        }
    }
    Ok(())
}

fn verify_paths(cni_bin_dir: &Path, src_file: &Path) -> io::Result<()> {
    if !cni_bin_dir.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("CNI bin directory {} does not exist", cni_bin_dir.display()),
        ));
    }
    let meta = fs::metadata(src_file)?;
    if !meta.is_file() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} is not a regular file", src_file.display()),
        ));
    }
    Ok(())
}

/// Copy `src` to `dst` by writing a temporary file in `dst`'s own
/// directory and renaming it over the destination, preserving `src`'s
/// mode bits. The rename is atomic with respect to any concurrent reader
/// of `dst` (e.g. a kubelet invoking the CNI plugin mid-upgrade never
/// observes a partially-written binary).
fn copy_atomic(src: &Path, dst: &Path) -> io::Result<()> {
    let src_mode = fs::metadata(src)?.permissions().mode();
    let dst_dir = dst.parent().unwrap_or_else(|| Path::new("."));
    let tmp_path = dst_dir.join(format!(
        "{}.tmp",
        dst.file_name().and_then(|n| n.to_str()).unwrap_or("ib-sriov-cni")
    ));

    {
        let mut src_file = File::open(src)?;
        let mut tmp_file = File::create(&tmp_path)?;
        io::copy(&mut src_file, &mut tmp_file)?;
        tmp_file.sync_all()?;
    }
    fs::set_permissions(&tmp_path, fs::Permissions::from_mode(src_mode))?;
    fs::rename(&tmp_path, dst)?;
    Ok(())
}

fn main() {
    let matches = App::new("ib-sriov-cni-installer")
        .about("Copies ib-sriov-cni into a host CNI bin directory, then waits to be terminated")
        .arg(
            Arg::with_name("cni-bin-dir")
                .long("cni-bin-dir")
                .takes_value(true)
                .default_value("/host/opt/cni/bin")
                .help("Host-mounted CNI binary directory"),
        )
        .arg(
            Arg::with_name("ib-sriov-cni-bin-file")
                .long("ib-sriov-cni-bin-file")
                .takes_value(true)
                .default_value("/usr/bin/ib-sriov-cni")
                .help("Path to the ib-sriov-cni binary bundled in this image"),
        )
        .arg(
            Arg::with_name("no-sleep")
                .long("no-sleep")
                .help("Exit immediately after copying instead of blocking on a termination signal"),
        )
        .get_matches();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cni_bin_dir = PathBuf::from(matches.value_of("cni-bin-dir").unwrap());
    let src_file = PathBuf::from(matches.value_of("ib-sriov-cni-bin-file").unwrap());
    let dst_file = cni_bin_dir.join("ib-sriov-cni");

    if let Err(e) = verify_paths(&cni_bin_dir, &src_file) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    log::info!("copying {} to {}", src_file.display(), dst_file.display());
    if let Err(e) = copy_atomic(&src_file, &dst_file) {
        eprintln!("Error: failed to copy binary: {}", e);
        std::process::exit(1);
    }
    log::info!("copied ib-sriov-cni binary to {}", dst_file.display());

    if matches.is_present("no-sleep") {
        println!("Binary copied successfully, exiting (--no-sleep)");
        return;
    }

    if let Err(e) = install_signal_handlers() {
        log::warn!("failed to install signal handlers: {}", e);
    }

    println!("Entering sleep... (success)");
    while !TERMINATED.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(200));
    }
    println!("Received signal, exiting...");
}
