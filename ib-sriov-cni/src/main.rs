//! CLI shell (spec §2, §6): reads the CNI environment/stdin, dispatches to
//! the Orchestrator, and prints the CNI wire-protocol result/error JSON.
//! Out of core interest per spec §1, but still wired up properly — this is
//! the only thing a CNI runtime ever actually invokes.

use clap::{App, Arg};
use ib_sriov_cni::cni::CniError;
use ib_sriov_cni::config::NetConf;
use ib_sriov_cni::error::{EngineError, ErrorKind};
use ib_sriov_cni::lock;
use ib_sriov_cni::netlink::RealNetlink;
use ib_sriov_cni::orchestrator::{Engine, Invocation};
use ib_sriov_cni::rdma::RealRdma;
use std::io::Read;
use std::process::ExitCode;

const BUILD_VERSION: &str = env!("CARGO_PKG_VERSION");
const DEFAULT_CNI_VERSION: &str = "0.4.0";

fn read_stdin() -> Result<Vec<u8>, EngineError> {
    let mut buf = Vec::new();
    std::io::stdin()
        .read_to_end(&mut buf)
        .map_err(|e| EngineError::new(ErrorKind::ConfigInvalid, format!("failed to read stdin: {}", e)))?;
    Ok(buf)
}

fn invocation_from_env() -> Invocation {
    let var = |name: &str| std::env::var(name).unwrap_or_default();
    Invocation {
        container_id: var("CNI_CONTAINERID"),
        target_ns_path: var("CNI_NETNS"),
        container_if_name: var("CNI_IFNAME"),
        cni_args_raw: var("CNI_ARGS"),
        cni_path: var("CNI_PATH"),
    }
}

/// cniVersion for the stderr error envelope, recovered best-effort from
/// whatever stdin bytes we had on hand — a parse failure (e.g. the config
/// itself is what's malformed) falls back to a fixed default rather than
/// omitting the field (spec §6).
fn best_effort_cni_version(stdin: &[u8]) -> String {
    NetConf::parse(stdin)
        .map(|conf| conf.cni_version)
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| DEFAULT_CNI_VERSION.to_string())
}

/// Runs the requested command, returning the best-known cniVersion
/// alongside any failure so the caller can print an accurate stderr
/// envelope.
fn run() -> Result<(), (EngineError, String)> {
    let command = std::env::var("CNI_COMMAND").map_err(|_| {
        (
            EngineError::new(ErrorKind::ConfigInvalid, "CNI_COMMAND is not set"),
            DEFAULT_CNI_VERSION.to_string(),
        )
    })?;

    let netlink = RealNetlink::new();
    let rdma = RealRdma::new();
    let engine = Engine::new(&netlink, &rdma);
    let invocation = invocation_from_env();

    match command.as_str() {
        "ADD" => {
            let stdin = read_stdin().map_err(|e| (e, DEFAULT_CNI_VERSION.to_string()))?;
            let cni_version = best_effort_cni_version(&stdin);
            log::debug!("ADD {} {}", invocation.container_id, invocation.container_if_name);
            let result = engine.add(&invocation, &stdin).map_err(|e| (e, cni_version.clone()))?;
            log::info!("ADD succeeded for {}", invocation.container_id);
            result.print();
            Ok(())
        }
        "DEL" => {
            let stdin = read_stdin().map_err(|e| (e, DEFAULT_CNI_VERSION.to_string()))?;
            let cni_version = best_effort_cni_version(&stdin);
            log::debug!("DEL {} {}", invocation.container_id, invocation.container_if_name);
            engine.delete(&invocation, &stdin).map_err(|e| (e, cni_version))?;
            log::info!("DEL succeeded for {}", invocation.container_id);
            Ok(())
        }
        "CHECK" => engine
            .check()
            .map_err(|e| (e, DEFAULT_CNI_VERSION.to_string())),
        "VERSION" => {
            println!(r#"{{"cniVersion":"0.4.0","supportedVersions":["0.3.0","0.3.1","0.4.0"]}}"#);
            Ok(())
        }
        other => Err((
            EngineError::new(ErrorKind::ConfigInvalid, format!("unsupported CNI_COMMAND {:?}", other)),
            DEFAULT_CNI_VERSION.to_string(),
        )),
    }
}

fn main() -> ExitCode {
    let matches = App::new("ib-sriov-cni")
        .version(BUILD_VERSION)
        .about("CNI plugin attaching an InfiniBand SR-IOV VF to a container network namespace")
        .arg(Arg::with_name("version").short("v").long("version").help("Print version and exit"))
        .get_matches();
    if matches.is_present("version") {
        println!("ib-sriov-cni {}", BUILD_VERSION);
        return ExitCode::SUCCESS;
    }

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(e) = lock::install_signal_handlers() {
        log::warn!("failed to install signal handlers: {}", e);
    }

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err((err, cni_version)) => {
            log::warn!("{} failed: {}", std::env::var("CNI_COMMAND").unwrap_or_default(), err);
            CniError::from_engine_error(&cni_version, &err).print();
            ExitCode::FAILURE
        }
    }
}
