//! Error taxonomy for the engine (spec §7). Each leaf error carries enough
//! context to log a useful message; [`EngineError`] is the union the
//! Orchestrator deals in, tagged with the [`ErrorKind`] that selects the
//! CNI stderr JSON `code`.

use snafu::Snafu;
use std::path::PathBuf;

/// The wire-visible error category (spec §7). Numeric values are this
/// plugin's own scheme layered on top of the generic CNI error envelope;
/// the CNI spec itself only requires a numeric `code` and human `msg`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ConfigInvalid,
    ProbeFailure,
    SystemPrerequisite,
    NamespaceUnavailable,
    NetlinkFailure,
    RdmaTopology,
    DriverRebindFailure,
    IpamDelegateFailure,
    CacheIo,
    LockUnavailable,
}

impl ErrorKind {
    pub fn name(&self) -> &'static str {
        match self {
            ErrorKind::ConfigInvalid => "ConfigInvalid",
            ErrorKind::ProbeFailure => "ProbeFailure",
            ErrorKind::SystemPrerequisite => "SystemPrerequisite",
            ErrorKind::NamespaceUnavailable => "NamespaceUnavailable",
            ErrorKind::NetlinkFailure => "NetlinkFailure",
            ErrorKind::RdmaTopology => "RdmaTopology",
            ErrorKind::DriverRebindFailure => "DriverRebindFailure",
            ErrorKind::IpamDelegateFailure => "IpamDelegateFailure",
            ErrorKind::CacheIo => "CacheIo",
            ErrorKind::LockUnavailable => "LockUnavailable",
        }
    }
}

impl ErrorKind {
    pub fn code(&self) -> u32 {
        match self {
            ErrorKind::ConfigInvalid => 100,
            ErrorKind::ProbeFailure => 101,
            ErrorKind::SystemPrerequisite => 102,
            ErrorKind::NamespaceUnavailable => 103,
            ErrorKind::NetlinkFailure => 104,
            ErrorKind::RdmaTopology => 105,
            ErrorKind::DriverRebindFailure => 106,
            ErrorKind::IpamDelegateFailure => 107,
            ErrorKind::CacheIo => 108,
            ErrorKind::LockUnavailable => 109,
        }
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility = "pub(crate)")]
pub enum ConfigError {
    #[snafu(display("{}", message))]
    Invalid { message: String },
    #[snafu(display("failed to parse stdin config: {}", source))]
    Json { source: serde_json::Error },
}

#[derive(Debug, Snafu)]
#[snafu(visibility = "pub(crate)")]
pub enum ProbeError {
    #[snafu(display("sysfs read failed at {}: {}", path.display(), source))]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("no PF found for VF {}", vf_pci))]
    NoPf { vf_pci: String },
    #[snafu(display("VF {} not found under PF {}", vf_pci, pf_name))]
    VfNotFound { vf_pci: String, pf_name: String },
}

#[derive(Debug, Snafu)]
#[snafu(visibility = "pub(crate)")]
pub enum NetlinkError {
    #[snafu(display("netlink link lookup failed for {}: {}", name, reason))]
    LinkLookup { name: String, reason: String },
    #[snafu(display("netlink operation {} failed on {}: {}", op, name, reason))]
    Operation {
        op: String,
        name: String,
        reason: String,
    },
}

#[derive(Debug, Snafu)]
#[snafu(visibility = "pub(crate)")]
pub enum RdmaError {
    #[snafu(display("failed to read RDMA subsystem mode: {}", reason))]
    ModeQuery { reason: String },
    #[snafu(display(
        "expected exactly one RDMA device for PCI device {}, found {}",
        pci,
        count
    ))]
    Topology { pci: String, count: usize },
    #[snafu(display("failed to move RDMA device {}: {}", name, reason))]
    Move { name: String, reason: String },
}

#[derive(Debug, Snafu)]
#[snafu(visibility = "pub(crate)")]
pub enum CacheError {
    #[snafu(display("failed to create cache dir {}: {}", path.display(), source))]
    CreateCacheDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to write cache file {}: {}", path.display(), source))]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to read cache file {}: {}", path.display(), source))]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to remove cache file {}: {}", path.display(), source))]
    Remove {
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to parse cached attachment {}: {}", path.display(), source))]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

#[derive(Debug, Snafu)]
#[snafu(visibility = "pub(crate)")]
pub enum DriverRebindError {
    #[snafu(display("failed to unbind {} from driver {}: {}", vf_pci, driver, source))]
    Unbind {
        vf_pci: String,
        driver: String,
        source: std::io::Error,
    },
    #[snafu(display("failed to bind {} to driver {}: {}", vf_pci, driver, source))]
    Bind {
        vf_pci: String,
        driver: String,
        source: std::io::Error,
    },
}

#[derive(Debug, Snafu)]
#[snafu(visibility = "pub(crate)")]
pub enum IpamError {
    #[snafu(display("no IPAM plugin binary {} found on CNI_PATH", plugin))]
    PluginNotFound { plugin: String },
    #[snafu(display("failed to exec IPAM plugin {}: {}", plugin, source))]
    Exec {
        plugin: String,
        source: std::io::Error,
    },
    #[snafu(display("IPAM plugin {} exited with status {}: {}", plugin, status, stderr))]
    NonZeroExit {
        plugin: String,
        status: i32,
        stderr: String,
    },
    #[snafu(display("failed to parse IPAM plugin {} result: {}", plugin, source))]
    ParseResult {
        plugin: String,
        source: serde_json::Error,
    },
    #[snafu(display("IPAM plugin returned no IP configuration"))]
    NoAddresses,
}

#[derive(Debug, Snafu)]
#[snafu(visibility = "pub(crate)")]
pub enum NamespaceError {
    #[snafu(display("network namespace operation failed on {}: {}", path, source))]
    Namespace { path: String, source: std::io::Error },
    #[snafu(display("setns failed entering {}: {}", path, source))]
    SetNs { path: String, source: nix::Error },
}

#[derive(Debug, Snafu)]
#[snafu(visibility = "pub(crate)")]
pub enum LockError {
    #[snafu(display("failed to create lock dir {}: {}", path.display(), source))]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to acquire lock {}: {}", path.display(), source))]
    Acquire {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Top-level error the Orchestrator propagates, carrying the [`ErrorKind`]
/// used to build the CNI stderr JSON.
#[derive(Debug)]
pub struct EngineError {
    pub kind: ErrorKind,
    pub message: String,
}

impl EngineError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> EngineError {
        EngineError {
            kind,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for EngineError {}

macro_rules! impl_from_with_kind {
    ($err:ty, $kind:expr) => {
        impl From<$err> for EngineError {
            fn from(source: $err) -> EngineError {
                EngineError::new($kind, source.to_string())
            }
        }
    };
}

impl_from_with_kind!(ConfigError, ErrorKind::ConfigInvalid);
impl_from_with_kind!(ProbeError, ErrorKind::ProbeFailure);
impl_from_with_kind!(NetlinkError, ErrorKind::NetlinkFailure);
impl_from_with_kind!(CacheError, ErrorKind::CacheIo);
impl_from_with_kind!(LockError, ErrorKind::LockUnavailable);
impl_from_with_kind!(NamespaceError, ErrorKind::NamespaceUnavailable);
impl_from_with_kind!(DriverRebindError, ErrorKind::DriverRebindFailure);
impl_from_with_kind!(IpamError, ErrorKind::IpamDelegateFailure);

impl From<RdmaError> for EngineError {
    fn from(source: RdmaError) -> EngineError {
        let kind = match &source {
            RdmaError::ModeQuery { .. } => ErrorKind::SystemPrerequisite,
            RdmaError::Topology { .. } => ErrorKind::RdmaTopology,
            RdmaError::Move { .. } => ErrorKind::NetlinkFailure,
        };
        EngineError::new(kind, source.to_string())
    }
}
