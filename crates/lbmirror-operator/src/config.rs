//! Command line and cluster connection configuration
//!
//! Each cluster is named on the command line by a reference:
//!
//! - `INCLUSTER`: the service account of the pod lbmirror runs in
//! - `OUTCLUSTER`: the destination cluster as seen from inside a VM. The API
//!   server address comes from `OUTER_KUBERNETES_SERVICE_HOST` and
//!   `OUTER_KUBERNETES_SERVICE_PORT`, and the service account token, CA
//!   bundle and namespace are mounted under `/outer-serviceaccount/`
//! - anything else: a context of the default kubeconfig

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use clap::{Args, Parser, Subcommand};
use kube::config::Kubeconfig;

use lbmirror_common::kube_utils::{
    connect_context, connect_in_cluster, connect_kubeconfig, ClusterConnection,
};
use lbmirror_common::telemetry::LogFormat;
use lbmirror_common::Error;

use crate::queue::DEFAULT_CONCURRENCY;

/// Cluster reference for the in-cluster service account
pub const IN_CLUSTER: &str = "INCLUSTER";
/// Cluster reference for the outer cluster reached from a VM
pub const OUT_CLUSTER: &str = "OUTCLUSTER";

/// Environment variable holding the outer API server host
pub const OUTER_SERVICE_HOST_ENV: &str = "OUTER_KUBERNETES_SERVICE_HOST";
/// Environment variable holding the outer API server port
pub const OUTER_SERVICE_PORT_ENV: &str = "OUTER_KUBERNETES_SERVICE_PORT";
/// Mount point of the outer service account files
pub const OUTER_SERVICE_ACCOUNT_DIR: &str = "/outer-serviceaccount";

/// Mirror LoadBalancer Services from one cluster into another
#[derive(Parser, Debug)]
#[command(name = "lbmirror", version, about, long_about = None)]
pub struct Cli {
    /// Print the MirroredService CRD and exit
    #[arg(long)]
    pub crd: bool,

    /// Log line format: text or json
    #[arg(long, global = true, env = "LBMIRROR_LOG_FORMAT", default_value = "text")]
    pub log_format: LogFormat,

    /// Loop or command to run
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Mirror LoadBalancer Services of SOURCE into MirroredServices in DESTINATION
    Inner(InnerArgs),

    /// Materialize the MirroredServices of CLUSTER as LoadBalancer Services
    Outer(OuterArgs),

    /// Publish a kubeconfig file to DESTINATION as the `config` Secret
    PublishConfig(PublishArgs),
}

/// Arguments of the inner loop
#[derive(Args, Debug)]
pub struct InnerArgs {
    /// Cluster whose Services are mirrored
    #[arg(env = "LBMIRROR_SOURCE")]
    pub source: ClusterRef,

    /// Cluster that receives the MirroredServices
    #[arg(env = "LBMIRROR_DESTINATION")]
    pub destination: ClusterRef,

    /// Name recorded on mirrors to identify the source cluster
    /// (defaults to the source reference)
    #[arg(long, env = "LBMIRROR_CLUSTER_NAME")]
    pub cluster_name: Option<String>,

    /// Maximum number of Services reconciled at the same time
    #[arg(long, env = "LBMIRROR_CONCURRENCY", default_value_t = DEFAULT_CONCURRENCY)]
    pub concurrency: usize,
}

impl InnerArgs {
    /// Source cluster name to record on mirrors
    pub fn cluster_name(&self) -> String {
        self.cluster_name
            .clone()
            .unwrap_or_else(|| self.source.to_string())
    }
}

/// Arguments of the outer loop
#[derive(Args, Debug)]
pub struct OuterArgs {
    /// Cluster holding the MirroredServices
    #[arg(env = "LBMIRROR_CLUSTER")]
    pub cluster: ClusterRef,

    /// Maximum number of MirroredServices reconciled at the same time
    #[arg(long, env = "LBMIRROR_CONCURRENCY", default_value_t = DEFAULT_CONCURRENCY)]
    pub concurrency: usize,
}

/// Arguments of `publish-config`
#[derive(Args, Debug)]
pub struct PublishArgs {
    /// Cluster that receives the Secret
    pub destination: ClusterRef,

    /// Kubeconfig file to publish
    pub config_path: PathBuf,
}

/// Where to find a cluster
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClusterRef {
    /// In-cluster service account
    InCluster,
    /// Outer cluster reached from inside a VM
    OutCluster,
    /// Named context of the default kubeconfig
    Context(String),
}

impl FromStr for ClusterRef {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            IN_CLUSTER => Ok(ClusterRef::InCluster),
            OUT_CLUSTER => Ok(ClusterRef::OutCluster),
            "" => Err(Error::config("", "cluster reference must not be empty")),
            context => Ok(ClusterRef::Context(context.to_string())),
        }
    }
}

impl fmt::Display for ClusterRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterRef::InCluster => f.write_str(IN_CLUSTER),
            ClusterRef::OutCluster => f.write_str(OUT_CLUSTER),
            ClusterRef::Context(name) => f.write_str(name),
        }
    }
}

/// Access to the process environment
///
/// Reading through a trait keeps global state out of unit tests.
#[cfg_attr(test, mockall::automock)]
pub trait EnvConfig: Send + Sync {
    /// Outer API server host
    fn outer_service_host(&self) -> Option<String>;

    /// Outer API server port
    fn outer_service_port(&self) -> Option<String>;

    /// Directory holding the outer service account's token, ca.crt and namespace
    fn outer_service_account_dir(&self) -> PathBuf;
}

/// Reads the real process environment
#[derive(Clone, Default)]
pub struct OsEnvConfig;

impl EnvConfig for OsEnvConfig {
    fn outer_service_host(&self) -> Option<String> {
        std::env::var(OUTER_SERVICE_HOST_ENV).ok()
    }

    fn outer_service_port(&self) -> Option<String> {
        std::env::var(OUTER_SERVICE_PORT_ENV).ok()
    }

    fn outer_service_account_dir(&self) -> PathBuf {
        PathBuf::from(OUTER_SERVICE_ACCOUNT_DIR)
    }
}

/// Build the kubeconfig for the outer cluster from the environment
pub fn outer_kubeconfig(env: &dyn EnvConfig) -> Result<Kubeconfig, Error> {
    let host = env
        .outer_service_host()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| Error::config(OUT_CLUSTER, format!("{OUTER_SERVICE_HOST_ENV} is not set")))?;
    let port = env
        .outer_service_port()
        .filter(|p| !p.is_empty())
        .ok_or_else(|| Error::config(OUT_CLUSTER, format!("{OUTER_SERVICE_PORT_ENV} is not set")))?;

    let dir = env.outer_service_account_dir();
    let namespace_path = dir.join("namespace");
    let namespace = std::fs::read_to_string(&namespace_path).map_err(|e| {
        Error::config(
            OUT_CLUSTER,
            format!("failed to read {}: {}", namespace_path.display(), e),
        )
    })?;

    let kubeconfig = serde_json::json!({
        "apiVersion": "v1",
        "kind": "Config",
        "clusters": [{
            "name": "outer",
            "cluster": {
                "server": server_url(&host, &port),
                "certificate-authority": dir.join("ca.crt").to_string_lossy(),
            },
        }],
        "users": [{
            "name": "outer",
            "user": {
                "tokenFile": dir.join("token").to_string_lossy(),
            },
        }],
        "contexts": [{
            "name": "outer",
            "context": {
                "cluster": "outer",
                "user": "outer",
                "namespace": namespace.trim(),
            },
        }],
        "current-context": "outer",
    });

    serde_json::from_value(kubeconfig)
        .map_err(|e| Error::config(OUT_CLUSTER, format!("invalid kubeconfig: {}", e)))
}

/// API server URL for a host and port, bracketing IPv6 literals
fn server_url(host: &str, port: &str) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("https://[{}]:{}", host, port)
    } else {
        format!("https://{}:{}", host, port)
    }
}

/// Connect to the cluster a reference names
pub async fn resolve(cluster: &ClusterRef, env: &dyn EnvConfig) -> Result<ClusterConnection, Error> {
    match cluster {
        ClusterRef::InCluster => connect_in_cluster(IN_CLUSTER),
        ClusterRef::OutCluster => connect_kubeconfig(OUT_CLUSTER, outer_kubeconfig(env)?).await,
        ClusterRef::Context(context) => connect_context(context).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn service_account_dir(namespace: &str) -> tempfile::TempDir {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("namespace"), format!("{namespace}\n")).unwrap();
        fs::write(dir.path().join("token"), "token").unwrap();
        fs::write(dir.path().join("ca.crt"), "ca").unwrap();
        dir
    }

    fn env(host: Option<&str>, port: Option<&str>, dir: PathBuf) -> MockEnvConfig {
        let host = host.map(str::to_string);
        let port = port.map(str::to_string);
        let mut env = MockEnvConfig::new();
        env.expect_outer_service_host().returning(move || host.clone());
        env.expect_outer_service_port().returning(move || port.clone());
        env.expect_outer_service_account_dir()
            .returning(move || dir.clone());
        env
    }

    // =========================================================================
    // Cluster references
    // =========================================================================

    #[test]
    fn cluster_references_parse() {
        assert_eq!("INCLUSTER".parse::<ClusterRef>().unwrap(), ClusterRef::InCluster);
        assert_eq!("OUTCLUSTER".parse::<ClusterRef>().unwrap(), ClusterRef::OutCluster);
        assert_eq!(
            "kind-edge".parse::<ClusterRef>().unwrap(),
            ClusterRef::Context("kind-edge".to_string())
        );
        assert!("".parse::<ClusterRef>().is_err());
    }

    #[test]
    fn cluster_references_are_case_sensitive() {
        assert_eq!(
            "incluster".parse::<ClusterRef>().unwrap(),
            ClusterRef::Context("incluster".to_string())
        );
    }

    #[test]
    fn cluster_references_display_as_given() {
        for s in ["INCLUSTER", "OUTCLUSTER", "prod-east"] {
            assert_eq!(s.parse::<ClusterRef>().unwrap().to_string(), s);
        }
    }

    // =========================================================================
    // Outer cluster kubeconfig
    // =========================================================================

    #[test]
    fn outer_kubeconfig_uses_mounted_service_account() {
        let dir = service_account_dir("vms");
        let config =
            outer_kubeconfig(&env(Some("10.0.0.1"), Some("6443"), dir.path().into())).unwrap();

        let cluster = config.clusters[0].cluster.as_ref().unwrap();
        assert_eq!(cluster.server.as_deref(), Some("https://10.0.0.1:6443"));
        assert_eq!(
            cluster.certificate_authority.as_deref(),
            Some(dir.path().join("ca.crt").to_str().unwrap())
        );

        let user = config.auth_infos[0].auth_info.as_ref().unwrap();
        assert_eq!(
            user.token_file.as_deref(),
            Some(dir.path().join("token").to_str().unwrap())
        );

        let context = config.contexts[0].context.as_ref().unwrap();
        assert_eq!(context.namespace.as_deref(), Some("vms"));
        assert_eq!(config.current_context.as_deref(), Some("outer"));
    }

    #[test]
    fn outer_kubeconfig_brackets_ipv6_hosts() {
        let dir = service_account_dir("default");
        let config =
            outer_kubeconfig(&env(Some("fd00::1"), Some("443"), dir.path().into())).unwrap();
        assert_eq!(
            config.clusters[0].cluster.as_ref().unwrap().server.as_deref(),
            Some("https://[fd00::1]:443")
        );
    }

    #[test]
    fn outer_kubeconfig_requires_host_and_port() {
        let dir = service_account_dir("default");

        let err = outer_kubeconfig(&env(None, Some("443"), dir.path().into())).unwrap_err();
        assert!(err.to_string().contains(OUTER_SERVICE_HOST_ENV));

        let err = outer_kubeconfig(&env(Some("10.0.0.1"), None, dir.path().into())).unwrap_err();
        assert!(err.to_string().contains(OUTER_SERVICE_PORT_ENV));
    }

    #[test]
    fn outer_kubeconfig_requires_namespace_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = outer_kubeconfig(&env(Some("10.0.0.1"), Some("443"), dir.path().into()))
            .unwrap_err();
        assert!(matches!(err, Error::Config { ref cluster, .. } if cluster == OUT_CLUSTER));
    }

    // =========================================================================
    // Command line
    // =========================================================================

    #[test]
    fn inner_command_parses() {
        let cli = Cli::try_parse_from([
            "lbmirror",
            "inner",
            "INCLUSTER",
            "OUTCLUSTER",
            "--cluster-name",
            "vm-cluster-1",
            "--concurrency",
            "4",
        ])
        .unwrap();
        let Some(Command::Inner(args)) = cli.command else {
            panic!("expected inner command");
        };
        assert_eq!(args.source, ClusterRef::InCluster);
        assert_eq!(args.destination, ClusterRef::OutCluster);
        assert_eq!(args.cluster_name(), "vm-cluster-1");
        assert_eq!(args.concurrency, 4);
    }

    #[test]
    fn cluster_name_defaults_to_source_reference() {
        let cli = Cli::try_parse_from(["lbmirror", "inner", "edge", "core"]).unwrap();
        let Some(Command::Inner(args)) = cli.command else {
            panic!("expected inner command");
        };
        assert_eq!(args.cluster_name(), "edge");
        assert_eq!(args.concurrency, DEFAULT_CONCURRENCY);
    }

    #[test]
    fn outer_and_publish_commands_parse() {
        let cli = Cli::try_parse_from(["lbmirror", "--log-format", "json", "outer", "INCLUSTER"])
            .unwrap();
        assert_eq!(cli.log_format, LogFormat::Json);
        assert!(matches!(
            cli.command,
            Some(Command::Outer(OuterArgs { cluster: ClusterRef::InCluster, .. }))
        ));

        let cli = Cli::try_parse_from([
            "lbmirror",
            "publish-config",
            "OUTCLUSTER",
            "/etc/kubernetes/admin.conf",
        ])
        .unwrap();
        let Some(Command::PublishConfig(args)) = cli.command else {
            panic!("expected publish-config command");
        };
        assert_eq!(args.destination, ClusterRef::OutCluster);
        assert_eq!(args.config_path, PathBuf::from("/etc/kubernetes/admin.conf"));
    }

    #[test]
    fn crd_flag_needs_no_subcommand() {
        let cli = Cli::try_parse_from(["lbmirror", "--crd"]).unwrap();
        assert!(cli.crd);
        assert!(cli.command.is_none());
    }

    #[test]
    fn unknown_log_format_is_rejected() {
        assert!(Cli::try_parse_from(["lbmirror", "--log-format", "xml", "--crd"]).is_err());
    }
}
