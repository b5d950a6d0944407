use crate::error::{Result, StoreError};
use k8s_openapi::ByteString;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Mount point of the pod's service account credentials
pub const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

/// Sustained API requests per second when nothing else is configured
pub const DEFAULT_QPS: f32 = 5.0;

/// Requests allowed in a burst above [`DEFAULT_QPS`]
pub const DEFAULT_BURST: u32 = 10;

/// How requests authenticate to the API server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    Anonymous,
    /// Fixed bearer token
    Token(String),
    /// Bearer token read from a file on every request, so a rotated
    /// service account token is picked up without a restart
    TokenFile(PathBuf),
}

/// Connection settings for [`HttpStore`](crate::HttpStore)
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Base URL of the API server
    pub server: String,
    pub credentials: Credentials,
    /// Additional trusted root certificate, PEM encoded
    pub root_ca: Option<Vec<u8>>,
    pub insecure_skip_tls_verify: bool,
    /// Sustained requests per second; zero or less disables client-side limiting
    pub qps: f32,
    pub burst: u32,
}

impl ApiConfig {
    /// Unauthenticated plain connection, as used against a local proxy
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            credentials: Credentials::Anonymous,
            root_ca: None,
            insecure_skip_tls_verify: false,
            qps: DEFAULT_QPS,
            burst: DEFAULT_BURST,
        }
    }

    /// Settings of the pod this process runs in: the service host from the
    /// environment, the mounted service account token and cluster CA
    pub fn in_cluster() -> Result<Self> {
        Self::in_cluster_from(
            std::env::var("KUBERNETES_SERVICE_HOST").ok(),
            std::env::var("KUBERNETES_SERVICE_PORT").ok(),
            Path::new(SERVICE_ACCOUNT_DIR),
        )
    }

    fn in_cluster_from(
        host: Option<String>,
        port: Option<String>,
        account_dir: &Path,
    ) -> Result<Self> {
        let host = host
            .filter(|h| !h.is_empty())
            .ok_or_else(|| StoreError::config("KUBERNETES_SERVICE_HOST is not set"))?;
        let port = port
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| "443".to_string());
        let host = if host.contains(':') {
            format!("[{}]", host)
        } else {
            host
        };

        let token_file = account_dir.join("token");
        if !token_file.is_file() {
            return Err(StoreError::config(format!(
                "service account token {} does not exist",
                token_file.display()
            )));
        }
        let ca_file = account_dir.join("ca.crt");
        let root_ca = std::fs::read(&ca_file).map_err(|e| {
            StoreError::config(format!("failed to read {}: {}", ca_file.display(), e))
        })?;

        Ok(Self {
            credentials: Credentials::TokenFile(token_file),
            root_ca: Some(root_ca),
            ..Self::new(format!("https://{}:{}", host, port))
        })
    }

    /// Settings of a kubeconfig file's context (the current one when `context` is `None`)
    pub fn from_kubeconfig(path: &Path, context: Option<&str>) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            StoreError::config(format!("failed to read kubeconfig {}: {}", path.display(), e))
        })?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        Self::from_kubeconfig_str(&contents, base_dir, context)
    }

    /// Relative file references resolve against `base_dir`
    fn from_kubeconfig_str(contents: &str, base_dir: &Path, context: Option<&str>) -> Result<Self> {
        let kubeconfig: Kubeconfig = serde_yaml::from_str(contents)
            .map_err(|e| StoreError::config(format!("invalid kubeconfig: {}", e)))?;

        let context_name = context
            .map(str::to_string)
            .or(kubeconfig.current_context)
            .filter(|c| !c.is_empty())
            .ok_or_else(|| StoreError::config("kubeconfig has no current-context"))?;
        let context = kubeconfig
            .contexts
            .into_iter()
            .find(|c| c.name == context_name)
            .map(|c| c.context)
            .ok_or_else(|| {
                StoreError::config(format!("context '{}' not found in kubeconfig", context_name))
            })?;
        let cluster = kubeconfig
            .clusters
            .into_iter()
            .find(|c| c.name == context.cluster)
            .map(|c| c.cluster)
            .ok_or_else(|| {
                StoreError::config(format!("cluster '{}' not found in kubeconfig", context.cluster))
            })?;
        let user = match &context.user {
            Some(name) => kubeconfig
                .users
                .into_iter()
                .find(|u| &u.name == name)
                .map(|u| u.user)
                .ok_or_else(|| {
                    StoreError::config(format!("user '{}' not found in kubeconfig", name))
                })?,
            None => UserEntry::default(),
        };

        let root_ca = match (cluster.certificate_authority_data, cluster.certificate_authority) {
            (Some(data), _) => Some(data.0),
            (None, Some(file)) => {
                let file = base_dir.join(file);
                Some(std::fs::read(&file).map_err(|e| {
                    StoreError::config(format!("failed to read {}: {}", file.display(), e))
                })?)
            }
            (None, None) => None,
        };

        Ok(Self {
            credentials: user.credentials(base_dir)?,
            root_ca,
            insecure_skip_tls_verify: cluster.insecure_skip_tls_verify,
            ..Self::new(cluster.server)
        })
    }

    pub fn with_rate_limit(mut self, qps: f32, burst: u32) -> Self {
        self.qps = qps;
        self.burst = burst;
        self
    }
}

#[derive(Debug, Deserialize)]
struct Kubeconfig {
    #[serde(rename = "current-context", default)]
    current_context: Option<String>,
    #[serde(default)]
    clusters: Vec<NamedCluster>,
    #[serde(default)]
    contexts: Vec<NamedContext>,
    #[serde(default)]
    users: Vec<NamedUser>,
}

#[derive(Debug, Deserialize)]
struct NamedCluster {
    name: String,
    cluster: ClusterEntry,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct ClusterEntry {
    server: String,
    #[serde(default)]
    certificate_authority: Option<PathBuf>,
    #[serde(default)]
    certificate_authority_data: Option<ByteString>,
    #[serde(default)]
    insecure_skip_tls_verify: bool,
}

#[derive(Debug, Deserialize)]
struct NamedContext {
    name: String,
    context: ContextEntry,
}

#[derive(Debug, Deserialize)]
struct ContextEntry {
    cluster: String,
    #[serde(default)]
    user: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NamedUser {
    name: String,
    #[serde(default)]
    user: UserEntry,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct UserEntry {
    #[serde(default)]
    token: Option<String>,
    #[serde(rename = "tokenFile", default)]
    token_file: Option<PathBuf>,
    #[serde(default)]
    client_certificate: Option<PathBuf>,
    #[serde(default)]
    client_certificate_data: Option<String>,
    #[serde(default)]
    exec: Option<serde_yaml::Value>,
    #[serde(default)]
    auth_provider: Option<serde_yaml::Value>,
}

impl UserEntry {
    fn credentials(self, base_dir: &Path) -> Result<Credentials> {
        if let Some(token) = self.token.filter(|t| !t.is_empty()) {
            return Ok(Credentials::Token(token));
        }
        if let Some(file) = self.token_file {
            return Ok(Credentials::TokenFile(base_dir.join(file)));
        }
        if self.client_certificate.is_some() || self.client_certificate_data.is_some() {
            return Err(StoreError::config(
                "client certificate users are not supported, use a token user",
            ));
        }
        if self.exec.is_some() || self.auth_provider.is_some() {
            return Err(StoreError::config(
                "exec and auth-provider users are not supported, use a token user",
            ));
        }
        Ok(Credentials::Anonymous)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KUBECONFIG: &str = r#"
apiVersion: v1
kind: Config
current-context: prod
clusters:
  - name: prod-cluster
    cluster:
      server: https://10.0.0.1:6443
      certificate-authority-data: LS0tLS1CRUdJTg==
  - name: lab-cluster
    cluster:
      server: https://lab.example:6443
      certificate-authority: certs/lab-ca.crt
      insecure-skip-tls-verify: true
contexts:
  - name: prod
    context:
      cluster: prod-cluster
      user: resizer
  - name: lab
    context:
      cluster: lab-cluster
      user: lab-user
  - name: cert-user
    context:
      cluster: prod-cluster
      user: admin
users:
  - name: resizer
    user:
      token: abc123
  - name: lab-user
    user:
      tokenFile: tokens/lab
  - name: admin
    user:
      client-certificate-data: LS0tLS1CRUdJTg==
      client-key-data: LS0tLS1CRUdJTg==
"#;

    #[test]
    fn test_kubeconfig_current_context() {
        let config = ApiConfig::from_kubeconfig_str(KUBECONFIG, Path::new("/etc/kube"), None).unwrap();
        assert_eq!(config.server, "https://10.0.0.1:6443");
        assert_eq!(config.credentials, Credentials::Token("abc123".to_string()));
        assert_eq!(config.root_ca.as_deref(), Some(b"-----BEGIN".as_slice()));
        assert!(!config.insecure_skip_tls_verify);
        assert_eq!(config.qps, DEFAULT_QPS);
        assert_eq!(config.burst, DEFAULT_BURST);
    }

    #[test]
    fn test_kubeconfig_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("certs")).unwrap();
        std::fs::write(dir.path().join("certs/lab-ca.crt"), "lab ca").unwrap();

        let config = ApiConfig::from_kubeconfig_str(KUBECONFIG, dir.path(), Some("lab")).unwrap();
        assert_eq!(config.server, "https://lab.example:6443");
        assert_eq!(config.root_ca.as_deref(), Some(b"lab ca".as_slice()));
        assert!(config.insecure_skip_tls_verify);
        assert_eq!(
            config.credentials,
            Credentials::TokenFile(dir.path().join("tokens/lab"))
        );
    }

    #[test]
    fn test_kubeconfig_rejects_unusable_contexts() {
        let base = Path::new("/etc/kube");
        let err = ApiConfig::from_kubeconfig_str(KUBECONFIG, base, Some("cert-user")).unwrap_err();
        assert!(matches!(err, StoreError::Config { .. }));
        assert!(err.to_string().contains("client certificate"));

        let err = ApiConfig::from_kubeconfig_str(KUBECONFIG, base, Some("missing")).unwrap_err();
        assert!(err.to_string().contains("context 'missing' not found"));

        assert!(ApiConfig::from_kubeconfig_str("clusters: [", base, None).is_err());
        assert!(ApiConfig::from_kubeconfig_str("clusters: []", base, None).is_err());
    }

    #[test]
    fn test_in_cluster() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("token"), "sa-token\n").unwrap();
        std::fs::write(dir.path().join("ca.crt"), "cluster ca").unwrap();

        let config =
            ApiConfig::in_cluster_from(Some("10.96.0.1".to_string()), None, dir.path()).unwrap();
        assert_eq!(config.server, "https://10.96.0.1:443");
        assert_eq!(
            config.credentials,
            Credentials::TokenFile(dir.path().join("token"))
        );
        assert_eq!(config.root_ca.as_deref(), Some(b"cluster ca".as_slice()));

        let config = ApiConfig::in_cluster_from(
            Some("fd00::1".to_string()),
            Some("6443".to_string()),
            dir.path(),
        )
        .unwrap();
        assert_eq!(config.server, "https://[fd00::1]:6443");
    }

    #[test]
    fn test_in_cluster_requires_environment_and_token() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ApiConfig::in_cluster_from(None, None, dir.path()).is_err());
        // Host set but nothing mounted
        let err = ApiConfig::in_cluster_from(Some("10.96.0.1".to_string()), None, dir.path())
            .unwrap_err();
        assert!(err.to_string().contains("token"));
    }
}
