// Cluster registration: tokens, agent commands and the import manifest

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetSpec, Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, EnvVar, Namespace, PodSpec, PodTemplateSpec, Secret, SecretVolumeSource, SecurityContext,
    ServiceAccount, Toleration, Volume, VolumeMount,
};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::ByteString;
use md5::Md5;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

use crate::controller::{Action, ErrorClass, Reconciler};
use crate::dialer::tunnel::{index_registration_tokens, BY_TOKEN_INDEX};
use crate::error::ApiError;
use crate::models::cluster::{ClusterRegistrationToken, ClusterRegistrationTokenStatus};
use crate::models::meta::split_key;
use crate::settings::{Settings, AGENT_IMAGE, AUTH_IMAGE, CA_CERTS, SERVER_URL, SYSTEM_DEFAULT_REGISTRY};
use crate::store::{SharedStore, StoreError};

pub const IMPORT_PATH: &str = "/v3/import";
const TOKEN_LEN: usize = 54;
const AGENT_NAMESPACE: &str = "cattle-system";
const AGENT_SERVICE_ACCOUNT: &str = "cattle";
const SERVER_URL_RETRY: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("invalid registration token")]
    InvalidToken,

    #[error("failed to render import manifest: {0}")]
    Render(#[from] serde_yaml::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<RegistrationError> for ApiError {
    fn from(e: RegistrationError) -> Self {
        match e {
            RegistrationError::InvalidToken => ApiError::NotFound(e.to_string()),
            RegistrationError::Store(e) => e.into(),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, RegistrationError>;

impl ErrorClass for RegistrationError {
    fn is_forget(&self) -> bool {
        false
    }
}

/// First seven hex characters of the token's md5.
pub fn token_key(token: &str) -> String {
    hex::encode(Md5::digest(token.as_bytes()))[..7].to_string()
}

/// sha256 of the configured CA bundle, newline terminated; empty when unset.
pub fn ca_checksum(ca_certs: &str) -> String {
    if ca_certs.is_empty() {
        return String::new();
    }
    let mut ca = ca_certs.to_string();
    if !ca.ends_with('\n') {
        ca.push('\n');
    }
    hex::encode(Sha256::digest(ca.as_bytes()))
}

/// `server-url` without its path, or the request origin when unset.
pub fn root_url(server_url: &str, origin: &str) -> String {
    if server_url.is_empty() {
        return origin.trim_end_matches('/').to_string();
    }
    match reqwest::Url::parse(server_url) {
        Ok(url) => url.origin().ascii_serialization(),
        Err(_) => server_url.trim_end_matches('/').to_string(),
    }
}

pub fn manifest_url(root: &str, token: &str) -> String {
    format!("{}{}/{}.yaml", root, IMPORT_PATH, token)
}

fn checksum_flag(checksum: &str) -> String {
    if checksum.is_empty() {
        String::new()
    } else {
        format!(" --ca-checksum {}", checksum)
    }
}

pub fn linux_node_command(agent_image: &str, root: &str, token: &str, checksum: &str) -> String {
    format!(
        "sudo docker run -d --privileged --restart=unless-stopped --net=host -v /etc/kubernetes:/etc/kubernetes -v /var/run:/var/run {} --server {} --token {}{}",
        agent_image,
        root,
        token,
        checksum_flag(checksum)
    )
}

/// `agent_image_env` is set when the agent is pulled from a private registry
/// and the bootstrap script must pull the same image.
pub fn windows_node_command(
    agent_image: &str,
    agent_image_env: Option<&str>,
    root: &str,
    token: &str,
    checksum: &str,
) -> String {
    let env = agent_image_env
        .map(|image| format!("-e AGENT_IMAGE={} ", image))
        .unwrap_or_default();
    format!(
        "PowerShell -NoLogo -NonInteractive -Command \"& {{docker run -v c:/:c:/host {}{} bootstrap --server {} --token {}{} | iex}}\"",
        env,
        agent_image,
        root,
        token,
        checksum_flag(checksum)
    )
}

/// Image name with the system default registry prefixed, when one is set.
pub fn resolve_image(registry: &str, image: &str) -> String {
    if registry.is_empty() || image.starts_with(&format!("{}/", registry)) {
        image.to_string()
    } else {
        format!("{}/{}", registry.trim_end_matches('/'), image)
    }
}

pub fn generate_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LEN)
        .map(|c| char::from(c).to_ascii_lowercase())
        .collect()
}

/// Inputs of the import manifest.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImportContext {
    pub ca_checksum: String,
    pub agent_image: String,
    pub auth_image: String,
    pub token: String,
    pub url: String,
}

fn meta(name: &str, namespace: Option<&str>, labels: &[(&str, &str)]) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: namespace.map(str::to_string),
        labels: (!labels.is_empty()).then(|| {
            labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect()
        }),
        ..Default::default()
    }
}

fn env(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    }
}

fn app_labels(app: &str) -> BTreeMap<String, String> {
    [("app".to_string(), app.to_string())].into()
}

fn agent_pod(app: &str, ctx: &ImportContext, secret: &str, cluster: bool) -> PodTemplateSpec {
    let mut envs = vec![
        env("CATTLE_SERVER", &ctx.url),
        env("CATTLE_CA_CHECKSUM", &ctx.ca_checksum),
        env("CATTLE_CLUSTER", if cluster { "true" } else { "false" }),
        env("CATTLE_K8S_MANAGED", "true"),
    ];
    if !cluster {
        envs.push(EnvVar {
            name: "CATTLE_NODE_NAME".to_string(),
            value_from: Some(k8s_openapi::api::core::v1::EnvVarSource {
                field_ref: Some(k8s_openapi::api::core::v1::ObjectFieldSelector {
                    field_path: "spec.nodeName".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        });
    }

    PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: Some(app_labels(app)),
            ..Default::default()
        }),
        spec: Some(PodSpec {
            service_account_name: Some(AGENT_SERVICE_ACCOUNT.to_string()),
            host_network: (!cluster).then_some(true),
            node_selector: Some([("kubernetes.io/os".to_string(), "linux".to_string())].into()),
            tolerations: (!cluster).then(|| {
                vec![Toleration {
                    operator: Some("Exists".to_string()),
                    ..Default::default()
                }]
            }),
            containers: vec![Container {
                name: app.to_string(),
                image: Some(ctx.agent_image.clone()),
                image_pull_policy: Some("IfNotPresent".to_string()),
                env: Some(envs),
                security_context: (!cluster).then(|| SecurityContext {
                    privileged: Some(true),
                    ..Default::default()
                }),
                volume_mounts: Some(vec![VolumeMount {
                    name: "cattle-credentials".to_string(),
                    mount_path: "/cattle-credentials".to_string(),
                    read_only: Some(true),
                    ..Default::default()
                }]),
                ..Default::default()
            }],
            volumes: Some(vec![Volume {
                name: "cattle-credentials".to_string(),
                secret: Some(SecretVolumeSource {
                    secret_name: Some(secret.to_string()),
                    default_mode: Some(320),
                    ..Default::default()
                }),
                ..Default::default()
            }]),
            ..Default::default()
        }),
    }
}

fn push_doc<T: Serialize>(docs: &mut Vec<String>, object: &T) -> Result<()> {
    docs.push(serde_yaml::to_string(object)?);
    Ok(())
}

/// Multi-document YAML that installs the agents into an existing cluster.
pub fn render_manifest(ctx: &ImportContext) -> Result<String> {
    let secret_name = format!("cattle-credentials-{}", token_key(&ctx.token));
    let mut docs = Vec::new();

    push_doc(
        &mut docs,
        &Namespace {
            metadata: meta(AGENT_NAMESPACE, None, &[]),
            ..Default::default()
        },
    )?;
    push_doc(
        &mut docs,
        &ServiceAccount {
            metadata: meta(AGENT_SERVICE_ACCOUNT, Some(AGENT_NAMESPACE), &[]),
            ..Default::default()
        },
    )?;
    push_doc(
        &mut docs,
        &ClusterRole {
            metadata: meta("cattle-admin", None, &[("cattle.io/creator", "norman")]),
            rules: Some(vec![
                PolicyRule {
                    api_groups: Some(vec!["*".to_string()]),
                    resources: Some(vec!["*".to_string()]),
                    verbs: vec!["*".to_string()],
                    ..Default::default()
                },
                PolicyRule {
                    non_resource_urls: Some(vec!["*".to_string()]),
                    verbs: vec!["*".to_string()],
                    ..Default::default()
                },
            ]),
            ..Default::default()
        },
    )?;
    push_doc(
        &mut docs,
        &ClusterRoleBinding {
            metadata: meta("cattle-admin-binding", None, &[("cattle.io/creator", "norman")]),
            role_ref: RoleRef {
                api_group: "rbac.authorization.k8s.io".to_string(),
                kind: "ClusterRole".to_string(),
                name: "cattle-admin".to_string(),
            },
            subjects: Some(vec![Subject {
                kind: "ServiceAccount".to_string(),
                name: AGENT_SERVICE_ACCOUNT.to_string(),
                namespace: Some(AGENT_NAMESPACE.to_string()),
                api_group: None,
            }]),
        },
    )?;
    push_doc(
        &mut docs,
        &Secret {
            metadata: meta(&secret_name, Some(AGENT_NAMESPACE), &[]),
            type_: Some("Opaque".to_string()),
            data: Some(
                [
                    ("url".to_string(), ByteString(ctx.url.as_bytes().to_vec())),
                    ("token".to_string(), ByteString(ctx.token.as_bytes().to_vec())),
                ]
                .into(),
            ),
            ..Default::default()
        },
    )?;
    push_doc(
        &mut docs,
        &Deployment {
            metadata: meta("cattle-cluster-agent", Some(AGENT_NAMESPACE), &[]),
            spec: Some(DeploymentSpec {
                selector: LabelSelector {
                    match_labels: Some(app_labels("cattle-cluster-agent")),
                    ..Default::default()
                },
                template: agent_pod("cattle-cluster-agent", ctx, &secret_name, true),
                ..Default::default()
            }),
            ..Default::default()
        },
    )?;
    push_doc(
        &mut docs,
        &DaemonSet {
            metadata: meta("cattle-node-agent", Some(AGENT_NAMESPACE), &[]),
            spec: Some(DaemonSetSpec {
                selector: LabelSelector {
                    match_labels: Some(app_labels("cattle-node-agent")),
                    ..Default::default()
                },
                template: agent_pod("cattle-node-agent", ctx, &secret_name, false),
                ..Default::default()
            }),
            ..Default::default()
        },
    )?;

    if !ctx.auth_image.is_empty() {
        let mut template = agent_pod("kube-api-auth", ctx, &secret_name, false);
        if let Some(container) = template.spec.as_mut().and_then(|s| s.containers.first_mut()) {
            container.image = Some(ctx.auth_image.clone());
        }
        push_doc(
            &mut docs,
            &DaemonSet {
                metadata: meta("kube-api-auth", Some(AGENT_NAMESPACE), &[]),
                spec: Some(DaemonSetSpec {
                    selector: LabelSelector {
                        match_labels: Some(app_labels("kube-api-auth")),
                        ..Default::default()
                    },
                    template,
                    ..Default::default()
                }),
                ..Default::default()
            },
        )?;
    }

    Ok(docs.join("---\n"))
}

/// Issues registration tokens and renders what an agent needs to join.
#[derive(Clone)]
pub struct Registration {
    tokens: SharedStore<ClusterRegistrationToken>,
    settings: Settings,
}

impl Registration {
    pub fn new(tokens: SharedStore<ClusterRegistrationToken>, settings: Settings) -> Self {
        index_registration_tokens(&tokens);
        Self { tokens, settings }
    }

    pub fn root_url(&self, origin: &str) -> String {
        root_url(&self.settings.get(SERVER_URL), origin)
    }

    fn agent_image(&self) -> String {
        resolve_image(&self.settings.get(SYSTEM_DEFAULT_REGISTRY), &self.settings.get(AGENT_IMAGE))
    }

    pub async fn token(&self, value: &str) -> Result<ClusterRegistrationToken> {
        self.tokens
            .by_index(BY_TOKEN_INDEX, value)
            .await?
            .into_iter()
            .next()
            .ok_or(RegistrationError::InvalidToken)
    }

    /// Manifest for `GET /v3/import/<token>.yaml`. `auth_image` of `fixed`
    /// resolves to the configured auth image.
    pub async fn import_manifest(&self, token: &str, origin: &str, auth_image: &str) -> Result<String> {
        let record = self.token(token).await?;
        let auth_image = if auth_image == "fixed" {
            resolve_image(&self.settings.get(SYSTEM_DEFAULT_REGISTRY), &self.settings.get(AUTH_IMAGE))
        } else {
            auth_image.to_string()
        };
        debug!(cluster = %record.spec.cluster_name, "rendering import manifest");
        render_manifest(&ImportContext {
            ca_checksum: ca_checksum(&self.settings.get(CA_CERTS)),
            agent_image: self.agent_image(),
            auth_image,
            token: token.to_string(),
            url: self.root_url(origin),
        })
    }

    /// Commands and manifest URL shown for a token.
    pub fn status_for(&self, token: &str, root: &str) -> ClusterRegistrationTokenStatus {
        let checksum = ca_checksum(&self.settings.get(CA_CERTS));
        let agent_image = self.agent_image();
        let registry = self.settings.get(SYSTEM_DEFAULT_REGISTRY);
        let url = manifest_url(root, token);
        ClusterRegistrationTokenStatus {
            token: token.to_string(),
            command: format!("kubectl apply -f {}", url),
            insecure_command: format!("curl --insecure -sfL {} | kubectl apply -f -", url),
            node_command: linux_node_command(&agent_image, root, token, &checksum),
            windows_node_command: windows_node_command(
                &agent_image,
                (!registry.is_empty()).then_some(agent_image.as_str()),
                root,
                token,
                &checksum,
            ),
            manifest_url: url,
        }
    }
}

#[async_trait]
impl Reconciler for Registration {
    type Error = RegistrationError;

    fn name(&self) -> &'static str {
        "cluster-registration-token-controller"
    }

    async fn reconcile(&self, key: &str) -> Result<Action> {
        let (ns, name) = split_key(key);
        let Some(mut record) = self.tokens.get_opt(ns, name).await? else {
            return Ok(Action::done());
        };

        let token = if record.status.token.is_empty() {
            generate_token()
        } else {
            record.status.token.clone()
        };
        let root = self.root_url("");
        let status = if root.is_empty() {
            ClusterRegistrationTokenStatus {
                token,
                ..Default::default()
            }
        } else {
            self.status_for(&token, &root)
        };

        if status != record.status {
            record.status = status;
            self.tokens.update(record).await?;
            info!(token = key, "registration token updated");
        }
        if root.is_empty() {
            return Ok(Action::requeue(SERVER_URL_RETRY));
        }
        Ok(Action::done())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ObjectMeta as RecordMeta, Setting};
    use crate::models::cluster::ClusterRegistrationTokenSpec;
    use crate::store::MemoryStore;
    use std::sync::Arc;

    #[test]
    fn token_key_and_checksum() {
        assert_eq!(token_key("abc"), "9001509");
        assert_eq!(ca_checksum(""), "");
        assert_eq!(ca_checksum("-----CERT-----"), ca_checksum("-----CERT-----\n"));
        assert_eq!(ca_checksum("x").len(), 64);
    }

    #[test]
    fn root_url_drops_path() {
        assert_eq!(root_url("https://rancher.example.com/v3", "http://ignored"), "https://rancher.example.com");
        assert_eq!(root_url("https://r.example.com:8443/", ""), "https://r.example.com:8443");
        assert_eq!(root_url("", "https://origin.example.com/"), "https://origin.example.com");
    }

    #[test]
    fn node_commands_have_exact_shape() {
        assert_eq!(
            linux_node_command("corral/agent:v1", "https://r.io", "tok", "abc"),
            "sudo docker run -d --privileged --restart=unless-stopped --net=host -v /etc/kubernetes:/etc/kubernetes -v /var/run:/var/run corral/agent:v1 --server https://r.io --token tok --ca-checksum abc"
        );
        assert_eq!(
            linux_node_command("corral/agent:v1", "https://r.io", "tok", ""),
            "sudo docker run -d --privileged --restart=unless-stopped --net=host -v /etc/kubernetes:/etc/kubernetes -v /var/run:/var/run corral/agent:v1 --server https://r.io --token tok"
        );
        assert_eq!(
            windows_node_command("corral/agent:v1", None, "https://r.io", "tok", ""),
            "PowerShell -NoLogo -NonInteractive -Command \"& {docker run -v c:/:c:/host corral/agent:v1 bootstrap --server https://r.io --token tok | iex}\""
        );
        assert_eq!(
            windows_node_command("reg.io/corral/agent:v1", Some("reg.io/corral/agent:v1"), "https://r.io", "tok", "sha"),
            "PowerShell -NoLogo -NonInteractive -Command \"& {docker run -v c:/:c:/host -e AGENT_IMAGE=reg.io/corral/agent:v1 reg.io/corral/agent:v1 bootstrap --server https://r.io --token tok --ca-checksum sha | iex}\""
        );
        assert_eq!(manifest_url("https://r.io", "tok"), "https://r.io/v3/import/tok.yaml");
    }

    #[test]
    fn manifest_carries_credentials_and_checksum() {
        let manifest = render_manifest(&ImportContext {
            ca_checksum: "deadbeef".to_string(),
            agent_image: "corral/agent:v1".to_string(),
            auth_image: String::new(),
            token: "abc".to_string(),
            url: "https://r.io".to_string(),
        })
        .unwrap();

        let docs: Vec<serde_yaml::Value> = manifest
            .split("---\n")
            .map(|doc| serde_yaml::from_str(doc).unwrap())
            .collect();
        let kinds: Vec<&str> = docs.iter().map(|d| d["kind"].as_str().unwrap()).collect();
        assert_eq!(
            kinds,
            vec!["Namespace", "ServiceAccount", "ClusterRole", "ClusterRoleBinding", "Secret", "Deployment", "DaemonSet"]
        );
        assert_eq!(docs[4]["metadata"]["name"], "cattle-credentials-9001509");
        assert_eq!(docs[4]["data"]["token"], "YWJj");
        assert!(manifest.contains("CATTLE_CA_CHECKSUM"));
        assert!(manifest.contains("deadbeef"));
    }

    #[tokio::test]
    async fn tokens_are_issued_and_resolve_manifests() {
        let settings_store: SharedStore<Setting> = Arc::new(MemoryStore::new());
        let settings = Settings::new(settings_store);
        settings.set(SERVER_URL, "https://corral.example.com/dashboard").await.unwrap();
        let tokens: SharedStore<ClusterRegistrationToken> = Arc::new(MemoryStore::new());
        let registration = Registration::new(tokens.clone(), settings.clone());

        tokens
            .create(ClusterRegistrationToken {
                metadata: RecordMeta::namespaced("c-1", "default-token"),
                spec: ClusterRegistrationTokenSpec {
                    cluster_name: "c-1".to_string(),
                },
                status: Default::default(),
            })
            .await
            .unwrap();
        registration.reconcile("c-1/default-token").await.unwrap();

        let issued = tokens.get("c-1", "default-token").await.unwrap();
        assert_eq!(issued.status.token.len(), TOKEN_LEN);
        assert_eq!(
            issued.status.manifest_url,
            format!("https://corral.example.com/v3/import/{}.yaml", issued.status.token)
        );
        assert!(issued.status.node_command.contains("--server https://corral.example.com --token"));

        let manifest = registration
            .import_manifest(&issued.status.token, "http://ignored", "fixed")
            .await
            .unwrap();
        assert!(manifest.contains("corral/kube-api-auth:v0.1.0"));
        assert!(matches!(
            registration.import_manifest("bogus", "", "").await.unwrap_err(),
            RegistrationError::InvalidToken
        ));
    }
}
