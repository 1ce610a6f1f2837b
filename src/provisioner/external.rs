use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::driver::{ClusterInfo, DriverError, EngineDriver, EngineRequest};
use super::ProvisionError;
use crate::controller::{Action, Reconciler};
use crate::models::cluster::{kontainer_condition, Driver, KontainerDriver};
use crate::models::meta::split_key;
use crate::store::SharedStore;

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);

lazy_static! {
    static ref DRIVER_FILE_NAME: Regex = Regex::new("kontainer-engine-driver-(.+)$").unwrap();
}

/// Display name carried in a driver binary's file name, e.g.
/// `kontainer-engine-driver-example` gives `example`.
pub fn display_name_from_url(url: &str) -> Option<String> {
    let file = url.split(['?', '#']).next()?.rsplit('/').next()?;
    DRIVER_FILE_NAME
        .captures(file)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

pub fn verify_checksum(data: &[u8], expected: &str) -> Result<(), ProvisionError> {
    if expected.is_empty() {
        return Ok(());
    }
    let actual = hex::encode(Sha256::digest(data));
    if !actual.eq_ignore_ascii_case(expected.trim()) {
        return Err(ProvisionError::Validation(format!(
            "driver checksum mismatch: expected {} got {}",
            expected, actual
        )));
    }
    Ok(())
}

/// Downloads, verifies and installs external driver binaries.
pub struct KontainerDriverController {
    drivers: SharedStore<KontainerDriver>,
    driver_dir: PathBuf,
    http: reqwest::Client,
}

impl KontainerDriverController {
    pub fn new(drivers: SharedStore<KontainerDriver>, driver_dir: impl Into<PathBuf>) -> Result<Self, ProvisionError> {
        let http = reqwest::Client::builder()
            .timeout(DOWNLOAD_TIMEOUT)
            .build()
            .map_err(|e| ProvisionError::Validation(e.to_string()))?;
        Ok(Self {
            drivers,
            driver_dir: driver_dir.into(),
            http,
        })
    }

    fn installed(record: &KontainerDriver) -> bool {
        !record.status.executable_path.is_empty() && Path::new(&record.status.executable_path).exists()
    }

    async fn install(&self, mut record: KontainerDriver, url: &str, checksum: &str) -> Result<KontainerDriver, ProvisionError> {
        let display_name = display_name_from_url(url).unwrap_or_else(|| record.metadata.name.clone());
        let download_err = |e: reqwest::Error| ProvisionError::Validation(format!("failed to download driver {}: {}", url, e));
        let data = self
            .http
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(download_err)?
            .bytes()
            .await
            .map_err(download_err)?;
        verify_checksum(&data, checksum)?;
        record.status.conditions.set_true(kontainer_condition::DOWNLOADED);

        let io_err = |e: std::io::Error| ProvisionError::Validation(format!("failed to install driver: {}", e));
        tokio::fs::create_dir_all(&self.driver_dir).await.map_err(io_err)?;
        let path = self.driver_dir.join(format!("kontainer-engine-driver-{}", display_name));
        tokio::fs::write(&path, &data).await.map_err(io_err)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
                .await
                .map_err(io_err)?;
        }
        record.status.conditions.set_true(kontainer_condition::INSTALLED);
        record.status.display_name = display_name;
        record.status.actual_url = url.to_string();
        record.status.executable_path = path.to_string_lossy().into_owned();
        info!(driver = %record.metadata.name, path = %path.display(), "installed kontainer driver");
        Ok(record)
    }
}

#[async_trait]
impl Reconciler for KontainerDriverController {
    type Error = ProvisionError;

    fn name(&self) -> &'static str {
        "mgmt-kontainer-driver-lifecycle"
    }

    async fn reconcile(&self, key: &str) -> Result<Action, ProvisionError> {
        let (_, name) = split_key(key);
        let Some(record) = self.drivers.get_opt("", name).await? else {
            return Ok(Action::done());
        };
        let original = record.clone();
        let mut record = match record.spec.driver.clone() {
            Driver::Builtin { id } => {
                let mut record = record;
                if record.status.display_name.is_empty() {
                    record.status.display_name = id;
                }
                record.status.conditions.set_true(kontainer_condition::DOWNLOADED);
                record.status.conditions.set_true(kontainer_condition::INSTALLED);
                record
            }
            Driver::External { url, checksum, .. } => {
                let stale = url != record.status.actual_url
                    || !record.status.conditions.is_true(kontainer_condition::DOWNLOADED)
                    || !Self::installed(&record);
                if !record.spec.active || !stale {
                    record
                } else {
                    match self.install(record.clone(), &url, &checksum).await {
                        Ok(installed) => installed,
                        Err(e) => {
                            let mut failed = record;
                            failed
                                .status
                                .conditions
                                .fail(kontainer_condition::DOWNLOADED, "Error", e.to_string());
                            self.drivers.update(failed).await?;
                            return Err(e);
                        }
                    }
                }
            }
        };
        if record.spec.active {
            record.status.conditions.set_true(kontainer_condition::ACTIVE);
        } else {
            record.status.conditions.set_false(kontainer_condition::ACTIVE);
        }
        if record != original {
            self.drivers.update(record).await?;
        }
        Ok(Action::done())
    }
}

/// Engine backed by a driver binary: `<binary> <operation>` reads the request
/// as JSON on stdin and answers with JSON on stdout.
pub struct ExternalDriver {
    path: PathBuf,
}

impl ExternalDriver {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn invoke<T: DeserializeOwned>(
        &self,
        ctx: CancellationToken,
        op: &str,
        input: serde_json::Value,
    ) -> Result<T, DriverError> {
        let failed = |e: std::io::Error| DriverError::Failed(format!("driver {} {}: {}", self.path.display(), op, e));
        let mut child = Command::new(&self.path)
            .arg(op)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(failed)?;
        if let Some(mut stdin) = child.stdin.take() {
            let body = serde_json::to_vec(&input).map_err(|e| DriverError::Failed(e.to_string()))?;
            stdin.write_all(&body).await.map_err(failed)?;
        }

        let output = tokio::select! {
            _ = ctx.cancelled() => return Err(DriverError::Cancelled),
            out = child.wait_with_output() => out.map_err(failed)?,
        };
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if stderr.contains("cluster already exists") {
                return Err(DriverError::AlreadyExists);
            }
            return Err(DriverError::Failed(stderr));
        }
        let stdout = if output.stdout.iter().all(u8::is_ascii_whitespace) {
            b"null".to_vec()
        } else {
            output.stdout
        };
        serde_json::from_slice(&stdout)
            .map_err(|e| DriverError::Failed(format!("invalid driver output for {}: {}", op, e)))
    }
}

#[async_trait]
impl EngineDriver for ExternalDriver {
    async fn create(&self, ctx: CancellationToken, req: &EngineRequest) -> Result<ClusterInfo, DriverError> {
        self.invoke(ctx, "create", json!(req)).await
    }

    async fn update(&self, ctx: CancellationToken, req: &EngineRequest) -> Result<ClusterInfo, DriverError> {
        self.invoke(ctx, "update", json!(req)).await
    }

    async fn remove(&self, ctx: CancellationToken, req: &EngineRequest) -> Result<(), DriverError> {
        self.invoke::<Option<serde_json::Value>>(ctx, "remove", json!(req))
            .await
            .map(|_| ())
    }

    async fn etcd_restore(
        &self,
        ctx: CancellationToken,
        req: &EngineRequest,
        snapshot: &str,
    ) -> Result<ClusterInfo, DriverError> {
        let mut input = json!(req);
        input["snapshot"] = json!(snapshot);
        self.invoke(ctx, "etcd-restore", input).await
    }

    async fn generate_service_account(&self, ctx: CancellationToken, req: &EngineRequest) -> Result<String, DriverError> {
        self.invoke(ctx, "generate-service-account", json!(req)).await
    }

    async fn remove_legacy_service_account(&self, ctx: CancellationToken, req: &EngineRequest) -> Result<(), DriverError> {
        self.invoke::<Option<serde_json::Value>>(ctx, "remove-legacy-service-account", json!(req))
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::cluster::{KontainerDriverSpec, KontainerDriverStatus};
    use crate::models::ObjectMeta;
    use crate::store::MemoryStore;
    use std::sync::Arc;

    #[test]
    fn display_name_comes_from_binary_name() {
        assert_eq!(
            display_name_from_url("https://github.com/x/releases/download/v1/kontainer-engine-driver-example?raw=1").as_deref(),
            Some("example")
        );
        assert_eq!(display_name_from_url("https://host/driver.bin"), None);
    }

    #[test]
    fn checksum_must_match() {
        let digest = hex::encode(Sha256::digest(b"binary"));
        assert!(verify_checksum(b"binary", &digest).is_ok());
        assert!(verify_checksum(b"binary", &digest.to_uppercase()).is_ok());
        assert!(verify_checksum(b"other", &digest).is_err());
        assert!(verify_checksum(b"anything", "").is_ok());
    }

    #[tokio::test]
    async fn builtin_drivers_are_marked_installed() {
        let store: SharedStore<KontainerDriver> = Arc::new(MemoryStore::new());
        store
            .create(KontainerDriver {
                metadata: ObjectMeta::named("googlekubernetesengine"),
                spec: KontainerDriverSpec {
                    driver: Driver::Builtin {
                        id: "googlekubernetesengine".into(),
                    },
                    active: true,
                    ui_url: String::new(),
                },
                status: KontainerDriverStatus::default(),
            })
            .await
            .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let controller = KontainerDriverController::new(store.clone(), dir.path()).unwrap();
        controller.reconcile("googlekubernetesengine").await.unwrap();

        let record = store.get("", "googlekubernetesengine").await.unwrap();
        assert_eq!(record.status.display_name, "googlekubernetesengine");
        assert!(record.status.conditions.is_true(kontainer_condition::INSTALLED));
        assert!(record.status.conditions.is_true(kontainer_condition::ACTIVE));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn external_driver_speaks_json_over_stdio() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kontainer-engine-driver-echo");
        std::fs::write(
            &path,
            "#!/bin/sh\ncat > /dev/null\nif [ \"$1\" = create ]; then echo 'cluster already exists' >&2; exit 1; fi\necho '{\"apiEndpoint\":\"https://1.2.3.4\",\"serviceAccountToken\":\"t\",\"caCert\":\"c\"}'\n",
        )
        .unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();

        let driver = ExternalDriver::new(&path);
        let req = EngineRequest {
            name: "c-1".into(),
            spec: Default::default(),
            options: Default::default(),
        };
        let created = driver.create(CancellationToken::new(), &req).await;
        assert!(matches!(created, Err(DriverError::AlreadyExists)));
        let info = driver.update(CancellationToken::new(), &req).await.unwrap();
        assert_eq!(info.api_endpoint, "https://1.2.3.4");
        driver.remove(CancellationToken::new(), &req).await.unwrap();
    }
}
