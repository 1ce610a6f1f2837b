// Catalog sync: keeps Template/TemplateVersion records in step with each catalog's chart repository

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use metrics::counter;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::CatalogConfig;
use crate::controller::{Action, ErrorClass, Reconciler};
use crate::error::ApiError;
use crate::models::catalog::{
    condition, Catalog, CatalogSpec, HelmVersionCommits, Template, TemplateVersion, TemplateVersionSpec,
};
use crate::models::meta::split_key;
use crate::settings::{Settings, INSTALL_UUID};
use crate::store::{retry_on_conflict, Backoff, SharedStore, StoreError};

pub mod external_id;
pub mod helm;
pub mod repo;
pub mod traverse;

pub use external_id::ExternalId;
use helm::{ChartClient, ChartVersion};
use repo::{Git, GitCli, HttpShaProbe, RepoCache, ShaProbe};
use traverse::{CatalogYml, TEMPLATE_NAME_LABEL};

const GIT_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("Repo [{0}] is not accessible: {1}")]
    NotAccessible(String, String),

    #[error("{0}")]
    Git(String),

    #[error("{0}")]
    Chart(String),

    #[error("Project ID invalid while creating template: {0}")]
    InvalidProject(String),

    #[error("invalid external id {0}")]
    InvalidExternalId(String),

    #[error("{0}")]
    Sync(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl CatalogError {
    /// Timeouts keep the URL in the message so callers can tell them apart.
    pub fn from_request(e: reqwest::Error) -> Self {
        match e.url() {
            Some(url) if e.is_timeout() => CatalogError::NotAccessible(url.to_string(), e.to_string()),
            _ => CatalogError::Http(e),
        }
    }
}

impl From<CatalogError> for ApiError {
    fn from(e: CatalogError) -> Self {
        match e {
            CatalogError::Store(e) => e.into(),
            CatalogError::InvalidProject(_) | CatalogError::InvalidExternalId(_) => ApiError::BadRequest(e.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl ErrorClass for CatalogError {
    fn is_forget(&self) -> bool {
        false
    }
}

pub type Result<T> = std::result::Result<T, CatalogError>;

/// Body of the `exportYaml` link.
#[derive(Debug, Serialize)]
struct ExportDoc<'a> {
    version: &'static str,
    catalogs: BTreeMap<&'a str, &'a CatalogSpec>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncSummary {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
}

pub struct CatalogManager {
    catalogs: SharedStore<Catalog>,
    templates: SharedStore<Template>,
    versions: SharedStore<TemplateVersion>,
    settings: Settings,
    git: Arc<dyn Git>,
    probe: Arc<dyn ShaProbe>,
    http: reqwest::Client,
    cache_root: PathBuf,
    icon_root: PathBuf,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl CatalogManager {
    pub fn new(
        catalogs: SharedStore<Catalog>,
        templates: SharedStore<Template>,
        versions: SharedStore<TemplateVersion>,
        settings: Settings,
        config: &CatalogConfig,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_secs))
            .build()?;
        Ok(Self {
            catalogs,
            templates,
            versions,
            settings,
            git: Arc::new(GitCli::new(GIT_TIMEOUT)),
            probe: Arc::new(HttpShaProbe::new(http.clone())),
            http,
            cache_root: config.cache_root.clone(),
            icon_root: config.icon_cache.clone(),
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn with_backends(mut self, git: Arc<dyn Git>, probe: Arc<dyn ShaProbe>) -> Self {
        self.git = git;
        self.probe = probe;
        self
    }

    fn repo_lock(&self, hash: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks.lock().entry(hash.to_string()).or_default().clone()
    }

    /// Marks the named catalog, or every catalog, for a forced refresh.
    pub async fn refresh(&self, key: Option<&str>) -> Result<Vec<Catalog>> {
        let names: Vec<(String, String)> = match key {
            Some(key) => {
                let (ns, name) = split_key(key);
                let catalog = self.catalogs.get(ns, name).await?;
                vec![(catalog.metadata.namespace, catalog.metadata.name)]
            }
            None => self
                .catalogs
                .list(None)
                .await?
                .into_iter()
                .map(|c| (c.metadata.namespace, c.metadata.name))
                .collect(),
        };

        let mut refreshed = Vec::with_capacity(names.len());
        for (ns, name) in names {
            let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
            let catalog = self
                .update_status(&ns, &name, |c| {
                    c.status.last_refresh_timestamp = Some(now.clone());
                    c.status.conditions.set_unknown(condition::REFRESHED);
                })
                .await?;
            refreshed.push(catalog);
        }
        Ok(refreshed)
    }

    pub async fn export_yaml(&self, key: &str) -> Result<String> {
        let (ns, name) = split_key(key);
        let catalog = self.catalogs.get(ns, name).await?;
        let doc = ExportDoc {
            version: "v3",
            catalogs: BTreeMap::from([(catalog.name(), &catalog.spec)]),
        };
        Ok(serde_yaml::to_string(&doc)?)
    }

    async fn update_status<F>(&self, ns: &str, name: &str, mutate: F) -> Result<Catalog>
    where
        F: Fn(&mut Catalog) + Send + Sync,
    {
        let store = &self.catalogs;
        let mutate = &mutate;
        Ok(retry_on_conflict(Backoff::conflict(), || async move {
            let mut catalog = store.get(ns, name).await?;
            mutate(&mut catalog);
            store.update(catalog).await
        })
        .await?)
    }

    /// Fetches the catalog's repository and syncs templates when its commit
    /// marker moved or a refresh was requested.
    pub async fn sync(&self, catalog: Catalog) -> Result<Option<SyncSummary>> {
        let force = catalog.status.conditions.is_unknown(condition::REFRESHED);
        let repo = RepoCache::new(&catalog, &self.cache_root, &self.icon_root);
        let lock = self.repo_lock(&repo.hash);
        let _guard = lock.lock().await;

        let charts = ChartClient::new(self.http.clone(), &catalog.spec.username, &catalog.spec.password);
        let uuid = self.settings.get(INSTALL_UUID);
        let commit = repo
            .update(true, self.git.as_ref(), self.probe.as_ref(), &charts, &uuid)
            .await?;

        if commit == catalog.status.commit && !force {
            debug!(catalog = %catalog.name(), "catalog is already up to date");
            return Ok(None);
        }

        let summary = self.traverse_and_update(catalog, &repo, &charts, commit).await?;
        Ok(Some(summary))
    }

    async fn traverse_and_update(
        &self,
        catalog: Catalog,
        repo: &RepoCache,
        charts: &ChartClient,
        commit: String,
    ) -> Result<SyncSummary> {
        let index = helm::load_index(&repo.local_path).await?;
        let namespace = traverse::template_namespace(&catalog);

        let mut summary = SyncSummary::default();
        let mut new_commits = HelmVersionCommits::new();
        let mut errs: Vec<String> = Vec::new();
        let mut terrors: Vec<String> = Vec::new();

        for (chart, versions) in &index.entries {
            if versions.is_empty() {
                continue;
            }
            new_commits.insert(
                chart.clone(),
                versions.iter().map(|v| (v.version.clone(), v.digest.clone())).collect(),
            );

            let name = traverse::template_name(catalog.name(), chart);
            let existing = self.templates.get_opt(&namespace, &name).await?;
            let stored = catalog.status.helm_version_commits.get(chart);
            if existing.is_some() && !traverse::chart_changed(stored, versions) {
                debug!(chart = %chart, "chart has not been changed, skipping");
                continue;
            }

            let (template, records) = self
                .build_chart(&catalog, repo, charts, chart, versions, stored, &mut errs)
                .await?;
            let written = self.write_chart(template, records).await;
            match written {
                Ok(()) if existing.is_some() => summary.updated += 1,
                Ok(()) => summary.created += 1,
                Err(e) => {
                    warn!(chart = %chart, "failed to write template: {}", e);
                    new_commits.remove(chart);
                    terrors.push(e.to_string());
                }
            }
        }

        for chart in catalog.status.helm_version_commits.keys() {
            if index.entries.contains_key(chart) {
                continue;
            }
            let name = traverse::template_name(catalog.name(), chart);
            debug!(template = %name, "deleting template and its versions");
            self.delete_chart(&namespace, &name).await?;
            summary.deleted += 1;
        }
        info!(
            catalog = %catalog.name(),
            "Catalog sync done. {} templates created, {} templates updated, {} templates deleted",
            summary.created, summary.updated, summary.deleted
        );
        counter!("catalog_templates_written_total").increment((summary.created + summary.updated) as u64);

        let ns = catalog.metadata.namespace.clone();
        let name = catalog.metadata.name.clone();
        if !terrors.is_empty() {
            self.update_status(&ns, &name, |c| c.status.helm_version_commits = new_commits.clone())
                .await?;
            return Err(CatalogError::Sync(format!(
                "failed to update templates. Multiple error occurred: {}",
                terrors.join("; ")
            )));
        }

        let commit = if errs.is_empty() {
            commit
        } else {
            counter!("catalog_commit_reset_total", "catalog" => name.clone()).increment(1);
            String::new()
        };
        self.update_status(&ns, &name, |c| {
            c.status.helm_version_commits = new_commits.clone();
            c.status.commit = commit.clone();
            c.status.conditions.set_true(condition::UPGRADED);
            c.status.conditions.set_true(condition::REFRESHED);
        })
        .await?;

        if !errs.is_empty() {
            return Err(CatalogError::Sync(format!(
                "failed to sync templates. Resetting commit. Multiple error occurred: {}",
                errs.join("; ")
            )));
        }
        Ok(summary)
    }

    /// Template and version records for one chart. Fetch failures are
    /// collected in `errs` and the version is left out.
    #[allow(clippy::too_many_arguments)]
    async fn build_chart(
        &self,
        catalog: &Catalog,
        repo: &RepoCache,
        charts: &ChartClient,
        chart: &str,
        versions: &[ChartVersion],
        stored: Option<&BTreeMap<String, String>>,
        errs: &mut Vec<String>,
    ) -> Result<(Template, Vec<TemplateVersion>)> {
        let icon = match charts.icon(&repo.icon_path, versions).await {
            Ok(icon) => icon,
            Err(e) => {
                errs.push(e.to_string());
                Default::default()
            }
        };
        let mut template = traverse::template_skeleton(catalog, chart, versions, icon)?;

        let mut specs: Vec<TemplateVersionSpec> = Vec::new();
        let mut ymls: Vec<CatalogYml> = Vec::new();
        for version in versions {
            let unchanged = stored.and_then(|s| s.get(&version.version)) == Some(&version.digest);
            if unchanged {
                let record_name = traverse::version_name(&template.metadata.name, &version.version);
                if let Some(record) = self.versions.get_opt(&template.metadata.namespace, &record_name).await? {
                    ymls.push(traverse::stored_catalog_yml(chart, &record.spec)?);
                    specs.push(record.spec);
                    continue;
                }
            }

            let files = match charts.fetch_files(&repo.local_path, repo.chart_base_url(), version).await {
                Ok(files) => files,
                Err(e) => {
                    errs.push(e.to_string());
                    continue;
                }
            };
            let (spec, yml) = traverse::build_version(catalog, chart, version, files)?;
            specs.push(spec);
            ymls.push(yml);
        }

        traverse::link_upgrades(&template.metadata.name, &mut specs);
        let records = traverse::assemble(&mut template, specs, &ymls);
        Ok((template, records))
    }

    async fn write_chart(&self, template: Template, records: Vec<TemplateVersion>) -> Result<()> {
        let namespace = template.metadata.namespace.clone();
        let name = template.metadata.name.clone();
        self.templates.create_or_update(template).await?;

        let keep: Vec<String> = records.iter().map(|r| r.metadata.name.clone()).collect();
        for record in records {
            self.versions.create_or_update(record).await?;
        }

        let selector = BTreeMap::from([(TEMPLATE_NAME_LABEL.to_string(), name)]);
        for stale in self.versions.list_labeled(Some(&namespace), &selector).await? {
            if !keep.contains(&stale.metadata.name) {
                self.versions.delete_if_exists(&namespace, &stale.metadata.name).await?;
            }
        }
        Ok(())
    }

    async fn delete_chart(&self, namespace: &str, name: &str) -> Result<()> {
        let selector = BTreeMap::from([(TEMPLATE_NAME_LABEL.to_string(), name.to_string())]);
        for record in self.versions.list_labeled(Some(namespace), &selector).await? {
            self.versions.delete_if_exists(namespace, &record.metadata.name).await?;
        }
        self.templates.delete_if_exists(namespace, name).await?;
        Ok(())
    }
}

#[async_trait]
impl Reconciler for CatalogManager {
    type Error = CatalogError;

    fn name(&self) -> &'static str {
        "catalog-sync"
    }

    async fn reconcile(&self, key: &str) -> Result<Action> {
        let (ns, name) = split_key(key);
        let Some(catalog) = self.catalogs.get_opt(ns, name).await? else {
            return Ok(Action::done());
        };
        if catalog.metadata.deletion_timestamp.is_some() {
            return Ok(Action::done());
        }
        self.sync(catalog).await?;
        Ok(Action::done())
    }
}
