// Helm repository index and chart file access

use base64::{engine::general_purpose::STANDARD, Engine};
use flate2::read::GzDecoder;
use md5::Md5;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::{CatalogError, Result};

pub const INDEX_FILE: &str = "index.yaml";
const CHARTS_DIR: &str = "charts";
const CHART_FILE: &str = "Chart.yaml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartVersion {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub digest: String,
    #[serde(default)]
    pub urls: Vec<String>,
    #[serde(default)]
    pub sources: Vec<String>,
    #[serde(default)]
    pub icon: String,
    #[serde(default)]
    pub kube_version: String,
    #[serde(default)]
    pub keywords: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexFile {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub entries: BTreeMap<String, Vec<ChartVersion>>,
}

impl IndexFile {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut index: IndexFile = serde_yaml::from_slice(data)?;
        index.sort_entries();
        Ok(index)
    }

    /// Orders every chart's versions newest first.
    pub fn sort_entries(&mut self) {
        for versions in self.entries.values_mut() {
            versions.sort_by(|a, b| compare_versions(&b.version, &a.version));
        }
    }
}

/// SemVer ordering, with a leading `v` tolerated; unparseable versions sort
/// lexically after parseable ones.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    match (parse_version(a), parse_version(b)) {
        (Some(a), Some(b)) => a.cmp(&b),
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        (None, None) => a.cmp(b),
    }
}

pub fn parse_version(version: &str) -> Option<semver::Version> {
    semver::Version::parse(version.trim_start_matches('v')).ok()
}

/// A file of one chart version, named `<chart>/<path>`.
#[derive(Debug, Clone, PartialEq)]
pub struct ChartFile {
    pub name: String,
    pub contents: String,
}

pub fn md5_hex(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

/// Loads `index.yaml` from the repo, or builds one from `charts/<name>/<version>/`.
pub async fn load_index(repo_path: &Path) -> Result<IndexFile> {
    let index_path = repo_path.join(INDEX_FILE);
    if tokio::fs::try_exists(&index_path).await? {
        let data = tokio::fs::read(&index_path).await?;
        return IndexFile::parse(&data);
    }
    generate_index(repo_path).await
}

async fn generate_index(repo_path: &Path) -> Result<IndexFile> {
    let mut index = IndexFile {
        api_version: "v1".to_string(),
        entries: BTreeMap::new(),
    };
    let charts = repo_path.join(CHARTS_DIR);
    if !tokio::fs::try_exists(&charts).await? {
        return Ok(index);
    }

    for chart_dir in read_dirs(&charts).await? {
        for version_dir in read_dirs(&chart_dir).await? {
            let chart_file = version_dir.join(CHART_FILE);
            if !tokio::fs::try_exists(&chart_file).await? {
                continue;
            }
            let mut version: ChartVersion = serde_yaml::from_slice(&tokio::fs::read(&chart_file).await?)?;
            let files = read_local_files(&version_dir, &version.name).await?;
            version.digest = files_digest(&files);
            let relative = version_dir.strip_prefix(repo_path).unwrap_or(&version_dir);
            version.urls = vec![relative.to_string_lossy().into_owned()];
            index.entries.entry(version.name.clone()).or_default().push(version);
        }
    }
    index.sort_entries();
    Ok(index)
}

async fn read_dirs(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_dir() {
            dirs.push(entry.path());
        }
    }
    dirs.sort();
    Ok(dirs)
}

async fn read_local_files(root: &Path, chart: &str) -> Result<Vec<ChartFile>> {
    let mut files = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if entry.file_type().await?.is_dir() {
                pending.push(path);
                continue;
            }
            let relative = path.strip_prefix(root).unwrap_or(&path).to_string_lossy().into_owned();
            let contents = String::from_utf8_lossy(&tokio::fs::read(&path).await?).into_owned();
            files.push(ChartFile {
                name: format!("{}/{}", chart, relative),
                contents,
            });
        }
    }
    files.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(files)
}

fn files_digest(files: &[ChartFile]) -> String {
    let mut hasher = Sha256::new();
    for file in files {
        hasher.update(file.name.as_bytes());
        hasher.update([0]);
        hasher.update(file.contents.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// HTTP access to chart repositories, carrying the catalog's credentials.
#[derive(Clone)]
pub struct ChartClient {
    http: reqwest::Client,
    username: String,
    password: String,
}

impl ChartClient {
    pub fn new(http: reqwest::Client, username: &str, password: &str) -> Self {
        Self {
            http,
            username: username.to_string(),
            password: password.to_string(),
        }
    }

    async fn get(&self, url: &str) -> Result<Vec<u8>> {
        let mut request = self.http.get(url);
        if !self.username.is_empty() {
            request = request.basic_auth(&self.username, Some(&self.password));
        }
        let response = request.send().await.map_err(CatalogError::from_request)?;
        let response = response.error_for_status()?;
        Ok(response.bytes().await?.to_vec())
    }

    /// Downloads `<url>/index.yaml`, returning the parsed index, the raw
    /// document and its md5 hash.
    pub async fn download_index(&self, url: &str) -> Result<(IndexFile, Vec<u8>, String)> {
        let index_url = format!("{}/{}", url.trim_end_matches('/'), INDEX_FILE);
        let data = self.get(&index_url).await?;
        let index = IndexFile::parse(&data)?;
        let hash = md5_hex(&data);
        Ok((index, data, hash))
    }

    /// Files of one chart version: a tarball for remote URLs, else a folder
    /// inside the local clone.
    pub async fn fetch_files(
        &self,
        repo_path: &Path,
        base_url: Option<&str>,
        version: &ChartVersion,
    ) -> Result<Vec<ChartFile>> {
        let url = version
            .urls
            .first()
            .ok_or_else(|| CatalogError::Chart(format!("chart {} {} has no urls", version.name, version.version)))?;

        let remote = if url.starts_with("http://") || url.starts_with("https://") {
            Some(url.clone())
        } else {
            base_url.map(|base| format!("{}/{}", base.trim_end_matches('/'), url.trim_start_matches('/')))
        };

        match remote {
            Some(remote) => {
                debug!(url = %remote, "fetching chart archive");
                let data = self.get(&remote).await?;
                untar(&data)
            }
            None => read_local_files(&repo_path.join(url), &version.name).await,
        }
    }

    /// Icon of the newest version as base64 with its file name, cached under
    /// `icon_dir`.
    pub async fn icon(&self, icon_dir: &Path, versions: &[ChartVersion]) -> Result<(String, String)> {
        let Some(icon) = versions.first().map(|v| v.icon.as_str()).filter(|i| !i.is_empty()) else {
            return Ok((String::new(), String::new()));
        };
        let filename = icon
            .split(['?', '#'])
            .next()
            .and_then(|p| p.rsplit('/').next())
            .unwrap_or_default()
            .to_string();
        if filename.is_empty() {
            return Ok((String::new(), String::new()));
        }

        let cached = icon_dir.join(&versions[0].name).join(&filename);
        if tokio::fs::try_exists(&cached).await? {
            let data = tokio::fs::read(&cached).await?;
            return Ok((STANDARD.encode(data), filename));
        }
        if !(icon.starts_with("http://") || icon.starts_with("https://")) {
            return Ok((String::new(), String::new()));
        }

        let data = self.get(icon).await?;
        if let Some(parent) = cached.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&cached, &data).await?;
        Ok((STANDARD.encode(data), filename))
    }
}

fn untar(data: &[u8]) -> Result<Vec<ChartFile>> {
    let mut archive = tar::Archive::new(GzDecoder::new(data));
    let mut files = Vec::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let name = entry.path()?.to_string_lossy().into_owned();
        let mut contents = Vec::new();
        entry.read_to_end(&mut contents)?;
        files.push(ChartFile {
            name,
            contents: String::from_utf8_lossy(&contents).into_owned(),
        });
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::{write::GzEncoder, Compression};

    #[test]
    fn versions_sort_newest_first() {
        let mut index = IndexFile::parse(
            br#"
apiVersion: v1
entries:
  mysql:
    - name: mysql
      version: 0.9.0
    - name: mysql
      version: 0.10.1
    - name: mysql
      version: v0.10.0
"#,
        )
        .unwrap();
        index.sort_entries();
        let order: Vec<&str> = index.entries["mysql"].iter().map(|v| v.version.as_str()).collect();
        assert_eq!(order, vec!["0.10.1", "v0.10.0", "0.9.0"]);
    }

    #[tokio::test]
    async fn index_is_generated_from_chart_folders() {
        let dir = tempfile::tempdir().unwrap();
        let version_dir = dir.path().join("charts/redis/1.0.0");
        std::fs::create_dir_all(version_dir.join("templates")).unwrap();
        std::fs::write(
            version_dir.join("Chart.yaml"),
            "name: redis\nversion: 1.0.0\ndescription: cache\n",
        )
        .unwrap();
        std::fs::write(version_dir.join("templates/deploy.yaml"), "kind: Deployment\n").unwrap();

        let index = load_index(dir.path()).await.unwrap();
        let redis = &index.entries["redis"][0];
        assert_eq!(redis.description, "cache");
        assert_eq!(redis.urls, vec!["charts/redis/1.0.0".to_string()]);
        assert_eq!(redis.digest.len(), 64);

        let client = ChartClient::new(reqwest::Client::new(), "", "");
        let files = client.fetch_files(dir.path(), None, redis).await.unwrap();
        let names: Vec<&str> = files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["redis/Chart.yaml", "redis/templates/deploy.yaml"]);
    }

    #[test]
    fn chart_archives_are_unpacked() {
        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
        let body = b"name: nginx\nversion: 2.1.0\n";
        let mut header = tar::Header::new_gnu();
        header.set_size(body.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, "nginx/Chart.yaml", &body[..]).unwrap();
        let data = builder.into_inner().unwrap().finish().unwrap();

        let files = untar(&data).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].name, "nginx/Chart.yaml");
        assert!(files[0].contents.contains("2.1.0"));
    }
}
