// Chart index to Template/TemplateVersion records

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use super::external_id::ExternalId;
use super::helm::{parse_version, ChartFile, ChartVersion};
use super::{CatalogError, Result};
use crate::models::catalog::{
    Catalog, CatalogScope, Question, Template, TemplateSpec, TemplateVersion, TemplateVersionSpec,
    TemplateVersionSummary,
};
use crate::models::ObjectMeta;

/// Namespace holding templates of global catalogs.
pub const GLOBAL_NAMESPACE: &str = "cattle-global-data";
pub const TEMPLATE_NAME_LABEL: &str = "catalog.cattle.io/template_name";

const SUPPORTED_FILES: [&str; 4] = ["catalog.yml", "catalog.yaml", "questions.yml", "questions.yaml"];

/// `catalog.yml` / `questions.yml` of a chart version.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CatalogYml {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub rancher_version: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub categories: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub questions: Vec<Question>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

pub fn template_namespace(catalog: &Catalog) -> String {
    match catalog.spec.scope {
        CatalogScope::Global => GLOBAL_NAMESPACE.to_string(),
        _ => catalog.metadata.namespace.clone(),
    }
}

pub fn template_name(catalog: &str, chart: &str) -> String {
    format!("{}-{}", catalog, chart)
}

pub fn version_name(template: &str, version: &str) -> String {
    format!("{}-{}", template, version)
}

pub fn external_id(catalog: &Catalog, folder: &str, version: &str) -> String {
    let namespace = match catalog.spec.scope {
        CatalogScope::Global => String::new(),
        _ => template_namespace(catalog),
    };
    ExternalId::new(&namespace, catalog.name(), folder, version).to_string()
}

/// A chart changed when a version digest differs, a version was added, or
/// a version was removed.
pub fn chart_changed(stored: Option<&BTreeMap<String, String>>, versions: &[ChartVersion]) -> bool {
    let Some(stored) = stored else {
        return true;
    };
    let mut known = 0;
    for version in versions {
        match stored.get(&version.version) {
            Some(digest) if *digest == version.digest => known += 1,
            Some(_) => return true,
            None => return true,
        }
    }
    known != stored.len()
}

/// Upgrade links only point at strictly newer SemVer versions.
pub fn show_upgrade_links(current: &str, candidate: &str) -> bool {
    match (parse_version(current), parse_version(candidate)) {
        (Some(current), Some(candidate)) => candidate > current,
        _ => false,
    }
}

/// Template record for a chart with scope ids and labels applied. `versions`
/// is newest first.
pub fn template_skeleton(
    catalog: &Catalog,
    chart: &str,
    versions: &[ChartVersion],
    icon: (String, String),
) -> Result<Template> {
    let newest = versions.first().cloned().unwrap_or_default();
    let namespace = template_namespace(catalog);
    let mut template = Template {
        metadata: ObjectMeta::namespaced(&namespace, template_name(catalog.name(), chart)),
        spec: TemplateSpec {
            display_name: chart.to_string(),
            description: newest.description,
            default_version: newest.version,
            project_url: newest.sources.first().cloned().unwrap_or_default(),
            icon: icon.0,
            icon_filename: icon.1,
            folder_name: chart.to_string(),
            ..Default::default()
        },
    };

    match &catalog.spec.scope {
        CatalogScope::Global => template.spec.catalog_id = catalog.name().to_string(),
        CatalogScope::Cluster { cluster_id } => {
            template.spec.cluster_catalog_id = format!("{}:{}", namespace, catalog.name());
            template.spec.cluster_id = cluster_id.clone();
            template
                .metadata
                .labels
                .insert(format!("{}-{}", cluster_id, catalog.name()), catalog.name().to_string());
        }
        CatalogScope::Project { project_id } => {
            let Some((cluster_id, _)) = project_id.split_once(':') else {
                return Err(CatalogError::InvalidProject(project_id.clone()));
            };
            template.spec.project_catalog_id = format!("{}:{}", namespace, catalog.name());
            template.spec.project_id = project_id.clone();
            template.metadata.labels.insert(
                format!("{}-{}-{}", cluster_id, namespace, catalog.name()),
                catalog.name().to_string(),
            );
        }
    }
    Ok(template)
}

/// Version spec from the chart files, plus the parsed `catalog.yml`.
pub fn build_version(
    catalog: &Catalog,
    chart: &str,
    version: &ChartVersion,
    files: Vec<ChartFile>,
) -> Result<(TemplateVersionSpec, CatalogYml)> {
    let mut spec = TemplateVersionSpec {
        version: version.version.clone(),
        external_id: external_id(catalog, chart, &version.version),
        digest: version.digest.clone(),
        kube_version: version.kube_version.clone(),
        ..Default::default()
    };
    let mut catalog_yml = CatalogYml::default();

    for file in files {
        if chart_file(chart, &file.name, "readme.md") {
            spec.readme = file.contents.clone();
        }
        if chart_file(chart, &file.name, "app-readme.md") {
            spec.app_readme = file.contents.clone();
        }
        if is_catalog_yml(chart, &file.name) {
            let parsed: CatalogYml = serde_yaml::from_str(&file.contents)?;
            spec.questions = parsed.questions.clone();
            spec.rancher_version = parsed.rancher_version.clone();
            spec.required_namespace = parsed.namespace.clone();
            catalog_yml = parsed;
        }
        spec.files.insert(file.name, file.contents);
    }
    Ok((spec, catalog_yml))
}

fn chart_file(chart: &str, name: &str, file: &str) -> bool {
    name.eq_ignore_ascii_case(&format!("{}/{}", chart, file))
}

fn is_catalog_yml(chart: &str, name: &str) -> bool {
    SUPPORTED_FILES.iter().any(|f| chart_file(chart, name, f))
}

/// The `catalog.yml` of a version that was not fetched again, read back
/// from the files stored on its record.
pub fn stored_catalog_yml(chart: &str, spec: &TemplateVersionSpec) -> Result<CatalogYml> {
    let mut catalog_yml = CatalogYml::default();
    for (name, contents) in &spec.files {
        if is_catalog_yml(chart, name) {
            catalog_yml = serde_yaml::from_str(contents)?;
        }
    }
    Ok(catalog_yml)
}

/// Links each version to every strictly newer one.
pub fn link_upgrades(template: &str, versions: &mut [TemplateVersionSpec]) {
    let all: Vec<String> = versions.iter().map(|v| v.version.clone()).collect();
    for version in versions.iter_mut() {
        version.upgrade_version_links = all
            .iter()
            .filter(|candidate| show_upgrade_links(&version.version, candidate))
            .map(|candidate| (candidate.clone(), version_name(template, candidate)))
            .collect();
    }
}

/// Fills the template's version summaries, categories and labels from the
/// built versions and returns the version records.
pub fn assemble(
    template: &mut Template,
    specs: Vec<TemplateVersionSpec>,
    ymls: &[CatalogYml],
) -> Vec<TemplateVersion> {
    let mut categories = BTreeSet::new();
    for yml in ymls {
        categories.extend(yml.categories.iter().cloned());
        for (k, v) in &yml.labels {
            template.metadata.labels.insert(k.clone(), v.clone());
        }
    }
    template.spec.categories = categories.into_iter().collect();
    template.spec.versions = specs
        .iter()
        .map(|v| TemplateVersionSummary {
            version: v.version.clone(),
            external_id: v.external_id.clone(),
            digest: v.digest.clone(),
            upgrade_version_links: v.upgrade_version_links.clone(),
        })
        .collect();

    let name = template.metadata.name.clone();
    let namespace = template.metadata.namespace.clone();
    specs
        .into_iter()
        .map(|spec| TemplateVersion {
            metadata: ObjectMeta::namespaced(&namespace, version_name(&name, &spec.version))
                .with_label(TEMPLATE_NAME_LABEL, &name),
            spec,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::catalog::CatalogSpec;

    fn version(v: &str, digest: &str) -> ChartVersion {
        ChartVersion {
            name: "mysql".into(),
            version: v.into(),
            digest: digest.into(),
            ..Default::default()
        }
    }

    fn stored(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(v, d)| (v.to_string(), d.to_string())).collect()
    }

    #[test]
    fn change_detection() {
        let versions = vec![version("2.0.0", "d2"), version("1.0.0", "d1")];
        assert!(!chart_changed(Some(&stored(&[("1.0.0", "d1"), ("2.0.0", "d2")])), &versions));
        assert!(chart_changed(Some(&stored(&[("1.0.0", "d1")])), &versions));
        assert!(chart_changed(Some(&stored(&[("1.0.0", "dX"), ("2.0.0", "d2")])), &versions));
        assert!(chart_changed(
            Some(&stored(&[("1.0.0", "d1"), ("2.0.0", "d2"), ("0.9.0", "d0")])),
            &versions
        ));
        assert!(chart_changed(None, &versions));
    }

    #[test]
    fn upgrade_links_point_forward() {
        let mut specs: Vec<TemplateVersionSpec> = ["1.2.0", "1.10.0", "1.1.0"]
            .iter()
            .map(|v| TemplateVersionSpec {
                version: v.to_string(),
                ..Default::default()
            })
            .collect();
        link_upgrades("library-mysql", &mut specs);
        assert_eq!(specs[1].upgrade_version_links.len(), 0);
        assert_eq!(
            specs[2].upgrade_version_links.keys().collect::<Vec<_>>(),
            vec!["1.10.0", "1.2.0"]
        );
        assert_eq!(specs[0].upgrade_version_links["1.10.0"], "library-mysql-1.10.0");
    }

    #[test]
    fn project_scope_labels_and_ids() {
        let catalog = Catalog {
            metadata: ObjectMeta::namespaced("p-abc", "team"),
            spec: CatalogSpec {
                scope: CatalogScope::Project {
                    project_id: "c-1:p-abc".into(),
                },
                ..Default::default()
            },
            ..Default::default()
        };
        let template = template_skeleton(&catalog, "redis", &[version("1.0.0", "d")], Default::default()).unwrap();
        assert_eq!(template.metadata.name, "team-redis");
        assert_eq!(template.spec.project_catalog_id, "p-abc:team");
        assert_eq!(template.metadata.labels["c-1-p-abc-team"], "team");
        assert_eq!(
            external_id(&catalog, "redis", "1.0.0"),
            "catalog://?catalog=p-abc/team&template=redis&version=1.0.0"
        );

        let invalid = Catalog {
            spec: CatalogSpec {
                scope: CatalogScope::Project {
                    project_id: "p-abc".into(),
                },
                ..Default::default()
            },
            ..catalog
        };
        assert!(template_skeleton(&invalid, "redis", &[], Default::default()).is_err());
    }

    #[test]
    fn catalog_yml_feeds_version_and_template() {
        let catalog = Catalog {
            metadata: ObjectMeta::named("library"),
            ..Default::default()
        };
        let files = vec![
            ChartFile {
                name: "mysql/README.md".into(),
                contents: "# MySQL".into(),
            },
            ChartFile {
                name: "mysql/questions.yml".into(),
                contents: "rancher_version: '>=2.0'\nnamespace: db\ncategories: [Database]\nlabels:\n  io.rancher.certified: partner\nquestions:\n- variable: rootPassword\n  type: password\n  required: true\n".into(),
            },
        ];
        let (spec, yml) = build_version(&catalog, "mysql", &version("1.0.0", "d1"), files).unwrap();
        assert_eq!(spec.readme, "# MySQL");
        assert_eq!(spec.required_namespace, "db");
        assert_eq!(spec.questions[0].kind, "password");
        assert_eq!(spec.external_id, "catalog://?catalog=library&template=mysql&version=1.0.0");

        let mut template =
            template_skeleton(&catalog, "mysql", &[version("1.0.0", "d1")], Default::default()).unwrap();
        let records = assemble(&mut template, vec![spec], &[yml]);
        assert_eq!(template.spec.categories, vec!["Database".to_string()]);
        assert_eq!(template.metadata.labels["io.rancher.certified"], "partner");
        assert_eq!(records[0].metadata.name, "library-mysql-1.0.0");
        assert_eq!(records[0].metadata.label(TEMPLATE_NAME_LABEL), Some("library-mysql"));
    }

    #[test]
    fn catalog_yml_keeps_every_field_through_yaml() {
        let yml = CatalogYml {
            rancher_version: ">=2.1".into(),
            categories: vec!["Database".into(), "CMS".into()],
            questions: vec![Question {
                variable: "persistence.size".into(),
                label: "Volume size".into(),
                kind: "string".into(),
                default: "8Gi".into(),
                required: true,
                ..Default::default()
            }],
            namespace: "wordpress".into(),
            labels: BTreeMap::from([("io.rancher.certified".to_string(), "partner".to_string())]),
        };
        let bytes = serde_yaml::to_string(&yml).unwrap();
        let decoded: CatalogYml = serde_yaml::from_str(&bytes).unwrap();
        assert_eq!(decoded, yml);
    }

    #[test]
    fn stored_files_give_back_the_catalog_yml() {
        let spec = TemplateVersionSpec {
            files: BTreeMap::from([
                ("mysql/Chart.yaml".to_string(), "name: mysql\n".to_string()),
                (
                    "mysql/catalog.yml".to_string(),
                    "categories: [Database]\nlabels:\n  team: blue\n".to_string(),
                ),
            ]),
            ..Default::default()
        };
        let yml = stored_catalog_yml("mysql", &spec).unwrap();
        assert_eq!(yml.categories, vec!["Database".to_string()]);
        assert_eq!(yml.labels["team"], "blue");
        assert_eq!(stored_catalog_yml("other", &spec).unwrap(), CatalogYml::default());
    }
}
