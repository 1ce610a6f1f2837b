use reqwest::Url;

use super::CatalogError;

const SCHEME: &str = "catalog://?";

/// Parsed `catalog://?catalog=[<ns>/]<name>&template=<folder>&version=<ver>`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExternalId {
    pub namespace: String,
    pub catalog: String,
    pub template: String,
    pub version: String,
}

impl ExternalId {
    pub fn new(namespace: &str, catalog: &str, template: &str, version: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            catalog: catalog.to_string(),
            template: template.to_string(),
            version: version.to_string(),
        }
    }

    pub fn parse(id: &str) -> Result<Self, CatalogError> {
        let invalid = || CatalogError::InvalidExternalId(id.to_string());
        if !id.starts_with(SCHEME) {
            return Err(invalid());
        }
        let url = Url::parse(id).map_err(|_| invalid())?;

        let mut parsed = ExternalId::default();
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "catalog" => match value.split_once('/') {
                    Some((ns, name)) => {
                        parsed.namespace = ns.to_string();
                        parsed.catalog = name.to_string();
                    }
                    None => parsed.catalog = value.into_owned(),
                },
                "template" => parsed.template = value.into_owned(),
                "version" => parsed.version = value.into_owned(),
                _ => {}
            }
        }
        if parsed.catalog.is_empty() || parsed.template.is_empty() {
            return Err(invalid());
        }
        Ok(parsed)
    }
}

impl std::fmt::Display for ExternalId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.namespace.is_empty() {
            write!(
                f,
                "{}catalog={}&template={}&version={}",
                SCHEME, self.catalog, self.template, self.version
            )
        } else {
            write!(
                f,
                "{}catalog={}/{}&template={}&version={}",
                SCHEME, self.namespace, self.catalog, self.template, self.version
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_and_namespaced_forms() {
        let global = ExternalId::new("", "library", "mysql", "1.2.0");
        assert_eq!(
            global.to_string(),
            "catalog://?catalog=library&template=mysql&version=1.2.0"
        );
        assert_eq!(ExternalId::parse(&global.to_string()).unwrap(), global);

        let scoped = ExternalId::parse("catalog://?catalog=p-xyz/team&template=redis&version=0.3.1").unwrap();
        assert_eq!(scoped, ExternalId::new("p-xyz", "team", "redis", "0.3.1"));
    }

    #[test]
    fn namespaced_ids_survive_format_and_parse() {
        let id = ExternalId::new("c-abc", "helm", "wordpress", "5.0.1");
        assert_eq!(
            id.to_string(),
            "catalog://?catalog=c-abc/helm&template=wordpress&version=5.0.1"
        );
        assert_eq!(ExternalId::parse(&id.to_string()).unwrap(), id);
    }

    #[test]
    fn encoded_values_are_decoded() {
        let id = ExternalId::parse("catalog://?catalog=p-xyz%2Fteam&template=my%20app&version=1.0.0").unwrap();
        assert_eq!(id, ExternalId::new("p-xyz", "team", "my app", "1.0.0"));
    }

    #[test]
    fn rejects_other_schemes() {
        assert!(ExternalId::parse("https://example.com").is_err());
        assert!(ExternalId::parse("catalog://?version=1").is_err());
    }
}
