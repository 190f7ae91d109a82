use kube::discovery::{ApiResource, Discovery, Scope};
use std::collections::HashMap;

use crate::errors::BurnerError;

/// A `(apiVersion, kind)` pair resolved to its REST endpoint and scope.
#[derive(Debug, Clone)]
pub struct MappedResource {
    pub api_resource: ApiResource,
    pub namespaced: bool,
}

impl MappedResource {
    pub fn new(api_version: &str, kind: &str, plural: &str, namespaced: bool) -> Self {
        let (group, version) = split_api_version(api_version);
        MappedResource {
            api_resource: ApiResource {
                group: group.to_string(),
                version: version.to_string(),
                api_version: api_version.to_string(),
                kind: kind.to_string(),
                plural: plural.to_string(),
            },
            namespaced,
        }
    }
}

/// Resolves `(apiVersion, kind)` pairs against the cluster's discovery data.
/// Built once per run; `from_entries` seeds the cache statically for tests
/// and offline use.
pub struct RestMapper {
    discovery: Option<Discovery>,
    cache: HashMap<(String, String), MappedResource>,
}

impl RestMapper {
    pub async fn discover(client: &kube::Client) -> Result<Self, BurnerError> {
        let discovery = Discovery::new(client.clone())
            .run()
            .await
            .map_err(BurnerError::from)?;
        Ok(RestMapper {
            discovery: Some(discovery),
            cache: HashMap::new(),
        })
    }

    pub fn from_entries<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = MappedResource>,
    {
        let cache = entries
            .into_iter()
            .map(|entry| {
                let key = (entry.api_resource.api_version.clone(), entry.api_resource.kind.clone());
                (key, entry)
            })
            .collect();
        RestMapper {
            discovery: None,
            cache,
        }
    }

    pub fn resolve(&self, api_version: &str, kind: &str) -> Result<MappedResource, BurnerError> {
        if let Some(mapped) = self.cache.get(&(api_version.to_string(), kind.to_string())) {
            return Ok(mapped.clone());
        }

        let discovery = self.discovery.as_ref().ok_or_else(|| unknown(api_version, kind))?;

        let (group, version) = split_api_version(api_version);
        let gvk = kube::core::GroupVersionKind {
            group: group.to_string(),
            version: version.to_string(),
            kind: kind.to_string(),
        };

        let (api_resource, capabilities) = discovery.resolve_gvk(&gvk).ok_or_else(|| unknown(api_version, kind))?;

        Ok(MappedResource {
            namespaced: capabilities.scope == Scope::Namespaced,
            api_resource,
        })
    }
}

fn unknown(api_version: &str, kind: &str) -> BurnerError {
    BurnerError::UnknownKind {
        api_version: api_version.to_string(),
        kind: kind.to_string(),
    }
}

/// "apps/v1" -> ("apps", "v1"); "v1" -> ("", "v1") for the core group.
pub fn split_api_version(api_version: &str) -> (&str, &str) {
    match api_version.rsplit_once('/') {
        Some((group, version)) => (group, version),
        None => ("", api_version),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_api_version() {
        assert_eq!(split_api_version("v1"), ("", "v1"));
        assert_eq!(split_api_version("apps/v1"), ("apps", "v1"));
        assert_eq!(split_api_version("kubevirt.io/v1"), ("kubevirt.io", "v1"));
    }

    #[test]
    fn test_static_entries_resolve() {
        let mapper = RestMapper::from_entries([
            MappedResource::new("v1", "Pod", "pods", true),
            MappedResource::new("apps/v1", "Deployment", "deployments", true),
            MappedResource::new("v1", "Namespace", "namespaces", false),
        ]);

        let pod = mapper.resolve("v1", "Pod").unwrap();
        assert_eq!(pod.api_resource.plural, "pods");
        assert!(pod.namespaced);

        let ns = mapper.resolve("v1", "Namespace").unwrap();
        assert!(!ns.namespaced);

        let deploy = mapper.resolve("apps/v1", "Deployment").unwrap();
        assert_eq!(deploy.api_resource.group, "apps");
    }

    #[test]
    fn test_unknown_kind() {
        let mapper = RestMapper::from_entries([]);
        let err = mapper.resolve("widgets.io/v1", "Widget").unwrap_err();
        assert_eq!(
            err,
            BurnerError::UnknownKind {
                api_version: "widgets.io/v1".to_string(),
                kind: "Widget".to_string(),
            }
        );
    }
}
