//! Ownership guard
//!
//! Tag-based identity check run before any mutation: a resource carrying
//! another cluster's ownership tag, or pinned to another Service, must not
//! be touched.

use crate::domain::tags::{owning_clusters, SERVICE_TAG};
use crate::domain::types::Tags;
use crate::error::{Error, Result};

/// Checks resource tags against the caller's identity
#[derive(Debug, Clone)]
pub struct OwnershipGuard {
    /// Cluster ids accepted as "us"
    accepted_clusters: Vec<String>,
}

impl OwnershipGuard {
    pub fn new(accepted_clusters: Vec<String>) -> Self {
        Self { accepted_clusters }
    }

    /// Fail when `tags` show the resource belongs to someone else.
    ///
    /// Untagged resources pass.
    pub fn check(&self, name: &str, tags: &Tags, service_name: &str) -> Result<()> {
        let clusters = owning_clusters(tags);
        if !clusters.is_empty()
            && !clusters
                .iter()
                .any(|c| self.accepted_clusters.iter().any(|a| a == c))
        {
            return Err(Error::BelongsToAnotherCluster {
                name: name.to_string(),
                cluster: clusters.join(","),
            });
        }

        if let Some(owner) = tags.get(SERVICE_TAG) {
            if !owner.is_empty() && owner != service_name {
                return Err(Error::BelongsToAnotherService {
                    name: name.to_string(),
                    service: owner.clone(),
                });
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::tags::{cluster_tag_key, ownership_tags};
    use assert_matches::assert_matches;

    fn guard() -> OwnershipGuard {
        OwnershipGuard::new(vec!["foo".into(), "foo-legacy".into()])
    }

    #[test]
    fn test_untagged_and_matching_pass() {
        assert!(guard().check("lb", &Tags::new(), "shop/web").is_ok());
        assert!(guard()
            .check("lb", &ownership_tags("foo", "shop/web"), "shop/web")
            .is_ok());
        assert!(guard()
            .check("lb", &ownership_tags("foo-legacy", "shop/web"), "shop/web")
            .is_ok());
    }

    #[test]
    fn test_other_cluster_is_rejected() {
        let mut tags = Tags::new();
        tags.insert(cluster_tag_key("bar"), "owned".into());
        assert_matches!(
            guard().check("lb", &tags, "shop/web"),
            Err(Error::BelongsToAnotherCluster { cluster, .. }) if cluster == "bar"
        );
    }

    #[test]
    fn test_other_service_is_rejected() {
        let tags = ownership_tags("foo", "shop/api");
        assert_matches!(
            guard().check("lb", &tags, "shop/web"),
            Err(Error::BelongsToAnotherService { service, .. }) if service == "shop/api"
        );
    }
}
