//! Tag vocabulary
//!
//! Tags carry ownership (which cluster, which Service), discovery roles for
//! subnets and security groups, and the garbage-collection mark.

use super::types::Tags;

/// Prefix of the cluster ownership tag key; the cluster id follows it
pub const CLUSTER_ID_TAG_PREFIX: &str = "OscK8sClusterID/";

/// Value of the cluster ownership tag for resources this cluster created
pub const CLUSTER_OWNED: &str = "owned";

/// Tag pinning a resource to one Service (`<namespace>/<name>`)
pub const SERVICE_TAG: &str = "OscK8sService";

/// Resource display name
pub const NAME_TAG: &str = "Name";

/// Prefix of role tags on subnets and security groups
pub const ROLE_TAG_PREFIX: &str = "OscK8sRole/";

/// Prefix of the main security group tag; the cluster id follows it
pub const MAIN_SG_TAG_PREFIX: &str = "OscK8sMainSG/";

/// Marks a security group for the garbage collector
pub const TO_DELETE_TAG: &str = "OscK8sToDelete";

/// Marks a public IP allocated by this controller; value is the LB name
pub const MANAGED_IP_TAG: &str = "OscK8sManagedIP";

/// Public IP pool membership; value is the pool name
pub const PUBLIC_IP_POOL_TAG: &str = "OscPublicIpPool";

// Subnet roles, in discovery priority order
pub const ROLE_PUBLIC_ELB: &str = "public-elb";
pub const ROLE_INTERNAL_ELB: &str = "internal-elb";
pub const ROLE_SERVICE: &str = "service";
pub const ROLE_INTERNAL_SERVICE: &str = "internal-service";
pub const ROLE_LOADBALANCER: &str = "loadbalancer";

/// Ownership tag key for a cluster
pub fn cluster_tag_key(cluster_id: &str) -> String {
    format!("{}{}", CLUSTER_ID_TAG_PREFIX, cluster_id)
}

/// Role tag key for a role
pub fn role_tag_key(role: &str) -> String {
    format!("{}{}", ROLE_TAG_PREFIX, role)
}

/// Main security group tag key for a cluster
pub fn main_sg_tag_key(cluster_id: &str) -> String {
    format!("{}{}", MAIN_SG_TAG_PREFIX, cluster_id)
}

/// Cluster ids found in ownership tags
pub fn owning_clusters(tags: &Tags) -> Vec<&str> {
    tags.keys()
        .filter_map(|k| k.strip_prefix(CLUSTER_ID_TAG_PREFIX))
        .filter(|id| !id.is_empty())
        .collect()
}

/// Number of role tags carried
pub fn role_count(tags: &Tags) -> usize {
    tags.keys().filter(|k| k.starts_with(ROLE_TAG_PREFIX)).count()
}

/// Tags identifying a resource owned by `cluster_id` for `service_name`
pub fn ownership_tags(cluster_id: &str, service_name: &str) -> Tags {
    let mut tags = Tags::new();
    tags.insert(cluster_tag_key(cluster_id), CLUSTER_OWNED.to_string());
    tags.insert(SERVICE_TAG.to_string(), service_name.to_string());
    tags
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owning_clusters() {
        let mut tags = Tags::new();
        tags.insert(cluster_tag_key("foo"), CLUSTER_OWNED.into());
        tags.insert(cluster_tag_key("bar"), "shared".into());
        tags.insert(NAME_TAG.into(), "sg".into());

        let mut clusters = owning_clusters(&tags);
        clusters.sort();
        assert_eq!(clusters, vec!["bar", "foo"]);
    }

    #[test]
    fn test_role_count() {
        let mut tags = Tags::new();
        tags.insert(role_tag_key("worker"), String::new());
        tags.insert(role_tag_key("service"), String::new());
        tags.insert(main_sg_tag_key("foo"), "True".into());
        assert_eq!(role_count(&tags), 2);
    }
}
