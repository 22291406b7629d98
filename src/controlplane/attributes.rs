//! Attribute and health check reconcilers (classic load balancers)

use crate::domain::ports::CloudApiRef;
use crate::domain::types::{AccessLog, AttributeUpdate, ConnectionSettings, HealthCheck, LoadBalancer};
use crate::error::Result;
use crate::spec::LoadBalancerSpec;
use tracing::{debug, info};

/// Idle timeout the cloud applies when none is configured
const CLOUD_IDLE_TIMEOUT: i32 = 60;

fn access_log_differs(live: Option<&AccessLog>, expected: &AccessLog) -> bool {
    match live {
        Some(live) => live != expected,
        None => expected.enabled,
    }
}

fn connection_differs(live: Option<&ConnectionSettings>, expected: &ConnectionSettings) -> bool {
    match live {
        Some(live) => live != expected,
        None => {
            expected.draining_enabled
                || expected.draining_timeout != 0
                || expected.idle_timeout != CLOUD_IDLE_TIMEOUT
        }
    }
}

/// Writes access-log and connection blocks, one call per differing block
pub struct AttributeReconciler {
    cloud: CloudApiRef,
}

impl AttributeReconciler {
    pub fn new(cloud: CloudApiRef) -> Self {
        Self { cloud }
    }

    pub async fn reconcile(&self, spec: &LoadBalancerSpec, lb: &LoadBalancer) -> Result<usize> {
        let mut calls = 0;

        let access_log = spec.access_log.to_access_log();
        if access_log_differs(lb.attributes.access_log.as_ref(), &access_log) {
            info!(lb = %lb.name, enabled = access_log.enabled, "Updating access log attributes");
            self.cloud
                .update_attributes(&lb.name, AttributeUpdate::AccessLog(access_log))
                .await?;
            calls += 1;
        }

        let connection = spec.connection.to_settings();
        if connection_differs(lb.attributes.connection.as_ref(), &connection) {
            info!(
                lb = %lb.name,
                draining = connection.draining_enabled,
                idle_timeout = connection.idle_timeout,
                "Updating connection attributes"
            );
            self.cloud
                .update_attributes(&lb.name, AttributeUpdate::Connection(connection))
                .await?;
            calls += 1;
        }

        if calls == 0 {
            debug!(lb = %lb.name, "Attributes up to date");
        }
        Ok(calls)
    }
}

/// Whether two health checks are equivalent; path only counts for http(s)
fn health_check_matches(live: &HealthCheck, expected: &HealthCheck) -> bool {
    let uses_path = matches!(
        expected.protocol.to_ascii_lowercase().as_str(),
        "http" | "https"
    );
    live.protocol.eq_ignore_ascii_case(&expected.protocol)
        && live.port == expected.port
        && live.interval == expected.interval
        && live.timeout == expected.timeout
        && live.healthy_threshold == expected.healthy_threshold
        && live.unhealthy_threshold == expected.unhealthy_threshold
        && (!uses_path || live.path == expected.path)
}

/// Replaces the health check whenever any field differs
pub struct HealthCheckReconciler {
    cloud: CloudApiRef,
}

impl HealthCheckReconciler {
    pub fn new(cloud: CloudApiRef) -> Self {
        Self { cloud }
    }

    pub async fn reconcile(&self, spec: &LoadBalancerSpec, lb: &LoadBalancer) -> Result<usize> {
        let expected = match &spec.health_check {
            Some(hc) => hc.to_health_check(),
            None => return Ok(0),
        };
        if let Some(live) = &lb.health_check {
            if health_check_matches(live, &expected) {
                return Ok(0);
            }
        }

        info!(
            lb = %lb.name,
            port = expected.port,
            protocol = %expected.protocol,
            "Configuring health check"
        );
        self.cloud.configure_health_check(&lb.name, expected).await?;
        Ok(1)
    }
}
