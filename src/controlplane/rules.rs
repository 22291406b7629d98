//! Security group rule reconciler
//!
//! Generic diff-and-apply engine over inbound rules. Used for the CIDR
//! ingress rules of the front-end group and for the membership rules that
//! let the front-end group reach the backend group.

use crate::domain::ports::CloudApiRef;
use crate::domain::types::{SecurityGroup, SecurityGroupRule};
use crate::error::Result;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

/// Desired principals per port
pub type DesiredRules = BTreeMap<i32, BTreeSet<String>>;

/// Which principal list of a rule is reconciled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrincipalKind {
    /// CIDR ranges
    Cidr,
    /// Member security group ids
    Member,
}

impl PrincipalKind {
    fn principals<'a>(&self, rule: &'a SecurityGroupRule) -> &'a [String] {
        match self {
            PrincipalKind::Cidr => &rule.ip_ranges,
            PrincipalKind::Member => &rule.member_groups,
        }
    }

    fn rule(&self, template: &SecurityGroupRule, principals: BTreeSet<String>) -> SecurityGroupRule {
        let principals: Vec<String> = principals.into_iter().collect();
        let mut rule = SecurityGroupRule {
            protocol: template.protocol.clone(),
            from_port: template.from_port,
            to_port: template.to_port,
            ip_ranges: Vec::new(),
            member_groups: Vec::new(),
        };
        match self {
            PrincipalKind::Cidr => rule.ip_ranges = principals,
            PrincipalKind::Member => rule.member_groups = principals,
        }
        rule
    }
}

/// Calls needed to converge a group
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RulePlan {
    pub add: Vec<SecurityGroupRule>,
    pub remove: Vec<SecurityGroupRule>,
}

impl RulePlan {
    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.remove.is_empty()
    }
}

/// Compute the minimal add/remove calls.
///
/// `managed` restricts removal to the listed principals; principals outside
/// it belong to someone else and are never touched.
pub fn plan_rules(
    existing: &[SecurityGroupRule],
    desired: &DesiredRules,
    kind: PrincipalKind,
    managed: Option<&BTreeSet<String>>,
) -> RulePlan {
    let mut plan = RulePlan::default();

    for (port, wanted) in desired {
        let present: BTreeSet<&str> = existing
            .iter()
            .filter(|r| r.matches_port("tcp", *port))
            .flat_map(|r| kind.principals(r).iter().map(String::as_str))
            .collect();
        let missing: BTreeSet<String> = wanted
            .iter()
            .filter(|p| !present.contains(p.as_str()))
            .cloned()
            .collect();
        if !missing.is_empty() {
            let template = SecurityGroupRule::tcp_cidrs(*port, Vec::new());
            plan.add.push(kind.rule(&template, missing));
        }
    }

    for rule in existing {
        let owned: BTreeSet<String> = kind
            .principals(rule)
            .iter()
            .filter(|p| managed.map_or(true, |m| m.contains(*p)))
            .cloned()
            .collect();
        if owned.is_empty() {
            continue;
        }

        let wanted = if rule.protocol.eq_ignore_ascii_case("tcp") && rule.from_port == rule.to_port {
            desired.get(&rule.from_port)
        } else {
            None
        };

        let stale: BTreeSet<String> = match wanted {
            Some(wanted) => owned.into_iter().filter(|p| !wanted.contains(p)).collect(),
            None => owned,
        };
        if !stale.is_empty() {
            plan.remove.push(kind.rule(rule, stale));
        }
    }

    plan
}

/// Applies rule plans through the cloud API
pub struct RuleReconciler {
    cloud: CloudApiRef,
}

impl RuleReconciler {
    pub fn new(cloud: CloudApiRef) -> Self {
        Self { cloud }
    }

    /// Converge `group` toward `desired`; returns the number of calls made
    pub async fn reconcile(
        &self,
        group: &SecurityGroup,
        desired: &DesiredRules,
        kind: PrincipalKind,
        managed: Option<&BTreeSet<String>>,
    ) -> Result<usize> {
        let plan = plan_rules(&group.inbound_rules, desired, kind, managed);
        if plan.is_empty() {
            debug!(sg = %group.id, ?kind, "Security group rules up to date");
            return Ok(0);
        }

        let calls = plan.add.len() + plan.remove.len();
        for rule in plan.add {
            info!(
                sg = %group.id,
                port = rule.from_port,
                cidrs = ?rule.ip_ranges,
                members = ?rule.member_groups,
                "Adding security group rule"
            );
            self.cloud.create_security_group_rule(&group.id, rule).await?;
        }
        for rule in plan.remove {
            info!(
                sg = %group.id,
                port = rule.from_port,
                cidrs = ?rule.ip_ranges,
                members = ?rule.member_groups,
                "Removing security group rule"
            );
            self.cloud.delete_security_group_rule(&group.id, rule).await?;
        }

        Ok(calls)
    }
}

/// Same principals on every port
pub fn uniform_rules(ports: impl IntoIterator<Item = i32>, principals: &BTreeSet<String>) -> DesiredRules {
    ports
        .into_iter()
        .map(|port| (port, principals.clone()))
        .collect()
}
