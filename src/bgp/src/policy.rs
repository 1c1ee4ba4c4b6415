use std::net::IpAddr;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::{family::Family, path::PathAttributes};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyDirection {
    Import,
    Export,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteAction {
    #[default]
    None,
    Accept,
    Reject,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrefixMatch {
    pub cidr: IpNet,
    pub prefix_len_min: u8,
    pub prefix_len_max: u8,
}

impl PrefixMatch {
    /// Exact match on a single prefix.
    pub fn exact(cidr: IpNet) -> Self {
        PrefixMatch {
            cidr,
            prefix_len_min: cidr.prefix_len(),
            prefix_len_max: cidr.prefix_len(),
        }
    }

    pub fn matches(&self, prefix: &IpNet) -> bool {
        self.cidr.contains(prefix)
            && prefix.prefix_len() >= self.prefix_len_min
            && prefix.prefix_len() <= self.prefix_len_max
    }
}

/// Empty lists match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conditions {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_neighbors: Vec<IpAddr>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_prefixes: Vec<PrefixMatch>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_families: Vec<Family>,
}

impl Conditions {
    pub fn matches(&self, neighbor: IpAddr, prefix: &IpNet) -> bool {
        (self.match_neighbors.is_empty() || self.match_neighbors.contains(&neighbor))
            && (self.match_prefixes.is_empty()
                || self.match_prefixes.iter().any(|m| m.matches(prefix)))
            && (self.match_families.is_empty()
                || self.match_families.iter().any(|f| f.carries(prefix)))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Actions {
    pub route_action: RouteAction,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub add_communities: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub add_large_communities: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub set_local_preference: Option<u32>,
}

impl Actions {
    fn apply(&self, attrs: &mut PathAttributes) {
        attrs.merge(&PathAttributes {
            communities: self.add_communities.clone(),
            large_communities: self.add_large_communities.clone(),
            local_preference: self.set_local_preference,
        });
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Statement {
    pub conditions: Conditions,
    pub actions: Actions,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutePolicy {
    pub name: String,
    pub direction: PolicyDirection,
    pub statements: Vec<Statement>,
}

impl RoutePolicy {
    pub fn new(name: &str, direction: PolicyDirection) -> Self {
        RoutePolicy {
            name: name.to_string(),
            direction,
            statements: Vec::new(),
        }
    }

    pub fn statement(mut self, statement: Statement) -> Self {
        self.statements.push(statement);
        self
    }
}

/// Outcome of running a prefix through a set of policies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Accept(PathAttributes),
    Reject,
}

/// Evaluate policies of `direction` for a prefix exchanged with `neighbor`.
///
/// Policies run in name order and statements in declaration order. A
/// matching statement applies its attribute actions; an Accept or Reject
/// action ends evaluation. Falling through every policy accepts the path.
pub fn evaluate(
    policies: &[RoutePolicy],
    direction: PolicyDirection,
    neighbor: IpAddr,
    prefix: &IpNet,
    attributes: &PathAttributes,
) -> Verdict {
    let mut ordered: Vec<&RoutePolicy> = policies
        .iter()
        .filter(|p| p.direction == direction)
        .collect();
    ordered.sort_by(|a, b| a.name.cmp(&b.name));

    let mut attrs = attributes.clone();
    for policy in ordered.iter() {
        for stmt in policy.statements.iter() {
            if !stmt.conditions.matches(neighbor, prefix) {
                continue;
            }
            stmt.actions.apply(&mut attrs);
            match stmt.actions.route_action {
                RouteAction::Accept => return Verdict::Accept(attrs),
                RouteAction::Reject => return Verdict::Reject,
                RouteAction::None => {}
            }
        }
    }
    Verdict::Accept(attrs)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn export_for(peer: &str, prefix: &str, action: RouteAction) -> RoutePolicy {
        RoutePolicy::new(&format!("{}-{}", peer, prefix), PolicyDirection::Export).statement(
            Statement {
                conditions: Conditions {
                    match_neighbors: vec![peer.parse().unwrap()],
                    match_prefixes: vec![PrefixMatch::exact(prefix.parse().unwrap())],
                    match_families: vec![],
                },
                actions: Actions {
                    route_action: action,
                    add_communities: vec!["65000:100".to_string()],
                    ..Default::default()
                },
            },
        )
    }

    #[rstest(
        cidr,
        min,
        max,
        prefix,
        expected,
        case("10.0.0.0/8", 8, 32, "10.1.0.0/16", true),
        case("10.0.0.0/8", 8, 16, "10.1.1.0/24", false),
        case("10.0.0.0/8", 8, 32, "192.168.0.0/24", false),
        case("2001:db8::/32", 32, 128, "2001:db8:1::/48", true)
    )]
    fn test_prefix_match(cidr: &str, min: u8, max: u8, prefix: &str, expected: bool) {
        let m = PrefixMatch {
            cidr: cidr.parse().unwrap(),
            prefix_len_min: min,
            prefix_len_max: max,
        };
        assert_eq!(expected, m.matches(&prefix.parse().unwrap()));
    }

    #[rstest(
        neighbor,
        prefix,
        expected,
        case("10.0.0.1", "10.100.0.0/24", Verdict::Accept(PathAttributes { communities: vec!["65000:100".to_string()], ..Default::default() })),
        case("10.0.0.2", "10.100.0.0/24", Verdict::Reject),
        case("10.0.0.1", "10.200.0.0/24", Verdict::Accept(PathAttributes::default()))
    )]
    fn test_evaluate_export(neighbor: &str, prefix: &str, expected: Verdict) {
        let policies = vec![
            export_for("10.0.0.1", "10.100.0.0/24", RouteAction::Accept),
            export_for("10.0.0.2", "10.100.0.0/24", RouteAction::Reject),
        ];
        let got = evaluate(
            &policies,
            PolicyDirection::Export,
            neighbor.parse().unwrap(),
            &prefix.parse().unwrap(),
            &PathAttributes::default(),
        );
        assert_eq!(expected, got);
    }

    #[test]
    fn test_evaluate_ignores_import_policies() {
        let mut policy = export_for("10.0.0.1", "10.100.0.0/24", RouteAction::Reject);
        policy.direction = PolicyDirection::Import;
        let got = evaluate(
            &[policy],
            PolicyDirection::Export,
            "10.0.0.1".parse().unwrap(),
            &"10.100.0.0/24".parse().unwrap(),
            &PathAttributes::default(),
        );
        assert_eq!(Verdict::Accept(PathAttributes::default()), got);
    }
}
