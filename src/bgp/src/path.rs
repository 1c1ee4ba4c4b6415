use std::{net::IpAddr, str::FromStr, time::Duration};

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::{error::Error, family::Family};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathAttributes {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub communities: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub large_communities: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_preference: Option<u32>,
}

impl PathAttributes {
    pub fn is_empty(&self) -> bool {
        self.communities.is_empty()
            && self.large_communities.is_empty()
            && self.local_preference.is_none()
    }

    /// Fold `other` into self. Communities are appended without duplicates,
    /// the local preference of `other` wins when set.
    pub fn merge(&mut self, other: &PathAttributes) {
        for c in other.communities.iter() {
            if !self.communities.contains(c) {
                self.communities.push(c.clone());
            }
        }
        for c in other.large_communities.iter() {
            if !self.large_communities.contains(c) {
                self.large_communities.push(c.clone());
            }
        }
        if other.local_preference.is_some() {
            self.local_preference = other.local_preference;
        }
    }
}

pub type PathKey = (Family, IpNet);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Path {
    pub family: Family,
    pub prefix: IpNet,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_hop: Option<IpAddr>,
    #[serde(default, skip_serializing_if = "PathAttributes::is_empty")]
    pub attributes: PathAttributes,
}

impl Path {
    pub fn new(prefix: IpNet) -> Self {
        Path {
            family: Family::for_prefix(&prefix),
            prefix: prefix.trunc(),
            next_hop: None,
            attributes: PathAttributes::default(),
        }
    }

    pub fn with_attributes(mut self, attributes: PathAttributes) -> Self {
        self.attributes = attributes;
        self
    }

    pub fn key(&self) -> PathKey {
        (self.family, self.prefix)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TableType {
    #[serde(rename = "adj-rib-in")]
    AdjRibIn,
    #[default]
    #[serde(rename = "loc-rib")]
    LocRib,
    #[serde(rename = "adj-rib-out")]
    AdjRibOut,
}

impl FromStr for TableType {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace(&['-', '_'][..], "").as_str() {
            "adjribin" => Ok(TableType::AdjRibIn),
            "locrib" => Ok(TableType::LocRib),
            "adjribout" => Ok(TableType::AdjRibOut),
            _ => Err(Error::InvalidTableType(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteQuery {
    pub family: Option<Family>,
    pub table: TableType,
    pub neighbor: Option<IpAddr>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    pub local_asn: u32,
    pub family: Family,
    pub prefix: IpNet,
    pub next_hop: Option<IpAddr>,
    pub attributes: PathAttributes,
    #[serde(serialize_with = "serialize_secs")]
    pub age: Duration,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub neighbor: Option<IpAddr>,
    pub best: bool,
}

fn serialize_secs<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_secs())
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest(
        input,
        expected,
        case("loc-rib", Some(TableType::LocRib)),
        case("LocRIB", Some(TableType::LocRib)),
        case("adj-rib-in", Some(TableType::AdjRibIn)),
        case("adj_rib_out", Some(TableType::AdjRibOut)),
        case("global", None)
    )]
    fn test_parse_table_type(input: &str, expected: Option<TableType>) {
        assert_eq!(expected, input.parse::<TableType>().ok());
    }

    #[test]
    fn test_path_new_truncates_prefix() {
        let path = Path::new("10.1.2.3/24".parse().unwrap());
        assert_eq!("10.1.2.0/24".parse::<IpNet>().unwrap(), path.prefix);
        assert_eq!(Family::IPV4_UNICAST, path.family);
    }

    #[test]
    fn test_merge_attributes() {
        let mut base = PathAttributes {
            communities: vec!["65000:100".to_string()],
            large_communities: vec![],
            local_preference: Some(100),
        };
        base.merge(&PathAttributes {
            communities: vec!["65000:100".to_string(), "no-export".to_string()],
            large_communities: vec!["65000:1:1".to_string()],
            local_preference: None,
        });
        assert_eq!(vec!["65000:100", "no-export"], base.communities);
        assert_eq!(vec!["65000:1:1"], base.large_communities);
        assert_eq!(Some(100), base.local_preference);
    }
}
