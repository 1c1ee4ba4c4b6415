use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;

use bgpcp_bgp::path::PathAttributes;

use super::error::Error;

/// Well-known community names and their standard values.
pub const WELL_KNOWN_COMMUNITIES: [(&str, &str); 6] = [
    ("internet", "0:0"),
    ("planned-shut", "65535:0"),
    ("accept-own", "65535:1"),
    ("no-export", "65535:65281"),
    ("no-advertise", "65535:65282"),
    ("no-export-subconfed", "65535:65283"),
];

#[derive(CustomResource, Debug, Serialize, Deserialize, Default, Clone, JsonSchema)]
#[kube(group = "cilium.io", version = "v2", kind = "CiliumBGPAdvertisement")]
#[kube(shortname = "bgpadvert")]
#[kube(
    printcolumn = r#"{"name":"AGE", "type":"date", "description":"Date from created", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CiliumBGPAdvertisementSpec {
    pub advertisements: Vec<BGPAdvertisement>,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BGPAdvertisement {
    pub advertisement_type: AdvertisementType,
    pub service: Option<BGPServiceOptions>,
    pub selector: Option<LabelSelector>,
    pub attributes: Option<BGPAttributes>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Default, Debug, PartialEq, Eq, PartialOrd, Ord, JsonSchema)]
pub enum AdvertisementType {
    #[default]
    PodCIDR,
    Service,
    CiliumPodIPPool,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BGPServiceOptions {
    pub addresses: Vec<ServiceAddressType>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, JsonSchema)]
pub enum ServiceAddressType {
    LoadBalancerIP,
    ClusterIP,
    ExternalIP,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BGPAttributes {
    pub communities: Option<BGPCommunities>,
    pub local_preference: Option<i64>,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BGPCommunities {
    pub standard: Option<Vec<String>>,
    pub well_known: Option<Vec<String>>,
    pub large: Option<Vec<String>>,
}

impl BGPCommunities {
    /// Standard and well-known communities in `asn:value` form, plus the
    /// validated large communities.
    pub fn normalize(&self) -> Result<(Vec<String>, Vec<String>), Error> {
        let mut standard = Vec::new();
        for c in self.standard.iter().flatten() {
            standard.push(parse_standard_community(c)?);
        }
        for c in self.well_known.iter().flatten() {
            let value = WELL_KNOWN_COMMUNITIES
                .iter()
                .find(|(name, _)| name == c)
                .map(|(_, v)| v.to_string())
                .ok_or_else(|| Error::InvalidCommunity(c.clone()))?;
            standard.push(value);
        }
        let mut large = Vec::new();
        for c in self.large.iter().flatten() {
            let parts: Vec<&str> = c.split(':').collect();
            if parts.len() != 3 || parts.iter().any(|p| p.parse::<u32>().is_err()) {
                return Err(Error::InvalidLargeCommunity(c.clone()));
            }
            large.push(c.clone());
        }
        standard.dedup();
        large.dedup();
        Ok((standard, large))
    }
}

// Accepts `asn:value` pairs, a single 32-bit decimal and well-known names.
fn parse_standard_community(s: &str) -> Result<String, Error> {
    if let Some((_, v)) = WELL_KNOWN_COMMUNITIES.iter().find(|(name, _)| *name == s) {
        return Ok(v.to_string());
    }
    if let Some((high, low)) = s.split_once(':') {
        return match (high.parse::<u16>(), low.parse::<u16>()) {
            (Ok(h), Ok(l)) => Ok(format!("{h}:{l}")),
            _ => Err(Error::InvalidCommunity(s.to_string())),
        };
    }
    match s.parse::<u32>() {
        Ok(v) => Ok(format!("{}:{}", v >> 16, v & 0xffff)),
        Err(_) => Err(Error::InvalidCommunity(s.to_string())),
    }
}

impl BGPAttributes {
    /// Convert into path attributes. The local preference is kept only for
    /// internal peers.
    pub fn to_path_attributes(&self, ibgp: bool) -> Result<PathAttributes, Error> {
        let (communities, large_communities) = match &self.communities {
            Some(c) => c.normalize()?,
            None => (Vec::new(), Vec::new()),
        };
        let local_preference = match self.local_preference {
            Some(p) if !(0..=i64::from(u32::MAX)).contains(&p) => {
                return Err(Error::InvalidLocalPreference(p))
            }
            Some(p) if ibgp => Some(p as u32),
            _ => None,
        };
        Ok(PathAttributes {
            communities,
            large_communities,
            local_preference,
        })
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest(
        input,
        expected,
        case("65000:100", Some("65000:100")),
        case("no-export", Some("65535:65281")),
        case("4259840100", Some("65000:100")),
        case("70000:1", None),
        case("abc", None)
    )]
    fn test_parse_standard_community(input: &str, expected: Option<&str>) {
        assert_eq!(
            expected.map(|e| e.to_string()),
            parse_standard_community(input).ok()
        );
    }

    #[rstest(
        local_preference,
        ibgp,
        expected,
        case(Some(200), true, Some(200)),
        case(Some(200), false, None),
        case(None, true, None)
    )]
    fn test_local_preference_only_for_ibgp(
        local_preference: Option<i64>,
        ibgp: bool,
        expected: Option<u32>,
    ) {
        let attrs = BGPAttributes {
            communities: None,
            local_preference,
        };
        assert_eq!(
            expected,
            attrs.to_path_attributes(ibgp).unwrap().local_preference
        );
    }

    #[test]
    fn test_normalize_communities() {
        let c = BGPCommunities {
            standard: Some(vec!["65000:1".to_string()]),
            well_known: Some(vec!["no-advertise".to_string()]),
            large: Some(vec!["65000:1:2".to_string()]),
        };
        let (standard, large) = c.normalize().unwrap();
        assert_eq!(vec!["65000:1", "65535:65282"], standard);
        assert_eq!(vec!["65000:1:2"], large);

        let bad = BGPCommunities {
            large: Some(vec!["1:2".to_string()]),
            ..Default::default()
        };
        assert_eq!(
            Err(Error::InvalidLargeCommunity("1:2".to_string())),
            bad.normalize()
        );
    }
}
