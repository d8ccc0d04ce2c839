use cidr::AnyIpCidr;
use serde::Deserialize;
use std::net::IpAddr;

/// A list of CIDR blocks loaded once at startup and consulted for every
/// connection. The lists configured for a milter are small, so a linear
/// scan beats maintaining a trie.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct CidrSet(Vec<AnyIpCidr>);

impl CidrSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        self.0.iter().any(|cidr| cidr.contains(&ip))
    }
}

impl<S> FromIterator<S> for CidrSet
where
    S: Into<AnyIpCidr>,
{
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn set(cidrs: &[&str]) -> CidrSet {
        cidrs
            .iter()
            .map(|s| AnyIpCidr::from_str(s).unwrap())
            .collect()
    }

    #[test]
    fn cidrset() {
        let set = set(&[
            "127.0.0.1",
            "::1",
            "192.168.1.0/24",
            "10.0.3.0/24",
        ]);

        assert!(set.contains("127.0.0.1".parse().unwrap()));
        assert!(!set.contains("127.0.0.2".parse().unwrap()));
        assert!(set.contains("::1".parse().unwrap()));

        assert!(set.contains("192.168.1.1".parse().unwrap()));
        assert!(set.contains("192.168.1.255".parse().unwrap()));
        assert!(!set.contains("192.168.2.1".parse().unwrap()));

        assert!(set.contains("10.0.3.200".parse().unwrap()));
        assert!(!set.contains("10.0.4.1".parse().unwrap()));
    }

    #[test]
    fn cidrset_any() {
        let empty = CidrSet::new();
        let with_any = set(&["any"]);

        assert!(!empty.contains("127.0.0.1".parse().unwrap()));
        assert!(with_any.contains("127.0.0.1".parse().unwrap()));
        assert!(with_any.contains("2001:db8::1".parse().unwrap()));
    }

    #[test]
    fn deserialize() {
        let set: CidrSet = toml::from_str::<std::collections::BTreeMap<String, CidrSet>>(
            "list = [\"127.0.0.0/8\", \"::1\"]",
        )
        .unwrap()
        .remove("list")
        .unwrap();
        assert!(set.contains("127.1.2.3".parse().unwrap()));
        assert!(!set.contains("128.0.0.1".parse().unwrap()));
    }
}
