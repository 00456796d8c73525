//! Routing information tunneled through the startup `user` parameter.

/// Routing details encoded as suffixes of the user name.
///
/// Tenants write `<username>.<deployment_id>[.pool]`, which every postgres
/// client can transport unmodified. The username keeps any dots of its own:
/// only the trailing segments are stripped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TenantAddress {
    /// User name with the routing suffix removed. Unset when the user field
    /// carried no suffix at all.
    pub username: Option<String>,
    /// Tenant/cluster identifier the backend is selected by.
    pub deployment_id: Option<String>,
    /// Whether the client asked for the pooled variant via `.pool`.
    pub pooled: bool,
}

const POOL_SUFFIX: &str = "pool";

impl TenantAddress {
    /// Derive routing details from a raw `user` value. Total: every input
    /// yields a definite `pooled` answer, even when nothing else matched.
    pub fn parse(user: &str) -> Self {
        let parts: Vec<&str> = user.split('.').collect();
        if parts.len() < 2 {
            return Self::default();
        }

        if parts[parts.len() - 1] == POOL_SUFFIX {
            let mut addr = Self {
                pooled: true,
                ..Self::default()
            };
            // `x.pool` has nowhere to take a deployment id from; the
            // resolver will reject the connection downstream.
            if parts.len() >= 3 {
                addr.deployment_id = Some(parts[parts.len() - 2].to_owned());
                addr.username = Some(parts[..parts.len() - 2].join("."));
            }
            addr
        } else {
            Self {
                username: Some(parts[..parts.len() - 1].join(".")),
                deployment_id: Some(parts[parts.len() - 1].to_owned()),
                pooled: false,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("alice.dep42", Some("alice"), Some("dep42"), false)]
    #[case("alice.dep42.pool", Some("alice"), Some("dep42"), true)]
    #[case("a.b.c.dep42", Some("a.b.c"), Some("dep42"), false)]
    #[case("a.b.c.dep42.pool", Some("a.b.c"), Some("dep42"), true)]
    #[case("solo", None, None, false)]
    #[case("", None, None, false)]
    fn parses_user_suffixes(
        #[case] user: &str,
        #[case] username: Option<&str>,
        #[case] deployment_id: Option<&str>,
        #[case] pooled: bool,
    ) {
        let addr = TenantAddress::parse(user);
        assert_eq!(addr.username.as_deref(), username);
        assert_eq!(addr.deployment_id.as_deref(), deployment_id);
        assert_eq!(addr.pooled, pooled);
    }

    #[test]
    fn pool_without_deployment_id() {
        // Two segments where the last is `pool`: the pooling request is
        // honored but there is no deployment id to route by.
        let addr = TenantAddress::parse("something.pool");
        assert!(addr.pooled);
        assert_eq!(addr.deployment_id, None);
        assert_eq!(addr.username, None);
    }
}
