//! The caller, as resolved by authentication upstream of admission control.

use std::fmt;
use std::net::IpAddr;

use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;

use crate::limiter::BucketKey;

/// Role attached to an authenticated identity.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    User,
}

/// Capacity tier a caller is billed against.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Admin,
    User,
    Anonymous,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::Admin => f.write_str("admin"),
            Tier::User => f.write_str("user"),
            Tier::Anonymous => f.write_str("anonymous"),
        }
    }
}

/// Who is making a request.
///
/// Admission control neither computes nor validates this; it is taken as given.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identity {
    user_id: Option<String>,
    role: Option<Role>,
    ip: IpAddr,
}

#[buildstructor::buildstructor]
impl Identity {
    #[builder(visibility = "pub")]
    fn new(user_id: Option<String>, role: Option<Role>, ip: IpAddr) -> Self {
        Self {
            user_id: user_id.filter(|id| !id.is_empty()),
            role,
            ip,
        }
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    pub fn role(&self) -> Option<Role> {
        self.role
    }

    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    /// `user:<id>` for authenticated callers, `ip:<address>` otherwise.
    pub fn bucket_key(&self) -> BucketKey {
        match &self.user_id {
            Some(user_id) => BucketKey::new(format!("user:{user_id}")),
            None => BucketKey::new(format!("ip:{}", self.ip)),
        }
    }

    pub fn tier(&self) -> Tier {
        match (self.role, &self.user_id) {
            (Some(Role::Admin), _) => Tier::Admin,
            (_, Some(_)) => Tier::User,
            _ => Tier::Anonymous,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use std::net::Ipv6Addr;

    use super::*;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1));

    #[test]
    fn authenticated_callers_are_keyed_by_user() {
        let identity = Identity::builder()
            .user_id("42")
            .role(Role::User)
            .ip(LOCALHOST)
            .build();

        assert_eq!(identity.bucket_key().as_str(), "user:42");
        assert_eq!(identity.tier(), Tier::User);
    }

    #[test]
    fn anonymous_callers_are_keyed_by_address() {
        let identity = Identity::builder().ip(IpAddr::V6(Ipv6Addr::LOCALHOST)).build();

        assert_eq!(identity.bucket_key().as_str(), "ip:::1");
        assert_eq!(identity.tier(), Tier::Anonymous);
    }

    #[test]
    fn empty_user_id_is_anonymous() {
        let identity = Identity::builder().user_id("").ip(LOCALHOST).build();

        assert_eq!(identity.user_id(), None);
        assert_eq!(identity.bucket_key().as_str(), "ip:127.0.0.1");
        assert_eq!(identity.tier(), Tier::Anonymous);
    }

    #[test]
    fn admins_get_the_admin_tier() {
        let identity = Identity::builder()
            .user_id("root")
            .role(Role::Admin)
            .ip(LOCALHOST)
            .build();

        assert_eq!(identity.tier(), Tier::Admin);
        assert_eq!(identity.bucket_key().as_str(), "user:root");
    }

    #[test]
    fn user_without_role_is_billed_as_user() {
        let identity = Identity::builder().user_id("7").ip(LOCALHOST).build();

        assert_eq!(identity.tier(), Tier::User);
    }

    #[test]
    fn role_is_deserialized_in_lowercase() {
        let role: Role = serde_json::from_str("\"admin\"").unwrap();

        assert_eq!(role, Role::Admin);
        assert_eq!(Tier::Anonymous.to_string(), "anonymous");
    }
}
