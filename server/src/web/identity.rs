use std::collections::HashMap;

use axum::http::HeaderMap;
use tracing::debug;

use crate::engine::session::Identity;
use crate::engine::validation::validate_display_name;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_NAME_HEADER: &str = "x-user-name";
pub const NAME_QUERY_PARAM: &str = "name";

/// Resolves who is connecting from the upgrade request.
///
/// Returning `None` means the request carried no usable identity; the
/// caller falls back to an anonymous one.
pub trait IdentityProvider: Send + Sync {
    fn resolve(&self, headers: &HeaderMap, query: &HashMap<String, String>) -> Option<Identity>;
}

/// Trusts identity headers set by an authenticating reverse proxy, then
/// a `?name=` query parameter.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeaderIdentity;

impl IdentityProvider for HeaderIdentity {
    fn resolve(&self, headers: &HeaderMap, query: &HashMap<String, String>) -> Option<Identity> {
        let user_id = header_value(headers, USER_ID_HEADER);
        let name = header_value(headers, USER_NAME_HEADER)
            .or_else(|| query.get(NAME_QUERY_PARAM).map(|v| v.trim()))
            .filter(|v| !v.is_empty());

        let name = match name {
            Some(name) => match validate_display_name(name) {
                Ok(()) => Some(name),
                Err(e) => {
                    debug!(name, "Ignoring display name: {e}");
                    None
                }
            },
            None => None,
        };

        match (user_id, name) {
            (Some(id), Some(name)) => Some(Identity::new(id, name)),
            (Some(id), None) => Some(Identity::new(id, id)),
            (None, Some(name)) => Some(Identity::new(name, name)),
            (None, None) => None,
        }
    }
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}
