//! Bearer-token authentication for the relay surface.

use http::HeaderMap;
use mrelay_adapters::{RelayError, RelayResult};
use mrelay_billing::Ledger;
use mrelay_storage::{TokenRow, UserRow};

#[derive(Debug, Clone)]
pub struct AuthedRequest {
    pub token: TokenRow,
    pub user: UserRow,
    /// Channel pin from the `<token>-<channel_id>` bearer suffix (admin only)
    /// or the token's own sticky channel.
    pub specific_channel_id: Option<i64>,
}

pub async fn authenticate(ledger: &Ledger, headers: &HeaderMap) -> RelayResult<AuthedRequest> {
    let raw = extract_bearer(headers)
        .ok_or_else(|| RelayError::unauthorized("missing or malformed authorization header"))?;

    // `<key>-<channel_id>` pins the request to one channel; the exact key is
    // tried first so keys with trailing digits keep working.
    let mut suffix_channel: Option<i64> = None;
    let mut token = ledger
        .get_token(&raw)
        .await
        .map_err(|err| RelayError::internal(format!("token lookup failed: {err}")))?;
    if token.is_none() {
        if let Some((left, right)) = raw.rsplit_once('-') {
            if let Ok(channel_id) = right.parse::<i64>() {
                token = ledger
                    .get_token(left)
                    .await
                    .map_err(|err| RelayError::internal(format!("token lookup failed: {err}")))?;
                if token.is_some() {
                    suffix_channel = Some(channel_id);
                }
            }
        }
    }
    let token = token.ok_or_else(|| RelayError::unauthorized("invalid api key"))?;

    if !token.is_enabled() {
        return Err(RelayError::unauthorized("api key is disabled"));
    }
    let now = time::OffsetDateTime::now_utc().unix_timestamp();
    if token.is_expired(now) {
        return Err(RelayError::unauthorized("api key has expired"));
    }

    let user = ledger
        .get_user(token.user_id)
        .await
        .map_err(|err| RelayError::internal(format!("user lookup failed: {err}")))?
        .ok_or_else(|| RelayError::unauthorized("user not found"))?;
    if !user.is_enabled() {
        return Err(RelayError::forbidden("user is disabled"));
    }

    if suffix_channel.is_some() && !user.is_admin() {
        return Err(RelayError::forbidden(
            "channel pinning requires an admin token",
        ));
    }

    Ok(AuthedRequest {
        specific_channel_id: suffix_channel.or(token.specific_channel_id),
        token,
        user,
    })
}

fn extract_bearer(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(http::header::AUTHORIZATION)?.to_str().ok()?;
    let value = value.trim();
    value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))
        .map(|key| key.trim().to_string())
}

/// The effective routing group: the token's group restriction does not
/// change it, only restricts; `auto` resolves to the account default.
pub fn resolve_group(user: &UserRow) -> String {
    if user.group.is_empty() || user.group == "auto" {
        "default".to_string()
    } else {
        user.group.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_extraction() {
        let mut headers = HeaderMap::new();
        headers.insert(http::header::AUTHORIZATION, "Bearer sk-abc".parse().unwrap());
        assert_eq!(extract_bearer(&headers).as_deref(), Some("sk-abc"));

        headers.insert(http::header::AUTHORIZATION, "Basic zzz".parse().unwrap());
        assert!(extract_bearer(&headers).is_none());
    }

    #[test]
    fn auto_group_resolves_to_default() {
        let user = UserRow {
            id: 1,
            username: "u".into(),
            group: "auto".into(),
            quota: 0,
            used_quota: 0,
            request_count: 0,
            status: 1,
            role: 1,
        };
        assert_eq!(resolve_group(&user), "default");
    }
}
