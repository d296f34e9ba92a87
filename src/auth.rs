use axum::{async_trait, extract::FromRequestParts, http::request::Parts};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::Error;

/// Caller role as asserted by the authenticating gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Patient,
    Provider,
    Admin,
    SuperAdmin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Patient => "patient",
            Role::Provider => "provider",
            Role::Admin => "admin",
            Role::SuperAdmin => "super_admin",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "patient" => Some(Role::Patient),
            "provider" => Some(Role::Provider),
            "admin" => Some(Role::Admin),
            "super_admin" => Some(Role::SuperAdmin),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Authenticated request context. Session mechanics live in the gateway in
/// front of this service; it forwards the verified identity in headers.
#[derive(Debug, Clone, Copy)]
pub struct RequestContext {
    pub user_id: i64,
    pub clinic_id: i64,
    pub role: Role,
}

fn header_value<'a>(parts: &'a Parts, name: &str) -> Result<&'a str, Error> {
    parts
        .headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| Error::forbidden(format!("Missing {} header", name)))
}

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for RequestContext {
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user_id = header_value(parts, "x-user-id")?
            .parse::<i64>()
            .map_err(|_| Error::forbidden("Invalid x-user-id header"))?;
        let clinic_id = header_value(parts, "x-clinic-id")?
            .parse::<i64>()
            .map_err(|_| Error::forbidden("Invalid x-clinic-id header"))?;
        let role = Role::parse(header_value(parts, "x-user-role")?)
            .ok_or_else(|| Error::forbidden("Invalid x-user-role header"))?;

        Ok(RequestContext {
            user_id,
            clinic_id,
            role,
        })
    }
}

/// Rejects callers whose role is not in the allow list.
pub fn require_role(ctx: &RequestContext, allowed: &[Role]) -> Result<(), Error> {
    if allowed.contains(&ctx.role) {
        Ok(())
    } else {
        Err(Error::forbidden(format!(
            "Role {} may not perform this action",
            ctx.role
        )))
    }
}

/// Tenant isolation check. Cross-clinic access reads as "not found" so the
/// existence of another clinic's records cannot be probed. Super admins see
/// every clinic.
pub fn ensure_clinic_access(
    ctx: &RequestContext,
    entity_clinic_id: i64,
    what: impl fmt::Display,
) -> Result<(), Error> {
    if ctx.role == Role::SuperAdmin || ctx.clinic_id == entity_clinic_id {
        Ok(())
    } else {
        Err(Error::not_found(format!("{} not found", what)))
    }
}
