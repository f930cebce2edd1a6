//! Pluggable request authentication and role-based route authorization.

use crate::error::GatewayError;
use crate::transport::Request;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use http::header::AUTHORIZATION;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use std::collections::HashMap;
use std::str::FromStr;

/// Authenticated caller identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub id: String,
    /// Roles asserted by the credential itself (e.g. JWT claims); RBAC
    /// may add statically-mapped roles on top.
    pub roles: Vec<String>,
}

/// Credential verifier; implementations are wired per route policy.
#[async_trait]
pub trait AuthValidator: Send + Sync {
    async fn validate(&self, req: &Request) -> Result<Principal, GatewayError>;
}

fn authorization_value<'a>(req: &'a Request, scheme: &str) -> Result<&'a str, GatewayError> {
    let raw = req
        .headers()
        .get(AUTHORIZATION)
        .ok_or_else(|| GatewayError::Unauthenticated("missing authorization header".into()))?
        .to_str()
        .map_err(|_| GatewayError::Unauthenticated("malformed authorization header".into()))?;
    let (found_scheme, value) = raw
        .split_once(' ')
        .ok_or_else(|| GatewayError::Unauthenticated("malformed authorization header".into()))?;
    if !found_scheme.eq_ignore_ascii_case(scheme) {
        return Err(GatewayError::Unauthenticated(format!(
            "expected {scheme} authorization"
        )));
    }
    Ok(value.trim())
}

/// HTTP Basic verification against a static credential table.
pub struct BasicAuth {
    users: HashMap<String, String>,
}

impl BasicAuth {
    pub fn new(users: HashMap<String, String>) -> Self {
        Self { users }
    }
}

#[async_trait]
impl AuthValidator for BasicAuth {
    async fn validate(&self, req: &Request) -> Result<Principal, GatewayError> {
        let encoded = authorization_value(req, "Basic")?;
        let decoded = BASE64
            .decode(encoded)
            .map_err(|_| GatewayError::Unauthenticated("invalid base64 credentials".into()))?;
        let decoded = String::from_utf8(decoded)
            .map_err(|_| GatewayError::Unauthenticated("invalid credential encoding".into()))?;
        let (user, password) = decoded
            .split_once(':')
            .ok_or_else(|| GatewayError::Unauthenticated("malformed credentials".into()))?;

        match self.users.get(user) {
            Some(expected) if expected == password => Ok(Principal {
                id: user.to_string(),
                roles: Vec::new(),
            }),
            _ => Err(GatewayError::Unauthenticated("invalid credentials".into())),
        }
    }
}

#[derive(Debug, Deserialize)]
struct JwtClaims {
    sub: Option<String>,
    #[serde(default)]
    roles: Vec<String>,
}

/// Bearer-token verification with a shared secret.
pub struct JwtAuth {
    key: DecodingKey,
    validation: Validation,
}

impl JwtAuth {
    /// `algorithms` defaults to HS256 when empty; unknown names are
    /// rejected at configuration time.
    pub fn new(secret: &str, algorithms: &[String]) -> Result<Self, GatewayError> {
        let algorithms = if algorithms.is_empty() {
            vec![Algorithm::HS256]
        } else {
            algorithms
                .iter()
                .map(|name| {
                    Algorithm::from_str(name).map_err(|_| {
                        GatewayError::Unauthenticated(format!("unknown jwt algorithm `{name}`"))
                    })
                })
                .collect::<Result<Vec<_>, _>>()?
        };
        let mut validation = Validation::new(algorithms[0]);
        validation.algorithms = algorithms;
        Ok(Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        })
    }
}

#[async_trait]
impl AuthValidator for JwtAuth {
    async fn validate(&self, req: &Request) -> Result<Principal, GatewayError> {
        let token = authorization_value(req, "Bearer")?;
        let data = jsonwebtoken::decode::<JwtClaims>(token, &self.key, &self.validation)
            .map_err(|err| GatewayError::Unauthenticated(format!("invalid token: {err}")))?;
        let id = data
            .claims
            .sub
            .ok_or_else(|| GatewayError::Unauthenticated("token missing subject".into()))?;
        Ok(Principal { id, roles: data.claims.roles })
    }
}

/// Role-based authorization evaluated against the matched route pattern.
#[derive(Debug, Clone, Default)]
pub struct Rbac {
    /// role -> permissions it grants.
    pub role_permissions: HashMap<String, Vec<String>>,
    /// principal id -> statically assigned roles.
    pub user_roles: HashMap<String, Vec<String>>,
    /// route pattern -> permissions required to pass.
    pub route_permissions: HashMap<String, Vec<String>>,
    /// Role assumed when a principal carries no roles at all.
    pub default_role: Option<String>,
    /// Require any single listed permission instead of all of them.
    pub allow_any_permission: bool,
}

impl Rbac {
    pub fn authorize(&self, principal: &Principal, route_pattern: &str) -> Result<(), GatewayError> {
        let Some(required) = self.route_permissions.get(route_pattern) else {
            return Ok(());
        };
        if required.is_empty() {
            return Ok(());
        }

        let mut roles: Vec<&String> = principal.roles.iter().collect();
        if let Some(mapped) = self.user_roles.get(&principal.id) {
            roles.extend(mapped.iter());
        }
        if roles.is_empty() {
            if let Some(default_role) = &self.default_role {
                roles.push(default_role);
            }
        }

        let granted: Vec<&String> = roles
            .iter()
            .filter_map(|role| self.role_permissions.get(*role))
            .flatten()
            .collect();

        let allowed = if self.allow_any_permission {
            required.iter().any(|perm| granted.iter().any(|g| *g == perm))
        } else {
            required.iter().all(|perm| granted.iter().any(|g| *g == perm))
        };

        if allowed {
            Ok(())
        } else {
            Err(GatewayError::Forbidden(format!(
                "`{}` lacks permission for {route_pattern}",
                principal.id
            )))
        }
    }
}
