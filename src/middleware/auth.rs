use axum::{
    extract::Request,
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Json, Response},
};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

/// Raw claims as issued by the identity collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub org: String,
    pub role: String,
    #[serde(default)]
    pub super_org_admin: bool,
    #[serde(default)]
    pub unlimited_attempts: bool,
    pub exp: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Student,
    Instructor,
    Admin,
}

impl Role {
    fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "student" => Some(Role::Student),
            "instructor" => Some(Role::Instructor),
            "admin" => Some(Role::Admin),
            _ => None,
        }
    }
}

/// The resolved identity the engine authorizes against. The engine never
/// authenticates; it trusts what the auth collaborator signed.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub user_id: Uuid,
    pub organization_id: Uuid,
    pub role: Role,
    pub is_super_org_admin: bool,
    pub unlimited_attempts: bool,
}

impl AuthContext {
    pub fn is_student(&self) -> bool {
        self.role == Role::Student
    }

    pub fn is_staff(&self) -> bool {
        matches!(self.role, Role::Instructor | Role::Admin)
    }
}

fn unauthorized(reason: &str) -> Response {
    (StatusCode::UNAUTHORIZED, Json(json!({ "error": reason }))).into_response()
}

fn decode_context(req: &Request) -> Result<AuthContext, Response> {
    let Some(auth_header) = req.headers().get(axum::http::header::AUTHORIZATION) else {
        return Err(unauthorized("missing_authorization"));
    };
    let Ok(auth_str) = auth_header.to_str() else {
        return Err(unauthorized("bad_authorization"));
    };
    let Some(token) = auth_str.strip_prefix("Bearer ") else {
        return Err(unauthorized("unsupported_scheme"));
    };

    let config = crate::config::get_config();
    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_exp = true;
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(config.jwt_secret.as_bytes()),
        &validation,
    )
    .map_err(|_| unauthorized("invalid_token"))?;

    let claims = data.claims;
    let user_id = Uuid::parse_str(&claims.sub).map_err(|_| unauthorized("invalid_subject"))?;
    let organization_id =
        Uuid::parse_str(&claims.org).map_err(|_| unauthorized("invalid_organization"))?;
    let Some(role) = Role::parse(&claims.role) else {
        return Err(unauthorized("unknown_role"));
    };

    Ok(AuthContext {
        user_id,
        organization_id,
        role,
        is_super_org_admin: claims.super_org_admin,
        unlimited_attempts: claims.unlimited_attempts,
    })
}

pub async fn require_auth(mut req: Request, next: Next) -> Response {
    match decode_context(&req) {
        Ok(ctx) => {
            req.extensions_mut().insert(ctx);
            next.run(req).await
        }
        Err(resp) => resp,
    }
}

pub async fn require_staff(mut req: Request, next: Next) -> Response {
    match decode_context(&req) {
        Ok(ctx) => {
            if !ctx.is_staff() {
                return (StatusCode::FORBIDDEN, Json(json!({"error":"forbidden"})))
                    .into_response();
            }
            req.extensions_mut().insert(ctx);
            next.run(req).await
        }
        Err(resp) => resp,
    }
}
