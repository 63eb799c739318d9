use std::sync::Arc;

use axum::{
    extract::{FromRequestParts, Request, State},
    http::{header, request::Parts, HeaderMap, HeaderValue, StatusCode, Uri},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::{debug, error};
use url::form_urlencoded;

use clinicdesk_core::{negotiate_locale, LocaleCandidates, Tenant};
use clinicdesk_storage::{FactoryError, TenantDatabase};

use crate::problem::ProblemResponse;
use crate::router::AppState;

const CULTURE_PARAM: &str = "culture";
const LOCALE_COOKIE: &str = "locale";

/// Per-request tenancy state published by [`resolve_tenant`].
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub tenant: Option<Arc<Tenant>>,
    pub locale: String,
}

/// Settings for request-level tenant and locale resolution.
#[derive(Debug, Clone)]
pub struct TenancySettings {
    pub single_tenant_mode: bool,
    pub supported_languages: Vec<String>,
    pub default_language: String,
}

/// Resolves the tenant once per request and stores a [`RequestContext`] in
/// the request extensions. Unresolved hosts pass through without a tenant.
pub async fn resolve_tenant(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let host = request_host(request.headers(), request.uri());
    let resolved = match host.as_deref() {
        Some(host) => state.resolver().resolve(host).await,
        None => Ok(None),
    };

    let tenant = match resolved {
        Ok(Some(tenant)) => Some(tenant),
        Ok(None) if state.tenancy().single_tenant_mode => match state.resolver().find_first().await {
            Ok(tenant) => tenant,
            Err(err) => return directory_unavailable(&err),
        },
        Ok(None) => None,
        Err(err) => return directory_unavailable(&err),
    };

    let settings = state.tenancy();
    let supported = tenant
        .as_ref()
        .map(|tenant| tenant.locales.as_slice())
        .filter(|locales| !locales.is_empty())
        .unwrap_or(settings.supported_languages.as_slice());
    let requested = request
        .uri()
        .query()
        .and_then(|query| query_value(query, CULTURE_PARAM));
    let cookie = cookie_value(request.headers(), LOCALE_COOKIE);
    let accept_language = request
        .headers()
        .get(header::ACCEPT_LANGUAGE)
        .and_then(|value| value.to_str().ok());
    let locale = negotiate_locale(
        LocaleCandidates {
            requested: requested.as_deref(),
            cookie: cookie.as_deref(),
            accept_language,
        },
        supported,
        &settings.default_language,
    );

    debug!(
        stage = "tenancy",
        host = host.as_deref().unwrap_or_default(),
        tenant_id = tenant.as_ref().map(|t| t.id.as_str()).unwrap_or_default(),
        %locale,
        "request context resolved"
    );

    let content_language = HeaderValue::from_str(&locale).ok();
    request
        .extensions_mut()
        .insert(RequestContext { tenant, locale });

    let mut response = next.run(request).await;
    if let Some(value) = content_language {
        response
            .headers_mut()
            .entry(header::CONTENT_LANGUAGE)
            .or_insert(value);
    }
    response
}

fn directory_unavailable(err: &dyn std::error::Error) -> Response {
    error!(stage = "tenancy", error = %err, "tenant resolution failed");
    ProblemResponse::new(
        StatusCode::SERVICE_UNAVAILABLE,
        "tenant_directory_unavailable",
        "tenant directory is unavailable",
    )
    .into_response()
}

fn request_host(headers: &HeaderMap, uri: &Uri) -> Option<String> {
    headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .or_else(|| uri.authority().map(|authority| authority.as_str().to_string()))
}

fn query_value(query: &str, key: &str) -> Option<String> {
    form_urlencoded::parse(query.as_bytes())
        .find(|(name, _)| name == key)
        .map(|(_, value)| value.into_owned())
        .filter(|value| !value.is_empty())
}

fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub(crate) fn tenant_not_found() -> ProblemResponse {
    ProblemResponse::new(
        StatusCode::NOT_FOUND,
        "tenant_not_found",
        "no clinic is registered for this host",
    )
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for RequestContext
where
    S: Send + Sync,
{
    type Rejection = ProblemResponse;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts.extensions.get::<RequestContext>().cloned().ok_or_else(|| {
            error!(stage = "tenancy", "tenant middleware is not installed");
            ProblemResponse::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                "request context is unavailable",
            )
        })
    }
}

/// The tenant resolved for this request; rejects with 404 when absent.
#[derive(Debug, Clone)]
pub struct CurrentTenant(pub Arc<Tenant>);

#[axum::async_trait]
impl<S> FromRequestParts<S> for CurrentTenant
where
    S: Send + Sync,
{
    type Rejection = ProblemResponse;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let context = RequestContext::from_request_parts(parts, state).await?;
        context.tenant.map(CurrentTenant).ok_or_else(tenant_not_found)
    }
}

/// The resolved tenant together with its isolated data context.
#[derive(Clone)]
pub struct TenantData {
    pub tenant: Arc<Tenant>,
    pub db: TenantDatabase,
}

#[axum::async_trait]
impl FromRequestParts<AppState> for TenantData {
    type Rejection = ProblemResponse;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let CurrentTenant(tenant) = CurrentTenant::from_request_parts(parts, state).await?;
        let db = state.factory().open(&tenant).await.map_err(|err| match err {
            FactoryError::TenantNotFound => tenant_not_found(),
            other => {
                error!(stage = "tenancy", tenant_id = %tenant.id, error = %other, "failed to open tenant database");
                ProblemResponse::new(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "tenant_storage_unavailable",
                    "tenant storage is unavailable",
                )
            }
        })?;
        Ok(Self { tenant, db })
    }
}
