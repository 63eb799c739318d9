use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Redirect, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use clinicdesk_core::{ProvisioningState, RegistrationForm, Tenant};

use crate::operator::OperatorAccess;
use crate::problem::{internal_error, ProblemResponse};
use crate::provisioner::ProvisionError;
use crate::router::AppState;
use crate::tenancy::tenant_not_found;

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProvisioningSummary {
    pub tenant_id: String,
    pub name: String,
    pub domain: String,
    pub provisioning_state: ProvisioningState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provisioning_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<Tenant> for ProvisioningSummary {
    fn from(tenant: Tenant) -> Self {
        Self {
            tenant_id: tenant.id,
            name: tenant.name,
            domain: tenant.domain,
            provisioning_state: tenant.provisioning_state,
            provisioning_error: tenant.provisioning_error,
            created_at: tenant.created_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ConfirmQuery {
    pub user_id: String,
    pub token: String,
    pub domain: String,
}

pub async fn register(
    State(state): State<AppState>,
    form: Result<Json<RegistrationForm>, JsonRejection>,
) -> Result<(StatusCode, Json<ProvisioningSummary>), ProblemResponse> {
    let Json(form) = form?;
    let tenant = state.provisioner().create_tenant(form).await?;
    Ok((StatusCode::CREATED, Json(tenant.into())))
}

pub async fn confirm(
    State(state): State<AppState>,
    query: Result<Query<ConfirmQuery>, QueryRejection>,
) -> Result<Response, ProblemResponse> {
    let Query(query) = query?;
    let login_url = state
        .provisioner()
        .confirm_account(&query.domain, &query.user_id, &query.token)
        .await?;
    Ok(redirect_found(&login_url))
}

pub async fn list_incomplete(
    _operator: OperatorAccess,
    State(state): State<AppState>,
) -> Result<Json<Vec<ProvisioningSummary>>, ProblemResponse> {
    let tenants = state.provisioner().incomplete(state.now()).await?;
    Ok(Json(tenants.into_iter().map(Into::into).collect()))
}

pub async fn resume(
    _operator: OperatorAccess,
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
) -> Result<Json<ProvisioningSummary>, ProblemResponse> {
    let tenant = state.provisioner().resume(&tenant_id).await?;
    Ok(Json(tenant.into()))
}

fn redirect_found(location: &str) -> Response {
    let mut response = Redirect::temporary(location).into_response();
    *response.status_mut() = StatusCode::FOUND;
    response
}

impl From<ProvisionError> for ProblemResponse {
    fn from(err: ProvisionError) -> Self {
        let retryable = err.is_retryable();
        match err {
            ProvisionError::InvalidInput(reason) => ProblemResponse::new(
                StatusCode::UNPROCESSABLE_ENTITY,
                "invalid_registration",
                reason.to_string(),
            ),
            ProvisionError::DuplicateClinic { domain } => ProblemResponse::new(
                StatusCode::CONFLICT,
                "duplicate_clinic",
                "a clinic with this name is already registered",
            )
            .with("domain", domain),
            ProvisionError::TenantNotFound => tenant_not_found(),
            ProvisionError::ConfirmationFailed(reason) => ProblemResponse::new(
                StatusCode::BAD_REQUEST,
                "confirmation_failed",
                "the confirmation link is invalid, expired or already used",
            )
            .with("reason", reason.as_str()),
            ProvisionError::ProvisioningIncomplete {
                tenant_id,
                reached,
                source,
            } => {
                warn!(stage = "provision", %tenant_id, %reached, error = %source, "returning incomplete provisioning");
                ProblemResponse::new(
                    StatusCode::BAD_GATEWAY,
                    "provisioning_incomplete",
                    "the clinic was registered but its setup did not finish",
                )
                .with("tenant_id", tenant_id)
                .with("reached", reached.as_str())
                .with("retryable", retryable)
            }
            ProvisionError::Directory(err) => {
                error!(stage = "provision", error = %err, "directory failure");
                ProblemResponse::new(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "tenant_directory_unavailable",
                    "tenant directory is unavailable",
                )
                .with("retryable", retryable)
            }
            ProvisionError::Factory(err) => {
                error!(stage = "provision", error = %err, "tenant storage failure");
                ProblemResponse::new(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "tenant_storage_unavailable",
                    "tenant storage is unavailable",
                )
                .with("retryable", retryable)
            }
            ProvisionError::Account(err) => {
                error!(stage = "provision", error = %err, "identity store failure");
                internal_error("failed to access the clinic's accounts")
            }
            ProvisionError::PasswordHash(err) => {
                error!(stage = "provision", error = %err, "password hashing failed");
                internal_error("failed to secure the password")
            }
        }
    }
}
