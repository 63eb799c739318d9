use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::error;

use clinicdesk_storage::{NewPatient, Patient};

use crate::problem::{internal_error, ProblemResponse};
use crate::router::AppState;
use crate::tenancy::{CurrentTenant, RequestContext, TenantData};

const LIST_LIMIT: u32 = 100;

#[derive(Debug, Serialize)]
pub struct TenantSummary {
    pub id: String,
    pub name: String,
    pub domain: String,
    pub locales: Vec<String>,
    pub locale: String,
}

#[derive(Debug, Deserialize)]
pub struct CreatePatient {
    pub full_name: String,
    #[serde(default)]
    pub phone: Option<String>,
}

pub async fn current_tenant(
    CurrentTenant(tenant): CurrentTenant,
    context: RequestContext,
) -> Json<TenantSummary> {
    Json(TenantSummary {
        id: tenant.id.clone(),
        name: tenant.name.clone(),
        domain: tenant.domain.clone(),
        locales: tenant.locales.clone(),
        locale: context.locale,
    })
}

pub async fn list(data: TenantData) -> Result<Json<Vec<Patient>>, ProblemResponse> {
    let patients = data.db.patients().list(LIST_LIMIT).await.map_err(|err| {
        error!(stage = "patients", tenant_id = %data.tenant.id, error = %err, "failed to list patients");
        internal_error("failed to list patients")
    })?;
    Ok(Json(patients))
}

pub async fn create(
    State(state): State<AppState>,
    data: TenantData,
    payload: Result<Json<CreatePatient>, JsonRejection>,
) -> Result<(StatusCode, Json<Patient>), ProblemResponse> {
    let Json(payload) = payload?;
    let full_name = payload.full_name.trim();
    if full_name.is_empty() {
        return Err(ProblemResponse::new(
            StatusCode::UNPROCESSABLE_ENTITY,
            "invalid_patient",
            "full_name is required",
        ));
    }
    let phone = payload
        .phone
        .as_deref()
        .map(str::trim)
        .filter(|phone| !phone.is_empty());

    let patient = data
        .db
        .patients()
        .insert(&NewPatient {
            full_name,
            phone,
            created_at: state.now(),
        })
        .await
        .map_err(|err| {
            error!(stage = "patients", tenant_id = %data.tenant.id, error = %err, "failed to insert patient");
            internal_error("failed to create patient")
        })?;
    Ok((StatusCode::CREATED, Json(patient)))
}
