use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use metrics_exporter_prometheus::PrometheusHandle;

use clinicdesk_mailer::Mailer;
use clinicdesk_storage::{Directory, TenantDataContextFactory};
use clinicdesk_util::AppConfig;

use crate::provisioner::{Provisioner, ProvisioningSettings};
use crate::resolver::TenantResolver;
use crate::tenancy::{self, TenancySettings};
use crate::{patients, registration, telemetry};

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

#[derive(Clone)]
pub struct AppState {
    metrics: PrometheusHandle,
    directory: Directory,
    resolver: TenantResolver,
    factory: TenantDataContextFactory,
    provisioner: Provisioner,
    tenancy: Arc<TenancySettings>,
    operator_key: Option<Arc<str>>,
    clock: Clock,
}

impl AppState {
    pub fn new(
        config: &AppConfig,
        metrics: PrometheusHandle,
        directory: Directory,
        mailer: Arc<dyn Mailer>,
    ) -> Self {
        let clock: Clock = Arc::new(Utc::now);
        let resolver = TenantResolver::new(directory.tenants(), config.tenant_cache_ttl);
        let factory = TenantDataContextFactory::new(config.fallback_database_url.clone());
        let provisioner = Provisioner::new(
            directory.tenants(),
            factory.clone(),
            resolver.clone(),
            mailer,
            ProvisioningSettings::from(config),
            clock.clone(),
        );
        Self {
            metrics,
            directory,
            resolver,
            factory,
            provisioner,
            tenancy: Arc::new(TenancySettings {
                single_tenant_mode: config.single_tenant_mode,
                supported_languages: config.supported_languages.clone(),
                default_language: config.default_language.clone(),
            }),
            operator_key: config.operator_api_key.as_deref().map(Arc::from),
            clock,
        }
    }

    pub fn metrics(&self) -> &PrometheusHandle {
        &self.metrics
    }

    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    pub fn resolver(&self) -> &TenantResolver {
        &self.resolver
    }

    pub fn factory(&self) -> &TenantDataContextFactory {
        &self.factory
    }

    pub fn provisioner(&self) -> &Provisioner {
        &self.provisioner
    }

    pub fn tenancy(&self) -> &TenancySettings {
        &self.tenancy
    }

    pub fn operator_key(&self) -> Option<&str> {
        self.operator_key.as_deref()
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route("/tenance/register", post(registration::register))
        .route("/tenance/confirm", get(registration::confirm))
        .route("/tenance/provisioning", get(registration::list_incomplete))
        .route("/tenance/tenants/:tenant_id/resume", post(registration::resume))
        .route("/api/tenant", get(patients::current_tenant))
        .route("/api/patients", get(patients::list).post(patients::create))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            tenancy::resolve_tenant,
        ))
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn metrics(State(state): State<AppState>) -> Response {
    let body = telemetry::render_metrics(state.metrics());
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        Body::from(body),
    )
        .into_response()
}

#[cfg(test)]
pub(crate) mod testing {
    use std::{path::Path, sync::Arc, time::Duration};

    use serde_json::{json, Value};
    use tempfile::TempDir;
    use url::Url;

    use clinicdesk_core::RegistrationForm;
    use clinicdesk_mailer::MemoryMailer;
    use clinicdesk_storage::Directory;
    use clinicdesk_util::{AppConfig, Environment};

    use super::AppState;
    use crate::telemetry;

    pub const OPERATOR_KEY: &str = "operator-secret";

    pub fn test_config(root: &Path) -> AppConfig {
        AppConfig {
            bind_addr: "127.0.0.1:0".parse().expect("addr"),
            environment: Environment::Test,
            public_url: "https://portal.clinicdesk.test".to_string(),
            directory_database_url: format!("sqlite://{}", root.join("directory.db").display()),
            tenant_data_dir: root.join("tenants"),
            domain_suffix: "local".to_string(),
            admin_login_path: "/admin/login".to_string(),
            confirmation_ttl: Duration::from_secs(60 * 60 * 24),
            tenant_cache_ttl: Duration::from_secs(30),
            single_tenant_mode: false,
            fallback_database_url: None,
            supported_languages: vec!["en".to_string(), "ar".to_string()],
            default_language: "en".to_string(),
            mail: None,
            mail_sender: "no-reply@clinicdesk.test".to_string(),
            recovery_interval: Duration::ZERO,
            operator_api_key: Some(OPERATOR_KEY.to_string()),
        }
    }

    /// Application state over temporary SQLite files and an in-memory mailer.
    pub struct TestApp {
        pub state: AppState,
        pub mailer: MemoryMailer,
        _dir: TempDir,
    }

    impl TestApp {
        pub async fn new() -> Self {
            Self::with_config(|_| {}).await
        }

        pub async fn with_single_tenant_mode() -> Self {
            Self::with_config(|config| config.single_tenant_mode = true).await
        }

        /// Builds the app after `adjust` has tweaked the default test config.
        pub async fn with_config(adjust: impl FnOnce(&mut AppConfig)) -> Self {
            let dir = tempfile::tempdir().expect("tempdir");
            let mut config = test_config(dir.path());
            adjust(&mut config);
            std::fs::create_dir_all(&config.tenant_data_dir).expect("tenant dir");

            let metrics = telemetry::init_metrics().expect("metrics");
            let directory = Directory::connect(&config.directory_database_url)
                .await
                .expect("connect");
            directory.run_migrations().await.expect("migrations");

            let mailer = MemoryMailer::new();
            let state = AppState::new(&config, metrics, directory, Arc::new(mailer.clone()));
            Self {
                state,
                mailer,
                _dir: dir,
            }
        }

        /// Extracts the confirmation link from the `index`-th sent message.
        pub fn confirmation_link(&self, index: usize) -> Url {
            let sent = self.mailer.sent();
            let html = &sent.get(index).expect("message sent").html;
            let start = html.find("href=\"").expect("link present") + "href=\"".len();
            let end = start + html[start..].find('"').expect("closing quote");
            Url::parse(&html_escape::decode_html_entities(&html[start..end])).expect("valid link")
        }
    }

    pub fn registration_json(clinic_name: &str) -> Value {
        json!({
            "clinic_name": clinic_name,
            "name": "Mona Said",
            "username": "mona",
            "email": "mona@sunrise.test",
            "password": "Secret123",
            "confirm_password": "Secret123",
            "locales": ["en", "ar"]
        })
    }

    pub fn registration_form(clinic_name: &str) -> RegistrationForm {
        serde_json::from_value(registration_json(clinic_name)).expect("form")
    }
}

#[cfg(test)]
mod tests {
    use super::testing::TestApp;
    use super::*;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    #[tokio::test]
    async fn healthz_returns_ok() {
        let app = app_router(TestApp::new().await.state);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/healthz")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .expect("handler should respond");

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn metrics_exports_build_info() {
        let app = app_router(TestApp::new().await.state);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/metrics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .expect("handler should respond");

        assert_eq!(response.status(), StatusCode::OK);
        let collected = response
            .into_body()
            .collect()
            .await
            .expect("body should read");
        let body = String::from_utf8(collected.to_bytes().to_vec()).expect("utf-8");
        assert!(body.contains("app_build_info"));
        assert!(body.contains("app_uptime_seconds"));
    }
}
