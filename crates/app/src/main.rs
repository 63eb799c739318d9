mod confirmation;
mod operator;
mod patients;
mod problem;
mod provisioner;
mod recovery;
mod registration;
mod resolver;
mod router;
mod telemetry;
mod tenancy;

use std::{net::SocketAddr, sync::Arc};

use tracing::info;

use clinicdesk_mailer::{HttpMailer, LogMailer, Mailer};
use clinicdesk_storage::Directory;
use clinicdesk_util::{load_env_file, AppConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    load_env_file();
    let config = AppConfig::from_env()?;

    telemetry::init_tracing(&config)?;
    let metrics = telemetry::init_metrics()?;

    std::fs::create_dir_all(&config.tenant_data_dir)?;
    let directory = Directory::connect(&config.directory_database_url).await?;
    directory.run_migrations().await?;

    let mailer: Arc<dyn Mailer> = match &config.mail {
        Some(mail) => Arc::new(HttpMailer::new(
            &mail.api_url,
            mail.api_key.clone(),
            config.mail_sender.clone(),
            reqwest::Client::new(),
        )?),
        None => {
            info!(stage = "app", "MAIL_API_URL not set; confirmation emails are logged only");
            Arc::new(LogMailer)
        }
    };

    let state = router::AppState::new(&config, metrics, directory, mailer);
    if state.factory().prepare_fallback().await?.is_some() {
        info!(stage = "app", "fallback database ready");
    }

    if !config.recovery_interval.is_zero() {
        let clock: router::Clock = Arc::new(chrono::Utc::now);
        recovery::RecoveryWorker::new(
            state.provisioner().clone(),
            clock,
            config.recovery_interval,
        )
        .spawn();
    }

    let addr: SocketAddr = config.bind_addr;
    info!(stage = "app", %addr, env = %config.environment.as_str(), "starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router::app_router(state))
        .await
        .map_err(|err| err.into())
}
