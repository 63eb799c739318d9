use std::time::Duration;

use chrono::Duration as ChronoDuration;
use metrics::counter;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::provisioner::{ProvisionError, Provisioner};
use crate::router::Clock;

const DEFAULT_GRACE_SECS: i64 = 120;

/// Background worker that resumes provisionings left incomplete by a crash or
/// a transient failure.
#[derive(Clone)]
pub struct RecoveryWorker {
    provisioner: Provisioner,
    clock: Clock,
    interval: Duration,
    grace: ChronoDuration,
}

/// Outcome of one recovery pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryReport {
    pub resumed: usize,
    pub failed: usize,
}

impl RecoveryWorker {
    pub fn new(provisioner: Provisioner, clock: Clock, interval: Duration) -> Self {
        // Tenants touched within `grace` may still be mid-registration.
        Self {
            provisioner,
            clock,
            interval,
            grace: ChronoDuration::seconds(DEFAULT_GRACE_SECS),
        }
    }

    #[cfg(test)]
    pub fn with_grace(mut self, grace: ChronoDuration) -> Self {
        self.grace = grace;
        self
    }

    /// Runs the worker loop in the background.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run_loop().await;
        })
    }

    async fn run_loop(self) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(err) = self.run_once().await {
                error!(stage = "recovery", error = %err, "provisioning recovery run failed");
            }
        }
    }

    /// Resumes every stale incomplete provisioning once.
    pub async fn run_once(&self) -> Result<RecoveryReport, ProvisionError> {
        let threshold = (self.clock)() - self.grace;
        let pending = self.provisioner.incomplete(threshold).await?;
        let mut report = RecoveryReport::default();

        for tenant in pending {
            match self.provisioner.resume(&tenant.id).await {
                Ok(resumed) => {
                    report.resumed += 1;
                    counter!("provisioning_recovery_total", "result" => "resumed").increment(1);
                    info!(stage = "recovery", tenant_id = %resumed.id, state = %resumed.provisioning_state, "provisioning recovered");
                }
                Err(err) => {
                    report.failed += 1;
                    counter!("provisioning_recovery_total", "result" => "failed").increment(1);
                    warn!(stage = "recovery", tenant_id = %tenant.id, error = %err, "provisioning still incomplete");
                }
            }
        }

        if report.resumed > 0 || report.failed > 0 {
            info!(
                stage = "recovery",
                resumed = report.resumed,
                failed = report.failed,
                threshold = %threshold.to_rfc3339(),
                "recovery pass completed"
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::router::testing::{registration_form, TestApp};
    use axum::http::StatusCode;
    use chrono::Utc;
    use clinicdesk_core::ProvisioningState;

    fn worker_at(app: &TestApp, offset: ChronoDuration) -> RecoveryWorker {
        let now = Utc::now() + offset;
        RecoveryWorker::new(
            app.state.provisioner().clone(),
            Arc::new(move || now),
            Duration::from_secs(60),
        )
    }

    #[tokio::test]
    async fn resumes_stale_incomplete_provisioning() {
        let app = TestApp::new().await;
        app.mailer.fail_with(Some(StatusCode::SERVICE_UNAVAILABLE));
        let err = app
            .state
            .provisioner()
            .create_tenant(registration_form("Sunrise Clinic"))
            .await
            .expect_err("mail outage leaves provisioning incomplete");
        assert!(err.is_retryable());

        app.mailer.fail_with(None);
        let report = worker_at(&app, ChronoDuration::minutes(10))
            .run_once()
            .await
            .expect("recovery pass");
        assert_eq!(report, RecoveryReport { resumed: 1, failed: 0 });

        let tenant = app
            .state
            .resolver()
            .resolve("sunriseclinic.local")
            .await
            .unwrap()
            .expect("tenant is live after recovery");
        assert_eq!(tenant.provisioning_state, ProvisioningState::NotificationSent);
        assert_eq!(app.mailer.sent().len(), 1);
    }

    #[tokio::test]
    async fn recent_failures_wait_for_the_grace_period() {
        let app = TestApp::new().await;
        app.mailer.fail_with(Some(StatusCode::SERVICE_UNAVAILABLE));
        app.state
            .provisioner()
            .create_tenant(registration_form("Sunrise Clinic"))
            .await
            .expect_err("incomplete");

        let report = worker_at(&app, ChronoDuration::zero())
            .run_once()
            .await
            .expect("recovery pass");
        assert_eq!(report, RecoveryReport::default());
    }

    #[tokio::test]
    async fn counts_tenants_that_remain_incomplete() {
        let app = TestApp::new().await;
        app.mailer.fail_with(Some(StatusCode::SERVICE_UNAVAILABLE));
        app.state
            .provisioner()
            .create_tenant(registration_form("Sunrise Clinic"))
            .await
            .expect_err("incomplete");

        let report = worker_at(&app, ChronoDuration::minutes(10))
            .with_grace(ChronoDuration::minutes(1))
            .run_once()
            .await
            .expect("recovery pass");
        assert_eq!(report, RecoveryReport { resumed: 0, failed: 1 });
    }
}
