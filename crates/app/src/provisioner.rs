use std::{path::PathBuf, sync::Arc, time::Duration, time::Instant};

use argon2::{
    password_hash::{PasswordHasher, SaltString},
    Argon2,
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use html_escape::{encode_double_quoted_attribute, encode_text};
use metrics::{counter, histogram};
use rand::rngs::OsRng;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use clinicdesk_core::{tenant_domain, ProvisioningState, RegistrationError, RegistrationForm, Tenant};
use clinicdesk_mailer::{MailError, Mailer};
use clinicdesk_storage::{
    Account, AccountError, DirectoryError, FactoryError, NewAccount, NewTenant, PendingFounder,
    StorageError, TenantDataContextFactory, TenantDatabase, TenantRepository,
};
use clinicdesk_util::AppConfig;

use crate::confirmation::{confirmation_link, hash_token, hashes_match, issue_token};
use crate::resolver::TenantResolver;
use crate::router::Clock;

const ADMIN_ROLE: &str = "admin";

/// Settings the provisioner needs from the runtime configuration.
#[derive(Debug, Clone)]
pub struct ProvisioningSettings {
    pub domain_suffix: String,
    pub tenant_data_dir: PathBuf,
    pub public_url: String,
    pub admin_login_path: String,
    pub confirmation_ttl: Duration,
}

impl From<&AppConfig> for ProvisioningSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            domain_suffix: config.domain_suffix.clone(),
            tenant_data_dir: config.tenant_data_dir.clone(),
            public_url: config.public_url.clone(),
            admin_login_path: config.admin_login_path.clone(),
            confirmation_ttl: config.confirmation_ttl,
        }
    }
}

/// Creates tenants and confirms their founding administrators.
///
/// Provisioning spans the directory and the tenant's own database, so each
/// completed step is persisted as the tenant's `provisioning_state` and an
/// interrupted run can be resumed from there.
#[derive(Clone)]
pub struct Provisioner {
    tenants: TenantRepository,
    factory: TenantDataContextFactory,
    resolver: TenantResolver,
    mailer: Arc<dyn Mailer>,
    settings: Arc<ProvisioningSettings>,
    clock: Clock,
}

impl Provisioner {
    pub fn new(
        tenants: TenantRepository,
        factory: TenantDataContextFactory,
        resolver: TenantResolver,
        mailer: Arc<dyn Mailer>,
        settings: ProvisioningSettings,
        clock: Clock,
    ) -> Self {
        Self {
            tenants,
            factory,
            resolver,
            mailer,
            settings: Arc::new(settings),
            clock,
        }
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    /// Registers a new clinic and provisions its isolated database.
    pub async fn create_tenant(&self, form: RegistrationForm) -> Result<Tenant, ProvisionError> {
        let started = Instant::now();
        let result = self.create_tenant_inner(form).await;
        histogram!("provisioning_duration_seconds").record(started.elapsed().as_secs_f64());
        counter!("provisioning_total", "result" => outcome_label(&result)).increment(1);
        result
    }

    async fn create_tenant_inner(&self, form: RegistrationForm) -> Result<Tenant, ProvisionError> {
        let registration = form.validate()?;
        let domain = tenant_domain(&registration.slug, &self.settings.domain_suffix);
        if self.tenants.exists_enabled_domain(&domain).await? {
            return Err(ProvisionError::DuplicateClinic { domain });
        }

        let password_hash = hash_password(registration.password).await?;
        let id = Uuid::new_v4().to_string();
        let connection = self.connection_for(&registration.slug, &id);
        let founder = PendingFounder {
            name: registration.founder_name,
            username: registration.username,
            email: registration.email,
            password_hash,
        };

        let tenant = self
            .tenants
            .insert(
                &NewTenant {
                    id: &id,
                    name: &registration.clinic_name,
                    domain: &domain,
                    connection: &connection,
                    locales: &registration.locales,
                    created_at: self.now(),
                },
                Some(&founder),
            )
            .await
            .map_err(|err| match err {
                DirectoryError::DuplicateDomain => ProvisionError::DuplicateClinic {
                    domain: domain.clone(),
                },
                other => ProvisionError::Directory(other),
            })?;
        info!(stage = "provision", tenant_id = %tenant.id, domain = %tenant.domain, "tenant registered in directory");

        self.drive(tenant).await
    }

    /// Continues an interrupted provisioning from its persisted state.
    ///
    /// A fully provisioned tenant is returned unchanged.
    pub async fn resume(&self, tenant_id: &str) -> Result<Tenant, ProvisionError> {
        let tenant = match self.tenants.fetch(tenant_id).await {
            Ok(tenant) if tenant.enabled => tenant,
            Ok(_) | Err(DirectoryError::NotFound) => return Err(ProvisionError::TenantNotFound),
            Err(err) => return Err(err.into()),
        };
        if tenant.provisioning_state.is_complete() {
            return Ok(tenant);
        }

        info!(stage = "provision", tenant_id, from = %tenant.provisioning_state, "resuming provisioning");
        let result = self.drive(tenant).await;
        let label = if result.is_ok() { "resumed" } else { outcome_label(&result) };
        counter!("provisioning_total", "result" => label).increment(1);
        result
    }

    /// Enabled tenants with unfinished provisioning, last touched at or before
    /// `updated_before`.
    pub async fn incomplete(
        &self,
        updated_before: DateTime<Utc>,
    ) -> Result<Vec<Tenant>, ProvisionError> {
        Ok(self.tenants.list_incomplete(updated_before).await?)
    }

    async fn drive(&self, mut tenant: Tenant) -> Result<Tenant, ProvisionError> {
        loop {
            let reached = tenant.provisioning_state;
            let step = match reached {
                ProvisioningState::DirectoryCreated => self
                    .prepare_schema(&tenant)
                    .await
                    .map(|_| ProvisioningState::SchemaReady),
                ProvisioningState::SchemaReady => self
                    .bootstrap_admin(&tenant)
                    .await
                    .map(|_| ProvisioningState::AdminBootstrapped),
                ProvisioningState::AdminBootstrapped => self
                    .send_confirmation(&tenant)
                    .await
                    .map(|_| ProvisioningState::NotificationSent),
                ProvisioningState::NotificationSent => break,
            };

            let advanced = match step {
                Ok(next) => self
                    .tenants
                    .advance_provisioning(&tenant.id, next, self.now())
                    .await
                    .map(|_| next)
                    .map_err(StepError::Directory),
                Err(err) => Err(err),
            };

            match advanced {
                Ok(next) => {
                    info!(stage = "provision", tenant_id = %tenant.id, state = %next, "provisioning step completed");
                    tenant.provisioning_state = next;
                    tenant.provisioning_error = None;
                }
                Err(source) => return Err(self.fail(&tenant, reached, source).await),
            }
        }

        self.resolver.invalidate_all();
        Ok(tenant)
    }

    async fn fail(&self, tenant: &Tenant, reached: ProvisioningState, source: StepError) -> ProvisionError {
        error!(
            stage = "provision",
            tenant_id = %tenant.id,
            reached = %reached,
            error = %source,
            "provisioning incomplete"
        );
        if let Err(err) = self
            .tenants
            .record_provisioning_failure(&tenant.id, &source.to_string(), self.now())
            .await
        {
            error!(stage = "provision", tenant_id = %tenant.id, error = %err, "failed to record provisioning failure");
        }
        self.factory.evict(&tenant.id).await;

        ProvisionError::ProvisioningIncomplete {
            tenant_id: tenant.id.clone(),
            reached,
            source,
        }
    }

    async fn open(&self, tenant: &Tenant) -> Result<TenantDatabase, StepError> {
        Ok(self.factory.open(tenant).await?)
    }

    async fn prepare_schema(&self, tenant: &Tenant) -> Result<(), StepError> {
        let db = self.open(tenant).await?;
        db.run_migrations().await?;
        Ok(())
    }

    async fn bootstrap_admin(&self, tenant: &Tenant) -> Result<(), StepError> {
        let db = self.open(tenant).await?;
        let accounts = db.accounts();

        match self.tenants.pending_founder(&tenant.id).await? {
            Some(founder) => {
                let account = accounts
                    .create_or_get(&NewAccount {
                        name: &founder.name,
                        username: &founder.username,
                        email: &founder.email,
                        password_hash: &founder.password_hash,
                        role: ADMIN_ROLE,
                        created_at: self.now(),
                    })
                    .await?;
                self.tenants.clear_pending_founder(&tenant.id).await?;
                info!(stage = "provision", tenant_id = %tenant.id, account_id = %account.id, "administrator account created");
                Ok(())
            }
            // founder already consumed by an earlier attempt
            None if !accounts.list_by_role(ADMIN_ROLE).await?.is_empty() => Ok(()),
            None => Err(StepError::MissingFounder),
        }
    }

    async fn send_confirmation(&self, tenant: &Tenant) -> Result<(), StepError> {
        let db = self.open(tenant).await?;
        let accounts = db.accounts();
        let admin = founding_admin(accounts.list_by_role(ADMIN_ROLE).await?)?;
        if admin.email_confirmed {
            return Ok(());
        }

        let issued = issue_token();
        let ttl = ChronoDuration::from_std(self.settings.confirmation_ttl)
            .map_err(|_| StepError::InvalidTokenTtl)?;
        accounts
            .set_confirmation_token(&admin.id, &issued.hash, self.now() + ttl)
            .await?;

        let link = confirmation_link(&self.settings.public_url, &admin.id, &issued.token, &tenant.domain)?;
        let body = format!(
            "<p>Hello {name},</p>\
             <p>Your clinic <strong>{clinic}</strong> is almost ready.</p>\
             <p><a href=\"{link}\">Confirm your account</a> to activate {domain}.</p>",
            name = encode_text(&admin.name),
            clinic = encode_text(&tenant.name),
            link = encode_double_quoted_attribute(link.as_str()),
            domain = encode_text(&tenant.domain),
        );
        self.mailer
            .send(&admin.email, "Confirm your ClinicDesk account", &body)
            .await?;
        info!(stage = "provision", tenant_id = %tenant.id, account_id = %admin.id, "confirmation email dispatched");
        Ok(())
    }

    /// Confirms the founding administrator of a live tenant.
    ///
    /// Returns the tenant's admin login URL for the caller to redirect to.
    pub async fn confirm_account(
        &self,
        domain: &str,
        user_id: &str,
        token: &str,
    ) -> Result<String, ProvisionError> {
        let result = self.confirm_account_inner(domain, user_id, token).await;
        let label = match &result {
            Ok(_) => "confirmed",
            Err(ProvisionError::ConfirmationFailed(reason)) => reason.as_str(),
            Err(ProvisionError::TenantNotFound) => "tenant_not_found",
            Err(_) => "error",
        };
        counter!("account_confirmation_total", "result" => label).increment(1);
        result
    }

    async fn confirm_account_inner(
        &self,
        domain: &str,
        user_id: &str,
        token: &str,
    ) -> Result<String, ProvisionError> {
        let tenant = self
            .tenants
            .find_live_by_exact_domain(domain)
            .await?
            .ok_or(ProvisionError::TenantNotFound)?;
        let db = self.factory.open(&tenant).await?;
        let accounts = db.accounts();

        let account = match accounts.fetch(user_id).await {
            Ok(account) => account,
            Err(AccountError::NotFound) => {
                return Err(ConfirmationFailure::UnknownAccount.into());
            }
            Err(err) => return Err(err.into()),
        };
        if account.email_confirmed {
            return Err(ConfirmationFailure::AlreadyConfirmed.into());
        }

        let now = self.now();
        let stored = account
            .confirmation_token_hash
            .as_deref()
            .ok_or(ConfirmationFailure::InvalidToken)?;
        if !hashes_match(&hash_token(token), stored) {
            return Err(ConfirmationFailure::InvalidToken.into());
        }
        if account.confirmation_expires_at.map_or(true, |expires| expires <= now) {
            return Err(ConfirmationFailure::Expired.into());
        }
        if !accounts.mark_confirmed(&account.id, stored, now).await? {
            // lost a race with a concurrent confirmation of the same token
            return Err(ConfirmationFailure::AlreadyConfirmed.into());
        }

        let login_url = tenant.url_for(&self.settings.admin_login_path);
        info!(stage = "provision", tenant_id = %tenant.id, account_id = %account.id, "account confirmed");

        let body = format!(
            "<p>Hello {name},</p><p>Your account is ready. Sign in at <a href=\"{href}\">{text}</a>.</p>",
            name = encode_text(&account.name),
            href = encode_double_quoted_attribute(&login_url),
            text = encode_text(&login_url),
        );
        if let Err(err) = self
            .mailer
            .send(&account.email, "Your ClinicDesk account is ready", &body)
            .await
        {
            warn!(stage = "provision", tenant_id = %tenant.id, error = %err, "failed to send account ready email");
        }

        Ok(login_url)
    }

    fn connection_for(&self, slug: &str, tenant_id: &str) -> String {
        let prefix: String = tenant_id.chars().filter(|c| *c != '-').take(8).collect();
        let path = self
            .settings
            .tenant_data_dir
            .join(format!("{slug}_{prefix}.db"));
        format!("sqlite://{}", path.display())
    }

    #[cfg(test)]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }
}

fn founding_admin(admins: Vec<Account>) -> Result<Account, StepError> {
    admins.into_iter().next().ok_or(StepError::MissingAdmin)
}

async fn hash_password(password: String) -> Result<String, ProvisionError> {
    tokio::task::spawn_blocking(move || {
        let salt = SaltString::generate(&mut OsRng);
        Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|err| ProvisionError::PasswordHash(err.to_string()))
    })
    .await
    .map_err(|err| ProvisionError::PasswordHash(err.to_string()))?
}

fn outcome_label(result: &Result<Tenant, ProvisionError>) -> &'static str {
    match result {
        Ok(_) => "created",
        Err(ProvisionError::InvalidInput(_)) => "invalid",
        Err(ProvisionError::DuplicateClinic { .. }) => "duplicate",
        Err(ProvisionError::ProvisioningIncomplete { .. }) => "incomplete",
        Err(ProvisionError::TenantNotFound) => "tenant_not_found",
        Err(_) => "failed",
    }
}

/// Reason a confirmation link was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmationFailure {
    UnknownAccount,
    InvalidToken,
    Expired,
    AlreadyConfirmed,
}

impl ConfirmationFailure {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UnknownAccount => "unknown_account",
            Self::InvalidToken => "invalid_token",
            Self::Expired => "expired",
            Self::AlreadyConfirmed => "already_confirmed",
        }
    }
}

impl From<ConfirmationFailure> for ProvisionError {
    fn from(value: ConfirmationFailure) -> Self {
        Self::ConfirmationFailed(value)
    }
}

/// Failure of a single provisioning step.
#[derive(Debug, Error)]
pub enum StepError {
    #[error("tenant storage: {0}")]
    Storage(#[from] StorageError),
    #[error("tenant storage: {0}")]
    Factory(#[from] FactoryError),
    #[error("directory: {0}")]
    Directory(#[from] DirectoryError),
    #[error("identity store: {0}")]
    Account(#[from] AccountError),
    #[error("confirmation email: {0}")]
    Mail(#[from] MailError),
    #[error("confirmation link: {0}")]
    Link(#[from] url::ParseError),
    #[error("pending founder is missing and no administrator exists")]
    MissingFounder,
    #[error("no administrator account to confirm")]
    MissingAdmin,
    #[error("confirmation token ttl is out of range")]
    InvalidTokenTtl,
}

impl StepError {
    /// Returns `true` when retrying the step may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Storage(_) | Self::Factory(_) | Self::Directory(_) | Self::Account(_) => true,
            Self::Mail(err) => err.is_transient(),
            Self::Link(_) | Self::MissingFounder | Self::MissingAdmin | Self::InvalidTokenTtl => false,
        }
    }
}

/// Errors surfaced by tenant provisioning and account confirmation.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("invalid registration: {0}")]
    InvalidInput(#[from] RegistrationError),
    #[error("a clinic already uses the domain {domain}")]
    DuplicateClinic { domain: String },
    #[error("tenant not found")]
    TenantNotFound,
    #[error("provisioning of tenant {tenant_id} stopped at {reached}: {source}")]
    ProvisioningIncomplete {
        tenant_id: String,
        reached: ProvisioningState,
        #[source]
        source: StepError,
    },
    #[error("confirmation failed: {}", .0.as_str())]
    ConfirmationFailed(ConfirmationFailure),
    #[error("failed to hash password: {0}")]
    PasswordHash(String),
    #[error("directory error: {0}")]
    Directory(#[from] DirectoryError),
    #[error("tenant storage error: {0}")]
    Factory(#[from] FactoryError),
    #[error("identity store error: {0}")]
    Account(#[from] AccountError),
}

impl ProvisionError {
    /// Returns `true` for transient storage or delivery failures.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Directory(_) | Self::Factory(_) | Self::Account(_) => true,
            Self::ProvisioningIncomplete { source, .. } => source.is_transient(),
            Self::InvalidInput(_)
            | Self::DuplicateClinic { .. }
            | Self::TenantNotFound
            | Self::ConfirmationFailed(_)
            | Self::PasswordHash(_) => false,
        }
    }
}
