//! Domain layer shared by the storage crate, the HTTP application and the
//! background workers. Nothing in here performs I/O.

pub mod host;
pub mod locale;
pub mod registration;
pub mod tenant;

pub use host::{derive_slug, normalize_host, tenant_domain};
pub use locale::{negotiate_locale, LocaleCandidates};
pub use registration::{normalize_locales, RegistrationError, RegistrationForm, ValidRegistration};
pub use tenant::{ProvisioningState, Tenant, UnknownProvisioningState};
