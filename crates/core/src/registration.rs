use serde::Deserialize;
use thiserror::Error;

use crate::host::derive_slug;

const MIN_PASSWORD_LEN: usize = 6;
const MAX_CLINIC_NAME_LEN: usize = 100;
const MAX_LOCALE_LEN: usize = 8;

/// Registration form submitted by a clinic founder.
#[derive(Debug, Clone, Deserialize)]
pub struct RegistrationForm {
    pub clinic_name: String,
    pub name: String,
    pub username: String,
    pub email: String,
    pub password: String,
    pub confirm_password: String,
    #[serde(default = "default_locales")]
    pub locales: Vec<String>,
}

fn default_locales() -> Vec<String> {
    vec!["en".to_string()]
}

/// Registration data after validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidRegistration {
    pub clinic_name: String,
    pub slug: String,
    pub founder_name: String,
    pub username: String,
    pub email: String,
    pub password: String,
    pub locales: Vec<String>,
}

/// Field-level validation failures, reported back to the registrant.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistrationError {
    #[error("{field} is required")]
    Missing { field: &'static str },
    #[error("clinic name must contain at least one letter or digit")]
    UnusableClinicName,
    #[error("clinic name must be at most 100 characters")]
    ClinicNameTooLong,
    #[error("email address is invalid")]
    InvalidEmail,
    #[error("password must be at least 6 characters and contain a digit, an uppercase and a lowercase letter")]
    WeakPassword,
    #[error("password confirmation does not match")]
    PasswordMismatch,
    #[error("at least one locale is required")]
    NoLocales,
    #[error("invalid locale code: {0}")]
    InvalidLocale(String),
}

impl RegistrationForm {
    /// Validates the form and normalises its values.
    pub fn validate(self) -> Result<ValidRegistration, RegistrationError> {
        let clinic_name = required("clinic_name", &self.clinic_name)?;
        if clinic_name.chars().count() > MAX_CLINIC_NAME_LEN {
            return Err(RegistrationError::ClinicNameTooLong);
        }
        let slug = derive_slug(&clinic_name);
        if slug.is_empty() {
            return Err(RegistrationError::UnusableClinicName);
        }

        let founder_name = required("name", &self.name)?;
        let username = required("username", &self.username)?;
        let email = required("email", &self.email)?;
        if !looks_like_email(&email) {
            return Err(RegistrationError::InvalidEmail);
        }

        if self.password.is_empty() {
            return Err(RegistrationError::Missing { field: "password" });
        }
        if !is_strong_password(&self.password) {
            return Err(RegistrationError::WeakPassword);
        }
        if self.password != self.confirm_password {
            return Err(RegistrationError::PasswordMismatch);
        }

        let locales = normalize_locales(&self.locales)?;

        Ok(ValidRegistration {
            clinic_name,
            slug,
            founder_name,
            username,
            email,
            password: self.password,
            locales,
        })
    }
}

fn required(field: &'static str, value: &str) -> Result<String, RegistrationError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        Err(RegistrationError::Missing { field })
    } else {
        Ok(trimmed.to_string())
    }
}

fn looks_like_email(value: &str) -> bool {
    match value.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
                && !value.chars().any(char::is_whitespace)
        }
        None => false,
    }
}

fn is_strong_password(value: &str) -> bool {
    value.chars().count() >= MIN_PASSWORD_LEN
        && value.chars().any(|c| c.is_ascii_digit())
        && value.chars().any(char::is_uppercase)
        && value.chars().any(char::is_lowercase)
}

/// Lowercases, validates and de-duplicates locale codes, keeping their order.
pub fn normalize_locales(values: &[String]) -> Result<Vec<String>, RegistrationError> {
    let mut locales: Vec<String> = Vec::with_capacity(values.len());
    for raw in values {
        let code = raw.trim().to_ascii_lowercase();
        if code.is_empty() {
            continue;
        }
        let valid = code.len() <= MAX_LOCALE_LEN
            && code.starts_with(|c: char| c.is_ascii_alphabetic())
            && code.chars().all(|c| c.is_ascii_alphabetic() || c == '-');
        if !valid {
            return Err(RegistrationError::InvalidLocale(raw.clone()));
        }
        if !locales.contains(&code) {
            locales.push(code);
        }
    }

    if locales.is_empty() {
        return Err(RegistrationError::NoLocales);
    }
    Ok(locales)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn form() -> RegistrationForm {
        RegistrationForm {
            clinic_name: " Sunrise Clinic ".into(),
            name: "Mona Said".into(),
            username: "mona".into(),
            email: "mona@sunrise.test".into(),
            password: "Secret123".into(),
            confirm_password: "Secret123".into(),
            locales: vec!["EN".into(), "ar".into(), "en".into()],
        }
    }

    #[test]
    fn valid_form_is_normalised() {
        let valid = form().validate().expect("valid form");
        assert_eq!(valid.clinic_name, "Sunrise Clinic");
        assert_eq!(valid.slug, "sunriseclinic");
        assert_eq!(valid.locales, vec!["en".to_string(), "ar".to_string()]);
    }

    #[test]
    fn rejects_clinic_name_without_alphanumerics() {
        let mut input = form();
        input.clinic_name = "***".into();
        assert_eq!(input.validate(), Err(RegistrationError::UnusableClinicName));
    }

    #[test]
    fn rejects_missing_fields() {
        let mut input = form();
        input.username = "  ".into();
        assert_eq!(
            input.validate(),
            Err(RegistrationError::Missing { field: "username" })
        );
    }

    #[test]
    fn rejects_weak_or_mismatched_passwords() {
        let mut weak = form();
        weak.password = "secret".into();
        weak.confirm_password = "secret".into();
        assert_eq!(weak.validate(), Err(RegistrationError::WeakPassword));

        let mut mismatch = form();
        mismatch.confirm_password = "Secret124".into();
        assert_eq!(mismatch.validate(), Err(RegistrationError::PasswordMismatch));
    }

    #[test]
    fn rejects_bad_email() {
        let mut input = form();
        input.email = "mona.sunrise.test".into();
        assert_eq!(input.validate(), Err(RegistrationError::InvalidEmail));
    }

    #[test]
    fn locales_must_be_present_and_well_formed() {
        let mut empty = form();
        empty.locales = vec![" ".into()];
        assert_eq!(empty.validate(), Err(RegistrationError::NoLocales));

        let mut bad = form();
        bad.locales = vec!["en".into(), "e n".into()];
        assert_eq!(
            bad.validate(),
            Err(RegistrationError::InvalidLocale("e n".into()))
        );
    }

    #[test]
    fn omitted_locales_default_to_english() {
        let form: RegistrationForm = serde_json::from_value(serde_json::json!({
            "clinic_name": "Sunrise Clinic",
            "name": "Mona",
            "username": "mona",
            "email": "mona@sunrise.test",
            "password": "Secret123",
            "confirm_password": "Secret123"
        }))
        .unwrap();
        assert_eq!(form.locales, vec!["en".to_string()]);
    }
}
