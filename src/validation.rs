use crate::error::{AppError, Result};

pub fn validate_instance_id(instance_id: &str) -> Result<()> {
    if uuid::Uuid::parse_str(instance_id).is_err() {
        return Err(AppError::other("Invalid instance id"));
    }
    Ok(())
}

/// A redirect source is a bare host name, optionally with a port.
pub fn validate_host(host: &str) -> Result<()> {
    let is_safe = !host.is_empty()
        && host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | ':'));

    if !is_safe {
        return Err(AppError::config(format!("Invalid host {:?}", host)));
    }
    Ok(())
}

/// Environment variable names as accepted by the container engine.
pub fn validate_env_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false);
    if !valid_start || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(AppError::config(format!(
            "Invalid environment variable name {:?}",
            name
        )));
    }
    Ok(())
}
