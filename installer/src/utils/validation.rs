// Input validation utilities
//
// Values validated here end up verbatim in the descriptor file, which the container engine
// reads as an env file. Anything that could be interpreted by a shell is rejected up front.

use anyhow::Result;
use regex::Regex;

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern)
        .map_err(|e| anyhow::anyhow!("Internal error: failed to compile validation regex: {}", e))
}

/// Validate a public hostname (RFC 1123 labels, at least one dot, or `localhost`).
pub fn validate_domain(domain: &str) -> Result<()> {
    let d = domain.trim();
    if d.is_empty() {
        return Err(anyhow::anyhow!("Domain cannot be empty"));
    }
    if d.len() > 253 {
        return Err(anyhow::anyhow!("Domain cannot exceed 253 characters"));
    }
    if d.eq_ignore_ascii_case("localhost") {
        return Ok(());
    }

    let label_re = compile(r"^[A-Za-z0-9](?:[A-Za-z0-9-]{0,61}[A-Za-z0-9])?$")?;
    let labels: Vec<&str> = d.split('.').collect();
    if labels.len() < 2 {
        return Err(anyhow::anyhow!(
            "Domain '{}' must be a fully qualified name (e.g. app.example.com)",
            d
        ));
    }
    for label in labels {
        if !label_re.is_match(label) {
            return Err(anyhow::anyhow!(
                "Domain '{}' contains an invalid label '{}'",
                d,
                label
            ));
        }
    }

    // Cross-check with the URL parser so APP_URL is always well-formed.
    url::Url::parse(&format!("https://{}/", d))
        .map_err(|e| anyhow::anyhow!("Domain '{}' does not form a valid URL: {}", d, e))?;
    Ok(())
}

/// Validate an administrator email address (pragmatic subset of RFC 5322).
pub fn validate_email(email: &str) -> Result<()> {
    let e = email.trim();
    if e.is_empty() {
        return Err(anyhow::anyhow!("Email cannot be empty"));
    }
    if e.len() > 254 {
        return Err(anyhow::anyhow!("Email cannot exceed 254 characters"));
    }
    let re = compile(r"^[A-Za-z0-9._%+-]+@[A-Za-z0-9](?:[A-Za-z0-9-]*[A-Za-z0-9])?(?:\.[A-Za-z0-9](?:[A-Za-z0-9-]*[A-Za-z0-9])?)+$")?;
    if !re.is_match(e) {
        return Err(anyhow::anyhow!("Email '{}' is not a valid address", e));
    }
    Ok(())
}

/// Validate a registration token.
pub fn validate_token(token: &str) -> Result<()> {
    let t = token.trim();
    if t.is_empty() {
        return Err(anyhow::anyhow!("Token cannot be empty"));
    }
    let re = compile(r"^[A-Za-z0-9._-]{8,256}$")?;
    if !re.is_match(t) {
        return Err(anyhow::anyhow!(
            "Token must be 8-256 characters of letters, digits, '.', '_' or '-'"
        ));
    }
    Ok(())
}

/// Validate the project naming prefix used for containers and volumes.
pub fn validate_project_name(name: &str) -> Result<()> {
    let re = compile(r"^[a-z][a-z0-9_-]{0,62}$")?;
    if !re.is_match(name) {
        return Err(anyhow::anyhow!(
            "Project name '{}' must start with a lowercase letter and contain only a-z, 0-9, '_' or '-'",
            name
        ));
    }
    Ok(())
}
