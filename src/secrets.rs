use std::path::Path;
use tracing::{error, info};

/// Look up the forecast API key.
///
/// Sources, in order:
/// 1. the environment variable named after `secret_id` (upper-cased,
///    non-alphanumerics replaced by `_`)
/// 2. `<secrets_dir>/<project_id>/<secret_id>`
/// 3. `<secrets_dir>/<secret_id>`
///
/// Returns `None` when no source yields a non-empty value.
pub fn get_api_key(project_id: &str, secret_id: &str, secrets_dir: &Path) -> Option<String> {
    let env_name = env_var_name(secret_id);
    if let Some(value) = std::env::var(&env_name).ok().and_then(non_empty) {
        info!("Secret '{}' read from environment", secret_id);
        return Some(value);
    }

    let candidates = [
        secrets_dir.join(project_id).join(secret_id),
        secrets_dir.join(secret_id),
    ];

    for path in &candidates {
        match std::fs::read_to_string(path) {
            Ok(content) => {
                if let Some(value) = non_empty(content) {
                    info!("Secret '{}' read from {}", secret_id, path.display());
                    return Some(value);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                error!("Failed to read secret file {}: {}", path.display(), e);
            }
        }
    }

    error!(
        "Failed to access secret '{}' for project '{}': set {} or provide {}",
        secret_id,
        project_id,
        env_name,
        candidates[0].display()
    );
    None
}

fn env_var_name(secret_id: &str) -> String {
    secret_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}
