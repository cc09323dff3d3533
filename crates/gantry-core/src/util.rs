use rand::{distributions::Alphanumeric, Rng};

/// Generates a random alphanumeric token, used for key ids, secrets,
/// activation codes and autogenerated signing keys.
pub fn random_token(len: usize) -> String {
    rand::thread_rng().sample_iter(&Alphanumeric).take(len).map(char::from).collect()
}

/// Ensures an HTTP path prefix ends with a slash, so prefix matching never
/// has to special-case the boundary.
pub fn ensure_final_slash(path: &str) -> String {
    if path.ends_with('/') {
        path.to_string()
    } else {
        format!("{path}/")
    }
}
