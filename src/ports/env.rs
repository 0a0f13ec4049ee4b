// Environment variable naming for allocated ports

/// `http-server` -> `HTTP_SERVER_PORT`
pub fn port_env_var(service: &str) -> String {
    format!("{}_PORT", env_prefix(service))
}

/// `http-server` -> `HTTP_SERVER`
pub fn env_prefix(service: &str) -> String {
    service.to_uppercase().replace('-', "_")
}
