use std::env;

/// Name of the machine running the backup, used for the pool master check
/// and (shortened) in status log records and mail subjects.
pub fn hostname() -> String {
    #[cfg(unix)]
    if let Ok(name) = nix::unistd::gethostname() {
        if let Some(name) = name.to_str().filter(|n| !n.is_empty()) {
            return name.to_owned();
        }
    }
    env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_owned())
}

/// `xs01.example.org` -> `xs01`.
pub fn short_host_name(hostname: &str) -> &str {
    hostname.split('.').next().unwrap_or(hostname)
}
