use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

/// Connection parameters for one destination after ~/.ssh/config resolution.
pub struct ResolvedHost {
    pub hostname: String,
    pub port: u16,
    pub user: String,
    pub identity_files: Vec<PathBuf>,
}

/// Split a `[user@]host` destination.
pub fn parse_destination(destination: &str) -> (Option<&str>, &str) {
    match destination.split_once('@') {
        Some((user, host)) if !user.is_empty() && !host.is_empty() => (Some(user), host),
        _ => (None, destination),
    }
}

/// Resolve connection parameters for a `[user@]host` destination.
///
/// A user given in the destination and a port given on the command line win
/// over ~/.ssh/config, which wins over the defaults (port 22, the local
/// username, and the usual identity files).
pub fn resolve(destination: &str, port_override: Option<u16>) -> ResolvedHost {
    let (user_override, host) = parse_destination(destination);

    let options = ssh_config_path()
        .and_then(|path| open_config(&path))
        .and_then(|reader| collect_host_options(reader, host))
        .unwrap_or_default();

    let hostname = options.hostname.unwrap_or_else(|| host.to_string());
    let port = port_override.or(options.port).unwrap_or(22);
    let user = user_override
        .map(str::to_string)
        .or(options.user)
        .unwrap_or_else(local_username);
    let identity_files = if options.identity_files.is_empty() {
        default_identity_files()
    } else {
        options.identity_files
    };

    debug!(host, %hostname, port, %user, "resolved SSH destination");

    ResolvedHost {
        hostname,
        port,
        user,
        identity_files,
    }
}

fn ssh_config_path() -> Option<PathBuf> {
    let path = dirs::home_dir()?.join(".ssh").join("config");
    path.exists().then_some(path)
}

fn open_config(path: &Path) -> Option<BufReader<std::fs::File>> {
    match std::fs::File::open(path) {
        Ok(file) => Some(BufReader::new(file)),
        Err(e) => {
            warn!(%e, path = %path.display(), "cannot read SSH config");
            None
        }
    }
}

/// Options gathered from every `Host` block matching the destination.
///
/// OpenSSH keeps the first value obtained for each option, so later matching
/// blocks (typically `Host *`) only fill gaps. `IdentityFile` accumulates.
#[derive(Default)]
struct HostOptions {
    hostname: Option<String>,
    port: Option<u16>,
    user: Option<String>,
    identity_files: Vec<PathBuf>,
}

/// Parse the supported subset of ssh_config: `Host`, `Hostname`, `Port`,
/// `User`, and `IdentityFile`. Returns None when no Host block matched.
fn collect_host_options(reader: impl BufRead, host: &str) -> Option<HostOptions> {
    let mut options = HostOptions::default();
    let mut in_matching_block = false;
    let mut matched_any = false;

    for line in reader.lines() {
        let Ok(line) = line else { continue };
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((option, value)) = split_option(line) else {
            continue;
        };

        if option.eq_ignore_ascii_case("host") {
            in_matching_block = value
                .split_whitespace()
                .any(|pattern| pattern_matches(pattern, host));
            matched_any |= in_matching_block;
            continue;
        }
        if !in_matching_block {
            continue;
        }

        match option.to_ascii_lowercase().as_str() {
            "hostname" if options.hostname.is_none() => {
                options.hostname = Some(value.to_string());
            }
            "port" if options.port.is_none() => {
                options.port = value.parse().ok();
            }
            "user" if options.user.is_none() => {
                options.user = Some(value.to_string());
            }
            "identityfile" => {
                options.identity_files.push(PathBuf::from(expand_tilde(value)));
            }
            _ => {}
        }
    }

    matched_any.then_some(options)
}

/// ssh_config accepts both `Option value` and `Option=value`.
fn split_option(line: &str) -> Option<(&str, &str)> {
    let (option, value) = match line.split_once('=') {
        Some((option, value)) => (option.trim(), value.trim()),
        None => {
            let split_at = line.find(char::is_whitespace)?;
            let (option, value) = line.split_at(split_at);
            (option.trim(), value.trim())
        }
    };
    (!option.is_empty() && !value.is_empty()).then_some((option, value))
}

/// Match one Host pattern: `*` and `?` wildcards, no negation.
fn pattern_matches(pattern: &str, host: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if !pattern.contains(['*', '?']) {
        return pattern == host;
    }
    glob_match(pattern.as_bytes(), host.as_bytes())
}

fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    let (mut p, mut t) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() && (pattern[p] == b'?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == b'*' {
            backtrack = Some((p, t));
            p += 1;
        } else if let Some((star_p, star_t)) = backtrack {
            backtrack = Some((star_p, star_t + 1));
            p = star_p + 1;
            t = star_t + 1;
        } else {
            return false;
        }
    }
    while p < pattern.len() && pattern[p] == b'*' {
        p += 1;
    }
    p == pattern.len()
}

fn expand_tilde(path: &str) -> String {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest).to_string_lossy().into_owned(),
        _ => path.to_string(),
    }
}

fn local_username() -> String {
    whoami::fallible::username().unwrap_or_else(|_| "root".to_string())
}

fn default_identity_files() -> Vec<PathBuf> {
    let Some(home) = dirs::home_dir() else {
        return Vec::new();
    };
    let ssh_dir = home.join(".ssh");
    ["id_ed25519", "id_rsa", "id_ecdsa"]
        .iter()
        .map(|name| ssh_dir.join(name))
        .filter(|path| path.exists())
        .collect()
}
