//! Parsing of `vagrant ssh-config` output.

use camino::Utf8PathBuf;

const DEFAULT_SSH_PORT: u16 = 22;

/// Connection details reported by `vagrant ssh-config`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(super) struct SshConfig {
    pub(super) host: String,
    pub(super) port: u16,
    pub(super) user: Option<String>,
    pub(super) identity_file: Option<Utf8PathBuf>,
}

/// Extracts the first host block. Returns `None` without a `HostName`.
pub(super) fn parse(text: &str) -> Option<SshConfig> {
    let mut host = None;
    let mut port = DEFAULT_SSH_PORT;
    let mut user = None;
    let mut identity_file = None;

    for line in text.lines().map(str::trim) {
        let Some((key, raw_value)) = line.split_once(char::is_whitespace) else {
            continue;
        };
        let value = raw_value.trim().trim_matches('"');
        match key {
            "Host" if host.is_some() => break,
            "HostName" => host = Some(value.to_owned()),
            "Port" => port = value.parse().unwrap_or(DEFAULT_SSH_PORT),
            "User" => user = Some(value.to_owned()),
            "IdentityFile" if identity_file.is_none() => {
                identity_file = Some(Utf8PathBuf::from(value));
            }
            _ => {}
        }
    }

    host.map(|found| SshConfig {
        host: found,
        port,
        user,
        identity_file,
    })
}
