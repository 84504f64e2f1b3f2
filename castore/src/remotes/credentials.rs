use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use data_encoding::{BASE64, BASE64URL};
use serde::Deserialize;
use tracing::debug;

use super::Error;

/// The key docker uses in its config file for the default registry.
const DOCKER_HUB_CONFIG_KEY: &str = "https://index.docker.io/v1/";

/// A login and password for a registry.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub login: String,
    pub password: String,
}

impl Credentials {
    pub fn new(login: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            login: login.into(),
            password: password.into(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("login", &self.login)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl std::str::FromStr for Credentials {
    type Err = String;

    /// Parses `login:password`. The password may itself contain colons.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((login, password)) if !login.is_empty() => Ok(Credentials::new(login, password)),
            _ => Err("expected login:password".to_string()),
        }
    }
}

/// Provides credentials for registry hosts.
pub trait CredentialProvider: Send + Sync {
    /// Returns the credentials to use for `host`, or None to access it
    /// anonymously.
    fn resolve(&self, host: &str) -> Result<Option<Credentials>, Error>;
}

impl<A> CredentialProvider for A
where
    A: AsRef<dyn CredentialProvider> + Send + Sync,
{
    fn resolve(&self, host: &str) -> Result<Option<Credentials>, Error> {
        self.as_ref().resolve(host)
    }
}

/// Fixed credentials per host.
#[derive(Debug, Default, Clone)]
pub struct StaticCredentials {
    hosts: HashMap<String, Credentials>,
}

impl StaticCredentials {
    pub fn insert(&mut self, host: impl Into<String>, credentials: Credentials) {
        self.hosts.insert(host.into(), credentials);
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}

impl CredentialProvider for StaticCredentials {
    fn resolve(&self, host: &str) -> Result<Option<Credentials>, Error> {
        Ok(self.hosts.get(host).cloned())
    }
}

#[derive(Deserialize, Default)]
struct DockerConfig {
    #[serde(default)]
    auths: HashMap<String, DockerAuth>,
}

#[derive(Deserialize)]
struct DockerAuth {
    #[serde(default)]
    auth: Option<String>,
}

/// Credentials stored by `docker login` in `~/.docker/config.json`.
///
/// Only the `auths.<host>.auth` entries are used, credential helpers are not
/// supported. Optionally restricted to a set of hosts, others resolve to no
/// credentials.
#[derive(Default)]
pub struct DockerConfigCredentials {
    auths: HashMap<String, String>,
    only: Option<HashSet<String>>,
}

impl DockerConfigCredentials {
    /// The location of the docker config file, in `$DOCKER_CONFIG` or
    /// `~/.docker`.
    pub fn default_path() -> Option<PathBuf> {
        if let Some(dir) = std::env::var_os("DOCKER_CONFIG").filter(|d| !d.is_empty()) {
            return Some(PathBuf::from(dir).join("config.json"));
        }
        dirs::home_dir().map(|home| home.join(".docker").join("config.json"))
    }

    /// Loads the config file at `path`. A missing file yields no credentials.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let data = match std::fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path=?path, "no docker config");
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };
        Self::from_slice(&data)
    }

    pub fn from_slice(data: &[u8]) -> Result<Self, Error> {
        let config: DockerConfig =
            serde_json::from_slice(data).map_err(|e| Error::InvalidCredentials {
                host: "*".to_string(),
                reason: format!("unable to parse docker config: {}", e),
            })?;

        Ok(Self {
            auths: config
                .auths
                .into_iter()
                .filter_map(|(host, auth)| auth.auth.map(|auth| (host, auth)))
                .collect(),
            only: None,
        })
    }

    /// Restricts the credentials to the given hosts.
    pub fn restrict_to(mut self, hosts: impl IntoIterator<Item = String>) -> Self {
        self.only = Some(hosts.into_iter().collect());
        self
    }

    fn lookup(&self, host: &str) -> Option<&String> {
        self.auths.get(host).or_else(|| match host {
            "docker.io" | "registry-1.docker.io" | "index.docker.io" => {
                self.auths.get(DOCKER_HUB_CONFIG_KEY)
            }
            _ => None,
        })
    }
}

impl CredentialProvider for DockerConfigCredentials {
    fn resolve(&self, host: &str) -> Result<Option<Credentials>, Error> {
        if let Some(only) = &self.only {
            if !only.contains(host) {
                return Ok(None);
            }
        }

        let Some(auth) = self.lookup(host) else {
            return Ok(None);
        };

        let invalid = |reason: &str| Error::InvalidCredentials {
            host: host.to_string(),
            reason: reason.to_string(),
        };

        let decoded = BASE64
            .decode(auth.as_bytes())
            .or_else(|_| BASE64URL.decode(auth.as_bytes()))
            .map_err(|_| invalid("auth is not valid base64"))?;
        let decoded = String::from_utf8(decoded).map_err(|_| invalid("auth is not utf-8"))?;

        decoded.parse().map(Some).map_err(|e: String| invalid(&e))
    }
}

/// Asks each provider in turn, the first one returning credentials wins.
#[derive(Default)]
pub struct ChainedCredentials {
    providers: Vec<Box<dyn CredentialProvider>>,
}

impl ChainedCredentials {
    pub fn new(providers: Vec<Box<dyn CredentialProvider>>) -> Self {
        Self { providers }
    }
}

impl CredentialProvider for ChainedCredentials {
    fn resolve(&self, host: &str) -> Result<Option<Credentials>, Error> {
        for provider in &self.providers {
            if let Some(credentials) = provider.resolve(host)? {
                return Ok(Some(credentials));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    // "alice:s3cr:et"
    const DOCKER_CONFIG: &str = r#"{
        "auths": {
            "registry.example.com": { "auth": "YWxpY2U6czNjcjpldA==" },
            "https://index.docker.io/v1/": { "auth": "Ym9iOmh1bnRlcjI=" },
            "helper-only.example.com": {},
            "broken.example.com": { "auth": "!!!" }
        },
        "credsStore": "desktop"
    }"#;

    #[rstest]
    #[case::direct("registry.example.com", Some(("alice", "s3cr:et")))]
    #[case::docker_hub("registry-1.docker.io", Some(("bob", "hunter2")))]
    #[case::docker_hub_short("docker.io", Some(("bob", "hunter2")))]
    #[case::without_auth("helper-only.example.com", None)]
    #[case::unknown("ghcr.io", None)]
    fn docker_config(#[case] host: &str, #[case] exp: Option<(&str, &str)>) {
        let provider = DockerConfigCredentials::from_slice(DOCKER_CONFIG.as_bytes()).unwrap();
        assert_eq!(
            exp.map(|(login, password)| Credentials::new(login, password)),
            provider.resolve(host).expect("must resolve")
        );
    }

    #[test]
    fn docker_config_invalid_auth() {
        let provider = DockerConfigCredentials::from_slice(DOCKER_CONFIG.as_bytes()).unwrap();
        assert!(provider.resolve("broken.example.com").is_err());
    }

    #[test]
    fn docker_config_restricted() {
        let provider = DockerConfigCredentials::from_slice(DOCKER_CONFIG.as_bytes())
            .unwrap()
            .restrict_to(["docker.io".to_string()]);
        assert!(provider.resolve("registry.example.com").unwrap().is_none());
        assert!(provider.resolve("docker.io").unwrap().is_some());
    }

    #[test]
    fn docker_config_missing_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let provider = DockerConfigCredentials::load(&dir.path().join("config.json")).unwrap();
        assert!(provider.resolve("docker.io").unwrap().is_none());
    }

    #[test]
    fn chained_first_wins() {
        let mut first = StaticCredentials::default();
        first.insert("a.example.com", Credentials::new("first", "pw"));
        let mut second = StaticCredentials::default();
        second.insert("a.example.com", Credentials::new("second", "pw"));
        second.insert("b.example.com", Credentials::new("second", "pw"));

        let chained = ChainedCredentials::new(vec![Box::new(first), Box::new(second)]);
        assert_eq!("first", chained.resolve("a.example.com").unwrap().unwrap().login);
        assert_eq!("second", chained.resolve("b.example.com").unwrap().unwrap().login);
        assert!(chained.resolve("c.example.com").unwrap().is_none());
    }

    #[rstest]
    #[case::simple("user:pw", Some(("user", "pw")))]
    #[case::colon_in_password("user:p:w", Some(("user", "p:w")))]
    #[case::no_colon("user", None)]
    #[case::empty_login(":pw", None)]
    fn parse_credentials(#[case] input: &str, #[case] exp: Option<(&str, &str)>) {
        assert_eq!(
            exp.map(|(login, password)| Credentials::new(login, password)),
            input.parse::<Credentials>().ok()
        );
    }
}
