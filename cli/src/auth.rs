use std::sync::Arc;

use anyhow::{anyhow, Context};
use helm_image_castore::remotes::{
    ChainedCredentials, CredentialProvider, Credentials, DockerConfigCredentials,
    StaticCredentials,
};

/// How credentials for one `--auth` entry are obtained.
#[derive(Debug, PartialEq)]
enum AuthEntry {
    /// Taken from the docker config.
    DockerConfig(String),
    Explicit(String, Credentials),
}

fn parse_entry(entry: &str) -> anyhow::Result<AuthEntry> {
    match entry.split_once('=') {
        None if !entry.is_empty() => Ok(AuthEntry::DockerConfig(entry.to_string())),
        None => Err(anyhow!("empty registry host")),
        Some(("", _)) => Err(anyhow!("empty registry host in {:?}", entry)),
        Some((host, creds)) => {
            let creds = creds
                .parse::<Credentials>()
                .map_err(|e| anyhow!("invalid credentials for {}: {}", host, e))?;
            Ok(AuthEntry::Explicit(host.to_string(), creds))
        }
    }
}

/// Builds the credential provider for the registries listed with `--auth`.
/// Explicit credentials take precedence over the docker config. Registries
/// not listed are accessed anonymously.
pub fn credential_provider(auth: &[String]) -> anyhow::Result<Arc<dyn CredentialProvider>> {
    let mut explicit = StaticCredentials::default();
    let mut docker_hosts = Vec::new();

    for entry in auth {
        match parse_entry(entry)? {
            AuthEntry::DockerConfig(host) => docker_hosts.push(host),
            AuthEntry::Explicit(host, creds) => explicit.insert(host, creds),
        }
    }

    let mut providers: Vec<Box<dyn CredentialProvider>> = Vec::new();
    if !explicit.is_empty() {
        providers.push(Box::new(explicit));
    }
    if !docker_hosts.is_empty() {
        let path = DockerConfigCredentials::default_path()
            .ok_or_else(|| anyhow!("unable to locate the docker config"))?;
        let docker = DockerConfigCredentials::load(&path)
            .with_context(|| format!("loading {}", path.display()))?
            .restrict_to(docker_hosts);
        providers.push(Box::new(docker));
    }

    Ok(Arc::new(ChainedCredentials::new(providers)))
}
