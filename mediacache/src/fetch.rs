//! Requêtes HTTP(S) GET avec suivi borné des redirections
//!
//! Le client reqwest est configuré sans suivi automatique : les réponses
//! 301/302 sont suivies ici, en boucle, jusqu'à `max_redirects` sauts.

use crate::error::{CacheError, Result};
use reqwest::header::LOCATION;
use reqwest::redirect::Policy;
use reqwest::{Client, Response, StatusCode};
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Nombre maximal de redirections suivies par défaut
pub const DEFAULT_MAX_REDIRECTS: usize = 5;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Client HTTP du coordinateur de téléchargements
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
    max_redirects: usize,
}

fn transport_error(err: reqwest::Error) -> CacheError {
    if err.is_timeout() {
        CacheError::Network(format!("request timed out: {err}"))
    } else {
        CacheError::Network(err.to_string())
    }
}

impl HttpFetcher {
    pub fn new(max_redirects: usize) -> Result<Self> {
        let client = Client::builder()
            .redirect(Policy::none())
            .connect_timeout(CONNECT_TIMEOUT)
            .user_agent(concat!("mediacache/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| CacheError::Internal(format!("unable to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            max_redirects,
        })
    }

    /// Envoie un GET et suit les redirections 301/302
    ///
    /// Retourne la réponse finale (statut 2xx) dont le corps n'a pas encore
    /// été lu.
    pub async fn get(&self, url: &str) -> Result<Response> {
        let mut current = Url::parse(url)
            .map_err(|e| CacheError::Network(format!("invalid URL '{url}': {e}")))?;
        let mut hops = 0;

        loop {
            let response = self
                .client
                .get(current.clone())
                .send()
                .await
                .map_err(transport_error)?;
            let status = response.status();

            if status == StatusCode::MOVED_PERMANENTLY || status == StatusCode::FOUND {
                if hops >= self.max_redirects {
                    return Err(CacheError::TooManyRedirects {
                        url: url.to_string(),
                        max: self.max_redirects,
                    });
                }

                let location = response
                    .headers()
                    .get(LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .ok_or(CacheError::Http {
                        status: status.as_u16(),
                    })?;
                let next = current.join(location).map_err(|e| {
                    CacheError::Network(format!("invalid redirect location '{location}': {e}"))
                })?;

                debug!(from = %current, to = %next, status = status.as_u16(), "Following redirect");
                current = next;
                hops += 1;
                continue;
            }

            if !status.is_success() {
                return Err(CacheError::Http {
                    status: status.as_u16(),
                });
            }

            return Ok(response);
        }
    }
}
