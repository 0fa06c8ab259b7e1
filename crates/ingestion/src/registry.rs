//! Client for the national business-registry API
//!
//! All outbound calls go through one [`ApiRateLimiter`] so the whole run
//! respects the published quota. Two failure regimes are kept apart:
//!
//! - HTTP 429 means the server-side quota tripped anyway; the client sits
//!   out the advertised cooldown and retries without consuming any retry
//!   budget, as often as needed.
//! - Network failures and 5xx answers go through the exponential-backoff
//!   policy; once the budget is spent the error surfaces to the caller.
//!
//! Other 4xx answers are deterministic and returned immediately.

use crate::metrics::MetricsCollector;
use crate::rate_limit::ApiRateLimiter;
use crate::{IngestionError, Result};
use annuaire_core::{retry_with_backoff, RegistryApiConfig, RetryPolicy};
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Search criteria accepted by the registry's `q` expression.
#[derive(Debug, Clone, Default)]
pub struct SearchQuery {
    pub registry_id: Option<String>,
    pub name: Option<String>,
    pub postal_code: Option<String>,
    pub department: Option<String>,
    pub activity_prefix: Option<String>,
    pub active_only: bool,
}

impl SearchQuery {
    pub fn department(code: &str) -> Self {
        Self {
            department: Some(code.to_string()),
            active_only: true,
            ..Default::default()
        }
    }

    pub fn by_registry_id(registry_id: &str) -> Self {
        Self {
            registry_id: Some(registry_id.to_string()),
            ..Default::default()
        }
    }

    pub fn name_and_postal(name: &str, postal_code: &str) -> Self {
        Self {
            name: Some(name.to_string()),
            postal_code: Some(postal_code.to_string()),
            active_only: true,
            ..Default::default()
        }
    }

    /// Reject expressions the registry would refuse, before spending a
    /// quota permit on them.
    pub fn validate(&self) -> Result<()> {
        let has_criterion = self.registry_id.is_some()
            || self.name.is_some()
            || self.postal_code.is_some()
            || self.department.is_some()
            || self.activity_prefix.is_some();
        if !has_criterion {
            return Err(IngestionError::QueryRejected(
                "at least one search criterion is required".into(),
            ));
        }

        if let Some(id) = &self.registry_id {
            if id.len() != 9 || !id.bytes().all(|b| b.is_ascii_digit()) {
                return Err(IngestionError::QueryRejected(format!(
                    "registry id must be 9 digits, got {id:?}"
                )));
            }
        }

        if let Some(postal) = &self.postal_code {
            if postal.len() != 5 || !postal.bytes().all(|b| b.is_ascii_digit()) {
                return Err(IngestionError::QueryRejected(format!(
                    "postal code must be 5 digits, got {postal:?}"
                )));
            }
        }

        if let Some(dept) = &self.department {
            let ok = matches!(dept.len(), 2 | 3)
                && dept.bytes().all(|b| b.is_ascii_alphanumeric());
            if !ok {
                return Err(IngestionError::QueryRejected(format!(
                    "department must be a 2-3 character code, got {dept:?}"
                )));
            }
        }

        if let Some(name) = &self.name {
            if sanitize_term(name).is_empty() {
                return Err(IngestionError::QueryRejected(
                    "name contains no searchable characters".into(),
                ));
            }
        }

        Ok(())
    }

    /// Build the `q` expression. Callers must have validated first.
    pub fn to_expression(&self) -> String {
        let mut clauses = Vec::new();
        if let Some(id) = &self.registry_id {
            clauses.push(format!("siren:{id}"));
        }
        if let Some(name) = &self.name {
            clauses.push(format!("denominationUniteLegale:\"{}\"", sanitize_term(name)));
        }
        if let Some(postal) = &self.postal_code {
            clauses.push(format!("codePostalEtablissement:{postal}"));
        }
        if let Some(dept) = &self.department {
            clauses.push(format!("departement:{dept}"));
        }
        if let Some(prefix) = &self.activity_prefix {
            clauses.push(format!("activitePrincipale:{prefix}"));
        }
        if self.active_only {
            clauses.push("etatAdministratifEtablissement:A".to_string());
        }
        clauses.join(" AND ")
    }
}

/// Strip characters that break the registry's query grammar.
fn sanitize_term(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '\'' || c == '-' {
                c
            } else {
                ' '
            }
        })
        .collect();
    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// One establishment as returned by the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryEstablishment {
    /// 9-digit legal-unit identifier.
    pub registry_id: String,
    /// 14-digit establishment identifier.
    pub establishment_id: String,
    pub legal_name: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    /// Storefront sign, when distinct from the legal name.
    pub trade_name: Option<String>,
    pub activity_code: Option<String>,
    pub street_number: Option<String>,
    pub street_type: Option<String>,
    pub street_name: Option<String>,
    pub address_complement: Option<String>,
    pub postal_code: Option<String>,
    pub city_name: Option<String>,
    pub active: bool,
}

impl RegistryEstablishment {
    /// Legal name, falling back to the natural person's name, then the
    /// storefront sign. `None` for fully anonymous records.
    pub fn display_name(&self) -> Option<String> {
        if let Some(name) = self.legal_name.as_deref().map(str::trim).filter(|n| !n.is_empty()) {
            return Some(name.to_string());
        }
        match (
            self.first_name.as_deref().map(str::trim).filter(|n| !n.is_empty()),
            self.last_name.as_deref().map(str::trim).filter(|n| !n.is_empty()),
        ) {
            (Some(first), Some(last)) => return Some(format!("{first} {last}")),
            (None, Some(last)) => return Some(last.to_string()),
            _ => {}
        }
        self.trade_name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string)
    }
}

/// One page of search results with the continuation token.
#[derive(Debug, Clone)]
pub struct RegistryPage {
    pub establishments: Vec<RegistryEstablishment>,
    pub total: u64,
    pub next_cursor: Option<String>,
}

// Wire shapes, named after the registry's JSON fields.

#[derive(Debug, Deserialize)]
struct WirePage {
    header: WireHeader,
    #[serde(default)]
    etablissements: Vec<WireEstablishment>,
}

#[derive(Debug, Deserialize)]
struct WireHeader {
    total: u64,
    curseur: Option<String>,
    #[serde(rename = "curseurSuivant")]
    curseur_suivant: Option<String>,
}

impl WireHeader {
    /// The registry signals the last page by echoing the same cursor back.
    fn next_cursor(&self) -> Option<String> {
        match (&self.curseur, &self.curseur_suivant) {
            (Some(current), Some(next)) if current == next => None,
            (_, next) => next.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireEstablishment {
    siren: String,
    siret: String,
    #[serde(rename = "etatAdministratifEtablissement")]
    etat: Option<String>,
    #[serde(rename = "enseigne1Etablissement")]
    enseigne: Option<String>,
    #[serde(rename = "activitePrincipaleEtablissement")]
    activite: Option<String>,
    #[serde(rename = "uniteLegale")]
    unite_legale: Option<WireLegalUnit>,
    #[serde(rename = "adresseEtablissement")]
    adresse: Option<WireAddress>,
}

#[derive(Debug, Deserialize)]
struct WireLegalUnit {
    #[serde(rename = "denominationUniteLegale")]
    denomination: Option<String>,
    #[serde(rename = "prenom1UniteLegale")]
    prenom: Option<String>,
    #[serde(rename = "nomUniteLegale")]
    nom: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireAddress {
    #[serde(rename = "numeroVoieEtablissement")]
    numero: Option<String>,
    #[serde(rename = "typeVoieEtablissement")]
    type_voie: Option<String>,
    #[serde(rename = "libelleVoieEtablissement")]
    libelle_voie: Option<String>,
    #[serde(rename = "complementAdresseEtablissement")]
    complement: Option<String>,
    #[serde(rename = "codePostalEtablissement")]
    code_postal: Option<String>,
    #[serde(rename = "libelleCommuneEtablissement")]
    commune: Option<String>,
}

impl From<WireEstablishment> for RegistryEstablishment {
    fn from(wire: WireEstablishment) -> Self {
        let unite = wire.unite_legale;
        let adresse = wire.adresse;
        Self {
            registry_id: wire.siren,
            establishment_id: wire.siret,
            legal_name: unite.as_ref().and_then(|u| u.denomination.clone()),
            first_name: unite.as_ref().and_then(|u| u.prenom.clone()),
            last_name: unite.as_ref().and_then(|u| u.nom.clone()),
            trade_name: wire.enseigne,
            activity_code: wire.activite,
            street_number: adresse.as_ref().and_then(|a| a.numero.clone()),
            street_type: adresse.as_ref().and_then(|a| a.type_voie.clone()),
            street_name: adresse.as_ref().and_then(|a| a.libelle_voie.clone()),
            address_complement: adresse.as_ref().and_then(|a| a.complement.clone()),
            postal_code: adresse.as_ref().and_then(|a| a.code_postal.clone()),
            city_name: adresse.as_ref().and_then(|a| a.commune.clone()),
            active: wire.etat.as_deref().map_or(true, |s| s == "A"),
        }
    }
}

/// A fuzzy-match hit from [`RegistryClient::match_company`].
#[derive(Debug, Clone)]
pub struct CompanyMatch {
    pub registry_id: String,
    pub establishment_id: String,
    pub name: String,
    pub score: f64,
}

pub struct RegistryClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    limiter: ApiRateLimiter,
    retry: RetryPolicy,
    cooldown: Duration,
    cache: Cache<String, RegistryPage>,
    metrics: Option<Arc<MetricsCollector>>,
}

impl RegistryClient {
    pub fn new(config: &RegistryApiConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            limiter: ApiRateLimiter::new(config.quota, config.quota_window)?,
            retry: RetryPolicy::registry_api(),
            cooldown: config.cooldown,
            cache: Cache::builder()
                .max_capacity(1_000)
                .time_to_live(Duration::from_secs(600))
                .build(),
            metrics: None,
        })
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    async fn record_metric(&self, name: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.record(name).await;
        }
    }

    fn page_url(&self, query: &SearchQuery, cursor: Option<&str>, page_size: u32) -> String {
        let mut url = format!(
            "{}/etablissements?q={}&nombre={}",
            self.base_url,
            urlencoding::encode(&query.to_expression()),
            page_size
        );
        if let Some(cursor) = cursor {
            url.push_str("&curseur=");
            url.push_str(&urlencoding::encode(cursor));
        }
        url
    }

    /// Fetch one result page, honoring quota, cooldowns and retries.
    pub async fn fetch_page(
        &self,
        query: &SearchQuery,
        cursor: Option<&str>,
        page_size: u32,
    ) -> Result<RegistryPage> {
        query.validate()?;
        let url = self.page_url(query, cursor, page_size);

        if let Some(page) = self.cache.get(&url).await {
            self.record_metric("registry_cache_hit").await;
            return Ok(page);
        }

        loop {
            let response = retry_with_backoff(
                || self.send_once(&url),
                self.retry.clone(),
                IngestionError::is_retryable,
            )
            .await?;

            let status = response.status();
            if status.as_u16() == 429 {
                let wait = retry_after(&response).unwrap_or(self.cooldown);
                warn!(wait_secs = wait.as_secs(), "registry quota exceeded, cooling down");
                self.record_metric("registry_quota_wait").await;
                tokio::time::sleep(wait).await;
                continue;
            }
            if !status.is_success() {
                return Err(IngestionError::RegistryStatus {
                    status: status.as_u16(),
                    url: url.clone(),
                });
            }

            let wire: WirePage = response.json().await?;
            let page = RegistryPage {
                next_cursor: wire.header.next_cursor(),
                total: wire.header.total,
                establishments: wire
                    .etablissements
                    .into_iter()
                    .map(RegistryEstablishment::from)
                    .collect(),
            };

            debug!(
                records = page.establishments.len(),
                total = page.total,
                has_next = page.next_cursor.is_some(),
                "registry page fetched"
            );
            self.record_metric("registry_page").await;
            self.cache.insert(url, page.clone()).await;
            return Ok(page);
        }
    }

    /// One HTTP attempt behind the limiter: every send consumes a quota
    /// permit, retries and 429 resends included. 5xx becomes a retryable
    /// error; everything else, 429 included, is handed back for the
    /// caller to interpret.
    async fn send_once(&self, url: &str) -> Result<reqwest::Response> {
        self.limiter.acquire().await;
        self.record_metric("registry_request").await;

        let mut request = self.http.get(url);
        if let Some(key) = &self.api_key {
            request = request.header("X-API-KEY", key);
        }
        let response = request.send().await?;

        if response.status().is_server_error() {
            return Err(IngestionError::RegistryStatus {
                status: response.status().as_u16(),
                url: url.to_string(),
            });
        }
        Ok(response)
    }

    /// Look up one legal unit by its 9-digit identifier. Returns the
    /// first establishment on record, or `None` for unknown ids.
    pub async fn get_by_registry_id(
        &self,
        registry_id: &str,
    ) -> Result<Option<RegistryEstablishment>> {
        let query = SearchQuery::by_registry_id(registry_id);
        let page = self.fetch_page(&query, None, 1).await?;
        Ok(page.establishments.into_iter().next())
    }

    /// Find the registry record for a company known only by name and
    /// postal code. Returns the best candidate at or above `min_score`.
    pub async fn match_company(
        &self,
        name: &str,
        postal_code: &str,
        min_score: f64,
    ) -> Result<Option<CompanyMatch>> {
        let query = SearchQuery::name_and_postal(name, postal_code);
        let page = self.fetch_page(&query, None, 20).await?;
        Ok(best_match(name, postal_code, &page.establishments, min_score))
    }
}

fn retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

const LEGAL_FORMS: &[&str] = &[
    "sarl", "sas", "sasu", "eurl", "sa", "sci", "scm", "scp", "selarl", "snc", "ei", "eirl",
];

/// Lowercase, drop legal-form tokens, collapse whitespace.
fn comparable_name(raw: &str) -> String {
    raw.to_lowercase()
        .split_whitespace()
        .filter(|token| !LEGAL_FORMS.contains(token))
        .collect::<Vec<_>>()
        .join(" ")
}

fn score_candidate(query_name: &str, postal_code: &str, candidate: &RegistryEstablishment) -> f64 {
    let query = comparable_name(query_name);

    let name_score = [candidate.display_name(), candidate.trade_name.clone()]
        .into_iter()
        .flatten()
        .map(|n| strsim::normalized_levenshtein(&query, &comparable_name(&n)))
        .fold(0.0_f64, f64::max);

    let postal_bonus = if candidate.postal_code.as_deref() == Some(postal_code) {
        0.05
    } else {
        0.0
    };

    (name_score + postal_bonus).min(1.0)
}

fn best_match(
    query_name: &str,
    postal_code: &str,
    candidates: &[RegistryEstablishment],
    min_score: f64,
) -> Option<CompanyMatch> {
    candidates
        .iter()
        .map(|candidate| {
            (candidate, score_candidate(query_name, postal_code, candidate))
        })
        .filter(|(_, score)| *score >= min_score)
        .max_by(|(_, a), (_, b)| a.total_cmp(b))
        .map(|(candidate, score)| CompanyMatch {
            registry_id: candidate.registry_id.clone(),
            establishment_id: candidate.establishment_id.clone(),
            name: candidate.display_name().unwrap_or_default(),
            score,
        })
}
