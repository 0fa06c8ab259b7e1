//! Record resolution: raw source rows to write-ready company records
//!
//! Resolution is pure. It reads the pre-loaded [`ReferenceCache`] and
//! never performs I/O, so worker tasks can run it concurrently and tests
//! can drive it without a database. The output says exactly what the
//! batch coordinator should do: create, fill-in-update, or replace a
//! provisional key, plus at most one listing to attach.

use crate::record::{FailureReason, FileRecord, RawRecord};
use crate::reference::ReferenceCache;
use crate::registry::RegistryEstablishment;
use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use uuid::Uuid;

/// Name used when a registry record carries no name in any field.
const UNNAMED: &str = "Unnamed business";

/// A company row ready for the repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompanyRecord {
    pub registry_id: String,
    /// True when `registry_id` was minted locally, not issued by the
    /// registry. Provisional ids live in the reserved `9xxxxxxxx` space.
    pub is_provisional: bool,
    pub establishment_id: Option<String>,
    pub name: String,
    pub trade_name: Option<String>,
    pub address: Option<String>,
    pub postal_code: Option<String>,
    pub city_name: Option<String>,
    pub activity_code: Option<String>,
    pub activity_label: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub website: Option<String>,
}

/// What the coordinator should do with a resolved company.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompanyOp {
    Create,
    /// The id is already imported: fill empty fields only, unless the run
    /// asked for overwrite.
    Update,
    /// A real-keyed record matched a company imported under a provisional
    /// id; swap the key in place.
    ReplaceProvisional { provisional_id: String },
}

/// Category side of a listing, resolved or deferred to the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CategorySelection {
    Resolved(Uuid),
    /// Unmapped code under the fallback policy; the coordinator mints the
    /// category at commit time.
    NeedsFallback(String),
}

/// A (company, city, category) association to upsert.
#[derive(Debug, Clone)]
pub struct ListingCandidate {
    pub registry_id: String,
    pub city_id: Uuid,
    pub category: CategorySelection,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ResolutionFlags {
    pub place_not_found: bool,
    pub category_not_found: bool,
    pub category_fallback: bool,
    pub provisional_id_minted: bool,
}

#[derive(Debug, Clone)]
pub struct ResolvedRecord {
    pub company: CompanyRecord,
    pub op: CompanyOp,
    pub listing: Option<ListingCandidate>,
    pub flags: ResolutionFlags,
}

#[derive(Debug)]
pub enum Resolution {
    Resolved(Box<ResolvedRecord>),
    Skipped {
        reason: FailureReason,
        detail: String,
    },
}

/// What to do with an activity code absent from the category table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnmappedCategoryPolicy {
    /// Import the company but attach no listing.
    Drop,
    /// Mint a fallback category named after the raw code.
    Fallback,
}

impl std::str::FromStr for UnmappedCategoryPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "drop" => Ok(Self::Drop),
            "fallback" => Ok(Self::Fallback),
            other => Err(format!("expected 'drop' or 'fallback', got {other:?}")),
        }
    }
}

/// Deterministic provisional registry id for a company known only by name
/// and postal code. Stays in the reserved `9xxxxxxxx` space so it can
/// never collide with an issued id.
pub fn provisional_registry_id(name: &str, postal_code: &str) -> String {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    crate::reference::normalize_key(name).hash(&mut hasher);
    postal_code.trim().hash(&mut hasher);
    format!("9{:08}", hasher.finish() % 100_000_000)
}

fn clean(raw: &str) -> Option<String> {
    let cleaned: String = raw.chars().filter(|c| !c.is_control()).collect();
    let trimmed = cleaned.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn looks_like_registry_id(value: &str) -> bool {
    value.len() == 9 && value.bytes().all(|b| b.is_ascii_digit())
}

pub struct Resolver {
    cache: Arc<ReferenceCache>,
    policy: UnmappedCategoryPolicy,
}

impl Resolver {
    pub fn new(cache: Arc<ReferenceCache>, policy: UnmappedCategoryPolicy) -> Self {
        Self { cache, policy }
    }

    pub fn resolve(&self, raw: &RawRecord) -> Resolution {
        match raw {
            RawRecord::Malformed { line, error } => Resolution::Skipped {
                reason: FailureReason::MalformedLine,
                detail: format!("line {line}: {error}"),
            },
            RawRecord::File(record) => self.resolve_file(record),
            RawRecord::Registry(est) => self.resolve_registry(est),
        }
    }

    fn resolve_file(&self, record: &FileRecord) -> Resolution {
        let Some(name) = record.get("name").and_then(clean) else {
            return Resolution::Skipped {
                reason: FailureReason::MissingName,
                detail: format!("line {}: no usable name", record.line),
            };
        };

        let postal_code = record.get("postal_code").and_then(clean);
        let mut flags = ResolutionFlags::default();

        let (registry_id, is_provisional) = match record.get("registry_id") {
            Some(id) if looks_like_registry_id(id) => (id.to_string(), false),
            _ => {
                flags.provisional_id_minted = true;
                (
                    provisional_registry_id(&name, postal_code.as_deref().unwrap_or("")),
                    true,
                )
            }
        };

        let company = CompanyRecord {
            registry_id,
            is_provisional,
            establishment_id: record.get("establishment_id").and_then(clean),
            name,
            trade_name: record.get("trade_name").and_then(clean),
            address: record.get("address").and_then(clean),
            postal_code,
            city_name: record.get("city").and_then(clean),
            activity_code: record.get("activity_code").and_then(clean),
            activity_label: record.get("activity_label").and_then(clean),
            phone: record.get("phone").and_then(clean),
            email: record.get("email").and_then(clean),
            website: record.get("website").and_then(clean),
        };

        self.finish(company, flags)
    }

    fn resolve_registry(&self, est: &RegistryEstablishment) -> Resolution {
        if est.registry_id.trim().is_empty() || est.establishment_id.trim().is_empty() {
            return Resolution::Skipped {
                reason: FailureReason::MissingNaturalKey,
                detail: "registry payload without identifier pair".into(),
            };
        }

        let name = est.display_name().unwrap_or_else(|| UNNAMED.to_string());

        let company = CompanyRecord {
            registry_id: est.registry_id.trim().to_string(),
            is_provisional: false,
            establishment_id: clean(&est.establishment_id),
            name,
            trade_name: est.trade_name.as_deref().and_then(clean),
            address: assemble_address(est),
            postal_code: est.postal_code.as_deref().and_then(clean),
            city_name: est.city_name.as_deref().and_then(clean),
            activity_code: est.activity_code.as_deref().and_then(clean),
            activity_label: None,
            phone: None,
            email: None,
            website: None,
        };

        self.finish(company, ResolutionFlags::default())
    }

    fn finish(&self, mut company: CompanyRecord, mut flags: ResolutionFlags) -> Resolution {
        let op = if self.cache.is_imported(&company.registry_id) {
            CompanyOp::Update
        } else if !company.is_provisional {
            match company
                .postal_code
                .as_deref()
                .and_then(|postal| self.cache.find_provisional(&company.name, postal))
            {
                Some(provisional_id) => CompanyOp::ReplaceProvisional {
                    provisional_id: provisional_id.to_string(),
                },
                None => CompanyOp::Create,
            }
        } else {
            CompanyOp::Create
        };

        let city = match (company.city_name.as_deref(), company.postal_code.as_deref()) {
            (Some(city_name), Some(postal)) => self.cache.find_city(city_name, postal),
            _ => None,
        };
        if city.is_none() {
            flags.place_not_found = true;
        }

        let category = match company.activity_code.as_deref() {
            Some(code) => match self.cache.find_category(code) {
                Some(cat) => {
                    if company.activity_label.is_none() {
                        company.activity_label = Some(cat.label.clone());
                    }
                    Some(CategorySelection::Resolved(cat.id))
                }
                None => match self.policy {
                    UnmappedCategoryPolicy::Drop => {
                        flags.category_not_found = true;
                        None
                    }
                    UnmappedCategoryPolicy::Fallback => {
                        flags.category_fallback = true;
                        Some(CategorySelection::NeedsFallback(code.to_string()))
                    }
                },
            },
            None => {
                flags.category_not_found = true;
                None
            }
        };

        let listing = match (city, category) {
            (Some(city), Some(category)) => Some(ListingCandidate {
                registry_id: company.registry_id.clone(),
                city_id: city.id,
                category,
            }),
            _ => None,
        };

        Resolution::Resolved(Box::new(ResolvedRecord {
            company,
            op,
            listing,
            flags,
        }))
    }
}

/// Compose a display address from the registry's structured parts.
fn assemble_address(est: &RegistryEstablishment) -> Option<String> {
    let mut parts: Vec<&str> = Vec::new();
    for piece in [&est.street_number, &est.street_type, &est.street_name] {
        if let Some(p) = piece.as_deref().map(str::trim).filter(|p| !p.is_empty()) {
            parts.push(p);
        }
    }
    let mut address = parts.join(" ");
    if let Some(complement) = est
        .address_complement
        .as_deref()
        .map(str::trim)
        .filter(|c| !c.is_empty())
    {
        if address.is_empty() {
            address = complement.to_string();
        } else {
            address.push_str(", ");
            address.push_str(complement);
        }
    }
    if address.is_empty() {
        None
    } else {
        Some(address)
    }
}
