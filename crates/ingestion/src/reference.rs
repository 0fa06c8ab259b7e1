//! Reference data loaded once per run
//!
//! Cities, activity categories, the set of already-imported registry ids
//! and the provisional-company index are read up front so record
//! resolution never touches the database. Categories live in a `DashMap`
//! because the fallback policy can mint new ones mid-run; the other maps
//! are frozen for the duration.

use dashmap::{DashMap, DashSet};
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct CityRef {
    pub id: Uuid,
    pub name: String,
    pub postal_code: String,
    pub department: String,
    pub population: Option<i32>,
}

#[derive(Debug, Clone)]
pub struct CategoryRef {
    pub id: Uuid,
    /// Activity nomenclature code, e.g. `10.71C`.
    pub activity_code: String,
    pub label: String,
    /// Top-level grouping in the nomenclature, e.g. `Commerce`.
    pub parent_group: Option<String>,
    /// Set when this category was minted by the fallback policy.
    pub fallback: bool,
}

/// A company imported under a provisional registry id, indexed so a later
/// real-keyed record can replace the placeholder.
#[derive(Debug, Clone)]
pub struct ProvisionalCompany {
    pub registry_id: String,
    pub name: String,
    pub postal_code: Option<String>,
}

/// Case/whitespace-insensitive key for name lookups.
pub fn normalize_key(raw: &str) -> String {
    raw.to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Left-pad short numeric postal codes to five digits. Departments 01-09
/// routinely lose their leading zero in exports.
pub fn pad_postal(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.len() < 5 && !trimmed.is_empty() && trimmed.bytes().all(|b| b.is_ascii_digit()) {
        format!("{trimmed:0>5}")
    } else {
        trimmed.to_string()
    }
}

pub struct ReferenceCache {
    cities: HashMap<(String, String), CityRef>,
    categories: DashMap<String, CategoryRef>,
    imported: DashSet<String>,
    provisional: HashMap<(String, String), String>,
}

impl ReferenceCache {
    pub fn new(
        cities: Vec<CityRef>,
        categories: Vec<CategoryRef>,
        imported: Vec<String>,
        provisional: Vec<ProvisionalCompany>,
    ) -> Self {
        let cities = cities
            .into_iter()
            .map(|c| ((normalize_key(&c.name), c.postal_code.clone()), c))
            .collect();

        let categories: DashMap<String, CategoryRef> = categories
            .into_iter()
            .map(|c| (c.activity_code.clone(), c))
            .collect();

        let imported: DashSet<String> = imported.into_iter().collect();

        let provisional = provisional
            .into_iter()
            .filter_map(|p| {
                let postal = p.postal_code.clone()?;
                Some(((normalize_key(&p.name), postal), p.registry_id))
            })
            .collect();

        Self {
            cities,
            categories,
            imported,
            provisional,
        }
    }

    /// Exact lookup first, then with the postal code padded to five
    /// digits.
    pub fn find_city(&self, name: &str, postal_code: &str) -> Option<&CityRef> {
        let key_name = normalize_key(name);
        self.cities
            .get(&(key_name.clone(), postal_code.trim().to_string()))
            .or_else(|| self.cities.get(&(key_name, pad_postal(postal_code))))
    }

    pub fn find_category(&self, activity_code: &str) -> Option<CategoryRef> {
        self.categories
            .get(activity_code.trim())
            .map(|entry| entry.value().clone())
    }

    /// Register a category minted mid-run by the fallback policy.
    pub fn insert_category(&self, category: CategoryRef) {
        self.categories
            .insert(category.activity_code.clone(), category);
    }

    pub fn is_imported(&self, registry_id: &str) -> bool {
        self.imported.contains(registry_id)
    }

    /// Mark a company as present. Called by the batch coordinator only,
    /// after the write committed.
    pub fn mark_imported(&self, registry_id: &str) {
        self.imported.insert(registry_id.to_string());
    }

    pub fn imported_count(&self) -> usize {
        self.imported.len()
    }

    /// Provisional registry id previously minted for this name and postal
    /// code, if any.
    pub fn find_provisional(&self, name: &str, postal_code: &str) -> Option<&str> {
        self.provisional
            .get(&(normalize_key(name), postal_code.trim().to_string()))
            .map(String::as_str)
    }

    pub fn city_count(&self) -> usize {
        self.cities.len()
    }

    pub fn category_count(&self) -> usize {
        self.categories.len()
    }
}
