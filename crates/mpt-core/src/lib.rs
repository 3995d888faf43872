//! Core domain model for the menu price tracker: product identity, price
//! parsing and the unwanted-item filter shared by every other crate.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use unicode_normalization::UnicodeNormalization;

pub const CRATE_NAME: &str = "mpt-core";

/// Descriptions are stored truncated to this many characters.
pub const DESCRIPTION_MAX_CHARS: usize = 120;

/// Name prefixes (lowercase) of rows that are contact info, not products.
pub const NON_PRODUCT_PREFIXES: &[&str] = &["tel novo"];

static PRICE_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+(?:[.,]\d{2})?").expect("price token regex is valid"));

static PHONE_NUMBER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\(\d{2}\)\s*\d{4,5}-\d{4}").expect("phone number regex is valid")
});

/// Raw prices as displayed on the page, kept for diagnostics only.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct DisplayedPrices {
    /// Struck-through "was" price.
    pub previous: f64,
    pub base: f64,
    /// Highlighted promotional price.
    pub current: f64,
}

/// One candidate record produced by the page extractor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapedItem {
    pub name: String,
    pub price: f64,
    pub description: String,
    pub extracted_prev_price: f64,
    pub extracted_base_price: f64,
    pub extracted_current_price: f64,
}

impl ScrapedItem {
    pub fn displayed(&self) -> DisplayedPrices {
        DisplayedPrices {
            previous: self.extracted_prev_price,
            base: self.extracted_base_price,
            current: self.extracted_current_price,
        }
    }
}

/// Persisted product document, keyed by its normalized slug.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: String,
    pub name: String,
    pub description: String,
    pub current_price: f64,
    pub last_price: f64,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub price_changed_at: Option<DateTime<Utc>>,
    pub change_count: i64,
    pub snapshot: DisplayedPrices,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidRecord {
    #[error("product id is empty")]
    EmptyId,
    #[error("{field} of {id} is not a finite non-negative price")]
    BadPrice { id: String, field: &'static str },
    #[error("change_count of {id} is negative")]
    NegativeChangeCount { id: String },
}

fn check_price(id: &str, field: &'static str, value: f64) -> Result<(), InvalidRecord> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(InvalidRecord::BadPrice {
            id: id.to_string(),
            field,
        })
    }
}

impl Product {
    /// Rejects documents that could not have been produced by reconciliation.
    pub fn validate(&self) -> Result<(), InvalidRecord> {
        if self.id.is_empty() {
            return Err(InvalidRecord::EmptyId);
        }
        check_price(&self.id, "current_price", self.current_price)?;
        check_price(&self.id, "last_price", self.last_price)?;
        if self.change_count < 0 {
            return Err(InvalidRecord::NegativeChangeCount {
                id: self.id.clone(),
            });
        }
        Ok(())
    }

    /// Signed difference between the current and the previous price.
    pub fn delta(&self) -> f64 {
        round_cents(self.current_price - self.last_price)
    }
}

/// Append-only history entry stored under a product.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceHistoryEntry {
    pub price: f64,
    pub at: DateTime<Utc>,
}

impl PriceHistoryEntry {
    pub fn validate(&self, product_id: &str) -> Result<(), InvalidRecord> {
        check_price(product_id, "price", self.price)
    }
}

/// The fields reconciliation needs to know about an existing product.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductProjection {
    pub name: String,
    pub current_price: f64,
    pub last_price: f64,
}

impl ProductProjection {
    pub fn validate(&self, id: &str) -> Result<(), InvalidRecord> {
        if id.is_empty() {
            return Err(InvalidRecord::EmptyId);
        }
        check_price(id, "current_price", self.current_price)?;
        check_price(id, "last_price", self.last_price)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CharClass {
    Digit,
    Alpha,
}

/// Maps a display name to the slug used as its document key.
///
/// Diacritics are stripped, letters lowercased, digit/letter runs split and
/// every run of other characters collapsed into one `-`. `"Açaí 300ml"` and
/// `"ACAI 300 ML"` both become `acai-300-ml`.
pub fn normalize_product_id(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut prev: Option<CharClass> = None;
    let mut pending_separator = false;

    for ch in raw.nfkd().filter(char::is_ascii) {
        let class = if ch.is_ascii_digit() {
            CharClass::Digit
        } else if ch.is_ascii_alphabetic() {
            CharClass::Alpha
        } else {
            pending_separator = true;
            continue;
        };
        if let Some(prev) = prev {
            if pending_separator || prev != class {
                out.push('-');
            }
        }
        pending_separator = false;
        out.push(ch.to_ascii_lowercase());
        prev = Some(class);
    }
    out
}

/// First decimal-looking token in `text`, or `0.0` when there is none.
pub fn parse_price(text: &str) -> f64 {
    PRICE_TOKEN
        .find(text)
        .and_then(|m| m.as_str().replace(',', ".").parse::<f64>().ok())
        .unwrap_or(0.0)
}

/// True for rows that must never be stored as products.
pub fn is_unwanted(name: &str, price: f64) -> bool {
    let lowered = name.trim().to_lowercase();
    if NON_PRODUCT_PREFIXES
        .iter()
        .any(|prefix| lowered.starts_with(prefix))
    {
        return true;
    }
    if PHONE_NUMBER.is_match(name) {
        return true;
    }
    price.is_nan() || price <= 0.0
}

pub fn truncate_description(text: &str) -> String {
    text.trim().chars().take(DESCRIPTION_MAX_CHARS).collect()
}

pub fn round_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn accents_case_and_spacing_share_an_id() {
        assert_eq!(normalize_product_id("Açaí 300ml"), "acai-300-ml");
        assert_eq!(
            normalize_product_id("Açaí 300ml"),
            normalize_product_id("ACAI 300 ML")
        );
        assert_eq!(
            normalize_product_id("Açaí -- 300ml!"),
            normalize_product_id("acai_300_ml")
        );
    }

    #[test]
    fn distinct_names_do_not_collide() {
        assert_ne!(normalize_product_id("Açaí"), normalize_product_id("Abacaxi"));
        assert_ne!(
            normalize_product_id("Açaí 300ml"),
            normalize_product_id("Açaí 500ml")
        );
    }

    #[test]
    fn normalization_is_idempotent() {
        for name in [
            "Açaí 300ml",
            "  --Combo Família (2 pessoas)-- ",
            "Pão de Queijo c/ Requeijão",
            "X-Burger 2.0",
            "",
        ] {
            let once = normalize_product_id(name);
            assert_eq!(normalize_product_id(&once), once, "input {name:?}");
        }
    }

    #[test]
    fn empty_and_symbol_only_names_normalize_to_empty() {
        assert_eq!(normalize_product_id(""), "");
        assert_eq!(normalize_product_id(" -*- "), "");
        assert_eq!(normalize_product_id("日本"), "");
    }

    #[test]
    fn parses_prices_out_of_noise() {
        assert_eq!(parse_price("R$ 12,50 (promo)"), 12.50);
        assert_eq!(parse_price("a partir de R$ 9.90"), 9.90);
        assert_eq!(parse_price("R$ 15"), 15.0);
        assert_eq!(parse_price(""), 0.0);
        assert_eq!(parse_price("sem preço"), 0.0);
    }

    #[test]
    fn filter_rejects_non_products() {
        assert!(is_unwanted("Açaí 300ml", 0.0));
        assert!(is_unwanted("Açaí 300ml", -1.0));
        assert!(is_unwanted("Açaí 300ml", f64::NAN));
        assert!(is_unwanted("Pedidos (11) 98765-4321", 12.0));
        assert!(is_unwanted("Tel novo: chame no zap", 12.0));
        assert!(!is_unwanted("Açaí 300ml", 12.5));
    }

    #[test]
    fn description_is_truncated_by_characters() {
        let long = "é".repeat(200);
        assert_eq!(truncate_description(&long).chars().count(), DESCRIPTION_MAX_CHARS);
        assert_eq!(truncate_description("  curto "), "curto");
    }

    #[test]
    fn product_validation_rejects_corrupt_documents() {
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().unwrap();
        let mut product = Product {
            id: "acai-300-ml".into(),
            name: "Açaí 300ml".into(),
            description: String::new(),
            current_price: 12.5,
            last_price: 11.0,
            created_at: at,
            last_seen_at: at,
            price_changed_at: Some(at),
            change_count: 1,
            snapshot: DisplayedPrices::default(),
        };
        assert!(product.validate().is_ok());
        assert_eq!(product.delta(), 1.5);

        product.current_price = f64::INFINITY;
        assert!(matches!(
            product.validate(),
            Err(InvalidRecord::BadPrice { field: "current_price", .. })
        ));

        product.current_price = 12.5;
        product.change_count = -1;
        assert!(product.validate().is_err());

        product.change_count = 0;
        product.id.clear();
        assert_eq!(product.validate(), Err(InvalidRecord::EmptyId));
    }

    #[test]
    fn scraped_item_roundtrips_through_json() {
        let item = ScrapedItem {
            name: "Açaí 300ml".into(),
            price: 12.5,
            description: "Cremoso".into(),
            extracted_prev_price: 15.0,
            extracted_base_price: 0.0,
            extracted_current_price: 12.5,
        };
        let json = serde_json::to_string(&item).unwrap();
        let back: ScrapedItem = serde_json::from_str(&json).unwrap();
        assert_eq!(back, item);
        assert_eq!(back.displayed().previous, 15.0);
    }

    #[test]
    fn projections_and_history_share_the_price_check() {
        let projection = ProductProjection {
            name: "Açaí".into(),
            current_price: f64::NAN,
            last_price: 10.0,
        };
        assert_eq!(
            projection.validate("acai"),
            Err(InvalidRecord::BadPrice {
                id: "acai".into(),
                field: "current_price",
            })
        );
        let ok = ProductProjection {
            current_price: 12.0,
            ..projection
        };
        assert!(ok.validate("acai").is_ok());
        assert_eq!(ok.validate(""), Err(InvalidRecord::EmptyId));

        let at = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        assert!(PriceHistoryEntry { price: 9.5, at }.validate("acai").is_ok());
        assert!(PriceHistoryEntry { price: -1.0, at }.validate("acai").is_err());
        assert!(PriceHistoryEntry { price: f64::INFINITY, at }
            .validate("acai")
            .is_err());
    }
}
