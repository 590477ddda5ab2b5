pub mod normalize;

pub use normalize::{normalize, NormalizeError, ProductRecord};

use anyhow::Result;
use scraper::{Html, Selector};
use serde_json::Value;
use thiserror::Error;

/// Extraction failure taxonomy. Both variants are per-record terminal: the
/// record is dropped and logged, never retried.
#[derive(Debug, Error)]
pub enum ExtractError {
    /// No structured-data block is present in the page
    #[error("No structured-data block found in page")]
    MissingBlock,

    /// The block exists but is not valid JSON or lacks a required field
    #[error("Malformed structured-data block: {0}")]
    Malformed(String),
}

/// Raw product fields projected straight out of the JSON-LD block, before
/// any normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct RawProduct {
    pub url: String,
    pub name: String,
    pub description: String,
    pub sku: String,
    /// One URI or a list of URIs, kept as raw JSON
    pub image: Value,
    pub price_currency: String,
    /// String form; the normalizer parses it
    pub price: String,
    /// Raw slash-delimited taxonomy path
    pub availability: String,
}

/// Parses a detail page's embedded JSON-LD block into a raw record
pub struct ProductExtractor {
    /// Compiled structured-data selector
    selector: Selector,
}

impl ProductExtractor {
    /// Create an extractor for the given structured-data selector
    pub fn new(structured_data_selector: &str) -> Result<Self> {
        let selector = Selector::parse(structured_data_selector).map_err(|e| {
            anyhow::anyhow!(
                "Invalid structured-data selector '{}': {}",
                structured_data_selector,
                e
            )
        })?;

        Ok(Self { selector })
    }

    /// Locate and parse the product block of a rendered detail page
    pub fn extract(&self, url: &str, html: &str) -> Result<RawProduct, ExtractError> {
        let document = Html::parse_document(html);

        let block = document
            .select(&self.selector)
            .next()
            .ok_or(ExtractError::MissingBlock)?;

        let text: String = block.text().collect();
        let product: Value = serde_json::from_str(text.trim())
            .map_err(|e| ExtractError::Malformed(format!("invalid JSON: {}", e)))?;

        let offers = product
            .get("offers")
            .ok_or_else(|| ExtractError::Malformed("missing field 'offers'".to_string()))?;

        Ok(RawProduct {
            url: url.to_string(),
            name: required_string(&product, "name", "name")?,
            description: optional_string(&product, "description"),
            sku: required_string(&product, "sku", "sku")?,
            image: product.get("image").cloned().unwrap_or(Value::Null),
            price_currency: required_string(offers, "priceCurrency", "offers.priceCurrency")?,
            price: required_string(offers, "price", "offers.price")?,
            availability: required_string(offers, "availability", "offers.availability")?,
        })
    }
}

/// Read a mandatory field as its string form. JSON-LD price values appear
/// both as strings and as bare numbers in the wild, so both are accepted.
fn required_string(value: &Value, key: &str, label: &str) -> Result<String, ExtractError> {
    match value.get(key) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        Some(_) => Err(ExtractError::Malformed(format!(
            "field '{}' has an unsupported type",
            label
        ))),
        None => Err(ExtractError::Malformed(format!("missing field '{}'", label))),
    }
}

/// Optional string field, defaulting to empty
fn optional_string(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}
