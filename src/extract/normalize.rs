use serde::{Serialize, Deserialize};
use serde_json::Value;
use thiserror::Error;

use crate::extract::RawProduct;

/// Normalization failure taxonomy. Deterministic given the raw input, so
/// failures are reported per record and never retried.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum NormalizeError {
    /// The availability path has fewer than 4 segments
    #[error("Availability path '{0}' has fewer than 4 segments")]
    BadAvailability(String),

    /// The price does not parse as a non-negative number
    #[error("Price '{0}' is not a non-negative number")]
    BadPrice(String),
}

/// The canonical output record. `url` is the detail-page URL and unique
/// within one crawl run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductRecord {
    pub url: String,
    pub name: String,
    /// Single line, markup tokens stripped
    pub description: String,
    pub sku: String,
    /// Serialized list when the raw value held several URIs
    pub image: String,
    /// ISO 4217 code
    pub price_currency: String,
    /// Non-negative
    pub price: f64,
    /// Terminal taxonomy segment, e.g. "InStock"
    pub availability: String,
}

/// Clean and type-convert a raw product into the canonical record shape
pub fn normalize(raw: RawProduct) -> Result<ProductRecord, NormalizeError> {
    let availability = normalize_availability(&raw.availability)?;
    let price = parse_price(&raw.price)?;

    Ok(ProductRecord {
        url: raw.url,
        name: raw.name,
        description: strip_markup(&raw.description),
        sku: raw.sku,
        image: serialize_image(&raw.image),
        price_currency: raw.price_currency,
        price,
        availability,
    })
}

/// Take the 4th slash-delimited segment of the availability taxonomy path.
/// Empty segments (from the `//` after the scheme) do not count, so a bare
/// `http://schema.org/InStock` is rejected rather than silently accepted.
fn normalize_availability(raw: &str) -> Result<String, NormalizeError> {
    let segments: Vec<&str> = raw.split('/').filter(|s| !s.is_empty()).collect();

    segments
        .get(3)
        .map(|s| s.to_string())
        .ok_or_else(|| NormalizeError::BadAvailability(raw.to_string()))
}

/// Replace the literal markup tokens the catalog embeds in descriptions.
/// Exact substrings only; no other HTML sanitization is performed.
fn strip_markup(description: &str) -> String {
    description
        .replace("<br>", " ")
        .replace("<p>", " ")
        .replace("</p>", " ")
}

/// Parse the price string as a non-negative decimal
fn parse_price(raw: &str) -> Result<f64, NormalizeError> {
    let price: f64 = raw
        .trim()
        .parse()
        .map_err(|_| NormalizeError::BadPrice(raw.to_string()))?;

    if !price.is_finite() || price < 0.0 {
        return Err(NormalizeError::BadPrice(raw.to_string()));
    }

    Ok(price)
}

/// Collapse the raw image value into a single string column
fn serialize_image(image: &Value) -> String {
    match image {
        Value::Null => String::new(),
        Value::String(uri) => uri.clone(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}
