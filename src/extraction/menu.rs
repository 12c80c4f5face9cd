//! Menu extraction: raw page → brand-containing dishes.
//!
//! Structured data wins: embedded page-state JSON, then JSON-LD, then CSS
//! selectors over the rendered HTML. Only dishes whose name or description
//! carries the brand token survive; each one maps to exactly one catalog
//! product and gets a five-factor confidence score.

use lazy_static::lazy_static;
use regex::Regex;
use scraper::{Html, Selector};
use serde_json::Value;
use tracing::debug;

use crate::models::{DiscoveredDish, DishConfidence, Price, ProductTag};

use super::adapters::{currency_for_country, PlatformAdapter};
use super::fetcher::PageData;

lazy_static! {
    /// The brand token as a whole word. "plant-based" or "implanted" must
    /// never satisfy the filter.
    static ref BRAND_TOKEN: Regex = Regex::new(r"(?i)\bplanted\b").expect("brand token");

    /// Explicit brand-qualified product phrases, the strongest mapping
    /// signal: "planted.kebab", "planted kebab", "planted-kebab".
    static ref BRAND_QUALIFIED: Regex =
        Regex::new(r"(?i)\bplanted[\s._-]+(chicken|kebab|pulled|schnitzel|bratwurst|steak|duck)\b")
            .expect("brand qualified");

    /// Embedded page-state assignments: `window.__STATE__ = {...};`
    static ref STATE_ASSIGNMENT: Regex =
        Regex::new(r#"(?s)=\s*(\{.*?\})\s*;?\s*</script>"#).expect("state assignment");

    static ref PRICE: Regex =
        Regex::new(r"(?i)(CHF|EUR|GBP|€|£|Fr\.?)?\s*(\d{1,3}(?:[.,]\d{2}))\s*(CHF|EUR|GBP|€|£)?")
            .expect("price");
}

/// Language-tagged keyword dictionaries, tried after explicit phrases.
/// Order matters: the first product whose dictionary hits wins.
const KEYWORDS: &[(ProductTag, &[&str])] = &[
    (ProductTag::PlantedKebab, &["kebab", "kebap", "döner", "doner", "dürüm"]),
    (ProductTag::PlantedSchnitzel, &["schnitzel", "escalope", "cotoletta"]),
    (ProductTag::PlantedPulled, &["pulled", "effiloché"]),
    (ProductTag::PlantedBratwurst, &["bratwurst", "wurst", "sausage", "saucisse"]),
    (ProductTag::PlantedSteak, &["steak", "entrecôte"]),
    (ProductTag::PlantedDuck, &["duck", "ente", "canard"]),
    (
        ProductTag::PlantedChicken,
        &["chicken", "poulet", "hähnchen", "hühnchen", "güggeli", "pollo"],
    ),
];

pub fn contains_brand_token(text: &str) -> bool {
    BRAND_TOKEN.is_match(text)
}

/// A menu item before brand filtering, whatever the extraction path.
#[derive(Debug, Clone, Default)]
pub struct ExtractedItem {
    pub name: String,
    pub description: Option<String>,
    pub category: Option<String>,
    pub price_text: Option<String>,
    /// True when the item came out of structured data rather than HTML.
    pub structured: bool,
}

/// Structured extraction first, HTML fallback second.
pub fn extract_items(page: &PageData, adapter: &PlatformAdapter) -> Vec<ExtractedItem> {
    let structured = extract_structured(&page.html, adapter);
    if !structured.is_empty() {
        debug!(count = structured.len(), url = %page.url, "structured extraction");
        return structured;
    }
    let html_items = extract_html(&page.html, adapter);
    debug!(count = html_items.len(), url = %page.url, "html extraction");
    html_items
}

fn extract_structured(html: &str, adapter: &PlatformAdapter) -> Vec<ExtractedItem> {
    let mut items = Vec::new();

    // Embedded page-state assignments named by the adapter.
    for marker in adapter.state_markers {
        if let Some(position) = html.find(marker) {
            let tail = &html[position..];
            if let Some(captures) = STATE_ASSIGNMENT.captures(tail) {
                if let Ok(value) = serde_json::from_str::<Value>(&captures[1]) {
                    walk_json(&value, &mut items);
                }
            }
        }
    }
    if !items.is_empty() {
        return items;
    }

    // JSON-LD blocks (Restaurant / Menu schemas).
    let document = Html::parse_document(html);
    let Ok(selector) = Selector::parse(r#"script[type="application/ld+json"]"#) else {
        return items;
    };
    for script in document.select(&selector) {
        let text: String = script.text().collect();
        if let Ok(value) = serde_json::from_str::<Value>(&text) {
            walk_json(&value, &mut items);
        }
    }
    items
}

/// Recursively collect objects that look like menu items: a string name
/// plus a price-ish sibling.
fn walk_json(value: &Value, items: &mut Vec<ExtractedItem>) {
    match value {
        Value::Object(map) => {
            let name = map.get("name").and_then(|v| v.as_str());
            let price = map
                .get("price")
                .or_else(|| map.get("basePrice"))
                .or_else(|| map.get("price_text"))
                .or_else(|| {
                    map.get("offers")
                        .and_then(|o| o.get("price"))
                });
            if let (Some(name), Some(price)) = (name, price) {
                let price_text = match price {
                    Value::Number(n) => Some(n.to_string()),
                    Value::String(s) => Some(s.clone()),
                    _ => None,
                };
                items.push(ExtractedItem {
                    name: name.to_string(),
                    description: map
                        .get("description")
                        .and_then(|v| v.as_str())
                        .map(|s| s.to_string()),
                    category: map
                        .get("category")
                        .and_then(|v| v.as_str())
                        .map(|s| s.to_string()),
                    price_text,
                    structured: true,
                });
            }
            for child in map.values() {
                walk_json(child, items);
            }
        }
        Value::Array(array) => {
            for child in array {
                walk_json(child, items);
            }
        }
        _ => {}
    }
}

fn extract_html(html: &str, adapter: &PlatformAdapter) -> Vec<ExtractedItem> {
    let document = Html::parse_document(html);
    let Ok(item_selector) = Selector::parse(adapter.item_selector) else {
        return Vec::new();
    };
    let name_selector = Selector::parse(adapter.name_selector).ok();
    let description_selector = Selector::parse(adapter.description_selector).ok();
    let price_selector = Selector::parse(adapter.price_selector).ok();

    let text_of = |element: scraper::ElementRef<'_>, selector: &Option<Selector>| -> Option<String> {
        let selector = selector.as_ref()?;
        let found = element.select(selector).next()?;
        let text: String = found.text().collect::<Vec<_>>().join(" ");
        let trimmed = text.trim().to_string();
        (!trimmed.is_empty()).then_some(trimmed)
    };

    document
        .select(&item_selector)
        .filter_map(|element| {
            let name = text_of(element, &name_selector)?;
            Some(ExtractedItem {
                name,
                description: text_of(element, &description_selector),
                category: None,
                price_text: text_of(element, &price_selector),
                structured: false,
            })
        })
        .collect()
}

/// Map an item to exactly one catalog product. Returns the tag and the
/// match certainty that feeds the confidence breakdown.
pub fn map_product(name: &str, description: Option<&str>) -> (ProductTag, f64) {
    let combined = match description {
        Some(desc) => format!("{name} {desc}"),
        None => name.to_string(),
    };

    if let Some(captures) = BRAND_QUALIFIED.captures(&combined) {
        let tag = match captures[1].to_ascii_lowercase().as_str() {
            "kebab" => ProductTag::PlantedKebab,
            "pulled" => ProductTag::PlantedPulled,
            "schnitzel" => ProductTag::PlantedSchnitzel,
            "bratwurst" => ProductTag::PlantedBratwurst,
            "steak" => ProductTag::PlantedSteak,
            "duck" => ProductTag::PlantedDuck,
            _ => ProductTag::PlantedChicken,
        };
        return (tag, 95.0);
    }

    let lower = combined.to_lowercase();
    for (tag, words) in KEYWORDS {
        if words.iter().any(|w| lower.contains(w)) {
            return (*tag, 80.0);
        }
    }

    // Conservative default with reduced certainty.
    (ProductTag::PlantedChicken, 45.0)
}

/// Parse "CHF 18.50", "18,50 €", "€8.90", "Fr. 12.00".
pub fn parse_price(text: &str) -> Option<(f64, Option<String>)> {
    let captures = PRICE.captures(text)?;
    let amount: f64 = captures[2].replace(',', ".").parse().ok()?;
    let currency = captures
        .get(1)
        .or(captures.get(3))
        .map(|m| normalize_currency(m.as_str()));
    Some((amount, currency))
}

fn normalize_currency(symbol: &str) -> String {
    match symbol {
        "€" => "EUR".to_string(),
        "£" => "GBP".to_string(),
        s if s.eq_ignore_ascii_case("fr") || s.eq_ignore_ascii_case("fr.") => "CHF".to_string(),
        s => s.to_ascii_uppercase(),
    }
}

/// Filter, map, and score one page's items into staged dishes.
pub fn build_dishes(
    items: Vec<ExtractedItem>,
    venue_id: &str,
    country: &str,
) -> Vec<DiscoveredDish> {
    let mut dishes = Vec::new();
    for item in items {
        let description = item.description.as_deref();
        let brand_in_name = contains_brand_token(&item.name);
        let brand_in_description = description.map(contains_brand_token).unwrap_or(false);
        if !brand_in_name && !brand_in_description {
            continue;
        }

        let (product_tag, product_match) = map_product(&item.name, description);
        let explicit = BRAND_QUALIFIED.is_match(&item.name);
        let price = item.price_text.as_deref().and_then(parse_price);

        let breakdown = DishConfidence {
            name_clarity: if explicit {
                95.0
            } else if brand_in_name {
                85.0
            } else {
                55.0
            },
            description_evidence: if brand_in_description {
                90.0
            } else if explicit {
                70.0
            } else if description.is_some() {
                50.0
            } else {
                30.0
            },
            price_plausibility: match price {
                Some((amount, _)) if (4.0..=60.0).contains(&amount) => 90.0,
                Some(_) => 50.0,
                None => 30.0,
            },
            source_reliability: if item.structured { 90.0 } else { 70.0 },
            product_match,
        };

        let mut dish = DiscoveredDish::new(venue_id.to_string(), item.name, product_tag)
            .with_confidence(breakdown);
        dish.description = item.description;
        dish.category = item.category;
        if let Some((amount, currency)) = price {
            dish.prices.insert(
                country.to_string(),
                Price {
                    amount,
                    currency: currency
                        .unwrap_or_else(|| currency_for_country(country).to_string()),
                },
            );
        }
        dishes.push(dish);
    }
    dishes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extraction::adapters::adapter_for;
    use crate::models::Platform;

    #[test]
    fn brand_filter_rejects_generics() {
        assert!(contains_brand_token("Caesar with planted.chicken"));
        assert!(contains_brand_token("PLANTED kebab wrap"));
        assert!(!contains_brand_token("plant-based burger"));
        assert!(!contains_brand_token("vegan schnitzel"));
        assert!(!contains_brand_token("implanted flavor"));
    }

    #[test]
    fn product_mapping_precedence() {
        // Explicit phrase beats keywords.
        let (tag, certainty) = map_product("Bowl with planted.kebab and chicken rice", None);
        assert_eq!(tag, ProductTag::PlantedKebab);
        assert_eq!(certainty, 95.0);

        // Keyword dictionary, language-tagged.
        let (tag, certainty) = map_product("Planted Döner Teller", None);
        assert_eq!(tag, ProductTag::PlantedKebab);
        assert_eq!(certainty, 80.0);

        let (tag, _) = map_product("Planted güggeli burger", None);
        assert_eq!(tag, ProductTag::PlantedChicken);

        // Conservative default.
        let (tag, certainty) = map_product("Planted surprise bowl", None);
        assert_eq!(tag, ProductTag::PlantedChicken);
        assert!(certainty < 50.0);
    }

    #[test]
    fn price_parsing() {
        assert_eq!(parse_price("CHF 18.50"), Some((18.5, Some("CHF".into()))));
        assert_eq!(parse_price("18,50 €"), Some((18.5, Some("EUR".into()))));
        assert_eq!(parse_price("£9.90"), Some((9.9, Some("GBP".into()))));
        assert_eq!(parse_price("Fr. 12.00"), Some((12.0, Some("CHF".into()))));
        assert_eq!(parse_price("ab 7,20"), Some((7.2, None)));
        assert_eq!(parse_price("free"), None);
    }

    #[test]
    fn scenario_single_dish_page() {
        let adapter = adapter_for(Platform::Wolt);
        let html = r#"<html><body>
            <div data-test-id="MenuSection">
              <div data-test-id="horizontal-item-card">
                <div data-test-id="horizontal-item-card-header">Caesar with planted.chicken</div>
                <div data-test-id="horizontal-item-card-price">CHF 18.50</div>
              </div>
              <div data-test-id="horizontal-item-card">
                <div data-test-id="horizontal-item-card-header">Beef Burger</div>
                <div data-test-id="horizontal-item-card-price">CHF 21.00</div>
              </div>
            </div>
        </body></html>"#;
        let page = PageData {
            url: "https://wolt.com/ch/zur/test".to_string(),
            html: html.to_string(),
        };
        let items = extract_items(&page, adapter);
        assert_eq!(items.len(), 2);

        let dishes = build_dishes(items, "venue-1", "CH");
        assert_eq!(dishes.len(), 1);
        let dish = &dishes[0];
        assert_eq!(dish.product_tag, ProductTag::PlantedChicken);
        assert!(dish.confidence_score >= 80.0, "got {}", dish.confidence_score);
        assert_eq!(dish.prices["CH"].amount, 18.5);
        assert_eq!(dish.prices["CH"].currency, "CHF");
    }

    #[test]
    fn structured_state_wins_over_html() {
        let adapter = adapter_for(Platform::Wolt);
        let html = r#"<html><head>
            <script>window.__WOLT_STATE__ = {"menu": {"items": [
                {"name": "Planted Kebab Dürüm", "price": "16.90", "description": "with planted.kebab"}
            ]}};</script>
        </head><body></body></html>"#;
        let page = PageData {
            url: "https://wolt.com/ch/zur/test".to_string(),
            html: html.to_string(),
        };
        let items = extract_items(&page, adapter);
        assert_eq!(items.len(), 1);
        assert!(items[0].structured);

        let dishes = build_dishes(items, "venue-1", "CH");
        assert_eq!(dishes[0].product_tag, ProductTag::PlantedKebab);
        assert_eq!(dishes[0].confidence.source_reliability, 90.0);
    }

    #[test]
    fn json_ld_fallback() {
        let adapter = adapter_for(Platform::EatCh);
        let html = r#"<html><head>
            <script type="application/ld+json">
            {"@type": "Restaurant", "hasMenu": {"hasMenuSection": [{"hasMenuItem": [
                {"@type": "MenuItem", "name": "Planted schnitzel plate",
                 "offers": {"price": "24.50", "priceCurrency": "CHF"}}
            ]}]}}
            </script>
        </head><body></body></html>"#;
        let page = PageData {
            url: "https://eat.ch/restaurant/test".to_string(),
            html: html.to_string(),
        };
        let items = extract_items(&page, adapter);
        assert_eq!(items.len(), 1);
        let dishes = build_dishes(items, "venue-1", "CH");
        assert_eq!(dishes[0].product_tag, ProductTag::PlantedSchnitzel);
    }

    #[test]
    fn vague_item_scores_low_but_is_kept() {
        let items = vec![ExtractedItem {
            name: "planted thing".to_string(),
            description: None,
            category: None,
            price_text: None,
            structured: false,
        }];
        let dishes = build_dishes(items, "venue-1", "DE");
        assert_eq!(dishes.len(), 1);
        // No price, no description, default product mapping: well below a
        // verifiable dish, but still stored.
        assert!(dishes[0].confidence_score < 60.0);
        assert_eq!(dishes[0].product_tag, ProductTag::PlantedChicken);
    }

    #[test]
    fn review_flag_boundary() {
        let weak = DishConfidence {
            name_clarity: 35.0,
            description_evidence: 30.0,
            price_plausibility: 30.0,
            source_reliability: 50.0,
            product_match: 45.0,
        };
        let dish = DiscoveredDish::new("v".into(), "planted thing".into(), ProductTag::PlantedChicken)
            .with_confidence(weak);
        assert!(dish.confidence_score < 40.0);
        assert!(dish.needs_review);
    }
}
