//! Platform adapters.
//!
//! One adapter per delivery platform: how to recognise a venue page, what
//! to wait for before reading the DOM, which selectors yield menu items,
//! and how to derive the market country from the URL. A sealed table plus
//! a lookup keyed by platform tag, not an open-ended registry.

use crate::models::Platform;

/// Static description of one platform's page structure.
pub struct PlatformAdapter {
    pub platform: Platform,
    /// Substring a venue-page URL must contain.
    pub venue_path_hint: &'static str,
    /// CSS selector whose presence means the menu has rendered.
    pub wait_selector: &'static str,
    /// CSS selector for one menu item container.
    pub item_selector: &'static str,
    pub name_selector: &'static str,
    pub description_selector: &'static str,
    pub price_selector: &'static str,
    /// Embedded page-state JSON markers, tried before HTML extraction.
    pub state_markers: &'static [&'static str],
    /// Whether lazy loading needs a scroll to the bottom first.
    pub scroll_to_bottom: bool,
}

static ADAPTERS: [PlatformAdapter; 7] = [
    PlatformAdapter {
        platform: Platform::UberEats,
        venue_path_hint: "/store/",
        wait_selector: "main [data-testid='store-menu']",
        item_selector: "li[data-testid^='store-item']",
        name_selector: "span[data-testid='rich-text']",
        description_selector: "span[data-testid='rich-text-description']",
        price_selector: "span[data-testid='price']",
        state_markers: &["__REACT_QUERY_STATE__", "window.__REDUX_STATE__"],
        scroll_to_bottom: true,
    },
    PlatformAdapter {
        platform: Platform::Wolt,
        venue_path_hint: "/restaurant/",
        wait_selector: "[data-test-id='MenuSection']",
        item_selector: "[data-test-id='horizontal-item-card']",
        name_selector: "[data-test-id='horizontal-item-card-header']",
        description_selector: "[data-test-id='horizontal-item-card-description']",
        price_selector: "[data-test-id='horizontal-item-card-price']",
        state_markers: &["window.__WOLT_STATE__", "__NEXT_DATA__"],
        scroll_to_bottom: true,
    },
    PlatformAdapter {
        platform: Platform::Lieferando,
        venue_path_hint: "/speisekarte/",
        wait_selector: "[data-qa='menu']",
        item_selector: "[data-qa='menu-product']",
        name_selector: "[data-qa='menu-product-name']",
        description_selector: "[data-qa='menu-product-description']",
        price_selector: "[data-qa='menu-product-price']",
        state_markers: &["window.__INITIAL_STATE__"],
        scroll_to_bottom: false,
    },
    PlatformAdapter {
        platform: Platform::JustEat,
        venue_path_hint: "/menu",
        wait_selector: "[data-test-id='menu-category']",
        item_selector: "[data-test-id='menu-item']",
        name_selector: "[data-test-id='menu-item-name']",
        description_selector: "[data-test-id='menu-item-description']",
        price_selector: "[data-test-id='menu-item-price']",
        state_markers: &["window.__INITIAL_STATE__"],
        scroll_to_bottom: false,
    },
    PlatformAdapter {
        platform: Platform::Deliveroo,
        venue_path_hint: "/menu/",
        wait_selector: "[class*='MenuPage']",
        item_selector: "[class*='MenuItemCard']",
        name_selector: "h3",
        description_selector: "p[class*='description']",
        price_selector: "[class*='Price']",
        state_markers: &["window.__PRELOADED_STATE__", "__NEXT_DATA__"],
        scroll_to_bottom: true,
    },
    PlatformAdapter {
        platform: Platform::Smood,
        venue_path_hint: "/restaurant/",
        wait_selector: ".menu-list",
        item_selector: ".menu-item",
        name_selector: ".menu-item-title",
        description_selector: ".menu-item-description",
        price_selector: ".menu-item-price",
        state_markers: &["window.__APP_STATE__"],
        scroll_to_bottom: false,
    },
    PlatformAdapter {
        platform: Platform::EatCh,
        venue_path_hint: "/restaurant/",
        wait_selector: "[data-qa='item-list']",
        item_selector: "[data-qa='item']",
        name_selector: "[data-qa='item-title']",
        description_selector: "[data-qa='item-description']",
        price_selector: "[data-qa='item-price']",
        state_markers: &["window.__INITIAL_STATE__"],
        scroll_to_bottom: false,
    },
];

pub fn adapter_for(platform: Platform) -> &'static PlatformAdapter {
    ADAPTERS
        .iter()
        .find(|a| a.platform == platform)
        .expect("adapter table covers every platform")
}

/// Derive the market country from a venue URL. Platforms encode it either
/// as a path segment (`/ch/`, `/de/`) or via the top-level domain.
pub fn country_from_url(platform: Platform, url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    let host = parsed.host_str()?.to_ascii_lowercase();

    // ccTLD platforms first.
    match platform {
        Platform::EatCh | Platform::Smood => return Some("CH".to_string()),
        Platform::Lieferando => {
            if host.ends_with(".at") {
                return Some("AT".to_string());
            }
            return Some("DE".to_string());
        }
        _ => {}
    }

    let segments: Vec<&str> = parsed
        .path_segments()
        .map(|s| s.filter(|p| !p.is_empty()).collect())
        .unwrap_or_default();
    for segment in segments.iter().take(2) {
        let upper = segment.to_ascii_uppercase();
        if matches!(upper.as_str(), "CH" | "DE" | "AT" | "GB" | "FR" | "IT" | "NL" | "BE") {
            return Some(upper);
        }
        // Wolt-style alpha-3 market segments.
        match upper.as_str() {
            "CHE" => return Some("CH".to_string()),
            "DEU" => return Some("DE".to_string()),
            "AUT" => return Some("AT".to_string()),
            "GBR" => return Some("GB".to_string()),
            _ => {}
        }
    }

    match host.rsplit('.').next() {
        Some("ch") => Some("CH".to_string()),
        Some("de") => Some("DE".to_string()),
        Some("at") => Some("AT".to_string()),
        Some("fr") => Some("FR".to_string()),
        Some("uk") => Some("GB".to_string()),
        _ => None,
    }
}

/// Default currency for a market country.
pub fn currency_for_country(country: &str) -> &'static str {
    match country {
        "CH" => "CHF",
        "GB" => "GBP",
        _ => "EUR",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_platform_has_an_adapter() {
        for platform in Platform::ALL {
            let adapter = adapter_for(platform);
            assert_eq!(adapter.platform, platform);
            assert!(!adapter.item_selector.is_empty());
        }
    }

    #[test]
    fn country_derivation() {
        assert_eq!(
            country_from_url(Platform::Wolt, "https://wolt.com/de/deu/berlin/restaurant/x"),
            Some("DE".to_string())
        );
        assert_eq!(
            country_from_url(Platform::UberEats, "https://www.ubereats.com/ch/store/y"),
            Some("CH".to_string())
        );
        assert_eq!(
            country_from_url(Platform::EatCh, "https://eat.ch/restaurant/z"),
            Some("CH".to_string())
        );
        assert_eq!(
            country_from_url(Platform::Lieferando, "https://www.lieferando.at/speisekarte/w"),
            Some("AT".to_string())
        );
    }

    #[test]
    fn currency_defaults() {
        assert_eq!(currency_for_country("CH"), "CHF");
        assert_eq!(currency_for_country("DE"), "EUR");
        assert_eq!(currency_for_country("GB"), "GBP");
    }
}
