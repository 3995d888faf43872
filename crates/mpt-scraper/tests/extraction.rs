use std::path::PathBuf;

use mpt_core::DESCRIPTION_MAX_CHARS;
use mpt_scraper::{extract_from_html, LookupStrategy, SelectorConfig, SelectorSet, DEFAULT_STRATEGIES};

fn fixture(name: &str) -> String {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name);
    std::fs::read_to_string(&path).unwrap_or_else(|e| panic!("reading {}: {e}", path.display()))
}

fn selectors() -> SelectorSet {
    SelectorSet::compile(SelectorConfig::default()).expect("default selectors compile")
}

#[test]
fn menu_fixture_extracts_priced_products_in_document_order() {
    let extraction = extract_from_html(&fixture("menu.html"), &selectors(), DEFAULT_STRATEGIES, 0);
    let names = extraction
        .items
        .iter()
        .map(|i| i.name.as_str())
        .collect::<Vec<_>>();
    assert_eq!(
        names,
        vec!["Açaí 300ml", "Açaí 500ml", "Copo da Casa", "Mix Especial"]
    );

    let acai = &extraction.items[0];
    assert_eq!(acai.price, 12.50);
    assert_eq!(acai.extracted_current_price, 12.50);
    assert_eq!(acai.extracted_prev_price, 15.00);
    assert_eq!(acai.extracted_base_price, 0.0);
    assert_eq!(acai.description, "Açaí cremoso com granola e banana");

    let big = &extraction.items[1];
    assert_eq!(big.price, 18.90);
    assert_eq!(big.extracted_current_price, 0.0);
    assert_eq!(big.extracted_base_price, 18.90);

    let copo = &extraction.items[2];
    assert_eq!(copo.price, 7.0);
    assert_eq!(copo.description.chars().count(), DESCRIPTION_MAX_CHARS);

    let mix = &extraction.items[3];
    assert_eq!(mix.price, 21.0);
    assert_eq!(mix.description, "Banana e morango");
}

#[test]
fn menu_fixture_report_counts_every_skip_reason() {
    let report = extract_from_html(&fixture("menu.html"), &selectors(), DEFAULT_STRATEGIES, 0).report;
    assert_eq!(report.markers_found, 8);
    assert_eq!(report.markers_walked, 8);
    assert_eq!(report.empty_names, 1);
    assert_eq!(report.duplicates, 1);
    assert_eq!(report.rejected, 2);
    assert_eq!(report.extracted, 4);
    assert_eq!(report.ancestor_hits, 4);
    assert_eq!(report.forward_hits, 1);
    assert_eq!(report.unresolved, 1);
}

#[test]
fn max_items_caps_the_markers_walked() {
    let extraction = extract_from_html(&fixture("menu.html"), &selectors(), DEFAULT_STRATEGIES, 2);
    assert_eq!(extraction.report.markers_walked, 2);
    assert_eq!(extraction.items.len(), 2);
}

#[test]
fn without_forward_scan_flat_layouts_yield_nothing() {
    let strategies = [LookupStrategy::AncestorWalk { max_depth: 6 }];
    let extraction = extract_from_html(&fixture("menu.html"), &selectors(), &strategies, 0);
    assert!(extraction.items.iter().all(|i| i.name != "Mix Especial"));
    assert_eq!(extraction.report.forward_hits, 0);
    assert_eq!(extraction.report.unresolved, 2);
}

#[test]
fn page_without_markers_extracts_nothing() {
    let extraction = extract_from_html(
        "<html><body><p>Loja fechada</p></body></html>",
        &selectors(),
        DEFAULT_STRATEGIES,
        0,
    );
    assert!(extraction.items.is_empty());
    assert_eq!(extraction.report.markers_found, 0);
}
