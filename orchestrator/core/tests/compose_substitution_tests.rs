// Copyright (c) 2026 berth contributors
// SPDX-License-Identifier: AGPL-3.0

use berth_core::domain::stack::StackId;
use berth_core::infrastructure::compose_parser::{ComposeParser, EnvironmentOverlay};
use proptest::prelude::*;

fn chain(depth: usize, terminal: &str) -> EnvironmentOverlay {
    let mut pairs: Vec<(String, String)> = (0..depth - 1)
        .map(|i| (format!("V{}", i), format!("${{V{}}}", i + 1)))
        .collect();
    pairs.push((format!("V{}", depth - 1), terminal.to_string()));
    EnvironmentOverlay::from_pairs(pairs).isolated()
}

fn stack() -> StackId {
    StackId::new("demo").unwrap()
}

#[test]
fn test_ten_levels_of_nesting_resolve_fully() {
    let doc = "services:\n  web:\n    image: \"${V0}\"\n";
    let parsed = ComposeParser::parse(&stack(), doc, &chain(10, "nginx:1.25")).unwrap();
    assert_eq!(parsed.services[0].image.as_deref(), Some("nginx:1.25"));
    assert!(parsed.unresolved.is_empty());
}

#[test]
fn test_unresolvable_reference_stays_literal() {
    let doc = "services:\n  web:\n    image: nginx\n    environment:\n      - URL=${MISSING_HOST}/api\n";
    let parsed = ComposeParser::parse(&stack(), doc, &EnvironmentOverlay::default().isolated()).unwrap();
    assert_eq!(parsed.services[0].environment, vec!["URL=${MISSING_HOST}/api"]);
    assert_eq!(parsed.unresolved, vec!["MISSING_HOST"]);
}

#[test]
fn test_self_reference_terminates() {
    let overlay = EnvironmentOverlay::from_pairs([("LOOP", "${LOOP}")]).isolated();
    let doc = "services:\n  web:\n    image: \"img:${LOOP}\"\n";
    let parsed = ComposeParser::parse(&stack(), doc, &overlay).unwrap();
    assert_eq!(parsed.services[0].image.as_deref(), Some("img:${LOOP}"));
}

#[test]
fn test_unresolved_container_name_is_overridden() {
    let doc = "services:\n  web:\n    image: nginx\n    container_name: \"${PREFIX}-web\"\n";
    let parsed = ComposeParser::parse(&stack(), doc, &EnvironmentOverlay::default().isolated()).unwrap();
    assert_eq!(parsed.services[0].container_name.as_deref(), Some("demo_web"));
}

proptest! {
    #[test]
    fn prop_chains_up_to_ten_resolve(depth in 1usize..=10, value in "[a-z][a-z0-9]{0,12}") {
        let doc = "services:\n  web:\n    image: \"${V0}\"\n";
        let parsed = ComposeParser::parse(&stack(), doc, &chain(depth, &value)).unwrap();
        prop_assert_eq!(parsed.services[0].image.as_deref(), Some(value.as_str()));
    }
}
