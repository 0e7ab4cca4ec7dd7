//! Property-based tests for core domain types.
//!
//! These tests use proptest to verify invariants hold across
//! randomly generated inputs.

use proptest::prelude::*;

use strata::core::types::{ImagePath, ImageRef, LineageName, Oid};

/// Strategy for generating characters that are legal in lineage names.
fn lineage_char() -> impl Strategy<Value = char> {
    prop_oneof![
        prop::char::range('a', 'z'),
        prop::char::range('A', 'Z'),
        prop::char::range('0', '9'),
        Just('-'),
        Just('_'),
        Just('.'),
        Just('/'),
    ]
}

/// Strategy for generating valid lineage names.
fn valid_lineage() -> impl Strategy<Value = String> {
    prop::collection::vec(lineage_char(), 1..40).prop_filter_map("must be a valid lineage", |chars| {
        let name: String = chars.into_iter().collect();
        let bad = name.starts_with('-')
            || name.starts_with('/')
            || name.ends_with('/')
            || name.ends_with('.')
            || name.contains("..")
            || name.contains("//")
            || name
                .split('/')
                .any(|c| c.starts_with('.') || c.ends_with(".lock"));
        (!bad).then_some(name)
    })
}

/// Strategy for image tags.
fn tag() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9_][a-zA-Z0-9_.-]{0,20}"
}

/// Strategy for 40-character hex object ids in mixed case.
fn hex_oid() -> impl Strategy<Value = String> {
    "[0-9a-fA-F]{40}"
}

proptest! {
    #[test]
    fn valid_lineages_are_accepted(name in valid_lineage()) {
        let lineage = LineageName::new(name.clone()).unwrap();
        prop_assert_eq!(lineage.as_str(), name.as_str());
        prop_assert_eq!(lineage.to_string(), name);
    }

    #[test]
    fn accepted_lineages_are_valid_refs(name in "[ -~]{1,30}") {
        if let Ok(lineage) = LineageName::new(name) {
            prop_assert!(git2::Reference::is_valid_name(&lineage.ref_name()));
        }
    }

    #[test]
    fn lineages_with_colons_are_rejected(a in valid_lineage(), b in valid_lineage()) {
        let joined = format!("{a}:{b}");
        prop_assert!(LineageName::new(joined).is_err());
    }

    #[test]
    fn tag_splits_off_last_component(name in valid_lineage(), tag in tag()) {
        let image = ImageRef::parse(&format!("{name}:{tag}"));
        prop_assert_eq!(image.name(), name.as_str());
        prop_assert_eq!(image.tag(), tag.as_str());
    }

    #[test]
    fn untagged_images_are_latest(name in valid_lineage()) {
        let image = ImageRef::parse(&name);
        prop_assert_eq!(image.name(), name.as_str());
        prop_assert_eq!(image.tag(), "latest");
        prop_assert_eq!(image.to_string(), format!("{name}:latest"));
    }

    #[test]
    fn registry_port_stays_in_name(port in 1u16.., name in valid_lineage(), tag in tag()) {
        let image = ImageRef::parse(&format!("localhost:{port}/{name}:{tag}"));
        prop_assert_eq!(image.name(), format!("localhost:{port}/{name}"));
        prop_assert_eq!(image.tag(), tag.as_str());
    }

    #[test]
    fn image_display_reparses(name in valid_lineage(), tag in tag()) {
        let image = ImageRef::parse(&format!("{name}:{tag}"));
        prop_assert_eq!(ImageRef::parse(&image.to_string()), image);
    }

    #[test]
    fn lineage_discards_tag(name in valid_lineage(), tag in tag()) {
        let lineage = LineageName::from_image(&format!("{name}:{tag}")).unwrap();
        prop_assert_eq!(lineage.as_str(), name.as_str());
    }

    #[test]
    fn oids_normalize_to_lowercase(hex in hex_oid()) {
        let oid = Oid::new(hex.clone()).unwrap();
        prop_assert_eq!(oid.as_str(), hex.to_ascii_lowercase());
        prop_assert_eq!(oid.short(7).len(), 7);
    }

    #[test]
    fn image_paths_keep_everything_after_scheme(
        scheme in prop_oneof![Just("graph"), Just("file"), Just("docker"), Just("index")],
        path in "[a-zA-Z0-9_./:-]{0,30}",
    ) {
        let parsed: ImagePath = format!("{scheme}:{path}").parse().unwrap();
        prop_assert_eq!(parsed.path.as_str(), path.as_str());
        prop_assert_eq!(parsed.to_string(), format!("{scheme}:{path}"));
    }

    #[test]
    fn unknown_schemes_are_rejected(scheme in "[a-z]{1,8}", path in "[a-z/]{0,10}") {
        prop_assume!(!matches!(scheme.as_str(), "graph" | "file" | "docker" | "index"));
        let input = format!("{scheme}:{path}");
        prop_assert!(input.parse::<ImagePath>().is_err());
    }
}
