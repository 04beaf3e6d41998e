use proptest::prelude::*;
use regex::Regex;
use varve::{canonical_name, to_normal_form, Error, SeriesMatcher, StringPoolOffset};

#[test]
fn canonical_form_of_messy_input() {
    let out = canonical_name(" cpu  region=europe   host=127.0.0.1 ").unwrap();
    assert_eq!(out, "cpu host=127.0.0.1 region=europe");
}

#[test]
fn canonical_form_reports_key_string_range() {
    let input = b" cpu  region=europe   host=127.0.0.1 ";
    let mut out = [0u8; 64];
    let (written, keys) = to_normal_form(input, &mut out).unwrap();
    assert_eq!(&out[..written], b"cpu host=127.0.0.1 region=europe");
    assert_eq!(&out[keys], b"host=127.0.0.1 region=europe");
}

#[test]
fn malformed_names_are_bad_data() {
    for name in [
        "cpu region host=127.0.0.1 ",
        "cpu region=europe host",
        "cpu host=%bad%",
        "cpu =x",
        "",
        "   ",
    ] {
        assert!(
            matches!(canonical_name(name), Err(Error::BadData(_))),
            "`{name}` must be rejected"
        );
    }
}

#[test]
fn matcher_ids_are_strictly_increasing_and_round_trip() {
    let matcher = SeriesMatcher::new(1);
    let names = ["cpu host=a", "cpu host=b", "mem host=a", "disk host=c"];
    let mut last = 0;
    for name in names {
        let id = matcher.add(name).unwrap();
        assert!(id > last);
        last = id;

        assert_eq!(matcher.match_name(name), id);
        let round_trip = matcher.id2str(id).unwrap();
        assert_eq!(&round_trip[..], name.as_bytes());
    }
    assert_eq!(matcher.get_all_ids().len(), names.len());
}

#[test]
fn matcher_scan_finds_new_series_from_saved_offset() {
    let matcher = SeriesMatcher::new(1);
    matcher.add("cpu host=a").unwrap();

    let re = Regex::new(r"^cpu(?:\s[\w\.\-]+=[\w\.\-]+)*$").unwrap();
    let mut offset = StringPoolOffset::default();
    let first = matcher.pool().regex_match(&re, &mut offset);
    assert_eq!(first.len(), 1);

    // Another query session ingests more series; the reader picks up only
    // the additions when rescanning from its previous offset.
    matcher.add("mem host=a").unwrap();
    matcher.add("cpu host=b").unwrap();
    let delta = matcher.pool().regex_match(&re, &mut offset);
    assert_eq!(delta.len(), 1);
    assert_eq!(&delta[0][..], b"cpu host=b");
}

proptest! {
    #[test]
    fn canonicalization_is_idempotent(
        metric in "[a-z]{1,6}",
        tags in prop::collection::btree_map("[a-z]{1,4}", "[a-z0-9\\.]{1,6}", 0..6),
    ) {
        let mut name = format!("  {metric}");
        for (key, value) in &tags {
            name.push_str("   ");
            name.push_str(key);
            name.push('=');
            name.push_str(value);
        }
        let once = canonical_name(&name).unwrap();
        let twice = canonical_name(&once).unwrap();
        prop_assert_eq!(once, twice);
    }

    #[test]
    fn distinct_names_get_distinct_increasing_ids(
        names in prop::collection::btree_set("[a-z]{3,10}", 1..24),
    ) {
        let matcher = SeriesMatcher::new(1);
        let mut prev = 0;
        for name in &names {
            let id = matcher.add(name).unwrap();
            prop_assert!(id > prev, "ids must be strictly increasing");
            prev = id;
        }
        for name in &names {
            let id = matcher.match_name(name);
            let round_trip = matcher.id2str(id).unwrap();
            prop_assert_eq!(&round_trip[..], name.as_bytes());
        }
    }

    #[test]
    fn canonical_output_fits_the_input_buffer(
        raw in "[ ]{0,3}[a-z]{1,5}([ ]{1,3}[a-z]{1,3}=[0-9]{1,3}){0,4}[ ]{0,2}",
    ) {
        let mut out = vec![0u8; raw.len()];
        let result = to_normal_form(raw.as_bytes(), &mut out);
        prop_assert!(result.is_ok(), "well-formed input must canonicalize");
    }
}
