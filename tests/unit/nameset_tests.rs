use unionfs::fs::NameSet;

#[test]
fn first_sighting_is_new_and_repeats_are_duplicates() {
    let mut set = NameSet::with_estimate(4);
    assert!(!set.seen("passwd"));
    assert!(set.seen("passwd"));
    assert!(!set.seen("group"));
    assert_eq!(set.len(), 2);
    assert!(set.contains("group"));
    assert!(!set.contains("shadow"));
}

#[test]
fn small_estimates_round_up_to_minimum_capacity() {
    let set = NameSet::with_estimate(0);
    assert!(set.is_empty());
    assert_eq!(set.capacity(), 8);
}

#[test]
fn grows_past_estimate_without_losing_names() {
    let mut set = NameSet::with_estimate(1);
    let names: Vec<String> = (0..1000).map(|i| format!("entry-{i}")).collect();
    for name in &names {
        assert!(!set.seen(name), "{name} reported as duplicate on first insert");
    }
    assert_eq!(set.len(), names.len());
    assert!(set.capacity() >= 2 * names.len());
    for name in &names {
        assert!(set.seen(name), "{name} lost after growth");
    }
    assert_eq!(set.len(), names.len());
}

#[test]
fn names_differing_only_in_case_or_suffix_are_distinct() {
    let mut set = NameSet::with_estimate(8);
    for name in ["a", "A", "a.", "a ", "ab", ""] {
        assert!(!set.seen(name), "{name:?}");
    }
    assert_eq!(set.len(), 6);
}
