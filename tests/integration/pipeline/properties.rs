//! Identifier properties the rebuild and validators rely on.

use keyshift::ident::{ExternalId, PrimaryId, SourceTime};
use proptest::prelude::*;

/// Up to the year 5000, in milliseconds.
const MAX_MS: u64 = 95_617_584_000_000;

proptest! {
    #[test]
    fn external_id_is_a_pure_function_of_the_objid(ms in 0u64..MAX_MS, prefix in "[a-z]{2}") {
        let objid = PrimaryId::from_source_time(SourceTime::from_millis(ms).unwrap());
        let first = ExternalId::derive(&objid, &prefix);
        let reparsed: PrimaryId = objid.to_string().parse().unwrap();
        prop_assert_eq!(&first, &ExternalId::derive(&reparsed, &prefix));
        prop_assert!(first.as_str().starts_with(prefix.as_str()));
    }

    #[test]
    fn objids_sort_by_creation_time(a in 0u64..MAX_MS, b in 0u64..MAX_MS) {
        prop_assume!(a != b);
        let id_a = PrimaryId::from_source_time(SourceTime::from_millis(a).unwrap());
        let id_b = PrimaryId::from_source_time(SourceTime::from_millis(b).unwrap());
        prop_assert_eq!(a < b, id_a < id_b);
        prop_assert_eq!(a < b, id_a.to_string() < id_b.to_string());
        prop_assert_eq!(id_a.timestamp_ms(), a);
    }

    #[test]
    fn fractional_seconds_keep_millisecond_order(secs in 0u64..4_000_000_000u64, frac in 0u64..1000) {
        let raw = format!("{secs}.{frac:03}");
        let parsed = SourceTime::parse(&raw).unwrap();
        prop_assert_eq!(parsed.millis(), secs * 1000 + frac);
    }
}
